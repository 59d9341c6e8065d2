//! The six pipeline phases
//!
//! | Phase | Cursor | Backlog |
//! |-------|--------|---------|
//! | Preparation | offset | eligible documents snapshotted on first call |
//! | Extraction | offset | the same snapshot |
//! | Deduplication | processed group keys | candidate groups built on first call |
//! | Linking | offset | sorted group keys |
//! | Indexing | last entity id | every entity |
//! | Materialization | last document id | documents with a qualifying mention |

pub mod deduplication;
pub mod extraction;
pub mod indexing;
pub mod linking;
pub mod materialization;
pub mod preparation;

pub use deduplication::{DeduplicationPhase, GroupMapping};
pub use extraction::ExtractionPhase;
pub use indexing::{IndexingPhase, SNAPSHOT_KEY};
pub use linking::LinkingPhase;
pub use materialization::MaterializationPhase;
pub use preparation::PreparationPhase;

use std::sync::Arc;

use crate::error::{ErrorCategory, PipelineError, Result};
use crate::pipeline::PhaseHandler;

/// One handler per phase, in pipeline order
pub fn default_handlers() -> Vec<Arc<dyn PhaseHandler>> {
    vec![
        Arc::new(PreparationPhase),
        Arc::new(ExtractionPhase),
        Arc::new(DeduplicationPhase),
        Arc::new(LinkingPhase),
        Arc::new(IndexingPhase),
        Arc::new(MaterializationPhase),
    ]
}

/// `list[offset..offset + size]`, clamped to the list
pub(crate) fn window<T>(list: &[T], offset: usize, size: usize) -> &[T] {
    let start = offset.min(list.len());
    let end = offset.saturating_add(size).min(list.len());
    &list[start..end]
}

/// Persistence errors abort the batch; anything else is an item failure
pub(crate) fn escalate_persistence<T>(
    result: std::result::Result<T, entitygraph_storage::StorageError>,
) -> Result<std::result::Result<T, PipelineError>> {
    match result {
        Ok(value) => Ok(Ok(value)),
        Err(e) => {
            let err = PipelineError::from(e);
            if err.category() == ErrorCategory::Persistence {
                Err(err)
            } else {
                Ok(Err(err))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phase::Phase;
    use entitygraph_storage::StorageError;

    #[test]
    fn test_default_handlers_in_order() {
        let phases: Vec<Phase> = default_handlers().iter().map(|h| h.phase()).collect();
        assert_eq!(phases, Phase::ALL.to_vec());
    }

    #[test]
    fn test_window_clamps() {
        let list = [1, 2, 3, 4, 5];
        assert_eq!(window(&list, 0, 2), &[1, 2]);
        assert_eq!(window(&list, 4, 10), &[5]);
        assert!(window(&list, 9, 3).is_empty());
    }

    #[test]
    fn test_escalate_persistence() {
        let ok: std::result::Result<u8, StorageError> = Ok(1);
        assert_eq!(escalate_persistence(ok).unwrap().unwrap(), 1);

        let missing: std::result::Result<u8, StorageError> = Err(StorageError::entity_not_found(3));
        assert!(escalate_persistence(missing).unwrap().is_err());

        let db: std::result::Result<u8, StorageError> = Err(StorageError::database("locked"));
        assert!(escalate_persistence(db).is_err());
    }
}
