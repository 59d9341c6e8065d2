//! Checkpoints and pipeline state persistence
//!
//! Both live in the durable key-value store:
//!
//! - `entitygraph:pipeline:state`: the [`PipelineState`], written only through
//!   [`PipelineStateRepository::update`] (optimistic compare-and-swap)
//! - `entitygraph:job:{phase}:checkpoint`: per-phase resumption cursor
//! - `entitygraph:job:{phase}:{name}`: per-phase accumulators
//!
//! A fresh `start()` clears every `entitygraph:job:` key.

use chrono::{DateTime, Utc};
use entitygraph_storage::{DocumentId, KeyValueStore, KvExt};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::debug;

use crate::error::{PipelineError, Result};
use crate::phase::{Phase, PipelineState};

pub const PIPELINE_STATE_KEY: &str = "entitygraph:pipeline:state";
pub const JOB_KEY_PREFIX: &str = "entitygraph:job:";

const MAX_UPDATE_ATTEMPTS: u32 = 16;

/// Resumption cursor of one phase
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Cursor {
    /// Position in a snapshotted list
    Offset(u64),
    /// Highest id already handled
    LastId(i64),
    /// Keys already handled, for unordered backlogs
    ProcessedKeys(BTreeSet<String>),
}

impl Cursor {
    pub fn offset(&self) -> u64 {
        match self {
            Cursor::Offset(o) => *o,
            _ => 0,
        }
    }

    pub fn last_id(&self) -> i64 {
        match self {
            Cursor::LastId(id) => *id,
            _ => 0,
        }
    }

    pub fn processed_keys(&self) -> BTreeSet<String> {
        match self {
            Cursor::ProcessedKeys(keys) => keys.clone(),
            _ => BTreeSet::new(),
        }
    }
}

/// Saved cursor plus bookkeeping
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub phase: Phase,
    pub cursor: Cursor,
    pub batches: u64,
    pub saved_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn new(phase: Phase, cursor: Cursor, batches: u64) -> Self {
        Self {
            phase,
            cursor,
            batches,
            saved_at: Utc::now(),
        }
    }
}

/// Checkpoint manager over the durable key-value store
pub struct CheckpointManager {
    kv: Arc<dyn KeyValueStore>,
}

impl CheckpointManager {
    pub fn new(kv: Arc<dyn KeyValueStore>) -> Self {
        Self { kv }
    }

    fn checkpoint_key(phase: Phase) -> String {
        format!("{}{}:checkpoint", JOB_KEY_PREFIX, phase.as_str())
    }

    fn accumulator_key(phase: Phase, name: &str) -> String {
        format!("{}{}:{}", JOB_KEY_PREFIX, phase.as_str(), name)
    }

    pub async fn load_checkpoint(&self, phase: Phase) -> Result<Option<Checkpoint>> {
        Ok(self.kv.get_typed(&Self::checkpoint_key(phase)).await?)
    }

    /// Save `cursor` for `phase`, counting one more completed batch
    pub async fn save_cursor(&self, phase: Phase, cursor: Cursor) -> Result<Checkpoint> {
        let batches = self
            .load_checkpoint(phase)
            .await?
            .map(|cp| cp.batches)
            .unwrap_or(0);
        let checkpoint = Checkpoint::new(phase, cursor, batches + 1);
        self.kv
            .set_typed(&Self::checkpoint_key(phase), &checkpoint)
            .await?;
        Ok(checkpoint)
    }

    pub async fn load_accumulator<T>(&self, phase: Phase, name: &str) -> Result<Option<T>>
    where
        T: DeserializeOwned + Send,
    {
        Ok(self
            .kv
            .get_typed(&Self::accumulator_key(phase, name))
            .await?)
    }

    pub async fn save_accumulator<T>(&self, phase: Phase, name: &str, value: &T) -> Result<()>
    where
        T: Serialize + Sync,
    {
        self.kv
            .set_typed(&Self::accumulator_key(phase, name), value)
            .await?;
        Ok(())
    }

    pub async fn clear_phase(&self, phase: Phase) -> Result<usize> {
        let prefix = format!("{}{}:", JOB_KEY_PREFIX, phase.as_str());
        Ok(self.kv.delete_prefix(&prefix).await?)
    }

    /// Drop every cursor and accumulator of every phase
    pub async fn clear_all(&self) -> Result<usize> {
        let removed = self.kv.delete_prefix(JOB_KEY_PREFIX).await?;
        debug!("Cleared {} job keys", removed);
        Ok(removed)
    }
}

// Accumulator names shared between phases
pub(crate) mod accumulators {
    use super::*;

    /// Eligible document ids snapshotted by Preparation
    pub const ELIGIBLE: &str = "eligible";
    /// Sorted group keys computed by Deduplication
    pub const GROUP_KEYS: &str = "group_keys";
    /// Primary entity per document, computed by Linking
    pub const PRIMARY_BY_DOCUMENT: &str = "primary_by_document";
    /// Total qualifying documents, computed by Materialization
    pub const TOTAL: &str = "total";

    pub fn document(id: DocumentId) -> String {
        format!("doc:{}", id)
    }

    pub fn group(key: &str) -> String {
        format!("group:{}", key)
    }

    pub fn mapping(key: &str) -> String {
        format!("mapping:{}", key)
    }
}

/// Versioned read-modify-write access to the pipeline state
pub struct PipelineStateRepository {
    kv: Arc<dyn KeyValueStore>,
}

impl PipelineStateRepository {
    pub fn new(kv: Arc<dyn KeyValueStore>) -> Self {
        Self { kv }
    }

    pub async fn load(&self) -> Result<PipelineState> {
        Ok(self.kv.get_or_default(PIPELINE_STATE_KEY).await?)
    }

    /// Apply `mutate` atomically.
    ///
    /// Reads the current state, applies the closure, and writes it back only
    /// if nobody else wrote in between; otherwise retries against the fresh
    /// state. An error from the closure aborts without writing.
    pub async fn update<F, R>(&self, mut mutate: F) -> Result<(R, PipelineState)>
    where
        F: FnMut(&mut PipelineState) -> Result<R> + Send,
        R: Send,
    {
        for attempt in 1..=MAX_UPDATE_ATTEMPTS {
            let current = self.kv.get(PIPELINE_STATE_KEY).await?;
            let mut state: PipelineState = match &current {
                Some(bytes) => bincode::deserialize(bytes)?,
                None => PipelineState::default(),
            };

            let result = mutate(&mut state)?;
            state.version += 1;
            let encoded = bincode::serialize(&state)?;

            if self
                .kv
                .compare_and_swap(PIPELINE_STATE_KEY, current.as_deref(), encoded)
                .await?
            {
                return Ok((result, state));
            }
            debug!("Pipeline state changed concurrently, retrying (attempt {})", attempt);
        }

        Err(PipelineError::Conflict {
            key: PIPELINE_STATE_KEY.to_string(),
            attempts: MAX_UPDATE_ATTEMPTS,
        })
    }
}
