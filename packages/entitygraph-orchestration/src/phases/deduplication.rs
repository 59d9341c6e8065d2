use async_trait::async_trait;
use entitygraph_storage::{DocumentId, EntityId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::{debug, info, warn};

use crate::checkpoint::{accumulators, Cursor};
use crate::collaborators::ExtractedCandidate;
use crate::dedup::{group_candidates, select_canonical, RawCandidate};
use crate::error::Result;
use crate::phase::{BatchReport, Phase};
use crate::phases::escalate_persistence;
use crate::pipeline::{PhaseContext, PhaseHandler};

/// Resolved group, consumed by Linking
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupMapping {
    pub entity_id: EntityId,
    pub canonical_name: String,
    /// Distinct literal spellings seen in the group
    pub variants: Vec<String>,
    pub candidates: Vec<RawCandidate>,
}

impl GroupMapping {
    pub fn documents(&self) -> BTreeSet<DocumentId> {
        self.candidates.iter().map(|c| c.document_id).collect()
    }
}

/// Phase 3: cluster candidates and resolve each cluster to one entity
pub struct DeduplicationPhase;

impl DeduplicationPhase {
    /// Group every extracted candidate once and persist the groups
    async fn group_keys(&self, ctx: &PhaseContext) -> Result<Vec<String>> {
        let checkpoints = ctx.checkpoints();
        if let Some(keys) = checkpoints
            .load_accumulator(Phase::Deduplication, accumulators::GROUP_KEYS)
            .await?
        {
            return Ok(keys);
        }

        let eligible: Vec<DocumentId> = checkpoints
            .load_accumulator(Phase::Preparation, accumulators::ELIGIBLE)
            .await?
            .unwrap_or_default();

        let mut raw = Vec::new();
        for id in eligible {
            let extracted: Option<Vec<ExtractedCandidate>> = checkpoints
                .load_accumulator(Phase::Extraction, &accumulators::document(id))
                .await?;
            raw.extend(
                extracted
                    .unwrap_or_default()
                    .into_iter()
                    .map(|c| RawCandidate::from_extracted(id, c)),
            );
        }

        let candidate_count = raw.len();
        let groups = group_candidates(raw);
        for (key, group) in &groups {
            checkpoints
                .save_accumulator(Phase::Deduplication, &accumulators::group(key), group)
                .await?;
        }
        let keys: Vec<String> = groups.into_keys().collect();
        checkpoints
            .save_accumulator(Phase::Deduplication, accumulators::GROUP_KEYS, &keys)
            .await?;

        info!(
            "Deduplication: {} candidates in {} groups",
            candidate_count,
            keys.len()
        );
        Ok(keys)
    }
}

#[async_trait]
impl PhaseHandler for DeduplicationPhase {
    fn phase(&self) -> Phase {
        Phase::Deduplication
    }

    async fn run_batch(&self, ctx: &PhaseContext) -> Result<BatchReport> {
        let keys = self.group_keys(ctx).await?;
        let checkpoints = ctx.checkpoints();
        let store = &ctx.services.store;

        let mut processed: BTreeSet<String> = checkpoints
            .load_checkpoint(Phase::Deduplication)
            .await?
            .map(|cp| cp.cursor.processed_keys())
            .unwrap_or_default();
        let batch_size = ctx.run.batch_size;
        let batch: Vec<String> = keys
            .iter()
            .filter(|k| !processed.contains(*k))
            .take(batch_size)
            .cloned()
            .collect();

        let mut report = BatchReport {
            total: keys.len() as u64,
            batch_size,
            ..Default::default()
        };

        for key in &batch {
            let group: Option<Vec<RawCandidate>> = checkpoints
                .load_accumulator(Phase::Deduplication, &accumulators::group(key))
                .await?;
            let Some(choice) = group.as_deref().and_then(select_canonical) else {
                report.skipped += 1;
                processed.insert(key.clone());
                continue;
            };

            match escalate_persistence(
                store
                    .upsert_entity(&choice.name, choice.entity_type, &choice.aliases)
                    .await,
            )? {
                Ok(entity_id) => {
                    debug!("Group '{}' resolved to entity {} ({})", key, entity_id, choice.name);
                    let mapping = GroupMapping {
                        entity_id,
                        canonical_name: choice.name,
                        variants: choice.variants,
                        candidates: group.unwrap_or_default(),
                    };
                    checkpoints
                        .save_accumulator(Phase::Deduplication, &accumulators::mapping(key), &mapping)
                        .await?;
                    report.processed += 1;
                }
                Err(e) => {
                    warn!("Deduplication: group '{}' failed: {}", key, e);
                    report.failed += 1;
                }
            }
            processed.insert(key.clone());
        }

        let done = processed.len();
        if !batch.is_empty() {
            checkpoints
                .save_cursor(Phase::Deduplication, Cursor::ProcessedKeys(processed))
                .await?;
        }
        report.exhausted = done >= keys.len();
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{services_in_memory, FixtureExtractor, StaticContentSource};
    use crate::phase::RunConfig;
    use entitygraph_storage::EntityType;
    use std::sync::Arc;

    fn candidate(name: &str, confidence: f64) -> ExtractedCandidate {
        ExtractedCandidate {
            name: name.into(),
            entity_type: "ORG".into(),
            confidence,
            context: None,
            aliases: vec![],
        }
    }

    async fn extracted(docs: Vec<(DocumentId, Vec<ExtractedCandidate>)>, batch_size: usize) -> PhaseContext {
        let services = services_in_memory(StaticContentSource::default(), FixtureExtractor::new());
        let ctx = PhaseContext::new(
            Arc::new(services),
            RunConfig::new("test").with_batch_size(batch_size),
        );
        let ids: Vec<DocumentId> = docs.iter().map(|(id, _)| *id).collect();
        ctx.checkpoints()
            .save_accumulator(Phase::Preparation, accumulators::ELIGIBLE, &ids)
            .await
            .unwrap();
        for (id, candidates) in docs {
            ctx.checkpoints()
                .save_accumulator(Phase::Extraction, &accumulators::document(id), &candidates)
                .await
                .unwrap();
        }
        ctx
    }

    #[tokio::test]
    async fn test_apple_spellings_resolve_to_one_entity() {
        let ctx = extracted(
            vec![
                (1, vec![candidate("Apple", 0.9)]),
                (2, vec![candidate("apple inc", 0.7)]),
                (3, vec![candidate("APPLE", 0.8), candidate("Google", 0.8)]),
            ],
            10,
        )
        .await;

        let report = DeduplicationPhase.run_batch(&ctx).await.unwrap();
        assert_eq!(report.total, 2);
        assert_eq!(report.processed, 2);
        assert!(report.exhausted);

        let store = &ctx.services.store;
        assert_eq!(store.count_entities().await.unwrap(), 2);
        let apple = store.find_by_slug("apple").await.unwrap().unwrap();
        assert_eq!(apple.entity_type, EntityType::Organization);
        assert_eq!(store.resolve_alias("apple-inc").await.unwrap(), Some(apple.id));

        let mapping: GroupMapping = ctx
            .checkpoints()
            .load_accumulator(Phase::Deduplication, &accumulators::mapping("apple"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(mapping.documents(), BTreeSet::from([1, 2, 3]));
    }

    #[tokio::test]
    async fn test_groups_resolve_to_existing_entity() {
        let ctx = extracted(vec![(1, vec![candidate("Open AI", 0.9)])], 10).await;
        let existing = ctx
            .services
            .store
            .upsert_entity("OpenAI Labs", EntityType::Organization, &["Open AI".to_string()])
            .await
            .unwrap();

        DeduplicationPhase.run_batch(&ctx).await.unwrap();
        let mapping: GroupMapping = ctx
            .checkpoints()
            .load_accumulator(Phase::Deduplication, &accumulators::mapping("openai"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(mapping.entity_id, existing);
        assert_eq!(ctx.services.store.count_entities().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_group_matching_entity_slug_reuses_it() {
        let ctx = extracted(vec![(4, vec![candidate("Anthropic", 0.8)])], 10).await;
        let existing = ctx
            .services
            .store
            .upsert_entity("Anthropic", EntityType::Organization, &[])
            .await
            .unwrap();

        let report = DeduplicationPhase.run_batch(&ctx).await.unwrap();
        assert_eq!(report.processed, 1);
        let mapping: GroupMapping = ctx
            .checkpoints()
            .load_accumulator(Phase::Deduplication, &accumulators::mapping("anthropic"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(mapping.entity_id, existing);
        assert_eq!(ctx.services.store.count_entities().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_processed_keys_cursor_resumes() {
        let ctx = extracted(
            vec![(1, vec![candidate("Alpha", 0.5), candidate("Beta", 0.5), candidate("Gamma", 0.5)])],
            2,
        )
        .await;

        let first = DeduplicationPhase.run_batch(&ctx).await.unwrap();
        assert_eq!(first.processed, 2);
        assert!(!first.exhausted);

        let second = DeduplicationPhase.run_batch(&ctx).await.unwrap();
        assert_eq!(second.processed, 1);
        assert!(second.exhausted);
        assert_eq!(ctx.services.store.count_entities().await.unwrap(), 3);
    }
}
