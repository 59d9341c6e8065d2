use async_trait::async_trait;
use tracing::{debug, warn};

use crate::checkpoint::{accumulators, Cursor};
use crate::error::Result;
use crate::phase::{BatchReport, Phase};
use crate::pipeline::{PhaseContext, PhaseHandler};

const COUNT_PAGE: usize = 500;

/// Phase 6: regenerate the cached representation of every document with a
/// qualifying mention
pub struct MaterializationPhase;

impl MaterializationPhase {
    async fn total(&self, ctx: &PhaseContext, min_confidence: f64) -> Result<u64> {
        let checkpoints = ctx.checkpoints();
        if let Some(total) = checkpoints
            .load_accumulator(Phase::Materialization, accumulators::TOTAL)
            .await?
        {
            return Ok(total);
        }

        let mut total = 0u64;
        let mut after = 0;
        loop {
            let page = ctx
                .services
                .store
                .documents_with_mentions_after(after, min_confidence, COUNT_PAGE)
                .await?;
            total += page.len() as u64;
            match page.last() {
                Some(&last) if page.len() == COUNT_PAGE => after = last,
                _ => break,
            }
        }
        checkpoints
            .save_accumulator(Phase::Materialization, accumulators::TOTAL, &total)
            .await?;
        Ok(total)
    }
}

#[async_trait]
impl PhaseHandler for MaterializationPhase {
    fn phase(&self) -> Phase {
        Phase::Materialization
    }

    async fn run_batch(&self, ctx: &PhaseContext) -> Result<BatchReport> {
        let services = &ctx.services;
        let min_confidence = ctx.settings().materialization.min_confidence;
        let total = self.total(ctx, min_confidence).await?;

        let after = ctx
            .checkpoints()
            .load_checkpoint(Phase::Materialization)
            .await?
            .map(|cp| cp.cursor.last_id())
            .unwrap_or(0);
        let batch_size = ctx.run.batch_size;
        let documents = services
            .store
            .documents_with_mentions_after(after, min_confidence, batch_size)
            .await?;

        let mut report = BatchReport {
            total,
            batch_size,
            ..Default::default()
        };

        for &document_id in &documents {
            let entities = services
                .store
                .get_entities_for_post(document_id, min_confidence)
                .await?;
            if entities.is_empty() {
                debug!("Materialization: document {} has no visible entities", document_id);
                report.skipped += 1;
                continue;
            }
            match services.materializer.regenerate(document_id).await {
                Ok(()) => report.processed += 1,
                Err(e) => {
                    warn!("Materialization: document {} failed: {}", document_id, e);
                    report.failed += 1;
                }
            }
        }

        let mut last = after;
        if let Some(&max) = documents.last() {
            last = max;
            ctx.checkpoints()
                .save_cursor(Phase::Materialization, Cursor::LastId(max))
                .await?;
        }
        report.exhausted = documents.len() < batch_size
            || services
                .store
                .documents_with_mentions_after(last, min_confidence, 1)
                .await?
                .is_empty();
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{
        services_in_memory, CountingMaterializer, FixtureExtractor, StaticContentSource,
    };
    use crate::phase::RunConfig;
    use entitygraph_storage::{EntityPatch, EntityStatus, EntityType, NewMention};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_regenerates_documents_with_visible_entities() {
        let materializer = Arc::new(CountingMaterializer::new());
        let mut services = services_in_memory(StaticContentSource::default(), FixtureExtractor::new());
        services.materializer = materializer.clone();
        let store = services.store.clone();

        let kept = store.upsert_entity("Kept", EntityType::Concept, &[]).await.unwrap();
        let trashed = store.upsert_entity("Trashed", EntityType::Concept, &[]).await.unwrap();
        for doc in [1, 2, 3] {
            store.link_mention(&NewMention::new(kept, doc, 0.7)).await.unwrap();
        }
        store.link_mention(&NewMention::new(trashed, 4, 0.7)).await.unwrap();
        store
            .update_entity(
                trashed,
                &EntityPatch {
                    status: Some(EntityStatus::Trash),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let ctx = PhaseContext::new(Arc::new(services), RunConfig::new("test").with_batch_size(2));
        let first = MaterializationPhase.run_batch(&ctx).await.unwrap();
        assert_eq!((first.processed, first.total), (2, 4));
        assert!(!first.exhausted);

        let second = MaterializationPhase.run_batch(&ctx).await.unwrap();
        assert_eq!((second.processed, second.skipped), (1, 1));
        assert!(second.exhausted);

        assert_eq!(materializer.regenerations(3), 1);
        assert_eq!(materializer.regenerations(4), 0);
    }
}
