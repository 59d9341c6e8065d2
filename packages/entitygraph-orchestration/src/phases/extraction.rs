use async_trait::async_trait;
use entitygraph_storage::DocumentId;
use serde_json::json;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::batch::AdaptiveBatchController;
use crate::checkpoint::{accumulators, Cursor};
use crate::collaborators::ExtractionError;
use crate::error::Result;
use crate::events::LogLevel;
use crate::phase::{BatchReport, Phase};
use crate::phases::window;
use crate::pipeline::{extracted_marker_key, PhaseContext, PhaseHandler};

/// Phase 2: run the extractor over every prepared document
///
/// Batch size follows the adaptive controller. A rate-limit error aborts
/// the batch without moving the cursor; other extractor errors only fail
/// the item.
pub struct ExtractionPhase;

#[async_trait]
impl PhaseHandler for ExtractionPhase {
    fn phase(&self) -> Phase {
        Phase::Extraction
    }

    async fn run_batch(&self, ctx: &PhaseContext) -> Result<BatchReport> {
        let services = &ctx.services;
        let checkpoints = ctx.checkpoints();
        let settings = ctx.settings();

        let eligible: Vec<DocumentId> = checkpoints
            .load_accumulator(Phase::Preparation, accumulators::ELIGIBLE)
            .await?
            .unwrap_or_default();
        let offset = checkpoints
            .load_checkpoint(Phase::Extraction)
            .await?
            .map(|cp| cp.cursor.offset() as usize)
            .unwrap_or(0);

        let mut controller =
            AdaptiveBatchController::load(services.kv.as_ref(), Phase::Extraction, settings.batch.clone())
                .await?;
        let batch = window(&eligible, offset, controller.current());

        let mut report = BatchReport {
            total: eligible.len() as u64,
            ..Default::default()
        };
        let started = Instant::now();

        for &id in batch {
            let text: Option<String> = checkpoints
                .load_accumulator(Phase::Preparation, &accumulators::document(id))
                .await?;
            let Some(text) = text else {
                report.skipped += 1;
                continue;
            };

            match services
                .extractor
                .extract(
                    &text,
                    settings.extraction.prompt_override.as_deref(),
                    settings.extraction.model_override.as_deref(),
                )
                .await
            {
                Ok(candidates) => {
                    debug!("Extraction: document {} yielded {} candidates", id, candidates.len());
                    checkpoints
                        .save_accumulator(Phase::Extraction, &accumulators::document(id), &candidates)
                        .await?;
                    services.kv.set(&extracted_marker_key(id), vec![1]).await?;
                    report.processed += 1;
                }
                Err(ExtractionError::RateLimit(msg)) => {
                    let size = controller.record_failure();
                    controller.save(services.kv.as_ref(), Phase::Extraction).await?;
                    warn!("Extraction: rate limited at document {}, batch size now {}", id, size);
                    return Err(ExtractionError::RateLimit(msg).into());
                }
                Err(e) => {
                    services.events.log(
                        Some(Phase::Extraction),
                        LogLevel::Warning,
                        "Extraction failed",
                        json!({ "document_id": id, "error": e.to_string() }),
                    );
                    report.failed += 1;
                }
            }
        }

        let next = offset + batch.len();
        if !batch.is_empty() {
            let handled = (report.processed + report.failed) as usize;
            let size = controller.record(started.elapsed(), handled);
            controller.save(services.kv.as_ref(), Phase::Extraction).await?;
            checkpoints
                .save_cursor(Phase::Extraction, Cursor::Offset(next as u64))
                .await?;
            info!(
                "Extraction: {} ok, {} failed at offset {}, next batch {}",
                report.processed, report.failed, next, size
            );
        }

        report.batch_size = controller.current();
        report.exhausted = next >= eligible.len();
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{EntityExtractor, ExtractedCandidate};
    use crate::error::PipelineError;
    use crate::fixtures::{services_in_memory, FixtureExtractor, StaticContentSource};
    use crate::phase::RunConfig;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct ScriptedExtractor {
        calls: AtomicUsize,
        rate_limit_on: usize,
    }

    #[async_trait]
    impl EntityExtractor for ScriptedExtractor {
        async fn extract(
            &self,
            text: &str,
            _prompt_override: Option<&str>,
            _model_override: Option<&str>,
        ) -> std::result::Result<Vec<ExtractedCandidate>, ExtractionError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call == self.rate_limit_on {
                return Err(ExtractionError::RateLimit("429".into()));
            }
            if text == "bad" {
                return Err(ExtractionError::Other("malformed".into()));
            }
            Ok(vec![ExtractedCandidate {
                name: text.to_string(),
                entity_type: "concept".into(),
                confidence: 0.5,
                context: None,
                aliases: vec![],
            }])
        }
    }

    async fn prepared(texts: &[(DocumentId, &str)], extractor: ScriptedExtractor) -> PhaseContext {
        let mut services = services_in_memory(StaticContentSource::default(), FixtureExtractor::new());
        services.extractor = Arc::new(extractor);
        let ctx = PhaseContext::new(Arc::new(services), RunConfig::new("test"));
        let ids: Vec<DocumentId> = texts.iter().map(|(id, _)| *id).collect();
        ctx.checkpoints()
            .save_accumulator(Phase::Preparation, accumulators::ELIGIBLE, &ids)
            .await
            .unwrap();
        for (id, text) in texts {
            ctx.checkpoints()
                .save_accumulator(Phase::Preparation, &accumulators::document(*id), &text.to_string())
                .await
                .unwrap();
        }
        ctx
    }

    #[tokio::test]
    async fn test_item_failures_counted_and_markers_set() {
        let ctx = prepared(
            &[(1, "alpha"), (2, "bad"), (3, "gamma")],
            ScriptedExtractor {
                calls: AtomicUsize::new(0),
                rate_limit_on: 0,
            },
        )
        .await;

        let report = ExtractionPhase.run_batch(&ctx).await.unwrap();
        assert_eq!((report.processed, report.failed), (2, 1));
        assert!(report.exhausted);
        assert!(ctx.services.kv.get(&extracted_marker_key(1)).await.unwrap().is_some());
        assert!(ctx.services.kv.get(&extracted_marker_key(2)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_rate_limit_keeps_cursor() {
        let ctx = prepared(
            &[(1, "alpha"), (2, "beta")],
            ScriptedExtractor {
                calls: AtomicUsize::new(0),
                rate_limit_on: 2,
            },
        )
        .await;

        let err = ExtractionPhase.run_batch(&ctx).await.unwrap_err();
        assert!(matches!(err, PipelineError::RateLimited(_)));
        assert!(ctx
            .checkpoints()
            .load_checkpoint(Phase::Extraction)
            .await
            .unwrap()
            .is_none());

        // Replay processes both documents again
        let report = ExtractionPhase.run_batch(&ctx).await.unwrap();
        assert_eq!(report.processed, 2);
        assert!(report.exhausted);
    }

    #[tokio::test]
    async fn test_missing_prepared_text_is_skipped() {
        let ctx = prepared(
            &[(1, "alpha")],
            ScriptedExtractor {
                calls: AtomicUsize::new(0),
                rate_limit_on: 0,
            },
        )
        .await;
        let ids: Vec<DocumentId> = vec![1, 2];
        ctx.checkpoints()
            .save_accumulator(Phase::Preparation, accumulators::ELIGIBLE, &ids)
            .await
            .unwrap();

        let report = ExtractionPhase.run_batch(&ctx).await.unwrap();
        assert_eq!((report.processed, report.skipped), (1, 1));
    }
}
