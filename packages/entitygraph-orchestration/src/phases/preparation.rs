use async_trait::async_trait;
use entitygraph_storage::DocumentId;
use tracing::{debug, info, warn};

use crate::checkpoint::{accumulators, Cursor};
use crate::error::{PipelineError, Result};
use crate::phase::{BatchReport, Phase};
use crate::phases::window;
use crate::pipeline::{extracted_marker_key, PhaseContext, PhaseHandler};
use crate::text::prepare_content;

/// Phase 1: snapshot eligible documents and store their plain text
///
/// Documents already extracted by an earlier run are left out unless the
/// run forces reprocessing. Documents below the minimum length are skipped.
pub struct PreparationPhase;

impl PreparationPhase {
    async fn eligible(&self, ctx: &PhaseContext) -> Result<Vec<DocumentId>> {
        let checkpoints = ctx.checkpoints();
        if let Some(ids) = checkpoints
            .load_accumulator(Phase::Preparation, accumulators::ELIGIBLE)
            .await?
        {
            return Ok(ids);
        }

        let listed = ctx
            .services
            .content
            .list_eligible_documents(ctx.run.content_type.as_deref(), ctx.run.force)
            .await
            .map_err(PipelineError::Other)?;

        let mut eligible = Vec::with_capacity(listed.len());
        for id in listed {
            if ctx.run.force || ctx.services.kv.get(&extracted_marker_key(id)).await?.is_none() {
                eligible.push(id);
            }
        }
        eligible.sort_unstable();
        eligible.dedup();

        info!("Preparation: {} eligible documents", eligible.len());
        checkpoints
            .save_accumulator(Phase::Preparation, accumulators::ELIGIBLE, &eligible)
            .await?;
        Ok(eligible)
    }
}

#[async_trait]
impl PhaseHandler for PreparationPhase {
    fn phase(&self) -> Phase {
        Phase::Preparation
    }

    async fn run_batch(&self, ctx: &PhaseContext) -> Result<BatchReport> {
        let eligible = self.eligible(ctx).await?;
        let offset = ctx
            .checkpoints()
            .load_checkpoint(Phase::Preparation)
            .await?
            .map(|cp| cp.cursor.offset() as usize)
            .unwrap_or(0);
        let batch_size = ctx.run.batch_size;
        let batch = window(&eligible, offset, batch_size);
        let settings = &ctx.settings().preparation;

        let mut report = BatchReport {
            total: eligible.len() as u64,
            batch_size,
            ..Default::default()
        };

        for &id in batch {
            let document = match ctx.services.content.get_document(id).await {
                Ok(Some(document)) => document,
                Ok(None) => {
                    debug!("Preparation: document {} disappeared", id);
                    report.skipped += 1;
                    continue;
                }
                Err(e) => {
                    warn!("Preparation: failed to load document {}: {}", id, e);
                    report.failed += 1;
                    continue;
                }
            };

            let text = prepare_content(
                &document.title,
                &document.raw_body,
                settings.max_content_length,
            );
            if text.chars().count() < settings.min_content_length {
                debug!("Preparation: document {} too short, skipping", id);
                report.skipped += 1;
                continue;
            }

            ctx.checkpoints()
                .save_accumulator(Phase::Preparation, &accumulators::document(id), &text)
                .await?;
            report.processed += 1;
        }

        let next = offset + batch.len();
        if !batch.is_empty() {
            ctx.checkpoints()
                .save_cursor(Phase::Preparation, Cursor::Offset(next as u64))
                .await?;
        }
        report.exhausted = next >= eligible.len();
        Ok(report)
    }
}
