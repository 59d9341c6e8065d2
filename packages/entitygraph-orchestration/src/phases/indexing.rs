use async_trait::async_trait;
use entitygraph_storage::KvExt;
use tracing::{info, warn};

use crate::checkpoint::Cursor;
use crate::error::Result;
use crate::phase::{BatchReport, Phase};
use crate::phases::escalate_persistence;
use crate::pipeline::{PhaseContext, PhaseHandler};

/// Where the aggregate snapshot of the last indexing run is stored
pub const SNAPSHOT_KEY: &str = "entitygraph:snapshot";

/// Phase 5: refresh cached mention counts, then run storage maintenance and
/// store the aggregate snapshot once every entity has been visited.
pub struct IndexingPhase;

#[async_trait]
impl PhaseHandler for IndexingPhase {
    fn phase(&self) -> Phase {
        Phase::Indexing
    }

    async fn run_batch(&self, ctx: &PhaseContext) -> Result<BatchReport> {
        let checkpoints = ctx.checkpoints();
        let services = &ctx.services;
        let store = &services.store;

        let after = checkpoints
            .load_checkpoint(Phase::Indexing)
            .await?
            .map(|cp| cp.cursor.last_id())
            .unwrap_or(0);
        let batch_size = ctx.run.batch_size;
        let ids = store.entity_ids_after(after, batch_size).await?;

        let mut report = BatchReport {
            total: store.count_entities().await?,
            batch_size,
            ..Default::default()
        };

        for &id in &ids {
            match escalate_persistence(store.recompute_mention_count(id).await)? {
                Ok(_) => report.processed += 1,
                Err(e) => {
                    warn!("Indexing: entity {} failed: {}", id, e);
                    report.failed += 1;
                }
            }
        }

        let mut last = after;
        if let Some(&max) = ids.last() {
            last = max;
            checkpoints
                .save_cursor(Phase::Indexing, Cursor::LastId(max))
                .await?;
        }

        report.exhausted =
            ids.len() < batch_size || store.entity_ids_after(last, 1).await?.is_empty();
        if report.exhausted {
            store.optimize().await?;
            let snapshot = store
                .aggregate_snapshot(ctx.settings().indexing.top_n)
                .await?;
            services.kv.set_typed(SNAPSHOT_KEY, &snapshot).await?;
            info!(
                "Indexing: snapshot stored ({} entities, {} mentions)",
                snapshot.total_entities, snapshot.total_mentions
            );
        }
        Ok(report)
    }
}
