use crate::checkpoint::CheckpointManager;
use crate::collaborators::{ContentSource, EntityExtractor, Materializer};
use crate::config::PipelineSettings;
use crate::error::Result;
use crate::events::EventBus;
#[cfg(feature = "metrics")]
use crate::metrics::PipelineMetrics;
use crate::phase::{BatchReport, Phase, RunConfig};
use async_trait::async_trait;
use entitygraph_storage::{CanonicalStore, DocumentId, KeyValueStore, TtlCache};
use std::sync::Arc;

/// Marks a document as extracted by some earlier run. Lives outside the job
/// namespace so `start()` does not clear it.
pub fn extracted_marker_key(document_id: DocumentId) -> String {
    format!("entitygraph:extracted:{}", document_id)
}

/// Everything a phase handler or job needs, shared behind one `Arc`
pub struct PipelineServices {
    pub store: Arc<dyn CanonicalStore>,
    pub kv: Arc<dyn KeyValueStore>,
    pub ttl: Arc<dyn TtlCache>,
    pub content: Arc<dyn ContentSource>,
    pub extractor: Arc<dyn EntityExtractor>,
    pub materializer: Arc<dyn Materializer>,
    pub events: Arc<EventBus>,
    pub checkpoints: Arc<CheckpointManager>,
    pub settings: Arc<PipelineSettings>,
    #[cfg(feature = "metrics")]
    pub metrics: Option<Arc<PipelineMetrics>>,
}

impl PipelineServices {
    pub fn new(
        store: Arc<dyn CanonicalStore>,
        kv: Arc<dyn KeyValueStore>,
        ttl: Arc<dyn TtlCache>,
        content: Arc<dyn ContentSource>,
        extractor: Arc<dyn EntityExtractor>,
        materializer: Arc<dyn Materializer>,
    ) -> Self {
        Self {
            store,
            checkpoints: Arc::new(CheckpointManager::new(kv.clone())),
            kv,
            ttl,
            content,
            extractor,
            materializer,
            events: Arc::new(EventBus::with_tracing()),
            settings: Arc::new(PipelineSettings::default()),
            #[cfg(feature = "metrics")]
            metrics: None,
        }
    }

    pub fn with_settings(mut self, settings: PipelineSettings) -> Self {
        self.settings = Arc::new(settings);
        self
    }

    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = events;
        self
    }

    #[cfg(feature = "metrics")]
    pub fn with_metrics(mut self, metrics: Arc<PipelineMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }
}

/// Context passed to phase handlers
#[derive(Clone)]
pub struct PhaseContext {
    pub services: Arc<PipelineServices>,
    /// Configuration snapshot of the current run
    pub run: RunConfig,
}

impl PhaseContext {
    pub fn new(services: Arc<PipelineServices>, run: RunConfig) -> Self {
        Self { services, run }
    }

    pub fn checkpoints(&self) -> &CheckpointManager {
        &self.services.checkpoints
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.services.settings
    }
}

/// One resumable phase (pluggable)
///
/// Each call processes at most one bounded batch starting at the persisted
/// cursor, saves the advanced cursor, and reports what it did. Item-level
/// failures are counted in the report; an `Err` means the batch did not
/// commit and the cursor did not move.
#[async_trait]
pub trait PhaseHandler: Send + Sync {
    fn phase(&self) -> Phase;

    async fn run_batch(&self, ctx: &PhaseContext) -> Result<BatchReport>;
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopPhase;

    #[async_trait]
    impl PhaseHandler for NoopPhase {
        fn phase(&self) -> Phase {
            Phase::Indexing
        }

        async fn run_batch(&self, ctx: &PhaseContext) -> Result<BatchReport> {
            Ok(BatchReport {
                exhausted: true,
                batch_size: ctx.run.batch_size,
                ..Default::default()
            })
        }
    }

    #[test]
    fn test_marker_key_outside_job_namespace() {
        let key = extracted_marker_key(7);
        assert_eq!(key, "entitygraph:extracted:7");
        assert!(!key.starts_with(crate::checkpoint::JOB_KEY_PREFIX));
    }

    #[tokio::test]
    async fn test_handler_reports_exhausted() {
        let services = Arc::new(crate::fixtures::services_in_memory(
            crate::fixtures::StaticContentSource::default(),
            crate::fixtures::FixtureExtractor::default(),
        ));
        let ctx = PhaseContext::new(services, RunConfig::new("test").with_batch_size(3));
        let report = NoopPhase.run_batch(&ctx).await.unwrap();
        assert!(report.exhausted);
        assert_eq!(report.batch_size, 3);
        assert_eq!(NoopPhase.phase(), Phase::Indexing);
    }
}
