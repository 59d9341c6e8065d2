//! Shared harness for the integration tests
//!
//! Wires the in-memory adapters, a recording event bus, the task queue and
//! a worker with near-zero retry delays.

#![allow(dead_code)]

use async_trait::async_trait;
use entitygraph_orchestration::fixtures::{
    CountingMaterializer, FixtureExtractor, StaticContentSource,
};
use entitygraph_orchestration::{
    Document, EntityExtractor, EventBus, ExtractedCandidate, ExtractionError, InMemoryTaskQueue,
    MemoryListener, PipelineOrchestrator, PipelineServices, PipelineSettings, PropagationEngine,
    QueueWorker, RetryPolicy,
};
use entitygraph_storage::{DocumentId, InMemoryCanonicalStore, InMemoryKeyValueStore, MokaTtlCache};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

const FILLER: &str =
    "The announcement drew attention from analysts, partners and the wider developer community.";

/// Published post whose prepared text clears the minimum length
pub fn document(id: DocumentId, title: &str, body: &str) -> Document {
    Document {
        id,
        title: title.to_string(),
        raw_body: format!("<p>{}</p><p>{}</p>", body, FILLER),
        status: "publish".to_string(),
        content_type: "post".to_string(),
    }
}

pub fn candidate(name: &str, entity_type: &str, confidence: f64) -> ExtractedCandidate {
    ExtractedCandidate {
        name: name.to_string(),
        entity_type: entity_type.to_string(),
        confidence,
        context: None,
        aliases: vec![],
    }
}

/// Fixture extractor that counts calls and rate-limits the first `fail_first`
pub struct FlakyExtractor {
    inner: FixtureExtractor,
    fail_remaining: AtomicU32,
    calls: AtomicU32,
}

impl FlakyExtractor {
    pub fn new(inner: FixtureExtractor, fail_first: u32) -> Self {
        Self {
            inner,
            fail_remaining: AtomicU32::new(fail_first),
            calls: AtomicU32::new(0),
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EntityExtractor for FlakyExtractor {
    async fn extract(
        &self,
        text: &str,
        prompt_override: Option<&str>,
        model_override: Option<&str>,
    ) -> Result<Vec<ExtractedCandidate>, ExtractionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let throttled = self
            .fail_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if throttled {
            return Err(ExtractionError::RateLimit("429 Too Many Requests".to_string()));
        }
        self.inner.extract(text, prompt_override, model_override).await
    }
}

pub fn fast_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        base_delay_ms: 1,
        multiplier: 1.0,
    }
}

pub struct Harness {
    pub services: Arc<PipelineServices>,
    pub orchestrator: Arc<PipelineOrchestrator>,
    pub propagation: Arc<PropagationEngine>,
    pub queue: Arc<InMemoryTaskQueue>,
    pub worker: QueueWorker,
    pub extractor: Arc<FlakyExtractor>,
    pub materializer: Arc<CountingMaterializer>,
    pub events: Arc<MemoryListener>,
}

impl Harness {
    pub fn new(
        documents: Vec<Document>,
        candidates: HashMap<DocumentId, Vec<ExtractedCandidate>>,
    ) -> Self {
        Self::build(documents, candidates, 0, fast_retry(5))
    }

    pub fn build(
        documents: Vec<Document>,
        candidates: HashMap<DocumentId, Vec<ExtractedCandidate>>,
        rate_limited_calls: u32,
        retry: RetryPolicy,
    ) -> Self {
        let mut settings = PipelineSettings::default();
        // lets lifecycle tests step through tiny corpora one or two documents at a time
        settings.batch.min_size = 1;
        let source = StaticContentSource::new(documents);
        let fixture =
            FixtureExtractor::for_corpus(&source, settings.preparation.max_content_length, candidates);
        let extractor = Arc::new(FlakyExtractor::new(fixture, rate_limited_calls));
        let materializer = Arc::new(CountingMaterializer::new());

        let events = Arc::new(MemoryListener::new());
        let bus = Arc::new(EventBus::with_tracing());
        bus.subscribe(events.clone());

        let services = Arc::new(
            PipelineServices::new(
                Arc::new(InMemoryCanonicalStore::new()),
                Arc::new(InMemoryKeyValueStore::new()),
                Arc::new(MokaTtlCache::default()),
                Arc::new(source),
                extractor.clone(),
                materializer.clone(),
            )
            .with_settings(settings)
            .with_events(bus),
        );

        let queue = Arc::new(InMemoryTaskQueue::new());
        let orchestrator = Arc::new(PipelineOrchestrator::new(services.clone(), queue.clone()));
        let propagation = Arc::new(PropagationEngine::new(services.clone(), queue.clone()));
        let mut worker =
            QueueWorker::new(queue.clone(), retry).with_poll_interval(Duration::from_millis(5));
        orchestrator.register_jobs(&mut worker);
        propagation.register_jobs(&mut worker);

        Self {
            services,
            orchestrator,
            propagation,
            queue,
            worker,
            extractor,
            materializer,
            events,
        }
    }
}
