/*
 * Entitygraph Orchestration - Resumable Entity Extraction Pipeline
 *
 * Six-phase batch pipeline turning a content corpus into a canonical,
 * deduplicated entity graph.
 *
 * Architecture:
 * - Pipeline State Machine (versioned, compare-and-swap on the KV store)
 * - Per-phase Checkpoints (offset / last-id / processed-keys cursors)
 * - Phase Handlers (pluggable, one bounded batch per invocation)
 * - Adaptive Batch Sizing (rolling average seconds per item)
 * - Task Queue Worker (retry with exponential backoff)
 * - Chain-link Propagation (entity edits -> cached documents)
 * - Observability (typed events, tracing, optional Prometheus metrics)
 */

// Public modules
pub mod batch;
pub mod checkpoint;
pub mod collaborators;
pub mod config;
pub mod dedup;
pub mod entity_service;
pub mod error;
pub mod events;
pub mod fixtures;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod orchestrator;
pub mod phase;
pub mod phases;
pub mod pipeline;
pub mod propagation;
pub mod queue;
pub mod telemetry;
pub mod text;

// Re-exports
pub use batch::{AdaptiveBatchController, BatchControllerState};
pub use checkpoint::{Checkpoint, CheckpointManager, Cursor, PipelineStateRepository};
pub use collaborators::{
    ContentSource, Document, EntityExtractor, ExtractedCandidate, ExtractionError, Materializer,
};
pub use config::{ConfigError, PipelineSettings, Validatable};
pub use dedup::{group_candidates, select_canonical, CanonicalChoice, RawCandidate};
pub use entity_service::EntityService;
pub use error::{ErrorCategory, PipelineError, Result};
pub use events::{EventBus, EventListener, LogLevel, MemoryListener, PipelineEvent, TracingListener};
#[cfg(feature = "metrics")]
pub use metrics::PipelineMetrics;
pub use orchestrator::{PipelineOrchestrator, PipelineStatusReport};
pub use phase::{BatchReport, Phase, PipelineState, PipelineStatus, ProgressCounters, RunConfig};
pub use pipeline::{PhaseContext, PhaseHandler, PipelineServices};
pub use propagation::{PropagationArgs, PropagationEngine, PropagationStatus, PROPAGATION_JOB};
pub use queue::{
    InMemoryTaskQueue, JobHandler, QueueWorker, RetryPolicy, ScheduledTask, TaskQueue, WorkerStats,
};
