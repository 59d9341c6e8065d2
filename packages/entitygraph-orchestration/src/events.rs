//! Pipeline lifecycle events
//!
//! The orchestrator and the propagation job publish [`PipelineEvent`]s on an
//! [`EventBus`]. Listeners are synchronous and must not block.

use entitygraph_storage::{DocumentId, EntityId};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::phase::{Phase, ProgressCounters, RunConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PipelineEvent {
    PipelineStarted {
        config: RunConfig,
    },
    PhaseStarted {
        phase: Phase,
    },
    PhaseCompleted {
        phase: Phase,
        progress: ProgressCounters,
    },
    PhaseChanged {
        from: Phase,
        to: Option<Phase>,
    },
    PipelineCompleted,
    PipelineFailed {
        phase: Option<Phase>,
        reason: String,
    },
    PipelineStopped {
        phase: Option<Phase>,
    },
    PropagationBatch {
        entity_id: EntityId,
        documents: usize,
        failed: usize,
        cursor: DocumentId,
    },
    PropagationComplete {
        entity_id: EntityId,
        rounds: u32,
        documents: u64,
    },
    JobLog {
        phase: Option<Phase>,
        level: LogLevel,
        message: String,
        context: Value,
    },
}

impl PipelineEvent {
    pub fn name(&self) -> &'static str {
        match self {
            PipelineEvent::PipelineStarted { .. } => "pipeline_started",
            PipelineEvent::PhaseStarted { .. } => "phase_started",
            PipelineEvent::PhaseCompleted { .. } => "phase_completed",
            PipelineEvent::PhaseChanged { .. } => "phase_changed",
            PipelineEvent::PipelineCompleted => "pipeline_completed",
            PipelineEvent::PipelineFailed { .. } => "pipeline_failed",
            PipelineEvent::PipelineStopped { .. } => "pipeline_stopped",
            PipelineEvent::PropagationBatch { .. } => "propagation_batch",
            PipelineEvent::PropagationComplete { .. } => "propagation_complete",
            PipelineEvent::JobLog { .. } => "job_log",
        }
    }
}

pub trait EventListener: Send + Sync {
    fn on_event(&self, event: &PipelineEvent);
}

#[derive(Default)]
pub struct EventBus {
    listeners: RwLock<Vec<Arc<dyn EventListener>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bus with a [`TracingListener`] already attached
    pub fn with_tracing() -> Self {
        let bus = Self::new();
        bus.subscribe(Arc::new(TracingListener));
        bus
    }

    pub fn subscribe(&self, listener: Arc<dyn EventListener>) {
        self.listeners.write().push(listener);
    }

    pub fn publish(&self, event: PipelineEvent) {
        for listener in self.listeners.read().iter() {
            listener.on_event(&event);
        }
    }

    /// Structured job log line
    pub fn log(&self, phase: Option<Phase>, level: LogLevel, message: impl Into<String>, context: Value) {
        self.publish(PipelineEvent::JobLog {
            phase,
            level,
            message: message.into(),
            context,
        });
    }
}

/// Forwards every event to `tracing`
pub struct TracingListener;

impl EventListener for TracingListener {
    fn on_event(&self, event: &PipelineEvent) {
        match event {
            PipelineEvent::PipelineFailed { phase, reason } => {
                error!("Pipeline failed in {:?}: {}", phase, reason)
            }
            PipelineEvent::PhaseCompleted { phase, progress } => info!(
                "Phase {} completed: {} ok, {} failed, {} skipped of {}",
                phase, progress.completed, progress.failed, progress.skipped, progress.total
            ),
            PipelineEvent::PropagationBatch {
                entity_id,
                documents,
                failed,
                cursor,
            } => debug!(
                "Propagation for entity {}: {} documents ({} failed), cursor {}",
                entity_id, documents, failed, cursor
            ),
            PipelineEvent::JobLog {
                phase,
                level,
                message,
                context,
            } => match level {
                LogLevel::Debug => debug!(?phase, %context, "{}", message),
                LogLevel::Info => info!(?phase, %context, "{}", message),
                LogLevel::Warning => warn!(?phase, %context, "{}", message),
                LogLevel::Error => error!(?phase, %context, "{}", message),
            },
            other => info!("{}", other.name()),
        }
    }
}

/// Records events in memory
#[derive(Default)]
pub struct MemoryListener {
    events: RwLock<Vec<PipelineEvent>>,
}

impl MemoryListener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<PipelineEvent> {
        self.events.read().clone()
    }

    pub fn count(&self, name: &str) -> usize {
        self.events.read().iter().filter(|e| e.name() == name).count()
    }
}

impl EventListener for MemoryListener {
    fn on_event(&self, event: &PipelineEvent) {
        self.events.write().push(event.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bus_fans_out() {
        let bus = EventBus::with_tracing();
        let a = Arc::new(MemoryListener::new());
        let b = Arc::new(MemoryListener::new());
        bus.subscribe(a.clone());
        bus.subscribe(b.clone());

        bus.publish(PipelineEvent::PhaseStarted {
            phase: Phase::Linking,
        });
        bus.log(Some(Phase::Linking), LogLevel::Info, "linked", serde_json::json!({"n": 3}));

        assert_eq!(a.count("phase_started"), 1);
        assert_eq!(b.events().len(), 2);
    }

    #[test]
    fn test_event_json_tag() {
        let json = serde_json::to_value(PipelineEvent::PhaseChanged {
            from: Phase::Indexing,
            to: Some(Phase::Materialization),
        })
        .unwrap();
        assert_eq!(json["event"], "phase_changed");
        assert_eq!(json["to"], "materialization");
    }
}
