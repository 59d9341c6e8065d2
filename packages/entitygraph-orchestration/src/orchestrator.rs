use crate::checkpoint::PipelineStateRepository;
use crate::error::{PipelineError, Result};
use crate::events::{LogLevel, PipelineEvent};
use crate::phase::{Phase, PipelineState, PipelineStatus, ProgressCounters, RunConfig};
use crate::phases::{default_handlers, SNAPSHOT_KEY};
use crate::pipeline::{PhaseContext, PhaseHandler, PipelineServices};
use crate::queue::{JobHandler, QueueWorker, TaskQueue};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use entitygraph_storage::{AggregateSnapshot, KvExt};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Status query result
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineStatusReport {
    pub status: PipelineStatus,
    pub phase: Option<Phase>,
    pub percentage: f64,
    pub pipeline: ProgressCounters,
    pub phase_progress: ProgressCounters,
    pub current_batch: u64,
    pub total_batches: u64,
    pub avg_item_secs: f64,
    pub last_error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<&PipelineState> for PipelineStatusReport {
    fn from(state: &PipelineState) -> Self {
        Self {
            status: state.status,
            phase: state.phase,
            percentage: state.percentage(),
            pipeline: state.pipeline,
            phase_progress: state.phase_progress,
            current_batch: state.current_batch,
            total_batches: state.total_batches,
            avg_item_secs: state.avg_item_secs,
            last_error: state.last_error.clone(),
            started_at: state.started_at,
            updated_at: state.updated_at,
            completed_at: state.completed_at,
        }
    }
}

/// Six-phase pipeline orchestrator
///
/// Owns the pipeline state machine. Each phase runs as a queue job that
/// processes one batch per invocation; after every batch the orchestrator
/// folds the report into the state, then either advances the phase or
/// schedules the next batch.
pub struct PipelineOrchestrator {
    services: Arc<PipelineServices>,
    queue: Arc<dyn TaskQueue>,
    repo: PipelineStateRepository,
    handlers: HashMap<Phase, Arc<dyn PhaseHandler>>,
}

impl PipelineOrchestrator {
    /// Create an orchestrator with the default handler of every phase
    pub fn new(services: Arc<PipelineServices>, queue: Arc<dyn TaskQueue>) -> Self {
        let mut orchestrator = Self {
            repo: PipelineStateRepository::new(services.kv.clone()),
            services,
            queue,
            handlers: HashMap::new(),
        };
        for handler in default_handlers() {
            orchestrator.register_handler(handler);
        }
        orchestrator
    }

    /// Register (or replace) the handler of one phase
    pub fn register_handler(&mut self, handler: Arc<dyn PhaseHandler>) {
        self.handlers.insert(handler.phase(), handler);
    }

    /// Route every phase job name to this orchestrator
    pub fn register_jobs(self: &Arc<Self>, worker: &mut QueueWorker) {
        for phase in Phase::ALL {
            worker.register(phase.job_name(), self.clone());
        }
    }

    pub fn services(&self) -> &Arc<PipelineServices> {
        &self.services
    }

    pub async fn state(&self) -> Result<PipelineState> {
        self.repo.load().await
    }

    pub async fn status(&self) -> Result<PipelineStatusReport> {
        Ok(PipelineStatusReport::from(&self.repo.load().await?))
    }

    /// Aggregate snapshot stored by the last completed indexing phase
    pub async fn aggregate_snapshot(&self) -> Result<Option<AggregateSnapshot>> {
        Ok(self.services.kv.get_typed(SNAPSHOT_KEY).await?)
    }

    fn publish(&self, event: PipelineEvent) {
        self.services.events.publish(event);
    }

    async fn schedule_phase(&self, phase: Phase) -> Result<()> {
        self.queue
            .schedule(
                Utc::now(),
                &phase.job_name(),
                json!({ "phase": phase.as_str() }),
                &self.services.settings.queue.group,
            )
            .await?;
        Ok(())
    }

    async fn unschedule_phases(&self) -> Result<usize> {
        let mut removed = 0;
        for phase in Phase::ALL {
            removed += self.queue.unschedule_all(&phase.job_name(), None).await?;
        }
        Ok(removed)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Control
    // ═══════════════════════════════════════════════════════════════════════

    /// Begin a fresh run at Preparation.
    ///
    /// Fails with `AlreadyRunning` while a run is in progress. Every cursor
    /// and accumulator of the previous run is discarded. The batch size is
    /// clamped to `[batch.min_size, batch.max_size]`.
    pub async fn start(&self, mut config: RunConfig) -> Result<PipelineState> {
        let band = &self.services.settings.batch;
        let requested = config.batch_size;
        config.batch_size = requested.clamp(band.min_size, band.max_size);
        if config.batch_size != requested {
            warn!(
                "Batch size {} outside [{}, {}], using {}",
                requested, band.min_size, band.max_size, config.batch_size
            );
        }

        let (_, state) = self.repo.update(|s| s.begin(config.clone())).await?;

        self.unschedule_phases().await?;
        self.services.checkpoints.clear_all().await?;

        info!(
            "Pipeline started by {} (content type: {:?}, force: {})",
            config.started_by, config.content_type, config.force
        );
        self.publish(PipelineEvent::PipelineStarted { config });
        self.publish(PipelineEvent::PhaseStarted {
            phase: Phase::Preparation,
        });
        self.schedule_phase(Phase::Preparation).await?;
        Ok(state)
    }

    /// Cancel pending phase jobs and go idle. A batch already executing
    /// finishes, but its report is discarded.
    pub async fn stop(&self) -> Result<PipelineState> {
        let removed = self.unschedule_phases().await?;
        let (phase, state) = self
            .repo
            .update(|s| {
                s.stop();
                Ok(s.phase)
            })
            .await?;
        info!("Pipeline stopped at {:?} ({} pending jobs removed)", phase, removed);
        self.publish(PipelineEvent::PipelineStopped { phase });
        Ok(state)
    }

    pub async fn pause(&self) -> Result<PipelineState> {
        let (_, state) = self.repo.update(|s| s.pause()).await?;
        self.unschedule_phases().await?;
        info!("Pipeline paused at {:?}", state.phase);
        Ok(state)
    }

    /// Continue a paused run from its saved cursors
    pub async fn resume(&self) -> Result<PipelineState> {
        let (phase, state) = self.repo.update(|s| s.resume()).await?;
        info!("Pipeline resumed at {}", phase);
        self.schedule_phase(phase).await?;
        Ok(state)
    }

    /// Advance past the current phase. Returns the new phase, `None` once
    /// the pipeline completed.
    pub async fn advance_phase(&self) -> Result<Option<Phase>> {
        let state = self.repo.load().await?;
        let current = match (state.status, state.phase) {
            (PipelineStatus::Running, Some(phase)) => phase,
            _ => {
                return Err(PipelineError::InvalidStateTransition {
                    from: state.status.to_string(),
                    to: "next phase".to_string(),
                })
            }
        };
        self.complete_phase(current).await?;
        Ok(self.repo.load().await?.phase)
    }

    /// Soft barrier: advance when the current phase's counters are complete.
    ///
    /// Returns whether the phase advanced.
    pub async fn handle_phase_complete(&self) -> Result<bool> {
        let state = self.repo.load().await?;
        match state.phase {
            Some(phase) if state.is_running() && state.phase_counts_complete() => {
                self.complete_phase(phase).await
            }
            _ => Ok(false),
        }
    }

    /// Escalate to FAILED and stop automatic progression
    pub async fn fail(&self, reason: impl Into<String>) -> Result<PipelineState> {
        let reason = reason.into();
        self.unschedule_phases().await?;
        let (phase, state) = self
            .repo
            .update(|s| {
                s.fail(reason.clone());
                Ok(s.phase)
            })
            .await?;
        error!("Pipeline failed in {:?}: {}", phase, reason);
        self.publish(PipelineEvent::PipelineFailed { phase, reason });
        Ok(state)
    }

    /// Move from `expected` to the next phase. No-op (returns `false`) if the
    /// pipeline already left `expected`.
    async fn complete_phase(&self, expected: Phase) -> Result<bool> {
        let (transition, _) = self
            .repo
            .update(|s| {
                if !s.is_running() || s.phase != Some(expected) {
                    return Ok(None);
                }
                let progress = s.phase_progress;
                let next = s.advance()?;
                Ok(Some((progress, next)))
            })
            .await?;

        let Some((progress, next)) = transition else {
            debug!("Phase {} already completed", expected);
            return Ok(false);
        };

        self.publish(PipelineEvent::PhaseCompleted {
            phase: expected,
            progress,
        });
        self.publish(PipelineEvent::PhaseChanged {
            from: expected,
            to: next,
        });
        match next {
            Some(phase) => {
                info!("Phase {} complete, advancing to {}", expected, phase);
                self.publish(PipelineEvent::PhaseStarted { phase });
                self.schedule_phase(phase).await?;
            }
            None => {
                info!("Pipeline completed");
                self.publish(PipelineEvent::PipelineCompleted);
            }
        }
        Ok(true)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Phase execution
    // ═══════════════════════════════════════════════════════════════════════

    /// Run one batch of `phase` and schedule what comes next.
    ///
    /// Backpressure and persistence errors are returned so the queue retries
    /// the job; anything else fails the pipeline.
    pub async fn run_phase(&self, phase: Phase) -> Result<()> {
        let state = self.repo.load().await?;
        if !state.is_running() || state.phase != Some(phase) {
            debug!("Ignoring stale {} job (status {})", phase, state.status);
            return Ok(());
        }

        let handler = self
            .handlers
            .get(&phase)
            .cloned()
            .ok_or_else(|| PipelineError::HandlerNotFound(phase.job_name()));
        let ctx = PhaseContext::new(self.services.clone(), state.config.unwrap_or_default());

        let started = Instant::now();
        let outcome = match handler {
            Ok(handler) => handler.run_batch(&ctx).await,
            Err(e) => Err(e),
        };

        let report = match outcome {
            Ok(report) => report,
            Err(e) if e.category().is_retryable() => {
                warn!("Phase {} batch aborted ({}): {}", phase, e.category(), e);
                return Err(e);
            }
            Err(e) => {
                self.fail(format!("{}: {}", phase, e)).await?;
                return Ok(());
            }
        };
        let elapsed = started.elapsed();

        #[cfg(feature = "metrics")]
        if let Some(metrics) = &self.services.metrics {
            metrics.observe_batch(phase, &report);
        }

        let (applied, _) = self
            .repo
            .update(|s| Ok(s.record_batch(phase, &report, elapsed)))
            .await?;
        if !applied {
            debug!("Discarding {} batch report: pipeline moved on", phase);
            return Ok(());
        }

        self.services.events.log(
            Some(phase),
            LogLevel::Debug,
            "Batch complete",
            serde_json::to_value(report).unwrap_or(Value::Null),
        );

        if self.handle_phase_complete().await? {
            return Ok(());
        }
        if report.exhausted {
            self.complete_phase(phase).await?;
        } else {
            self.schedule_phase(phase).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl JobHandler for PipelineOrchestrator {
    async fn run(&self, job_name: &str, _args: &Value) -> Result<()> {
        let phase = Phase::from_job_name(job_name)?;
        self.run_phase(phase).await
    }

    async fn on_retries_exhausted(
        &self,
        job_name: &str,
        _args: &Value,
        error: &PipelineError,
    ) -> Result<()> {
        self.fail(format!("{} gave up after retries: {}", job_name, error))
            .await?;
        Ok(())
    }
}
