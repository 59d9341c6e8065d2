//! Pipeline phases and the pipeline state machine

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{PipelineError, Result};

/// Job name prefix shared by every phase job
pub const PHASE_JOB_PREFIX: &str = "entitygraph_phase_";

/// Weight of the newest sample in the average item time
const ITEM_TIME_ALPHA: f64 = 0.2;

/// The six ordered pipeline phases
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Preparation,
    Extraction,
    Deduplication,
    Linking,
    Indexing,
    Materialization,
}

impl Phase {
    pub const ALL: [Phase; 6] = [
        Phase::Preparation,
        Phase::Extraction,
        Phase::Deduplication,
        Phase::Linking,
        Phase::Indexing,
        Phase::Materialization,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Preparation => "preparation",
            Phase::Extraction => "extraction",
            Phase::Deduplication => "deduplication",
            Phase::Linking => "linking",
            Phase::Indexing => "indexing",
            Phase::Materialization => "materialization",
        }
    }

    pub fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| PipelineError::parse(format!("Invalid phase: {}", s)))
    }

    /// 1-based position in the pipeline
    pub fn ordinal(&self) -> usize {
        match self {
            Phase::Preparation => 1,
            Phase::Extraction => 2,
            Phase::Deduplication => 3,
            Phase::Linking => 4,
            Phase::Indexing => 5,
            Phase::Materialization => 6,
        }
    }

    pub fn next(&self) -> Option<Phase> {
        Self::ALL.get(self.ordinal()).copied()
    }

    pub fn job_name(&self) -> String {
        format!("{}{}", PHASE_JOB_PREFIX, self.as_str())
    }

    pub fn from_job_name(name: &str) -> Result<Self> {
        let phase = name
            .strip_prefix(PHASE_JOB_PREFIX)
            .ok_or_else(|| PipelineError::parse(format!("Not a phase job: {}", name)))?;
        Self::from_str(phase)
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    #[default]
    Idle,
    Running,
    Paused,
    Completed,
    Failed,
}

impl PipelineStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineStatus::Idle => "idle",
            PipelineStatus::Running => "running",
            PipelineStatus::Paused => "paused",
            PipelineStatus::Completed => "completed",
            PipelineStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for PipelineStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Configuration snapshot taken at `start()`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    /// Only documents of this content type are eligible
    pub content_type: Option<String>,
    pub batch_size: usize,
    /// Re-extract documents that were extracted by an earlier run
    pub force: bool,
    pub started_by: String,
    pub started_at: DateTime<Utc>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            content_type: None,
            batch_size: 10,
            force: false,
            started_by: "system".to_string(),
            started_at: Utc::now(),
        }
    }
}

impl RunConfig {
    pub fn new(started_by: impl Into<String>) -> Self {
        Self {
            started_by: started_by.into(),
            ..Default::default()
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressCounters {
    pub total: u64,
    pub completed: u64,
    pub failed: u64,
    pub skipped: u64,
}

impl ProgressCounters {
    pub fn handled(&self) -> u64 {
        self.completed + self.failed + self.skipped
    }

    /// Share of `total` handled so far, in `[0, 1]`
    pub fn fraction(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            (self.handled() as f64 / self.total as f64).min(1.0)
        }
    }
}

/// Outcome of one phase batch, applied to the state by the orchestrator
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchReport {
    pub processed: u64,
    pub failed: u64,
    pub skipped: u64,
    /// Phase backlog size as currently known
    pub total: u64,
    /// No work remains for this phase
    pub exhausted: bool,
    /// Batch size the next invocation will use
    pub batch_size: usize,
}

impl BatchReport {
    pub fn items(&self) -> u64 {
        self.processed + self.failed + self.skipped
    }
}

/// Persistent pipeline state
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineState {
    pub status: PipelineStatus,
    pub phase: Option<Phase>,
    pub pipeline: ProgressCounters,
    pub phase_progress: ProgressCounters,
    pub current_batch: u64,
    pub total_batches: u64,
    /// Exponential moving average of seconds per item
    pub avg_item_secs: f64,
    pub config: Option<RunConfig>,
    pub last_error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Bumped on every write; used for optimistic concurrency
    pub version: u64,
}

impl PipelineState {
    pub fn is_running(&self) -> bool {
        self.status == PipelineStatus::Running
    }

    fn phase_name(&self) -> String {
        self.phase
            .map(|p| p.as_str().to_string())
            .unwrap_or_else(|| "none".to_string())
    }

    /// Transition: any non-running status → RUNNING at PREPARATION
    pub fn begin(&mut self, config: RunConfig) -> Result<()> {
        if self.is_running() {
            return Err(PipelineError::AlreadyRunning {
                phase: self.phase_name(),
            });
        }
        let now = Utc::now();
        *self = PipelineState {
            status: PipelineStatus::Running,
            phase: Some(Phase::Preparation),
            config: Some(config),
            started_at: Some(now),
            updated_at: Some(now),
            version: self.version,
            ..Default::default()
        };
        Ok(())
    }

    /// Transition: RUNNING(phase) → RUNNING(next) or COMPLETED after the last phase.
    ///
    /// Returns the new phase, `None` once the pipeline completed.
    pub fn advance(&mut self) -> Result<Option<Phase>> {
        let current = match (self.status, self.phase) {
            (PipelineStatus::Running, Some(phase)) => phase,
            _ => {
                return Err(PipelineError::InvalidStateTransition {
                    from: format!("{}/{}", self.status, self.phase_name()),
                    to: "next phase".to_string(),
                })
            }
        };

        let now = Utc::now();
        let next = current.next();
        self.phase = next;
        self.phase_progress = ProgressCounters::default();
        self.current_batch = 0;
        self.total_batches = 0;
        self.updated_at = Some(now);
        if next.is_none() {
            self.status = PipelineStatus::Completed;
            self.completed_at = Some(now);
        }
        Ok(next)
    }

    /// Transition: any → IDLE. Phase and counters are kept for inspection.
    pub fn stop(&mut self) {
        self.status = PipelineStatus::Idle;
        self.updated_at = Some(Utc::now());
    }

    /// Transition: RUNNING → PAUSED
    pub fn pause(&mut self) -> Result<()> {
        if !self.is_running() {
            return Err(PipelineError::InvalidStateTransition {
                from: self.status.to_string(),
                to: "paused".to_string(),
            });
        }
        self.status = PipelineStatus::Paused;
        self.updated_at = Some(Utc::now());
        Ok(())
    }

    /// Transition: PAUSED → RUNNING
    pub fn resume(&mut self) -> Result<Phase> {
        match (self.status, self.phase) {
            (PipelineStatus::Paused, Some(phase)) => {
                self.status = PipelineStatus::Running;
                self.updated_at = Some(Utc::now());
                Ok(phase)
            }
            _ => Err(PipelineError::InvalidStateTransition {
                from: self.status.to_string(),
                to: "running".to_string(),
            }),
        }
    }

    /// Transition: any → FAILED
    pub fn fail(&mut self, reason: impl Into<String>) {
        self.status = PipelineStatus::Failed;
        self.last_error = Some(reason.into());
        self.updated_at = Some(Utc::now());
    }

    /// Fold one batch outcome into the counters.
    ///
    /// Ignored (returns `false`) unless the pipeline is still running `phase`,
    /// so a batch finishing after `stop()` cannot resurrect old counters.
    pub fn record_batch(&mut self, phase: Phase, report: &BatchReport, elapsed: Duration) -> bool {
        if !self.is_running() || self.phase != Some(phase) {
            return false;
        }

        let previous_total = self.phase_progress.total;
        self.phase_progress.total = report.total;
        self.phase_progress.completed += report.processed;
        self.phase_progress.failed += report.failed;
        self.phase_progress.skipped += report.skipped;

        self.pipeline.total = (self.pipeline.total + report.total).saturating_sub(previous_total);
        self.pipeline.completed += report.processed;
        self.pipeline.failed += report.failed;
        self.pipeline.skipped += report.skipped;

        self.current_batch += 1;
        let remaining = report
            .total
            .saturating_sub(self.phase_progress.handled());
        let per_batch = report.batch_size.max(1) as u64;
        self.total_batches = self.current_batch + remaining.div_ceil(per_batch);

        let items = report.items();
        if items > 0 {
            let sample = elapsed.as_secs_f64() / items as f64;
            self.avg_item_secs = if self.avg_item_secs == 0.0 {
                sample
            } else {
                ITEM_TIME_ALPHA * sample + (1.0 - ITEM_TIME_ALPHA) * self.avg_item_secs
            };
        }

        self.updated_at = Some(Utc::now());
        true
    }

    /// Overall progress in percent
    pub fn percentage(&self) -> f64 {
        match (self.status, self.phase) {
            (PipelineStatus::Completed, _) => 100.0,
            (_, Some(phase)) => {
                let done = (phase.ordinal() - 1) as f64 + self.phase_progress.fraction();
                done / Phase::ALL.len() as f64 * 100.0
            }
            (_, None) => 0.0,
        }
    }

    /// Soft barrier: every item of the current phase is accounted for
    pub fn phase_counts_complete(&self) -> bool {
        self.phase_progress.completed + self.phase_progress.failed >= self.phase_progress.total
    }
}
