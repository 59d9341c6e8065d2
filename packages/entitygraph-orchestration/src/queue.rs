//! Durable task queue port and the worker loop that drains it
//!
//! Jobs are addressed by name and carry a JSON argument payload. The worker
//! dispatches due tasks to registered [`JobHandler`]s, retrying failed
//! invocations with exponential backoff until the [`RetryPolicy`] runs out.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{PipelineError, Result};

/// A scheduled job invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledTask {
    pub id: Uuid,
    pub run_at: DateTime<Utc>,
    pub job_name: String,
    pub args: Value,
    pub group: String,
    /// Failed attempts so far
    pub attempt: u32,
}

impl ScheduledTask {
    pub fn new(run_at: DateTime<Utc>, job_name: &str, args: Value, group: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            run_at,
            job_name: job_name.to_string(),
            args,
            group: group.to_string(),
            attempt: 0,
        }
    }

    /// Every key of `filter` is present in the args with an equal value
    pub fn matches_args(&self, filter: &Value) -> bool {
        match (filter, &self.args) {
            (Value::Object(wanted), Value::Object(actual)) => wanted
                .iter()
                .all(|(key, value)| actual.get(key) == Some(value)),
            (wanted, actual) => wanted == actual,
        }
    }
}

#[async_trait]
pub trait TaskQueue: Send + Sync {
    async fn schedule(
        &self,
        when: DateTime<Utc>,
        job_name: &str,
        args: Value,
        group: &str,
    ) -> Result<Uuid>;

    /// Remove pending tasks of `job_name`, optionally only those whose args
    /// match `args_filter`. Returns the number removed.
    async fn unschedule_all(&self, job_name: &str, args_filter: Option<&Value>) -> Result<usize>;

    /// Pending tasks, optionally for one job name, in execution order
    async fn pending(&self, job_name: Option<&str>) -> Result<Vec<ScheduledTask>>;

    /// Pop the next task due at or before `now`
    async fn next_due(&self, now: DateTime<Utc>) -> Result<Option<ScheduledTask>>;

    /// Put a task back, typically with a later `run_at` after a failure
    async fn requeue(&self, task: ScheduledTask) -> Result<()>;
}

/// In-process queue ordered by due time, then insertion
#[derive(Default)]
pub struct InMemoryTaskQueue {
    tasks: Mutex<Vec<(u64, ScheduledTask)>>,
    sequence: Mutex<u64>,
}

impl InMemoryTaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_sequence(&self) -> u64 {
        let mut seq = self.sequence.lock();
        *seq += 1;
        *seq
    }

    pub fn len(&self) -> usize {
        self.tasks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.lock().is_empty()
    }
}

#[async_trait]
impl TaskQueue for InMemoryTaskQueue {
    async fn schedule(
        &self,
        when: DateTime<Utc>,
        job_name: &str,
        args: Value,
        group: &str,
    ) -> Result<Uuid> {
        let task = ScheduledTask::new(when, job_name, args, group);
        let id = task.id;
        let seq = self.next_sequence();
        self.tasks.lock().push((seq, task));
        debug!("Scheduled {} ({}) at {}", job_name, id, when);
        Ok(id)
    }

    async fn unschedule_all(&self, job_name: &str, args_filter: Option<&Value>) -> Result<usize> {
        let mut tasks = self.tasks.lock();
        let before = tasks.len();
        tasks.retain(|(_, task)| {
            let matches = task.job_name == job_name
                && args_filter.map_or(true, |filter| task.matches_args(filter));
            !matches
        });
        Ok(before - tasks.len())
    }

    async fn pending(&self, job_name: Option<&str>) -> Result<Vec<ScheduledTask>> {
        let mut tasks: Vec<(u64, ScheduledTask)> = self
            .tasks
            .lock()
            .iter()
            .filter(|(_, task)| job_name.map_or(true, |name| task.job_name == name))
            .cloned()
            .collect();
        tasks.sort_by(|a, b| a.1.run_at.cmp(&b.1.run_at).then(a.0.cmp(&b.0)));
        Ok(tasks.into_iter().map(|(_, task)| task).collect())
    }

    async fn next_due(&self, now: DateTime<Utc>) -> Result<Option<ScheduledTask>> {
        let mut tasks = self.tasks.lock();
        let next = tasks
            .iter()
            .enumerate()
            .filter(|(_, (_, task))| task.run_at <= now)
            .min_by(|(_, a), (_, b)| a.1.run_at.cmp(&b.1.run_at).then(a.0.cmp(&b.0)))
            .map(|(index, _)| index);
        Ok(next.map(|index| tasks.remove(index).1))
    }

    async fn requeue(&self, task: ScheduledTask) -> Result<()> {
        let seq = self.next_sequence();
        self.tasks.lock().push((seq, task));
        Ok(())
    }
}

/// Retry with exponential backoff
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct RetryPolicy {
    /// Total attempts including the first
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 1000,
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let millis = self.base_delay_ms as f64 * self.multiplier.powi(exponent);
        Duration::from_millis(millis.min(u64::MAX as f64) as u64)
    }
}

/// Executes one job name
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn run(&self, job_name: &str, args: &Value) -> Result<()>;

    /// Called once when the final attempt failed
    async fn on_retries_exhausted(
        &self,
        _job_name: &str,
        _args: &Value,
        _error: &PipelineError,
    ) -> Result<()> {
        Ok(())
    }
}

/// Counters of one worker run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WorkerStats {
    pub executed: u64,
    pub failed: u64,
    pub retried: u64,
    pub exhausted: u64,
}

/// Long-running worker draining a [`TaskQueue`]
pub struct QueueWorker {
    queue: Arc<dyn TaskQueue>,
    handlers: HashMap<String, Arc<dyn JobHandler>>,
    policy: RetryPolicy,
    poll_interval: Duration,
    cancel: CancellationToken,
}

impl QueueWorker {
    pub fn new(queue: Arc<dyn TaskQueue>, policy: RetryPolicy) -> Self {
        Self {
            queue,
            handlers: HashMap::new(),
            policy,
            poll_interval: Duration::from_millis(250),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Register a handler for one job name
    pub fn register(&mut self, job_name: impl Into<String>, handler: Arc<dyn JobHandler>) {
        self.handlers.insert(job_name.into(), handler);
    }

    /// Token that stops `run` and `run_until_idle` when cancelled
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Execute one due task, if any. Returns whether a task was taken.
    pub async fn tick(&self, stats: &mut WorkerStats) -> Result<bool> {
        let Some(task) = self.queue.next_due(Utc::now()).await? else {
            return Ok(false);
        };
        self.dispatch(task, stats).await?;
        Ok(true)
    }

    async fn dispatch(&self, mut task: ScheduledTask, stats: &mut WorkerStats) -> Result<()> {
        let Some(handler) = self.handlers.get(&task.job_name).cloned() else {
            warn!("No handler for job '{}', dropping task {}", task.job_name, task.id);
            stats.failed += 1;
            return Ok(());
        };

        match handler.run(&task.job_name, &task.args).await {
            Ok(()) => {
                stats.executed += 1;
                Ok(())
            }
            Err(e) => {
                stats.failed += 1;
                task.attempt += 1;
                if task.attempt < self.policy.max_attempts {
                    let delay = self.policy.delay_for(task.attempt);
                    warn!(
                        "Job '{}' failed ({}, attempt {}/{}), retrying in {:?}: {}",
                        task.job_name,
                        e.category(),
                        task.attempt,
                        self.policy.max_attempts,
                        delay,
                        e
                    );
                    task.run_at = Utc::now()
                        + chrono::Duration::from_std(delay)
                            .unwrap_or_else(|_| chrono::Duration::seconds(1));
                    stats.retried += 1;
                    self.queue.requeue(task).await
                } else {
                    error!(
                        "Job '{}' failed after {} attempts: {}",
                        task.job_name, task.attempt, e
                    );
                    stats.exhausted += 1;
                    handler
                        .on_retries_exhausted(&task.job_name, &task.args, &e)
                        .await
                }
            }
        }
    }

    async fn wait(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }

    /// Drain the queue, including delayed retries, then return
    pub async fn run_until_idle(&self) -> Result<WorkerStats> {
        let mut stats = WorkerStats::default();
        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            if self.tick(&mut stats).await? {
                continue;
            }

            let pending = self.queue.pending(None).await?;
            let Some(next) = pending.first() else {
                break;
            };
            let until_due = (next.run_at - Utc::now())
                .to_std()
                .unwrap_or(Duration::ZERO)
                .min(self.poll_interval);
            if !self.wait(until_due).await {
                break;
            }
        }
        info!(
            "Worker idle: {} executed, {} failed, {} retried, {} exhausted",
            stats.executed, stats.failed, stats.retried, stats.exhausted
        );
        Ok(stats)
    }

    /// Poll forever until the cancellation token fires
    pub async fn run(&self) -> Result<WorkerStats> {
        let mut stats = WorkerStats::default();
        while !self.cancel.is_cancelled() {
            if !self.tick(&mut stats).await? && !self.wait(self.poll_interval).await {
                break;
            }
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingHandler {
        calls: AtomicU32,
        fail_first: u32,
        exhausted: AtomicU32,
    }

    impl CountingHandler {
        fn new(fail_first: u32) -> Self {
            Self {
                calls: AtomicU32::new(0),
                fail_first,
                exhausted: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl JobHandler for CountingHandler {
        async fn run(&self, _job_name: &str, _args: &Value) -> Result<()> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.fail_first {
                return Err(PipelineError::RateLimited("slow down".into()));
            }
            Ok(())
        }

        async fn on_retries_exhausted(
            &self,
            _job_name: &str,
            _args: &Value,
            _error: &PipelineError,
        ) -> Result<()> {
            self.exhausted.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay_ms: 1,
            multiplier: 2.0,
        }
    }

    #[tokio::test]
    async fn test_queue_order_and_unschedule_filter() {
        let queue = InMemoryTaskQueue::new();
        let now = Utc::now();
        queue
            .schedule(now, "propagate", json!({"entity_id": 1, "last_doc_id": 0}), "g")
            .await
            .unwrap();
        queue
            .schedule(now, "propagate", json!({"entity_id": 2, "last_doc_id": 0}), "g")
            .await
            .unwrap();
        queue
            .schedule(now - chrono::Duration::seconds(5), "phase", json!({}), "g")
            .await
            .unwrap();

        let pending = queue.pending(None).await.unwrap();
        assert_eq!(pending[0].job_name, "phase");
        assert_eq!(pending[1].args["entity_id"], 1);

        let removed = queue
            .unschedule_all("propagate", Some(&json!({"entity_id": 2})))
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(queue.pending(Some("propagate")).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_next_due_skips_future_tasks() {
        let queue = InMemoryTaskQueue::new();
        let now = Utc::now();
        queue
            .schedule(now + chrono::Duration::hours(1), "later", json!({}), "g")
            .await
            .unwrap();
        assert!(queue.next_due(now).await.unwrap().is_none());
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_backoff_delays() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::from_millis(1000));
        assert_eq!(policy.delay_for(2), Duration::from_millis(2000));
        assert_eq!(policy.delay_for(4), Duration::from_millis(8000));
    }

    #[tokio::test]
    async fn test_worker_retries_then_succeeds() {
        let queue: Arc<dyn TaskQueue> = Arc::new(InMemoryTaskQueue::new());
        let handler = Arc::new(CountingHandler::new(2));
        let mut worker = QueueWorker::new(queue.clone(), fast_policy(5))
            .with_poll_interval(Duration::from_millis(5));
        worker.register("job", handler.clone());

        queue.schedule(Utc::now(), "job", json!({}), "g").await.unwrap();
        let stats = worker.run_until_idle().await.unwrap();

        assert_eq!(stats.executed, 1);
        assert_eq!(stats.retried, 2);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
        assert_eq!(handler.exhausted.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_worker_exhausts_retries() {
        let queue: Arc<dyn TaskQueue> = Arc::new(InMemoryTaskQueue::new());
        let handler = Arc::new(CountingHandler::new(u32::MAX));
        let mut worker = QueueWorker::new(queue.clone(), fast_policy(3))
            .with_poll_interval(Duration::from_millis(5));
        worker.register("job", handler.clone());

        queue.schedule(Utc::now(), "job", json!({}), "g").await.unwrap();
        let stats = worker.run_until_idle().await.unwrap();

        assert_eq!(stats.exhausted, 1);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
        assert_eq!(handler.exhausted.load(Ordering::SeqCst), 1);
        assert!(queue.pending(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_worker_stops() {
        let queue: Arc<dyn TaskQueue> = Arc::new(InMemoryTaskQueue::new());
        let worker = QueueWorker::new(queue.clone(), fast_policy(1));
        queue
            .schedule(Utc::now() + chrono::Duration::hours(1), "job", json!({}), "g")
            .await
            .unwrap();

        worker.cancellation_token().cancel();
        let stats = worker.run().await.unwrap();
        assert_eq!(stats, WorkerStats::default());
    }
}
