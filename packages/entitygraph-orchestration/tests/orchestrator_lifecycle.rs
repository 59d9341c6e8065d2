//! Start / pause / resume / stop / failure behaviour across worker ticks

mod common;

use common::{candidate, document, fast_retry, Harness};
use entitygraph_orchestration::{
    Phase, PipelineError, PipelineStatus, RunConfig, TaskQueue, WorkerStats,
};
use std::collections::HashMap;

fn corpus(n: i64) -> Harness {
    let docs = (1..=n)
        .map(|id| document(id, &format!("Post {}", id), &format!("Topic{} news.", id)))
        .collect();
    let candidates = (1..=n)
        .map(|id| (id, vec![candidate(&format!("Topic{}", id), "concept", 0.8)]))
        .collect::<HashMap<_, _>>();
    Harness::new(docs, candidates)
}

#[tokio::test]
async fn test_pause_and_resume_continue_from_cursor() {
    let h = corpus(5);
    h.orchestrator
        .start(RunConfig::new("test").with_batch_size(2))
        .await
        .unwrap();

    let mut stats = WorkerStats::default();
    assert!(h.worker.tick(&mut stats).await.unwrap());
    let state = h.orchestrator.state().await.unwrap();
    assert_eq!(state.phase, Some(Phase::Preparation));
    assert_eq!(state.phase_progress.completed, 2);

    let paused = h.orchestrator.pause().await.unwrap();
    assert_eq!(paused.status, PipelineStatus::Paused);
    assert!(h.queue.pending(None).await.unwrap().is_empty());

    h.orchestrator.resume().await.unwrap();
    h.worker.run_until_idle().await.unwrap();

    let status = h.orchestrator.status().await.unwrap();
    assert_eq!(status.status, PipelineStatus::Completed);
    assert_eq!(h.extractor.calls(), 5);
    assert_eq!(h.services.store.count_entities().await.unwrap(), 5);
}

#[tokio::test]
async fn test_resume_requires_paused() {
    let h = corpus(1);
    let err = h.orchestrator.resume().await.unwrap_err();
    assert!(matches!(err, PipelineError::InvalidStateTransition { .. }));
}

#[tokio::test]
async fn test_stop_discards_pending_batches() {
    let h = corpus(4);
    h.orchestrator
        .start(RunConfig::new("test").with_batch_size(1))
        .await
        .unwrap();

    let mut stats = WorkerStats::default();
    h.worker.tick(&mut stats).await.unwrap();
    let stopped = h.orchestrator.stop().await.unwrap();
    assert_eq!(stopped.status, PipelineStatus::Idle);
    assert_eq!(stopped.phase, Some(Phase::Preparation));
    assert!(h.queue.pending(None).await.unwrap().is_empty());

    h.worker.run_until_idle().await.unwrap();
    assert_eq!(h.extractor.calls(), 0);
    assert_eq!(h.events.count("pipeline_stopped"), 1);
}

#[tokio::test]
async fn test_progress_counts_every_phase() {
    let h = corpus(3);
    h.orchestrator.start(RunConfig::new("test")).await.unwrap();
    h.worker.run_until_idle().await.unwrap();

    let state = h.orchestrator.state().await.unwrap();
    assert_eq!(state.status, PipelineStatus::Completed);
    assert!(state.completed_at.is_some());
    assert_eq!(state.pipeline.failed, 0);
    assert!(state.pipeline.completed >= 3 * 5);
}

#[tokio::test]
async fn test_persistent_rate_limit_fails_pipeline() {
    let docs = vec![document(1, "OpenAI", "OpenAI released a new model today.")];
    let candidates = HashMap::from([(1, vec![candidate("OpenAI", "organization", 0.9)])]);
    let h = Harness::build(docs, candidates, u32::MAX, fast_retry(3));

    h.orchestrator.start(RunConfig::new("test")).await.unwrap();
    let stats = h.worker.run_until_idle().await.unwrap();
    assert_eq!(stats.exhausted, 1);
    assert_eq!(stats.retried, 2);

    let status = h.orchestrator.status().await.unwrap();
    assert_eq!(status.status, PipelineStatus::Failed);
    assert_eq!(status.phase, Some(Phase::Extraction));
    assert!(status.last_error.unwrap().contains("Rate limited"));
    assert_eq!(h.events.count("pipeline_failed"), 1);

    // a fresh start is allowed after failure
    h.orchestrator.start(RunConfig::new("retry")).await.unwrap();
}
