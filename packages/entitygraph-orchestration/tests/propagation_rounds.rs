//! Chain-link propagation driven through the queue worker

mod common;

use common::Harness;
use entitygraph_orchestration::{PipelineEvent, PropagationArgs, TaskQueue, PROPAGATION_JOB};
use entitygraph_storage::{EntityType, NewMention};
use std::collections::HashMap;

fn empty_harness() -> Harness {
    Harness::new(vec![], HashMap::new())
}

fn batches(h: &Harness) -> Vec<(usize, i64)> {
    h.events
        .events()
        .into_iter()
        .filter_map(|e| match e {
            PipelineEvent::PropagationBatch {
                documents, cursor, ..
            } => Some((documents, cursor)),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_walks_mentions_in_bounded_rounds() {
    let h = empty_harness();
    let store = &h.services.store;
    let id = store
        .upsert_entity("Rust", EntityType::Technology, &[])
        .await
        .unwrap();
    for doc in 1..=120 {
        store.link_mention(&NewMention::new(id, doc, 0.8)).await.unwrap();
    }

    h.propagation.schedule(id, 0).await.unwrap();
    h.worker.run_until_idle().await.unwrap();

    assert_eq!(batches(&h), vec![(50, 50), (50, 100), (20, 120)]);
    assert_eq!(h.materializer.total_regenerations(), 120);
    assert_eq!(h.materializer.regenerations(77), 1);

    let complete: Vec<(u32, u64)> = h
        .events
        .events()
        .into_iter()
        .filter_map(|e| match e {
            PipelineEvent::PropagationComplete {
                rounds, documents, ..
            } => Some((rounds, documents)),
            _ => None,
        })
        .collect();
    assert_eq!(complete, vec![(3, 120)]);
    assert!(!h.propagation.status(id).await.unwrap().is_propagating);
}

#[tokio::test]
async fn test_entity_without_mentions_completes_immediately() {
    let h = empty_harness();
    let id = h
        .services
        .store
        .upsert_entity("Lonely", EntityType::Concept, &[])
        .await
        .unwrap();

    h.propagation.schedule(id, 0).await.unwrap();
    h.worker.run_until_idle().await.unwrap();

    assert!(batches(&h).is_empty());
    assert_eq!(h.events.count("propagation_complete"), 1);
    assert_eq!(h.materializer.total_regenerations(), 0);
}

#[tokio::test]
async fn test_cancel_between_rounds_stops_the_walk() {
    let h = empty_harness();
    let store = &h.services.store;
    let id = store
        .upsert_entity("Tokio", EntityType::Technology, &[])
        .await
        .unwrap();
    for doc in 1..=60 {
        store.link_mention(&NewMention::new(id, doc, 0.8)).await.unwrap();
    }

    h.propagation.schedule(id, 0).await.unwrap();
    let mut stats = Default::default();
    h.worker.tick(&mut stats).await.unwrap();
    assert_eq!(h.propagation.status(id).await.unwrap().cursor, 50);

    assert!(h.propagation.cancel(id).await.unwrap());
    assert!(h.queue.pending(Some(PROPAGATION_JOB)).await.unwrap().is_empty());
    h.worker.run_until_idle().await.unwrap();

    assert_eq!(h.materializer.total_regenerations(), 50);
    assert_eq!(h.events.count("propagation_complete"), 0);
}

#[tokio::test]
async fn test_first_round_dequeued_before_cancel_does_nothing() {
    let h = empty_harness();
    let store = &h.services.store;
    let id = store
        .upsert_entity("Axum", EntityType::Technology, &[])
        .await
        .unwrap();
    store.link_mention(&NewMention::new(id, 2, 0.8)).await.unwrap();

    h.propagation.schedule(id, 0).await.unwrap();
    assert!(h.propagation.cancel(id).await.unwrap());

    // a worker that picked up the first round before the cancel still runs it
    h.propagation
        .run_round(PropagationArgs {
            entity_id: id,
            last_doc_id: 0,
        })
        .await
        .unwrap();

    assert!(!h.propagation.status(id).await.unwrap().is_propagating);
    assert!(h.queue.pending(Some(PROPAGATION_JOB)).await.unwrap().is_empty());
    assert_eq!(h.materializer.total_regenerations(), 0);
    assert_eq!(h.events.count("propagation_complete"), 0);
}

#[tokio::test]
async fn test_rescheduling_replaces_pending_round() {
    let h = empty_harness();
    let store = &h.services.store;
    let id = store
        .upsert_entity("Serde", EntityType::Technology, &[])
        .await
        .unwrap();
    for doc in 1..=3 {
        store.link_mention(&NewMention::new(id, doc, 0.8)).await.unwrap();
    }

    h.propagation.schedule(id, 0).await.unwrap();
    h.propagation.schedule(id, 0).await.unwrap();
    assert_eq!(h.queue.pending(Some(PROPAGATION_JOB)).await.unwrap().len(), 1);

    h.worker.run_until_idle().await.unwrap();
    assert_eq!(h.materializer.regenerations(2), 1);
}
