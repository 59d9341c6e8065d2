//! Full six-phase runs over small corpora

mod common;

use common::{candidate, document, fast_retry, Harness};
use entitygraph_orchestration::{Phase, PipelineStatus, RunConfig};
use entitygraph_storage::{slugify, EntityType};
use std::collections::HashMap;

#[tokio::test]
async fn test_variants_collapse_into_one_entity() {
    let docs = vec![
        document(1, "OpenAI ships a model", "OpenAI released a new model today."),
        document(2, "Funding news", "Investors backed openai again."),
    ];
    let candidates = HashMap::from([
        (1, vec![candidate("OpenAI", "organization", 0.9)]),
        (2, vec![candidate("openai", "organization", 0.6)]),
    ]);
    let h = Harness::new(docs, candidates);

    h.orchestrator.start(RunConfig::new("test")).await.unwrap();
    h.worker.run_until_idle().await.unwrap();

    let status = h.orchestrator.status().await.unwrap();
    assert_eq!(status.status, PipelineStatus::Completed);
    assert_eq!(status.percentage, 100.0);

    let store = &h.services.store;
    assert_eq!(store.count_entities().await.unwrap(), 1);
    let entity = store.find_by_slug("openai").await.unwrap().unwrap();
    assert_eq!(entity.name, "OpenAI");
    assert_eq!(entity.entity_type, EntityType::Organization);
    assert_eq!(entity.mention_count, 2);

    let aliases: Vec<String> = store
        .aliases_for(entity.id)
        .await
        .unwrap()
        .into_iter()
        .map(|a| a.alias)
        .collect();
    assert_eq!(aliases, vec!["openai".to_string()]);

    let mut confidences: Vec<(i64, f64)> = store
        .mentions_for_entity(entity.id)
        .await
        .unwrap()
        .into_iter()
        .map(|m| (m.document_id, m.confidence))
        .collect();
    confidences.sort_by_key(|(doc, _)| *doc);
    assert_eq!(confidences, vec![(1, 0.9), (2, 0.6)]);

    assert_eq!(h.materializer.regenerations(1), 1);
    assert_eq!(h.materializer.regenerations(2), 1);

    let snapshot = h.orchestrator.aggregate_snapshot().await.unwrap().unwrap();
    assert_eq!(snapshot.total_entities, 1);
    assert_eq!(snapshot.total_mentions, 2);

    assert_eq!(h.events.count("phase_completed"), Phase::ALL.len());
    assert_eq!(h.events.count("pipeline_completed"), 1);
}

#[tokio::test]
async fn test_legal_suffix_variants_share_an_entity() {
    let docs = vec![
        document(1, "Earnings", "Apple Inc. reported record revenue."),
        document(2, "Keynote", "Apple unveiled a headset."),
        document(3, "Supply chain", "Suppliers for apple inc expanded."),
    ];
    let candidates = HashMap::from([
        (1, vec![candidate("Apple Inc.", "organization", 0.95)]),
        (2, vec![candidate("Apple", "organization", 0.8)]),
        (3, vec![candidate("apple inc", "company", 0.7)]),
    ]);
    let h = Harness::new(docs, candidates);

    h.orchestrator.start(RunConfig::new("test")).await.unwrap();
    h.worker.run_until_idle().await.unwrap();

    let store = &h.services.store;
    assert_eq!(store.count_entities().await.unwrap(), 1);
    let ids = store.entity_ids_after(0, 10).await.unwrap();
    assert_eq!(store.mentions_for_entity(ids[0]).await.unwrap().len(), 3);
}

#[tokio::test]
async fn test_primary_entity_per_document() {
    let docs = vec![
        document(1, "Rust at work", "Rust and Tokio in production."),
        document(2, "Async Rust", "Rust futures explained."),
        document(3, "Rust tooling", "Cargo makes Rust builds easy."),
    ];
    let candidates = HashMap::from([
        (
            1,
            vec![
                candidate("Rust", "technology", 0.9),
                candidate("Tokio", "technology", 0.8),
            ],
        ),
        (2, vec![candidate("Rust", "technology", 0.9)]),
        (3, vec![candidate("Rust", "technology", 0.7)]),
    ]);
    let h = Harness::new(docs, candidates);

    h.orchestrator.start(RunConfig::new("test")).await.unwrap();
    h.worker.run_until_idle().await.unwrap();

    let entities = h.services.store.get_entities_for_post(1, 0.0).await.unwrap();
    assert_eq!(entities.len(), 2);
    assert_eq!(entities[0].entity.slug, slugify("Rust"));
    assert!(entities[0].is_primary);
    assert!(!entities[1].is_primary);
}

#[tokio::test]
async fn test_rate_limited_extraction_retries_and_completes() {
    let docs = vec![
        document(1, "OpenAI", "OpenAI released a new model today."),
        document(2, "Anthropic", "Anthropic published research."),
    ];
    let candidates = HashMap::from([
        (1, vec![candidate("OpenAI", "organization", 0.9)]),
        (2, vec![candidate("Anthropic", "organization", 0.9)]),
    ]);
    let h = Harness::build(docs, candidates, 2, fast_retry(5));

    h.orchestrator.start(RunConfig::new("test")).await.unwrap();
    let stats = h.worker.run_until_idle().await.unwrap();

    assert_eq!(stats.retried, 2);
    assert_eq!(stats.exhausted, 0);
    let status = h.orchestrator.status().await.unwrap();
    assert_eq!(status.status, PipelineStatus::Completed);
    assert_eq!(h.services.store.count_entities().await.unwrap(), 2);
}

#[tokio::test]
async fn test_restart_skips_already_extracted_documents() {
    let docs = vec![document(1, "OpenAI", "OpenAI released a new model today.")];
    let candidates = HashMap::from([(1, vec![candidate("OpenAI", "organization", 0.9)])]);
    let h = Harness::new(docs, candidates);

    h.orchestrator.start(RunConfig::new("first")).await.unwrap();
    h.worker.run_until_idle().await.unwrap();
    assert_eq!(h.extractor.calls(), 1);

    let state = h.orchestrator.start(RunConfig::new("second")).await.unwrap();
    assert_eq!(state.phase, Some(Phase::Preparation));
    assert_eq!(state.pipeline.completed, 0);
    h.worker.run_until_idle().await.unwrap();

    let status = h.orchestrator.status().await.unwrap();
    assert_eq!(status.status, PipelineStatus::Completed);
    assert_eq!(h.extractor.calls(), 1);
    assert_eq!(h.services.store.count_entities().await.unwrap(), 1);

    h.orchestrator
        .start(RunConfig::new("forced").with_force(true))
        .await
        .unwrap();
    h.worker.run_until_idle().await.unwrap();
    assert_eq!(h.extractor.calls(), 2);
    assert_eq!(h.services.store.count_entities().await.unwrap(), 1);
}

#[tokio::test]
async fn test_short_and_unpublished_documents_are_left_out() {
    let mut draft = document(2, "Draft", "Tokio internals.");
    draft.status = "draft".to_string();
    let mut short = document(3, "", "");
    short.raw_body = "<p>Hi</p>".to_string();
    let docs = vec![document(1, "Rust", "Rust 2024 edition lands."), draft, short];
    let candidates = HashMap::from([
        (1, vec![candidate("Rust", "technology", 0.9)]),
        (2, vec![candidate("Tokio", "technology", 0.9)]),
    ]);
    let h = Harness::new(docs, candidates);

    h.orchestrator.start(RunConfig::new("test")).await.unwrap();
    h.worker.run_until_idle().await.unwrap();

    assert_eq!(h.extractor.calls(), 1);
    assert_eq!(h.services.store.count_entities().await.unwrap(), 1);
    assert!(h.services.store.find_by_slug("tokio").await.unwrap().is_none());
}
