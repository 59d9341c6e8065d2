//! Chain-link propagation
//!
//! After an entity edit every document mentioning the entity must have its
//! cached representation rebuilt. Propagation walks those documents in
//! ascending id order, one bounded round per job invocation, re-enqueueing
//! itself with the advanced cursor until a round finds nothing left.
//!
//! A TTL marker per entity records the cursor; `cancel` deletes it, and an
//! invocation that finds its marker gone stops. Mentions added behind the
//! cursor while a walk is in flight are picked up by later rounds, so a walk
//! over an entity that keeps gaining mentions may not finish.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use entitygraph_storage::{DocumentId, EntityId};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{PipelineError, Result};
use crate::events::PipelineEvent;
use crate::pipeline::PipelineServices;
use crate::queue::{JobHandler, QueueWorker, TaskQueue};

pub const PROPAGATION_JOB: &str = "entitygraph_propagate";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropagationArgs {
    pub entity_id: EntityId,
    pub last_doc_id: DocumentId,
}

/// Per-entity in-flight marker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropagationMarker {
    pub started_at: DateTime<Utc>,
    pub cursor: DocumentId,
    pub rounds: u32,
    pub documents: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PropagationStatus {
    pub entity_id: EntityId,
    pub is_propagating: bool,
    pub cursor: DocumentId,
    pub started_at: Option<DateTime<Utc>>,
    pub rounds: u32,
}

pub struct PropagationEngine {
    services: Arc<PipelineServices>,
    queue: Arc<dyn TaskQueue>,
}

impl PropagationEngine {
    pub fn new(services: Arc<PipelineServices>, queue: Arc<dyn TaskQueue>) -> Self {
        Self { services, queue }
    }

    pub fn register_jobs(self: &Arc<Self>, worker: &mut QueueWorker) {
        worker.register(PROPAGATION_JOB, self.clone());
    }

    fn marker_key(entity_id: EntityId) -> String {
        format!("entitygraph:propagation:{}", entity_id)
    }

    fn entity_filter(entity_id: EntityId) -> Value {
        json!({ "entity_id": entity_id })
    }

    async fn load_marker(&self, entity_id: EntityId) -> Result<Option<PropagationMarker>> {
        match self.services.ttl.get(&Self::marker_key(entity_id)).await? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn save_marker(&self, entity_id: EntityId, marker: &PropagationMarker) -> Result<()> {
        let ttl = Duration::from_secs(self.services.settings.propagation.marker_ttl_secs);
        self.services
            .ttl
            .set_with_ttl(&Self::marker_key(entity_id), bincode::serialize(marker)?, ttl)
            .await?;
        Ok(())
    }

    async fn enqueue(&self, args: PropagationArgs) -> Result<()> {
        let payload = serde_json::to_value(args)?;
        self.queue
            .schedule(
                Utc::now(),
                PROPAGATION_JOB,
                payload,
                &self.services.settings.queue.group,
            )
            .await?;
        Ok(())
    }

    /// Start (or restart) propagation for `entity_id` after `last_doc_id`
    pub async fn schedule(&self, entity_id: EntityId, last_doc_id: DocumentId) -> Result<()> {
        self.queue
            .unschedule_all(PROPAGATION_JOB, Some(&Self::entity_filter(entity_id)))
            .await?;
        let marker = PropagationMarker {
            started_at: Utc::now(),
            cursor: last_doc_id,
            rounds: 0,
            documents: 0,
        };
        self.save_marker(entity_id, &marker).await?;
        self.enqueue(PropagationArgs {
            entity_id,
            last_doc_id,
        })
        .await?;
        debug!("Propagation scheduled for entity {} after document {}", entity_id, last_doc_id);
        Ok(())
    }

    /// Stop propagation for `entity_id`: drop the marker and pending rounds
    pub async fn cancel(&self, entity_id: EntityId) -> Result<bool> {
        let was_running = self.load_marker(entity_id).await?.is_some();
        self.services.ttl.delete(&Self::marker_key(entity_id)).await?;
        let removed = self
            .queue
            .unschedule_all(PROPAGATION_JOB, Some(&Self::entity_filter(entity_id)))
            .await?;
        if was_running || removed > 0 {
            info!("Propagation cancelled for entity {}", entity_id);
        }
        Ok(was_running || removed > 0)
    }

    pub async fn status(&self, entity_id: EntityId) -> Result<PropagationStatus> {
        let marker = self.load_marker(entity_id).await?;
        Ok(PropagationStatus {
            entity_id,
            is_propagating: marker.is_some(),
            cursor: marker.as_ref().map(|m| m.cursor).unwrap_or(0),
            started_at: marker.as_ref().map(|m| m.started_at),
            rounds: marker.map(|m| m.rounds).unwrap_or(0),
        })
    }

    /// One propagation round
    pub async fn run_round(&self, args: PropagationArgs) -> Result<()> {
        let PropagationArgs {
            entity_id,
            last_doc_id,
        } = args;

        // every round is enqueued behind a marker; none left means cancelled
        let Some(marker) = self.load_marker(entity_id).await? else {
            debug!("Propagation for entity {} was cancelled", entity_id);
            return Ok(());
        };

        let batch_size = self.services.settings.propagation.batch_size;
        let documents = self
            .services
            .store
            .documents_for_entity_after(entity_id, last_doc_id, batch_size)
            .await?;

        let Some(&cursor) = documents.last() else {
            self.services
                .ttl
                .delete(&Self::marker_key(entity_id))
                .await?;
            info!(
                "Propagation complete for entity {}: {} documents in {} rounds",
                entity_id, marker.documents, marker.rounds
            );
            self.services
                .events
                .publish(PipelineEvent::PropagationComplete {
                    entity_id,
                    rounds: marker.rounds,
                    documents: marker.documents,
                });
            return Ok(());
        };

        let mut failed = 0;
        for &document_id in &documents {
            if let Err(e) = self.services.materializer.regenerate(document_id).await {
                warn!(
                    "Propagation: regenerate document {} for entity {} failed: {}",
                    document_id, entity_id, e
                );
                failed += 1;
            }
        }

        // cancelled while this round ran
        if self.load_marker(entity_id).await?.is_none() {
            debug!("Propagation for entity {} cancelled mid-round", entity_id);
            return Ok(());
        }

        let updated = PropagationMarker {
            cursor,
            rounds: marker.rounds + 1,
            documents: marker.documents + documents.len() as u64,
            ..marker
        };
        self.save_marker(entity_id, &updated).await?;

        #[cfg(feature = "metrics")]
        if let Some(metrics) = &self.services.metrics {
            metrics.propagation_rounds.inc();
        }
        self.services.events.publish(PipelineEvent::PropagationBatch {
            entity_id,
            documents: documents.len(),
            failed,
            cursor,
        });

        self.enqueue(PropagationArgs {
            entity_id,
            last_doc_id: cursor,
        })
        .await
    }
}

#[async_trait]
impl JobHandler for PropagationEngine {
    async fn run(&self, job_name: &str, args: &Value) -> Result<()> {
        let args: PropagationArgs = serde_json::from_value(args.clone())
            .map_err(|e| PipelineError::invalid_arguments(job_name, e.to_string()))?;
        self.run_round(args).await
    }

    async fn on_retries_exhausted(
        &self,
        _job_name: &str,
        args: &Value,
        error: &PipelineError,
    ) -> Result<()> {
        if let Ok(args) = serde_json::from_value::<PropagationArgs>(args.clone()) {
            warn!(
                "Propagation for entity {} abandoned at document {}: {}",
                args.entity_id, args.last_doc_id, error
            );
            self.services
                .ttl
                .delete(&Self::marker_key(args.entity_id))
                .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{services_in_memory, FixtureExtractor, StaticContentSource};
    use crate::queue::InMemoryTaskQueue;
    use entitygraph_storage::{EntityType, NewMention};

    async fn engine() -> (PropagationEngine, Arc<InMemoryTaskQueue>, EntityId) {
        let services = Arc::new(services_in_memory(
            StaticContentSource::default(),
            FixtureExtractor::new(),
        ));
        let id = services
            .store
            .upsert_entity("Rust", EntityType::Technology, &[])
            .await
            .unwrap();
        let queue = Arc::new(InMemoryTaskQueue::new());
        (PropagationEngine::new(services, queue.clone()), queue, id)
    }

    #[tokio::test]
    async fn test_schedule_writes_marker_and_job() {
        let (engine, queue, id) = engine().await;
        engine.schedule(id, 0).await.unwrap();
        engine.schedule(id, 0).await.unwrap();

        let status = engine.status(id).await.unwrap();
        assert!(status.is_propagating);
        assert_eq!(status.cursor, 0);
        assert_eq!(queue.pending(Some(PROPAGATION_JOB)).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_cancel_drops_marker_and_pending_round() {
        let (engine, queue, id) = engine().await;
        engine.schedule(id, 0).await.unwrap();
        assert!(engine.cancel(id).await.unwrap());
        assert!(!engine.status(id).await.unwrap().is_propagating);
        assert!(queue.is_empty());
        assert!(!engine.cancel(id).await.unwrap());
    }

    #[tokio::test]
    async fn test_round_without_marker_after_start_is_ignored() {
        let (engine, queue, id) = engine().await;
        engine
            .services
            .store
            .link_mention(&NewMention::new(id, 9, 0.5))
            .await
            .unwrap();
        engine
            .run_round(PropagationArgs {
                entity_id: id,
                last_doc_id: 3,
            })
            .await
            .unwrap();
        assert!(queue.is_empty());
    }
}
