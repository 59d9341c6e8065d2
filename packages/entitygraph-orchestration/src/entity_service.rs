//! User edits of canonical entities
//!
//! Every edit that changes what a document shows schedules chain-link
//! propagation for the entity it touched.

use entitygraph_storage::{slugify, AliasSource, DocumentId, Entity, EntityId, EntityPatch};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::Result;
use crate::pipeline::PipelineServices;
use crate::propagation::PropagationEngine;

pub struct EntityService {
    services: Arc<PipelineServices>,
    propagation: Arc<PropagationEngine>,
}

impl EntityService {
    pub fn new(services: Arc<PipelineServices>, propagation: Arc<PropagationEngine>) -> Self {
        Self {
            services,
            propagation,
        }
    }

    pub async fn update_entity(&self, id: EntityId, patch: &EntityPatch) -> Result<Entity> {
        let entity = self.services.store.update_entity(id, patch).await?;
        self.propagation.schedule(id, 0).await?;
        Ok(entity)
    }

    /// Returns `false` when the alias already resolves somewhere
    pub async fn add_alias(&self, id: EntityId, alias: &str) -> Result<bool> {
        let added = self
            .services
            .store
            .register_alias(id, alias, AliasSource::Manual)
            .await?;
        if added {
            self.propagation.schedule(id, 0).await?;
        }
        Ok(added)
    }

    pub async fn remove_alias(&self, id: EntityId, alias: &str) -> Result<bool> {
        let removed = self.services.store.remove_alias(id, &slugify(alias)).await?;
        if removed {
            self.propagation.schedule(id, 0).await?;
        }
        Ok(removed)
    }

    /// Fold `sources` into `target`. Returns every document that referenced
    /// any of them.
    pub async fn merge_entities(
        &self,
        target: EntityId,
        sources: &[EntityId],
    ) -> Result<BTreeSet<DocumentId>> {
        let sources: Vec<EntityId> = sources.iter().copied().filter(|&s| s != target).collect();
        if sources.is_empty() {
            return Ok(BTreeSet::new());
        }

        let affected = self.services.store.merge_entities(target, &sources).await?;
        for &source in &sources {
            self.propagation.cancel(source).await?;
        }
        self.propagation.schedule(target, 0).await?;
        info!(
            "Merged {:?} into entity {} ({} documents affected)",
            sources,
            target,
            affected.len()
        );
        Ok(affected)
    }

    /// Hard delete. Cached representations of the affected documents are
    /// invalidated.
    pub async fn delete_entity(&self, id: EntityId) -> Result<BTreeSet<DocumentId>> {
        self.propagation.cancel(id).await?;
        let affected = self.services.store.delete_entity(id).await?;
        for &document_id in &affected {
            if let Err(e) = self.services.materializer.invalidate(document_id).await {
                warn!("Invalidate document {} failed: {}", document_id, e);
            }
        }
        info!("Deleted entity {} ({} documents invalidated)", id, affected.len());
        Ok(affected)
    }
}
