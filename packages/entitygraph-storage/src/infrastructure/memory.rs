//! In-memory adapters
//!
//! Same contract as the SQLite adapter, used for tests and throwaway runs.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::domain::kv::KeyValueStore;
use crate::domain::slug::slugify;
use crate::domain::union_find::MergeForest;
use crate::domain::{
    clamp_confidence, merge_mention, sort_document_entities, AggregateSnapshot, Alias, AliasId,
    AliasSource, CanonicalStore, ConfidenceStats, DocumentEntity, DocumentId, Entity, EntityId,
    EntityPatch, EntityStatus, EntityType, Mention, MentionId, NewMention, RankedDocument,
    RankedEntity,
};
use crate::{Result, StorageError};

#[derive(Default)]
struct Inner {
    entities: BTreeMap<EntityId, Entity>,
    slug_index: HashMap<String, EntityId>,
    aliases: BTreeMap<AliasId, Alias>,
    alias_index: HashMap<String, AliasId>,
    mentions: BTreeMap<MentionId, Mention>,
    mention_index: HashMap<(EntityId, DocumentId), MentionId>,
    forest: MergeForest,
    next_entity_id: EntityId,
    next_alias_id: AliasId,
    next_mention_id: MentionId,
}

impl Inner {
    fn alloc_entity_id(&mut self) -> EntityId {
        self.next_entity_id += 1;
        self.next_entity_id
    }

    fn alloc_alias_id(&mut self) -> AliasId {
        self.next_alias_id += 1;
        self.next_alias_id
    }

    fn alloc_mention_id(&mut self) -> MentionId {
        self.next_mention_id += 1;
        self.next_mention_id
    }

    fn register_alias(&mut self, entity_id: EntityId, alias: &str, source: AliasSource) -> bool {
        let alias_slug = slugify(alias);
        if alias_slug.is_empty() || self.alias_index.contains_key(&alias_slug) {
            return false;
        }
        let id = self.alloc_alias_id();
        self.aliases.insert(
            id,
            Alias {
                id,
                entity_id,
                alias: alias.trim().to_string(),
                alias_slug: alias_slug.clone(),
                source,
            },
        );
        self.alias_index.insert(alias_slug, id);
        true
    }

    fn mention_ids_for(&self, entity_id: EntityId) -> Vec<MentionId> {
        self.mentions
            .values()
            .filter(|m| m.entity_id == entity_id)
            .map(|m| m.id)
            .collect()
    }

    fn documents_for(&self, entity_id: EntityId) -> BTreeSet<DocumentId> {
        self.mentions
            .values()
            .filter(|m| m.entity_id == entity_id)
            .map(|m| m.document_id)
            .collect()
    }

    fn recount(&mut self, entity_id: EntityId) -> u64 {
        let count = self
            .mentions
            .values()
            .filter(|m| m.entity_id == entity_id)
            .count() as u64;
        if let Some(entity) = self.entities.get_mut(&entity_id) {
            entity.mention_count = count;
        }
        count
    }

    fn remove_mention(&mut self, mention_id: MentionId) -> Option<Mention> {
        let mention = self.mentions.remove(&mention_id)?;
        self.mention_index
            .remove(&(mention.entity_id, mention.document_id));
        Some(mention)
    }

    fn merge_one(&mut self, target: EntityId, source: EntityId) -> Result<()> {
        let source_entity = self
            .entities
            .get(&source)
            .cloned()
            .ok_or_else(|| StorageError::entity_not_found(source))?;

        // Re-point mentions, absorbing duplicates into the target edge
        for mention_id in self.mention_ids_for(source) {
            let Some(mention) = self.remove_mention(mention_id) else {
                continue;
            };
            match self.mention_index.get(&(target, mention.document_id)).copied() {
                Some(existing_id) => {
                    if let Some(existing) = self.mentions.get_mut(&existing_id) {
                        let incoming = NewMention {
                            entity_id: target,
                            document_id: mention.document_id,
                            confidence: mention.confidence,
                            context: mention.context.clone(),
                            is_primary: existing.is_primary || mention.is_primary,
                        };
                        merge_mention(existing, &incoming);
                    }
                }
                None => {
                    let mut moved = mention;
                    moved.entity_id = target;
                    self.mention_index
                        .insert((target, moved.document_id), moved.id);
                    self.mentions.insert(moved.id, moved);
                }
            }
        }

        // Re-point aliases
        for alias in self.aliases.values_mut() {
            if alias.entity_id == source {
                alias.entity_id = target;
            }
        }

        // The source's own name becomes an alias of the target
        self.register_alias(target, &source_entity.name, AliasSource::Machine);

        self.slug_index.remove(&source_entity.slug);
        self.entities.remove(&source);
        self.forest.union(source, target);
        Ok(())
    }
}

/// In-memory canonical store
#[derive(Default)]
pub struct InMemoryCanonicalStore {
    inner: RwLock<Inner>,
}

impl InMemoryCanonicalStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CanonicalStore for InMemoryCanonicalStore {
    async fn upsert_entity(
        &self,
        name: &str,
        entity_type: EntityType,
        aliases: &[String],
    ) -> Result<EntityId> {
        let slug = slugify(name);
        if slug.is_empty() {
            return Err(StorageError::constraint(format!(
                "Entity name '{}' has an empty slug",
                name
            )));
        }

        let mut inner = self.inner.write();
        let existing = inner
            .alias_index
            .get(&slug)
            .and_then(|alias_id| inner.aliases.get(alias_id))
            .map(|a| a.entity_id)
            .or_else(|| inner.slug_index.get(&slug).copied());

        let id = match existing {
            Some(id) => id,
            None => {
                let id = inner.alloc_entity_id();
                let now = Utc::now();
                inner.entities.insert(
                    id,
                    Entity {
                        id,
                        name: name.trim().to_string(),
                        slug: slug.clone(),
                        entity_type,
                        schema_type: None,
                        description: None,
                        same_as_url: None,
                        external_id: None,
                        status: EntityStatus::Raw,
                        mention_count: 0,
                        created_at: now,
                        updated_at: now,
                    },
                );
                inner.slug_index.insert(slug, id);
                id
            }
        };

        let canonical_name = inner
            .entities
            .get(&id)
            .map(|e| e.name.clone())
            .unwrap_or_default();
        for alias in aliases {
            if alias.trim() != canonical_name {
                inner.register_alias(id, alias, AliasSource::Machine);
            }
        }
        Ok(id)
    }

    async fn get_entity(&self, id: EntityId) -> Result<Option<Entity>> {
        Ok(self.inner.read().entities.get(&id).cloned())
    }

    async fn find_by_slug(&self, slug: &str) -> Result<Option<Entity>> {
        let inner = self.inner.read();
        Ok(inner
            .slug_index
            .get(slug)
            .and_then(|id| inner.entities.get(id))
            .cloned())
    }

    async fn update_entity(&self, id: EntityId, patch: &EntityPatch) -> Result<Entity> {
        let mut inner = self.inner.write();
        let entity = inner
            .entities
            .get_mut(&id)
            .ok_or_else(|| StorageError::entity_not_found(id))?;
        patch.apply(entity);
        Ok(entity.clone())
    }

    async fn delete_entity(&self, id: EntityId) -> Result<BTreeSet<DocumentId>> {
        let mut inner = self.inner.write();
        let entity = inner
            .entities
            .remove(&id)
            .ok_or_else(|| StorageError::entity_not_found(id))?;
        inner.slug_index.remove(&entity.slug);

        let documents = inner.documents_for(id);
        for mention_id in inner.mention_ids_for(id) {
            inner.remove_mention(mention_id);
        }

        let alias_ids: Vec<AliasId> = inner
            .aliases
            .values()
            .filter(|a| a.entity_id == id)
            .map(|a| a.id)
            .collect();
        for alias_id in alias_ids {
            if let Some(alias) = inner.aliases.remove(&alias_id) {
                inner.alias_index.remove(&alias.alias_slug);
            }
        }
        Ok(documents)
    }

    async fn canonical_id(&self, id: EntityId) -> Result<Option<EntityId>> {
        let mut inner = self.inner.write();
        let root = inner.forest.find(id);
        Ok(inner.entities.contains_key(&root).then_some(root))
    }

    async fn count_entities(&self) -> Result<u64> {
        Ok(self.inner.read().entities.len() as u64)
    }

    async fn entity_ids_after(&self, after: EntityId, limit: usize) -> Result<Vec<EntityId>> {
        let inner = self.inner.read();
        Ok(inner
            .entities
            .range((after + 1)..)
            .take(limit)
            .map(|(&id, _)| id)
            .collect())
    }

    async fn recompute_mention_count(&self, id: EntityId) -> Result<u64> {
        let mut inner = self.inner.write();
        if !inner.entities.contains_key(&id) {
            return Err(StorageError::entity_not_found(id));
        }
        Ok(inner.recount(id))
    }

    async fn resolve_alias(&self, alias_slug: &str) -> Result<Option<EntityId>> {
        let inner = self.inner.read();
        Ok(inner
            .alias_index
            .get(alias_slug)
            .and_then(|id| inner.aliases.get(id))
            .map(|a| a.entity_id))
    }

    async fn register_alias(
        &self,
        entity_id: EntityId,
        alias: &str,
        source: AliasSource,
    ) -> Result<bool> {
        let mut inner = self.inner.write();
        if !inner.entities.contains_key(&entity_id) {
            return Err(StorageError::entity_not_found(entity_id));
        }
        Ok(inner.register_alias(entity_id, alias, source))
    }

    async fn remove_alias(&self, entity_id: EntityId, alias_slug: &str) -> Result<bool> {
        let mut inner = self.inner.write();
        let owned = inner
            .alias_index
            .get(alias_slug)
            .and_then(|id| inner.aliases.get(id))
            .filter(|a| a.entity_id == entity_id)
            .map(|a| a.id);
        match owned {
            Some(alias_id) => {
                inner.aliases.remove(&alias_id);
                inner.alias_index.remove(alias_slug);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn aliases_for(&self, entity_id: EntityId) -> Result<Vec<Alias>> {
        Ok(self
            .inner
            .read()
            .aliases
            .values()
            .filter(|a| a.entity_id == entity_id)
            .cloned()
            .collect())
    }

    async fn link_mention(&self, mention: &NewMention) -> Result<Mention> {
        let mut inner = self.inner.write();
        if !inner.entities.contains_key(&mention.entity_id) {
            return Err(StorageError::entity_not_found(mention.entity_id));
        }

        let key = (mention.entity_id, mention.document_id);
        if let Some(existing_id) = inner.mention_index.get(&key).copied() {
            if let Some(existing) = inner.mentions.get_mut(&existing_id) {
                merge_mention(existing, mention);
                return Ok(existing.clone());
            }
        }

        let id = inner.alloc_mention_id();
        let stored = Mention {
            id,
            entity_id: mention.entity_id,
            document_id: mention.document_id,
            confidence: clamp_confidence(mention.confidence),
            context: mention.context.clone(),
            is_primary: mention.is_primary,
            created_at: Utc::now(),
        };
        inner.mention_index.insert(key, id);
        inner.mentions.insert(id, stored.clone());
        Ok(stored)
    }

    async fn mentions_for_entity(&self, entity_id: EntityId) -> Result<Vec<Mention>> {
        let mut mentions: Vec<Mention> = self
            .inner
            .read()
            .mentions
            .values()
            .filter(|m| m.entity_id == entity_id)
            .cloned()
            .collect();
        mentions.sort_by_key(|m| m.document_id);
        Ok(mentions)
    }

    async fn get_entities_for_post(
        &self,
        document_id: DocumentId,
        min_confidence: f64,
    ) -> Result<Vec<DocumentEntity>> {
        let inner = self.inner.read();
        let mut result: Vec<DocumentEntity> = inner
            .mentions
            .values()
            .filter(|m| m.document_id == document_id && m.confidence >= min_confidence)
            .filter_map(|m| {
                let entity = inner.entities.get(&m.entity_id)?;
                entity.status.is_visible().then(|| DocumentEntity {
                    entity: entity.clone(),
                    confidence: m.confidence,
                    context: m.context.clone(),
                    is_primary: m.is_primary,
                })
            })
            .collect();
        sort_document_entities(&mut result);
        Ok(result)
    }

    async fn documents_for_entity_after(
        &self,
        entity_id: EntityId,
        after: DocumentId,
        limit: usize,
    ) -> Result<Vec<DocumentId>> {
        let inner = self.inner.read();
        Ok(inner
            .documents_for(entity_id)
            .range((after + 1)..)
            .take(limit)
            .copied()
            .collect())
    }

    async fn documents_with_mentions_after(
        &self,
        after: DocumentId,
        min_confidence: f64,
        limit: usize,
    ) -> Result<Vec<DocumentId>> {
        let inner = self.inner.read();
        let documents: BTreeSet<DocumentId> = inner
            .mentions
            .values()
            .filter(|m| m.document_id > after && m.confidence >= min_confidence)
            .map(|m| m.document_id)
            .collect();
        Ok(documents.into_iter().take(limit).collect())
    }

    async fn merge_entities(
        &self,
        target: EntityId,
        sources: &[EntityId],
    ) -> Result<BTreeSet<DocumentId>> {
        let mut inner = self.inner.write();
        if !inner.entities.contains_key(&target) {
            return Err(StorageError::entity_not_found(target));
        }

        let mut affected = inner.documents_for(target);
        for &source in sources {
            if source == target {
                continue;
            }
            affected.extend(inner.documents_for(source));
            inner.merge_one(target, source)?;
        }
        inner.recount(target);
        Ok(affected)
    }

    async fn optimize(&self) -> Result<()> {
        Ok(())
    }

    async fn aggregate_snapshot(&self, top_n: usize) -> Result<AggregateSnapshot> {
        let inner = self.inner.read();

        let mut type_distribution = BTreeMap::new();
        for entity in inner.entities.values() {
            *type_distribution
                .entry(entity.entity_type.as_str().to_string())
                .or_insert(0u64) += 1;
        }

        let confidences: Vec<f64> = inner.mentions.values().map(|m| m.confidence).collect();
        let confidence = if confidences.is_empty() {
            ConfidenceStats::default()
        } else {
            ConfidenceStats {
                min: confidences.iter().copied().fold(f64::INFINITY, f64::min),
                max: confidences.iter().copied().fold(f64::NEG_INFINITY, f64::max),
                avg: confidences.iter().sum::<f64>() / confidences.len() as f64,
            }
        };

        let mut top_entities: Vec<RankedEntity> = inner
            .entities
            .values()
            .map(|e| RankedEntity {
                entity_id: e.id,
                name: e.name.clone(),
                mention_count: e.mention_count,
            })
            .collect();
        top_entities.sort_by(|a, b| {
            b.mention_count
                .cmp(&a.mention_count)
                .then_with(|| a.entity_id.cmp(&b.entity_id))
        });
        top_entities.truncate(top_n);

        let mut per_document: BTreeMap<DocumentId, u64> = BTreeMap::new();
        for mention in inner.mentions.values() {
            *per_document.entry(mention.document_id).or_insert(0) += 1;
        }
        let mut top_documents: Vec<RankedDocument> = per_document
            .into_iter()
            .map(|(document_id, entity_count)| RankedDocument {
                document_id,
                entity_count,
            })
            .collect();
        top_documents.sort_by(|a, b| {
            b.entity_count
                .cmp(&a.entity_count)
                .then_with(|| a.document_id.cmp(&b.document_id))
        });
        top_documents.truncate(top_n);

        Ok(AggregateSnapshot {
            total_entities: inner.entities.len() as u64,
            total_mentions: inner.mentions.len() as u64,
            type_distribution,
            confidence,
            top_entities,
            top_documents,
            generated_at: Utc::now(),
        })
    }
}

/// In-memory key-value store
#[derive(Default)]
pub struct InMemoryKeyValueStore {
    entries: DashMap<String, Vec<u8>>,
}

impl InMemoryKeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl KeyValueStore for InMemoryKeyValueStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.get(key).map(|v| v.value().clone()))
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.entries.insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.remove(key);
        Ok(())
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        new: Vec<u8>,
    ) -> Result<bool> {
        use dashmap::mapref::entry::Entry;

        match (self.entries.entry(key.to_string()), expected) {
            (Entry::Occupied(mut occupied), Some(expected)) if occupied.get() == expected => {
                occupied.insert(new);
                Ok(true)
            }
            (Entry::Vacant(vacant), None) => {
                vacant.insert(new);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<usize> {
        let before = self.entries.len();
        self.entries.retain(|k, _| !k.starts_with(prefix));
        Ok(before - self.entries.len())
    }
}
