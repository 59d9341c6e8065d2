//! Domain layer for the canonical entity graph
//!
//! # Domain Models
//!
//! - `Entity`: deduplicated record for one real-world named thing
//! - `Alias`: alternate surface form, owned by exactly one entity
//! - `Mention`: entity ↔ document edge with confidence and context
//!
//! # Port Traits
//!
//! - `CanonicalStore`: entities, aliases, mentions, merges
//! - `KeyValueStore` / `TtlCache` (see [`kv`]): job state and short-lived markers
//!
//! # Invariants
//!
//! - entity slug is unique
//! - alias slug resolves to exactly one entity
//! - (entity, document) has at most one mention
//! - mention confidence is clamped to `[0, 1]`

pub mod kv;
pub mod slug;
pub mod union_find;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::Result;

pub type EntityId = i64;
pub type DocumentId = i64;
pub type AliasId = i64;
pub type MentionId = i64;

/// Clamp a confidence score into `[0, 1]`. NaN is treated as zero.
pub fn clamp_confidence(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Domain Models
// ═══════════════════════════════════════════════════════════════════════════

/// Entity kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Person,
    Organization,
    Location,
    Product,
    Event,
    Work,
    Concept,
    Technology,
    Brand,
    Other,
}

impl EntityType {
    pub const ALL: [EntityType; 10] = [
        EntityType::Person,
        EntityType::Organization,
        EntityType::Location,
        EntityType::Product,
        EntityType::Event,
        EntityType::Work,
        EntityType::Concept,
        EntityType::Technology,
        EntityType::Brand,
        EntityType::Other,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Person => "person",
            EntityType::Organization => "organization",
            EntityType::Location => "location",
            EntityType::Product => "product",
            EntityType::Event => "event",
            EntityType::Work => "work",
            EntityType::Concept => "concept",
            EntityType::Technology => "technology",
            EntityType::Brand => "brand",
            EntityType::Other => "other",
        }
    }

    /// Strict parse of the stored representation.
    pub fn from_str(s: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|t| t.as_str() == s)
    }

    /// Map a free-form extractor label onto a kind. Unknown labels become `Other`.
    pub fn from_label(label: &str) -> Self {
        match label.trim().to_lowercase().as_str() {
            "person" | "per" | "people" | "human" => EntityType::Person,
            "organization" | "organisation" | "org" | "company" | "institution" => {
                EntityType::Organization
            }
            "location" | "loc" | "place" | "gpe" | "city" | "country" => EntityType::Location,
            "product" | "prod" => EntityType::Product,
            "event" | "evt" => EntityType::Event,
            "work" | "creative_work" | "work_of_art" | "book" | "film" => EntityType::Work,
            "concept" | "topic" | "idea" => EntityType::Concept,
            "technology" | "tech" | "software" | "tool" => EntityType::Technology,
            "brand" => EntityType::Brand,
            _ => EntityType::Other,
        }
    }

    /// Default external schema type for this kind.
    pub fn default_schema_type(&self) -> &'static str {
        match self {
            EntityType::Person => "Person",
            EntityType::Organization => "Organization",
            EntityType::Location => "Place",
            EntityType::Product => "Product",
            EntityType::Event => "Event",
            EntityType::Work => "CreativeWork",
            EntityType::Concept => "Thing",
            EntityType::Technology => "SoftwareApplication",
            EntityType::Brand => "Brand",
            EntityType::Other => "Thing",
        }
    }
}

impl std::fmt::Display for EntityType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Review status of an entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityStatus {
    Raw,
    Reviewed,
    Canonical,
    Trash,
    Rejected,
}

impl EntityStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityStatus::Raw => "raw",
            EntityStatus::Reviewed => "reviewed",
            EntityStatus::Canonical => "canonical",
            EntityStatus::Trash => "trash",
            EntityStatus::Rejected => "rejected",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "raw" => Some(EntityStatus::Raw),
            "reviewed" => Some(EntityStatus::Reviewed),
            "canonical" => Some(EntityStatus::Canonical),
            "trash" => Some(EntityStatus::Trash),
            "rejected" => Some(EntityStatus::Rejected),
            _ => None,
        }
    }

    /// Trash and rejected entities are soft-removed and hidden from documents.
    pub fn is_visible(&self) -> bool {
        !matches!(self, EntityStatus::Trash | EntityStatus::Rejected)
    }
}

/// Where an alias came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AliasSource {
    Machine,
    Manual,
}

impl AliasSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            AliasSource::Machine => "machine",
            AliasSource::Manual => "manual",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "machine" => Some(AliasSource::Machine),
            "manual" => Some(AliasSource::Manual),
            _ => None,
        }
    }
}

/// Canonical entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: EntityId,
    pub name: String,
    /// Unique slug derived from `name` at creation time
    pub slug: String,
    pub entity_type: EntityType,
    /// Overrides `entity_type.default_schema_type()` when set
    pub schema_type: Option<String>,
    pub description: Option<String>,
    pub same_as_url: Option<String>,
    pub external_id: Option<String>,
    pub status: EntityStatus,
    /// Cached count of mentions, refreshed by the indexing phase and merges
    pub mention_count: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Entity {
    pub fn effective_schema_type(&self) -> &str {
        self.schema_type
            .as_deref()
            .unwrap_or_else(|| self.entity_type.default_schema_type())
    }
}

/// Alternate surface form of an entity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Alias {
    pub id: AliasId,
    pub entity_id: EntityId,
    pub alias: String,
    /// Globally unique
    pub alias_slug: String,
    pub source: AliasSource,
}

/// Entity ↔ document edge
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mention {
    pub id: MentionId,
    pub entity_id: EntityId,
    pub document_id: DocumentId,
    pub confidence: f64,
    pub context: Option<String>,
    pub is_primary: bool,
    pub created_at: DateTime<Utc>,
}

/// Input for [`CanonicalStore::link_mention`]
#[derive(Debug, Clone, PartialEq)]
pub struct NewMention {
    pub entity_id: EntityId,
    pub document_id: DocumentId,
    pub confidence: f64,
    pub context: Option<String>,
    pub is_primary: bool,
}

impl NewMention {
    pub fn new(entity_id: EntityId, document_id: DocumentId, confidence: f64) -> Self {
        Self {
            entity_id,
            document_id,
            confidence,
            context: None,
            is_primary: false,
        }
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    pub fn primary(mut self, is_primary: bool) -> Self {
        self.is_primary = is_primary;
        self
    }
}

/// Merge-on-conflict rule shared by every adapter.
///
/// Confidence takes the max, the context follows whichever side is strictly
/// more confident, and `is_primary` takes the incoming value.
pub(crate) fn merge_mention(existing: &mut Mention, incoming: &NewMention) {
    let incoming_confidence = clamp_confidence(incoming.confidence);
    if incoming_confidence > existing.confidence {
        existing.context = incoming.context.clone();
    }
    existing.confidence = existing.confidence.max(incoming_confidence);
    existing.is_primary = incoming.is_primary;
}

/// Partial update for user edits
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntityPatch {
    pub name: Option<String>,
    pub entity_type: Option<EntityType>,
    pub schema_type: Option<String>,
    pub description: Option<String>,
    pub same_as_url: Option<String>,
    pub external_id: Option<String>,
    pub status: Option<EntityStatus>,
}

impl EntityPatch {
    pub(crate) fn apply(&self, entity: &mut Entity) {
        if let Some(name) = &self.name {
            entity.name = name.clone();
        }
        if let Some(t) = self.entity_type {
            entity.entity_type = t;
        }
        if let Some(v) = &self.schema_type {
            entity.schema_type = Some(v.clone());
        }
        if let Some(v) = &self.description {
            entity.description = Some(v.clone());
        }
        if let Some(v) = &self.same_as_url {
            entity.same_as_url = Some(v.clone());
        }
        if let Some(v) = &self.external_id {
            entity.external_id = Some(v.clone());
        }
        if let Some(s) = self.status {
            entity.status = s;
        }
        entity.updated_at = Utc::now();
    }
}

/// Entity as seen from one document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentEntity {
    pub entity: Entity,
    pub confidence: f64,
    pub context: Option<String>,
    pub is_primary: bool,
}

/// Order used by `get_entities_for_post`: primary first, then confidence desc,
/// then entity id for a stable result.
pub(crate) fn sort_document_entities(entities: &mut [DocumentEntity]) {
    entities.sort_by(|a, b| {
        b.is_primary
            .cmp(&a.is_primary)
            .then_with(|| b.confidence.total_cmp(&a.confidence))
            .then_with(|| a.entity.id.cmp(&b.entity.id))
    });
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceStats {
    pub min: f64,
    pub max: f64,
    pub avg: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedEntity {
    pub entity_id: EntityId,
    pub name: String,
    pub mention_count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedDocument {
    pub document_id: DocumentId,
    pub entity_count: u64,
}

/// Aggregate statistics computed by the indexing phase
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateSnapshot {
    pub total_entities: u64,
    pub total_mentions: u64,
    pub type_distribution: BTreeMap<String, u64>,
    pub confidence: ConfidenceStats,
    pub top_entities: Vec<RankedEntity>,
    pub top_documents: Vec<RankedDocument>,
    pub generated_at: DateTime<Utc>,
}

// ═══════════════════════════════════════════════════════════════════════════
// Port Trait: CanonicalStore
// ═══════════════════════════════════════════════════════════════════════════

/// Canonical entity storage abstraction
///
/// # Core Operations
///
/// 1. **Resolution**: `upsert_entity`, `resolve_alias`, `register_alias`, `canonical_id`
/// 2. **Edges**: `link_mention` (merge-on-conflict), `get_entities_for_post`
/// 3. **Merges**: `merge_entities` returns every document touched
/// 4. **Cursors**: `*_after` scans used by resumable batch phases
///
/// # Implementations
///
/// - `InMemoryCanonicalStore`: tests and ephemeral runs
/// - `SqliteCanonicalStore`: durable adapter (feature `sqlite`)
#[async_trait]
pub trait CanonicalStore: Send + Sync {
    // ═══════════════════════════════════════════════════════════════════════
    // Entities
    // ═══════════════════════════════════════════════════════════════════════

    /// Return the entity whose slug (or alias slug) matches `name`, creating
    /// it when absent. `aliases` are registered idempotently either way.
    async fn upsert_entity(
        &self,
        name: &str,
        entity_type: EntityType,
        aliases: &[String],
    ) -> Result<EntityId>;

    async fn get_entity(&self, id: EntityId) -> Result<Option<Entity>>;

    async fn find_by_slug(&self, slug: &str) -> Result<Option<Entity>>;

    /// Apply a user edit. Renames keep the original slug.
    async fn update_entity(&self, id: EntityId, patch: &EntityPatch) -> Result<Entity>;

    /// Hard delete, cascading aliases and mentions.
    ///
    /// Returns the documents that referenced the entity.
    async fn delete_entity(&self, id: EntityId) -> Result<BTreeSet<DocumentId>>;

    /// Follow merge redirects to the surviving entity, if any.
    async fn canonical_id(&self, id: EntityId) -> Result<Option<EntityId>>;

    async fn count_entities(&self) -> Result<u64>;

    /// Entity ids strictly greater than `after`, ascending
    async fn entity_ids_after(&self, after: EntityId, limit: usize) -> Result<Vec<EntityId>>;

    async fn recompute_mention_count(&self, id: EntityId) -> Result<u64>;

    // ═══════════════════════════════════════════════════════════════════════
    // Aliases
    // ═══════════════════════════════════════════════════════════════════════

    async fn resolve_alias(&self, alias_slug: &str) -> Result<Option<EntityId>>;

    /// Idempotent: returns `false` when the alias slug is already registered
    /// (for this or any other entity).
    async fn register_alias(
        &self,
        entity_id: EntityId,
        alias: &str,
        source: AliasSource,
    ) -> Result<bool>;

    /// Returns `false` if the alias slug was not registered to `entity_id`.
    async fn remove_alias(&self, entity_id: EntityId, alias_slug: &str) -> Result<bool>;

    async fn aliases_for(&self, entity_id: EntityId) -> Result<Vec<Alias>>;

    // ═══════════════════════════════════════════════════════════════════════
    // Mentions
    // ═══════════════════════════════════════════════════════════════════════

    /// Write an edge, merging with an existing `(entity, document)` edge.
    async fn link_mention(&self, mention: &NewMention) -> Result<Mention>;

    async fn mentions_for_entity(&self, entity_id: EntityId) -> Result<Vec<Mention>>;

    /// Visible entities mentioned in `document_id` at or above `min_confidence`,
    /// primary first then by confidence descending.
    async fn get_entities_for_post(
        &self,
        document_id: DocumentId,
        min_confidence: f64,
    ) -> Result<Vec<DocumentEntity>>;

    /// Distinct documents mentioning `entity_id` with id > `after`, ascending.
    async fn documents_for_entity_after(
        &self,
        entity_id: EntityId,
        after: DocumentId,
        limit: usize,
    ) -> Result<Vec<DocumentId>>;

    /// Distinct documents with at least one mention at or above
    /// `min_confidence` and id > `after`, ascending.
    async fn documents_with_mentions_after(
        &self,
        after: DocumentId,
        min_confidence: f64,
        limit: usize,
    ) -> Result<Vec<DocumentId>>;

    // ═══════════════════════════════════════════════════════════════════════
    // Merge & maintenance
    // ═══════════════════════════════════════════════════════════════════════

    /// Fold every source into `target` and return the union of documents
    /// that referenced any of the involved entities before the merge.
    async fn merge_entities(
        &self,
        target: EntityId,
        sources: &[EntityId],
    ) -> Result<BTreeSet<DocumentId>>;

    /// Storage-level statistics maintenance
    async fn optimize(&self) -> Result<()>;

    async fn aggregate_snapshot(&self, top_n: usize) -> Result<AggregateSnapshot>;
}
