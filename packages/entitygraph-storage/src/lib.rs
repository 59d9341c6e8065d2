//! entitygraph-storage: canonical entity graph persistence
//!
//! ## Core Principles
//!
//! 1. **One entity per slug**: names are resolved through slugs and aliases
//!    before anything new is created
//! 2. **Merge, never duplicate**: re-linking an (entity, document) pair merges
//!    into the existing edge, keeping the highest confidence
//! 3. **Redirects outlive merges**: merged-away ids keep resolving to the
//!    surviving entity
//!
//! ## Usage
//!
//! ```rust,ignore
//! use entitygraph_storage::{CanonicalStore, EntityType, NewMention, SqliteCanonicalStore};
//!
//! let store = SqliteCanonicalStore::open("entitygraph.db")?;
//! let openai = store.upsert_entity("OpenAI", EntityType::Organization, &[]).await?;
//! store.link_mention(&NewMention::new(openai, 42, 0.9)).await?;
//!
//! let entities = store.get_entities_for_post(42, 0.5).await?;
//! ```

pub mod domain;
pub mod error;
pub mod infrastructure;

pub use error::{ErrorKind, Result, StorageError};

pub use domain::kv::{KeyValueStore, KvExt, TtlCache};
pub use domain::slug::{grouping_key, slugify};
pub use domain::union_find::MergeForest;
pub use domain::{
    clamp_confidence, AggregateSnapshot, Alias, AliasSource, CanonicalStore, ConfidenceStats,
    DocumentEntity, DocumentId, Entity, EntityId, EntityPatch, EntityStatus, EntityType, Mention,
    NewMention, RankedDocument, RankedEntity,
};

pub use infrastructure::{InMemoryCanonicalStore, InMemoryKeyValueStore, MokaTtlCache};

#[cfg(feature = "sqlite")]
pub use infrastructure::{SqliteCanonicalStore, SqliteKeyValueStore};
