//! SQLite adapter for CanonicalStore
//!
//! One connection guarded by a mutex. Every multi-statement operation runs
//! in a transaction; the merge forest is mirrored in memory and persisted as
//! `entity_redirects` rows.

mod kv;
mod schema;

pub use kv::SqliteKeyValueStore;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

use crate::domain::slug::slugify;
use crate::domain::union_find::MergeForest;
use crate::domain::{
    clamp_confidence, merge_mention, AggregateSnapshot, Alias, AliasSource, CanonicalStore,
    ConfidenceStats, DocumentEntity, DocumentId, Entity, EntityId, EntityPatch, EntityStatus,
    EntityType, Mention, NewMention, RankedDocument, RankedEntity,
};
use crate::{Result, StorageError};

const ENTITY_COLUMNS: &str = "id, name, slug, entity_type, schema_type, description, same_as_url, \
     external_id, status, mention_count, created_at, updated_at";

const ENTITY_COLUMNS_JOINED: &str = "e.id, e.name, e.slug, e.entity_type, e.schema_type, \
     e.description, e.same_as_url, e.external_id, e.status, e.mention_count, e.created_at, \
     e.updated_at";

const MENTION_COLUMNS: &str =
    "id, entity_id, document_id, confidence, context, is_primary, created_at";

fn row_to_entity(row: &Row<'_>) -> rusqlite::Result<Entity> {
    let entity_type: String = row.get(3)?;
    let status: String = row.get(8)?;
    let mention_count: i64 = row.get(9)?;
    Ok(Entity {
        id: row.get(0)?,
        name: row.get(1)?,
        slug: row.get(2)?,
        entity_type: EntityType::from_str(&entity_type).unwrap_or(EntityType::Other),
        schema_type: row.get(4)?,
        description: row.get(5)?,
        same_as_url: row.get(6)?,
        external_id: row.get(7)?,
        status: EntityStatus::from_str(&status).unwrap_or(EntityStatus::Raw),
        mention_count: mention_count.max(0) as u64,
        created_at: row.get(10)?,
        updated_at: row.get(11)?,
    })
}

fn row_to_mention(row: &Row<'_>) -> rusqlite::Result<Mention> {
    Ok(Mention {
        id: row.get(0)?,
        entity_id: row.get(1)?,
        document_id: row.get(2)?,
        confidence: row.get(3)?,
        context: row.get(4)?,
        is_primary: row.get(5)?,
        created_at: row.get(6)?,
    })
}

fn row_to_alias(row: &Row<'_>) -> rusqlite::Result<Alias> {
    let source: String = row.get(4)?;
    Ok(Alias {
        id: row.get(0)?,
        entity_id: row.get(1)?,
        alias: row.get(2)?,
        alias_slug: row.get(3)?,
        source: AliasSource::from_str(&source).unwrap_or(AliasSource::Machine),
    })
}

fn load_entity(conn: &Connection, id: EntityId) -> Result<Option<Entity>> {
    let sql = format!("SELECT {} FROM entities WHERE id = ?1", ENTITY_COLUMNS);
    Ok(conn.query_row(&sql, params![id], row_to_entity).optional()?)
}

fn load_mention(
    conn: &Connection,
    entity_id: EntityId,
    document_id: DocumentId,
) -> Result<Option<Mention>> {
    let sql = format!(
        "SELECT {} FROM entity_mentions WHERE entity_id = ?1 AND document_id = ?2",
        MENTION_COLUMNS
    );
    Ok(conn
        .query_row(&sql, params![entity_id, document_id], row_to_mention)
        .optional()?)
}

fn documents_for(conn: &Connection, entity_id: EntityId) -> Result<BTreeSet<DocumentId>> {
    let mut stmt = conn.prepare_cached(
        "SELECT DISTINCT document_id FROM entity_mentions WHERE entity_id = ?1",
    )?;
    let rows = stmt.query_map(params![entity_id], |row| row.get::<_, DocumentId>(0))?;
    let mut documents = BTreeSet::new();
    for row in rows {
        documents.insert(row?);
    }
    Ok(documents)
}

fn insert_alias(
    conn: &Connection,
    entity_id: EntityId,
    alias: &str,
    source: AliasSource,
) -> Result<bool> {
    let alias_slug = slugify(alias);
    if alias_slug.is_empty() {
        return Ok(false);
    }
    let changed = conn.execute(
        "INSERT OR IGNORE INTO entity_aliases (entity_id, alias, alias_slug, source)
         VALUES (?1, ?2, ?3, ?4)",
        params![entity_id, alias.trim(), alias_slug, source.as_str()],
    )?;
    Ok(changed > 0)
}

fn recount(conn: &Connection, entity_id: EntityId) -> Result<u64> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM entity_mentions WHERE entity_id = ?1",
        params![entity_id],
        |row| row.get(0),
    )?;
    conn.execute(
        "UPDATE entities SET mention_count = ?1 WHERE id = ?2",
        params![count, entity_id],
    )?;
    Ok(count.max(0) as u64)
}

/// Fold one source entity into `target` inside an open transaction.
fn merge_one(tx: &Transaction<'_>, target: EntityId, source: EntityId) -> Result<()> {
    let source_entity =
        load_entity(tx, source)?.ok_or_else(|| StorageError::entity_not_found(source))?;

    let sql = format!(
        "SELECT {} FROM entity_mentions WHERE entity_id = ?1",
        MENTION_COLUMNS
    );
    let source_mentions: Vec<Mention> = {
        let mut stmt = tx.prepare(&sql)?;
        let rows = stmt.query_map(params![source], row_to_mention)?;
        rows.collect::<rusqlite::Result<_>>()?
    };

    for mention in source_mentions {
        match load_mention(tx, target, mention.document_id)? {
            Some(mut existing) => {
                let incoming = NewMention {
                    entity_id: target,
                    document_id: mention.document_id,
                    confidence: mention.confidence,
                    context: mention.context.clone(),
                    is_primary: existing.is_primary || mention.is_primary,
                };
                merge_mention(&mut existing, &incoming);
                tx.execute(
                    "UPDATE entity_mentions SET confidence = ?1, context = ?2, is_primary = ?3
                     WHERE id = ?4",
                    params![
                        existing.confidence,
                        existing.context,
                        existing.is_primary,
                        existing.id
                    ],
                )?;
                tx.execute(
                    "DELETE FROM entity_mentions WHERE id = ?1",
                    params![mention.id],
                )?;
            }
            None => {
                tx.execute(
                    "UPDATE entity_mentions SET entity_id = ?1 WHERE id = ?2",
                    params![target, mention.id],
                )?;
            }
        }
    }

    tx.execute(
        "UPDATE entity_aliases SET entity_id = ?1 WHERE entity_id = ?2",
        params![target, source],
    )?;
    insert_alias(tx, target, &source_entity.name, AliasSource::Machine)?;
    tx.execute("DELETE FROM entities WHERE id = ?1", params![source])?;
    Ok(())
}

/// SQLite canonical store
pub struct SqliteCanonicalStore {
    conn: Arc<Mutex<Connection>>,
    forest: Mutex<MergeForest>,
}

impl SqliteCanonicalStore {
    /// Open (or create) a database file
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    pub fn new_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(schema::SCHEMA)?;

        let redirects: Vec<(EntityId, EntityId)> = {
            let mut stmt = conn.prepare("SELECT from_id, to_id FROM entity_redirects")?;
            let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
            rows.collect::<rusqlite::Result<_>>()?
        };
        debug!("Loaded {} entity redirects", redirects.len());

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            forest: Mutex::new(MergeForest::from_redirects(redirects)),
        })
    }

    /// Key-value store sharing this database connection
    pub fn kv_store(&self) -> SqliteKeyValueStore {
        SqliteKeyValueStore::from_shared(Arc::clone(&self.conn))
    }
}

#[async_trait]
impl CanonicalStore for SqliteCanonicalStore {
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

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let existing: Option<EntityId> = tx
            .query_row(
                "SELECT entity_id FROM entity_aliases WHERE alias_slug = ?1",
                params![slug],
                |row| row.get(0),
            )
            .optional()?;
        let existing = match existing {
            Some(id) => Some(id),
            None => tx
                .query_row(
                    "SELECT id FROM entities WHERE slug = ?1",
                    params![slug],
                    |row| row.get(0),
                )
                .optional()?,
        };

        let id = match existing {
            Some(id) => id,
            None => {
                let now = Utc::now();
                tx.execute(
                    "INSERT INTO entities (name, slug, entity_type, status, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
                    params![
                        name.trim(),
                        slug,
                        entity_type.as_str(),
                        EntityStatus::Raw.as_str(),
                        now
                    ],
                )?;
                tx.last_insert_rowid()
            }
        };

        let canonical_name: String =
            tx.query_row("SELECT name FROM entities WHERE id = ?1", params![id], |row| {
                row.get(0)
            })?;
        for alias in aliases {
            if alias.trim() != canonical_name {
                insert_alias(&tx, id, alias, AliasSource::Machine)?;
            }
        }

        tx.commit()?;
        Ok(id)
    }

    async fn get_entity(&self, id: EntityId) -> Result<Option<Entity>> {
        load_entity(&self.conn.lock(), id)
    }

    async fn find_by_slug(&self, slug: &str) -> Result<Option<Entity>> {
        let conn = self.conn.lock();
        let sql = format!("SELECT {} FROM entities WHERE slug = ?1", ENTITY_COLUMNS);
        Ok(conn.query_row(&sql, params![slug], row_to_entity).optional()?)
    }

    async fn update_entity(&self, id: EntityId, patch: &EntityPatch) -> Result<Entity> {
        let conn = self.conn.lock();
        let mut entity = load_entity(&conn, id)?.ok_or_else(|| StorageError::entity_not_found(id))?;
        patch.apply(&mut entity);
        conn.execute(
            "UPDATE entities SET name = ?1, entity_type = ?2, schema_type = ?3, description = ?4,
                 same_as_url = ?5, external_id = ?6, status = ?7, updated_at = ?8
             WHERE id = ?9",
            params![
                entity.name,
                entity.entity_type.as_str(),
                entity.schema_type,
                entity.description,
                entity.same_as_url,
                entity.external_id,
                entity.status.as_str(),
                entity.updated_at,
                id
            ],
        )?;
        Ok(entity)
    }

    async fn delete_entity(&self, id: EntityId) -> Result<BTreeSet<DocumentId>> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        if load_entity(&tx, id)?.is_none() {
            return Err(StorageError::entity_not_found(id));
        }
        let documents = documents_for(&tx, id)?;
        // Explicit deletes so the cascade does not depend on the pragma
        tx.execute("DELETE FROM entity_mentions WHERE entity_id = ?1", params![id])?;
        tx.execute("DELETE FROM entity_aliases WHERE entity_id = ?1", params![id])?;
        tx.execute("DELETE FROM entities WHERE id = ?1", params![id])?;
        tx.commit()?;
        Ok(documents)
    }

    async fn canonical_id(&self, id: EntityId) -> Result<Option<EntityId>> {
        let root = self.forest.lock().find(id);
        let conn = self.conn.lock();
        let exists: Option<i64> = conn
            .query_row("SELECT 1 FROM entities WHERE id = ?1", params![root], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(exists.map(|_| root))
    }

    async fn count_entities(&self) -> Result<u64> {
        let count: i64 =
            self.conn
                .lock()
                .query_row("SELECT COUNT(*) FROM entities", [], |row| row.get(0))?;
        Ok(count.max(0) as u64)
    }

    async fn entity_ids_after(&self, after: EntityId, limit: usize) -> Result<Vec<EntityId>> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare_cached("SELECT id FROM entities WHERE id > ?1 ORDER BY id LIMIT ?2")?;
        let rows = stmt.query_map(params![after, limit as i64], |row| row.get(0))?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    async fn recompute_mention_count(&self, id: EntityId) -> Result<u64> {
        let conn = self.conn.lock();
        if load_entity(&conn, id)?.is_none() {
            return Err(StorageError::entity_not_found(id));
        }
        recount(&conn, id)
    }

    async fn resolve_alias(&self, alias_slug: &str) -> Result<Option<EntityId>> {
        let conn = self.conn.lock();
        Ok(conn
            .query_row(
                "SELECT entity_id FROM entity_aliases WHERE alias_slug = ?1",
                params![alias_slug],
                |row| row.get(0),
            )
            .optional()?)
    }

    async fn register_alias(
        &self,
        entity_id: EntityId,
        alias: &str,
        source: AliasSource,
    ) -> Result<bool> {
        let conn = self.conn.lock();
        if load_entity(&conn, entity_id)?.is_none() {
            return Err(StorageError::entity_not_found(entity_id));
        }
        insert_alias(&conn, entity_id, alias, source)
    }

    async fn remove_alias(&self, entity_id: EntityId, alias_slug: &str) -> Result<bool> {
        let changed = self.conn.lock().execute(
            "DELETE FROM entity_aliases WHERE entity_id = ?1 AND alias_slug = ?2",
            params![entity_id, alias_slug],
        )?;
        Ok(changed > 0)
    }

    async fn aliases_for(&self, entity_id: EntityId) -> Result<Vec<Alias>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT id, entity_id, alias, alias_slug, source FROM entity_aliases
             WHERE entity_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![entity_id], row_to_alias)?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    async fn link_mention(&self, mention: &NewMention) -> Result<Mention> {
        let conn = self.conn.lock();
        if load_entity(&conn, mention.entity_id)?.is_none() {
            return Err(StorageError::entity_not_found(mention.entity_id));
        }

        // All right-hand sides read the pre-update row
        conn.execute(
            "INSERT INTO entity_mentions
                 (entity_id, document_id, confidence, context, is_primary, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT (entity_id, document_id) DO UPDATE SET
                 context = CASE WHEN excluded.confidence > entity_mentions.confidence
                                THEN excluded.context ELSE entity_mentions.context END,
                 confidence = MAX(entity_mentions.confidence, excluded.confidence),
                 is_primary = excluded.is_primary",
            params![
                mention.entity_id,
                mention.document_id,
                clamp_confidence(mention.confidence),
                mention.context,
                mention.is_primary,
                Utc::now()
            ],
        )?;

        load_mention(&conn, mention.entity_id, mention.document_id)?.ok_or_else(|| {
            StorageError::transaction(format!(
                "Mention ({}, {}) missing after write",
                mention.entity_id, mention.document_id
            ))
        })
    }

    async fn mentions_for_entity(&self, entity_id: EntityId) -> Result<Vec<Mention>> {
        let conn = self.conn.lock();
        let sql = format!(
            "SELECT {} FROM entity_mentions WHERE entity_id = ?1 ORDER BY document_id",
            MENTION_COLUMNS
        );
        let mut stmt = conn.prepare_cached(&sql)?;
        let rows = stmt.query_map(params![entity_id], row_to_mention)?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    async fn get_entities_for_post(
        &self,
        document_id: DocumentId,
        min_confidence: f64,
    ) -> Result<Vec<DocumentEntity>> {
        let conn = self.conn.lock();
        let sql = format!(
            "SELECT {}, m.confidence, m.context, m.is_primary
             FROM entity_mentions m JOIN entities e ON e.id = m.entity_id
             WHERE m.document_id = ?1 AND m.confidence >= ?2
               AND e.status NOT IN ('trash', 'rejected')
             ORDER BY m.is_primary DESC, m.confidence DESC, e.id ASC",
            ENTITY_COLUMNS_JOINED
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![document_id, min_confidence], |row| {
            Ok(DocumentEntity {
                entity: row_to_entity(row)?,
                confidence: row.get(12)?,
                context: row.get(13)?,
                is_primary: row.get(14)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    async fn documents_for_entity_after(
        &self,
        entity_id: EntityId,
        after: DocumentId,
        limit: usize,
    ) -> Result<Vec<DocumentId>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT DISTINCT document_id FROM entity_mentions
             WHERE entity_id = ?1 AND document_id > ?2
             ORDER BY document_id LIMIT ?3",
        )?;
        let rows = stmt.query_map(params![entity_id, after, limit as i64], |row| row.get(0))?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    async fn documents_with_mentions_after(
        &self,
        after: DocumentId,
        min_confidence: f64,
        limit: usize,
    ) -> Result<Vec<DocumentId>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT DISTINCT document_id FROM entity_mentions
             WHERE document_id > ?1 AND confidence >= ?2
             ORDER BY document_id LIMIT ?3",
        )?;
        let rows =
            stmt.query_map(params![after, min_confidence, limit as i64], |row| row.get(0))?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    async fn merge_entities(
        &self,
        target: EntityId,
        sources: &[EntityId],
    ) -> Result<BTreeSet<DocumentId>> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        if load_entity(&tx, target)?.is_none() {
            return Err(StorageError::entity_not_found(target));
        }

        let mut affected = documents_for(&tx, target)?;
        let mut merged = Vec::new();
        for &source in sources {
            if source == target {
                continue;
            }
            affected.extend(documents_for(&tx, source)?);
            merge_one(&tx, target, source)?;
            tx.execute(
                "INSERT OR REPLACE INTO entity_redirects (from_id, to_id) VALUES (?1, ?2)",
                params![source, target],
            )?;
            merged.push(source);
        }
        recount(&tx, target)?;
        tx.commit()?;

        let mut forest = self.forest.lock();
        for source in merged {
            forest.union(source, target);
        }
        Ok(affected)
    }

    async fn optimize(&self) -> Result<()> {
        self.conn.lock().execute_batch("ANALYZE; PRAGMA optimize;")?;
        Ok(())
    }

    async fn aggregate_snapshot(&self, top_n: usize) -> Result<AggregateSnapshot> {
        let conn = self.conn.lock();

        let total_entities: i64 =
            conn.query_row("SELECT COUNT(*) FROM entities", [], |row| row.get(0))?;

        let mut type_distribution = BTreeMap::new();
        {
            let mut stmt = conn.prepare(
                "SELECT entity_type, COUNT(*) FROM entities GROUP BY entity_type ORDER BY entity_type",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?;
            for row in rows {
                let (entity_type, count) = row?;
                type_distribution.insert(entity_type, count.max(0) as u64);
            }
        }

        let (total_mentions, min, max, avg): (i64, Option<f64>, Option<f64>, Option<f64>) = conn
            .query_row(
                "SELECT COUNT(*), MIN(confidence), MAX(confidence), AVG(confidence)
                 FROM entity_mentions",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )?;

        let top_entities = {
            let mut stmt = conn.prepare(
                "SELECT id, name, mention_count FROM entities
                 ORDER BY mention_count DESC, id ASC LIMIT ?1",
            )?;
            let rows = stmt.query_map(params![top_n as i64], |row| {
                Ok(RankedEntity {
                    entity_id: row.get(0)?,
                    name: row.get(1)?,
                    mention_count: row.get::<_, i64>(2)?.max(0) as u64,
                })
            })?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };

        let top_documents = {
            let mut stmt = conn.prepare(
                "SELECT document_id, COUNT(*) AS n FROM entity_mentions
                 GROUP BY document_id ORDER BY n DESC, document_id ASC LIMIT ?1",
            )?;
            let rows = stmt.query_map(params![top_n as i64], |row| {
                Ok(RankedDocument {
                    document_id: row.get(0)?,
                    entity_count: row.get::<_, i64>(1)?.max(0) as u64,
                })
            })?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };

        Ok(AggregateSnapshot {
            total_entities: total_entities.max(0) as u64,
            total_mentions: total_mentions.max(0) as u64,
            type_distribution,
            confidence: ConfidenceStats {
                min: min.unwrap_or_default(),
                max: max.unwrap_or_default(),
                avg: avg.unwrap_or_default(),
            },
            top_entities,
            top_documents,
            generated_at: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_schema_creation_and_upsert() {
        let store = SqliteCanonicalStore::new_in_memory().unwrap();
        let id = store
            .upsert_entity("OpenAI", EntityType::Organization, &["openai".into()])
            .await
            .unwrap();

        let entity = store.get_entity(id).await.unwrap().unwrap();
        assert_eq!(entity.slug, "openai");
        assert_eq!(entity.entity_type, EntityType::Organization);
        assert_eq!(store.resolve_alias("openai").await.unwrap(), Some(id));
    }

    #[tokio::test]
    async fn test_link_mention_upsert_merges() {
        let store = SqliteCanonicalStore::new_in_memory().unwrap();
        let id = store
            .upsert_entity("Tokio", EntityType::Technology, &[])
            .await
            .unwrap();

        store
            .link_mention(&NewMention::new(id, 1, 0.4).with_context("first"))
            .await
            .unwrap();
        let m = store
            .link_mention(&NewMention::new(id, 1, 0.7).with_context("second").primary(true))
            .await
            .unwrap();
        assert_eq!(m.confidence, 0.7);
        assert_eq!(m.context.as_deref(), Some("second"));
        assert!(m.is_primary);

        let m = store
            .link_mention(&NewMention::new(id, 1, 0.1).with_context("third"))
            .await
            .unwrap();
        assert_eq!(m.confidence, 0.7);
        assert_eq!(m.context.as_deref(), Some("second"));
        assert!(!m.is_primary);
    }

    #[tokio::test]
    async fn test_redirects_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("graph.db");

        let (a, b) = {
            let store = SqliteCanonicalStore::open(&path).unwrap();
            let a = store
                .upsert_entity("Alpha", EntityType::Concept, &[])
                .await
                .unwrap();
            let b = store
                .upsert_entity("Beta", EntityType::Concept, &[])
                .await
                .unwrap();
            store.merge_entities(b, &[a]).await.unwrap();
            (a, b)
        };

        let reopened = SqliteCanonicalStore::open(&path).unwrap();
        assert_eq!(reopened.canonical_id(a).await.unwrap(), Some(b));
    }

    #[tokio::test]
    async fn test_optimize_runs() {
        let store = SqliteCanonicalStore::new_in_memory().unwrap();
        store.optimize().await.unwrap();
    }
}
