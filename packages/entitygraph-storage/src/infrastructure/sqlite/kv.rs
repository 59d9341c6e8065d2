//! `kv_store` table adapter

use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Arc;

use super::schema;
use crate::domain::kv::KeyValueStore;
use crate::Result;

/// Durable key-value store on SQLite
pub struct SqliteKeyValueStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteKeyValueStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch(schema::SCHEMA)?;
        Ok(Self::from_shared(Arc::new(Mutex::new(conn))))
    }

    pub fn new_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(schema::SCHEMA)?;
        Ok(Self::from_shared(Arc::new(Mutex::new(conn))))
    }

    pub(crate) fn from_shared(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl KeyValueStore for SqliteKeyValueStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let conn = self.conn.lock();
        Ok(conn
            .query_row(
                "SELECT value FROM kv_store WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?)
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.conn.lock().execute(
            "INSERT INTO kv_store (key, value) VALUES (?1, ?2)
             ON CONFLICT (key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.conn
            .lock()
            .execute("DELETE FROM kv_store WHERE key = ?1", params![key])?;
        Ok(())
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        new: Vec<u8>,
    ) -> Result<bool> {
        let conn = self.conn.lock();
        let changed = match expected {
            Some(expected) => conn.execute(
                "UPDATE kv_store SET value = ?1 WHERE key = ?2 AND value = ?3",
                params![new, key, expected],
            )?,
            None => conn.execute(
                "INSERT OR IGNORE INTO kv_store (key, value) VALUES (?1, ?2)",
                params![key, new],
            )?,
        };
        Ok(changed > 0)
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<usize> {
        let removed = self.conn.lock().execute(
            "DELETE FROM kv_store WHERE substr(key, 1, length(?1)) = ?1",
            params![prefix],
        )?;
        Ok(removed)
    }
}
