//! Key-value and TTL cache ports.
//!
//! All pipeline, job, and accumulator state lives behind [`KeyValueStore`].
//! Values are opaque bytes; [`KvExt`] adds bincode-typed access on top.
//! Short-lived markers (propagation status) live behind [`TtlCache`].

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use std::time::Duration;

use crate::Result;

/// Durable key-value store
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<()>;

    /// Atomically replace the value at `key` if it currently equals
    /// `expected` (`None` = key absent). Returns whether the swap happened.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        new: Vec<u8>,
    ) -> Result<bool>;

    /// Remove every key starting with `prefix`. Returns the number removed.
    async fn delete_prefix(&self, prefix: &str) -> Result<usize>;
}

/// Typed helpers over any [`KeyValueStore`]
#[async_trait]
pub trait KvExt: KeyValueStore {
    async fn get_typed<T>(&self, key: &str) -> Result<Option<T>>
    where
        T: DeserializeOwned + Send,
    {
        match self.get(key).await? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn get_or_default<T>(&self, key: &str) -> Result<T>
    where
        T: DeserializeOwned + Default + Send,
    {
        Ok(self.get_typed(key).await?.unwrap_or_default())
    }

    async fn set_typed<T>(&self, key: &str, value: &T) -> Result<()>
    where
        T: Serialize + Sync,
    {
        let bytes = bincode::serialize(value)?;
        self.set(key, bytes).await
    }
}

impl<S: KeyValueStore + ?Sized> KvExt for S {}

/// Expiring cache entries
#[async_trait]
pub trait TtlCache: Send + Sync {
    async fn set_with_ttl(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<()>;

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    async fn delete(&self, key: &str) -> Result<()>;
}
