//! TTL cache adapter backed by moka with per-entry expiry.

use async_trait::async_trait;
use moka::sync::Cache;
use moka::Expiry;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::domain::kv::TtlCache;
use crate::Result;

#[derive(Clone)]
struct Entry {
    value: Arc<Vec<u8>>,
    ttl: Duration,
}

struct PerEntryExpiry;

impl Expiry<String, Entry> for PerEntryExpiry {
    fn expire_after_create(&self, _key: &String, value: &Entry, _created_at: Instant) -> Option<Duration> {
        Some(value.ttl)
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &Entry,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(value.ttl)
    }
}

/// Expiring marker cache
pub struct MokaTtlCache {
    cache: Cache<String, Entry>,
}

impl MokaTtlCache {
    pub fn new(max_entries: u64) -> Self {
        let cache = Cache::builder()
            .max_capacity(max_entries)
            .expire_after(PerEntryExpiry)
            .eviction_listener(|key, _value, cause| {
                tracing::debug!("TTL cache evicted: {} (cause: {:?})", key, cause);
            })
            .build();
        Self { cache }
    }

    pub fn entry_count(&self) -> u64 {
        self.cache.run_pending_tasks();
        self.cache.entry_count()
    }
}

impl Default for MokaTtlCache {
    fn default() -> Self {
        Self::new(100_000)
    }
}

#[async_trait]
impl TtlCache for MokaTtlCache {
    async fn set_with_ttl(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<()> {
        self.cache.insert(
            key.to_string(),
            Entry {
                value: Arc::new(value),
                ttl,
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.cache.get(key).map(|e| e.value.as_ref().clone()))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.cache.invalidate(key);
        Ok(())
    }
}
