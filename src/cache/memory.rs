//! Per-process in-memory cache store.

use std::num::NonZeroUsize;
use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use lru::LruCache;
use metrics::counter;

use super::config::CacheConfig;
use super::keys::{expiry_key, is_expiry_key};
use super::lock::{rw_read, rw_write};
use super::store::{CacheStore, StoreError};

const SOURCE: &str = "cache::memory";
const METRIC_EVICT: &str = "quire_cache_evict_total";

/// LRU-bounded map holding payloads and expiry records side by side.
///
/// Both keys of an entry are written under one write guard, so readers never
/// observe one without the other. Capacity eviction may later drop either
/// half independently; a lone half reads as a miss.
pub struct MemoryStore {
    entries: RwLock<LruCache<String, Bytes>>,
}

impl MemoryStore {
    pub fn new(config: &CacheConfig) -> Self {
        // Two slots per entry: payload and expiry record.
        let slots = config.memory_limit_non_zero().get().saturating_mul(2);
        let capacity = NonZeroUsize::new(slots).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: RwLock::new(LruCache::new(capacity)),
        }
    }

    /// Number of payload entries (expiry records excluded).
    pub fn len(&self) -> usize {
        rw_read(&self.entries, SOURCE, "len")
            .iter()
            .filter(|(key, _)| !is_expiry_key(key))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        rw_read(&self.entries, SOURCE, "is_empty").is_empty()
    }

    #[cfg(test)]
    pub(crate) fn insert_raw(&self, key: &str, value: Bytes) {
        rw_write(&self.entries, SOURCE, "insert_raw").put(key.to_string(), value);
    }
}

#[async_trait]
impl CacheStore for MemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>, StoreError> {
        Ok(rw_write(&self.entries, SOURCE, "get").get(key).cloned())
    }

    async fn get_entry(&self, key: &str) -> Result<(Option<Bytes>, Option<Bytes>), StoreError> {
        let mut entries = rw_write(&self.entries, SOURCE, "get_entry");
        let payload = entries.get(key).cloned();
        let expiry = entries.get(&expiry_key(key)).cloned();
        Ok((payload, expiry))
    }

    async fn set(
        &self,
        key: &str,
        payload: Bytes,
        expires_at_ms: i64,
        _ttl: Duration,
    ) -> Result<(), StoreError> {
        let mut entries = rw_write(&self.entries, SOURCE, "set");
        let evicted = [
            entries.push(key.to_string(), payload),
            entries.push(expiry_key(key), Bytes::from(expires_at_ms.to_string())),
        ];

        let dropped = evicted
            .iter()
            .flatten()
            .filter(|(evicted_key, _)| evicted_key != key && !is_expiry_key(evicted_key))
            .count();
        if dropped > 0 {
            counter!(METRIC_EVICT).increment(dropped as u64);
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut entries = rw_write(&self.entries, SOURCE, "delete");
        entries.pop(key);
        entries.pop(&expiry_key(key));
        Ok(())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<u64, StoreError> {
        let mut entries = rw_write(&self.entries, SOURCE, "delete_prefix");
        let doomed: Vec<String> = entries
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, _)| key.clone())
            .collect();

        let mut removed = 0;
        for key in doomed {
            if entries.pop(&key).is_some() && !is_expiry_key(&key) {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn clear(&self) -> Result<(), StoreError> {
        rw_write(&self.entries, SOURCE, "clear").clear();
        Ok(())
    }
}
