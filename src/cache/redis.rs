//! Shared Redis cache store.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use deadpool_redis::{Connection, Pool};
use redis::AsyncCommands;
use tracing::debug;

use super::keys::{expiry_key, is_expiry_key};
use super::lock::mutex_lock;
use super::store::{CacheStore, StoreError};

const SOURCE: &str = "cache::redis";
const COOL_DOWN: Duration = Duration::from_secs(2);
const DELETE_BATCH: usize = 500;

/// Cache store backed by a shared Redis instance.
///
/// Entries are written with a single `MULTI/EXEC` pipeline. Native `EX`
/// expiry mirrors the expiry record so that abandoned entries age out even
/// when nobody reads them. After a transport error the store reports itself
/// unavailable for a short cool-down.
pub struct RedisStore {
    pool: Pool,
    namespace: String,
    cool_down: Duration,
    unavailable_until: Mutex<Option<Instant>>,
}

impl RedisStore {
    pub fn new(pool: Pool, namespace: impl Into<String>) -> Self {
        Self {
            pool,
            namespace: namespace.into(),
            cool_down: COOL_DOWN,
            unavailable_until: Mutex::new(None),
        }
    }

    /// How long the store reports itself unavailable after a transport error.
    pub fn with_cool_down(mut self, cool_down: Duration) -> Self {
        self.cool_down = cool_down;
        self
    }

    async fn connection(&self) -> Result<Connection, StoreError> {
        self.pool
            .get()
            .await
            .map_err(|err| self.unavailable("connect", err))
    }

    fn unavailable(&self, op: &'static str, err: impl std::fmt::Display) -> StoreError {
        *mutex_lock(&self.unavailable_until, SOURCE, "mark_unavailable") =
            Some(Instant::now() + self.cool_down);
        StoreError::unavailable(format!("redis {op} failed: {err}"))
    }
}

#[async_trait]
impl CacheStore for RedisStore {
    fn name(&self) -> &'static str {
        "redis"
    }

    fn is_available(&self) -> bool {
        let mut until = mutex_lock(&self.unavailable_until, SOURCE, "is_available");
        match *until {
            Some(deadline) if Instant::now() < deadline => false,
            Some(_) => {
                *until = None;
                true
            }
            None => true,
        }
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>, StoreError> {
        let mut conn = self.connection().await?;
        let value: Option<Vec<u8>> = conn
            .get(key)
            .await
            .map_err(|err| self.unavailable("GET", err))?;
        Ok(value.map(Bytes::from))
    }

    async fn get_entry(&self, key: &str) -> Result<(Option<Bytes>, Option<Bytes>), StoreError> {
        let mut conn = self.connection().await?;
        let (payload, expiry): (Option<Vec<u8>>, Option<Vec<u8>>) = redis::cmd("MGET")
            .arg(key)
            .arg(expiry_key(key))
            .query_async(&mut conn)
            .await
            .map_err(|err| self.unavailable("MGET", err))?;
        Ok((payload.map(Bytes::from), expiry.map(Bytes::from)))
    }

    async fn set(
        &self,
        key: &str,
        payload: Bytes,
        expires_at_ms: i64,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        let ttl_secs = ttl.as_secs() + u64::from(ttl.subsec_nanos() > 0);

        let _: () = redis::pipe()
            .atomic()
            .set_ex(key, payload.as_ref(), ttl_secs)
            .ignore()
            .set_ex(expiry_key(key), expires_at_ms.to_string(), ttl_secs)
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(|err| self.unavailable("MULTI/EXEC", err))?;

        debug!(cache_key = %key, ttl_secs, "cache set (redis)");
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        let _: () = conn
            .del(vec![key.to_string(), expiry_key(key)])
            .await
            .map_err(|err| self.unavailable("DEL", err))?;
        Ok(())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<u64, StoreError> {
        let mut conn = self.connection().await?;
        let pattern = format!("{}*", escape_glob(prefix));

        let keys: Vec<String> = {
            let mut iter = conn
                .scan_match::<_, String>(&pattern)
                .await
                .map_err(|err| self.unavailable("SCAN", err))?;
            let mut keys = Vec::new();
            while let Some(key) = iter.next_item().await {
                keys.push(key);
            }
            keys
        };

        for batch in keys.chunks(DELETE_BATCH) {
            let _: () = conn
                .del(batch)
                .await
                .map_err(|err| self.unavailable("DEL", err))?;
        }

        let removed = keys.iter().filter(|key| !is_expiry_key(key)).count();
        debug!(prefix, removed, "cache prefix deleted (redis)");
        Ok(removed as u64)
    }

    async fn clear(&self) -> Result<(), StoreError> {
        self.delete_prefix(&self.namespace).await.map(|_| ())
    }
}

/// Escape Redis glob metacharacters so a prefix matches literally.
fn escape_glob(prefix: &str) -> String {
    let mut escaped = String::with_capacity(prefix.len());
    for ch in prefix.chars() {
        if matches!(ch, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped
}
