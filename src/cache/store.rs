//! Cache storage abstraction.
//!
//! A cached response lives under two keys: the payload key and a companion
//! expiry record (`{key}__expires_at`) holding the absolute expiry as unix
//! milliseconds. Freshness is computed from the expiry record alone, so
//! remaining TTL never requires decoding the payload. A payload without a
//! readable expiry record is never served.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use super::clock::Clock;
use super::keys::{expiry_key, topic_prefix};

const METRIC_STORE_ERROR: &str = "quire_cache_store_error_total";
const METRIC_LOOKUP_MS: &str = "quire_cache_lookup_ms";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("cache store unavailable: {0}")]
    Unavailable(String),
    #[error("malformed cache entry `{key}`: {reason}")]
    Malformed { key: String, reason: String },
    #[error("failed to encode cached response: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable(message.into())
    }

    fn malformed(key: &str, reason: impl Into<String>) -> Self {
        Self::Malformed {
            key: key.to_string(),
            reason: reason.into(),
        }
    }
}

/// Key/value backend with a companion expiry record per entry.
///
/// Implementations must be safe for concurrent use and must write a payload
/// and its expiry record so that a concurrent reader observes both or neither.
/// Deletes are idempotent.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Short backend name for logs.
    fn name(&self) -> &'static str;

    /// Cheap, I/O-free availability hint consulted before any lookup.
    fn is_available(&self) -> bool {
        true
    }

    /// Raw read of any key. A missing key is `Ok(None)`.
    async fn get(&self, key: &str) -> Result<Option<Bytes>, StoreError>;

    /// Read a payload and its expiry record together.
    async fn get_entry(&self, key: &str) -> Result<(Option<Bytes>, Option<Bytes>), StoreError> {
        let payload = self.get(key).await?;
        if payload.is_none() {
            return Ok((None, None));
        }
        let expiry = self.get(&expiry_key(key)).await?;
        Ok((payload, expiry))
    }

    /// Write `payload` under `key` and `expires_at_ms` under its expiry key.
    async fn set(
        &self,
        key: &str,
        payload: Bytes,
        expires_at_ms: i64,
        ttl: Duration,
    ) -> Result<(), StoreError>;

    /// Remove a payload and its expiry record.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Remove every entry whose key starts with `prefix`. Returns the number
    /// of payload entries removed.
    async fn delete_prefix(&self, prefix: &str) -> Result<u64, StoreError>;

    /// Remove every entry owned by this store.
    async fn clear(&self) -> Result<(), StoreError>;
}

/// A response body as stored in the cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedResponse {
    pub status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(with = "body_base64")]
    pub body: Bytes,
}

impl CachedResponse {
    pub fn encode(&self) -> Result<Bytes, StoreError> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    pub fn decode(key: &str, raw: &[u8]) -> Result<Self, StoreError> {
        serde_json::from_slice(raw).map_err(|err| StoreError::malformed(key, err.to_string()))
    }
}

/// Why a lookup did not produce a servable entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissReason {
    Absent,
    Expired,
    MissingExpiry,
    Malformed,
    Unavailable,
}

impl MissReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Absent => "absent",
            Self::Expired => "expired",
            Self::MissingExpiry => "missing_expiry",
            Self::Malformed => "malformed",
            Self::Unavailable => "unavailable",
        }
    }
}

/// Outcome of a cache read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    Hit {
        response: CachedResponse,
        remaining: Duration,
    },
    Miss(MissReason),
}

/// Typed, fail-open facade over a `CacheStore`.
///
/// Constructed once per process and shared by the cache gate, the
/// invalidation consumer and the mutation hook.
#[derive(Clone)]
pub struct ResponseCache {
    store: Arc<dyn CacheStore>,
    clock: Arc<dyn Clock>,
    namespace: String,
}

impl ResponseCache {
    pub fn new(
        store: Arc<dyn CacheStore>,
        clock: Arc<dyn Clock>,
        namespace: impl Into<String>,
    ) -> Self {
        Self {
            store,
            clock,
            namespace: namespace.into(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn is_available(&self) -> bool {
        self.store.is_available()
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Read a payload and its expiry record.
    ///
    /// Never fails: store errors become `Miss(Unavailable)`, broken entries
    /// become `Miss(Malformed | MissingExpiry)` and are deleted best-effort.
    pub async fn lookup(&self, key: &str) -> Lookup {
        let started_at = Instant::now();
        let outcome = self.lookup_inner(key).await;
        histogram!(METRIC_LOOKUP_MS, "store" => self.store.name())
            .record(started_at.elapsed().as_secs_f64() * 1000.0);

        match outcome {
            Ok(lookup) => lookup,
            Err(StoreError::Malformed { key, reason }) => {
                warn!(cache_key = %key, reason = %reason, "Discarding malformed cache entry");
                self.discard(&key).await;
                Lookup::Miss(MissReason::Malformed)
            }
            Err(err) => {
                self.report_error("get", &err);
                Lookup::Miss(MissReason::Unavailable)
            }
        }
    }

    async fn lookup_inner(&self, key: &str) -> Result<Lookup, StoreError> {
        let (payload, expiry) = self.store.get_entry(key).await?;
        let Some(raw) = payload else {
            return Ok(Lookup::Miss(MissReason::Absent));
        };

        let Some(expires_raw) = expiry else {
            debug!(cache_key = %key, "Cache entry has no expiry record");
            self.discard(key).await;
            return Ok(Lookup::Miss(MissReason::MissingExpiry));
        };

        let expires_at_ms = parse_expiry(key, &expires_raw)?;
        let remaining_ms = expires_at_ms.saturating_sub(self.clock.now_millis());
        if remaining_ms <= 0 {
            self.discard(key).await;
            return Ok(Lookup::Miss(MissReason::Expired));
        }

        let response = CachedResponse::decode(key, &raw)?;
        Ok(Lookup::Hit {
            response,
            remaining: Duration::from_millis(remaining_ms.unsigned_abs()),
        })
    }

    /// Store a response for `ttl`. A zero TTL stores nothing.
    pub async fn fill(
        &self,
        key: &str,
        response: &CachedResponse,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        if ttl.is_zero() {
            return Ok(());
        }

        let payload = response.encode()?;
        let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        let expires_at_ms = self.clock.now_millis().saturating_add(ttl_ms);

        self.store
            .set(key, payload, expires_at_ms, ttl)
            .await
            .inspect_err(|err| self.report_error("set", err))
    }

    /// Remove a single entry.
    pub async fn evict(&self, key: &str) -> Result<(), StoreError> {
        self.store
            .delete(key)
            .await
            .inspect_err(|err| self.report_error("delete", err))
    }

    /// Remove every entry of a resource family.
    pub async fn evict_topic(&self, topic: &str) -> Result<u64, StoreError> {
        let prefix = topic_prefix(&self.namespace, topic);
        self.store
            .delete_prefix(&prefix)
            .await
            .inspect_err(|err| self.report_error("delete_prefix", err))
    }

    /// Remove everything.
    pub async fn flush(&self) -> Result<(), StoreError> {
        self.store
            .clear()
            .await
            .inspect_err(|err| self.report_error("clear", err))
    }

    async fn discard(&self, key: &str) {
        if let Err(err) = self.store.delete(key).await {
            debug!(cache_key = %key, error = %err, "Opportunistic delete failed");
        }
    }

    fn report_error(&self, op: &'static str, err: &StoreError) {
        counter!(METRIC_STORE_ERROR, "op" => op).increment(1);
        warn!(
            op,
            store = self.store.name(),
            error = %err,
            "Cache store operation failed; continuing without cache"
        );
    }
}

fn parse_expiry(key: &str, raw: &[u8]) -> Result<i64, StoreError> {
    std::str::from_utf8(raw)
        .ok()
        .and_then(|text| text.trim().parse::<i64>().ok())
        .ok_or_else(|| StoreError::malformed(key, "expiry record is not a unix timestamp"))
}

mod body_base64 {
    use base64::{Engine as _, engine::general_purpose::STANDARD};
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer, de::Error as _};

    pub fn serialize<S: Serializer>(body: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(body))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map(Bytes::from)
            .map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::clock::ManualClock;
    use crate::cache::config::CacheConfig;
    use crate::cache::memory::MemoryStore;

    const NS: &str = "quire:response:";

    fn cache() -> (ResponseCache, Arc<ManualClock>, Arc<MemoryStore>) {
        let clock = Arc::new(ManualClock::default());
        let store = Arc::new(MemoryStore::new(&CacheConfig::default()));
        let cache = ResponseCache::new(store.clone(), clock.clone(), NS);
        (cache, clock, store)
    }

    fn response(body: &'static str) -> CachedResponse {
        CachedResponse {
            status: 200,
            content_type: Some("application/json".to_string()),
            body: Bytes::from_static(body.as_bytes()),
        }
    }

    #[tokio::test]
    async fn fill_then_lookup_hits_with_bounded_remaining() {
        let (cache, _clock, _store) = cache();
        let key = format!("{NS}items:abc");
        let ttl = Duration::from_secs(60);

        cache.fill(&key, &response("[]"), ttl).await.expect("fill");

        match cache.lookup(&key).await {
            Lookup::Hit {
                response: cached,
                remaining,
            } => {
                assert_eq!(cached, response("[]"));
                assert!(remaining <= ttl);
                assert!(remaining > Duration::ZERO);
            }
            other => panic!("expected hit, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn lookup_misses_after_ttl_elapses() {
        let (cache, clock, store) = cache();
        let key = format!("{NS}items:abc");

        cache
            .fill(&key, &response("[]"), Duration::from_secs(60))
            .await
            .expect("fill");
        clock.advance(Duration::from_secs(60));

        assert_eq!(cache.lookup(&key).await, Lookup::Miss(MissReason::Expired));
        assert!(store.is_empty(), "expired entry is discarded");
    }

    #[tokio::test]
    async fn payload_without_expiry_is_not_fresh() {
        let (cache, _clock, store) = cache();
        let key = format!("{NS}items:abc");
        store.insert_raw(&key, response("[]").encode().expect("encode"));

        assert_eq!(
            cache.lookup(&key).await,
            Lookup::Miss(MissReason::MissingExpiry)
        );
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn unparsable_expiry_is_malformed() {
        let (cache, _clock, store) = cache();
        let key = format!("{NS}items:abc");
        store.insert_raw(&key, response("[]").encode().expect("encode"));
        store.insert_raw(&expiry_key(&key), Bytes::from_static(b"tomorrow"));

        assert_eq!(cache.lookup(&key).await, Lookup::Miss(MissReason::Malformed));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn undecodable_payload_is_malformed() {
        let (cache, clock, store) = cache();
        let key = format!("{NS}items:abc");
        let later = clock.now_millis() + 60_000;
        store.insert_raw(&key, Bytes::from_static(b"not json"));
        store.insert_raw(&expiry_key(&key), Bytes::from(later.to_string()));

        assert_eq!(cache.lookup(&key).await, Lookup::Miss(MissReason::Malformed));
    }

    #[tokio::test]
    async fn zero_ttl_stores_nothing() {
        let (cache, _clock, store) = cache();
        cache
            .fill("k", &response("[]"), Duration::ZERO)
            .await
            .expect("fill");
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn evict_topic_only_touches_that_topic() {
        let (cache, _clock, _store) = cache();
        let items = format!("{NS}items:1");
        let settings = format!("{NS}settings:1");
        let ttl = Duration::from_secs(60);

        cache.fill(&items, &response("a"), ttl).await.expect("fill");
        cache.fill(&settings, &response("b"), ttl).await.expect("fill");

        assert_eq!(cache.evict_topic("items").await.expect("evict"), 1);
        assert_eq!(cache.lookup(&items).await, Lookup::Miss(MissReason::Absent));
        assert!(matches!(cache.lookup(&settings).await, Lookup::Hit { .. }));
    }

    #[test]
    fn cached_response_encodes_body_as_base64() {
        let encoded = response("hello").encode().expect("encode");
        let json: serde_json::Value = serde_json::from_slice(&encoded).expect("json");
        assert_eq!(json["body"], "aGVsbG8=");
        assert_eq!(
            CachedResponse::decode("k", &encoded).expect("decode"),
            response("hello")
        );
    }
}
