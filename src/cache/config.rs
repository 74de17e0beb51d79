//! Cache configuration.
//!
//! Controls the response cache via the `[cache]` section of `quire.toml`
//! or `QUIRE__CACHE__*` environment variables.

use std::num::NonZeroUsize;
use std::time::Duration;

use serde::Deserialize;

const DEFAULT_TTL_SECS: u64 = 300;
const DEFAULT_STATUS_HEADER: &str = "x-cache";
const DEFAULT_NAMESPACE: &str = "quire:response:";
const DEFAULT_MEMORY_LIMIT: usize = 1000;
const DEFAULT_VALUE_MAX_BYTES: usize = 1024 * 1024;
const DEFAULT_QUERY_ENDPOINT: &str = "/query";

/// Which backend holds cached responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    /// Per-process LRU map.
    Memory,
    /// Shared Redis instance.
    Redis,
}

/// Resolved cache configuration.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Global toggle. When false every request bypasses the cache.
    pub enabled: bool,
    /// Lifetime of a filled entry.
    pub ttl: Duration,
    /// Diagnostic header carrying `HIT`/`MISS`. `None` disables it.
    pub status_header: Option<String>,
    /// Honour client `Cache-Control: no-cache`/`no-store`.
    pub skip_allowed: bool,
    /// Publish invalidations after successful mutations.
    pub auto_purge: bool,
    /// Prefix for every payload key.
    pub namespace: String,
    pub store: StoreKind,
    /// Maximum entries held by the memory store.
    pub memory_limit: usize,
    /// Responses larger than this are never written back.
    pub value_max_bytes: usize,
    /// POST endpoint that is semantically a read.
    pub query_endpoint: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl: Duration::from_secs(DEFAULT_TTL_SECS),
            status_header: Some(DEFAULT_STATUS_HEADER.to_string()),
            skip_allowed: true,
            auto_purge: true,
            namespace: DEFAULT_NAMESPACE.to_string(),
            store: StoreKind::Memory,
            memory_limit: DEFAULT_MEMORY_LIMIT,
            value_max_bytes: DEFAULT_VALUE_MAX_BYTES,
            query_endpoint: DEFAULT_QUERY_ENDPOINT.to_string(),
        }
    }
}

impl From<&crate::config::CacheSettings> for CacheConfig {
    fn from(settings: &crate::config::CacheSettings) -> Self {
        Self {
            enabled: settings.enabled,
            ttl: settings.ttl,
            status_header: settings.status_header.clone(),
            skip_allowed: settings.skip_allowed,
            auto_purge: settings.auto_purge,
            namespace: settings.namespace.clone(),
            store: settings.store,
            memory_limit: settings.memory_limit.get(),
            value_max_bytes: settings.value_max_bytes.get(),
            query_endpoint: settings.query_endpoint.clone(),
        }
    }
}

impl CacheConfig {
    /// Returns the memory limit as NonZeroUsize, clamping to 1 if zero.
    pub fn memory_limit_non_zero(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.memory_limit).unwrap_or(NonZeroUsize::MIN)
    }

    /// True when `path` is the designated query endpoint.
    pub fn is_query_endpoint(&self, path: &str) -> bool {
        !self.query_endpoint.is_empty() && path == self.query_endpoint
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_values() {
        let config = CacheConfig::default();
        assert!(config.enabled);
        assert_eq!(config.ttl, Duration::from_secs(300));
        assert_eq!(config.status_header.as_deref(), Some("x-cache"));
        assert!(config.skip_allowed);
        assert!(config.auto_purge);
        assert_eq!(config.namespace, "quire:response:");
        assert_eq!(config.store, StoreKind::Memory);
        assert_eq!(config.memory_limit, 1000);
        assert_eq!(config.value_max_bytes, 1024 * 1024);
        assert_eq!(config.query_endpoint, "/query");
    }

    #[test]
    fn non_zero_clamps_to_min() {
        let config = CacheConfig {
            memory_limit: 0,
            ..Default::default()
        };
        assert_eq!(config.memory_limit_non_zero().get(), 1);
    }

    #[test]
    fn query_endpoint_matches_exact_path() {
        let config = CacheConfig::default();
        assert!(config.is_query_endpoint("/query"));
        assert!(!config.is_query_endpoint("/query/extra"));

        let disabled = CacheConfig {
            query_endpoint: String::new(),
            ..Default::default()
        };
        assert!(!disabled.is_query_endpoint(""));
    }
}
