//! Quire response cache.
//!
//! Caches complete HTTP responses for read requests and keeps every process
//! consistent through the invalidation bus:
//!
//! - **Gate** (`middleware`): serves fresh entries, writes back misses
//! - **Store** (`memory`, `redis`): payload plus `__expires_at` record per key
//! - **Hook** (`trigger`): evicts and publishes after a successful write
//! - **Consumer** (`consumer`): applies invalidations received from peers
//!
//! ## Configuration
//!
//! ```toml
//! [cache]
//! enabled = true
//! ttl_seconds = 300
//! status_header = "x-cache"
//! store = "memory"        # or "redis"
//! # ... see config.rs for all options
//! ```

mod clock;
mod config;
mod consumer;
mod keys;
mod lock;
mod memory;
mod middleware;
mod policy;
mod redis;
mod store;
mod trigger;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{CacheConfig, StoreKind};
pub use consumer::{Applied, CacheConsumer};
pub use keys::{
    CallerIdentity, EXPIRY_SUFFIX, ROOT_TOPIC, RequestFingerprint, derive_key, expiry_key,
    is_expiry_key, topic_for_path, topic_prefix,
};
pub use memory::MemoryStore;
pub use middleware::{CacheState, cache_control_value, response_cache_layer};
pub use policy::{BypassCache, SkipReason, should_skip, skip_reason};
pub use redis::RedisStore;
pub use store::{CacheStore, CachedResponse, Lookup, MissReason, ResponseCache, StoreError};
pub use trigger::{CacheTrigger, FLUSH_TOPIC, invalidate_on_write};
