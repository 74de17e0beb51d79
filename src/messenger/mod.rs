//! Invalidation bus.
//!
//! A best-effort publish/subscribe channel that tells every process "cached
//! data under this topic is stale". Delivery is at most once per live
//! subscriber with no persistence or replay; entry TTLs bound staleness when
//! a message is lost.
//!
//! ## Channels
//!
//! ```text
//! {namespace}:invalidate:{topic}      one channel per resource family
//! {namespace}:invalidate:*            pattern every consumer subscribes to
//! ```

mod local;
mod redis;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::JoinHandle;
use uuid::Uuid;

pub use local::LocalBus;
pub use redis::RedisBus;

const INVALIDATE_SEGMENT: &str = "invalidate";

#[derive(Debug, Error)]
pub enum BusError {
    #[error("invalidation bus unavailable: {0}")]
    Unavailable(String),
    #[error("failed to encode invalidation message: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("failed to subscribe to `{pattern}`: {reason}")]
    Subscribe { pattern: String, reason: String },
}

/// What a consumer should evict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    /// Drop every entry of the message's topic.
    Invalidate,
    /// Drop the single entry named by `key`.
    Evict,
    /// Drop everything.
    Flush,
    /// Sent by a newer peer; ignored.
    #[serde(other)]
    Unknown,
}

/// Message carried on an invalidation channel.
///
/// The wire shape is `{ "type": "invalidate" }` at minimum; `topic` and `key`
/// narrow the eviction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvalidationMessage {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    /// Instance that published the message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
}

impl InvalidationMessage {
    fn new(kind: MessageKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            topic: None,
            key: None,
            origin: None,
        }
    }

    pub fn invalidate(topic: impl Into<String>) -> Self {
        Self {
            topic: Some(topic.into()),
            ..Self::new(MessageKind::Invalidate)
        }
    }

    pub fn evict(topic: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            topic: Some(topic.into()),
            key: Some(key.into()),
            ..Self::new(MessageKind::Evict)
        }
    }

    pub fn flush() -> Self {
        Self::new(MessageKind::Flush)
    }

    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }

    pub fn encode(&self) -> Result<String, BusError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(raw: &str) -> Result<Self, BusError> {
        Ok(serde_json::from_str(raw)?)
    }
}

/// Receives messages delivered by a subscription.
///
/// Handlers may run more than once for overlapping invalidations and must be
/// idempotent.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, channel: &str, message: InvalidationMessage);
}

/// Background delivery task of a subscription.
pub struct Subscription {
    pattern: String,
    task: JoinHandle<()>,
}

impl Subscription {
    pub(crate) fn new(pattern: impl Into<String>, task: JoinHandle<()>) -> Self {
        Self {
            pattern: pattern.into(),
            task,
        }
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Stop delivering messages.
    pub fn abort(&self) {
        self.task.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

/// Publish/subscribe transport for invalidation messages.
#[async_trait]
pub trait InvalidationBus: Send + Sync {
    /// Short transport name for logs.
    fn name(&self) -> &'static str;

    /// Deliver `message` to every subscriber currently listening on `channel`.
    async fn publish(&self, channel: &str, message: &InvalidationMessage)
    -> Result<(), BusError>;

    /// Deliver messages on channels matching `pattern` (exact name, or a
    /// prefix followed by `*`) to `handler` until the subscription is aborted.
    async fn subscribe(
        &self,
        pattern: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<Subscription, BusError>;
}

/// Channel carrying invalidations for `topic`.
pub fn channel_for(namespace: &str, topic: &str) -> String {
    format!("{namespace}:{INVALIDATE_SEGMENT}:{topic}")
}

/// Pattern matching every invalidation channel of `namespace`.
pub fn channel_pattern(namespace: &str) -> String {
    format!("{namespace}:{INVALIDATE_SEGMENT}:*")
}

/// Topic encoded in an invalidation channel name.
pub fn topic_from_channel<'a>(namespace: &str, channel: &'a str) -> Option<&'a str> {
    channel
        .strip_prefix(namespace)?
        .strip_prefix(':')?
        .strip_prefix(INVALIDATE_SEGMENT)?
        .strip_prefix(':')
        .filter(|topic| !topic.is_empty())
}

/// Glob match supporting a single trailing `*`.
pub fn channel_matches(pattern: &str, channel: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => channel.starts_with(prefix),
        None => pattern == channel,
    }
}
