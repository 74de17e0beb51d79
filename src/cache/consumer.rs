//! Invalidation consumer.
//!
//! Applies invalidation messages received from the bus to the local store.
//! Every process runs exactly one consumer, subscribed at startup.

use std::sync::Arc;

use async_trait::async_trait;
use metrics::counter;
use tracing::{info, instrument, warn};

use crate::messenger::{
    BusError, InvalidationBus, InvalidationMessage, MessageHandler, MessageKind, Subscription,
    channel_pattern, topic_from_channel,
};

use super::store::ResponseCache;

const METRIC_INVALIDATION: &str = "quire_cache_invalidation_total";

/// What a message did to the local store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Applied {
    Topic { topic: String, removed: u64 },
    Key(String),
    Flushed,
    Ignored,
    Failed,
}

/// Bus subscriber that evicts local entries.
pub struct CacheConsumer {
    cache: ResponseCache,
    bus: Arc<dyn InvalidationBus>,
    namespace: String,
}

impl CacheConsumer {
    /// `namespace` is the messenger namespace used to build channel names.
    pub fn new(
        cache: ResponseCache,
        bus: Arc<dyn InvalidationBus>,
        namespace: impl Into<String>,
    ) -> Self {
        Self {
            cache,
            bus,
            namespace: namespace.into(),
        }
    }

    /// Subscribe to every invalidation channel of the namespace.
    pub async fn start(self: Arc<Self>) -> Result<Subscription, BusError> {
        let pattern = channel_pattern(&self.namespace);
        let bus = Arc::clone(&self.bus);
        let subscription = bus.subscribe(&pattern, self).await?;
        info!(
            pattern = %pattern,
            bus = bus.name(),
            "Cache invalidation consumer started"
        );
        Ok(subscription)
    }

    /// Apply one message. Idempotent.
    #[instrument(skip(self, message), fields(kind = ?message.kind, message_id = %message.id))]
    pub async fn apply(&self, channel: &str, message: &InvalidationMessage) -> Applied {
        let topic = message
            .topic
            .as_deref()
            .or_else(|| topic_from_channel(&self.namespace, channel));

        let applied = match (message.kind, topic, message.key.as_deref()) {
            (MessageKind::Unknown, _, _) => {
                warn!(channel, "Ignoring invalidation message of unknown type");
                return Applied::Ignored;
            }
            (MessageKind::Flush, _, _)
            | (MessageKind::Invalidate, None, _)
            | (MessageKind::Evict, None, None) => {
                self.cache.flush().await.map(|()| Applied::Flushed)
            }
            (MessageKind::Evict, _, Some(key)) => self
                .cache
                .evict(key)
                .await
                .map(|()| Applied::Key(key.to_string())),
            (MessageKind::Invalidate | MessageKind::Evict, Some(topic), _) => self
                .cache
                .evict_topic(topic)
                .await
                .map(|removed| Applied::Topic {
                    topic: topic.to_string(),
                    removed,
                }),
        };

        match applied {
            Ok(applied) => {
                let kind = match message.kind {
                    MessageKind::Invalidate => "invalidate",
                    MessageKind::Evict => "evict",
                    MessageKind::Flush => "flush",
                    MessageKind::Unknown => "unknown",
                };
                counter!(METRIC_INVALIDATION, "kind" => kind).increment(1);
                info!(
                    channel,
                    origin = message.origin.as_deref().unwrap_or("-"),
                    applied = ?applied,
                    "Applied cache invalidation"
                );
                applied
            }
            // The facade has already logged and counted the store error.
            Err(_) => Applied::Failed,
        }
    }
}

#[async_trait]
impl MessageHandler for CacheConsumer {
    async fn handle(&self, channel: &str, message: InvalidationMessage) {
        self.apply(channel, &message).await;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;

    use super::*;
    use crate::cache::{
        clock::ManualClock,
        config::CacheConfig,
        memory::MemoryStore,
        store::{CachedResponse, Lookup},
    };
    use crate::messenger::{LocalBus, channel_for};

    const NS: &str = "quire:response:";

    fn consumer() -> (CacheConsumer, ResponseCache) {
        let store = Arc::new(MemoryStore::new(&CacheConfig::default()));
        let cache = ResponseCache::new(store, Arc::new(ManualClock::default()), NS);
        let consumer = CacheConsumer::new(cache.clone(), Arc::new(LocalBus::new()), "quire");
        (consumer, cache)
    }

    async fn fill(cache: &ResponseCache, key: &str) {
        let response = CachedResponse {
            status: 200,
            content_type: None,
            body: Bytes::from_static(b"{}"),
        };
        cache
            .fill(key, &response, Duration::from_secs(60))
            .await
            .expect("fill");
    }

    async fn is_hit(cache: &ResponseCache, key: &str) -> bool {
        matches!(cache.lookup(key).await, Lookup::Hit { .. })
    }

    #[tokio::test]
    async fn invalidate_evicts_the_topic_only() {
        let (consumer, cache) = consumer();
        fill(&cache, "quire:response:items:1").await;
        fill(&cache, "quire:response:settings:1").await;

        let applied = consumer
            .apply(
                &channel_for("quire", "items"),
                &InvalidationMessage::invalidate("items"),
            )
            .await;

        assert_eq!(
            applied,
            Applied::Topic {
                topic: "items".to_string(),
                removed: 1
            }
        );
        assert!(!is_hit(&cache, "quire:response:items:1").await);
        assert!(is_hit(&cache, "quire:response:settings:1").await);
    }

    #[tokio::test]
    async fn topic_falls_back_to_channel_name() {
        let (consumer, cache) = consumer();
        fill(&cache, "quire:response:items:1").await;

        let message = InvalidationMessage::decode(r#"{"type":"invalidate"}"#).expect("decode");
        consumer
            .apply(&channel_for("quire", "items"), &message)
            .await;

        assert!(!is_hit(&cache, "quire:response:items:1").await);
    }

    #[tokio::test]
    async fn invalidate_without_topic_flushes() {
        let (consumer, cache) = consumer();
        fill(&cache, "quire:response:items:1").await;
        fill(&cache, "quire:response:settings:1").await;

        let message = InvalidationMessage::decode(r#"{"type":"invalidate"}"#).expect("decode");
        let applied = consumer.apply("elsewhere", &message).await;

        assert_eq!(applied, Applied::Flushed);
        assert!(!is_hit(&cache, "quire:response:settings:1").await);
    }

    #[tokio::test]
    async fn evict_removes_a_single_key() {
        let (consumer, cache) = consumer();
        fill(&cache, "quire:response:items:1").await;
        fill(&cache, "quire:response:items:2").await;

        consumer
            .apply(
                &channel_for("quire", "items"),
                &InvalidationMessage::evict("items", "quire:response:items:1"),
            )
            .await;

        assert!(!is_hit(&cache, "quire:response:items:1").await);
        assert!(is_hit(&cache, "quire:response:items:2").await);
    }

    #[tokio::test]
    async fn unknown_messages_are_ignored() {
        let (consumer, cache) = consumer();
        fill(&cache, "quire:response:items:1").await;

        let message = InvalidationMessage::decode(r#"{"type":"reload"}"#).expect("decode");
        let applied = consumer
            .apply(&channel_for("quire", "items"), &message)
            .await;

        assert_eq!(applied, Applied::Ignored);
        assert!(is_hit(&cache, "quire:response:items:1").await);
    }

    #[tokio::test]
    async fn repeated_invalidation_is_harmless() {
        let (consumer, cache) = consumer();
        fill(&cache, "quire:response:items:1").await;
        let message = InvalidationMessage::invalidate("items");

        consumer.apply("quire:invalidate:items", &message).await;
        let second = consumer.apply("quire:invalidate:items", &message).await;

        assert_eq!(
            second,
            Applied::Topic {
                topic: "items".to_string(),
                removed: 0
            }
        );
    }
}
