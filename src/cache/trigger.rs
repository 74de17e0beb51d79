//! Mutation hook.
//!
//! Business logic calls [`CacheTrigger::notify_mutated`] once after every
//! successful write. The hook evicts the topic locally and publishes an
//! invalidation so every other process does the same.

use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{Method, Request},
    middleware::Next,
    response::Response,
};
use metrics::counter;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::messenger::{InvalidationBus, InvalidationMessage, channel_for};

use super::config::CacheConfig;
use super::keys::topic_for_path;
use super::store::ResponseCache;

const METRIC_PUBLISH_ERROR: &str = "quire_bus_publish_error_total";

/// Topic used on the channel of full flushes.
pub const FLUSH_TOPIC: &str = "_all";

/// Cache trigger for write operations.
///
/// # Usage
///
/// ```ignore
/// // After a successful item update:
/// trigger.notify_mutated("items").await;
/// ```
#[derive(Clone)]
pub struct CacheTrigger {
    config: CacheConfig,
    cache: ResponseCache,
    bus: Arc<dyn InvalidationBus>,
    namespace: String,
    instance_id: String,
}

impl CacheTrigger {
    /// `namespace` is the messenger namespace used to build channel names.
    pub fn new(
        config: CacheConfig,
        cache: ResponseCache,
        bus: Arc<dyn InvalidationBus>,
        namespace: impl Into<String>,
    ) -> Self {
        Self {
            config,
            cache,
            bus,
            namespace: namespace.into(),
            instance_id: Uuid::new_v4().to_string(),
        }
    }

    /// Identifier stamped on every message this process publishes.
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    fn is_active(&self) -> bool {
        self.config.enabled && self.config.auto_purge
    }

    /// Invalidate `topic` everywhere.
    ///
    /// Never fails. The work runs on its own task so that a caller dropped
    /// mid-way (for instance a cancelled request) still gets its
    /// invalidation delivered.
    #[instrument(skip(self))]
    pub async fn notify_mutated(&self, topic: &str) {
        if !self.is_active() {
            debug!(topic, "Cache trigger skipped: auto purge disabled");
            return;
        }

        let message = InvalidationMessage::invalidate(topic).with_origin(&self.instance_id);
        let channel = channel_for(&self.namespace, topic);
        let this = self.clone();
        let topic = topic.to_string();

        let task = tokio::spawn(async move {
            // Store errors are already logged and counted by the facade.
            let _ = this.cache.evict_topic(&topic).await;
            this.publish(&channel, &message).await;
        });
        if let Err(err) = task.await {
            warn!(error = %err, "Cache invalidation task failed");
        }
    }

    /// Drop every entry in every process.
    #[instrument(skip(self))]
    pub async fn flush(&self) {
        if !self.config.enabled {
            debug!("Cache flush skipped: cache disabled");
            return;
        }

        let _ = self.cache.flush().await;
        let message = InvalidationMessage::flush().with_origin(&self.instance_id);
        self.publish(&channel_for(&self.namespace, FLUSH_TOPIC), &message)
            .await;
    }

    async fn publish(&self, channel: &str, message: &InvalidationMessage) {
        match self.bus.publish(channel, message).await {
            Ok(()) => debug!(channel, message_id = %message.id, "Published invalidation"),
            Err(err) => {
                counter!(METRIC_PUBLISH_ERROR).increment(1);
                warn!(
                    channel,
                    bus = self.bus.name(),
                    error = %err,
                    "Failed to publish invalidation; peers rely on TTL"
                );
            }
        }
    }
}

/// Invalidate a route's topic after every successful write to it.
///
/// For routes whose handlers do not call the hook themselves. `POST` to the
/// query endpoint is a read and never triggers.
pub async fn invalidate_on_write(
    State(trigger): State<CacheTrigger>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let response = next.run(request).await;

    let mutating = matches!(
        method,
        Method::POST | Method::PUT | Method::PATCH | Method::DELETE
    );
    if mutating
        && response.status().is_success()
        && !trigger.config.is_query_endpoint(&path)
    {
        trigger.notify_mutated(topic_for_path(&path)).await;
    }

    response
}
