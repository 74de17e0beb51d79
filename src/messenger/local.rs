//! In-process invalidation bus.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, warn};

use super::{
    BusError, InvalidationBus, InvalidationMessage, MessageHandler, Subscription, channel_matches,
};

const DEFAULT_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
struct Envelope {
    channel: String,
    payload: String,
}

/// Broadcast-backed bus for a single process.
///
/// Several cache instances sharing one `LocalBus` behave like several server
/// processes sharing a Redis channel: each subscriber sees every message
/// published while it is live. Messages are encoded exactly as on the wire.
#[derive(Clone)]
pub struct LocalBus {
    sender: broadcast::Sender<Envelope>,
}

impl LocalBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Publish a raw payload, bypassing message encoding.
    pub fn publish_raw(&self, channel: &str, payload: impl Into<String>) {
        let _ = self.sender.send(Envelope {
            channel: channel.to_string(),
            payload: payload.into(),
        });
    }
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl InvalidationBus for LocalBus {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn publish(
        &self,
        channel: &str,
        message: &InvalidationMessage,
    ) -> Result<(), BusError> {
        let envelope = Envelope {
            channel: channel.to_string(),
            payload: message.encode()?,
        };

        match self.sender.send(envelope) {
            Ok(receivers) => debug!(channel, receivers, "published invalidation (local)"),
            Err(_) => debug!(channel, "published invalidation with no live subscribers"),
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        pattern: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<Subscription, BusError> {
        let mut receiver = self.sender.subscribe();
        let owned_pattern = pattern.to_string();

        let task = tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(envelope) => {
                        if !channel_matches(&owned_pattern, &envelope.channel) {
                            continue;
                        }
                        match InvalidationMessage::decode(&envelope.payload) {
                            Ok(message) => handler.handle(&envelope.channel, message).await,
                            Err(err) => warn!(
                                channel = %envelope.channel,
                                error = %err,
                                "Dropping undecodable invalidation message"
                            ),
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Invalidation subscriber lagged; messages lost");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });

        Ok(Subscription::new(pattern, task))
    }
}
