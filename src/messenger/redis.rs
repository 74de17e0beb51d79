//! Redis pub/sub invalidation bus for multi-instance deployments.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use deadpool_redis::Pool;
use futures::StreamExt;
use redis::AsyncCommands;
use tracing::{debug, error, info, warn};

use super::{BusError, InvalidationBus, InvalidationMessage, MessageHandler, Subscription};

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(300);

/// Bus backed by Redis `PUBLISH` / `PSUBSCRIBE`.
///
/// Publishing borrows a pooled connection. Each subscription holds a
/// dedicated pub/sub connection (pooled connections cannot `SUBSCRIBE`) and
/// reconnects with exponential backoff when it drops. Messages published
/// while a subscription is reconnecting are lost.
#[derive(Clone)]
pub struct RedisBus {
    pool: Pool,
    redis_url: String,
}

impl RedisBus {
    pub fn new(pool: Pool, redis_url: impl Into<String>) -> Self {
        Self {
            pool,
            redis_url: redis_url.into(),
        }
    }
}

#[async_trait]
impl InvalidationBus for RedisBus {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn publish(
        &self,
        channel: &str,
        message: &InvalidationMessage,
    ) -> Result<(), BusError> {
        let payload = message.encode()?;
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|err| BusError::Unavailable(format!("failed to get connection: {err}")))?;

        let receivers: i64 = conn
            .publish(channel, &payload)
            .await
            .map_err(|err| BusError::Unavailable(format!("PUBLISH failed: {err}")))?;

        debug!(channel, receivers, message_id = %message.id, "published invalidation (redis)");
        Ok(())
    }

    async fn subscribe(
        &self,
        pattern: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<Subscription, BusError> {
        let client = redis::Client::open(self.redis_url.as_str()).map_err(|err| {
            BusError::Subscribe {
                pattern: pattern.to_string(),
                reason: err.to_string(),
            }
        })?;

        let listener = Listener {
            client,
            pattern: pattern.to_string(),
            handler,
        };
        let task = tokio::spawn(listener.run());

        Ok(Subscription::new(pattern, task))
    }
}

struct Listener {
    client: redis::Client,
    pattern: String,
    handler: Arc<dyn MessageHandler>,
}

impl Listener {
    async fn run(self) {
        let mut backoff = INITIAL_BACKOFF;

        loop {
            match self.listen().await {
                Ok(()) => {
                    warn!(pattern = %self.pattern, "Invalidation stream ended, reconnecting");
                    backoff = INITIAL_BACKOFF;
                    tokio::time::sleep(backoff).await;
                }
                Err(err) => {
                    error!(
                        error = %err,
                        pattern = %self.pattern,
                        backoff_secs = backoff.as_secs(),
                        "Invalidation subscription error, reconnecting"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
            }
        }
    }

    /// Returns `Ok` when an established subscription ends, `Err` when it
    /// could not be established.
    async fn listen(&self) -> Result<(), BusError> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|err| BusError::Unavailable(format!("pub/sub connect failed: {err}")))?;

        pubsub
            .psubscribe(&self.pattern)
            .await
            .map_err(|err| BusError::Subscribe {
                pattern: self.pattern.clone(),
                reason: err.to_string(),
            })?;

        info!(pattern = %self.pattern, "Subscribed to invalidation channels");

        let mut stream = pubsub.on_message();
        while let Some(msg) = stream.next().await {
            let channel = msg.get_channel_name().to_string();
            let payload: String = match msg.get_payload() {
                Ok(payload) => payload,
                Err(err) => {
                    warn!(channel = %channel, error = %err, "failed to read invalidation payload");
                    continue;
                }
            };

            match InvalidationMessage::decode(&payload) {
                Ok(message) => self.handler.handle(&channel, message).await,
                Err(err) => warn!(
                    channel = %channel,
                    error = %err,
                    "Dropping undecodable invalidation message"
                ),
            }
        }

        Ok(())
    }
}
