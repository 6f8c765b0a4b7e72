//! Redis pub/sub notifier for chunk-ready notifications (optional).
//!
//! Pub/sub is fire-and-forget: a notification published while no worker is
//! subscribed is lost. The chunk then stays QUEUED until the gate or an
//! operator returns it to READY, so this transport suits deployments where
//! workers are always connected.

use std::sync::mpsc;
use std::thread;

use redis::Commands;
use tracing::{debug, warn};

use batchflow_events::{ChunkReadyNotification, EventBus, Subscription};

#[derive(Debug, thiserror::Error)]
pub enum RedisNotifierError {
    #[error("redis error: {0}")]
    Redis(String),
    #[error("failed to encode notification: {0}")]
    Serialize(String),
}

/// Publishes [`ChunkReadyNotification`]s as JSON on one Redis channel.
#[derive(Debug, Clone)]
pub struct RedisPubSubNotifier {
    client: redis::Client,
    channel: String,
}

impl RedisPubSubNotifier {
    pub fn new(redis_url: impl AsRef<str>, channel: impl Into<String>) -> Result<Self, RedisNotifierError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| RedisNotifierError::Redis(e.to_string()))?;
        Ok(Self {
            client,
            channel: channel.into(),
        })
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }
}

impl EventBus<ChunkReadyNotification> for RedisPubSubNotifier {
    type Error = RedisNotifierError;

    fn publish(&self, message: ChunkReadyNotification) -> Result<(), Self::Error> {
        let payload = message
            .to_json()
            .map_err(|e| RedisNotifierError::Serialize(e.to_string()))?;

        let mut conn = self
            .client
            .get_connection()
            .map_err(|e| RedisNotifierError::Redis(e.to_string()))?;

        let receivers: i64 = conn
            .publish(&self.channel, payload)
            .map_err(|e| RedisNotifierError::Redis(e.to_string()))?;
        debug!(channel = %self.channel, chunk_id = %message.chunk_id, receivers, "notification published");

        Ok(())
    }

    fn subscribe(&self) -> Subscription<ChunkReadyNotification> {
        let (tx, rx) = mpsc::channel();

        let client = self.client.clone();
        let channel = self.channel.clone();

        // Forwards channel messages until the subscription is dropped or the
        // connection breaks; the receiver then sees `Disconnected`.
        thread::spawn(move || {
            let mut conn = match client.get_connection() {
                Ok(c) => c,
                Err(err) => {
                    warn!(error = %err, "redis subscriber could not connect");
                    return;
                }
            };

            let mut pubsub = conn.as_pubsub();
            if let Err(err) = pubsub.subscribe(&channel) {
                warn!(channel = %channel, error = %err, "redis subscribe failed");
                return;
            }

            loop {
                let msg = match pubsub.get_message() {
                    Ok(m) => m,
                    Err(err) => {
                        warn!(channel = %channel, error = %err, "redis subscription closed");
                        return;
                    }
                };

                let payload: String = match msg.get_payload() {
                    Ok(p) => p,
                    Err(_) => continue,
                };

                let notification = match ChunkReadyNotification::from_json(&payload) {
                    Ok(n) => n,
                    Err(err) => {
                        warn!(channel = %channel, error = %err, "dropping malformed notification");
                        continue;
                    }
                };

                if tx.send(notification).is_err() {
                    return;
                }
            }
        });

        Subscription::new(rx)
    }
}
