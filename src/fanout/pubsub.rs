use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use sqlx::postgres::PgListener;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use super::FanoutError;

/// Postgres NOTIFY channel every instance listens on.
const NOTIFY_CHANNEL: &str = "auditlog_live";

/// Buffered messages per subscriber before it starts lagging.
const CHANNEL_CAPACITY: usize = 256;

/// Cross-instance bridge: a message published on a channel reaches every
/// subscriber of that channel, whichever process it lives in.
#[async_trait]
pub trait PubSub: Send + Sync {
    async fn publish(&self, channel: &str, message: String) -> Result<(), FanoutError>;

    fn subscribe(&self, channel: &str) -> broadcast::Receiver<String>;
}

/// Single-process pub/sub.
pub struct MemoryPubSub {
    channels: DashMap<String, broadcast::Sender<String>>,
    capacity: usize,
}

impl Default for MemoryPubSub {
    fn default() -> Self {
        Self {
            channels: DashMap::new(),
            capacity: CHANNEL_CAPACITY,
        }
    }
}

impl MemoryPubSub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hand `message` to local subscribers of `channel`; returns how many got it.
    pub fn deliver(&self, channel: &str, message: String) -> usize {
        let delivered = match self.channels.get(channel) {
            Some(tx) => tx.send(message).unwrap_or(0),
            None => 0,
        };
        self.channels
            .remove_if(channel, |_, tx| tx.receiver_count() == 0);
        delivered
    }
}

#[async_trait]
impl PubSub for MemoryPubSub {
    async fn publish(&self, channel: &str, message: String) -> Result<(), FanoutError> {
        self.deliver(channel, message);
        Ok(())
    }

    fn subscribe(&self, channel: &str) -> broadcast::Receiver<String> {
        self.channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }
}

#[derive(Serialize, Deserialize)]
struct Notification {
    channel: String,
    message: String,
}

/// Pub/sub over Postgres LISTEN/NOTIFY. Every instance runs one listener on
/// [`NOTIFY_CHANNEL`] and fans notifications out to its local subscribers.
/// NOTIFY payloads are capped at 8000 bytes; larger messages fail to publish.
pub struct PgPubSub {
    pool: PgPool,
    local: Arc<MemoryPubSub>,
    relay: JoinHandle<()>,
}

impl PgPubSub {
    pub async fn connect(pool: PgPool) -> Result<Self, FanoutError> {
        let mut listener = PgListener::connect_with(&pool).await?;
        listener.listen(NOTIFY_CHANNEL).await?;

        let local = Arc::new(MemoryPubSub::new());
        let relay = tokio::spawn(relay_notifications(listener, local.clone()));

        tracing::info!(channel = NOTIFY_CHANNEL, "postgres pubsub listening");
        Ok(Self { pool, local, relay })
    }
}

async fn relay_notifications(mut listener: PgListener, local: Arc<MemoryPubSub>) {
    loop {
        // recv reconnects on its own after a dropped connection.
        match listener.recv().await {
            Ok(notification) => {
                match serde_json::from_str::<Notification>(notification.payload()) {
                    Ok(n) => {
                        local.deliver(&n.channel, n.message);
                    }
                    Err(e) => tracing::warn!("ignoring malformed pubsub notification: {e}"),
                }
            }
            Err(e) => {
                tracing::error!("pubsub listener error: {e}");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

impl Drop for PgPubSub {
    fn drop(&mut self) {
        self.relay.abort();
    }
}

#[async_trait]
impl PubSub for PgPubSub {
    async fn publish(&self, channel: &str, message: String) -> Result<(), FanoutError> {
        let payload = serde_json::to_string(&Notification {
            channel: channel.to_string(),
            message,
        })?;

        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(NOTIFY_CHANNEL)
            .bind(payload)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    fn subscribe(&self, channel: &str) -> broadcast::Receiver<String> {
        self.local.subscribe(channel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_only_their_channel() {
        let pubsub = MemoryPubSub::new();
        let mut a = pubsub.subscribe("tenant:a");
        let mut b = pubsub.subscribe("tenant:b");

        pubsub.publish("tenant:a", "hello".to_string()).await.unwrap();

        assert_eq!(a.recv().await.unwrap(), "hello");
        assert!(b.try_recv().is_err());
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_dropped() {
        let pubsub = MemoryPubSub::new();
        pubsub.publish("tenant:none", "lost".to_string()).await.unwrap();

        let mut late = pubsub.subscribe("tenant:none");
        assert!(late.try_recv().is_err());
    }

    #[tokio::test]
    async fn channel_is_released_once_unsubscribed() {
        let pubsub = MemoryPubSub::new();
        let rx = pubsub.subscribe("tenant:x");
        drop(rx);

        assert_eq!(pubsub.deliver("tenant:x", "gone".to_string()), 0);
        assert!(pubsub.channels.is_empty());
    }
}
