pub mod events;
pub mod memory;
pub mod postgres;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

pub use events::{AlertEvent, LogsCreated, QueueEvent};
pub use memory::MemoryQueue;
pub use postgres::PgQueue;

/// Messages handed out per receive while purging.
const PURGE_BATCH: usize = 10;

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("queue transport error: {0}")]
    Transport(String),

    #[error("queue database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("invalid receipt handle: {0}")]
    InvalidReceipt(String),
}

/// A received message. Owned by the queue until deleted; if the visibility
/// timeout lapses first it is handed out again with a fresh receipt handle.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueMessage {
    pub message_id: String,
    pub body: String,
    pub receipt_handle: String,
    pub receive_count: i32,
}

/// A durable at-least-once queue.
#[async_trait]
pub trait QueueTransport: Send + Sync {
    /// Enqueue a serialized body, returning the transport-assigned id.
    async fn send(&self, body: String) -> Result<String, QueueError>;

    /// Long-poll for up to `max_messages`, waiting at most `wait`. Returned
    /// messages stay hidden from other receivers for `visibility_timeout`.
    async fn receive(
        &self,
        max_messages: usize,
        wait: Duration,
        visibility_timeout: Duration,
    ) -> Result<Vec<QueueMessage>, QueueError>;

    /// Acknowledge a message. Unknown or stale handles are a no-op.
    async fn delete(&self, receipt_handle: &str) -> Result<(), QueueError>;

    async fn delete_batch(&self, receipt_handles: &[String]) -> Result<(), QueueError>;

    /// Keep a copy of a message whose processing failed.
    async fn dead_letter(&self, message: &QueueMessage, reason: &str) -> Result<(), QueueError>;
}

/// Shared handle used by every producer and by the consumer loop.
#[derive(Clone)]
pub struct QueueClient {
    transport: Arc<dyn QueueTransport>,
}

impl QueueClient {
    pub fn new(transport: Arc<dyn QueueTransport>) -> Self {
        Self { transport }
    }

    /// Serialize and enqueue `payload`. Failures are logged and reported as
    /// `None` so producers never block on queue health.
    pub async fn send<T>(&self, payload: &T) -> Option<String>
    where
        T: Serialize + ?Sized,
    {
        let body = match serde_json::to_string(payload) {
            Ok(body) => body,
            Err(e) => {
                tracing::error!("[queue] failed to serialize payload: {e}");
                return None;
            }
        };

        match self.transport.send(body).await {
            Ok(message_id) => {
                tracing::debug!(%message_id, "[queue] message sent");
                Some(message_id)
            }
            Err(e) => {
                tracing::error!("[queue] send failed: {e}");
                None
            }
        }
    }

    pub async fn receive(
        &self,
        max_messages: usize,
        wait: Duration,
        visibility_timeout: Duration,
    ) -> Result<Vec<QueueMessage>, QueueError> {
        self.transport
            .receive(max_messages, wait, visibility_timeout)
            .await
    }

    pub async fn delete(&self, receipt_handle: &str) -> Result<(), QueueError> {
        self.transport.delete(receipt_handle).await
    }

    pub async fn dead_letter(&self, message: &QueueMessage, reason: &str) -> Result<(), QueueError> {
        self.transport.dead_letter(message, reason).await
    }

    /// Drain the queue in batches until a receive comes back empty.
    /// Maintenance only; returns the number of messages removed.
    pub async fn purge(&self) -> Result<u64, QueueError> {
        let mut purged = 0u64;
        loop {
            let batch = self
                .transport
                .receive(PURGE_BATCH, Duration::ZERO, Duration::from_secs(30))
                .await?;
            if batch.is_empty() {
                break;
            }

            let handles: Vec<String> = batch.into_iter().map(|m| m.receipt_handle).collect();
            self.transport.delete_batch(&handles).await?;
            purged += handles.len() as u64;
        }

        tracing::info!(purged, "[queue] purge complete");
        Ok(purged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct BrokenTransport;

    #[async_trait]
    impl QueueTransport for BrokenTransport {
        async fn send(&self, _body: String) -> Result<String, QueueError> {
            Err(QueueError::Transport("unreachable".to_string()))
        }

        async fn receive(
            &self,
            _max_messages: usize,
            _wait: Duration,
            _visibility_timeout: Duration,
        ) -> Result<Vec<QueueMessage>, QueueError> {
            Err(QueueError::Transport("unreachable".to_string()))
        }

        async fn delete(&self, _receipt_handle: &str) -> Result<(), QueueError> {
            Ok(())
        }

        async fn delete_batch(&self, _receipt_handles: &[String]) -> Result<(), QueueError> {
            Ok(())
        }

        async fn dead_letter(&self, _message: &QueueMessage, _reason: &str) -> Result<(), QueueError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn send_swallows_transport_failure() {
        let client = QueueClient::new(Arc::new(BrokenTransport));
        assert!(client.send(&json!({ "type": "logs.created" })).await.is_none());
    }

    #[tokio::test]
    async fn send_serializes_timestamps_as_iso8601() {
        let queue = Arc::new(MemoryQueue::new());
        let client = QueueClient::new(queue.clone());
        let at = chrono::DateTime::parse_from_rfc3339("2025-03-01T10:00:00Z")
            .unwrap()
            .with_timezone(&chrono::Utc);

        client.send(&json!({ "at": at })).await.unwrap();

        let msgs = client
            .receive(1, Duration::ZERO, Duration::from_secs(30))
            .await
            .unwrap();
        assert!(msgs[0].body.contains("2025-03-01T10:00:00Z"));
    }

    #[tokio::test]
    async fn purge_drains_everything() {
        let queue = Arc::new(MemoryQueue::new());
        let client = QueueClient::new(queue.clone());
        for i in 0..25 {
            client.send(&json!({ "n": i })).await.unwrap();
        }

        assert_eq!(client.purge().await.unwrap(), 25);
        assert_eq!(queue.len().await, 0);
    }
}
