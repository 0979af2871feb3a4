pub mod feed;
pub mod pubsub;
pub mod registry;

use serde::Serialize;
use uuid::Uuid;

use crate::models::AuditLogView;

pub use feed::LiveFeed;
pub use pubsub::{MemoryPubSub, PgPubSub, PubSub};
pub use registry::{ConnectionRegistry, LiveSink};

#[derive(Debug, thiserror::Error)]
pub enum FanoutError {
    #[error("connection closed")]
    Closed,

    #[error("connection is not keeping up")]
    SlowConsumer,

    #[error("pubsub database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("pubsub payload error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Pub/sub channel carrying live traffic for one tenant.
pub fn tenant_channel(tenant_id: Uuid) -> String {
    format!("tenant:{tenant_id}")
}

/// Frames the feed pushes to live sockets. Alerts travel in their queue
/// wire form.
#[derive(Debug, Serialize)]
#[serde(tag = "type")]
pub enum LiveMessage<'a> {
    #[serde(rename = "log.view")]
    LogView { log: &'a AuditLogView },
}

impl LiveMessage<'_> {
    pub fn to_text(&self) -> Result<String, FanoutError> {
        Ok(serde_json::to_string(self)?)
    }
}
