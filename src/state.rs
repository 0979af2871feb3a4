use std::sync::Arc;

use sqlx::PgPool;

use crate::config::Config;
use crate::crypto::FieldCipher;
use crate::fanout::{LiveFeed, PubSub};
use crate::queue::QueueClient;
use crate::rate_limit::TenantRateLimiter;

pub type SharedState = Arc<AppState>;

pub struct AppState {
    pub pool: PgPool,
    pub config: Config,
    pub cipher: Arc<FieldCipher>,
    pub queue: QueueClient,
    pub pubsub: Arc<dyn PubSub>,
    pub live: Arc<LiveFeed>,
    pub rate_limiter: Arc<TenantRateLimiter>,
}
