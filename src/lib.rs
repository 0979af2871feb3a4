pub mod alerts;
pub mod auth;
pub mod config;
pub mod crypto;
pub mod db;
pub mod error;
pub mod fanout;
pub mod models;
pub mod queue;
pub mod rate_limit;
pub mod routes;
pub mod state;
pub mod worker;

use std::sync::Arc;

use axum::Router;
use axum::http::{HeaderName, HeaderValue};
use sqlx::PgPool;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;

use crate::config::{Config, PubSubBackend, QueueBackend};
use crate::crypto::FieldCipher;
use crate::fanout::{ConnectionRegistry, FanoutError, LiveFeed, MemoryPubSub, PgPubSub, PubSub};
use crate::queue::{MemoryQueue, PgQueue, QueueClient, QueueTransport};
use crate::rate_limit::TenantRateLimiter;
use crate::state::{AppState, SharedState};

/// Build shared state with the queue and pub/sub backends named in `config`.
pub async fn build_state(pool: PgPool, config: Config) -> Result<SharedState, FanoutError> {
    let transport: Arc<dyn QueueTransport> = match config.queue_backend {
        QueueBackend::Postgres => Arc::new(PgQueue::new(pool.clone())),
        QueueBackend::Memory => Arc::new(MemoryQueue::new()),
    };

    let pubsub: Arc<dyn PubSub> = match config.pubsub_backend {
        PubSubBackend::Memory => Arc::new(MemoryPubSub::new()),
        PubSubBackend::Postgres => Arc::new(PgPubSub::connect(pool.clone()).await?),
    };

    Ok(build_state_with(pool, config, transport, pubsub))
}

/// Build shared state around explicit backends.
pub fn build_state_with(
    pool: PgPool,
    config: Config,
    transport: Arc<dyn QueueTransport>,
    pubsub: Arc<dyn PubSub>,
) -> SharedState {
    let cipher = Arc::new(FieldCipher::new(&config.encryption_key));
    let live = LiveFeed::new(
        pool.clone(),
        cipher.clone(),
        Arc::new(ConnectionRegistry::new()),
        pubsub.clone(),
        config.live.clone(),
    );

    Arc::new(AppState {
        pool,
        config,
        cipher,
        queue: QueueClient::new(transport),
        pubsub,
        live,
        rate_limiter: Arc::new(TenantRateLimiter::new()),
    })
}

pub fn build_app(state: SharedState) -> Router {
    let max_body_size = state.config.max_body_size;

    Router::new()
        .merge(routes::api_routes())
        .route("/health", axum::routing::get(health))
        .layer(RequestBodyLimitLayer::new(max_body_size))
        .layer(TraceLayer::new_for_http())
        // Security headers
        .layer(SetResponseHeaderLayer::overriding(
            HeaderName::from_static("x-content-type-options"),
            HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            HeaderName::from_static("x-frame-options"),
            HeaderValue::from_static("DENY"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            HeaderName::from_static("referrer-policy"),
            HeaderValue::from_static("strict-origin-when-cross-origin"),
        ))
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}
