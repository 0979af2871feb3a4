pub mod admin;
pub mod live;
pub mod logs;

use axum::Router;
use axum::routing::{delete, get, post};

use crate::state::SharedState;

pub fn api_routes() -> Router<SharedState> {
    Router::new()
        // Audit logs
        .route("/api/v1/logs", get(logs::list).post(logs::create))
        .route("/api/v1/logs/bulk", post(logs::bulk_create))
        .route("/api/v1/logs/stats", get(logs::stats))
        .route("/api/v1/logs/export", get(logs::export))
        .route("/api/v1/logs/cleanup", delete(logs::cleanup))
        .route("/api/v1/logs/stream", get(live::stream))
        .route("/api/v1/logs/{id}", get(logs::get))
        // Admin
        .route("/api/v1/admin/tenants", post(admin::create_tenant))
        .route("/api/v1/admin/tenants/{id}", delete(admin::delete_tenant))
        .route(
            "/api/v1/admin/tenants/{id}/users",
            get(admin::list_users).post(admin::create_user),
        )
}
