#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde_json::{Value, json};
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use uuid::Uuid;

use auditlog::auth::jwt::{Claims, encode_token};
use auditlog::config::{
    AlertConfig, Config, LiveConfig, PubSubBackend, QueueBackend, WorkerConfig,
};
use auditlog::db;
use auditlog::fanout::MemoryPubSub;
use auditlog::models::{Tenant, User};
use auditlog::queue::MemoryQueue;
use auditlog::state::SharedState;

pub const JWT_SECRET: &str = "test-jwt-secret-that-is-long-enough";

/// A running test server instance with a dedicated test database.
pub struct TestApp {
    pub addr: SocketAddr,
    pub pool: PgPool,
    pub client: Client,
    pub db_name: String,
    pub state: SharedState,
    pub queue: Arc<MemoryQueue>,
}

/// A tenant with one user and a token for that user.
pub struct Member {
    pub tenant: Tenant,
    pub user: User,
    pub token: String,
}

impl TestApp {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub async fn create_tenant(&self, name: &str) -> Tenant {
        db::tenants::create(&self.pool, name)
            .await
            .expect("create tenant failed")
    }

    pub async fn create_user(&self, tenant_id: Uuid, username: &str, role: &str) -> User {
        db::users::create(&self.pool, tenant_id, username, role)
            .await
            .expect("create user failed")
    }

    /// Tenant + user with `role`, plus a bearer token for them.
    pub async fn member(&self, name: &str, role: &str) -> Member {
        let tenant = self.create_tenant(name).await;
        let user = self
            .create_user(tenant.id, &format!("{name}-{role}"), role)
            .await;
        let token = token_for(&user, false);
        Member { tenant, user, token }
    }

    /// A system admin living in its own tenant.
    pub async fn system_admin(&self) -> String {
        let tenant = self.create_tenant("system").await;
        let user = self.create_user(tenant.id, "root", "admin").await;
        token_for(&user, true)
    }

    /// Make an authenticated GET request.
    pub async fn get_auth(&self, path: &str, token: &str) -> (Value, StatusCode) {
        let resp = self
            .client
            .get(self.url(path))
            .bearer_auth(token)
            .send()
            .await
            .expect("get request failed");
        let status = resp.status();
        let body: Value = resp.json().await.unwrap_or(json!(null));
        (body, status)
    }

    /// Make an authenticated POST request with JSON body.
    pub async fn post_auth(&self, path: &str, token: &str, body: &Value) -> (Value, StatusCode) {
        let resp = self
            .client
            .post(self.url(path))
            .bearer_auth(token)
            .json(body)
            .send()
            .await
            .expect("post request failed");
        let status = resp.status();
        let body: Value = resp.json().await.unwrap_or(json!(null));
        (body, status)
    }

    /// Make an authenticated DELETE request.
    pub async fn delete_auth(&self, path: &str, token: &str) -> (Value, StatusCode) {
        let resp = self
            .client
            .delete(self.url(path))
            .bearer_auth(token)
            .send()
            .await
            .expect("delete request failed");
        let status = resp.status();
        let body: Value = resp.json().await.unwrap_or(json!(null));
        (body, status)
    }
}

pub fn token_for(user: &User, is_system_admin: bool) -> String {
    let claims = Claims::new(user.id, user.tenant_id, user.role.clone(), is_system_admin);
    encode_token(&claims, JWT_SECRET).expect("encode token")
}

pub fn test_config(database_url: String) -> Config {
    Config {
        database_url,
        jwt_secret: JWT_SECRET.to_string(),
        encryption_key: "test-encryption-key-32-chars-ok!".to_string(),
        host: "127.0.0.1".parse().unwrap(),
        port: 0, // unused, we bind to random port
        log_level: "warn".to_string(),
        max_body_size: 1_048_576,
        db_pool_size: 1,
        db_max_overflow: 4,
        queue_backend: QueueBackend::Memory,
        pubsub_backend: PubSubBackend::Memory,
        worker: WorkerConfig {
            poll_interval: Duration::from_millis(50),
            wait: Duration::ZERO,
            ..WorkerConfig::default()
        },
        alerts: AlertConfig::default(),
        live: LiveConfig {
            poll_interval: Duration::from_millis(100),
            page_size: 10,
        },
        retention_days: 1,
        rate_limit_per_minute: 10_000,
    }
}

/// Create a throwaway database, run migrations, return (pool, url, name).
pub async fn fresh_database() -> (PgPool, String, String) {
    let _ = dotenvy::dotenv();

    let base_url = std::env::var("DATABASE_URL")
        .expect("DATABASE_URL must be set for tests");

    // Create a unique test database
    let db_name = format!("auditlog_test_{}", Uuid::now_v7().simple());

    let admin_pool = PgPoolOptions::new()
        .max_connections(2)
        .connect(&admin_url(&base_url))
        .await
        .expect("Failed to connect to postgres for test DB creation");

    sqlx::query(&format!("CREATE DATABASE \"{db_name}\""))
        .execute(&admin_pool)
        .await
        .expect("Failed to create test database");

    admin_pool.close().await;

    // Connect to test DB and run migrations
    let test_url = base_url
        .rsplit_once('/')
        .map(|(base, _)| format!("{base}/{db_name}"))
        .unwrap_or_else(|| base_url.clone());

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&test_url)
        .await
        .expect("Failed to connect to test database");

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("Failed to run migrations on test database");

    (pool, test_url, db_name)
}

/// Spawn a test app with a fresh temporary database and in-memory queue
/// and pub/sub.
pub async fn spawn_app() -> TestApp {
    spawn_app_with(|_| {}).await
}

pub async fn spawn_app_with(tweak: impl FnOnce(&mut Config)) -> TestApp {
    let (pool, test_url, db_name) = fresh_database().await;

    let mut config = test_config(test_url);
    tweak(&mut config);

    let queue = Arc::new(MemoryQueue::new());
    let state = auditlog::build_state_with(
        pool.clone(),
        config,
        queue.clone(),
        Arc::new(MemoryPubSub::new()),
    );
    let app = auditlog::build_app(state.clone());

    // Bind to random port
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind to random port");
    let addr = listener.local_addr().unwrap();

    // Spawn server in background
    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .expect("Server failed");
    });

    let client = Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .unwrap();

    TestApp {
        addr,
        pool,
        client,
        db_name,
        state,
        queue,
    }
}

fn admin_url(base_url: &str) -> String {
    base_url
        .rsplit_once('/')
        .map(|(base, _)| format!("{base}/postgres"))
        .unwrap_or_else(|| base_url.to_string())
}

/// Drop stale test databases (useful after test crashes).
pub async fn cleanup_stale_test_dbs() {
    let base_url = std::env::var("DATABASE_URL")
        .expect("DATABASE_URL must be set for tests");

    if let Ok(admin_pool) = PgPoolOptions::new()
        .max_connections(2)
        .connect(&admin_url(&base_url))
        .await
    {
        let rows = sqlx::query_scalar::<_, String>(
            "SELECT datname FROM pg_database WHERE datname LIKE 'auditlog_test_%'",
        )
        .fetch_all(&admin_pool)
        .await
        .unwrap_or_default();

        for db_name in rows {
            let _ = sqlx::query(&format!("DROP DATABASE IF EXISTS \"{db_name}\" WITH (FORCE)"))
                .execute(&admin_pool)
                .await;
        }
        admin_pool.close().await;
    }
}

/// Drop the test database after tests complete.
pub async fn cleanup(app: TestApp) {
    drop_database(app.pool, &app.db_name).await;
}

pub async fn drop_database(pool: PgPool, db_name: &str) {
    pool.close().await;

    let base_url = std::env::var("DATABASE_URL")
        .expect("DATABASE_URL must be set for tests");

    let admin_pool = PgPoolOptions::new()
        .max_connections(2)
        .connect(&admin_url(&base_url))
        .await
        .expect("Failed to connect for cleanup");

    let _ = sqlx::query(&format!("DROP DATABASE IF EXISTS \"{db_name}\" WITH (FORCE)"))
        .execute(&admin_pool)
        .await;

    admin_pool.close().await;
}
