use std::net::SocketAddr;
use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use tokio::signal;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use auditlog::config::Config;
use auditlog::rate_limit;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Load config
    let config = Config::from_env().expect("Failed to load configuration");

    // Init tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(&config.log_level)
        }))
        .init();

    tracing::info!("Starting audit log service");

    // Create database pool
    let pool = PgPoolOptions::new()
        .min_connections(config.db_pool_size)
        .max_connections(config.db_max_connections())
        .acquire_timeout(Duration::from_secs(30))
        .connect(&config.database_url)
        .await
        .expect("Failed to connect to database");

    // Run migrations
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("Failed to run migrations");

    tracing::info!("Migrations applied");

    let addr = SocketAddr::new(config.host, config.port);
    let state = auditlog::build_state(pool, config)
        .await
        .expect("Failed to initialise live pub/sub");

    // Forget rate-limit windows that have lapsed.
    let sweeper = state.rate_limiter.spawn_sweeper(
        Duration::from_secs(rate_limit::WINDOW_SECS),
        Duration::from_secs(rate_limit::WINDOW_SECS),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let consumer = auditlog::worker::spawn(state.clone(), shutdown_rx);

    let app = auditlog::build_app(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Listening on {addr}");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    sweeper.abort();

    // Let the consumer finish its current batch before exiting.
    let _ = shutdown_tx.send(true);
    if !matches!(
        tokio::task::spawn_blocking(move || consumer.join()).await,
        Ok(Ok(()))
    ) {
        tracing::error!("Event consumer thread panicked");
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received, starting graceful shutdown");
}
