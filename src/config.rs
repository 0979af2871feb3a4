use std::net::IpAddr;
use std::str::FromStr;
use std::time::Duration;

use crate::db::audit_logs::MAX_RETENTION_DAYS;

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub jwt_secret: String,
    pub encryption_key: String,
    pub host: IpAddr,
    pub port: u16,
    pub log_level: String,
    pub max_body_size: usize,
    pub db_pool_size: u32,
    pub db_max_overflow: u32,
    pub queue_backend: QueueBackend,
    pub pubsub_backend: PubSubBackend,
    pub worker: WorkerConfig,
    pub alerts: AlertConfig,
    pub live: LiveConfig,
    pub retention_days: i64,
    pub rate_limit_per_minute: u32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum QueueBackend {
    Postgres,
    Memory,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PubSubBackend {
    Memory,
    Postgres,
}

/// Consumer loop tuning.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub poll_interval: Duration,
    pub max_messages: usize,
    pub wait: Duration,
    pub visibility_timeout: Duration,
    pub dead_letter: bool,
}

/// Longest rolling window the alert evaluator accepts (one year).
pub const MAX_ALERT_WINDOW_HOURS: i64 = 24 * 366;

#[derive(Debug, Clone)]
pub struct AlertConfig {
    pub window_hours: i64,
    pub warning_threshold: i64,
    pub error_threshold: i64,
    pub critical_threshold: i64,
}

#[derive(Debug, Clone)]
pub struct LiveConfig {
    pub poll_interval: Duration,
    pub page_size: i64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            max_messages: 5,
            wait: Duration::from_secs(10),
            visibility_timeout: Duration::from_secs(30),
            dead_letter: true,
        }
    }
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            window_hours: 24,
            warning_threshold: 50,
            error_threshold: 30,
            critical_threshold: 10,
        }
    }
}

impl AlertConfig {
    pub fn validate(&self) -> Result<(), String> {
        if !(1..=MAX_ALERT_WINDOW_HOURS).contains(&self.window_hours) {
            return Err(format!(
                "AUDITLOG_ALERT_WINDOW_HOURS must be between 1 and {MAX_ALERT_WINDOW_HOURS}"
            ));
        }
        Ok(())
    }
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            page_size: 10,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, String> {
        let database_url = env_required("DATABASE_URL")?;
        let jwt_secret = env_required("JWT_SECRET")?;
        let encryption_key = env_required("AUDITLOG_ENCRYPTION_KEY")?;

        let host: IpAddr = env_parse("AUDITLOG_HOST", "0.0.0.0")?;
        let port: u16 = env_parse("AUDITLOG_PORT", "8000")?;
        let log_level = env_or("AUDITLOG_LOG_LEVEL", "info");
        let max_body_size: usize = env_parse("AUDITLOG_MAX_BODY_SIZE", "1048576")?;

        let db_pool_size: u32 = env_parse("AUDITLOG_DB_POOL_SIZE", "5")?;
        let db_max_overflow: u32 = env_parse("AUDITLOG_DB_MAX_OVERFLOW", "10")?;

        let queue_backend = match env_or("AUDITLOG_QUEUE", "postgres").as_str() {
            "postgres" => QueueBackend::Postgres,
            "memory" => QueueBackend::Memory,
            other => return Err(format!("Invalid AUDITLOG_QUEUE: {other}")),
        };

        let pubsub_backend = match env_or("AUDITLOG_PUBSUB", "memory").as_str() {
            "memory" => PubSubBackend::Memory,
            "postgres" => PubSubBackend::Postgres,
            other => return Err(format!("Invalid AUDITLOG_PUBSUB: {other}")),
        };

        let worker = WorkerConfig {
            poll_interval: Duration::from_millis(env_parse("AUDITLOG_POLL_INTERVAL_MS", "1000")?),
            max_messages: env_parse("AUDITLOG_QUEUE_MAX_MESSAGES", "5")?,
            wait: Duration::from_secs(env_parse("AUDITLOG_QUEUE_WAIT_SECS", "10")?),
            visibility_timeout: Duration::from_secs(env_parse(
                "AUDITLOG_QUEUE_VISIBILITY_SECS",
                "30",
            )?),
            dead_letter: env_parse("AUDITLOG_DEAD_LETTER", "true")?,
        };

        let alerts = AlertConfig {
            window_hours: env_parse("AUDITLOG_ALERT_WINDOW_HOURS", "24")?,
            warning_threshold: env_parse("AUDITLOG_WARNING_THRESHOLD", "50")?,
            error_threshold: env_parse("AUDITLOG_ERROR_THRESHOLD", "30")?,
            critical_threshold: env_parse("AUDITLOG_CRITICAL_THRESHOLD", "10")?,
        };

        let live = LiveConfig {
            poll_interval: Duration::from_millis(env_parse("AUDITLOG_LIVE_POLL_MS", "1000")?),
            page_size: env_parse("AUDITLOG_LIVE_PAGE_SIZE", "10")?,
        };

        let retention_days: i64 = env_parse("AUDITLOG_RETENTION_DAYS", "1")?;
        let rate_limit_per_minute: u32 = env_parse("AUDITLOG_RATE_LIMIT_PER_MINUTE", "10000")?;

        if max_body_size == 0 {
            return Err("AUDITLOG_MAX_BODY_SIZE must be greater than zero".to_string());
        }
        if worker.max_messages == 0 {
            return Err("AUDITLOG_QUEUE_MAX_MESSAGES must be greater than zero".to_string());
        }
        if live.page_size <= 0 {
            return Err("AUDITLOG_LIVE_PAGE_SIZE must be greater than zero".to_string());
        }
        if !(0..=MAX_RETENTION_DAYS).contains(&retention_days) {
            return Err(format!(
                "AUDITLOG_RETENTION_DAYS must be between 0 and {MAX_RETENTION_DAYS}"
            ));
        }
        alerts.validate()?;

        Ok(Config {
            database_url,
            jwt_secret,
            encryption_key,
            host,
            port,
            log_level,
            max_body_size,
            db_pool_size,
            db_max_overflow,
            queue_backend,
            pubsub_backend,
            worker,
            alerts,
            live,
            retention_days,
            rate_limit_per_minute,
        })
    }

    /// Upper bound on pooled connections: the steady pool plus its overflow.
    pub fn db_max_connections(&self) -> u32 {
        self.db_pool_size + self.db_max_overflow
    }
}

fn env_required(key: &str) -> Result<String, String> {
    std::env::var(key).map_err(|_| format!("Missing required environment variable: {key}"))
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T>(key: &str, default: &str) -> Result<T, String>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    env_or(key, default)
        .parse()
        .map_err(|e| format!("Invalid {key}: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alert_window_must_be_positive_and_bounded() {
        let mut alerts = AlertConfig::default();
        assert!(alerts.validate().is_ok());

        alerts.window_hours = 0;
        assert!(alerts.validate().is_err());

        alerts.window_hours = i64::MAX;
        assert!(alerts.validate().is_err());

        alerts.window_hours = MAX_ALERT_WINDOW_HOURS;
        assert!(alerts.validate().is_ok());
    }
}
