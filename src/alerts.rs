use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use sqlx::PgConnection;
use uuid::Uuid;

use crate::config::AlertConfig;
use crate::db::{self, StoreError};
use crate::models::{Severity, StatsSnapshot};
use crate::queue::{AlertEvent, LogsCreated, QueueClient};

/// Per-severity alert thresholds. An alert fires when the windowed count is
/// strictly greater than the threshold.
#[derive(Debug, Clone, PartialEq)]
pub struct AlertThresholds {
    limits: BTreeMap<Severity, i64>,
}

impl AlertThresholds {
    pub fn new(limits: impl IntoIterator<Item = (Severity, i64)>) -> Self {
        Self {
            limits: limits.into_iter().collect(),
        }
    }

    pub fn from_config(config: &AlertConfig) -> Self {
        Self::new([
            (Severity::Warning, config.warning_threshold),
            (Severity::Error, config.error_threshold),
            (Severity::Critical, config.critical_threshold),
        ])
    }

    pub fn get(&self, severity: Severity) -> Option<i64> {
        self.limits.get(&severity).copied()
    }
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self::from_config(&AlertConfig::default())
    }
}

/// One alert per severity whose count in `window` exceeds its threshold.
/// Keys that are not severities, or severities without a threshold, are skipped.
pub fn evaluate(
    thresholds: &AlertThresholds,
    tenant_id: Uuid,
    window: &StatsSnapshot,
    now: DateTime<Utc>,
) -> Vec<AlertEvent> {
    window
        .iter()
        .filter_map(|(key, count)| {
            let severity = key.parse::<Severity>().ok()?;
            let threshold = thresholds.get(severity)?;
            (count > threshold).then_some(AlertEvent {
                tenant_id,
                severity,
                count,
                threshold,
                timestamp: now,
            })
        })
        .collect()
}

/// Handles `logs.created`: recounts the tenant's alert window and enqueues a
/// `logs.alert` for every breached threshold.
#[derive(Clone)]
pub struct StatsWorker {
    thresholds: AlertThresholds,
    window_hours: i64,
    queue: QueueClient,
}

impl StatsWorker {
    pub fn new(config: &AlertConfig, queue: QueueClient) -> Self {
        Self {
            thresholds: AlertThresholds::from_config(config),
            window_hours: config.window_hours,
            queue,
        }
    }

    pub async fn process(
        &self,
        conn: &mut PgConnection,
        event: &LogsCreated,
    ) -> Result<Vec<AlertEvent>, StoreError> {
        let Some(tenant_id) = event.tenant_id else {
            tracing::debug!("[worker][stats] logs.created without tenant, skipping");
            return Ok(Vec::new());
        };

        let window = db::audit_logs::stats_alert_window(&mut *conn, tenant_id, self.window_hours).await?;
        let alerts = evaluate(&self.thresholds, tenant_id, &window, Utc::now());

        for alert in &alerts {
            tracing::warn!(
                %tenant_id,
                severity = %alert.severity,
                count = alert.count,
                threshold = alert.threshold,
                "[worker][stats] alert threshold exceeded"
            );
            if self.queue.send(&alert.message()).await.is_none() {
                tracing::error!(%tenant_id, severity = %alert.severity, "[worker][stats] alert not enqueued");
            }
        }

        Ok(alerts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(pairs: &[(&str, i64)]) -> StatsSnapshot {
        let mut s = StatsSnapshot::new();
        for (k, v) in pairs {
            s.set(*k, *v);
        }
        s
    }

    #[test]
    fn only_breached_severity_alerts() {
        let thresholds = AlertThresholds::new([
            (Severity::Warning, 50),
            (Severity::Error, 30),
            (Severity::Critical, 0),
        ]);
        let tenant = Uuid::now_v7();
        // 31 INFO + 1 CRITICAL: INFO has no threshold, CRITICAL 1 > 0.
        let window = snapshot(&[("WARNING", 0), ("ERROR", 0), ("CRITICAL", 1)]);

        let alerts = evaluate(&thresholds, tenant, &window, Utc::now());
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].severity, Severity::Critical);
        assert_eq!(alerts[0].count, 1);
        assert_eq!(alerts[0].threshold, 0);
        assert_eq!(alerts[0].tenant_id, tenant);
    }

    #[test]
    fn count_equal_to_threshold_does_not_alert() {
        let thresholds = AlertThresholds::default();
        let window = snapshot(&[("WARNING", 50), ("ERROR", 30), ("CRITICAL", 10)]);
        assert!(evaluate(&thresholds, Uuid::now_v7(), &window, Utc::now()).is_empty());
    }

    #[test]
    fn every_breach_alerts() {
        let thresholds = AlertThresholds::default();
        let window = snapshot(&[("WARNING", 51), ("ERROR", 31), ("CRITICAL", 11)]);
        let severities: Vec<_> = evaluate(&thresholds, Uuid::now_v7(), &window, Utc::now())
            .into_iter()
            .map(|a| a.severity)
            .collect();
        assert_eq!(severities.len(), 3);
        assert!(severities.contains(&Severity::Warning));
        assert!(severities.contains(&Severity::Error));
        assert!(severities.contains(&Severity::Critical));
    }

    #[test]
    fn unknown_keys_and_info_are_ignored() {
        let thresholds = AlertThresholds::new([(Severity::Critical, 0)]);
        let window = snapshot(&[("total", 500), ("INFO", 400), ("CREATE", 99)]);
        assert!(evaluate(&thresholds, Uuid::now_v7(), &window, Utc::now()).is_empty());
    }

    #[test]
    fn defaults_match_config() {
        let thresholds = AlertThresholds::default();
        assert_eq!(thresholds.get(Severity::Warning), Some(50));
        assert_eq!(thresholds.get(Severity::Error), Some(30));
        assert_eq!(thresholds.get(Severity::Critical), Some(10));
        assert_eq!(thresholds.get(Severity::Info), None);
    }
}
