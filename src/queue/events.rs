use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::models::{AuditLog, Severity};

pub const LOGS_CREATED: &str = "logs.created";
pub const LOGS_ALERT: &str = "logs.alert";

/// Every event kind the consumer knows how to route.
#[derive(Debug, Clone, PartialEq)]
pub enum QueueEvent {
    LogsCreated(LogsCreated),
    LogsAlert(AlertEvent),
    /// A kind nobody handles, or no kind at all.
    Unknown(Option<String>),
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(default)]
    event_type: Option<String>,
}

impl QueueEvent {
    /// Parse a message body. The kind comes from `type`, falling back to
    /// `event_type`.
    pub fn parse(body: &str) -> Result<Self, serde_json::Error> {
        let value: Value = serde_json::from_str(body)?;
        let envelope = Envelope::deserialize(&value)?;

        match envelope.kind.or(envelope.event_type) {
            Some(kind) if kind == LOGS_CREATED => {
                LogsCreated::deserialize(&value).map(QueueEvent::LogsCreated)
            }
            Some(kind) if kind == LOGS_ALERT => {
                AlertEvent::deserialize(&value).map(QueueEvent::LogsAlert)
            }
            other => Ok(QueueEvent::Unknown(other)),
        }
    }
}

/// Consumer view of a `logs.created` event. Only the tenant matters for
/// alerting; the log bodies that ride along are ignored.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct LogsCreated {
    #[serde(default)]
    pub tenant_id: Option<Uuid>,
}

/// Producer side of `logs.created`: a single log is flattened into the
/// envelope, a batch travels as a list under `logs`.
#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum LogsCreatedPayload<'a> {
    One {
        #[serde(rename = "type")]
        kind: &'static str,
        #[serde(flatten)]
        log: &'a AuditLog,
    },
    Many {
        #[serde(rename = "type")]
        kind: &'static str,
        tenant_id: Uuid,
        logs: &'a [AuditLog],
    },
}

impl<'a> LogsCreatedPayload<'a> {
    pub fn one(log: &'a AuditLog) -> Self {
        LogsCreatedPayload::One {
            kind: LOGS_CREATED,
            log,
        }
    }

    pub fn many(tenant_id: Uuid, logs: &'a [AuditLog]) -> Self {
        LogsCreatedPayload::Many {
            kind: LOGS_CREATED,
            tenant_id,
            logs,
        }
    }
}

/// Raised when a severity count in the rolling window exceeds its threshold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertEvent {
    pub tenant_id: Uuid,
    pub severity: Severity,
    pub count: i64,
    #[serde(default)]
    pub threshold: i64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Serialize)]
pub struct AlertMessage<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    event_type: &'static str,
    #[serde(flatten)]
    alert: &'a AlertEvent,
}

impl AlertEvent {
    /// Wire form, tagged under both `type` and `event_type`.
    pub fn message(&self) -> AlertMessage<'_> {
        AlertMessage {
            kind: LOGS_ALERT,
            event_type: LOGS_ALERT,
            alert: self,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_logs_created_with_flattened_log() {
        let tenant = Uuid::now_v7();
        let body = json!({ "type": "logs.created", "tenant_id": tenant, "resource_type": "doc" });
        let event = QueueEvent::parse(&body.to_string()).unwrap();
        assert_eq!(
            event,
            QueueEvent::LogsCreated(LogsCreated {
                tenant_id: Some(tenant)
            })
        );
    }

    #[test]
    fn logs_created_without_tenant_parses_to_none() {
        let event = QueueEvent::parse(r#"{"type":"logs.created","logs":[]}"#).unwrap();
        assert_eq!(event, QueueEvent::LogsCreated(LogsCreated { tenant_id: None }));
    }

    #[test]
    fn alert_roundtrips_through_wire_form() {
        let alert = AlertEvent {
            tenant_id: Uuid::now_v7(),
            severity: Severity::Critical,
            count: 4,
            threshold: 3,
            timestamp: Utc::now(),
        };
        let body = serde_json::to_string(&alert.message()).unwrap();
        assert!(body.contains(r#""type":"logs.alert""#));
        assert!(body.contains(r#""event_type":"logs.alert""#));
        assert_eq!(QueueEvent::parse(&body).unwrap(), QueueEvent::LogsAlert(alert));
    }

    #[test]
    fn event_type_is_used_when_type_is_missing() {
        let body = json!({
            "event_type": "logs.alert",
            "tenant_id": Uuid::now_v7(),
            "severity": "ERROR",
            "count": 31,
            "timestamp": "2025-01-01T00:00:00Z",
        });
        assert!(matches!(
            QueueEvent::parse(&body.to_string()).unwrap(),
            QueueEvent::LogsAlert(_)
        ));
    }

    #[test]
    fn unknown_and_missing_kinds() {
        assert_eq!(
            QueueEvent::parse(r#"{"type":"users.created"}"#).unwrap(),
            QueueEvent::Unknown(Some("users.created".to_string()))
        );
        assert_eq!(QueueEvent::parse("{}").unwrap(), QueueEvent::Unknown(None));
        assert!(QueueEvent::parse("not json").is_err());
    }
}
