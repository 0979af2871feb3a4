use std::net::IpAddr;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::crypto::FieldCipher;

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
    sqlx::Type,
)]
#[sqlx(type_name = "severity_enum", rename_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    #[default]
    Info,
    Warning,
    Error,
    Critical,
}

impl Severity {
    pub const ALL: [Severity; 4] = [
        Severity::Info,
        Severity::Warning,
        Severity::Error,
        Severity::Critical,
    ];

    /// Severities that take part in alert evaluation.
    pub const ALERTING: [Severity; 3] = [Severity::Warning, Severity::Error, Severity::Critical];

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "INFO",
            Severity::Warning => "WARNING",
            Severity::Error => "ERROR",
            Severity::Critical => "CRITICAL",
        }
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Severity::ALL
            .into_iter()
            .find(|sev| sev.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown severity: {s}"))
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type,
)]
#[sqlx(type_name = "action_type_enum", rename_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum ActionType {
    Create,
    Update,
    Delete,
    View,
    Login,
    Logout,
}

impl ActionType {
    pub const ALL: [ActionType; 6] = [
        ActionType::Create,
        ActionType::Update,
        ActionType::Delete,
        ActionType::View,
        ActionType::Login,
        ActionType::Logout,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ActionType::Create => "CREATE",
            ActionType::Update => "UPDATE",
            ActionType::Delete => "DELETE",
            ActionType::View => "VIEW",
            ActionType::Login => "LOGIN",
            ActionType::Logout => "LOGOUT",
        }
    }
}

impl std::fmt::Display for ActionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A record as persisted. `meta_data` holds ciphertext.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow, Serialize, Deserialize)]
pub struct AuditLog {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub user_id: Uuid,
    pub session_id: Option<Uuid>,
    pub action_type: ActionType,
    pub resource_type: String,
    pub resource_id: Option<String>,
    pub severity: Severity,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub before_state: Option<Value>,
    pub after_state: Option<Value>,
    pub meta_data: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// A record as served to readers, with `meta_data` decrypted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditLogView {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub user_id: Uuid,
    pub session_id: Option<Uuid>,
    pub action_type: ActionType,
    pub resource_type: String,
    pub resource_id: Option<String>,
    pub severity: Severity,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub before_state: Option<Value>,
    pub after_state: Option<Value>,
    pub meta_data: Option<Value>,
    pub timestamp: DateTime<Utc>,
}

impl AuditLogView {
    /// Decrypt a stored row. A value that fails to decrypt is dropped to
    /// `None` so one corrupt record never fails a whole read.
    pub fn decrypt(row: AuditLog, cipher: &FieldCipher) -> Self {
        let meta_data = row.meta_data.as_deref().and_then(|ct| match cipher.decrypt(ct) {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!(log_id = %row.id, tenant_id = %row.tenant_id, "meta_data unreadable: {e}");
                None
            }
        });

        Self {
            id: row.id,
            tenant_id: row.tenant_id,
            user_id: row.user_id,
            session_id: row.session_id,
            action_type: row.action_type,
            resource_type: row.resource_type,
            resource_id: row.resource_id,
            severity: row.severity,
            ip_address: row.ip_address,
            user_agent: row.user_agent,
            before_state: row.before_state,
            after_state: row.after_state,
            meta_data,
            timestamp: row.timestamp,
        }
    }
}

/// Payload for a new record. Tenant and user come from the caller's
/// identity, never from the body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewAuditLog {
    #[serde(default)]
    pub session_id: Option<Uuid>,
    pub action_type: ActionType,
    pub resource_type: String,
    #[serde(default)]
    pub resource_id: Option<String>,
    #[serde(default)]
    pub severity: Option<Severity>,
    #[serde(default)]
    pub ip_address: Option<String>,
    #[serde(default)]
    pub user_agent: Option<String>,
    #[serde(default)]
    pub before_state: Option<Value>,
    #[serde(default)]
    pub after_state: Option<Value>,
    #[serde(default)]
    pub meta_data: Option<Value>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

impl NewAuditLog {
    pub fn new(action_type: ActionType, resource_type: impl Into<String>) -> Self {
        Self {
            session_id: None,
            action_type,
            resource_type: resource_type.into(),
            resource_id: None,
            severity: None,
            ip_address: None,
            user_agent: None,
            before_state: None,
            after_state: None,
            meta_data: None,
            timestamp: None,
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        let resource_type = self.resource_type.trim();
        if resource_type.is_empty() {
            return Err("resource_type is required".to_string());
        }
        if resource_type.len() > 255 {
            return Err("resource_type must be at most 255 characters".to_string());
        }
        if let Some(ip) = &self.ip_address {
            ip.parse::<IpAddr>()
                .map_err(|_| format!("ip_address is not a valid IP address: {ip}"))?;
        }
        Ok(())
    }
}
