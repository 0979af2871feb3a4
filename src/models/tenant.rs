use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct Tenant {
    pub id: Uuid,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

impl Tenant {
    /// Name of the list partition holding this tenant's audit logs.
    pub fn partition_name(id: Uuid) -> String {
        format!("audit_logs_{}", id.simple())
    }
}
