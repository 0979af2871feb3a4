use std::fmt::Write;

use chrono::{DateTime, Duration, Utc};
use sqlx::{PgExecutor, PgPool, Postgres, QueryBuilder, Row};
use uuid::Uuid;

use crate::crypto::FieldCipher;
use crate::db::StoreError;
use crate::models::{ActionType, AuditLog, AuditLogView, NewAuditLog, Severity, StatsSnapshot};

const INSERT_COLUMNS: &str = "INSERT INTO audit_logs (id, tenant_id, user_id, session_id, action_type, \
     resource_type, resource_id, severity, ip_address, user_agent, before_state, after_state, \
     meta_data, timestamp) ";

/// Keeps a single INSERT well under the Postgres bind parameter limit.
const BULK_CHUNK: usize = 1000;

/// Longest retention a cleanup may ask for (about a century).
pub const MAX_RETENTION_DAYS: i64 = 36_500;

/// A validated record with ids assigned and `meta_data` already encrypted.
struct PreparedLog<'a> {
    id: Uuid,
    source: &'a NewAuditLog,
    severity: Severity,
    meta_data: Option<String>,
    timestamp: DateTime<Utc>,
}

fn prepare<'a>(
    cipher: &FieldCipher,
    index: usize,
    log: &'a NewAuditLog,
) -> Result<PreparedLog<'a>, StoreError> {
    log.validate()
        .map_err(|reason| StoreError::Validation { index, reason })?;

    let meta_data = match &log.meta_data {
        Some(value) if !value.is_null() => Some(cipher.encrypt(value)?),
        _ => None,
    };

    Ok(PreparedLog {
        id: Uuid::now_v7(),
        source: log,
        severity: log.severity.unwrap_or_default(),
        meta_data,
        timestamp: log.timestamp.unwrap_or_else(Utc::now),
    })
}

fn push_rows(
    qb: &mut QueryBuilder<'_, Postgres>,
    rows: &[PreparedLog<'_>],
    tenant_id: Uuid,
    user_id: Uuid,
) {
    qb.push_values(rows, |mut b, row| {
        b.push_bind(row.id)
            .push_bind(tenant_id)
            .push_bind(user_id)
            .push_bind(row.source.session_id)
            .push_bind(row.source.action_type)
            .push_bind(row.source.resource_type.clone())
            .push_bind(row.source.resource_id.clone())
            .push_bind(row.severity)
            .push_bind(row.source.ip_address.clone())
            .push_bind(row.source.user_agent.clone())
            .push_bind(row.source.before_state.clone())
            .push_bind(row.source.after_state.clone())
            .push_bind(row.meta_data.clone())
            .push_bind(row.timestamp);
    });
    qb.push(" RETURNING *");
}

/// Insert a single record for `tenant_id`/`user_id`. The returned row carries
/// the encrypted `meta_data`.
pub async fn insert_one(
    pool: &PgPool,
    cipher: &FieldCipher,
    log: &NewAuditLog,
    tenant_id: Uuid,
    user_id: Uuid,
) -> Result<AuditLog, StoreError> {
    let prepared = prepare(cipher, 0, log)?;

    // Dropping `tx` without commit rolls it back.
    let mut tx = pool.begin().await?;
    let mut qb = QueryBuilder::new(INSERT_COLUMNS);
    push_rows(&mut qb, std::slice::from_ref(&prepared), tenant_id, user_id);
    let row = qb.build_query_as::<AuditLog>().fetch_one(&mut *tx).await?;
    tx.commit().await?;

    tracing::debug!(log_id = %row.id, %tenant_id, "audit log created");
    Ok(row)
}

/// Insert a batch atomically: either every record is persisted or none is.
pub async fn insert_bulk(
    pool: &PgPool,
    cipher: &FieldCipher,
    logs: &[NewAuditLog],
    tenant_id: Uuid,
    user_id: Uuid,
) -> Result<Vec<AuditLog>, StoreError> {
    if logs.is_empty() {
        return Err(StoreError::Validation {
            index: 0,
            reason: "batch is empty".to_string(),
        });
    }

    let prepared = logs
        .iter()
        .enumerate()
        .map(|(index, log)| prepare(cipher, index, log))
        .collect::<Result<Vec<_>, _>>()?;

    let mut tx = pool.begin().await?;
    let mut created = Vec::with_capacity(prepared.len());
    for chunk in prepared.chunks(BULK_CHUNK) {
        let mut qb = QueryBuilder::new(INSERT_COLUMNS);
        push_rows(&mut qb, chunk, tenant_id, user_id);
        created.extend(qb.build_query_as::<AuditLog>().fetch_all(&mut *tx).await?);
    }
    tx.commit().await?;

    tracing::debug!(count = created.len(), %tenant_id, "audit logs created in bulk");
    Ok(created)
}

/// Filters for [`query`]. Present filters are AND-combined.
#[derive(Debug, Clone)]
pub struct LogQuery {
    pub tenant_id: Option<Uuid>,
    pub user_id: Option<Uuid>,
    pub log_id: Option<Uuid>,
    /// Only records with an id greater than this. Results then come back in
    /// id order, oldest insert first.
    pub after: Option<Uuid>,
    pub skip: Option<i64>,
    pub limit: Option<i64>,
    pub order_by_time: bool,
}

impl Default for LogQuery {
    fn default() -> Self {
        Self {
            tenant_id: None,
            user_id: None,
            log_id: None,
            after: None,
            skip: None,
            limit: None,
            order_by_time: true,
        }
    }
}

impl LogQuery {
    pub fn for_tenant(tenant_id: Uuid) -> Self {
        Self {
            tenant_id: Some(tenant_id),
            ..Self::default()
        }
    }

    pub fn log(mut self, log_id: Uuid) -> Self {
        self.log_id = Some(log_id);
        self
    }

    pub fn after(mut self, id: Uuid) -> Self {
        self.after = Some(id);
        self
    }

    pub fn user(mut self, user_id: Uuid) -> Self {
        self.user_id = Some(user_id);
        self
    }

    /// Pagination only applies when both bounds are given.
    pub fn page(mut self, skip: Option<i64>, limit: Option<i64>) -> Self {
        self.skip = skip;
        self.limit = limit;
        self
    }
}

pub async fn query<'e, E>(
    executor: E,
    cipher: &FieldCipher,
    params: &LogQuery,
) -> Result<Vec<AuditLogView>, StoreError>
where
    E: PgExecutor<'e>,
{
    let mut qb = QueryBuilder::<Postgres>::new("SELECT * FROM audit_logs WHERE TRUE");

    if let Some(tenant_id) = params.tenant_id {
        qb.push(" AND tenant_id = ").push_bind(tenant_id);
    }
    if let Some(user_id) = params.user_id {
        qb.push(" AND user_id = ").push_bind(user_id);
    }
    if let Some(log_id) = params.log_id {
        qb.push(" AND id = ").push_bind(log_id);
    }
    if let Some(after) = params.after {
        qb.push(" AND id > ").push_bind(after);
        qb.push(" ORDER BY id ASC");
    } else if params.order_by_time {
        qb.push(" ORDER BY timestamp DESC, id DESC");
    }
    if let (Some(skip), Some(limit)) = (params.skip, params.limit) {
        qb.push(" OFFSET ")
            .push_bind(skip.max(0))
            .push(" LIMIT ")
            .push_bind(limit.max(0));
    }

    let rows = qb.build_query_as::<AuditLog>().fetch_all(executor).await?;

    Ok(rows
        .into_iter()
        .map(|row| AuditLogView::decrypt(row, cipher))
        .collect())
}

/// Lifetime totals for a tenant: `total`, one counter per severity and one per
/// action type, all from a single aggregate scan of the tenant's partition.
pub async fn stats_by_tenant<'e, E>(executor: E, tenant_id: Uuid) -> Result<StatsSnapshot, StoreError>
where
    E: PgExecutor<'e>,
{
    let mut sql = String::from("SELECT COUNT(*) AS total");
    for severity in Severity::ALL {
        let _ = write!(
            sql,
            ", COUNT(*) FILTER (WHERE severity = '{0}') AS \"{0}\"",
            severity.as_str()
        );
    }
    for action in ActionType::ALL {
        let _ = write!(
            sql,
            ", COUNT(*) FILTER (WHERE action_type = '{0}') AS \"{0}\"",
            action.as_str()
        );
    }
    sql.push_str(" FROM audit_logs WHERE tenant_id = $1");

    let row = sqlx::query(&sql).bind(tenant_id).fetch_one(executor).await?;

    let mut snapshot = StatsSnapshot::new();
    snapshot.set("total", row.try_get::<i64, _>("total")?);
    for severity in Severity::ALL {
        snapshot.set(severity.as_str(), row.try_get::<i64, _>(severity.as_str())?);
    }
    for action in ActionType::ALL {
        snapshot.set(action.as_str(), row.try_get::<i64, _>(action.as_str())?);
    }
    Ok(snapshot)
}

/// `now - span`, or an error when the span does not fit chrono's range.
fn cutoff(span: Option<Duration>, name: &str) -> Result<DateTime<Utc>, StoreError> {
    span.and_then(|span| Utc::now().checked_sub_signed(span))
        .ok_or_else(|| StoreError::OutOfRange(format!("{name} is out of range")))
}

/// WARNING/ERROR/CRITICAL counts over the trailing `window_hours`. Every
/// alerting severity is present, zero when nothing happened.
pub async fn stats_alert_window<'e, E>(
    executor: E,
    tenant_id: Uuid,
    window_hours: i64,
) -> Result<StatsSnapshot, StoreError>
where
    E: PgExecutor<'e>,
{
    if window_hours < 0 {
        return Err(StoreError::OutOfRange("window_hours must be zero or more".to_string()));
    }
    let since = cutoff(Duration::try_hours(window_hours), "window_hours")?;

    let mut sql = String::from("SELECT COUNT(*) AS total");
    for severity in Severity::ALERTING {
        let _ = write!(
            sql,
            ", COUNT(*) FILTER (WHERE severity = '{0}') AS \"{0}\"",
            severity.as_str()
        );
    }
    sql.push_str(" FROM audit_logs WHERE tenant_id = $1 AND timestamp >= $2");

    let row = sqlx::query(&sql)
        .bind(tenant_id)
        .bind(since)
        .fetch_one(executor)
        .await?;

    let mut snapshot = StatsSnapshot::new();
    for severity in Severity::ALERTING {
        snapshot.set(severity.as_str(), row.try_get::<i64, _>(severity.as_str())?);
    }
    Ok(snapshot)
}

/// Delete the tenant's records older than `retention_days` in one statement.
pub async fn cleanup_old(
    pool: &PgPool,
    tenant_id: Uuid,
    retention_days: i64,
) -> Result<u64, StoreError> {
    if !(0..=MAX_RETENTION_DAYS).contains(&retention_days) {
        return Err(StoreError::OutOfRange(format!(
            "retention_days must be between 0 and {MAX_RETENTION_DAYS}"
        )));
    }
    let cutoff = cutoff(Duration::try_days(retention_days), "retention_days")?;

    let mut tx = pool.begin().await?;
    let result = sqlx::query("DELETE FROM audit_logs WHERE tenant_id = $1 AND timestamp < $2")
        .bind(tenant_id)
        .bind(cutoff)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;

    tracing::info!(%tenant_id, retention_days, deleted = result.rows_affected(), "retention cleanup");
    Ok(result.rows_affected())
}
