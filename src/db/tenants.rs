use sqlx::{PgExecutor, PgPool};
use uuid::Uuid;

use crate::models::Tenant;

/// Create a tenant together with its dedicated audit log partition.
pub async fn create(pool: &PgPool, name: &str) -> Result<Tenant, sqlx::Error> {
    let mut tx = pool.begin().await?;

    let tenant = sqlx::query_as::<_, Tenant>(
        "INSERT INTO tenants (id, name) VALUES ($1, $2) RETURNING *",
    )
    .bind(Uuid::now_v7())
    .bind(name)
    .fetch_one(&mut *tx)
    .await?;

    ensure_partition(&mut *tx, tenant.id).await?;
    tx.commit().await?;

    tracing::info!(tenant_id = %tenant.id, "tenant created");
    Ok(tenant)
}

/// Create the list partition for `tenant_id` if it does not exist yet.
///
/// Must run before the tenant's first row lands in the default partition:
/// Postgres refuses to attach a partition whose values already sit there.
pub async fn ensure_partition<'e, E>(executor: E, tenant_id: Uuid) -> Result<(), sqlx::Error>
where
    E: PgExecutor<'e>,
{
    // Identifier and literal are both derived from a parsed UUID, so inlining is safe.
    let sql = format!(
        "CREATE TABLE IF NOT EXISTS \"{}\" PARTITION OF audit_logs FOR VALUES IN ('{}')",
        Tenant::partition_name(tenant_id),
        tenant_id
    );
    sqlx::query(&sql).execute(executor).await?;
    Ok(())
}

pub async fn find_by_id(pool: &PgPool, id: Uuid) -> Result<Option<Tenant>, sqlx::Error> {
    sqlx::query_as::<_, Tenant>("SELECT * FROM tenants WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
}

/// Delete a tenant. Its users and audit logs cascade, and the emptied
/// partition is dropped in the same transaction.
pub async fn delete(pool: &PgPool, id: Uuid) -> Result<bool, sqlx::Error> {
    let mut tx = pool.begin().await?;

    let result = sqlx::query("DELETE FROM tenants WHERE id = $1")
        .bind(id)
        .execute(&mut *tx)
        .await?;

    let sql = format!("DROP TABLE IF EXISTS \"{}\"", Tenant::partition_name(id));
    sqlx::query(&sql).execute(&mut *tx).await?;

    tx.commit().await?;
    Ok(result.rows_affected() > 0)
}
