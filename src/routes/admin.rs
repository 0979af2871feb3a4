use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use serde::Deserialize;
use uuid::Uuid;

use crate::auth::ROLE_MEMBER;
use crate::auth::extractor::AuthUser;
use crate::db;
use crate::error::AppError;
use crate::models::{Tenant, User};
use crate::state::SharedState;

#[derive(Deserialize)]
pub struct CreateTenant {
    pub name: String,
}

#[derive(Deserialize)]
pub struct CreateUser {
    pub username: String,
    pub role: Option<String>,
}

pub async fn create_tenant(
    auth: AuthUser,
    State(state): State<SharedState>,
    Json(req): Json<CreateTenant>,
) -> Result<(StatusCode, Json<Tenant>), AppError> {
    auth.require_system_admin()?;

    let name = req.name.trim();
    if name.is_empty() {
        return Err(AppError::BadRequest("Tenant name is required".to_string()));
    }

    let tenant = db::tenants::create(&state.pool, name)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db_err) if db_err.is_unique_violation() => {
                AppError::Conflict("A tenant with this name already exists".to_string())
            }
            _ => AppError::Database(e),
        })?;

    Ok((StatusCode::CREATED, Json(tenant)))
}

pub async fn delete_tenant(
    auth: AuthUser,
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, AppError> {
    auth.require_system_admin()?;

    if !db::tenants::delete(&state.pool, id).await? {
        return Err(AppError::NotFound("Tenant not found".to_string()));
    }

    tracing::info!(tenant_id = %id, "tenant deleted");
    Ok(Json(serde_json::json!({ "message": "Deleted" })))
}

pub async fn list_users(
    auth: AuthUser,
    State(state): State<SharedState>,
    Path(tenant_id): Path<Uuid>,
) -> Result<Json<Vec<User>>, AppError> {
    auth.require_system_admin()?;
    let users = db::users::list_by_tenant(&state.pool, tenant_id).await?;
    Ok(Json(users))
}

pub async fn create_user(
    auth: AuthUser,
    State(state): State<SharedState>,
    Path(tenant_id): Path<Uuid>,
    Json(req): Json<CreateUser>,
) -> Result<(StatusCode, Json<User>), AppError> {
    auth.require_system_admin()?;

    let username = req.username.trim();
    if username.is_empty() {
        return Err(AppError::BadRequest("Username is required".to_string()));
    }

    db::tenants::find_by_id(&state.pool, tenant_id)
        .await?
        .ok_or_else(|| AppError::NotFound("Tenant not found".to_string()))?;

    let role = req.role.as_deref().unwrap_or(ROLE_MEMBER);
    let user = db::users::create(&state.pool, tenant_id, username, role)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db_err) if db_err.is_unique_violation() => {
                AppError::Conflict("A user with this username already exists".to_string())
            }
            _ => AppError::Database(e),
        })?;

    Ok((StatusCode::CREATED, Json(user)))
}
