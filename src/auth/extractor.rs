use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum_extra::extract::CookieJar;
use uuid::Uuid;

use crate::auth::{ROLE_AUDITOR, jwt};
use crate::error::AppError;
use crate::state::SharedState;

#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user_id: Uuid,
    pub tenant_id: Uuid,
    pub role: String,
    pub is_system_admin: bool,
}

impl AuthUser {
    pub fn require_system_admin(&self) -> Result<(), AppError> {
        if self.is_system_admin {
            Ok(())
        } else {
            Err(AppError::Forbidden(
                "System admin access required".to_string(),
            ))
        }
    }

    /// Auditors read; everyone else may also write.
    pub fn require_writer(&self) -> Result<(), AppError> {
        if self.role == ROLE_AUDITOR {
            Err(AppError::Forbidden(
                "Auditors cannot modify audit logs".to_string(),
            ))
        } else {
            Ok(())
        }
    }
}

impl From<jwt::Claims> for AuthUser {
    fn from(claims: jwt::Claims) -> Self {
        AuthUser {
            user_id: claims.sub,
            tenant_id: claims.tid,
            role: claims.role,
            is_system_admin: claims.sys,
        }
    }
}

impl FromRequestParts<SharedState> for AuthUser {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &SharedState,
    ) -> Result<Self, Self::Rejection> {
        // Try Bearer token from Authorization header first
        if let Some(auth_header) = parts.headers.get("authorization") {
            let auth_str = auth_header
                .to_str()
                .map_err(|_| AppError::Unauthorized("Invalid authorization header".to_string()))?;

            if let Some(token) = auth_str.strip_prefix("Bearer ") {
                let claims = jwt::decode_token(token, &state.config.jwt_secret)
                    .map_err(|_| AppError::Unauthorized("Invalid or expired token".to_string()))?;
                return Ok(claims.into());
            }
        }

        // Browsers cannot set headers on a WebSocket upgrade, so the cookie
        // is the path for live streams.
        let jar = CookieJar::from_headers(&parts.headers);
        if let Some(cookie) = jar.get("access_token") {
            let claims = jwt::decode_token(cookie.value(), &state.config.jwt_secret)
                .map_err(|_| AppError::Unauthorized("Invalid or expired token".to_string()))?;
            return Ok(claims.into());
        }

        Err(AppError::Unauthorized(
            "Missing authentication token".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(role: &str) -> AuthUser {
        AuthUser {
            user_id: Uuid::now_v7(),
            tenant_id: Uuid::now_v7(),
            role: role.to_string(),
            is_system_admin: false,
        }
    }

    #[test]
    fn auditor_cannot_write() {
        assert!(matches!(user("auditor").require_writer(), Err(AppError::Forbidden(_))));
        assert!(user("member").require_writer().is_ok());
    }

    #[test]
    fn system_admin_flag_is_required() {
        let mut admin = user("admin");
        assert!(admin.require_system_admin().is_err());
        admin.is_system_admin = true;
        assert!(admin.require_system_admin().is_ok());
    }
}
