use chrono::{Duration, Utc};
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Access tokens are minted by the identity provider; this lifetime only
/// applies to tokens issued locally (tests and tooling).
const ACCESS_TOKEN_MINUTES: i64 = 30;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Claims {
    pub sub: Uuid,
    pub tid: Uuid,
    pub role: String,
    #[serde(default)]
    pub sys: bool,
    pub exp: i64,
}

impl Claims {
    pub fn new(user_id: Uuid, tenant_id: Uuid, role: impl Into<String>, is_system_admin: bool) -> Self {
        Self {
            sub: user_id,
            tid: tenant_id,
            role: role.into(),
            sys: is_system_admin,
            exp: (Utc::now() + Duration::minutes(ACCESS_TOKEN_MINUTES)).timestamp(),
        }
    }
}

pub fn encode_token(claims: &Claims, secret: &str) -> Result<String, String> {
    encode(
        &Header::default(),
        claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|e| format!("JWT encode failed: {e}"))
}

pub fn decode_token(token: &str, secret: &str) -> Result<Claims, String> {
    decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )
    .map(|data| data.claims)
    .map_err(|e| format!("JWT decode failed: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_roundtrip() {
        let claims = Claims::new(Uuid::now_v7(), Uuid::now_v7(), "member", false);
        let token = encode_token(&claims, "secret").unwrap();
        let decoded = decode_token(&token, "secret").unwrap();
        assert_eq!(decoded.sub, claims.sub);
        assert_eq!(decoded.tid, claims.tid);
        assert_eq!(decoded.role, "member");
        assert!(!decoded.sys);
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let claims = Claims::new(Uuid::now_v7(), Uuid::now_v7(), "member", false);
        let token = encode_token(&claims, "secret").unwrap();
        assert!(decode_token(&token, "other").is_err());
    }

    #[test]
    fn expired_token_is_rejected() {
        let mut claims = Claims::new(Uuid::now_v7(), Uuid::now_v7(), "member", false);
        claims.exp = (Utc::now() - Duration::hours(1)).timestamp();
        let token = encode_token(&claims, "secret").unwrap();
        assert!(decode_token(&token, "secret").is_err());
    }
}
