pub mod audit_logs;
pub mod tenants;
pub mod users;

use crate::crypto::CryptoError;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A record was rejected before anything touched the database.
    #[error("record {index} is invalid: {reason}")]
    Validation { index: usize, reason: String },

    /// A caller-supplied bound that cannot be turned into a timestamp.
    #[error("{0}")]
    OutOfRange(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("meta_data encryption failed: {0}")]
    Crypto(#[from] CryptoError),
}
