//! Storage error types.

use magebox_core::error::CryptoError;

/// Errors returned by [`crate::Store`].
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The requested row does not exist.
    #[error("{0} not found")]
    NotFound(String),

    /// A uniqueness constraint was violated.
    #[error("{0} already exists")]
    AlreadyExists(String),

    /// A secret column could not be encrypted or decrypted. Decryption
    /// failures mean the master key changed or the row was tampered with.
    #[error("secret column error: {0}")]
    Crypto(#[from] CryptoError),

    /// The database rejected or failed a query.
    #[error("database error: {0}")]
    Database(sqlx::Error),

    /// Schema migration failed at startup.
    #[error("migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// Stored data or caller input violates an invariant.
    #[error("invalid data: {0}")]
    Invalid(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => Self::NotFound("row".to_owned()),
            sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
                Self::AlreadyExists(db_err.message().to_owned())
            }
            _ => Self::Database(err),
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Invalid(format!("json column: {err}"))
    }
}

impl From<tokio::task::JoinError> for StoreError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::Invalid(format!("background task failed: {err}"))
    }
}
