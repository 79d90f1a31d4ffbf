//! Error types and machine-readable error codes.

use crate::models::ItemId;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Caller-supplied data violates a domain constraint.
    #[error("invalid input: {0}")]
    Validation(String),

    #[error("item not found: {0}")]
    NotFound(ItemId),

    /// Neither the durable target nor the memory fallback could be opened.
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    /// A live query re-execution failed. Only ever delivered on that
    /// subscription's stream.
    #[error("live query failed: {message}")]
    Subscription { message: String },

    #[error("store is closed")]
    Closed,

    #[error("database error: {0}")]
    Database(#[source] sqlx::Error),
}

impl StoreError {
    pub fn error_code(&self) -> &str {
        match self {
            Self::Validation(_) => "validation",
            Self::NotFound(_) => "not_found",
            Self::StorageUnavailable(_) => "storage_unavailable",
            Self::Subscription { .. } => "subscription",
            Self::Closed => "closed",
            Self::Database(_) => "database",
        }
    }

    /// Wrap a failed re-execution for delivery on a live stream.
    pub(crate) fn subscription(source: &StoreError) -> Self {
        Self::Subscription {
            message: source.to_string(),
        }
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::PoolClosed => StoreError::Closed,
            other => StoreError::Database(other),
        }
    }
}
