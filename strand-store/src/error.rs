//! Storage layer errors

use thiserror::Error;

/// Errors that can occur in the checkpoint store
#[derive(Debug, Error)]
pub enum StoreError {
    /// Rejected input (empty projection name, negative position)
    #[error("Invalid checkpoint: {0}")]
    Invalid(String),

    /// Database error
    #[error("Database error: {0}")]
    Database(String),

    /// Connection error
    #[error("Connection error: {0}")]
    Connection(String),
}

impl StoreError {
    /// Whether retrying the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        !matches!(self, StoreError::Invalid(_))
    }
}

#[cfg(any(feature = "postgres", feature = "sqlite"))]
impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                StoreError::Connection(err.to_string())
            },
            sqlx::Error::Database(db_err) => StoreError::Database(db_err.to_string()),
            _ => StoreError::Database(err.to_string()),
        }
    }
}
