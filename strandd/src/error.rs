//! Daemon error types.

use strand_eventlog::EventLogError;
use strand_projector::ProjectionError;
use strand_store::StoreError;
use thiserror::Error;

/// Daemon-level errors.
#[derive(Debug, Error)]
pub enum DaemonError {
    /// Projection engine error
    #[error("Projection error: {0}")]
    Projection(#[from] ProjectionError),

    /// Event log error
    #[error("Event log error: {0}")]
    EventLog(#[from] EventLogError),

    /// Checkpoint store error
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Database lifecycle error (connect, migrate)
    #[error("Database error: {0}")]
    Database(String),

    /// Read model not found
    #[error("Read model not found: {0}")]
    ReadModelNotFound(String),

    /// Malformed API request
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Metrics registry or encoding failure
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Result type for daemon operations.
pub type DaemonResult<T> = Result<T, DaemonError>;
