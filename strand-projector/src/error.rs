//! Projection errors

use strand_eventlog::{EventLogError, Position};
use strand_store::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProjectionError {
    /// The event log could not complete a read
    #[error("Event log error: {0}")]
    EventLog(#[from] EventLogError),

    /// The checkpoint store could not complete an operation
    #[error("Checkpoint store error: {0}")]
    Checkpoint(#[from] StoreError),

    #[error("Projection {projection} failed on {stream}@{position}: {message}")]
    Handler {
        projection: String,
        stream: String,
        position: Position,
        message: String,
    },

    /// Broken ordering invariant; never retried
    #[error("Ordering violation in {projection} [{partition}]: {reason}")]
    OrderingViolation {
        projection: String,
        partition: String,
        reason: String,
    },

    #[error("Partition worker of {projection} [{partition}] terminated unexpectedly")]
    WorkerLost { projection: String, partition: String },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Projection already running: {0}")]
    AlreadyRunning(String),

    #[error("Projection not registered: {0}")]
    NotRegistered(String),
}

impl ProjectionError {
    /// Whether the error came from the event log or the checkpoint store.
    pub fn is_storage_failure(&self) -> bool {
        matches!(self, ProjectionError::EventLog(_) | ProjectionError::Checkpoint(_))
    }

    /// Whether retrying the failed storage operation may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            ProjectionError::EventLog(e) => e.is_transient(),
            ProjectionError::Checkpoint(e) => e.is_transient(),
            _ => false,
        }
    }
}

/// Label used for a partition in logs and errors.
pub(crate) fn partition_label(partition: Option<&str>) -> String {
    partition.unwrap_or("*").to_string()
}

pub type Result<T> = std::result::Result<T, ProjectionError>;
