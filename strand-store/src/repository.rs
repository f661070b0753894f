//! Repository trait definitions (Ports)
//!
//! Implementations can be PostgreSQL, SQLite, in-memory, or a fault-injecting
//! wrapper for testing.

use crate::error::StoreError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use strand_eventlog::Position;

/// A stored checkpoint row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub projection: String,
    /// `None` for the projection-wide checkpoint
    pub partition: Option<String>,
    pub position: Position,
    pub updated_at: DateTime<Utc>,
}

/// Durable progress store for projections.
///
/// `get`, `save` and `reset` are atomic with respect to each other for the
/// same `(projection, partition)` key. `save` is a last-write-wins upsert:
/// concurrent saves leave the key holding exactly one of the written values.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Last processed position, `None` if never saved (or reset)
    async fn get(&self, projection: &str, partition: Option<&str>) -> Result<Option<Position>, StoreError>;

    /// Insert or overwrite a checkpoint
    async fn save(&self, projection: &str, partition: Option<&str>, position: Position) -> Result<(), StoreError>;

    /// Remove a single checkpoint
    async fn reset(&self, projection: &str, partition: Option<&str>) -> Result<(), StoreError>;

    /// Every checkpoint of a projection, projection-wide row first, then by partition
    async fn list(&self, projection: &str) -> Result<Vec<Checkpoint>, StoreError>;

    /// Remove every checkpoint of a projection, returning how many were removed
    async fn reset_all(&self, projection: &str) -> Result<u64, StoreError>;
}

#[async_trait]
impl<S> CheckpointStore for Arc<S>
where
    S: CheckpointStore + ?Sized,
{
    async fn get(&self, projection: &str, partition: Option<&str>) -> Result<Option<Position>, StoreError> {
        (**self).get(projection, partition).await
    }

    async fn save(&self, projection: &str, partition: Option<&str>, position: Position) -> Result<(), StoreError> {
        (**self).save(projection, partition, position).await
    }

    async fn reset(&self, projection: &str, partition: Option<&str>) -> Result<(), StoreError> {
        (**self).reset(projection, partition).await
    }

    async fn list(&self, projection: &str) -> Result<Vec<Checkpoint>, StoreError> {
        (**self).list(projection).await
    }

    async fn reset_all(&self, projection: &str) -> Result<u64, StoreError> {
        (**self).reset_all(projection).await
    }
}

/// Input checks shared by every backend.
pub(crate) fn validate(projection: &str, position: Option<Position>) -> Result<(), StoreError> {
    if projection.trim().is_empty() {
        return Err(StoreError::Invalid("projection name must not be empty".to_string()));
    }
    if let Some(position) = position {
        if position < 0 {
            return Err(StoreError::Invalid(format!("position {position} is negative")));
        }
    }
    Ok(())
}

/// Portable encoding of the optional partition: `(partitioned, partition_key)`.
#[cfg(any(feature = "postgres", feature = "sqlite"))]
pub(crate) fn partition_columns(partition: Option<&str>) -> (bool, &str) {
    match partition {
        Some(key) => (true, key),
        None => (false, ""),
    }
}
