//! In-memory checkpoint store
//!
//! Used for testing and development without a database.
//! Thread-safe using RwLock for concurrent access.

use crate::error::StoreError;
use crate::repository::{validate, Checkpoint, CheckpointStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::RwLock;
use strand_eventlog::Position;

type Key = (String, Option<String>);

/// In-memory checkpoint store for testing
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    checkpoints: RwLock<BTreeMap<Key, (Position, DateTime<Utc>)>>,
}

impl MemoryCheckpointStore {
    /// Create a new empty in-memory store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored checkpoints across all projections
    pub fn len(&self) -> usize {
        self.checkpoints.read().map(|c| c.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn poisoned() -> StoreError {
        StoreError::Connection("checkpoint store lock poisoned".to_string())
    }
}

fn key(projection: &str, partition: Option<&str>) -> Key {
    (projection.to_string(), partition.map(str::to_string))
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn get(&self, projection: &str, partition: Option<&str>) -> Result<Option<Position>, StoreError> {
        validate(projection, None)?;
        let checkpoints = self.checkpoints.read().map_err(|_| Self::poisoned())?;
        Ok(checkpoints.get(&key(projection, partition)).map(|(position, _)| *position))
    }

    async fn save(&self, projection: &str, partition: Option<&str>, position: Position) -> Result<(), StoreError> {
        validate(projection, Some(position))?;
        let mut checkpoints = self.checkpoints.write().map_err(|_| Self::poisoned())?;
        checkpoints.insert(key(projection, partition), (position, Utc::now()));
        Ok(())
    }

    async fn reset(&self, projection: &str, partition: Option<&str>) -> Result<(), StoreError> {
        validate(projection, None)?;
        let mut checkpoints = self.checkpoints.write().map_err(|_| Self::poisoned())?;
        checkpoints.remove(&key(projection, partition));
        Ok(())
    }

    async fn list(&self, projection: &str) -> Result<Vec<Checkpoint>, StoreError> {
        validate(projection, None)?;
        let checkpoints = self.checkpoints.read().map_err(|_| Self::poisoned())?;
        // BTreeMap order puts `None` ahead of every `Some(partition)`.
        Ok(checkpoints
            .iter()
            .filter(|((name, _), _)| name == projection)
            .map(|((name, partition), (position, updated_at))| Checkpoint {
                projection: name.clone(),
                partition: partition.clone(),
                position: *position,
                updated_at: *updated_at,
            })
            .collect())
    }

    async fn reset_all(&self, projection: &str) -> Result<u64, StoreError> {
        validate(projection, None)?;
        let mut checkpoints = self.checkpoints.write().map_err(|_| Self::poisoned())?;
        let before = checkpoints.len();
        checkpoints.retain(|(name, _), _| name != projection);
        Ok((before - checkpoints.len()) as u64)
    }
}

// =============================================================================
// Tests
// =============================================================================
