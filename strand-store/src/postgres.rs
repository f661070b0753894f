//! PostgreSQL checkpoint store.
//!
//! This module uses dynamic queries (sqlx::query) instead of compile-time
//! checked macros (sqlx::query!) to allow compilation without DATABASE_URL.

use crate::error::StoreError;
use crate::repository::{partition_columns, validate, Checkpoint, CheckpointStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use strand_eventlog::Position;
use tracing::debug;

/// PostgreSQL adapter implementing [`CheckpointStore`].
#[derive(Debug, Clone)]
pub struct PgCheckpointStore {
    pool: PgPool,
}

impl PgCheckpointStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get a reference to the underlying pool (for testing).
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl CheckpointStore for PgCheckpointStore {
    async fn get(&self, projection: &str, partition: Option<&str>) -> Result<Option<Position>, StoreError> {
        validate(projection, None)?;
        let (partitioned, partition_key) = partition_columns(partition);

        let position = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT position FROM projection_checkpoints
            WHERE projection = $1 AND partitioned = $2 AND partition_key = $3
            "#,
        )
        .bind(projection)
        .bind(partitioned)
        .bind(partition_key)
        .fetch_optional(&self.pool)
        .await?;

        Ok(position)
    }

    async fn save(&self, projection: &str, partition: Option<&str>, position: Position) -> Result<(), StoreError> {
        validate(projection, Some(position))?;
        let (partitioned, partition_key) = partition_columns(partition);

        sqlx::query(
            r#"
            INSERT INTO projection_checkpoints (projection, partitioned, partition_key, position, updated_at)
            VALUES ($1, $2, $3, $4, NOW())
            ON CONFLICT (projection, partitioned, partition_key) DO UPDATE
            SET position = EXCLUDED.position,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(projection)
        .bind(partitioned)
        .bind(partition_key)
        .bind(position)
        .execute(&self.pool)
        .await?;

        debug!(projection, partition = ?partition, position, "Checkpoint saved");
        Ok(())
    }

    async fn reset(&self, projection: &str, partition: Option<&str>) -> Result<(), StoreError> {
        validate(projection, None)?;
        let (partitioned, partition_key) = partition_columns(partition);

        sqlx::query(
            r#"
            DELETE FROM projection_checkpoints
            WHERE projection = $1 AND partitioned = $2 AND partition_key = $3
            "#,
        )
        .bind(projection)
        .bind(partitioned)
        .bind(partition_key)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list(&self, projection: &str) -> Result<Vec<Checkpoint>, StoreError> {
        validate(projection, None)?;

        let rows = sqlx::query(
            r#"
            SELECT projection, partitioned, partition_key, position, updated_at
            FROM projection_checkpoints
            WHERE projection = $1
            ORDER BY partitioned ASC, partition_key ASC
            "#,
        )
        .bind(projection)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let partitioned: bool = row.try_get("partitioned")?;
                let partition_key: String = row.try_get("partition_key")?;
                let updated_at: DateTime<Utc> = row.try_get("updated_at")?;
                Ok(Checkpoint {
                    projection: row.try_get("projection")?,
                    partition: partitioned.then_some(partition_key),
                    position: row.try_get("position")?,
                    updated_at,
                })
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()
            .map_err(StoreError::from)
    }

    async fn reset_all(&self, projection: &str) -> Result<u64, StoreError> {
        validate(projection, None)?;

        let result = sqlx::query("DELETE FROM projection_checkpoints WHERE projection = $1")
            .bind(projection)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}
