//! SQLite checkpoint store.

use crate::error::StoreError;
use crate::repository::{partition_columns, validate, Checkpoint, CheckpointStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use strand_eventlog::Position;
use tracing::debug;

/// SQLite adapter implementing [`CheckpointStore`].
#[derive(Debug, Clone)]
pub struct SqliteCheckpointStore {
    pool: SqlitePool,
}

impl SqliteCheckpointStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl CheckpointStore for SqliteCheckpointStore {
    async fn get(&self, projection: &str, partition: Option<&str>) -> Result<Option<Position>, StoreError> {
        validate(projection, None)?;
        let (partitioned, partition_key) = partition_columns(partition);

        let position = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT position FROM projection_checkpoints
            WHERE projection = ? AND partitioned = ? AND partition_key = ?
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
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT (projection, partitioned, partition_key) DO UPDATE
            SET position = excluded.position,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(projection)
        .bind(partitioned)
        .bind(partition_key)
        .bind(position)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        debug!(projection, partition = ?partition, position, "Checkpoint saved");
        Ok(())
    }

    async fn reset(&self, projection: &str, partition: Option<&str>) -> Result<(), StoreError> {
        validate(projection, None)?;
        let (partitioned, partition_key) = partition_columns(partition);

        sqlx::query(
            "DELETE FROM projection_checkpoints WHERE projection = ? AND partitioned = ? AND partition_key = ?",
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
            WHERE projection = ?
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

        let result = sqlx::query("DELETE FROM projection_checkpoints WHERE projection = ?")
            .bind(projection)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}

// =============================================================================
// Tests
// =============================================================================
