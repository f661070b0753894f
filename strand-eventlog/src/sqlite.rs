//! SQLite event log adapter.
//!
//! Same schema and position discipline as the PostgreSQL adapter. SQLite
//! serializes writers, so the head upsert and the event insert of one append
//! always commit together before the next append starts.

use crate::log::{EventLog, EventStream};
use crate::types::{Event, NewEvent, Position, Result, FIRST_POSITION};
use async_stream::try_stream;
use async_trait::async_trait;
use futures_util::StreamExt;
use sqlx::SqlitePool;
use tracing::debug;

/// Default number of rows fetched per round trip while reading.
pub const DEFAULT_PAGE_SIZE: i64 = 500;

/// SQLite adapter implementing [`EventLog`].
#[derive(Debug, Clone)]
pub struct SqliteEventLog {
    pool: SqlitePool,
    page_size: i64,
}

impl SqliteEventLog {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool, page_size: DEFAULT_PAGE_SIZE }
    }

    /// Override the read page size.
    pub fn with_page_size(mut self, page_size: i64) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

async fn head(pool: &SqlitePool, stream: &str) -> Result<Option<Position>> {
    let position = sqlx::query_scalar::<_, i64>("SELECT position FROM event_streams WHERE stream_id = ?")
        .bind(stream)
        .fetch_optional(pool)
        .await?;
    Ok(position)
}

async fn read_page(
    pool: &SqlitePool,
    stream: &str,
    from: Position,
    upto: Position,
    limit: i64,
) -> Result<Vec<Event>> {
    let events = sqlx::query_as::<_, Event>(
        r#"
        SELECT stream_id, position, event_id, event_type, payload, metadata, created_at
        FROM event_log
        WHERE stream_id = ? AND position >= ? AND position <= ?
        ORDER BY position ASC
        LIMIT ?
        "#,
    )
    .bind(stream)
    .bind(from)
    .bind(upto)
    .bind(limit)
    .fetch_all(pool)
    .await?;
    Ok(events)
}

#[async_trait]
impl EventLog for SqliteEventLog {
    async fn append(&self, stream: &str, event: NewEvent) -> Result<Position> {
        event.validate(stream)?;

        let mut tx = self.pool.begin().await?;

        let position: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO event_streams (stream_id, position, version, updated_at)
            VALUES (?, 0, 1, CURRENT_TIMESTAMP)
            ON CONFLICT (stream_id) DO UPDATE
            SET position = event_streams.position + 1,
                version = event_streams.version + 1,
                updated_at = CURRENT_TIMESTAMP
            RETURNING position
            "#,
        )
        .bind(stream)
        .fetch_one(&mut *tx)
        .await?;

        let stored = event.into_event(stream, position);

        sqlx::query(
            r#"
            INSERT INTO event_log (
                stream_id, position, event_id, event_type, payload, metadata, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&stored.stream)
        .bind(stored.position)
        .bind(stored.event_id)
        .bind(&stored.event_type)
        .bind(&stored.payload)
        .bind(&stored.metadata)
        .bind(stored.created_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        debug!(
            event_id = %stored.event_id,
            stream = %stream,
            position,
            event_type = %stored.event_type,
            "Event appended"
        );

        Ok(position)
    }

    fn read(&self, stream: &str, from: Position) -> EventStream<'static> {
        let pool = self.pool.clone();
        let stream = stream.to_string();
        let page_size = self.page_size;

        try_stream! {
            if let Some(head) = head(&pool, &stream).await? {
                let mut next = from.max(FIRST_POSITION);
                while next <= head {
                    let page = read_page(&pool, &stream, next, head, page_size).await?;
                    if page.is_empty() {
                        break;
                    }
                    for event in page {
                        next = event.position + 1;
                        yield event;
                    }
                }
            }
        }
        .boxed()
    }

    async fn stream_position(&self, stream: &str) -> Result<Option<Position>> {
        head(&self.pool, stream).await
    }

    async fn stream_version(&self, stream: &str) -> Result<Option<i64>> {
        let version = sqlx::query_scalar::<_, i64>("SELECT version FROM event_streams WHERE stream_id = ?")
            .bind(stream)
            .fetch_optional(&self.pool)
            .await?;
        Ok(version)
    }
}

// =============================================================================
// Tests
// =============================================================================
