//! Event Querying (PostgreSQL)

use crate::types::{Event, Position, Result};
use sqlx::PgPool;

/// Fetch one page of a stream: `from <= position <= upto`, ascending.
pub async fn read_page(
    pool: &PgPool,
    stream: &str,
    from: Position,
    upto: Position,
    limit: i64,
) -> Result<Vec<Event>> {
    let events = sqlx::query_as::<_, Event>(
        r#"
        SELECT stream_id, position, event_id, event_type, payload, metadata, created_at
        FROM event_log
        WHERE stream_id = $1
          AND position >= $2
          AND position <= $3
        ORDER BY position ASC
        LIMIT $4
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

/// Last assigned position of a stream, `None` if it does not exist
pub async fn stream_position(pool: &PgPool, stream: &str) -> Result<Option<Position>> {
    let position = sqlx::query_scalar::<_, i64>("SELECT position FROM event_streams WHERE stream_id = $1")
        .bind(stream)
        .fetch_optional(pool)
        .await?;

    Ok(position)
}

/// Append counter of a stream, `None` if it does not exist
pub async fn stream_version(pool: &PgPool, stream: &str) -> Result<Option<i64>> {
    let version = sqlx::query_scalar::<_, i64>("SELECT version FROM event_streams WHERE stream_id = $1")
        .bind(stream)
        .fetch_optional(pool)
        .await?;

    Ok(version)
}
