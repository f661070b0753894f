//! Event Appending (PostgreSQL)

use crate::types::{Event, NewEvent, Result};
use sqlx::{PgPool, Postgres, Transaction};
use tracing::debug;

/// Append event to a stream
///
/// # Arguments
/// * `pool` - Database connection pool
/// * `stream` - Stream identifier (e.g., "account:42")
/// * `event` - Event to append
///
/// # Returns
/// The stored event, carrying its assigned position
///
/// # Errors
/// - `InvalidEvent` if the stream or event type is empty
/// - `Database` / `Unavailable` on SQL errors
pub async fn append_event(pool: &PgPool, stream: &str, event: NewEvent) -> Result<Event> {
    let mut tx = pool.begin().await?;
    let stored = append_event_tx(&mut tx, stream, event).await?;
    tx.commit().await?;
    Ok(stored)
}

/// Append event within an existing transaction
///
/// Use this when you need to append an event and update a read model atomically.
pub async fn append_event_tx(
    tx: &mut Transaction<'_, Postgres>,
    stream: &str,
    event: NewEvent,
) -> Result<Event> {
    event.validate(stream)?;

    // 1. Advance the stream head. The upsert takes the row lock, so concurrent
    //    appenders to one stream queue behind each other and each sees the
    //    committed head of the previous one.
    let position = next_position(tx, stream).await?;

    // 2. Insert event at the claimed position
    let stored = event.into_event(stream, position);

    sqlx::query(
        r#"
        INSERT INTO event_log (
            stream_id, position, event_id, event_type, payload, metadata, created_at
        ) VALUES ($1, $2, $3, $4, $5, $6, $7)
        "#,
    )
    .bind(&stored.stream)
    .bind(stored.position)
    .bind(stored.event_id)
    .bind(&stored.event_type)
    .bind(&stored.payload)
    .bind(&stored.metadata)
    .bind(stored.created_at)
    .execute(&mut **tx)
    .await?;

    debug!(
        event_id = %stored.event_id,
        stream = %stream,
        position = stored.position,
        event_type = %stored.event_type,
        "Event appended"
    );

    Ok(stored)
}

/// Claim the next position of a stream, creating the stream on first append
async fn next_position(tx: &mut Transaction<'_, Postgres>, stream: &str) -> Result<i64> {
    let position: i64 = sqlx::query_scalar(
        r#"
        INSERT INTO event_streams (stream_id, position, version, updated_at)
        VALUES ($1, 0, 1, NOW())
        ON CONFLICT (stream_id) DO UPDATE
        SET position = event_streams.position + 1,
            version = event_streams.version + 1,
            updated_at = NOW()
        RETURNING position
        "#,
    )
    .bind(stream)
    .fetch_one(&mut **tx)
    .await?;

    Ok(position)
}
