//! Event log trait definition (Port)
//!
//! Implementations: [`MemoryEventLog`](crate::MemoryEventLog),
//! `PgEventLog` (feature `postgres`), `SqliteEventLog` (feature `sqlite`).

use crate::types::{Event, NewEvent, Position, Result};
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use std::sync::Arc;

/// Ordered, lazy sequence of events produced by [`EventLog::read`].
pub type EventStream<'a> = BoxStream<'a, Result<Event>>;

/// Append-only, per-stream ordered event log.
///
/// # Contract
///
/// - `append` assigns `current position + 1` (or `0` for a new stream) and
///   persists the event in one atomic step. Concurrent appenders to the same
///   stream never share or skip a position.
/// - `read` yields events with `position >= from` in ascending order. The
///   sequence is bounded by the stream head observed when reading starts;
///   reading again from the same floor replays the same events.
/// - `stream_position` returns `None` for a stream that was never appended to.
#[async_trait]
pub trait EventLog: Send + Sync {
    /// Append an event to a stream, returning its assigned position.
    async fn append(&self, stream: &str, event: NewEvent) -> Result<Position>;

    /// Read a stream from `from` (inclusive) up to the head at read start.
    fn read(&self, stream: &str, from: Position) -> EventStream<'static>;

    /// Last assigned position of a stream.
    async fn stream_position(&self, stream: &str) -> Result<Option<Position>>;

    /// Number of appends a stream has seen.
    async fn stream_version(&self, stream: &str) -> Result<Option<i64>>;
}

#[async_trait]
impl<L> EventLog for Arc<L>
where
    L: EventLog + ?Sized,
{
    async fn append(&self, stream: &str, event: NewEvent) -> Result<Position> {
        (**self).append(stream, event).await
    }

    fn read(&self, stream: &str, from: Position) -> EventStream<'static> {
        (**self).read(stream, from)
    }

    async fn stream_position(&self, stream: &str) -> Result<Option<Position>> {
        (**self).stream_position(stream).await
    }

    async fn stream_version(&self, stream: &str) -> Result<Option<i64>> {
        (**self).stream_version(stream).await
    }
}
