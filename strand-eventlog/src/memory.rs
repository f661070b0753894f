//! In-memory event log implementation
//!
//! Used for testing and development without a database.
//! Thread-safe using RwLock for concurrent access.

use crate::log::{EventLog, EventStream};
use crate::types::{Event, EventLogError, NewEvent, Position, Result, FIRST_POSITION};
use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use std::collections::HashMap;
use std::sync::RwLock;
use tracing::debug;

/// Stream state: events indexed by position, plus append counter
#[derive(Debug, Default)]
struct StreamState {
    events: Vec<Event>,
    version: i64,
}

/// In-memory event log for testing
#[derive(Debug, Default)]
pub struct MemoryEventLog {
    streams: RwLock<HashMap<String, StreamState>>,
}

impl MemoryEventLog {
    /// Create a new empty in-memory event log
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of events across all streams
    pub fn event_count(&self) -> usize {
        self.streams
            .read()
            .map(|streams| streams.values().map(|s| s.events.len()).sum())
            .unwrap_or(0)
    }

    fn snapshot(&self, stream: &str, from: Position) -> Result<Vec<Event>> {
        let streams = self
            .streams
            .read()
            .map_err(|_| EventLogError::Unavailable("event log lock poisoned".to_string()))?;

        let Some(state) = streams.get(stream) else {
            return Ok(Vec::new());
        };

        // Positions are gapless from 0, so the position doubles as the index.
        let start = usize::try_from(from.max(FIRST_POSITION)).unwrap_or(usize::MAX);
        Ok(state.events.get(start..).map(<[Event]>::to_vec).unwrap_or_default())
    }
}

#[async_trait]
impl EventLog for MemoryEventLog {
    async fn append(&self, stream: &str, event: NewEvent) -> Result<Position> {
        event.validate(stream)?;

        let mut streams = self
            .streams
            .write()
            .map_err(|_| EventLogError::Unavailable("event log lock poisoned".to_string()))?;

        let state = streams.entry(stream.to_string()).or_default();
        let position = state.events.len() as Position;
        let stored = event.into_event(stream, position);

        debug!(
            event_id = %stored.event_id,
            stream = %stream,
            position,
            event_type = %stored.event_type,
            "Event appended"
        );

        state.events.push(stored);
        state.version += 1;

        Ok(position)
    }

    fn read(&self, stream: &str, from: Position) -> EventStream<'static> {
        match self.snapshot(stream, from) {
            Ok(events) => stream::iter(events.into_iter().map(Ok)).boxed(),
            Err(e) => stream::once(async move { Err(e) }).boxed(),
        }
    }

    async fn stream_position(&self, stream: &str) -> Result<Option<Position>> {
        let streams = self
            .streams
            .read()
            .map_err(|_| EventLogError::Unavailable("event log lock poisoned".to_string()))?;

        Ok(streams
            .get(stream)
            .and_then(|s| s.events.last())
            .map(|e| e.position))
    }

    async fn stream_version(&self, stream: &str) -> Result<Option<i64>> {
        let streams = self
            .streams
            .read()
            .map_err(|_| EventLogError::Unavailable("event log lock poisoned".to_string()))?;

        Ok(streams.get(stream).map(|s| s.version))
    }
}

// =============================================================================
// Tests
// =============================================================================
