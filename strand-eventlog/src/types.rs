//! Event Log Types

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Stream-relative position of an event.
pub type Position = i64;

/// Position assigned to the first event of every stream.
pub const FIRST_POSITION: Position = 0;

/// An immutable, durably appended event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(any(feature = "postgres", feature = "sqlite"), derive(sqlx::FromRow))]
pub struct Event {
    // Identity
    pub event_id: Uuid,

    // Stream Partitioning
    #[cfg_attr(any(feature = "postgres", feature = "sqlite"), sqlx(rename = "stream_id"))]
    pub stream: String,
    pub position: Position,

    // Event Type & Data
    pub event_type: String,
    pub payload: Vec<u8>,
    pub metadata: Option<Vec<u8>>,

    // Temporal
    pub created_at: DateTime<Utc>,
}

impl Event {
    /// Decode the payload as JSON.
    pub fn payload_json<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.payload)?)
    }

    /// Decode the metadata as JSON, if present.
    pub fn metadata_json<T: DeserializeOwned>(&self) -> Result<Option<T>> {
        match &self.metadata {
            Some(bytes) => Ok(Some(serde_json::from_slice(bytes)?)),
            None => Ok(None),
        }
    }
}

/// Event builder for constructing events before they are appended
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewEvent {
    pub event_type: String,
    pub payload: Vec<u8>,
    pub metadata: Option<Vec<u8>>,
}

impl NewEvent {
    /// Create a new event from raw payload bytes
    pub fn new(event_type: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            event_type: event_type.into(),
            payload: payload.into(),
            metadata: None,
        }
    }

    /// Create a new event with a JSON-serialized payload
    pub fn json<T: Serialize + ?Sized>(event_type: impl Into<String>, payload: &T) -> Result<Self> {
        Ok(Self::new(event_type, serde_json::to_vec(payload)?))
    }

    /// Set raw metadata
    pub fn with_metadata(mut self, metadata: impl Into<Vec<u8>>) -> Self {
        self.metadata = Some(metadata.into());
        self
    }

    /// Set JSON-serialized metadata
    pub fn with_json_metadata<T: Serialize + ?Sized>(self, metadata: &T) -> Result<Self> {
        Ok(self.with_metadata(serde_json::to_vec(metadata)?))
    }

    /// Reject events that can never be stored.
    pub(crate) fn validate(&self, stream: &str) -> Result<()> {
        if stream.trim().is_empty() {
            return Err(EventLogError::InvalidEvent("stream identifier must not be empty".to_string()));
        }
        if self.event_type.trim().is_empty() {
            return Err(EventLogError::InvalidEvent(format!(
                "event type must not be empty (stream {stream})"
            )));
        }
        Ok(())
    }

    /// Materialize the stored form once a position has been assigned.
    pub(crate) fn into_event(self, stream: &str, position: Position) -> Event {
        Event {
            event_id: Uuid::now_v7(),
            stream: stream.to_string(),
            position,
            event_type: self.event_type,
            payload: self.payload,
            metadata: self.metadata,
            created_at: Utc::now(),
        }
    }
}

/// Event log errors
///
/// Every variant except `InvalidEvent` is a storage failure: the backend
/// could not complete the operation.
#[derive(Debug, thiserror::Error)]
pub enum EventLogError {
    #[error("Invalid event: {0}")]
    InvalidEvent(String),

    #[error("Position conflict: {0}")]
    Conflict(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Backend unavailable: {0}")]
    Unavailable(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl EventLogError {
    /// Whether retrying the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        !matches!(self, EventLogError::InvalidEvent(_) | EventLogError::Serialization(_))
    }
}

#[cfg(any(feature = "postgres", feature = "sqlite"))]
impl From<sqlx::Error> for EventLogError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
                EventLogError::Conflict(db_err.to_string())
            },
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                EventLogError::Unavailable(err.to_string())
            },
            _ => EventLogError::Database(err.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, EventLogError>;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_json_payload_roundtrip_through_event() {
        let new_event = NewEvent::json("ITEM_ADDED", &json!({ "sku": "A-1", "qty": 2 }))
            .unwrap()
            .with_json_metadata(&json!({ "trace": "t-1" }))
            .unwrap();

        let event = new_event.into_event("cart:1", 3);

        assert_eq!(event.stream, "cart:1");
        assert_eq!(event.position, 3);
        let payload: serde_json::Value = event.payload_json().unwrap();
        assert_eq!(payload["sku"], "A-1");
        let metadata: Option<serde_json::Value> = event.metadata_json().unwrap();
        assert_eq!(metadata.unwrap()["trace"], "t-1");
    }

    #[test]
    fn test_validate_rejects_empty_stream_and_type() {
        let event = NewEvent::new("X", b"{}".to_vec());
        assert!(matches!(event.validate(""), Err(EventLogError::InvalidEvent(_))));

        let untyped = NewEvent::new("  ", b"{}".to_vec());
        assert!(matches!(untyped.validate("s"), Err(EventLogError::InvalidEvent(_))));
    }

    #[test]
    fn test_transient_classification() {
        assert!(EventLogError::Database("down".into()).is_transient());
        assert!(!EventLogError::InvalidEvent("bad".into()).is_transient());
    }
}
