//! Event Log Module
//!
//! Provides an append-only event log with:
//! - Per-stream, gapless positions starting at 0
//! - Atomic position assignment under concurrent appenders
//! - Lazy, restartable reads bounded to a snapshot of the stream head
//! - Interchangeable backends: in-memory, PostgreSQL (`postgres`), SQLite (`sqlite`)
//!
//! # Usage
//!
//! ```rust
//! use strand_eventlog::{EventLog, MemoryEventLog, NewEvent};
//! use futures_util::TryStreamExt;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let log = MemoryEventLog::new();
//!
//! let event = NewEvent::json("ACCOUNT_OPENED", &serde_json::json!({ "owner": "ada" }))?;
//! let position = log.append("account:42", event).await?;
//! assert_eq!(position, 0);
//!
//! let events: Vec<_> = log.read("account:42", 0).try_collect().await?;
//! assert_eq!(events.len(), 1);
//! # Ok(())
//! # }
//! ```

#![warn(clippy::all)]

pub mod log;
pub mod memory;
pub mod types;

#[cfg(feature = "postgres")]
pub mod append;
#[cfg(feature = "postgres")]
pub mod postgres;
#[cfg(feature = "postgres")]
pub mod query;
#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use log::{EventLog, EventStream};
pub use memory::MemoryEventLog;
pub use types::{Event, EventLogError, NewEvent, Position, Result, FIRST_POSITION};

#[cfg(feature = "postgres")]
pub use append::{append_event, append_event_tx};
#[cfg(feature = "postgres")]
pub use postgres::PgEventLog;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteEventLog;
