//! Strand Projector
//!
//! Replays events from the event log into read models. This is the read side
//! of Event Sourcing: each registered projection resumes from its checkpoint,
//! consumes its source stream in order, fans events out to per-partition
//! workers and persists progress so a restart never re-applies checkpointed
//! work nor silently skips an event.
//!
//! # Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use strand_eventlog::{Event, MemoryEventLog};
//! use strand_projector::{Projection, ProjectionEngine, ProjectionOptions};
//! use strand_store::MemoryCheckpointStore;
//!
//! struct Audit;
//!
//! #[async_trait::async_trait]
//! impl Projection for Audit {
//!     fn name(&self) -> &str {
//!         "audit"
//!     }
//!
//!     async fn apply(&self, event: &Event) -> anyhow::Result<()> {
//!         println!("{} @ {}", event.event_type, event.position);
//!         Ok(())
//!     }
//! }
//!
//! # async fn example() -> Result<(), strand_projector::ProjectionError> {
//! let engine = ProjectionEngine::new(
//!     Arc::new(MemoryEventLog::new()),
//!     Arc::new(MemoryCheckpointStore::new()),
//! );
//! engine.register(Arc::new(Audit), ProjectionOptions::new("orders"))?;
//! engine.start("audit").await?;
//! engine.stop("audit").await?;
//! # Ok(())
//! # }
//! ```

#![warn(clippy::all)]

pub mod engine;
pub mod error;
pub mod handler;
pub mod policy;
pub mod status;

mod router;
mod worker;

pub use engine::ProjectionEngine;
pub use error::{ProjectionError, Result};
pub use handler::{PartitionedProjection, Projection, ProjectionHandler};
pub use policy::{Backoff, BackpressureMode, CheckpointCadence, Exhausted, FailurePolicy, ProjectionOptions};
pub use status::{CounterSnapshot, ProjectionState, ProjectionStatus};
