//! Strand Checkpoint Store
//!
//! Durable mapping from `(projection, optional partition)` to the last
//! position a projection has finished processing.
//!
//! # Architecture
//!
//! - **Repository trait**: [`CheckpointStore`] defines the storage interface (port)
//! - **In-memory store**: Fast implementation for testing
//! - **PostgreSQL store**: Production implementation (feature `postgres`)
//! - **SQLite store**: Embedded implementation (feature `sqlite`)
//!
//! # Usage
//!
//! ```rust
//! use strand_store::{CheckpointStore, MemoryCheckpointStore};
//!
//! # async fn example() -> Result<(), strand_store::StoreError> {
//! let store = MemoryCheckpointStore::new();
//!
//! store.save("balances", None, 9).await?;
//! assert_eq!(store.get("balances", None).await?, Some(9));
//!
//! store.reset("balances", None).await?;
//! assert_eq!(store.get("balances", None).await?, None);
//! # Ok(())
//! # }
//! ```

#![warn(clippy::all)]

// Modules
mod error;
mod memory;
#[cfg(feature = "postgres")]
mod postgres;
mod repository;
#[cfg(feature = "sqlite")]
mod sqlite;

// Re-exports
pub use error::StoreError;
pub use memory::MemoryCheckpointStore;
#[cfg(feature = "postgres")]
pub use postgres::PgCheckpointStore;
pub use repository::{Checkpoint, CheckpointStore};
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteCheckpointStore;
