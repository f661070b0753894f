//! Test helpers for Strand engine and backend tests.
//!
//! Provides recording projections, stream seeding, fault-injecting wrappers
//! around the in-memory backends, wait helpers and database setup.

mod faults;
mod helpers;
mod recording;

pub use faults::{FaultyCheckpointStore, FaultyEventLog};
pub use helpers::{seed_keyed, seed_stream, wait_for_checkpoint, wait_for_state, wait_until};
pub use recording::RecordingProjection;

use anyhow::Result;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{PgPool, SqlitePool};
use strand_eventlog::SqliteEventLog;
use strand_store::SqliteCheckpointStore;

/// Setup a clean PostgreSQL schema by running migrations.
pub async fn setup_postgres(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("../migrations/postgres").run(pool).await?;
    Ok(())
}

/// Fresh in-memory SQLite database with the schema applied.
///
/// The pool holds a single connection so every query sees the same database.
pub async fn sqlite_memory_pool() -> Result<SqlitePool> {
    let pool = SqlitePoolOptions::new().max_connections(1).connect("sqlite::memory:").await?;
    sqlx::migrate!("../migrations/sqlite").run(&pool).await?;
    Ok(pool)
}

/// Event log and checkpoint store sharing one in-memory SQLite database.
pub async fn sqlite_backends() -> Result<(SqliteEventLog, SqliteCheckpointStore)> {
    let pool = sqlite_memory_pool().await?;
    Ok((SqliteEventLog::new(pool.clone()), SqliteCheckpointStore::new(pool)))
}
