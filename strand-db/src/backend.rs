//! Backend selection from a connection URL.

use crate::{migrate_postgres, migrate_sqlite, status_postgres, status_sqlite, AppliedMigration, Result};
use anyhow::{anyhow, bail};
use sqlx::postgres::PgPoolOptions;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{PgPool, SqlitePool};
use std::str::FromStr;
use std::sync::Arc;
use strand_eventlog::{EventLog, PgEventLog, SqliteEventLog};
use strand_store::{CheckpointStore, PgCheckpointStore, SqliteCheckpointStore};
use tracing::info;

/// SQL backend named by a connection URL scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Postgres,
    Sqlite,
}

impl Backend {
    pub fn from_url(url: &str) -> Result<Self> {
        let (scheme, _) = url
            .split_once(':')
            .ok_or_else(|| anyhow!("malformed database URL (missing scheme): {url}"))?;

        match scheme {
            "postgres" | "postgresql" => Ok(Backend::Postgres),
            "sqlite" => Ok(Backend::Sqlite),
            other => bail!("unsupported database URL scheme: {other}"),
        }
    }
}

/// A connected database backing both the event log and the checkpoint store.
#[derive(Debug, Clone)]
pub enum Database {
    Postgres(PgPool),
    Sqlite(SqlitePool),
}

impl Database {
    /// Connect to the backend named by `url`.
    ///
    /// SQLite files are created when missing; an in-memory SQLite database
    /// is held on a single connection so every query sees the same data.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        let backend = Backend::from_url(url)?;
        info!(backend = ?backend, max_connections, "Connecting to database");

        match backend {
            Backend::Postgres => {
                let pool = PgPoolOptions::new().max_connections(max_connections).connect(url).await?;
                Ok(Database::Postgres(pool))
            },
            Backend::Sqlite => {
                let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
                let max_connections = if url.contains(":memory:") { 1 } else { max_connections };
                let pool = SqlitePoolOptions::new()
                    .max_connections(max_connections)
                    .connect_with(options)
                    .await?;
                Ok(Database::Sqlite(pool))
            },
        }
    }

    pub fn backend(&self) -> Backend {
        match self {
            Database::Postgres(_) => Backend::Postgres,
            Database::Sqlite(_) => Backend::Sqlite,
        }
    }

    pub async fn migrate(&self) -> Result<()> {
        match self {
            Database::Postgres(pool) => migrate_postgres(pool).await,
            Database::Sqlite(pool) => migrate_sqlite(pool).await,
        }
    }

    pub async fn status(&self) -> Result<Vec<AppliedMigration>> {
        match self {
            Database::Postgres(pool) => status_postgres(pool).await,
            Database::Sqlite(pool) => status_sqlite(pool).await,
        }
    }

    pub fn event_log(&self) -> Arc<dyn EventLog> {
        match self {
            Database::Postgres(pool) => Arc::new(PgEventLog::new(pool.clone())),
            Database::Sqlite(pool) => Arc::new(SqliteEventLog::new(pool.clone())),
        }
    }

    pub fn checkpoint_store(&self) -> Arc<dyn CheckpointStore> {
        match self {
            Database::Postgres(pool) => Arc::new(PgCheckpointStore::new(pool.clone())),
            Database::Sqlite(pool) => Arc::new(SqliteCheckpointStore::new(pool.clone())),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
