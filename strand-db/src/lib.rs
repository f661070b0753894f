//! Database lifecycle management for Strand.
//!
//! Provides migration running, status checking, and backend selection from a
//! connection URL. Both SQL backends share the same table layout; the schema
//! lives in `migrations/postgres` and `migrations/sqlite`.

mod backend;

pub use backend::{Backend, Database};

use sqlx::{PgPool, Row, SqlitePool};
use tracing::{info, warn};

/// Result type for DB operations.
pub type Result<T> = std::result::Result<T, anyhow::Error>;

/// A row of the `_sqlx_migrations` bookkeeping table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedMigration {
    pub version: i64,
    pub description: String,
    pub success: bool,
}

/// Run all pending PostgreSQL migrations.
///
/// Idempotent: safe to run multiple times.
pub async fn migrate_postgres(pool: &PgPool) -> Result<()> {
    info!(backend = "postgres", "Running database migrations...");
    sqlx::migrate!("../migrations/postgres").run(pool).await?;
    info!(backend = "postgres", "Migrations completed successfully");
    Ok(())
}

/// Run all pending SQLite migrations.
pub async fn migrate_sqlite(pool: &SqlitePool) -> Result<()> {
    info!(backend = "sqlite", "Running database migrations...");
    sqlx::migrate!("../migrations/sqlite").run(pool).await?;
    info!(backend = "sqlite", "Migrations completed successfully");
    Ok(())
}

const MIGRATIONS_QUERY: &str = r#"
    SELECT version, description, success
    FROM _sqlx_migrations
    ORDER BY version DESC
    LIMIT 10
"#;

/// Check PostgreSQL connectivity and list the latest applied migrations.
pub async fn status_postgres(pool: &PgPool) -> Result<Vec<AppliedMigration>> {
    let result: i32 = sqlx::query_scalar("SELECT 1").fetch_one(pool).await?;
    if result != 1 {
        return Err(anyhow::anyhow!("Database connectivity check failed"));
    }
    info!("Database connectivity: OK");

    // The bookkeeping table is missing until the first migration ran.
    match sqlx::query(MIGRATIONS_QUERY).fetch_all(pool).await {
        Ok(rows) => report(
            rows.iter()
                .map(|row| {
                    Ok(AppliedMigration {
                        version: row.try_get("version")?,
                        description: row.try_get("description")?,
                        success: row.try_get("success")?,
                    })
                })
                .collect::<std::result::Result<_, sqlx::Error>>()?,
        ),
        Err(e) if e.to_string().contains("_sqlx_migrations") => report(Vec::new()),
        Err(e) => Err(e.into()),
    }
}

/// Check SQLite connectivity and list the latest applied migrations.
pub async fn status_sqlite(pool: &SqlitePool) -> Result<Vec<AppliedMigration>> {
    let result: i32 = sqlx::query_scalar("SELECT 1").fetch_one(pool).await?;
    if result != 1 {
        return Err(anyhow::anyhow!("Database connectivity check failed"));
    }
    info!("Database connectivity: OK");

    match sqlx::query(MIGRATIONS_QUERY).fetch_all(pool).await {
        Ok(rows) => report(
            rows.iter()
                .map(|row| {
                    Ok(AppliedMigration {
                        version: row.try_get("version")?,
                        description: row.try_get("description")?,
                        success: row.try_get("success")?,
                    })
                })
                .collect::<std::result::Result<_, sqlx::Error>>()?,
        ),
        Err(e) if e.to_string().contains("_sqlx_migrations") => report(Vec::new()),
        Err(e) => Err(e.into()),
    }
}

fn report(migrations: Vec<AppliedMigration>) -> Result<Vec<AppliedMigration>> {
    if migrations.is_empty() {
        warn!("No migrations found in database (run `strandd db migrate` first)");
        return Ok(migrations);
    }

    info!("Latest migrations:");
    for migration in &migrations {
        let status = if migration.success { "✓" } else { "✗" };
        info!("  {} v{}: {}", status, migration.version, migration.description);
    }
    Ok(migrations)
}
