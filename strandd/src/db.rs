//! Database CLI subcommands for strandd.
//!
//! Provides `db migrate` and `db status` commands.

use anyhow::{anyhow, Result};
use std::env;
use tracing::info;

use strand_db::Database;

/// Run database CLI subcommands.
///
/// Supported commands:
/// - `strandd db migrate` - Run pending migrations
/// - `strandd db status` - Check connectivity and migration status
pub async fn run_db_command(args: &[String]) -> Result<()> {
    let command = args
        .get(2)
        .ok_or_else(|| anyhow!("Usage: strandd db <migrate|status>"))?;

    let _ = dotenvy::dotenv();
    let database_url = env::var("DATABASE_URL")
        .map_err(|_| anyhow!("DATABASE_URL environment variable is required for db commands"))?;

    let database = Database::connect(&database_url, 1).await?;

    match command.as_str() {
        "migrate" => {
            database.migrate().await?;
        },
        "status" => {
            let applied = database.status().await?;
            info!(backend = ?database.backend(), applied = applied.len(), "Database status checked");
        },
        other => {
            return Err(anyhow!("Unknown db command: {}. Use migrate or status", other));
        },
    }

    Ok(())
}
