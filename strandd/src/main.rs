//! Strand Daemon
//!
//! Hosts the projection engine and its HTTP API.
//!
//! # Usage
//!
//! ```bash
//! # Start with default configuration (in-memory backends)
//! cargo run -p strandd
//!
//! # Start against a database
//! DATABASE_URL=postgres://localhost/strand STRAND_API_PORT=8081 cargo run -p strandd
//!
//! # Database lifecycle
//! DATABASE_URL=sqlite://strand.db cargo run -p strandd -- db migrate
//! ```
//!
//! # Environment Variables
//!
//! - `STRAND_ENV`: Environment (test, development, production)
//! - `STRAND_API_HOST`: API host (default: 0.0.0.0)
//! - `STRAND_API_PORT`: API port (default: 8080)
//! - `DATABASE_URL`: `postgres://` or `sqlite:` URL (default: in-memory)
//! - `STRAND_DB_MAX_CONNECTIONS`: Pool size (default: 5)
//! - `STRAND_SOURCE_STREAM`: Stream consumed by the projections (default: events)
//! - `STRAND_POLL_INTERVAL_MS`: Poll interval once caught up (default: 250)
//! - `STRAND_CHECKPOINT_EVERY`: Events between checkpoints (default: 1)
//! - `STRAND_CHECKPOINT_INTERVAL_MS`: Max time between checkpoints (default: 1000)
//! - `STRAND_QUEUE_CAPACITY`: Partition queue bound (default: 64)
//! - `STRAND_RETRY_ATTEMPTS`: Handler attempts per event (default: 3)
//! - `STRAND_RETRY_BACKOFF_MS`: Initial retry backoff (default: 100)

use strandd::{Config, Daemon};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::from_default_env()
                .add_directive("strandd=info".parse()?)
                .add_directive("strand_projector=info".parse()?),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();
    if args.get(1).map(String::as_str) == Some("db") {
        return strandd::db::run_db_command(&args).await;
    }

    // Load configuration
    let config = Config::from_env()?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        environment = %config.environment,
        api_host = %config.api.host,
        api_port = config.api.port,
        "Strand Daemon"
    );

    // Create and run daemon
    let daemon = Daemon::connect(config).await?;
    daemon.run().await?;

    Ok(())
}
