//! Strand Daemon Library
//!
//! Long-running host for the projection engine.
//!
//! # Architecture
//!
//! ```text
//! API Server ──append──→ Event Log ──read──→ Projection Engine ──→ Read Models
//!     │                                          │
//!     └──status/start/stop/reset─────────────────┘──→ Checkpoint Store
//! ```
//!
//! # Components
//!
//! - **Daemon**: Main runtime orchestrator
//! - **Samples**: Event-type counter and per-entity activity projections
//! - **API**: HTTP endpoints for operations
//! - **Metrics**: Prometheus exposition of projection counters
//! - **Config**: Environment-based configuration
//!
//! # Example
//!
//! ```rust,ignore
//! use strandd::{Config, Daemon};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = Config::from_env().expect("Failed to load config");
//!     let daemon = Daemon::connect(config).await.expect("Failed to connect");
//!     daemon.run().await.expect("Daemon error");
//! }
//! ```

#![warn(clippy::all)]

pub mod api;
pub mod config;
pub mod daemon;
pub mod db;
pub mod error;
pub mod metrics;
pub mod samples;

// Re-exports for convenience
pub use config::{ApiConfig, Config, DatabaseConfig, Environment, ProjectorConfig};
pub use daemon::Daemon;
pub use error::{DaemonError, DaemonResult};
pub use samples::{EntityActivity, EventTypeCounts, ReadModel};
