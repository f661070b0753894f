//! Daemon: Main runtime orchestrator.
//!
//! The Daemon ties together:
//! - Event log and checkpoint store (SQL or in-memory)
//! - Projection engine with the sample projections
//! - API server (HTTP endpoints)
//!
//! # Lifecycle
//!
//! 1. Load configuration
//! 2. Connect to the database and run migrations (when configured)
//! 3. Register projections and start them
//! 4. Start API server
//! 5. Wait for SIGINT or an external shutdown request
//! 6. Stop every projection gracefully, flushing checkpoints

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use strand_db::Database;
use strand_eventlog::{EventLog, MemoryEventLog};
use strand_projector::ProjectionEngine;
use strand_store::{CheckpointStore, MemoryCheckpointStore};

use crate::api::{create_router, ApiState};
use crate::config::Config;
use crate::error::{DaemonError, DaemonResult};
use crate::metrics::Metrics;
use crate::samples::{EntityActivity, EventTypeCounts, ReadModel};

// =============================================================================
// Daemon
// =============================================================================

/// The main Strand daemon.
pub struct Daemon {
    /// Configuration
    config: Config,
    /// Projection engine hosting every projection
    engine: Arc<ProjectionEngine>,
    /// Source of events, shared with the API
    log: Arc<dyn EventLog>,
    /// Read models of the hosted projections, by projection name
    read_models: BTreeMap<String, Arc<dyn ReadModel>>,
    /// Fired to request a graceful shutdown
    shutdown: CancellationToken,
}

impl Daemon {
    /// Create a daemon with in-memory backends (for testing/development).
    pub fn in_memory(config: Config) -> DaemonResult<Self> {
        Self::new(config, Arc::new(MemoryEventLog::new()), Arc::new(MemoryCheckpointStore::new()))
    }

    /// Create a daemon on the configured database, falling back to
    /// in-memory backends when no `DATABASE_URL` is set.
    pub async fn connect(config: Config) -> DaemonResult<Self> {
        let Some(url) = config.database.url.clone() else {
            info!("No DATABASE_URL configured, using in-memory backends");
            return Self::in_memory(config);
        };

        let database = Database::connect(&url, config.database.max_connections)
            .await
            .map_err(|e| DaemonError::Database(format!("{e:#}")))?;
        database.migrate().await.map_err(|e| DaemonError::Database(format!("{e:#}")))?;
        info!(backend = ?database.backend(), "Database ready");

        Self::new(config, database.event_log(), database.checkpoint_store())
    }

    /// Create a daemon on the given backends and register the sample projections.
    pub fn new(config: Config, log: Arc<dyn EventLog>, checkpoints: Arc<dyn CheckpointStore>) -> DaemonResult<Self> {
        let engine = Arc::new(ProjectionEngine::new(log.clone(), checkpoints));
        let options = config.projector.options();

        let counts = Arc::new(EventTypeCounts::new());
        engine.register(counts.clone(), options.clone())?;

        let activity = Arc::new(EntityActivity::new());
        engine.register_partitioned(activity.clone(), options)?;

        let mut read_models: BTreeMap<String, Arc<dyn ReadModel>> = BTreeMap::new();
        read_models.insert(EventTypeCounts::NAME.to_string(), counts);
        read_models.insert(EntityActivity::NAME.to_string(), activity);

        Ok(Self {
            config,
            engine,
            log,
            read_models,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn engine(&self) -> &Arc<ProjectionEngine> {
        &self.engine
    }

    /// Token that stops [`Daemon::run`] when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Run the daemon.
    ///
    /// This method blocks until shutdown is requested (SIGINT or the
    /// shutdown token).
    pub async fn run(self) -> DaemonResult<()> {
        info!(
            version = env!("CARGO_PKG_VERSION"),
            environment = %self.config.environment,
            stream = %self.config.projector.source_stream,
            "Starting Strand daemon"
        );

        // 1. Start projections
        self.engine.start_all().await?;
        info!(projections = ?self.engine.names(), "Projections started");

        // 2. Start API server
        let api_addr = self.start_api_server().await?;
        info!(%api_addr, "API server started");

        // 3. Wait for shutdown
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("Received shutdown signal"),
            _ = self.shutdown.cancelled() => info!("Shutdown requested"),
        }

        // 4. Graceful shutdown
        self.shutdown().await;

        Ok(())
    }

    /// Start the API server; it stops with the shutdown token.
    pub async fn start_api_server(&self) -> DaemonResult<SocketAddr> {
        let state = Arc::new(ApiState {
            engine: self.engine.clone(),
            log: self.log.clone(),
            read_models: self.read_models.clone(),
            metrics: Metrics::new()?,
        });

        let router = create_router(state);
        let addr = format!("{}:{}", self.config.api.host, self.config.api.port);

        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| DaemonError::Config(format!("Failed to bind to {}: {}", addr, e)))?;

        let local_addr = listener
            .local_addr()
            .map_err(|e| DaemonError::Config(format!("Failed to get local address: {}", e)))?;

        // Spawn the server task
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let server =
                axum::serve(listener, router).with_graceful_shutdown(async move { shutdown.cancelled().await });
            if let Err(e) = server.await {
                error!(error = %e, "API server error");
            }
        });

        Ok(local_addr)
    }

    /// Graceful shutdown.
    async fn shutdown(&self) {
        info!("Initiating graceful shutdown");
        self.shutdown.cancel();
        self.engine.shutdown().await;

        for status in self.engine.statuses() {
            info!(
                projection = %status.name,
                state = ?status.state,
                position = ?status.position,
                "Projection final status"
            );
        }
        info!("Shutdown complete");
    }
}

// =============================================================================
// Tests
// =============================================================================
