//! Daemon configuration.
//!
//! Loads configuration from environment variables with sensible defaults.

use crate::error::{DaemonError, DaemonResult};
use std::env;
use std::str::FromStr;
use std::time::Duration;
use strand_projector::{Backoff, CheckpointCadence, FailurePolicy, ProjectionOptions};

// =============================================================================
// Configuration
// =============================================================================

/// Daemon configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// API server configuration
    pub api: ApiConfig,

    /// Storage configuration
    pub database: DatabaseConfig,

    /// Defaults applied to every hosted projection
    pub projector: ProjectorConfig,

    /// Environment (test, development, production)
    pub environment: Environment,
}

/// API server configuration.
#[derive(Debug, Clone)]
pub struct ApiConfig {
    /// Host to bind to
    pub host: String,
    /// Port to bind to
    pub port: u16,
}

/// Storage configuration.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// `postgres://` or `sqlite:` URL; in-memory backends when absent
    pub url: Option<String>,
    pub max_connections: u32,
}

/// Projection processing defaults.
#[derive(Debug, Clone)]
pub struct ProjectorConfig {
    /// Stream the sample projections consume
    pub source_stream: String,
    pub poll_interval: Duration,
    /// Save a checkpoint after this many events
    pub checkpoint_every: u64,
    /// Save unsaved progress at least this often
    pub checkpoint_interval: Duration,
    pub queue_capacity: usize,
    /// Handler invocations per event, the first one included
    pub retry_attempts: u32,
    pub retry_backoff: Duration,
}

impl ProjectorConfig {
    /// Processing options for a projection of the source stream.
    pub fn options(&self) -> ProjectionOptions {
        ProjectionOptions::new(self.source_stream.clone())
            .with_policy(FailurePolicy::retry(
                self.retry_attempts,
                Backoff::Exponential {
                    initial: self.retry_backoff,
                    max: self.retry_backoff * 32,
                },
            ))
            .with_cadence(CheckpointCadence::batched(self.checkpoint_every, self.checkpoint_interval))
            .with_queue_capacity(self.queue_capacity)
            .with_poll_interval(self.poll_interval)
    }
}

/// Environment type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    /// Test environment
    Test,
    /// Development environment
    Development,
    /// Production environment (requires a database)
    Production,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> DaemonResult<Self> {
        // Load .env file if present (ignore errors)
        let _ = dotenvy::dotenv();

        Self::from_vars(|key| env::var(key).ok())
    }

    /// Load configuration from an arbitrary variable source.
    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> DaemonResult<Self> {
        let environment = Self::load_environment(&var)?;
        let api = Self::load_api_config(&var)?;
        let database = Self::load_database_config(&var)?;
        let projector = Self::load_projector_config(&var)?;

        if environment == Environment::Production && database.url.is_none() {
            return Err(DaemonError::Config(
                "DATABASE_URL is required in production".to_string(),
            ));
        }

        Ok(Self {
            api,
            database,
            projector,
            environment,
        })
    }

    /// Create test configuration.
    pub fn test() -> Self {
        Self {
            api: ApiConfig {
                host: "127.0.0.1".to_string(),
                port: 0, // Let OS assign port
            },
            database: DatabaseConfig {
                url: None,
                max_connections: 1,
            },
            projector: ProjectorConfig {
                poll_interval: Duration::from_millis(10),
                checkpoint_interval: Duration::from_millis(50),
                retry_backoff: Duration::from_millis(1),
                ..ProjectorConfig::default()
            },
            environment: Environment::Test,
        }
    }

    fn load_environment(var: &impl Fn(&str) -> Option<String>) -> DaemonResult<Environment> {
        let env_str = var("STRAND_ENV").unwrap_or_else(|| "development".to_string());

        match env_str.to_lowercase().as_str() {
            "test" => Ok(Environment::Test),
            "development" | "dev" => Ok(Environment::Development),
            "production" | "prod" => Ok(Environment::Production),
            other => Err(DaemonError::Config(format!(
                "Invalid STRAND_ENV: {}. Expected: test, development, production",
                other
            ))),
        }
    }

    fn load_api_config(var: &impl Fn(&str) -> Option<String>) -> DaemonResult<ApiConfig> {
        let host = var("STRAND_API_HOST").unwrap_or_else(|| "0.0.0.0".to_string());
        let port = Self::load_parsed(var, "STRAND_API_PORT", 8080u16)?;

        Ok(ApiConfig { host, port })
    }

    fn load_database_config(var: &impl Fn(&str) -> Option<String>) -> DaemonResult<DatabaseConfig> {
        let url = var("DATABASE_URL").filter(|url| !url.trim().is_empty());
        let max_connections = Self::load_positive(var, "STRAND_DB_MAX_CONNECTIONS", 5u32)?;

        Ok(DatabaseConfig { url, max_connections })
    }

    fn load_projector_config(var: &impl Fn(&str) -> Option<String>) -> DaemonResult<ProjectorConfig> {
        let defaults = ProjectorConfig::default();

        let source_stream = var("STRAND_SOURCE_STREAM").unwrap_or(defaults.source_stream);
        if source_stream.trim().is_empty() {
            return Err(DaemonError::Config("STRAND_SOURCE_STREAM must not be empty".to_string()));
        }

        let config = ProjectorConfig {
            source_stream,
            poll_interval: Self::load_millis(var, "STRAND_POLL_INTERVAL_MS", defaults.poll_interval)?,
            checkpoint_every: Self::load_positive(var, "STRAND_CHECKPOINT_EVERY", defaults.checkpoint_every)?,
            checkpoint_interval: Self::load_millis(
                var,
                "STRAND_CHECKPOINT_INTERVAL_MS",
                defaults.checkpoint_interval,
            )?,
            queue_capacity: Self::load_positive(var, "STRAND_QUEUE_CAPACITY", defaults.queue_capacity)?,
            retry_attempts: Self::load_positive(var, "STRAND_RETRY_ATTEMPTS", defaults.retry_attempts)?,
            retry_backoff: Self::load_millis(var, "STRAND_RETRY_BACKOFF_MS", defaults.retry_backoff)?,
        };

        config
            .options()
            .validate()
            .map_err(|e| DaemonError::Config(e.to_string()))?;
        Ok(config)
    }

    fn load_parsed<T: FromStr>(var: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> DaemonResult<T> {
        match var(key) {
            Some(val) => val
                .trim()
                .parse()
                .map_err(|_| DaemonError::Config(format!("Invalid {} value: {}", key, val))),
            None => Ok(default),
        }
    }

    fn load_positive<T>(var: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> DaemonResult<T>
    where
        T: FromStr + PartialEq + Default,
    {
        let value = Self::load_parsed(var, key, default)?;
        if value == T::default() {
            return Err(DaemonError::Config(format!("{} must be greater than zero", key)));
        }
        Ok(value)
    }

    fn load_millis(var: &impl Fn(&str) -> Option<String>, key: &str, default: Duration) -> DaemonResult<Duration> {
        let millis = Self::load_positive(var, key, u64::try_from(default.as_millis()).unwrap_or(u64::MAX))?;
        Ok(Duration::from_millis(millis))
    }
}

impl Default for ProjectorConfig {
    fn default() -> Self {
        Self {
            source_stream: "events".to_string(),
            poll_interval: Duration::from_millis(250),
            checkpoint_every: 1,
            checkpoint_interval: Duration::from_secs(1),
            queue_capacity: 64,
            retry_attempts: 3,
            retry_backoff: Duration::from_millis(100),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api: ApiConfig {
                host: "0.0.0.0".to_string(),
                port: 8080,
            },
            database: DatabaseConfig {
                url: None,
                max_connections: 5,
            },
            projector: ProjectorConfig::default(),
            environment: Environment::Development,
        }
    }
}

impl std::fmt::Display for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Environment::Test => write!(f, "test"),
            Environment::Development => write!(f, "development"),
            Environment::Production => write!(f, "production"),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
