//! Error types shared by the warmpool crates.

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for configuration loading.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Errors raised while reading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Result type alias for pool operations.
pub type PoolResult<T> = Result<T, PoolError>;

/// Errors that can occur while starting, checking out, or managing processes.
///
/// An execution that runs past its deadline is not an error; it is reported
/// as [`crate::ExecutionStatus::TimedOut`].
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("failed to spawn worker process: {0}")]
    StartupFailure(#[source] std::io::Error),

    #[error("worker did not print {marker:?} within {timeout_ms} ms")]
    ReadinessTimeout { marker: String, timeout_ms: u64 },

    #[error("worker exited before printing {marker:?}")]
    ExitedDuringStartup { marker: String },

    #[error("unknown configuration: {0}")]
    UnknownConfiguration(String),

    #[error("configuration not running: {0}")]
    NotRunning(String),

    #[error("no configurations are running")]
    NoRunningConfigurations,

    #[error("timed out waiting for an idle process from {0}")]
    CheckoutTimeout(String),

    #[error("pool for {0} has been stopped")]
    PoolStopped(String),

    #[error("coordinator has been shut down")]
    ShutDown,

    #[error("worker I/O error: {0}")]
    Io(#[from] std::io::Error),
}
