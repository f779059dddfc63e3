//! Error types shared by the fleet backends.

use std::path::PathBuf;

use thiserror::Error;

use crate::types::LifecycleState;

/// Result type alias for fleet operations.
pub type FleetResult<T> = Result<T, FleetError>;

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid duration for `{field}`: {value}")]
    Duration { field: &'static str, value: String },

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Errors that can occur while provisioning or tearing down grid servers.
#[derive(Debug, Error)]
pub enum FleetError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    #[error("grid server executable not found at {0}")]
    ExecutableNotFound(PathBuf),

    #[error("failed to launch {executable}: {source}")]
    LaunchFailed {
        executable: String,
        source: std::io::Error,
    },

    #[error("failed to kill process {pid}: {source}")]
    KillFailed { pid: u32, source: std::io::Error },

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("port {0} is already allocated")]
    PortAlreadyAllocated(u16),

    #[error("invalid lifecycle transition {from:?} -> {to:?}")]
    InvalidTransition {
        from: LifecycleState,
        to: LifecycleState,
    },

    #[error("instance not found: {0}")]
    InstanceNotFound(String),

    #[error("{host}:{port} did not become available after {attempts} attempts")]
    Unavailable {
        host: String,
        port: u16,
        attempts: u32,
    },

    #[error("instance exited before becoming available: {0}")]
    InstanceExited(String),

    #[error("container engine error: {0}")]
    Engine(String),

    #[error("process table error: {0}")]
    ProcessTable(String),

    #[error("unsupported by this backend: {0}")]
    Unsupported(String),

    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
