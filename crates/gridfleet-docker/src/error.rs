use gridfleet_core::{ConfigError, FleetError};
use gridfleet_ports::PortError;
use thiserror::Error;

pub type EngineResult<T> = Result<T, EngineError>;

pub type DockerResult<T> = Result<T, DockerError>;

/// Failures talking to the container engine.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid engine endpoint {0}")]
    InvalidEndpoint(String),

    #[error("cannot connect to engine at {endpoint}: {source}")]
    Connect {
        endpoint: String,
        source: std::io::Error,
    },

    #[error("http error: {0}")]
    Http(String),

    #[error("engine returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("engine request timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("failed to decode engine response: {0}")]
    Decode(#[from] serde_json::Error),
}

impl EngineError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, EngineError::Api { status: 404, .. })
    }
}

impl From<hyper::Error> for EngineError {
    fn from(err: hyper::Error) -> Self {
        EngineError::Http(err.to_string())
    }
}

impl From<http::Error> for EngineError {
    fn from(err: http::Error) -> Self {
        EngineError::Http(err.to_string())
    }
}

/// Failures of the container backend.
#[derive(Debug, Error)]
pub enum DockerError {
    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    #[error("image {0} is not available")]
    ImageUnavailable(String),

    #[error("failed to create container {0}")]
    CreateFailed(String),

    #[error("failed to start container {0}")]
    StartFailed(String),

    #[error("container {0} was disposed while starting")]
    Disposed(String),

    #[error("container {0} exited before becoming available")]
    Exited(String),

    #[error("{host}:{port} did not become available after {attempts} attempts")]
    Unavailable {
        host: String,
        port: u16,
        attempts: u32,
    },

    #[error(transparent)]
    Port(#[from] PortError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl From<DockerError> for FleetError {
    fn from(err: DockerError) -> Self {
        match err {
            DockerError::Engine(e) => FleetError::Engine(e.to_string()),
            DockerError::InvalidArgument(msg) => FleetError::InvalidArgument(msg),
            DockerError::InvalidOperation(msg) => FleetError::InvalidOperation(msg),
            DockerError::Exited(name) => FleetError::InstanceExited(name),
            DockerError::Disposed(name) => {
                FleetError::InvalidOperation(format!("{name} was terminated while starting"))
            }
            DockerError::Unavailable {
                host,
                port,
                attempts,
            } => FleetError::Unavailable {
                host,
                port,
                attempts,
            },
            DockerError::Port(e) => e.into(),
            DockerError::Config(e) => FleetError::Config(e),
            other @ (DockerError::ImageUnavailable(_)
            | DockerError::CreateFailed(_)
            | DockerError::StartFailed(_)) => FleetError::Engine(other.to_string()),
        }
    }
}
