use gridfleet_core::FleetError;
use thiserror::Error;

pub type PortResult<T> = Result<T, PortError>;

#[derive(Debug, Error)]
pub enum PortError {
    #[error("no free port in [{range_start}, {range_end}) after {attempts} attempts")]
    ResourceExhausted {
        range_start: u16,
        range_end: u16,
        attempts: u32,
    },

    #[error("port {0} is already allocated")]
    AlreadyAllocated(u16),

    #[error("invalid port range [{start}, {end})")]
    InvalidRange { start: u16, end: u16 },
}

impl From<PortError> for FleetError {
    fn from(err: PortError) -> Self {
        match err {
            PortError::AlreadyAllocated(port) => FleetError::PortAlreadyAllocated(port),
            PortError::ResourceExhausted { .. } => FleetError::ResourceExhausted(err.to_string()),
            PortError::InvalidRange { .. } => FleetError::InvalidArgument(err.to_string()),
        }
    }
}
