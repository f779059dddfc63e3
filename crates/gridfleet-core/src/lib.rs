//! gridfleet-core: shared vocabulary for the grid server fleet.
//!
//! Everything both execution backends agree on lives here:
//!
//! - `InstanceId`, `LifecycleState`, `InstanceInfo` (instance snapshots)
//! - `GridServerBackend`, the contract implemented by the native process
//!   backend and the container backend
//! - `BackoffPolicy` (bounded, jittered exponential retry delays)
//! - `QuotaCalculator` (CFS period/quota derived from physical cores)
//! - `HostServerInfo` (physical/logical core counts)
//! - `FleetConfig` (TOML configuration)

pub mod backend;
pub mod backoff;
pub mod config;
pub mod error;
pub mod host;
pub mod quota;
pub mod types;

pub use backend::{GridServerBackend, ProvisionRequest};
pub use backoff::{BackoffPolicy, Jitter};
pub use config::FleetConfig;
pub use error::{ConfigError, FleetError, FleetResult};
pub use host::{HostServerInfo, ProcCpuInfo, StaticHostInfo};
pub use quota::QuotaCalculator;
pub use types::*;
