//! gridfleet-docker: grid servers as Docker containers.
//!
//! # Architecture
//!
//! ```text
//! DockerFleet (GridServerBackend)
//!   ├── Mutex<Vec<Arc<GridServerDockerContainer>>>
//!   └── GridServerDockerAuthority
//!         ├── Instrumented<op> × 8 (timing, logging, counters)
//!         │     HasExited, CheckImage, CreateImage, CreateContainer,
//!         │     StartContainer, RemoveContainer, KillContainer,
//!         │     UpdateContainer
//!         ├── QuotaCalculator (physical-to-logical ratio)
//!         └── ContainerEngine ── DockerEngine (hyper, unix socket or TCP)
//! ```
//!
//! Operations never return errors. A failing engine call is logged with
//! the operation name and surfaces as the operation's default output
//! (`false`, an empty id, `None`).

pub mod authority;
pub mod client;
pub mod container;
pub mod engine;
pub mod error;
pub mod fleet;
pub mod models;
pub mod operations;

pub use authority::GridServerDockerAuthority;
pub use client::DockerEngine;
pub use container::GridServerDockerContainer;
pub use engine::ContainerEngine;
pub use error::{DockerError, DockerResult, EngineError, EngineResult};
pub use fleet::DockerFleet;
pub use operations::{DockerOperation, Instrumented, run_operation};
