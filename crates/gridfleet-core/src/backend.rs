//! The contract shared by both execution backends.
//!
//! The daemon picks one implementation at startup (native processes on
//! Windows hosts, containers elsewhere) and only ever talks to it through
//! this trait.

use std::future::Future;

use crate::error::FleetResult;
use crate::types::{InstanceId, InstanceInfo, ResourceJob};

/// Parameters for provisioning one grid server.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProvisionRequest {
    /// Explicit port; the port allocator picks one when `None`.
    pub port: Option<u16>,
}

impl ProvisionRequest {
    pub fn on_port(port: u16) -> Self {
        Self { port: Some(port) }
    }
}

/// A grid server provisioning strategy.
pub trait GridServerBackend: Send + Sync {
    /// Short name for logs ("native", "docker").
    fn name(&self) -> &'static str;

    /// Start a grid server and wait until it accepts connections.
    fn provision(
        &self,
        request: ProvisionRequest,
    ) -> impl Future<Output = FleetResult<InstanceInfo>> + Send;

    /// Stop one instance. `Ok(false)` when the id is not tracked.
    fn terminate(&self, id: &InstanceId) -> impl Future<Output = FleetResult<bool>> + Send;

    /// Best-effort teardown of every tracked instance. Returns how many
    /// were stopped cleanly.
    fn terminate_all(&self) -> impl Future<Output = FleetResult<usize>> + Send;

    /// Adopt instances left running by a previous run.
    fn discover(&self) -> impl Future<Output = FleetResult<Vec<InstanceInfo>>> + Send;

    /// Apply a new CPU/memory budget to a running instance.
    fn update_resources(&self, job: &ResourceJob)
    -> impl Future<Output = FleetResult<bool>> + Send;

    /// Snapshot of tracked instances.
    fn instances(&self) -> impl Future<Output = Vec<InstanceInfo>> + Send;
}
