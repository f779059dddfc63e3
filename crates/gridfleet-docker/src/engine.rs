//! The container engine seam.
//!
//! [`DockerEngine`](crate::client::DockerEngine) talks to a real daemon;
//! tests substitute an in-memory engine.

use std::future::Future;

use gridfleet_core::ContainerResourceQuota;

use crate::error::EngineResult;
use crate::models::{
    ContainerFilters, ContainerInspect, ContainerSummary, CreateContainerParameters,
    UpdateContainerResponse, VersionInfo,
};

pub trait ContainerEngine: Send + Sync + 'static {
    /// Inspect by id or name. Unknown containers are `Api { status: 404 }`.
    fn inspect_container(&self, id: &str)
    -> impl Future<Output = EngineResult<ContainerInspect>> + Send;

    fn image_exists(&self, image: &str, tag: &str) -> impl Future<Output = EngineResult<bool>> + Send;

    /// Commit `container` as `repository:tag`.
    fn commit_container(
        &self,
        container: &str,
        repository: &str,
        tag: &str,
    ) -> impl Future<Output = EngineResult<()>> + Send;

    /// Create a container, returning its id.
    fn create_container(
        &self,
        parameters: &CreateContainerParameters,
    ) -> impl Future<Output = EngineResult<String>> + Send;

    /// Start a container. Starting a running container succeeds.
    fn start_container(&self, id: &str) -> impl Future<Output = EngineResult<()>> + Send;

    fn remove_container(
        &self,
        id: &str,
        remove_volumes: bool,
    ) -> impl Future<Output = EngineResult<()>> + Send;

    fn kill_container(&self, id: &str) -> impl Future<Output = EngineResult<()>> + Send;

    /// Apply CPU and memory limits to a running container.
    fn update_container(
        &self,
        id: &str,
        quota: &ContainerResourceQuota,
    ) -> impl Future<Output = EngineResult<UpdateContainerResponse>> + Send;

    fn list_containers(
        &self,
        filters: &ContainerFilters,
    ) -> impl Future<Output = EngineResult<Vec<ContainerSummary>>> + Send;

    fn version(&self) -> impl Future<Output = EngineResult<VersionInfo>> + Send;
}
