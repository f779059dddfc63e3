//! [`GridServerBackend`] over Docker containers.
//!
//! The registry mutex is only held for list edits, never across an engine
//! call. A container is registered before it starts so concurrent
//! `terminate_all` calls see it, and unregistered before disposal.

use std::sync::{Arc, Mutex, MutexGuard};

use gridfleet_core::config::DockerConfig;
use gridfleet_core::{
    FleetResult, GridServerBackend, InstanceId, InstanceInfo, ProvisionRequest, ResourceJob,
};
use gridfleet_health::ProbeSettings;
use gridfleet_metrics::{MetricsRegistry, OperationCounters};
use gridfleet_ports::{PortAllocator, PortError};
use tracing::{info, warn};

use crate::authority::GridServerDockerAuthority;
use crate::container::GridServerDockerContainer;
use crate::engine::ContainerEngine;
use crate::error::{DockerError, DockerResult};

const COUNTER_CATEGORY: &str = "GridServerDockerFleet";

pub struct DockerFleet<E> {
    authority: Arc<GridServerDockerAuthority<E>>,
    ports: Arc<PortAllocator>,
    config: DockerConfig,
    probe: ProbeSettings,
    counters: Arc<OperationCounters>,
    containers: Mutex<Vec<Arc<GridServerDockerContainer<E>>>>,
}

impl<E: ContainerEngine> DockerFleet<E> {
    pub fn new(
        authority: Arc<GridServerDockerAuthority<E>>,
        ports: Arc<PortAllocator>,
        config: DockerConfig,
        probe: ProbeSettings,
        metrics: &MetricsRegistry,
    ) -> Self {
        Self {
            authority,
            ports,
            config,
            probe,
            counters: metrics.counters(COUNTER_CATEGORY),
            containers: Mutex::new(Vec::new()),
        }
    }

    pub fn authority(&self) -> &Arc<GridServerDockerAuthority<E>> {
        &self.authority
    }

    pub fn ports(&self) -> &Arc<PortAllocator> {
        &self.ports
    }

    /// Snapshot of tracked containers.
    pub fn containers(&self) -> Vec<Arc<GridServerDockerContainer<E>>> {
        self.registry().clone()
    }

    /// Tracked container by engine id or name.
    pub fn get_container(&self, id_or_name: &str) -> Option<Arc<GridServerDockerContainer<E>>> {
        self.registry()
            .iter()
            .find(|c| c.is_identified_by(id_or_name))
            .cloned()
    }

    async fn provision_container(
        &self,
        request: ProvisionRequest,
    ) -> DockerResult<Arc<GridServerDockerContainer<E>>> {
        let lease = match request.port {
            Some(port) => self.ports.claim(port)?,
            None => self.ports.find_next_available_port()?,
        };
        let container = Arc::new(GridServerDockerContainer::new(
            self.authority.clone(),
            &self.config,
            lease,
        )?);
        self.registry().push(container.clone());

        if let Err(e) = container.start(&self.probe).await {
            warn!(container = %container, error = %e, "grid server container failed to start");
            self.unregister(&container);
            container.dispose().await;
            return Err(e);
        }
        if container.state().is_terminal() {
            self.unregister(&container);
            container.dispose().await;
            return Err(DockerError::Disposed(container.name().to_string()));
        }
        Ok(container)
    }

    fn unregister(&self, container: &Arc<GridServerDockerContainer<E>>) -> bool {
        let mut containers = self.registry();
        let before = containers.len();
        containers.retain(|c| !Arc::ptr_eq(c, container));
        containers.len() != before
    }

    fn take(&self, id_or_name: &str) -> Option<Arc<GridServerDockerContainer<E>>> {
        let mut containers = self.registry();
        let index = containers.iter().position(|c| c.is_identified_by(id_or_name))?;
        Some(containers.remove(index))
    }

    fn registry(&self) -> MutexGuard<'_, Vec<Arc<GridServerDockerContainer<E>>>> {
        self.containers.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn adopt_running(&self) -> DockerResult<Vec<InstanceInfo>> {
        let summaries = self
            .authority
            .list_grid_server_containers(&self.config.image_name)
            .await?;

        let mut adopted = Vec::new();
        for summary in summaries {
            if self.get_container(&summary.id).is_some() {
                continue;
            }
            let inspect = match self.authority.inspect_container(&summary.id).await {
                Ok(inspect) => inspect,
                Err(e) => {
                    warn!(container = summary.name(), error = %e, "cannot inspect running container");
                    continue;
                }
            };
            let Some(container) = GridServerDockerContainer::recovered(self.authority.clone(), inspect)
            else {
                warn!(container = summary.name(), "running container has no port label, skipping");
                continue;
            };

            match self.ports.claim(container.port()) {
                Ok(lease) => container.attach_lease(lease),
                Err(PortError::AlreadyAllocated(port)) => {
                    warn!(container = %container, port, "port of recovered container already leased");
                }
                Err(e) => return Err(e.into()),
            }

            let resources = container.resources();
            info!(
                container = %container,
                cores = self
                    .authority
                    .calculate_physical_cores(resources.cpu_period, resources.cpu_quota),
                memory_bytes = resources.memory_bytes,
                "recovered grid server container"
            );
            let container = Arc::new(container);
            adopted.push(container.info());
            self.registry().push(container);
        }
        Ok(adopted)
    }
}

impl<E: ContainerEngine> GridServerBackend for DockerFleet<E> {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn provision(&self, request: ProvisionRequest) -> FleetResult<InstanceInfo> {
        self.counters.increment_attempt();
        match self.provision_container(request).await {
            Ok(container) => {
                self.counters.increment_success();
                info!(container = %container, "grid server container available");
                Ok(container.info())
            }
            Err(e) => {
                self.counters.increment_failure();
                Err(e.into())
            }
        }
    }

    async fn terminate(&self, id: &InstanceId) -> FleetResult<bool> {
        let Some(id) = id.container_id() else {
            return Ok(false);
        };
        let Some(container) = self.take(id) else {
            return Ok(false);
        };
        Ok(container.dispose().await)
    }

    async fn terminate_all(&self) -> FleetResult<usize> {
        let drained: Vec<_> = std::mem::take(&mut *self.registry());
        let mut removed = 0;
        for container in &drained {
            if container.dispose().await {
                removed += 1;
            }
        }
        info!(total = drained.len(), removed, "terminated all grid server containers");
        Ok(removed)
    }

    async fn discover(&self) -> FleetResult<Vec<InstanceInfo>> {
        Ok(self.adopt_running().await?)
    }

    async fn update_resources(&self, job: &ResourceJob) -> FleetResult<bool> {
        if job.container_id.is_empty() {
            return Err(DockerError::InvalidArgument("resource job has no container id".into()).into());
        }

        let Some(response) = self.authority.update_container(job).await else {
            return Ok(false);
        };
        for warning in &response.warnings {
            warn!(container = %job.container_id, warning = %warning, "engine warning on update");
        }
        if let Some(container) = self.get_container(&job.container_id) {
            container.set_resources(self.authority.quota_for(job));
        }
        Ok(true)
    }

    async fn instances(&self) -> Vec<InstanceInfo> {
        self.containers().iter().map(|c| c.info()).collect()
    }
}
