//! One grid server container.

use std::collections::HashMap;
use std::fmt;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

use gridfleet_core::config::DockerConfig;
use gridfleet_core::quota::DEFAULT_SCHEDULER_CPU_PERIOD;
use gridfleet_core::{
    ContainerResourceQuota, InstanceId, InstanceInfo, Lifecycle, LifecycleState,
};
use gridfleet_health::{ProbeOutcome, ProbeSettings, wait_for_tcp};
use gridfleet_ports::PortLease;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::authority::GridServerDockerAuthority;
use crate::engine::ContainerEngine;
use crate::error::{DockerError, DockerResult};
use crate::models::{ContainerInspect, CreateContainerParameters, HostConfig, Mount, Ulimit};

pub const LABEL_PORT: &str = "port";
pub const LABEL_VERSION: &str = "grid_server_version";
pub const LABEL_IMAGE_NAME: &str = "image_name";

pub const CONTAINER_NAME_PREFIX: &str = "grid-server-";
pub const CONTAINER_NAME_SUFFIX: &str = "-gr";

const CONTAINER_LOGS_DIRECTORY: &str = "/opt/grid/logs";
const CONTAINER_INTERNAL_SCRIPTS_DIRECTORY: &str = "/opt/grid/internalscripts";
const X11_SOCKET_DIRECTORY: &str = "/tmp/.X11-unix";
const BYTES_PER_MEGABYTE: i64 = 1024 * 1024;

/// A grid server container, either created by this run or recovered
/// from the engine.
pub struct GridServerDockerContainer<E> {
    authority: Arc<GridServerDockerAuthority<E>>,
    name: String,
    image_name: String,
    version: String,
    endpoint: SocketAddr,
    parameters: CreateContainerParameters,
    /// Set once the engine has created the container.
    id: OnceLock<String>,
    resources: Mutex<ContainerResourceQuota>,
    lease: Mutex<Option<PortLease>>,
    lifecycle: Lifecycle,
    /// Guards the id hand-off between `start` and `dispose`.
    disposed: Mutex<bool>,
}

impl<E: ContainerEngine> GridServerDockerContainer<E> {
    /// Build the creation parameters for a new container on the leased
    /// port. Nothing is sent to the engine yet.
    ///
    /// Fails with `InvalidOperation` when no settings key is configured;
    /// the lease is released in that case.
    pub fn new(
        authority: Arc<GridServerDockerAuthority<E>>,
        config: &DockerConfig,
        lease: PortLease,
    ) -> DockerResult<Self> {
        let Some(settings_key) = config.settings_key.as_deref().filter(|k| !k.is_empty()) else {
            lease.release();
            return Err(DockerError::InvalidOperation(
                "docker.settings_key must be set to create grid server containers".into(),
            ));
        };

        let port = lease.port();
        let name = format!("{CONTAINER_NAME_PREFIX}{}{CONTAINER_NAME_SUFFIX}", Uuid::new_v4());
        let parameters = container_parameters(&authority, config, &name, port, settings_key);
        let resources = ContainerResourceQuota {
            cpu_period: parameters.host_config.cpu_period.unwrap_or_default(),
            cpu_quota: parameters.host_config.cpu_quota.unwrap_or_default(),
            memory_bytes: parameters.host_config.memory,
        };

        let container = Self {
            authority,
            name,
            image_name: config.image_name.clone(),
            version: config.image_tag.clone(),
            endpoint: SocketAddr::from((Ipv4Addr::LOCALHOST, port)),
            parameters,
            id: OnceLock::new(),
            resources: Mutex::new(resources),
            lease: Mutex::new(Some(lease)),
            lifecycle: Lifecycle::new(LifecycleState::Starting),
            disposed: Mutex::new(false),
        };
        Ok(container)
    }

    /// Rebuild a record from an inspected container left running by a
    /// previous run. Returns `None` when its labels carry no usable port.
    pub fn recovered(
        authority: Arc<GridServerDockerAuthority<E>>,
        inspect: ContainerInspect,
    ) -> Option<Self> {
        let labels = &inspect.config.labels;
        let port = labels.get(LABEL_PORT)?.parse::<u16>().ok()?;
        let version = labels.get(LABEL_VERSION).cloned().unwrap_or_default();
        let image_name = labels.get(LABEL_IMAGE_NAME).cloned().unwrap_or_default();
        let resources = authority.resources_of(&inspect);
        let state = if inspect.state.running {
            LifecycleState::Running
        } else {
            LifecycleState::Exited
        };

        let name = inspect.name.trim_start_matches('/').to_string();
        let id = OnceLock::new();
        let _ = id.set(inspect.id.clone());

        Some(Self {
            authority,
            parameters: CreateContainerParameters {
                name: name.clone(),
                image: inspect.config.image.clone(),
                env: Vec::new(),
                labels: inspect.config.labels.clone(),
                host_config: inspect.host_config,
            },
            name,
            image_name,
            version,
            endpoint: SocketAddr::from((Ipv4Addr::LOCALHOST, port)),
            id,
            resources: Mutex::new(resources),
            lease: Mutex::new(None),
            lifecycle: Lifecycle::new(state),
            disposed: Mutex::new(false),
        })
    }

    /// Make sure the image exists, create and start the container, then
    /// wait until the grid server accepts TCP connections.
    ///
    /// A record disposed midway fails with `Disposed`. Anything the engine
    /// created after the disposal is killed and removed here.
    pub async fn start(&self, probe: &ProbeSettings) -> DockerResult<()> {
        let authority = &self.authority;
        let image = self.image_reference();

        if !authority.check_image(&self.image_name, &self.version).await {
            info!(%image, "image missing, creating it");
            if !authority
                .create_image_with_retries(&self.image_name, &self.version)
                .await
            {
                return Err(DockerError::ImageUnavailable(image));
            }
        }
        self.ensure_live()?;

        let created = authority.create_container(&self.parameters).await;
        if created.is_empty() {
            return Err(DockerError::CreateFailed(self.name.clone()));
        }
        let Some(id) = self.record_id(created.clone()) else {
            self.discard(&created).await;
            return Err(DockerError::Disposed(self.name.clone()));
        };

        if !authority.start_container(id).await {
            return Err(DockerError::StartFailed(self.name.clone()));
        }
        self.ensure_live()?;
        info!(container = %self.name, id, port = self.port(), %image, "started grid server container");

        let outcome = wait_for_tcp(probe, self.port(), move || authority.has_container_exited(id)).await;
        match outcome {
            ProbeOutcome::Available { .. } => {
                self.lifecycle.settle(LifecycleState::Running);
                self.ensure_live()
            }
            ProbeOutcome::Exited { .. } => {
                self.lifecycle.settle(LifecycleState::Exited);
                Err(DockerError::Exited(self.name.clone()))
            }
            ProbeOutcome::Unavailable { attempts } => Err(DockerError::Unavailable {
                host: probe.host.clone(),
                port: self.port(),
                attempts,
            }),
        }
    }

    /// Kill, remove and release the port. Idempotent.
    ///
    /// Returns false when the engine still holds the container afterwards,
    /// or when the record was already disposed.
    pub async fn dispose(&self) -> bool {
        let id = {
            let mut disposed = self.disposed_guard();
            if *disposed {
                return false;
            }
            *disposed = true;
            self.id.get().cloned()
        };

        let mut removed = true;
        if let Some(id) = id {
            removed = self.discard(&id).await;
        }

        if let Some(lease) = self.lease_guard().take() {
            lease.release();
        }
        self.lifecycle.settle(LifecycleState::Removed);
        info!(container = %self.name, port = self.port(), removed, "disposed grid server container");
        removed
    }

    pub fn is_disposed(&self) -> bool {
        *self.disposed_guard()
    }

    fn ensure_live(&self) -> DockerResult<()> {
        if self.is_disposed() {
            return Err(DockerError::Disposed(self.name.clone()));
        }
        Ok(())
    }

    /// Store the engine id unless the record was disposed first. Exactly
    /// one of `record_id` and `dispose` sees the id.
    fn record_id(&self, id: String) -> Option<&str> {
        let disposed = self.disposed_guard();
        if *disposed {
            return None;
        }
        let id = self.id.get_or_init(|| id).as_str();
        drop(disposed);
        Some(id)
    }

    async fn discard(&self, id: &str) -> bool {
        if !self.authority.kill_container(id).await {
            debug!(container = %self.name, "kill before removal failed");
        }
        let removed = self.authority.remove_container_with_retries(id).await;
        if !removed {
            warn!(container = %self.name, id = %id, "container could not be removed");
        }
        removed
    }

    pub fn attach_lease(&self, lease: PortLease) {
        let previous = self.lease_guard().replace(lease);
        if let Some(previous) = previous {
            previous.release();
        }
    }

    /// Engine id, or `None` before creation.
    pub fn id(&self) -> Option<&str> {
        self.id.get().map(String::as_str)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn image_name(&self) -> &str {
        &self.image_name
    }

    /// `image_name:version`.
    pub fn image_reference(&self) -> String {
        format!("{}:{}", self.image_name, self.version)
    }

    pub fn port(&self) -> u16 {
        self.endpoint.port()
    }

    pub fn endpoint(&self) -> SocketAddr {
        self.endpoint
    }

    pub fn state(&self) -> LifecycleState {
        self.lifecycle.get()
    }

    pub fn parameters(&self) -> &CreateContainerParameters {
        &self.parameters
    }

    /// Limits last applied to this container.
    pub fn resources(&self) -> ContainerResourceQuota {
        *self.resources.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_resources(&self, quota: ContainerResourceQuota) {
        *self.resources.lock().unwrap_or_else(|e| e.into_inner()) = quota;
    }

    /// Matches the engine id or the container name.
    pub fn is_identified_by(&self, id_or_name: &str) -> bool {
        self.name == id_or_name || self.id() == Some(id_or_name)
    }

    pub fn info(&self) -> InstanceInfo {
        InstanceInfo {
            id: InstanceId::Container(self.id().unwrap_or(&self.name).to_string()),
            name: self.name.clone(),
            endpoint: self.endpoint,
            state: self.state(),
            version: Some(self.version.clone()),
        }
    }

    fn disposed_guard(&self) -> MutexGuard<'_, bool> {
        self.disposed.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lease_guard(&self) -> MutexGuard<'_, Option<PortLease>> {
        self.lease.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl<E> fmt::Display for GridServerDockerContainer<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{} ({}) @ {}]", self.name, self.version, self.endpoint)
    }
}

impl<E> fmt::Debug for GridServerDockerContainer<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GridServerDockerContainer")
            .field("name", &self.name)
            .field("id", &self.id.get())
            .field("version", &self.version)
            .field("endpoint", &self.endpoint)
            .field("state", &self.lifecycle.get())
            .finish()
    }
}

fn container_parameters<E: ContainerEngine>(
    authority: &GridServerDockerAuthority<E>,
    config: &DockerConfig,
    name: &str,
    port: u16,
    settings_key: &str,
) -> CreateContainerParameters {
    let mut env = vec![format!("PORT={port}"), format!("SETTINGS_KEY={settings_key}")];
    if let Some(display) = std::env::var("DISPLAY").ok().filter(|d| !d.is_empty()) {
        env.push(format!("DISPLAY={display}"));
    }
    if config.max_threads > 0 {
        env.push(format!("MAXIMUM_THREADS={}", config.max_threads));
    }
    if config.max_memory_bytes > 0 {
        env.push(format!("MAXIMUM_MEMORY={}", config.max_memory_bytes / BYTES_PER_MEGABYTE));
    }
    if let Some(key) = config.http_access_key.as_deref().filter(|k| !k.is_empty()) {
        env.push(format!("HTTP_ACCESS_KEY={key}"));
    }
    let mut extras: Vec<_> = config.environment.iter().collect();
    extras.sort();
    env.extend(extras.into_iter().map(|(k, v)| format!("{k}={v}")));

    let labels = HashMap::from([
        (LABEL_PORT.to_string(), port.to_string()),
        (LABEL_VERSION.to_string(), config.image_tag.clone()),
        (LABEL_IMAGE_NAME.to_string(), config.image_name.clone()),
    ]);

    let (logs, scripts) = match config.mount_path_override.as_deref() {
        Some(root) => (format!("{root}/logs"), format!("{root}/internalscripts")),
        None => (
            config.shared_logs_directory.clone(),
            config.shared_internal_scripts_directory.clone(),
        ),
    };

    let (cpu_period, cpu_quota) = match config.reserved_cores_per_instance {
        Some(cores) => (
            Some(DEFAULT_SCHEDULER_CPU_PERIOD),
            Some(authority.calculate_cpu_quota(cores, DEFAULT_SCHEDULER_CPU_PERIOD)),
        ),
        None => (None, None),
    };

    let dns = [&config.primary_dns_server, &config.secondary_dns_server]
        .into_iter()
        .flatten()
        .filter(|s| !s.is_empty())
        .cloned()
        .collect();

    CreateContainerParameters {
        name: name.to_string(),
        image: format!("{}:{}", config.image_name, config.image_tag),
        env,
        labels,
        host_config: HostConfig {
            mounts: vec![
                Mount::bind(logs, CONTAINER_LOGS_DIRECTORY, false),
                Mount::bind(scripts, CONTAINER_INTERNAL_SCRIPTS_DIRECTORY, false),
                Mount::bind(X11_SOCKET_DIRECTORY, X11_SOCKET_DIRECTORY, true),
            ],
            memory: config.max_memory_bytes,
            ulimits: vec![
                Ulimit {
                    name: "core".into(),
                    soft: 9_999_999_999,
                    hard: 9_999_999_999,
                },
                Ulimit {
                    name: "nofile".into(),
                    soft: 4096,
                    hard: 8192,
                },
            ],
            network_mode: "host".into(),
            cpu_period,
            cpu_quota,
            dns,
        },
    }
}
