//! In-memory container engine shared by the integration tests.
#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::net::TcpListener;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use gridfleet_core::config::DockerConfig;
use gridfleet_core::{ContainerResourceQuota, StaticHostInfo};
use gridfleet_docker::models::{
    ContainerConfig, ContainerFilters, ContainerInspect, ContainerState, ContainerSummary,
    CreateContainerParameters, HostConfig, UpdateContainerResponse, VersionInfo,
};
use gridfleet_docker::{ContainerEngine, EngineError, EngineResult, GridServerDockerAuthority};
use gridfleet_health::ProbeSettings;
use gridfleet_metrics::MetricsRegistry;
use rand::SeedableRng;
use rand::rngs::StdRng;

pub struct FakeContainer {
    pub id: String,
    pub name: String,
    pub image: String,
    pub labels: HashMap<String, String>,
    pub host_config: HostConfig,
    pub env: Vec<String>,
    pub running: bool,
    listener: Option<TcpListener>,
}

#[derive(Default)]
pub struct FakeState {
    pub images: HashSet<String>,
    pub containers: Vec<FakeContainer>,
    /// Commits that fail before one succeeds.
    pub commit_failures: usize,
    pub fail_create: bool,
    pub fail_start: bool,
    pub fail_remove: bool,
    pub fail_kill: bool,
    pub fail_update: bool,
    /// Started containers stop immediately.
    pub exit_on_start: bool,
    /// Started containers listen on their `PORT`.
    pub listen_on_start: bool,
    pub updates: Vec<(String, ContainerResourceQuota)>,
    pub calls: Vec<String>,
    next_id: usize,
}

#[derive(Default)]
pub struct FakeEngine {
    state: Mutex<FakeState>,
}

fn api(status: u16, message: &str) -> EngineError {
    EngineError::Api {
        status,
        message: message.to_string(),
    }
}

impl FakeEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    pub fn calls(&self, op: &str) -> usize {
        self.state().calls.iter().filter(|c| c.as_str() == op).count()
    }

    pub fn add_image(&self, reference: &str) {
        self.state().images.insert(reference.to_string());
    }

    /// A container left running by an earlier run.
    pub fn add_running(&self, id: &str, name: &str, labels: &[(&str, &str)], host_config: HostConfig) {
        self.state().containers.push(FakeContainer {
            id: id.to_string(),
            name: name.to_string(),
            image: "grid-server:1.0".to_string(),
            labels: labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            host_config,
            env: Vec::new(),
            running: true,
            listener: None,
        });
    }

    pub fn container_count(&self) -> usize {
        self.state().containers.len()
    }

    fn record(&self, op: &str) -> MutexGuard<'_, FakeState> {
        let mut state = self.state();
        state.calls.push(op.to_string());
        state
    }
}

impl FakeState {
    fn find(&mut self, id: &str) -> EngineResult<&mut FakeContainer> {
        self.containers
            .iter_mut()
            .find(|c| c.id == id || c.name == id)
            .ok_or_else(|| api(404, &format!("No such container: {id}")))
    }
}

impl ContainerEngine for FakeEngine {
    async fn inspect_container(&self, id: &str) -> EngineResult<ContainerInspect> {
        let mut state = self.record("inspect");
        let c = state.find(id)?;
        Ok(ContainerInspect {
            id: c.id.clone(),
            name: format!("/{}", c.name),
            state: ContainerState {
                status: if c.running { "running" } else { "exited" }.to_string(),
                running: c.running,
            },
            config: ContainerConfig {
                image: c.image.clone(),
                labels: c.labels.clone(),
            },
            host_config: c.host_config.clone(),
        })
    }

    async fn image_exists(&self, image: &str, tag: &str) -> EngineResult<bool> {
        let state = self.record("image_exists");
        Ok(state.images.contains(&format!("{image}:{tag}")))
    }

    async fn commit_container(&self, _container: &str, repository: &str, tag: &str) -> EngineResult<()> {
        let mut state = self.record("commit");
        if state.commit_failures > 0 {
            state.commit_failures -= 1;
            return Err(api(500, "commit failed"));
        }
        state.images.insert(format!("{repository}:{tag}"));
        Ok(())
    }

    async fn create_container(&self, parameters: &CreateContainerParameters) -> EngineResult<String> {
        let mut state = self.record("create");
        if state.fail_create {
            return Err(api(500, "create failed"));
        }
        state.next_id += 1;
        let id = format!("c{:04}", state.next_id);
        state.containers.push(FakeContainer {
            id: id.clone(),
            name: parameters.name.clone(),
            image: parameters.image.clone(),
            labels: parameters.labels.clone(),
            host_config: parameters.host_config.clone(),
            env: parameters.env.clone(),
            running: false,
            listener: None,
        });
        Ok(id)
    }

    async fn start_container(&self, id: &str) -> EngineResult<()> {
        let mut state = self.record("start");
        if state.fail_start {
            return Err(api(500, "start failed"));
        }
        let (exit, listen) = (state.exit_on_start, state.listen_on_start);
        let c = state.find(id)?;
        c.running = !exit;
        if listen && !exit {
            let port = c.labels.get("port").cloned().unwrap_or_default();
            let listener = TcpListener::bind(format!("127.0.0.1:{port}"))
                .map_err(|e| api(500, &e.to_string()))?;
            c.listener = Some(listener);
        }
        Ok(())
    }

    async fn remove_container(&self, id: &str, _remove_volumes: bool) -> EngineResult<()> {
        let mut state = self.record("remove");
        if state.fail_remove {
            return Err(api(409, "container is running"));
        }
        state.find(id)?;
        state.containers.retain(|c| c.id != id && c.name != id);
        Ok(())
    }

    async fn kill_container(&self, id: &str) -> EngineResult<()> {
        let mut state = self.record("kill");
        if state.fail_kill {
            return Err(api(500, "kill failed"));
        }
        let c = state.find(id)?;
        c.running = false;
        c.listener = None;
        Ok(())
    }

    async fn update_container(
        &self,
        id: &str,
        quota: &ContainerResourceQuota,
    ) -> EngineResult<UpdateContainerResponse> {
        let mut state = self.record("update");
        if state.fail_update {
            return Err(api(500, "update failed"));
        }
        state.find(id)?;
        state.updates.push((id.to_string(), *quota));
        Ok(UpdateContainerResponse::default())
    }

    async fn list_containers(&self, filters: &ContainerFilters) -> EngineResult<Vec<ContainerSummary>> {
        let state = self.record("list");
        let labels = filters.values("label");
        Ok(state
            .containers
            .iter()
            .filter(|c| c.running)
            .filter(|c| {
                labels.iter().all(|l| match l.split_once('=') {
                    Some((k, v)) => c.labels.get(k).map(String::as_str) == Some(v),
                    None => c.labels.contains_key(l.as_str()),
                })
            })
            .map(|c| ContainerSummary {
                id: c.id.clone(),
                names: vec![format!("/{}", c.name)],
                image: c.image.clone(),
                labels: c.labels.clone(),
                state: "running".to_string(),
            })
            .collect())
    }

    async fn version(&self) -> EngineResult<VersionInfo> {
        Ok(VersionInfo {
            version: "fake".to_string(),
            api_version: "1.43".to_string(),
        })
    }
}

pub fn docker_config() -> DockerConfig {
    DockerConfig {
        image_name: "grid-server".to_string(),
        image_tag: "1.0".to_string(),
        settings_key: Some("settings".to_string()),
        container_stop_sleep_interval: Some("1ms".to_string()),
        max_attempts_to_wait_for_container_exit: 5,
        ..DockerConfig::default()
    }
}

pub fn authority(
    engine: Arc<FakeEngine>,
    config: &DockerConfig,
    metrics: &MetricsRegistry,
) -> Arc<GridServerDockerAuthority<FakeEngine>> {
    Arc::new(
        GridServerDockerAuthority::new(
            engine,
            config,
            &StaticHostInfo {
                physical: 4,
                logical: 8,
            },
            metrics,
            StdRng::seed_from_u64(3),
        )
        .unwrap(),
    )
}

pub fn probe() -> ProbeSettings {
    ProbeSettings {
        attempts: 10,
        timeout: Duration::from_millis(50),
        ..ProbeSettings::default()
    }
}

/// A port nothing listens on right now.
pub fn free_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}
