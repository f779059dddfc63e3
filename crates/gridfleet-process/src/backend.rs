//! [`GridServerBackend`] over the native deployer.

use std::sync::Arc;

use gridfleet_core::{
    FleetError, FleetResult, GridServerBackend, InstanceId, InstanceInfo, ProvisionRequest,
    ResourceJob,
};
use gridfleet_health::{ProbeOutcome, ProbeSettings, wait_for_tcp};
use tokio::task;
use tracing::{info, warn};

use crate::deployer::GridServerDeployer;

pub struct NativeBackend {
    deployer: Arc<GridServerDeployer>,
    probe: ProbeSettings,
}

impl NativeBackend {
    pub fn new(deployer: Arc<GridServerDeployer>, probe: ProbeSettings) -> Self {
        Self { deployer, probe }
    }

    pub fn deployer(&self) -> &Arc<GridServerDeployer> {
        &self.deployer
    }

    async fn blocking<T, F>(&self, f: F) -> FleetResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&GridServerDeployer) -> FleetResult<T> + Send + 'static,
    {
        let deployer = self.deployer.clone();
        task::spawn_blocking(move || f(&deployer))
            .await
            .map_err(|e| FleetError::Io(std::io::Error::other(e)))?
    }
}

impl GridServerBackend for NativeBackend {
    fn name(&self) -> &'static str {
        "native"
    }

    async fn provision(&self, request: ProvisionRequest) -> FleetResult<InstanceInfo> {
        let process = self
            .blocking(move |d| d.create_process(request.port))
            .await?;
        let port = process.port();

        let watched = process.clone();
        let outcome = wait_for_tcp(&self.probe, port, move || {
            std::future::ready(watched.has_exited())
        })
        .await;

        match outcome {
            ProbeOutcome::Available { attempts } => {
                process.mark_running()?;
                info!(process = %process, attempts, "grid server available");
                Ok(process.info())
            }
            ProbeOutcome::Exited { .. } => {
                let stale = process.clone();
                if let Err(e) = self.blocking(move |d| d.kill_process_instance(&stale)).await {
                    warn!(process = %process, error = %e, "cleanup of exited grid server failed");
                }
                Err(FleetError::InstanceExited(process.to_string()))
            }
            ProbeOutcome::Unavailable { attempts } => {
                let stale = process.clone();
                if let Err(e) = self.blocking(move |d| d.kill_process_instance(&stale)).await {
                    warn!(process = %process, error = %e, "cleanup of unavailable grid server failed");
                }
                Err(FleetError::Unavailable {
                    host: self.probe.host.clone(),
                    port,
                    attempts,
                })
            }
        }
    }

    async fn terminate(&self, id: &InstanceId) -> FleetResult<bool> {
        let Some(pid) = id.pid() else {
            return Ok(false);
        };
        self.blocking(move |d| d.kill_process_by_pid(pid)).await
    }

    async fn terminate_all(&self) -> FleetResult<usize> {
        let outcome = self.blocking(|d| Ok(d.kill_all())).await?;
        Ok(outcome.killed.len())
    }

    async fn discover(&self) -> FleetResult<Vec<InstanceInfo>> {
        let adopted = self.blocking(|d| d.discover_instances()).await?;
        Ok(adopted.iter().map(|p| p.info()).collect())
    }

    async fn update_resources(&self, job: &ResourceJob) -> FleetResult<bool> {
        Err(FleetError::Unsupported(format!(
            "resource limits for {} require the container backend",
            job.container_id
        )))
    }

    async fn instances(&self) -> Vec<InstanceInfo> {
        self.deployer.processes().iter().map(|p| p.info()).collect()
    }
}
