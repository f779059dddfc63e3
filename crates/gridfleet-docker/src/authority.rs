//! The single entry point for container-engine work.
//!
//! Composes the eight instrumented operations with the retry policies
//! around them and converts resource jobs into CFS quotas.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use gridfleet_core::config::DockerConfig;
use gridfleet_core::quota::DEFAULT_SCHEDULER_CPU_PERIOD;
use gridfleet_core::{
    BackoffPolicy, ContainerResourceQuota, HostServerInfo, Jitter, QuotaCalculator, ResourceJob,
};
use gridfleet_metrics::MetricsRegistry;
use rand::rngs::StdRng;
use tracing::{error, info, warn};

use crate::engine::ContainerEngine;
use crate::error::{DockerResult, EngineResult};
use crate::models::{
    ContainerFilters, ContainerInspect, ContainerSummary, CreateContainerParameters,
    UpdateContainerResponse,
};
use crate::operations::{
    CheckImageOperation, ContainerUpdate, CreateContainerOperation, CreateImageOperation,
    HasExitedOperation, Instrumented, KillContainerOperation, RemoveContainerOperation,
    StartContainerOperation, UpdateContainerOperation,
};

/// Attempts of `create_image_with_retries`.
pub const CREATE_IMAGE_MAX_ATTEMPTS: u32 = 10;
const CREATE_IMAGE_RETRY_BASE: Duration = Duration::from_millis(300);
const CREATE_IMAGE_RETRY_MAX: Duration = Duration::from_secs(15);

pub struct GridServerDockerAuthority<E> {
    engine: Arc<E>,
    has_exited: Instrumented<HasExitedOperation<E>>,
    check_image: Instrumented<CheckImageOperation<E>>,
    create_image: Instrumented<CreateImageOperation<E>>,
    create_container: Instrumented<CreateContainerOperation<E>>,
    start_container: Instrumented<StartContainerOperation<E>>,
    remove_container: Instrumented<RemoveContainerOperation<E>>,
    kill_container: Instrumented<KillContainerOperation<E>>,
    update_container: Instrumented<UpdateContainerOperation<E>>,
    calculator: QuotaCalculator,
    image_backoff: BackoffPolicy,
    stop_sleep_interval: Duration,
    max_attempts_to_wait_for_container_exit: u32,
    rng: Mutex<StdRng>,
}

impl<E: ContainerEngine> GridServerDockerAuthority<E> {
    /// The physical-to-logical ratio is read from `host` once, here.
    pub fn new(
        engine: Arc<E>,
        config: &DockerConfig,
        host: &dyn HostServerInfo,
        metrics: &MetricsRegistry,
        rng: StdRng,
    ) -> DockerResult<Self> {
        let calculator =
            QuotaCalculator::from_core_counts(host.physical_core_count(), host.logical_core_count());
        info!(
            physical = ?host.physical_core_count(),
            logical = ?host.logical_core_count(),
            ratio = calculator.physical_to_logical_ratio(),
            "container authority initialised"
        );

        Ok(Self {
            has_exited: Instrumented::new(HasExitedOperation::new(engine.clone()), metrics),
            check_image: Instrumented::new(CheckImageOperation::new(engine.clone()), metrics),
            create_image: Instrumented::new(
                CreateImageOperation::new(engine.clone(), config.max_time_to_wait_for_image()?),
                metrics,
            ),
            create_container: Instrumented::new(
                CreateContainerOperation::new(engine.clone()),
                metrics,
            ),
            start_container: Instrumented::new(
                StartContainerOperation::new(engine.clone()),
                metrics,
            ),
            remove_container: Instrumented::new(
                RemoveContainerOperation::new(engine.clone(), config.remove_volumes),
                metrics,
            ),
            kill_container: Instrumented::new(KillContainerOperation::new(engine.clone()), metrics),
            update_container: Instrumented::new(
                UpdateContainerOperation::new(engine.clone()),
                metrics,
            ),
            engine,
            calculator,
            image_backoff: BackoffPolicy::new(
                CREATE_IMAGE_RETRY_BASE,
                CREATE_IMAGE_RETRY_MAX,
                CREATE_IMAGE_MAX_ATTEMPTS,
                Jitter::Equal,
            ),
            stop_sleep_interval: config.container_stop_sleep_interval()?,
            max_attempts_to_wait_for_container_exit: config
                .max_attempts_to_wait_for_container_exit
                .max(1),
            rng: Mutex::new(rng),
        })
    }

    pub fn engine(&self) -> &Arc<E> {
        &self.engine
    }

    pub async fn has_container_exited(&self, container: &str) -> bool {
        self.has_exited.run(&container.to_string()).await
    }

    pub async fn check_image(&self, name: &str, version: &str) -> bool {
        self.check_image
            .run(&(name.to_string(), version.to_string()))
            .await
    }

    pub async fn create_image(&self, name: &str, version: &str) -> bool {
        self.create_image
            .run(&(name.to_string(), version.to_string()))
            .await
    }

    /// Retry [`create_image`](Self::create_image) with equal-jitter
    /// backoff. False only once every attempt has failed.
    pub async fn create_image_with_retries(&self, name: &str, version: &str) -> bool {
        for attempt in 1..=self.image_backoff.max_attempts {
            if self.create_image(name, version).await {
                return true;
            }
            if attempt == self.image_backoff.max_attempts {
                break;
            }

            let sleep = {
                let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
                self.image_backoff.delay(attempt, &mut *rng)
            };
            warn!(
                name,
                version,
                attempt,
                sleep_secs = sleep.as_secs_f64(),
                "failed to create image, retrying"
            );
            tokio::time::sleep(sleep).await;
        }
        error!(name, version, attempts = self.image_backoff.max_attempts, "failed to create image");
        false
    }

    /// Container id, empty on failure.
    pub async fn create_container(&self, parameters: &CreateContainerParameters) -> String {
        self.create_container.run(parameters).await
    }

    pub async fn start_container(&self, container: &str) -> bool {
        self.start_container.run(&container.to_string()).await
    }

    pub async fn remove_container(&self, container: &str) -> bool {
        self.remove_container.run(&container.to_string()).await
    }

    pub async fn kill_container(&self, container: &str) -> bool {
        self.kill_container.run(&container.to_string()).await
    }

    /// Remove `container`, retrying at a fixed interval. When the last
    /// attempt fails the container is killed once and removed one final
    /// time; if the kill fails too, removal is abandoned.
    pub async fn remove_container_with_retries(&self, container: &str) -> bool {
        let attempts = self.max_attempts_to_wait_for_container_exit;
        for attempt in 1..=attempts {
            if self.remove_container(container).await {
                return true;
            }
            warn!(
                container,
                attempt,
                sleep_ms = self.stop_sleep_interval.as_millis() as u64,
                "remove container failed"
            );

            if attempt == attempts {
                if !self.kill_container(container).await {
                    error!(container, "kill after failed removes also failed, giving up");
                    return false;
                }
                return self.remove_container(container).await;
            }
            tokio::time::sleep(self.stop_sleep_interval).await;
        }
        false
    }

    /// Apply `job` to its container live. `None` when the engine refused.
    pub async fn update_container(&self, job: &ResourceJob) -> Option<UpdateContainerResponse> {
        let update = ContainerUpdate {
            container_id: job.container_id.clone(),
            quota: self.quota_for(job),
        };
        info!(
            container = %update.container_id,
            cpu_period = update.quota.cpu_period,
            cpu_quota = update.quota.cpu_quota,
            memory_bytes = update.quota.memory_bytes,
            "updating container resources"
        );
        self.update_container.run(&update).await
    }

    /// Period, quota and memory limit `job` translates to on this host.
    pub fn quota_for(&self, job: &ResourceJob) -> ContainerResourceQuota {
        self.calculator.quota_for(job)
    }

    pub fn calculate_cpu_quota(&self, physical_cores: f64, cpu_period: i64) -> i64 {
        self.calculator.calculate_cpu_quota(physical_cores, cpu_period)
    }

    /// [`calculate_cpu_quota`](Self::calculate_cpu_quota) with the default
    /// scheduler period.
    pub fn cpu_quota_for_cores(&self, physical_cores: f64) -> i64 {
        self.calculate_cpu_quota(physical_cores, DEFAULT_SCHEDULER_CPU_PERIOD)
    }

    pub fn calculate_physical_cores(&self, cpu_period: i64, cpu_quota: i64) -> f64 {
        self.calculator.calculate_physical_cores(cpu_period, cpu_quota)
    }

    pub fn physical_to_logical_ratio(&self) -> i64 {
        self.calculator.physical_to_logical_ratio()
    }

    /// Running grid server containers created from `image_name`.
    pub async fn list_grid_server_containers(
        &self,
        image_name: &str,
    ) -> EngineResult<Vec<ContainerSummary>> {
        let filters = ContainerFilters::new()
            .with("name", "grid-server-.*-gr")
            .with("status", "running")
            .with("label", format!("image_name={image_name}"));
        self.engine.list_containers(&filters).await
    }

    pub async fn inspect_container(&self, container: &str) -> EngineResult<ContainerInspect> {
        self.engine.inspect_container(container).await
    }

    /// Resource limits currently applied to an inspected container.
    pub fn resources_of(&self, inspect: &ContainerInspect) -> ContainerResourceQuota {
        ContainerResourceQuota {
            cpu_period: inspect.host_config.cpu_period.unwrap_or_default(),
            cpu_quota: inspect.host_config.cpu_quota.unwrap_or_default(),
            memory_bytes: inspect.host_config.memory,
        }
    }
}
