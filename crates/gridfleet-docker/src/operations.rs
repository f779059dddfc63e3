//! Instrumented container-engine operations.
//!
//! Each operation is a small struct implementing [`DockerOperation`].
//! [`run_operation`] is the only way they are invoked: it times the call,
//! logs the outcome at the operation's level, bumps the operation's
//! counters and turns errors into the operation's default output.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use gridfleet_core::ContainerResourceQuota;
use gridfleet_metrics::{MetricsRegistry, OperationCounters};
use tracing::{Level, debug, error, info, trace, warn};

use crate::engine::ContainerEngine;
use crate::error::{EngineError, EngineResult};
use crate::models::{CreateContainerParameters, UpdateContainerResponse};

pub trait DockerOperation: Send + Sync {
    type Input: fmt::Debug + Sync;
    type Output: fmt::Debug + Default + Send;

    /// Counter category and log name.
    const NAME: &'static str;
    /// Level of the success record.
    const LOG_LEVEL: Level = Level::DEBUG;

    fn execute(&self, input: &Self::Input) -> impl Future<Output = EngineResult<Self::Output>> + Send;
}

macro_rules! log_at {
    ($level:expr, $($arg:tt)+) => {
        if $level == Level::ERROR {
            error!($($arg)+)
        } else if $level == Level::WARN {
            warn!($($arg)+)
        } else if $level == Level::INFO {
            info!($($arg)+)
        } else if $level == Level::DEBUG {
            debug!($($arg)+)
        } else {
            trace!($($arg)+)
        }
    };
}

/// Run `op`, recording attempt/success/failure on `counters`.
pub async fn run_operation<O: DockerOperation>(
    op: &O,
    counters: &OperationCounters,
    input: &O::Input,
) -> O::Output {
    counters.increment_attempt();
    let started = Instant::now();

    match op.execute(input).await {
        Ok(output) => {
            counters.increment_success();
            log_at!(
                O::LOG_LEVEL,
                operation = O::NAME,
                ?input,
                ?output,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "{} succeeded",
                O::NAME
            );
            output
        }
        Err(e) => {
            counters.increment_failure();
            error!(
                operation = O::NAME,
                ?input,
                error = %e,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "{} failed",
                O::NAME
            );
            O::Output::default()
        }
    }
}

/// An operation bound to its counters.
pub struct Instrumented<O> {
    op: O,
    counters: Arc<OperationCounters>,
}

impl<O: DockerOperation> Instrumented<O> {
    pub fn new(op: O, metrics: &MetricsRegistry) -> Self {
        Self {
            op,
            counters: metrics.counters(O::NAME),
        }
    }

    pub async fn run(&self, input: &O::Input) -> O::Output {
        run_operation(&self.op, &self.counters, input).await
    }
}

// ── Operations ────────────────────────────────────────────────────

/// True once the engine reports the container as not running, or no
/// longer knows it.
pub struct HasExitedOperation<E> {
    engine: Arc<E>,
}

impl<E> HasExitedOperation<E> {
    pub fn new(engine: Arc<E>) -> Self {
        Self { engine }
    }
}

impl<E: ContainerEngine> DockerOperation for HasExitedOperation<E> {
    type Input = String;
    type Output = bool;
    const NAME: &'static str = "HasExited";
    const LOG_LEVEL: Level = Level::TRACE;

    async fn execute(&self, container: &String) -> EngineResult<bool> {
        match self.engine.inspect_container(container).await {
            Ok(inspect) => Ok(!inspect.state.running && inspect.state.status != "running"),
            Err(e) if e.is_not_found() => Ok(true),
            Err(e) => Err(e),
        }
    }
}

pub struct CheckImageOperation<E> {
    engine: Arc<E>,
}

impl<E> CheckImageOperation<E> {
    pub fn new(engine: Arc<E>) -> Self {
        Self { engine }
    }
}

impl<E: ContainerEngine> DockerOperation for CheckImageOperation<E> {
    /// (image name, version)
    type Input = (String, String);
    type Output = bool;
    const NAME: &'static str = "CheckImage";

    async fn execute(&self, (name, version): &(String, String)) -> EngineResult<bool> {
        self.engine.image_exists(name, version).await
    }
}

/// Commits the reference container `name` as image `name:version`,
/// giving up on a single commit after `timeout`.
pub struct CreateImageOperation<E> {
    engine: Arc<E>,
    timeout: Duration,
}

impl<E> CreateImageOperation<E> {
    pub fn new(engine: Arc<E>, timeout: Duration) -> Self {
        Self { engine, timeout }
    }
}

impl<E: ContainerEngine> DockerOperation for CreateImageOperation<E> {
    type Input = (String, String);
    type Output = bool;
    const NAME: &'static str = "CreateImage";
    const LOG_LEVEL: Level = Level::INFO;

    async fn execute(&self, (name, version): &(String, String)) -> EngineResult<bool> {
        tokio::time::timeout(self.timeout, self.engine.commit_container(name, name, version))
            .await
            .map_err(|_| EngineError::Timeout(self.timeout))??;
        Ok(true)
    }
}

pub struct CreateContainerOperation<E> {
    engine: Arc<E>,
}

impl<E> CreateContainerOperation<E> {
    pub fn new(engine: Arc<E>) -> Self {
        Self { engine }
    }
}

impl<E: ContainerEngine> DockerOperation for CreateContainerOperation<E> {
    type Input = CreateContainerParameters;
    /// Container id; empty on failure.
    type Output = String;
    const NAME: &'static str = "CreateContainer";
    const LOG_LEVEL: Level = Level::INFO;

    async fn execute(&self, parameters: &CreateContainerParameters) -> EngineResult<String> {
        self.engine.create_container(parameters).await
    }
}

pub struct StartContainerOperation<E> {
    engine: Arc<E>,
}

impl<E> StartContainerOperation<E> {
    pub fn new(engine: Arc<E>) -> Self {
        Self { engine }
    }
}

impl<E: ContainerEngine> DockerOperation for StartContainerOperation<E> {
    type Input = String;
    type Output = bool;
    const NAME: &'static str = "StartContainer";
    const LOG_LEVEL: Level = Level::INFO;

    async fn execute(&self, container: &String) -> EngineResult<bool> {
        self.engine.start_container(container).await?;
        Ok(true)
    }
}

pub struct RemoveContainerOperation<E> {
    engine: Arc<E>,
    remove_volumes: bool,
}

impl<E> RemoveContainerOperation<E> {
    pub fn new(engine: Arc<E>, remove_volumes: bool) -> Self {
        Self {
            engine,
            remove_volumes,
        }
    }
}

impl<E: ContainerEngine> DockerOperation for RemoveContainerOperation<E> {
    type Input = String;
    type Output = bool;
    const NAME: &'static str = "RemoveContainer";
    const LOG_LEVEL: Level = Level::INFO;

    async fn execute(&self, container: &String) -> EngineResult<bool> {
        self.engine
            .remove_container(container, self.remove_volumes)
            .await?;
        Ok(true)
    }
}

pub struct KillContainerOperation<E> {
    engine: Arc<E>,
}

impl<E> KillContainerOperation<E> {
    pub fn new(engine: Arc<E>) -> Self {
        Self { engine }
    }
}

impl<E: ContainerEngine> DockerOperation for KillContainerOperation<E> {
    type Input = String;
    type Output = bool;
    const NAME: &'static str = "KillContainer";
    const LOG_LEVEL: Level = Level::INFO;

    async fn execute(&self, container: &String) -> EngineResult<bool> {
        self.engine.kill_container(container).await?;
        Ok(true)
    }
}

/// Input of [`UpdateContainerOperation`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerUpdate {
    pub container_id: String,
    pub quota: ContainerResourceQuota,
}

pub struct UpdateContainerOperation<E> {
    engine: Arc<E>,
}

impl<E> UpdateContainerOperation<E> {
    pub fn new(engine: Arc<E>) -> Self {
        Self { engine }
    }
}

impl<E: ContainerEngine> DockerOperation for UpdateContainerOperation<E> {
    type Input = ContainerUpdate;
    /// `None` when the update failed.
    type Output = Option<UpdateContainerResponse>;
    const NAME: &'static str = "UpdateContainer";
    const LOG_LEVEL: Level = Level::INFO;

    async fn execute(&self, update: &ContainerUpdate) -> EngineResult<Self::Output> {
        let resp = self
            .engine
            .update_container(&update.container_id, &update.quota)
            .await?;
        Ok(Some(resp))
    }
}
