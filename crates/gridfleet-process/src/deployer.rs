//! Registry of native grid server processes.
//!
//! Every read-modify-write of the registry happens under one mutex, so
//! concurrent kills and launches never observe a half-updated list.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use gridfleet_core::config::NativeConfig;
use gridfleet_core::{FleetError, FleetResult};
use gridfleet_metrics::{MetricsRegistry, OperationCounters};
use gridfleet_ports::PortAllocator;
use rand::Rng;
use rand::rngs::StdRng;
use tracing::{error, info, warn};

use crate::process::GridServerProcess;
use crate::registry;
use crate::table::ProcessTable;

const COUNTER_CATEGORY: &str = "GridServerDeployer";

/// Result of [`GridServerDeployer::kill_all`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KillAllOutcome {
    pub killed: Vec<u32>,
    /// Pids whose kill failed. They are dropped from the registry anyway.
    pub failed: Vec<u32>,
}

pub struct GridServerDeployer {
    executable_name: String,
    executable_path: PathBuf,
    process_name: String,
    arguments: Option<String>,
    table: Arc<dyn ProcessTable>,
    ports: Arc<PortAllocator>,
    counters: Arc<OperationCounters>,
    rng: Mutex<StdRng>,
    processes: Mutex<Vec<Arc<GridServerProcess>>>,
}

impl GridServerDeployer {
    /// Build a deployer. With `discover_now`, processes left running by a
    /// previous run are adopted immediately.
    pub fn new(
        config: &NativeConfig,
        table: Arc<dyn ProcessTable>,
        ports: Arc<PortAllocator>,
        metrics: &MetricsRegistry,
        rng: StdRng,
        discover_now: bool,
    ) -> FleetResult<Self> {
        if config.executable_name.trim().is_empty() {
            return Err(FleetError::InvalidArgument(
                "executable name must not be empty".to_string(),
            ));
        }
        let executable_path = config
            .executable_path
            .clone()
            .or_else(|| registry::install_path(config))
            .or_else(|| config.resolve_executable_path())
            .filter(|p| !p.as_os_str().is_empty())
            .ok_or_else(|| {
                FleetError::InvalidArgument(format!(
                    "executable path is not configured, not in the registry and {} is unset",
                    gridfleet_core::config::GRID_SERVER_PATH_ENV
                ))
            })?;

        let deployer = Self {
            executable_name: config.executable_name.clone(),
            executable_path,
            process_name: config.process_name(),
            arguments: config.arguments.clone(),
            table,
            ports,
            counters: metrics.counters(COUNTER_CATEGORY),
            rng: Mutex::new(rng),
            processes: Mutex::new(Vec::new()),
        };

        if discover_now {
            match deployer.discover_instances() {
                Ok(adopted) => info!(count = adopted.len(), "adopted running grid servers"),
                Err(e) => warn!(error = %e, "startup discovery failed, starting with an empty registry"),
            }
        }
        Ok(deployer)
    }

    pub fn executable_name(&self) -> &str {
        &self.executable_name
    }

    pub fn executable_path(&self) -> &Path {
        &self.executable_path
    }

    pub fn ports(&self) -> &Arc<PortAllocator> {
        &self.ports
    }

    fn registry(&self) -> MutexGuard<'_, Vec<Arc<GridServerProcess>>> {
        self.processes.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Launch a grid server, on `port` if given, otherwise on an allocated
    /// port.
    pub fn create_process(&self, port: Option<u16>) -> FleetResult<Arc<GridServerProcess>> {
        self.counters.increment_attempt();
        let started = Instant::now();

        match self.launch(port) {
            Ok(process) => {
                self.counters.increment_success();
                info!(
                    process = %process,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "created grid server process"
                );
                Ok(process)
            }
            Err(e) => {
                self.counters.increment_failure();
                error!(?port, error = %e, "failed to create grid server process");
                Err(e)
            }
        }
    }

    fn launch(&self, port: Option<u16>) -> FleetResult<Arc<GridServerProcess>> {
        let executable = self.executable_path.join(&self.executable_name);
        if !executable.is_file() {
            return Err(FleetError::ExecutableNotFound(executable));
        }

        let lease = match port {
            Some(port) => self.ports.claim(port)?,
            None => self.ports.find_next_available_port()?,
        };

        let process = GridServerProcess::start(
            &executable,
            &self.executable_path,
            lease,
            self.arguments.as_deref(),
            self.table.as_ref(),
        )?;

        let mut processes = self.registry();
        if let Some(existing) = processes.iter().find(|p| p.pid() == process.pid()) {
            // Adopted a process that is already tracked.
            process.dispose();
            return Ok(existing.clone());
        }
        processes.push(process.clone());
        Ok(process)
    }

    /// Kill and dispose every tracked process. The registry is empty
    /// afterwards, whether or not each kill succeeded.
    pub fn kill_all(&self) -> KillAllOutcome {
        let mut processes = self.registry();
        let mut outcome = KillAllOutcome::default();

        for process in processes.drain(..) {
            self.counters.increment_attempt();
            match process.kill() {
                Ok(()) => {
                    self.counters.increment_success();
                    outcome.killed.push(process.pid());
                }
                Err(e) => {
                    self.counters.increment_failure();
                    error!(process = %process, error = %e, "failed to kill grid server");
                    outcome.failed.push(process.pid());
                }
            }
            process.dispose();
        }

        info!(
            killed = outcome.killed.len(),
            failed = outcome.failed.len(),
            "killed all grid servers"
        );
        outcome
    }

    pub fn get_process(&self, port: u16) -> Option<Arc<GridServerProcess>> {
        self.registry().iter().find(|p| p.port() == port).cloned()
    }

    pub fn get_process_by_pid(&self, pid: u32) -> Option<Arc<GridServerProcess>> {
        self.registry().iter().find(|p| p.pid() == pid).cloned()
    }

    /// `Ok(false)` if nothing listens on `port`.
    pub fn kill_process(&self, port: u16) -> FleetResult<bool> {
        self.kill_where(|p| p.port() == port)
    }

    pub fn kill_process_by_pid(&self, pid: u32) -> FleetResult<bool> {
        self.kill_where(|p| p.pid() == pid)
    }

    pub fn kill_process_instance(&self, instance: &Arc<GridServerProcess>) -> FleetResult<bool> {
        self.kill_where(|p| Arc::ptr_eq(p, instance))
    }

    /// Kill the first tracked process matching `predicate`. On a failed
    /// kill the process stays tracked unless it died anyway.
    fn kill_where(&self, predicate: impl Fn(&Arc<GridServerProcess>) -> bool) -> FleetResult<bool> {
        let mut processes = self.registry();
        let Some(index) = processes.iter().position(predicate) else {
            return Ok(false);
        };
        let process = processes[index].clone();

        match process.kill() {
            Ok(()) => {
                processes.remove(index);
                process.dispose();
                info!(process = %process, "killed grid server");
                Ok(true)
            }
            Err(e) => {
                if process.has_exited() {
                    processes.remove(index);
                    process.dispose();
                    warn!(process = %process, error = %e, "kill failed but process is gone");
                } else {
                    error!(process = %process, error = %e, "failed to kill grid server");
                }
                Err(e)
            }
        }
    }

    /// A uniformly random tracked process.
    pub fn get_random_process(&self) -> Option<Arc<GridServerProcess>> {
        let snapshot = self.processes();
        if snapshot.is_empty() {
            return None;
        }
        let index = self
            .rng
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .random_range(0..snapshot.len());
        Some(snapshot[index].clone())
    }

    /// Adopt grid servers found in the process table that are not tracked
    /// yet, claiming their ports. Returns the newly adopted processes.
    pub fn discover_instances(&self) -> FleetResult<Vec<Arc<GridServerProcess>>> {
        let discovered =
            GridServerProcess::discover_processes(&self.process_name, self.table.as_ref())?;

        let mut processes = self.registry();
        let mut adopted = Vec::new();
        for process in discovered {
            if processes.iter().any(|p| p.pid() == process.pid()) {
                continue;
            }
            match self.ports.claim(process.port()) {
                Ok(lease) => process.attach_lease(lease),
                Err(e) => {
                    warn!(process = %process, error = %e, "port of discovered process already claimed");
                    continue;
                }
            }
            info!(process = %process, "discovered grid server");
            processes.push(process.clone());
            adopted.push(process);
        }
        Ok(adopted)
    }

    /// Snapshot of tracked processes.
    pub fn processes(&self) -> Vec<Arc<GridServerProcess>> {
        self.registry().clone()
    }
}

impl std::fmt::Debug for GridServerDeployer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GridServerDeployer")
            .field("executable_name", &self.executable_name)
            .field("executable_path", &self.executable_path)
            .field("processes", &self.registry().len())
            .finish_non_exhaustive()
    }
}
