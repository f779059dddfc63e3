//! One grid server OS process.

use std::fmt;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use gridfleet_core::{
    FleetError, FleetResult, InstanceId, InstanceInfo, Lifecycle, LifecycleState,
};
use gridfleet_ports::PortLease;
use tracing::{debug, info, warn};

use crate::signal;
use crate::table::ProcessTable;

/// Argument template used when none is configured.
pub const DEFAULT_ARGUMENTS: &str = "{port} -Console";

/// A grid server process, either spawned by this run or adopted from the
/// process table.
pub struct GridServerProcess {
    pid: u32,
    name: String,
    endpoint: SocketAddr,
    /// `None` for adopted processes.
    child: Mutex<Option<Child>>,
    lease: Mutex<Option<PortLease>>,
    lifecycle: Lifecycle,
    disposed: AtomicBool,
}

impl GridServerProcess {
    fn new(pid: u32, name: String, port: u16, child: Option<Child>, state: LifecycleState) -> Self {
        Self {
            pid,
            name,
            endpoint: SocketAddr::from((Ipv4Addr::LOCALHOST, port)),
            child: Mutex::new(child),
            lease: Mutex::new(None),
            lifecycle: Lifecycle::new(state),
            disposed: AtomicBool::new(false),
        }
    }

    /// Launch `executable` on the leased port.
    ///
    /// When a process of the same name already listens on that port it is
    /// adopted instead. The lease is released if launching fails.
    pub fn start(
        executable: &Path,
        working_directory: &Path,
        lease: PortLease,
        arguments: Option<&str>,
        table: &dyn ProcessTable,
    ) -> FleetResult<Arc<Self>> {
        let port = lease.port();
        let name = process_name(executable);

        match table.find_listener(&name, port) {
            Ok(Some(pid)) => {
                info!(pid, port, %name, "adopting process already listening on port");
                let process = Self::new(pid, name, port, None, LifecycleState::Running);
                process.attach_lease(lease);
                return Ok(Arc::new(process));
            }
            Ok(None) => {}
            Err(e) => debug!(port, error = %e, "listener lookup failed; launching anyway"),
        }

        let args = render_arguments(arguments.unwrap_or(DEFAULT_ARGUMENTS), port);
        let spawned = Command::new(executable)
            .args(&args)
            .current_dir(working_directory)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn();

        let child = match spawned {
            Ok(child) => child,
            Err(source) => {
                lease.release();
                return Err(FleetError::LaunchFailed {
                    executable: executable.display().to_string(),
                    source,
                });
            }
        };

        let pid = child.id();
        info!(pid, port, executable = %executable.display(), ?args, "launched grid server");
        let process = Self::new(pid, name, port, Some(child), LifecycleState::Starting);
        process.attach_lease(lease);
        Ok(Arc::new(process))
    }

    /// Handles for processes named `process_name`, owned by the current
    /// user, that listen on a TCP port. The first listening port becomes
    /// the endpoint. No leases are attached.
    pub fn discover_processes(
        process_name: &str,
        table: &dyn ProcessTable,
    ) -> FleetResult<Vec<Arc<Self>>> {
        let mut found = Vec::new();
        for entry in table.processes_named(process_name)? {
            let ports = table.listening_ports(entry.pid)?;
            let Some(&port) = ports.first() else {
                debug!(pid = entry.pid, "skipping process without a listener");
                continue;
            };
            found.push(Arc::new(Self::new(
                entry.pid,
                entry.name,
                port,
                None,
                LifecycleState::Running,
            )));
        }
        Ok(found)
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn name(&self) -> &str {
        &self.name
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

    /// Spawned by this run (as opposed to adopted).
    pub fn is_owned(&self) -> bool {
        self.child_guard().is_some()
    }

    pub fn attach_lease(&self, lease: PortLease) {
        let previous = self.lease_guard().replace(lease);
        if let Some(previous) = previous {
            previous.release();
        }
    }

    pub fn mark_running(&self) -> FleetResult<()> {
        self.lifecycle.transition(LifecycleState::Running).map(|_| ())
    }

    pub fn has_exited(&self) -> bool {
        if self.lifecycle.get().is_terminal() {
            return true;
        }
        let mut child = self.child_guard();
        match child.as_mut() {
            Some(child) => !matches!(child.try_wait(), Ok(None)),
            None => !signal::is_alive(self.pid),
        }
    }

    /// Not disposed and still running.
    pub fn is_open(&self) -> bool {
        !self.disposed.load(Ordering::Acquire) && !self.has_exited()
    }

    /// Force-kill the process. Killing an exited process succeeds.
    pub fn kill(&self) -> FleetResult<()> {
        if self.lifecycle.get().is_terminal() {
            return Ok(());
        }

        {
            let mut child = self.child_guard();
            match child.as_mut() {
                Some(child) => {
                    if let Ok(None) = child.try_wait() {
                        child.kill().map_err(|source| FleetError::KillFailed {
                            pid: self.pid,
                            source,
                        })?;
                    }
                    // Reap so the pid does not linger as a zombie.
                    let _ = child.wait();
                }
                None => {
                    let was_alive = signal::force_kill(self.pid).map_err(|source| {
                        FleetError::KillFailed {
                            pid: self.pid,
                            source,
                        }
                    })?;
                    if !was_alive {
                        debug!(pid = self.pid, "process already gone");
                    }
                }
            }
        }

        self.lifecycle.settle(LifecycleState::Killed);
        info!(pid = self.pid, port = self.port(), "killed grid server");
        Ok(())
    }

    /// Release the port lease and the OS handle. Idempotent; does not kill.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(lease) = self.lease_guard().take() {
            lease.release();
        }
        if self.child_guard().take().is_some() && !self.lifecycle.get().is_terminal() {
            warn!(pid = self.pid, "disposing a process that was not killed");
        }
        debug!(pid = self.pid, "disposed grid server handle");
    }

    pub fn info(&self) -> InstanceInfo {
        InstanceInfo {
            id: InstanceId::Process(self.pid),
            name: self.name.clone(),
            endpoint: self.endpoint,
            state: self.state(),
            version: None,
        }
    }

    fn child_guard(&self) -> MutexGuard<'_, Option<Child>> {
        self.child.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lease_guard(&self) -> MutexGuard<'_, Option<PortLease>> {
        self.lease.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl fmt::Display for GridServerProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{} ({}) @ {}]", self.name, self.pid, self.endpoint)
    }
}

impl fmt::Debug for GridServerProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GridServerProcess")
            .field("pid", &self.pid)
            .field("name", &self.name)
            .field("endpoint", &self.endpoint)
            .field("state", &self.state())
            .finish()
    }
}

/// Substitute `{port}` and split on whitespace.
pub fn render_arguments(template: &str, port: u16) -> Vec<String> {
    template
        .replace("{port}", &port.to_string())
        .split_whitespace()
        .map(str::to_string)
        .collect()
}

/// Process-table name of an executable (its file stem).
pub fn process_name(executable: &Path) -> String {
    executable
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::ProcessEntry;
    use gridfleet_metrics::MetricsRegistry;
    use gridfleet_ports::PortAllocator;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use std::time::Duration;

    struct EmptyTable;

    impl ProcessTable for EmptyTable {
        fn list_processes(&self) -> FleetResult<Vec<ProcessEntry>> {
            Ok(Vec::new())
        }
        fn listening_ports(&self, _pid: u32) -> FleetResult<Vec<u16>> {
            Ok(Vec::new())
        }
        fn current_user(&self) -> Option<u32> {
            None
        }
    }

    struct OneListener {
        pid: u32,
        port: u16,
    }

    impl ProcessTable for OneListener {
        fn list_processes(&self) -> FleetResult<Vec<ProcessEntry>> {
            Ok(vec![
                ProcessEntry { pid: self.pid, name: "grid-server".into(), uid: Some(1000) },
                ProcessEntry { pid: 7, name: "grid-server".into(), uid: Some(0) },
                ProcessEntry { pid: 8, name: "grid-server".into(), uid: Some(1000) },
            ])
        }
        fn listening_ports(&self, pid: u32) -> FleetResult<Vec<u16>> {
            Ok(if pid == self.pid || pid == 7 { vec![self.port] } else { Vec::new() })
        }
        fn current_user(&self) -> Option<u32> {
            Some(1000)
        }
    }

    fn allocator() -> Arc<PortAllocator> {
        PortAllocator::with_probe(
            45000..47000,
            100,
            Duration::ZERO,
            &MetricsRegistry::with_machine("test"),
            StdRng::seed_from_u64(5),
            |_port: u16| false,
        )
        .unwrap()
    }

    #[test]
    fn arguments_template() {
        assert_eq!(render_arguments(DEFAULT_ARGUMENTS, 45123), vec!["45123", "-Console"]);
        assert_eq!(render_arguments("--port={port}  --verbose", 1), vec!["--port=1", "--verbose"]);
    }

    #[test]
    fn name_is_file_stem() {
        assert_eq!(process_name(Path::new("/opt/grid/grid-server.exe")), "grid-server");
        assert_eq!(process_name(Path::new("grid-server")), "grid-server");
    }

    #[test]
    fn missing_executable_fails_and_releases_lease() {
        let ports = allocator();
        let lease = ports.find_next_available_port().unwrap();
        let err = GridServerProcess::start(
            Path::new("/nonexistent/grid-server"),
            Path::new("/"),
            lease,
            None,
            &EmptyTable,
        )
        .unwrap_err();
        assert!(matches!(err, FleetError::LaunchFailed { .. }));
        assert!(ports.allocated_ports().is_empty());
    }

    #[test]
    fn existing_listener_is_adopted() {
        let ports = allocator();
        let lease = ports.claim(45555).unwrap();
        let process = GridServerProcess::start(
            Path::new("/nonexistent/grid-server"),
            Path::new("/"),
            lease,
            None,
            &OneListener { pid: 4321, port: 45555 },
        )
        .unwrap();
        assert_eq!(process.pid(), 4321);
        assert!(!process.is_owned());
        assert_eq!(process.state(), LifecycleState::Running);
        assert_eq!(process.to_string(), "[grid-server (4321) @ 127.0.0.1:45555]");
    }

    #[test]
    fn discovery_filters_owner_and_listener() {
        let found =
            GridServerProcess::discover_processes("grid-server", &OneListener { pid: 4321, port: 45555 })
                .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].pid(), 4321);
        assert_eq!(found[0].port(), 45555);
    }

    #[cfg(unix)]
    #[test]
    fn spawned_process_lifecycle() {
        let ports = allocator();
        let lease = ports.find_next_available_port().unwrap();
        let port = lease.port();
        let process = GridServerProcess::start(
            Path::new("sleep"),
            Path::new("/"),
            lease,
            Some("30"),
            &EmptyTable,
        )
        .unwrap();

        assert!(process.is_owned());
        assert!(process.is_open());
        assert_eq!(process.state(), LifecycleState::Starting);

        process.kill().unwrap();
        process.kill().unwrap();
        assert_eq!(process.state(), LifecycleState::Killed);
        assert!(process.has_exited());

        process.dispose();
        process.dispose();
        assert_eq!(process.state(), LifecycleState::Killed);
        assert!(!process.is_open());
        assert!(!ports.is_allocated(port));
    }

    #[cfg(unix)]
    #[test]
    fn killing_an_exited_child_is_fine() {
        let ports = allocator();
        let lease = ports.find_next_available_port().unwrap();
        let process =
            GridServerProcess::start(Path::new("true"), Path::new("/"), lease, Some(""), &EmptyTable)
                .unwrap();
        std::thread::sleep(Duration::from_millis(200));
        assert!(process.has_exited());
        process.kill().unwrap();
        assert_eq!(process.state(), LifecycleState::Killed);
    }
}
