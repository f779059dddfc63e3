//! OS process table access.
//!
//! Discovery needs three things from the OS: the processes with a given
//! name, who owns them, and which TCP ports they listen on. On Linux all
//! of it comes from procfs: `/proc/<pid>/comm`, the `Uid:` line of
//! `/proc/<pid>/status`, and `/proc/<pid>/fd` socket inodes joined
//! against the LISTEN rows of `/proc/net/tcp` and `/proc/net/tcp6`.
//! Without procfs (Windows) the same facts come from `tasklist` and
//! `netstat -ano`.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::process::Command;
use std::sync::Arc;

use gridfleet_core::{FleetError, FleetResult};
use tracing::trace;

/// TCP state code for LISTEN in `/proc/net/tcp`.
const TCP_LISTEN: u8 = 0x0A;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessEntry {
    pub pid: u32,
    pub name: String,
    /// Real uid of the owner, when known.
    pub uid: Option<u32>,
}

pub trait ProcessTable: Send + Sync {
    fn list_processes(&self) -> FleetResult<Vec<ProcessEntry>>;

    /// TCP ports `pid` is listening on, sorted.
    fn listening_ports(&self, pid: u32) -> FleetResult<Vec<u16>>;

    /// Uid of the current user, when the platform has one.
    fn current_user(&self) -> Option<u32>;

    /// Processes named `name` owned by the current user.
    fn processes_named(&self, name: &str) -> FleetResult<Vec<ProcessEntry>> {
        let me = self.current_user();
        Ok(self
            .list_processes()?
            .into_iter()
            .filter(|p| p.name == name)
            .filter(|p| match (me, p.uid) {
                (Some(me), Some(owner)) => me == owner,
                _ => true,
            })
            .collect())
    }

    /// Pid of a process named `name` listening on `port`, if any.
    fn find_listener(&self, name: &str, port: u16) -> FleetResult<Option<u32>> {
        for entry in self.processes_named(name)? {
            if self.listening_ports(entry.pid)?.contains(&port) {
                return Ok(Some(entry.pid));
            }
        }
        Ok(None)
    }
}

/// procfs-backed process table.
#[derive(Debug, Clone)]
pub struct ProcfsTable {
    root: PathBuf,
}

impl ProcfsTable {
    pub fn new() -> Self {
        Self::with_root("/proc")
    }

    /// Read from an alternative procfs mount.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn listening_inodes(&self) -> HashMap<u64, u16> {
        let mut inodes = HashMap::new();
        for file in ["net/tcp", "net/tcp6"] {
            if let Ok(content) = fs::read_to_string(self.root.join(file)) {
                inodes.extend(parse_listening_sockets(&content));
            }
        }
        inodes
    }

    fn socket_inodes(&self, pid: u32) -> Vec<u64> {
        let fd_dir = self.root.join(pid.to_string()).join("fd");
        let Ok(entries) = fs::read_dir(&fd_dir) else {
            return Vec::new();
        };
        entries
            .flatten()
            .filter_map(|entry| fs::read_link(entry.path()).ok())
            .filter_map(|target| parse_socket_inode(&target.to_string_lossy()))
            .collect()
    }
}

impl Default for ProcfsTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessTable for ProcfsTable {
    fn list_processes(&self) -> FleetResult<Vec<ProcessEntry>> {
        let entries = fs::read_dir(&self.root).map_err(|e| {
            FleetError::ProcessTable(format!("cannot read {}: {e}", self.root.display()))
        })?;

        let mut processes = Vec::new();
        for entry in entries.flatten() {
            let Some(pid) = entry.file_name().to_str().and_then(|s| s.parse::<u32>().ok()) else {
                continue;
            };
            // Processes can vanish between readdir and read.
            let Ok(comm) = fs::read_to_string(entry.path().join("comm")) else {
                continue;
            };
            let uid = fs::read_to_string(entry.path().join("status"))
                .ok()
                .and_then(|s| parse_status_uid(&s));
            processes.push(ProcessEntry {
                pid,
                name: comm.trim_end().to_string(),
                uid,
            });
        }
        processes.sort_by_key(|p| p.pid);
        Ok(processes)
    }

    fn listening_ports(&self, pid: u32) -> FleetResult<Vec<u16>> {
        let sockets = self.socket_inodes(pid);
        if sockets.is_empty() {
            return Ok(Vec::new());
        }
        let listening = self.listening_inodes();
        let mut ports: Vec<u16> = sockets
            .iter()
            .filter_map(|inode| listening.get(inode).copied())
            .collect();
        ports.sort_unstable();
        ports.dedup();
        trace!(pid, ?ports, "listening ports");
        Ok(ports)
    }

    fn current_user(&self) -> Option<u32> {
        current_uid()
    }
}

/// Process table read from `tasklist /FO CSV /NH` and `netstat -ano`.
///
/// Windows has no uid, so every process counts as the current user's.
#[derive(Debug, Clone, Copy, Default)]
pub struct TasklistTable;

impl ProcessTable for TasklistTable {
    fn list_processes(&self) -> FleetResult<Vec<ProcessEntry>> {
        let output = run_tool("tasklist", &["/FO", "CSV", "/NH"])?;
        let mut processes = parse_tasklist_csv(&output);
        processes.sort_by_key(|p| p.pid);
        Ok(processes)
    }

    fn listening_ports(&self, pid: u32) -> FleetResult<Vec<u16>> {
        let output = run_tool("netstat", &["-ano"])?;
        let mut ports = parse_netstat_listeners(&output)
            .remove(&pid)
            .unwrap_or_default();
        ports.sort_unstable();
        ports.dedup();
        trace!(pid, ?ports, "listening ports");
        Ok(ports)
    }

    fn current_user(&self) -> Option<u32> {
        None
    }
}

/// The process table for this host: procfs on unix, `tasklist` on Windows.
pub fn system_table() -> Arc<dyn ProcessTable> {
    if cfg!(windows) {
        Arc::new(TasklistTable)
    } else {
        Arc::new(ProcfsTable::new())
    }
}

fn run_tool(program: &str, args: &[&str]) -> FleetResult<String> {
    let output = Command::new(program)
        .args(args)
        .output()
        .map_err(|e| FleetError::ProcessTable(format!("cannot run {program}: {e}")))?;
    if !output.status.success() {
        return Err(FleetError::ProcessTable(format!(
            "{program} exited with {}",
            output.status
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

#[cfg(unix)]
fn current_uid() -> Option<u32> {
    // SAFETY: getuid(2) cannot fail and touches no memory.
    Some(unsafe { libc::getuid() })
}

#[cfg(not(unix))]
fn current_uid() -> Option<u32> {
    None
}

/// Real uid from the `Uid:` line of `/proc/<pid>/status`.
pub fn parse_status_uid(content: &str) -> Option<u32> {
    content
        .lines()
        .find_map(|line| line.strip_prefix("Uid:"))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|uid| uid.parse().ok())
}

/// Inode from an fd link target of the form `socket:[12345]`.
pub fn parse_socket_inode(target: &str) -> Option<u64> {
    target
        .strip_prefix("socket:[")
        .and_then(|rest| rest.strip_suffix(']'))
        .and_then(|inode| inode.parse().ok())
}

/// `inode → local port` for every LISTEN row of a `/proc/net/tcp{,6}` file.
pub fn parse_listening_sockets(content: &str) -> HashMap<u64, u16> {
    content
        .lines()
        .skip(1)
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 10 {
                return None;
            }
            let state = u8::from_str_radix(fields[3], 16).ok()?;
            if state != TCP_LISTEN {
                return None;
            }
            let (_, port_hex) = fields[1].rsplit_once(':')?;
            let port = u16::from_str_radix(port_hex, 16).ok()?;
            let inode = fields[9].parse::<u64>().ok()?;
            (inode != 0).then_some((inode, port))
        })
        .collect()
}

/// Rows of `tasklist /FO CSV /NH`: `"image","pid","session","#","mem"`.
/// The `.exe` suffix is dropped so names match executable stems.
pub fn parse_tasklist_csv(content: &str) -> Vec<ProcessEntry> {
    content
        .lines()
        .filter_map(|line| {
            let fields = csv_fields(line.trim());
            let pid = fields.get(1)?.parse::<u32>().ok()?;
            Some(ProcessEntry {
                pid,
                name: strip_exe(&fields[0]).to_string(),
                uid: None,
            })
        })
        .collect()
}

/// `pid → local ports` for every TCP LISTENING row of `netstat -ano`.
pub fn parse_netstat_listeners(content: &str) -> HashMap<u32, Vec<u16>> {
    let mut listeners: HashMap<u32, Vec<u16>> = HashMap::new();
    for line in content.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        let [proto, local, _foreign, state, pid] = fields.as_slice() else {
            continue;
        };
        if !proto.starts_with("TCP") || *state != "LISTENING" {
            continue;
        }
        let Some(port) = local
            .rsplit_once(':')
            .and_then(|(_, port)| port.parse::<u16>().ok())
        else {
            continue;
        };
        let Ok(pid) = pid.parse::<u32>() else {
            continue;
        };
        listeners.entry(pid).or_default().push(port);
    }
    listeners
}

fn csv_fields(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut field = String::new();
    let mut quoted = false;
    let mut chars = line.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '"' if quoted && chars.peek() == Some(&'"') => {
                field.push('"');
                chars.next();
            }
            '"' => quoted = !quoted,
            ',' if !quoted => fields.push(std::mem::take(&mut field)),
            c => field.push(c),
        }
    }
    fields.push(field);
    fields
}

fn strip_exe(name: &str) -> &str {
    let split = name.len().saturating_sub(4);
    match (name.get(..split), name.get(split..)) {
        (Some(stem), Some(ext)) if !stem.is_empty() && ext.eq_ignore_ascii_case(".exe") => stem,
        _ => name,
    }
}
