//! Domain types for grid server instances.
//!
//! A grid server is either an OS process (native backend) or a container
//! (container backend). Backends keep their own rich handles; what crosses
//! the backend boundary is an `InstanceInfo` snapshot.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{FleetError, FleetResult};

// ── Identity ──────────────────────────────────────────────────────

/// Identity of a grid server instance.
///
/// Process ids and container ids are mutually exclusive: an instance is
/// owned by exactly one backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum InstanceId {
    Process(u32),
    Container(String),
}

impl InstanceId {
    /// The pid, if this is a native process.
    pub fn pid(&self) -> Option<u32> {
        match self {
            InstanceId::Process(pid) => Some(*pid),
            InstanceId::Container(_) => None,
        }
    }

    /// The container id, if this is a container.
    pub fn container_id(&self) -> Option<&str> {
        match self {
            InstanceId::Process(_) => None,
            InstanceId::Container(id) => Some(id),
        }
    }

    /// Parse a user-supplied identifier: all digits is a pid, anything
    /// else is treated as a container id.
    pub fn parse(raw: &str) -> Self {
        match raw.parse::<u32>() {
            Ok(pid) => InstanceId::Process(pid),
            Err(_) => InstanceId::Container(raw.to_string()),
        }
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstanceId::Process(pid) => write!(f, "pid:{pid}"),
            InstanceId::Container(id) => write!(f, "container:{id}"),
        }
    }
}

// ── Lifecycle ─────────────────────────────────────────────────────

/// Lifecycle of a grid server instance.
///
/// `Starting → Running → Exited | Killed | Removed`. Terminal states are
/// final: disposal keeps whichever terminal state was reached first, and
/// only a live record is marked `Removed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Starting,
    Running,
    Exited,
    Killed,
    Removed,
}

impl LifecycleState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            LifecycleState::Exited | LifecycleState::Killed | LifecycleState::Removed
        )
    }

    /// Whether `self → next` is a legal move. Staying in the same state is
    /// always legal so repeated kills stay idempotent.
    pub fn can_transition_to(self, next: LifecycleState) -> bool {
        if self == next {
            return true;
        }
        match self {
            LifecycleState::Starting => true,
            LifecycleState::Running => next.is_terminal(),
            LifecycleState::Exited | LifecycleState::Killed | LifecycleState::Removed => false,
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LifecycleState::Starting => "starting",
            LifecycleState::Running => "running",
            LifecycleState::Exited => "exited",
            LifecycleState::Killed => "killed",
            LifecycleState::Removed => "removed",
        };
        f.write_str(s)
    }
}

/// Interior-mutable lifecycle state shared by backend handles.
#[derive(Debug)]
pub struct Lifecycle {
    state: Mutex<LifecycleState>,
}

impl Lifecycle {
    pub fn new(initial: LifecycleState) -> Self {
        Self {
            state: Mutex::new(initial),
        }
    }

    /// Current state.
    pub fn get(&self) -> LifecycleState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Move to `next`, rejecting transitions out of terminal states.
    pub fn transition(&self, next: LifecycleState) -> FleetResult<LifecycleState> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if !state.can_transition_to(next) {
            return Err(FleetError::InvalidTransition {
                from: *state,
                to: next,
            });
        }
        let previous = *state;
        *state = next;
        Ok(previous)
    }

    /// Move to `next` if legal; otherwise keep the current state.
    ///
    /// Returns the state after the call.
    pub fn settle(&self, next: LifecycleState) -> LifecycleState {
        match self.transition(next) {
            Ok(_) => next,
            Err(e) => {
                debug!(error = %e, "lifecycle transition ignored");
                self.get()
            }
        }
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new(LifecycleState::Starting)
    }
}

// ── Snapshots ─────────────────────────────────────────────────────

/// Point-in-time view of an instance, handed to callers of a backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceInfo {
    pub id: InstanceId,
    /// Process name or container name.
    pub name: String,
    pub endpoint: SocketAddr,
    pub state: LifecycleState,
    /// Grid server version (container backend only).
    pub version: Option<String>,
}

impl fmt::Display for InstanceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{} ({}) @ {} {}]", self.name, self.id, self.endpoint, self.state)
    }
}

// ── Resources ─────────────────────────────────────────────────────

/// A request to change the CPU/memory budget of a running instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceJob {
    /// Container id of the instance to update.
    pub container_id: String,
    /// Physical cores; anything below 1e-5 means unlimited.
    pub maximum_cores: f64,
    pub maximum_threads: i64,
    pub maximum_memory_in_megabytes: i64,
    /// CFS scheduler period in microseconds.
    pub scheduler_cpu_period: i64,
}

impl ResourceJob {
    pub fn new(container_id: impl Into<String>, maximum_cores: f64, maximum_memory_in_megabytes: i64) -> Self {
        Self {
            container_id: container_id.into(),
            maximum_cores,
            maximum_threads: 0,
            maximum_memory_in_megabytes,
            scheduler_cpu_period: crate::quota::DEFAULT_SCHEDULER_CPU_PERIOD,
        }
    }
}

/// CFS quota and memory limit applied to a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerResourceQuota {
    /// CPU period in microseconds.
    pub cpu_period: i64,
    /// CPU quota in microseconds per period, `-1` for unlimited.
    pub cpu_quota: i64,
    pub memory_bytes: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_are_final() {
        for terminal in [
            LifecycleState::Exited,
            LifecycleState::Killed,
            LifecycleState::Removed,
        ] {
            assert!(terminal.is_terminal());
            assert!(!terminal.can_transition_to(LifecycleState::Running));
            assert!(!terminal.can_transition_to(LifecycleState::Starting));
            assert!(terminal.can_transition_to(terminal));
        }
    }

    #[test]
    fn stopped_instances_keep_their_first_terminal_state() {
        assert!(!LifecycleState::Killed.can_transition_to(LifecycleState::Removed));
        assert!(!LifecycleState::Exited.can_transition_to(LifecycleState::Removed));
        assert!(!LifecycleState::Removed.can_transition_to(LifecycleState::Killed));
        assert!(!LifecycleState::Killed.can_transition_to(LifecycleState::Exited));
    }

    #[test]
    fn running_only_moves_to_terminal() {
        assert!(LifecycleState::Running.can_transition_to(LifecycleState::Killed));
        assert!(LifecycleState::Running.can_transition_to(LifecycleState::Removed));
        assert!(!LifecycleState::Running.can_transition_to(LifecycleState::Starting));
    }

    #[test]
    fn lifecycle_rejects_leaving_terminal_state() {
        let lifecycle = Lifecycle::default();
        lifecycle.transition(LifecycleState::Running).unwrap();
        lifecycle.transition(LifecycleState::Killed).unwrap();

        let err = lifecycle.transition(LifecycleState::Running).unwrap_err();
        assert!(matches!(
            err,
            FleetError::InvalidTransition {
                from: LifecycleState::Killed,
                to: LifecycleState::Running
            }
        ));
        assert_eq!(lifecycle.get(), LifecycleState::Killed);
    }

    #[test]
    fn settle_keeps_first_terminal_state() {
        let lifecycle = Lifecycle::new(LifecycleState::Running);
        assert_eq!(lifecycle.settle(LifecycleState::Exited), LifecycleState::Exited);
        assert_eq!(lifecycle.settle(LifecycleState::Killed), LifecycleState::Exited);
    }

    #[test]
    fn instance_id_parse() {
        assert_eq!(InstanceId::parse("4242"), InstanceId::Process(4242));
        assert_eq!(
            InstanceId::parse("3f2a9c"),
            InstanceId::Container("3f2a9c".to_string())
        );
        assert_eq!(InstanceId::Process(7).pid(), Some(7));
        assert_eq!(InstanceId::Container("c".into()).container_id(), Some("c"));
    }

    #[test]
    fn instance_info_display() {
        let info = InstanceInfo {
            id: InstanceId::Process(12),
            name: "grid-server".to_string(),
            endpoint: "127.0.0.1:45001".parse().unwrap(),
            state: LifecycleState::Running,
            version: None,
        };
        assert_eq!(info.to_string(), "[grid-server (pid:12) @ 127.0.0.1:45001 running]");
    }
}
