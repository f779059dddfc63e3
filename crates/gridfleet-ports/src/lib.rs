//! gridfleet-ports: TCP port allocation for grid server instances.
//!
//! Ports are drawn at random from a configured range and handed out as
//! [`PortLease`]s. A port is never handed out twice while leased, is
//! skipped while something on the host already listens on it, and sits
//! out a cooldown after release.

pub mod allocator;
pub mod error;
pub mod probe;

pub use allocator::{PortAllocator, PortLease};
pub use error::{PortError, PortResult};
pub use probe::{BindProbe, PortProbe};
