//! gridfleet-process: grid servers as native OS processes.
//!
//! # Architecture
//!
//! ```text
//! NativeBackend (GridServerBackend)
//!   └── GridServerDeployer ── Mutex<Vec<Arc<GridServerProcess>>>
//!         ├── PortAllocator (leases, claims for adopted processes)
//!         ├── ProcessTable (procfs on Linux, tasklist/netstat on Windows)
//!         └── OperationCounters ("GridServerDeployer")
//! ```
//!
//! The deployer is synchronous. The backend adapter runs it on the
//! blocking pool and does TCP availability probing on the async side.

pub mod backend;
pub mod deployer;
pub mod process;
pub mod registry;
pub mod signal;
pub mod table;

pub use backend::NativeBackend;
pub use deployer::{GridServerDeployer, KillAllOutcome};
pub use process::GridServerProcess;
pub use table::{ProcessEntry, ProcessTable, ProcfsTable, TasklistTable, system_table};
