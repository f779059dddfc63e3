//! gridfleet-health: liveness probes for grid server instances.
//!
//! # Architecture
//!
//! ```text
//! ProbeSettings (host, attempts, timeout)
//!   ├── wait_for_tcp() → ProbeOutcome
//!   │   └── exit predicate checked before every attempt
//!   └── http_probe() → HttpProbeResult
//!       └── GET {scheme}://{host}:{port}{path}, body vs expected text
//! ```
//!
//! Both probes retry up to `attempts` times, sleeping `timeout` between
//! attempts. Neither is cancellable from outside; the worst case is
//! roughly `attempts × 2 × timeout`.

pub mod http;
pub mod tcp;

pub use http::{HttpProbeResult, http_probe};
pub use tcp::{ProbeOutcome, ProbeSettings, wait_for_tcp, wait_for_tcp_available};
