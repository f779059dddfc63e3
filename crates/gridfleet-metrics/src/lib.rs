//! gridfleet-metrics: instrumentation for fleet operations.
//!
//! Every logical operation category (`GridServerDeployer`, `PortAllocator`,
//! one per container-engine operation) gets an attempt/success/failure
//! counter triple, labelled with the machine it runs on.
//!
//! # Architecture
//!
//! ```text
//! MetricsRegistry
//!   ├── counters(category) → Arc<OperationCounters>
//!   ├── snapshot() → Vec<CounterSnapshot>
//!   └── run() → periodic snapshot log loop
//!
//! Prometheus exposition
//!   └── render_prometheus() → text/plain
//! ```

pub mod collector;
pub mod prometheus;

pub use collector::{CounterSnapshot, MetricsRegistry, OperationCounters};
pub use prometheus::render_prometheus;
