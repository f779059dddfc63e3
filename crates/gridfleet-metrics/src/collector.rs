//! Counter registry: attempt/success/failure per operation category.
//!
//! Counters are lock-free atomics; the registry map is only locked to
//! create a category or take a snapshot.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info};

/// Counter triple for one operation category.
#[derive(Debug, Default)]
pub struct OperationCounters {
    attempts: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
}

impl OperationCounters {
    pub fn increment_attempt(&self) {
        self.attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_success(&self) {
        self.successes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Record the outcome of an already-counted attempt.
    pub fn record_outcome(&self, success: bool) {
        if success {
            self.increment_success();
        } else {
            self.increment_failure();
        }
    }

    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::Relaxed)
    }

    pub fn successes(&self) -> u64 {
        self.successes.load(Ordering::Relaxed)
    }

    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }
}

/// Point-in-time counter values for one category.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CounterSnapshot {
    pub category: String,
    pub machine: String,
    pub attempts: u64,
    pub successes: u64,
    pub failures: u64,
}

/// Registry of counters keyed by category, for one machine.
#[derive(Debug)]
pub struct MetricsRegistry {
    machine: String,
    categories: RwLock<HashMap<String, Arc<OperationCounters>>>,
}

impl MetricsRegistry {
    /// Registry labelled with this host's name.
    pub fn new() -> Self {
        Self::with_machine(machine_name())
    }

    pub fn with_machine(machine: impl Into<String>) -> Self {
        Self {
            machine: machine.into(),
            categories: RwLock::new(HashMap::new()),
        }
    }

    pub fn machine(&self) -> &str {
        &self.machine
    }

    /// Counters for `category`, created on first use.
    pub fn counters(&self, category: &str) -> Arc<OperationCounters> {
        if let Some(existing) = self
            .categories
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(category)
        {
            return existing.clone();
        }

        let mut categories = self.categories.write().unwrap_or_else(|e| e.into_inner());
        categories
            .entry(category.to_string())
            .or_insert_with(|| {
                debug!(%category, "registered counter category");
                Arc::new(OperationCounters::default())
            })
            .clone()
    }

    /// All categories, sorted by name.
    pub fn snapshot(&self) -> Vec<CounterSnapshot> {
        let categories = self.categories.read().unwrap_or_else(|e| e.into_inner());
        let mut snapshots: Vec<CounterSnapshot> = categories
            .iter()
            .map(|(category, c)| CounterSnapshot {
                category: category.clone(),
                machine: self.machine.clone(),
                attempts: c.attempts(),
                successes: c.successes(),
                failures: c.failures(),
            })
            .collect();
        snapshots.sort_by(|a, b| a.category.cmp(&b.category));
        snapshots
    }

    /// Log a snapshot every `interval` until shutdown.
    pub async fn run(&self, interval: Duration, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        info!(interval_secs = interval.as_secs(), "metrics reporter started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => self.log_snapshot(),
                _ = shutdown.changed() => {
                    info!("metrics reporter shutting down");
                    self.log_snapshot();
                    break;
                }
            }
        }
    }

    fn log_snapshot(&self) {
        for s in self.snapshot() {
            info!(
                category = %s.category,
                machine = %s.machine,
                attempts = s.attempts,
                successes = s.successes,
                failures = s.failures,
                "operation counters"
            );
        }
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Host name used as the machine label; "unknown" if it cannot be read.
pub fn machine_name() -> String {
    #[cfg(unix)]
    {
        let mut buf = [0u8; 256];
        // SAFETY: buf is valid for buf.len() bytes; gethostname NUL-terminates on success.
        let rc = unsafe { libc::gethostname(buf.as_mut_ptr().cast(), buf.len()) };
        if rc == 0 {
            let len = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
            if len > 0 {
                return String::from_utf8_lossy(&buf[..len]).into_owned();
            }
        }
    }
    std::env::var("COMPUTERNAME")
        .or_else(|_| std::env::var("HOSTNAME"))
        .unwrap_or_else(|_| "unknown".to_string())
}
