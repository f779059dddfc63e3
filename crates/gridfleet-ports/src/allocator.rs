//! Random-probe port allocator.
//!
//! All reservation state lives behind one mutex, so two concurrent callers
//! can never be handed the same port.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::ops::Range;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use gridfleet_core::config::PortsConfig;
use gridfleet_core::ConfigError;
use gridfleet_metrics::{MetricsRegistry, OperationCounters};
use rand::rngs::StdRng;
use rand::Rng;
use tracing::{debug, info, warn};

use crate::error::{PortError, PortResult};
use crate::probe::{BindProbe, PortProbe};

const COUNTER_CATEGORY: &str = "PortAllocator";

struct AllocatorState {
    held: HashSet<u16>,
    recently_released: HashMap<u16, Instant>,
    rng: StdRng,
}

/// Hands out TCP ports from a fixed range.
pub struct PortAllocator {
    range: Range<u16>,
    max_attempts: u32,
    reuse_cooldown: Duration,
    probe: Box<dyn PortProbe>,
    counters: Arc<OperationCounters>,
    state: Mutex<AllocatorState>,
}

impl PortAllocator {
    pub fn new(
        range: Range<u16>,
        max_attempts: u32,
        reuse_cooldown: Duration,
        metrics: &MetricsRegistry,
        rng: StdRng,
    ) -> PortResult<Arc<Self>> {
        Self::with_probe(range, max_attempts, reuse_cooldown, metrics, rng, BindProbe)
    }

    pub fn with_probe(
        range: Range<u16>,
        max_attempts: u32,
        reuse_cooldown: Duration,
        metrics: &MetricsRegistry,
        rng: StdRng,
        probe: impl PortProbe + 'static,
    ) -> PortResult<Arc<Self>> {
        if range.is_empty() {
            return Err(PortError::InvalidRange {
                start: range.start,
                end: range.end,
            });
        }
        Ok(Arc::new(Self {
            range,
            max_attempts: max_attempts.max(1),
            reuse_cooldown,
            probe: Box::new(probe),
            counters: metrics.counters(COUNTER_CATEGORY),
            state: Mutex::new(AllocatorState {
                held: HashSet::new(),
                recently_released: HashMap::new(),
                rng,
            }),
        }))
    }

    /// Build from the `[ports]` config section.
    pub fn from_config(
        config: &PortsConfig,
        metrics: &MetricsRegistry,
        rng: StdRng,
    ) -> Result<Arc<Self>, ConfigError> {
        let cooldown = config.reuse_cooldown()?;
        Self::new(
            config.range_start..config.range_end,
            config.max_attempts,
            cooldown,
            metrics,
            rng,
        )
        .map_err(|e| ConfigError::Invalid(e.to_string()))
    }

    pub fn range(&self) -> Range<u16> {
        self.range.clone()
    }

    fn lock(&self) -> MutexGuard<'_, AllocatorState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Reserve a free port.
    ///
    /// Fails with [`PortError::ResourceExhausted`] once `max_attempts`
    /// candidates have been rejected.
    pub fn find_next_available_port(self: &Arc<Self>) -> PortResult<PortLease> {
        self.counters.increment_attempt();
        let started = Instant::now();

        let mut state = self.lock();
        let now = Instant::now();
        let cooldown = self.reuse_cooldown;
        state
            .recently_released
            .retain(|_, released| now.duration_since(*released) < cooldown);

        for attempt in 1..=self.max_attempts {
            let port = state.rng.random_range(self.range.clone());
            if state.held.contains(&port) || state.recently_released.contains_key(&port) {
                continue;
            }
            if self.probe.is_in_use(port) {
                debug!(port, "candidate port already has a listener");
                continue;
            }

            state.held.insert(port);
            drop(state);

            self.counters.increment_success();
            info!(
                port,
                attempts = attempt,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "allocated port"
            );
            return Ok(PortLease::new(self.clone(), port));
        }

        drop(state);
        self.counters.increment_failure();
        warn!(
            attempts = self.max_attempts,
            range_start = self.range.start,
            range_end = self.range.end,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "port range exhausted"
        );
        Err(PortError::ResourceExhausted {
            range_start: self.range.start,
            range_end: self.range.end,
            attempts: self.max_attempts,
        })
    }

    /// Register an externally chosen port (explicit request or discovered
    /// instance).
    pub fn claim(self: &Arc<Self>, port: u16) -> PortResult<PortLease> {
        let mut state = self.lock();
        if !state.held.insert(port) {
            return Err(PortError::AlreadyAllocated(port));
        }
        state.recently_released.remove(&port);
        debug!(port, "claimed port");
        Ok(PortLease::new(self.clone(), port))
    }

    /// Drop `port` from the held set and start its reuse cooldown.
    /// Returns false if it was not held.
    pub fn release(&self, port: u16) -> bool {
        let mut state = self.lock();
        if !state.held.remove(&port) {
            return false;
        }
        state.recently_released.insert(port, Instant::now());
        debug!(port, "released port");
        true
    }

    /// Clear the reuse cooldown for `port`.
    pub fn forget_recent(&self, port: u16) {
        self.lock().recently_released.remove(&port);
    }

    pub fn is_allocated(&self, port: u16) -> bool {
        self.lock().held.contains(&port)
    }

    /// Sorted snapshot of held ports.
    pub fn allocated_ports(&self) -> Vec<u16> {
        let mut ports: Vec<u16> = self.lock().held.iter().copied().collect();
        ports.sort_unstable();
        ports
    }
}

impl fmt::Debug for PortAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PortAllocator")
            .field("range", &self.range)
            .field("max_attempts", &self.max_attempts)
            .field("reuse_cooldown", &self.reuse_cooldown)
            .finish_non_exhaustive()
    }
}

/// A reserved port. Releasing is explicit; dropping a lease does not
/// return the port.
pub struct PortLease {
    allocator: Arc<PortAllocator>,
    port: u16,
    released: AtomicBool,
}

impl PortLease {
    fn new(allocator: Arc<PortAllocator>, port: u16) -> Self {
        Self {
            allocator,
            port,
            released: AtomicBool::new(false),
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    /// Return the port to the allocator. Idempotent.
    pub fn release(&self) {
        if !self.released.swap(true, Ordering::AcqRel) {
            self.allocator.release(self.port);
        }
    }
}

impl fmt::Debug for PortLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PortLease")
            .field("port", &self.port)
            .field("released", &self.is_released())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn allocator(range: Range<u16>, cooldown: Duration) -> Arc<PortAllocator> {
        PortAllocator::with_probe(
            range,
            1000,
            cooldown,
            &MetricsRegistry::with_machine("test"),
            StdRng::seed_from_u64(7),
            |_port: u16| false,
        )
        .unwrap()
    }

    #[test]
    fn allocates_within_range() {
        let alloc = allocator(45000..47000, Duration::ZERO);
        let lease = alloc.find_next_available_port().unwrap();
        assert!((45000..47000).contains(&lease.port()));
        assert_eq!(alloc.allocated_ports(), vec![lease.port()]);
    }

    #[test]
    fn never_hands_out_a_held_port() {
        let alloc = allocator(46000..46010, Duration::ZERO);
        let leases: Vec<_> = (0..10)
            .map(|_| alloc.find_next_available_port().unwrap())
            .collect();
        let mut ports: Vec<u16> = leases.iter().map(PortLease::port).collect();
        ports.sort_unstable();
        ports.dedup();
        assert_eq!(ports.len(), 10);
    }

    #[test]
    fn exhaustion_is_an_error() {
        let alloc = allocator(46000..46002, Duration::ZERO);
        let _a = alloc.find_next_available_port().unwrap();
        let _b = alloc.find_next_available_port().unwrap();
        let err = alloc.find_next_available_port().unwrap_err();
        assert!(matches!(err, PortError::ResourceExhausted { attempts: 1000, .. }));
    }

    #[test]
    fn probe_rejections_are_skipped() {
        let alloc = PortAllocator::with_probe(
            46000..46004,
            1000,
            Duration::ZERO,
            &MetricsRegistry::with_machine("test"),
            StdRng::seed_from_u64(1),
            |port: u16| port != 46003,
        )
        .unwrap();
        assert_eq!(alloc.find_next_available_port().unwrap().port(), 46003);
    }

    #[test]
    fn released_port_sits_out_the_cooldown() {
        let alloc = allocator(46000..46001, Duration::from_secs(3600));
        let lease = alloc.find_next_available_port().unwrap();
        lease.release();
        assert!(alloc.find_next_available_port().is_err());

        alloc.forget_recent(46000);
        assert_eq!(alloc.find_next_available_port().unwrap().port(), 46000);
    }

    #[test]
    fn zero_cooldown_allows_immediate_reuse() {
        let alloc = allocator(46000..46001, Duration::ZERO);
        alloc.find_next_available_port().unwrap().release();
        assert!(alloc.find_next_available_port().is_ok());
    }

    #[test]
    fn lease_release_is_idempotent() {
        let alloc = allocator(46000..46002, Duration::ZERO);
        let lease = alloc.find_next_available_port().unwrap();
        lease.release();
        lease.release();
        assert!(lease.is_released());
        assert!(alloc.allocated_ports().is_empty());
    }

    #[test]
    fn claim_conflicts_with_held_port() {
        let alloc = allocator(45000..47000, Duration::ZERO);
        let lease = alloc.claim(45500).unwrap();
        assert!(matches!(
            alloc.claim(45500).unwrap_err(),
            PortError::AlreadyAllocated(45500)
        ));
        lease.release();
        assert!(alloc.claim(45500).is_ok());
    }

    #[test]
    fn empty_range_is_rejected() {
        let err = PortAllocator::new(
            46000..46000,
            10,
            Duration::ZERO,
            &MetricsRegistry::with_machine("test"),
            StdRng::seed_from_u64(1),
        )
        .unwrap_err();
        assert!(matches!(err, PortError::InvalidRange { .. }));
    }

    #[test]
    fn counters_track_outcomes() {
        let metrics = MetricsRegistry::with_machine("test");
        let alloc = PortAllocator::with_probe(
            46000..46001,
            5,
            Duration::ZERO,
            &metrics,
            StdRng::seed_from_u64(1),
            |_port: u16| false,
        )
        .unwrap();
        let _held = alloc.find_next_available_port().unwrap();
        let _ = alloc.find_next_available_port();

        let counters = metrics.counters(COUNTER_CATEGORY);
        assert_eq!(counters.attempts(), 2);
        assert_eq!(counters.successes(), 1);
        assert_eq!(counters.failures(), 1);
    }

    #[test]
    fn from_config_uses_section_values() {
        let config = PortsConfig {
            range_start: 45100,
            range_end: 45200,
            ..PortsConfig::default()
        };
        let alloc = PortAllocator::from_config(
            &config,
            &MetricsRegistry::with_machine("test"),
            StdRng::seed_from_u64(3),
        )
        .unwrap();
        assert_eq!(alloc.range(), 45100..45200);
    }

    #[test]
    fn port_error_maps_to_fleet_error() {
        use gridfleet_core::FleetError;

        let err: FleetError = PortError::AlreadyAllocated(45001).into();
        assert!(matches!(err, FleetError::PortAlreadyAllocated(45001)));
        let err: FleetError = PortError::ResourceExhausted {
            range_start: 1,
            range_end: 2,
            attempts: 3,
        }
        .into();
        assert!(matches!(err, FleetError::ResourceExhausted(_)));
    }
}
