//! CPU/memory quota derivation for containers.

use crate::types::{ContainerResourceQuota, ResourceJob};

/// Default CFS scheduler period, in microseconds.
pub const DEFAULT_SCHEDULER_CPU_PERIOD: i64 = 100_000;

/// Requested core counts below this are treated as "no limit".
pub const CORES_EPSILON: f64 = 1e-5;

/// CFS quota sentinel meaning unlimited.
pub const UNLIMITED_CPU_QUOTA: i64 = -1;

/// Ratio used when the host does not report its core topology.
pub const DEFAULT_PHYSICAL_TO_LOGICAL_RATIO: i64 = 2;

const BYTES_PER_MEGABYTE: i64 = 1024 * 1024;

/// Converts between physical cores and CFS period/quota pairs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaCalculator {
    physical_to_logical_ratio: i64,
}

impl QuotaCalculator {
    pub fn new(physical_to_logical_ratio: i64) -> Self {
        Self {
            physical_to_logical_ratio: if physical_to_logical_ratio > 0 {
                physical_to_logical_ratio
            } else {
                DEFAULT_PHYSICAL_TO_LOGICAL_RATIO
            },
        }
    }

    /// Derive the ratio from host core counts, falling back to the default
    /// when the physical count is missing or zero.
    pub fn from_core_counts(physical: Option<u32>, logical: Option<u32>) -> Self {
        match (physical, logical) {
            (Some(physical), Some(logical)) if physical != 0 => {
                Self::new(i64::from(logical / physical))
            }
            _ => Self::new(DEFAULT_PHYSICAL_TO_LOGICAL_RATIO),
        }
    }

    pub fn physical_to_logical_ratio(&self) -> i64 {
        self.physical_to_logical_ratio
    }

    /// `cores × ratio × period`, or `-1` when `cores` is effectively zero.
    pub fn calculate_cpu_quota(&self, physical_cores: f64, cpu_period: i64) -> i64 {
        if physical_cores < CORES_EPSILON {
            return UNLIMITED_CPU_QUOTA;
        }
        (physical_cores * self.physical_to_logical_ratio as f64 * cpu_period as f64) as i64
    }

    /// Inverse of [`calculate_cpu_quota`](Self::calculate_cpu_quota), for
    /// reporting. Unlimited or unset quotas report zero cores.
    pub fn calculate_physical_cores(&self, cpu_period: i64, cpu_quota: i64) -> f64 {
        if cpu_period <= 0 || cpu_quota <= 0 {
            return 0.0;
        }
        cpu_quota as f64 / cpu_period as f64 / self.physical_to_logical_ratio as f64
    }

    /// Full quota for a resource update job.
    pub fn quota_for(&self, job: &ResourceJob) -> ContainerResourceQuota {
        ContainerResourceQuota {
            cpu_period: job.scheduler_cpu_period,
            cpu_quota: self.calculate_cpu_quota(job.maximum_cores, job.scheduler_cpu_period),
            memory_bytes: job.maximum_memory_in_megabytes.saturating_mul(BYTES_PER_MEGABYTE),
        }
    }
}

impl Default for QuotaCalculator {
    fn default() -> Self {
        Self::new(DEFAULT_PHYSICAL_TO_LOGICAL_RATIO)
    }
}
