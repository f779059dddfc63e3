//! Host core topology.
//!
//! The container backend reads physical and logical core counts once at
//! construction to derive the physical-to-logical ratio.

use std::collections::HashMap;
use std::fs;

/// Source of host core counts.
pub trait HostServerInfo: Send + Sync {
    fn physical_core_count(&self) -> Option<u32>;
    fn logical_core_count(&self) -> Option<u32>;
}

/// Fixed core counts (configuration overrides, tests).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StaticHostInfo {
    pub physical: u32,
    pub logical: u32,
}

impl HostServerInfo for StaticHostInfo {
    fn physical_core_count(&self) -> Option<u32> {
        Some(self.physical)
    }

    fn logical_core_count(&self) -> Option<u32> {
        Some(self.logical)
    }
}

/// Core counts parsed from `/proc/cpuinfo`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcCpuInfo {
    physical: Option<u32>,
    logical: Option<u32>,
}

impl ProcCpuInfo {
    /// Read `/proc/cpuinfo`. Missing file (non-Linux) yields no counts.
    pub fn read() -> Self {
        fs::read_to_string("/proc/cpuinfo")
            .map(|content| Self::parse(&content))
            .unwrap_or_default()
    }

    /// Parse cpuinfo content.
    ///
    /// Logical cores are `processor` entries. Physical cores are the sum of
    /// `cpu cores` over distinct `physical id`s.
    pub fn parse(content: &str) -> Self {
        let mut logical = 0u32;
        let mut cores_per_socket: HashMap<String, u32> = HashMap::new();
        let mut current_socket: Option<String> = None;

        for line in content.lines() {
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            let (key, value) = (key.trim(), value.trim());
            match key {
                "processor" => {
                    logical += 1;
                    current_socket = None;
                }
                "physical id" => current_socket = Some(value.to_string()),
                "cpu cores" => {
                    let socket = current_socket.clone().unwrap_or_default();
                    if let Ok(cores) = value.parse::<u32>() {
                        cores_per_socket.entry(socket).or_insert(cores);
                    }
                }
                _ => {}
            }
        }

        let physical: u32 = cores_per_socket.values().sum();
        Self {
            physical: (physical > 0).then_some(physical),
            logical: (logical > 0).then_some(logical),
        }
    }
}

impl HostServerInfo for ProcCpuInfo {
    fn physical_core_count(&self) -> Option<u32> {
        self.physical
    }

    fn logical_core_count(&self) -> Option<u32> {
        self.logical
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cpu(processor: u32, physical_id: u32, cores: u32) -> String {
        format!(
            "processor\t: {processor}\nvendor_id\t: GenuineIntel\nphysical id\t: {physical_id}\ncpu cores\t: {cores}\n\n"
        )
    }

    #[test]
    fn parse_single_socket_with_hyperthreading() {
        let content: String = (0..8).map(|p| cpu(p, 0, 4)).collect();
        let info = ProcCpuInfo::parse(&content);
        assert_eq!(info.logical_core_count(), Some(8));
        assert_eq!(info.physical_core_count(), Some(4));
    }

    #[test]
    fn parse_dual_socket() {
        let content: String = (0..16).map(|p| cpu(p, p / 8, 4)).collect();
        let info = ProcCpuInfo::parse(&content);
        assert_eq!(info.logical_core_count(), Some(16));
        assert_eq!(info.physical_core_count(), Some(8));
    }

    #[test]
    fn parse_without_topology() {
        // ARM cpuinfo has no physical id / cpu cores lines.
        let content = "processor\t: 0\nBogoMIPS\t: 48.00\n\nprocessor\t: 1\nBogoMIPS\t: 48.00\n";
        let info = ProcCpuInfo::parse(content);
        assert_eq!(info.logical_core_count(), Some(2));
        assert_eq!(info.physical_core_count(), None);
    }

    #[test]
    fn parse_empty() {
        let info = ProcCpuInfo::parse("");
        assert_eq!(info, ProcCpuInfo::default());
    }
}
