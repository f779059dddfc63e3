//! Backend assembly from configuration.

use std::sync::Arc;

use anyhow::Context;
use gridfleet_core::config::DockerConfig;
use gridfleet_core::{FleetConfig, HostServerInfo, ProcCpuInfo, StaticHostInfo};
use gridfleet_docker::{DockerEngine, DockerFleet, GridServerDockerAuthority};
use gridfleet_health::ProbeSettings;
use gridfleet_metrics::MetricsRegistry;
use gridfleet_ports::PortAllocator;
use gridfleet_process::{GridServerDeployer, NativeBackend, system_table};
use rand::SeedableRng;
use rand::rngs::StdRng;
use tracing::info;

pub fn native_backend(config: &FleetConfig, metrics: &MetricsRegistry) -> anyhow::Result<NativeBackend> {
    let ports = PortAllocator::from_config(&config.ports, metrics, StdRng::from_os_rng())?;
    let deployer = GridServerDeployer::new(
        &config.native,
        system_table(),
        ports,
        metrics,
        StdRng::from_os_rng(),
        config.native.discover_on_start,
    )
    .context("failed to initialise native deployer")?;
    info!(
        executable = %deployer.executable_path().join(deployer.executable_name()).display(),
        "native backend ready"
    );

    let probe = ProbeSettings::from_config(&config.health)?;
    Ok(NativeBackend::new(Arc::new(deployer), probe))
}

pub async fn docker_backend(
    config: &FleetConfig,
    metrics: &MetricsRegistry,
) -> anyhow::Result<DockerFleet<DockerEngine>> {
    let engine = DockerEngine::connect(&config.docker)
        .await
        .context("no container engine reachable")?;
    info!(endpoint = %engine.endpoint(), "container engine connected");

    let host = host_info(&config.docker);
    let authority = GridServerDockerAuthority::new(
        Arc::new(engine),
        &config.docker,
        host.as_ref(),
        metrics,
        StdRng::from_os_rng(),
    )?;

    let ports = PortAllocator::from_config(&config.ports, metrics, StdRng::from_os_rng())?;
    let probe = ProbeSettings::from_config(&config.health)?;
    Ok(DockerFleet::new(
        Arc::new(authority),
        ports,
        config.docker.clone(),
        probe,
        metrics,
    ))
}

/// Configured core counts when both are set, `/proc/cpuinfo` otherwise.
fn host_info(config: &DockerConfig) -> Box<dyn HostServerInfo> {
    match (config.physical_cores, config.logical_cores) {
        (Some(physical), Some(logical)) => Box::new(StaticHostInfo { physical, logical }),
        _ => Box::new(ProcCpuInfo::read()),
    }
}
