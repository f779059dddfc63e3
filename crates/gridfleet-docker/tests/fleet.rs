//! Container fleet lifecycle against the in-memory engine.

mod support;

use std::sync::Arc;
use std::time::Duration;

use gridfleet_core::config::DockerConfig;
use gridfleet_core::{
    FleetError, GridServerBackend, InstanceId, LifecycleState, ProvisionRequest, ResourceJob,
};
use gridfleet_docker::models::HostConfig;
use gridfleet_docker::{DockerFleet, GridServerDockerContainer};
use gridfleet_metrics::MetricsRegistry;
use gridfleet_ports::PortAllocator;
use rand::SeedableRng;
use rand::rngs::StdRng;

use support::{FakeEngine, authority, docker_config, free_port, probe};

fn fleet(engine: Arc<FakeEngine>, config: DockerConfig, metrics: &MetricsRegistry) -> DockerFleet<FakeEngine> {
    let ports = PortAllocator::with_probe(
        1024..65535,
        100,
        Duration::ZERO,
        metrics,
        StdRng::seed_from_u64(11),
        |_port: u16| false,
    )
    .unwrap();
    let authority = authority(engine, &config, metrics);
    DockerFleet::new(authority, ports, config, probe(), metrics)
}

#[tokio::test]
async fn provision_builds_image_and_waits_for_listener() {
    let engine = FakeEngine::new();
    engine.state().listen_on_start = true;
    let metrics = MetricsRegistry::with_machine("test");
    let fleet = fleet(engine.clone(), docker_config(), &metrics);

    let port = free_port();
    let info = fleet.provision(ProvisionRequest::on_port(port)).await.unwrap();

    assert_eq!(info.endpoint.port(), port);
    assert_eq!(info.state, LifecycleState::Running);
    assert_eq!(info.version.as_deref(), Some("1.0"));
    assert!(info.name.starts_with("grid-server-") && info.name.ends_with("-gr"));
    assert_eq!(engine.calls("commit"), 1);
    assert_eq!(engine.calls("start"), 1);
    assert!(fleet.ports().is_allocated(port));
    assert_eq!(metrics.counters("GridServerDockerFleet").successes(), 1);

    {
        let state = engine.state();
        let created = &state.containers[0];
        assert!(created.env.contains(&format!("PORT={port}")));
        assert!(created.env.contains(&"SETTINGS_KEY=settings".to_string()));
        assert_eq!(created.labels["port"], port.to_string());
        assert_eq!(created.labels["image_name"], "grid-server");
        assert_eq!(created.labels["grid_server_version"], "1.0");
        assert_eq!(created.host_config.network_mode, "host");
        assert_eq!(created.image, "grid-server:1.0");
    }

    assert!(fleet.terminate(&info.id).await.unwrap());
    assert_eq!(engine.container_count(), 0);
    assert!(!fleet.ports().is_allocated(port));
    assert!(fleet.instances().await.is_empty());
    assert!(!fleet.terminate(&info.id).await.unwrap());
}

#[tokio::test]
async fn existing_image_is_not_recommitted() {
    let engine = FakeEngine::new();
    engine.add_image("grid-server:1.0");
    engine.state().listen_on_start = true;
    let metrics = MetricsRegistry::with_machine("test");
    let fleet = fleet(engine.clone(), docker_config(), &metrics);

    fleet.provision(ProvisionRequest::on_port(free_port())).await.unwrap();
    assert_eq!(engine.calls("commit"), 0);
    assert_eq!(fleet.terminate_all().await.unwrap(), 1);
}

#[tokio::test]
async fn container_exiting_during_startup_is_cleaned_up() {
    let engine = FakeEngine::new();
    engine.add_image("grid-server:1.0");
    engine.state().exit_on_start = true;
    let metrics = MetricsRegistry::with_machine("test");
    let fleet = fleet(engine.clone(), docker_config(), &metrics);

    let port = free_port();
    let err = fleet
        .provision(ProvisionRequest::on_port(port))
        .await
        .unwrap_err();
    assert!(matches!(err, FleetError::InstanceExited(_)));
    assert!(fleet.instances().await.is_empty());
    assert_eq!(engine.container_count(), 0);
    assert!(!fleet.ports().is_allocated(port));
    assert_eq!(metrics.counters("GridServerDockerFleet").failures(), 1);
}

#[tokio::test]
async fn teardown_during_image_build_leaves_nothing_running() {
    let engine = FakeEngine::new();
    {
        let mut state = engine.state();
        state.commit_failures = 2;
        state.listen_on_start = true;
    }
    let metrics = MetricsRegistry::with_machine("test");
    let fleet = fleet(engine.clone(), docker_config(), &metrics);

    let port = free_port();
    let (provisioned, removed) = tokio::join!(
        fleet.provision(ProvisionRequest::on_port(port)),
        async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            fleet.terminate_all().await.unwrap()
        }
    );

    assert_eq!(removed, 1);
    assert!(matches!(provisioned, Err(FleetError::InvalidOperation(_))));
    assert_eq!(engine.calls("create"), 0);
    assert_eq!(engine.container_count(), 0);
    assert!(fleet.containers().is_empty());
    assert!(!fleet.ports().is_allocated(port));
    assert_eq!(metrics.counters("GridServerDockerFleet").failures(), 1);
}

#[tokio::test]
async fn disposed_record_refuses_to_start() {
    let engine = FakeEngine::new();
    engine.add_image("grid-server:1.0");
    engine.state().listen_on_start = true;
    let config = docker_config();
    let metrics = MetricsRegistry::with_machine("test");
    let fleet = fleet(engine.clone(), config.clone(), &metrics);

    let lease = fleet.ports().claim(free_port()).unwrap();
    let container = GridServerDockerContainer::new(fleet.authority().clone(), &config, lease).unwrap();
    assert!(container.dispose().await);
    assert!(container.is_disposed());

    let err = container.start(&probe()).await.unwrap_err();
    assert!(matches!(err, gridfleet_docker::DockerError::Disposed(_)));
    assert_eq!(engine.calls("create"), 0);
    assert_eq!(container.state(), LifecycleState::Removed);
}

#[tokio::test]
async fn failed_start_releases_everything() {
    let engine = FakeEngine::new();
    engine.add_image("grid-server:1.0");
    engine.state().fail_start = true;
    let metrics = MetricsRegistry::with_machine("test");
    let fleet = fleet(engine.clone(), docker_config(), &metrics);

    let err = fleet.provision(ProvisionRequest::default()).await.unwrap_err();
    assert!(matches!(err, FleetError::Engine(_)));
    assert_eq!(engine.container_count(), 0);
    assert!(fleet.ports().allocated_ports().is_empty());
}

#[tokio::test]
async fn missing_settings_key_is_an_invalid_operation() {
    let engine = FakeEngine::new();
    let mut config = docker_config();
    config.settings_key = None;
    let metrics = MetricsRegistry::with_machine("test");
    let fleet = fleet(engine.clone(), config, &metrics);

    let err = fleet.provision(ProvisionRequest::default()).await.unwrap_err();
    assert!(matches!(err, FleetError::InvalidOperation(_)));
    assert_eq!(engine.calls("create"), 0);
    assert!(fleet.ports().allocated_ports().is_empty());
}

#[tokio::test]
async fn container_parameters_follow_configuration() {
    let engine = FakeEngine::new();
    let mut config = docker_config();
    config.reserved_cores_per_instance = Some(1.0);
    config.max_memory_bytes = 256 * 1024 * 1024;
    config.max_threads = 8;
    config.http_access_key = Some("access".to_string());
    config.mount_path_override = Some("/mnt/grid".to_string());
    config.primary_dns_server = Some("10.0.0.2".to_string());
    config.environment.insert("REGION".to_string(), "eu".to_string());
    let metrics = MetricsRegistry::with_machine("test");
    let fleet = fleet(engine, config.clone(), &metrics);

    let lease = fleet.ports().claim(45123).unwrap();
    let container = GridServerDockerContainer::new(fleet.authority().clone(), &config, lease).unwrap();
    let params = container.parameters();

    assert!(params.env.contains(&"MAXIMUM_THREADS=8".to_string()));
    assert!(params.env.contains(&"MAXIMUM_MEMORY=256".to_string()));
    assert!(params.env.contains(&"HTTP_ACCESS_KEY=access".to_string()));
    assert!(params.env.contains(&"REGION=eu".to_string()));
    assert_eq!(params.host_config.cpu_period, Some(100_000));
    assert_eq!(params.host_config.cpu_quota, Some(200_000));
    assert_eq!(params.host_config.memory, 256 * 1024 * 1024);
    assert_eq!(params.host_config.dns, vec!["10.0.0.2".to_string()]);
    assert_eq!(params.host_config.mounts[0].source, "/mnt/grid/logs");
    assert_eq!(params.host_config.mounts[1].source, "/mnt/grid/internalscripts");
    assert!(params.host_config.mounts[2].read_only);
    assert_eq!(params.host_config.ulimits[1].hard, 8192);
    assert_eq!(container.resources().cpu_quota, 200_000);
    assert_eq!(container.state(), LifecycleState::Starting);
    assert_eq!(container.id(), None);

    assert!(container.dispose().await);
    assert!(!fleet.ports().is_allocated(45123));
    assert_eq!(container.state(), LifecycleState::Removed);
}

#[tokio::test]
async fn discover_adopts_running_containers_once() {
    let engine = FakeEngine::new();
    let host_config = HostConfig {
        cpu_period: Some(100_000),
        cpu_quota: Some(400_000),
        memory: 512 * 1024 * 1024,
        ..HostConfig::default()
    };
    engine.add_running(
        "c9",
        "grid-server-old-gr",
        &[("port", "45600"), ("grid_server_version", "0.9"), ("image_name", "grid-server")],
        host_config,
    );
    engine.add_running(
        "c10",
        "grid-server-other-gr",
        &[("port", "45601"), ("image_name", "another-image")],
        HostConfig::default(),
    );
    let metrics = MetricsRegistry::with_machine("test");
    let fleet = fleet(engine.clone(), docker_config(), &metrics);

    let adopted = fleet.discover().await.unwrap();
    assert_eq!(adopted.len(), 1);
    assert_eq!(adopted[0].id, InstanceId::Container("c9".to_string()));
    assert_eq!(adopted[0].name, "grid-server-old-gr");
    assert_eq!(adopted[0].version.as_deref(), Some("0.9"));
    assert!(fleet.ports().is_allocated(45600));

    let container = fleet.get_container("grid-server-old-gr").unwrap();
    assert_eq!(container.resources().cpu_quota, 400_000);
    assert_eq!(container.resources().memory_bytes, 512 * 1024 * 1024);

    assert!(fleet.discover().await.unwrap().is_empty());
    assert_eq!(fleet.instances().await.len(), 1);
}

#[tokio::test]
async fn update_resources_records_new_limits() {
    let engine = FakeEngine::new();
    engine.add_running(
        "c9",
        "grid-server-old-gr",
        &[("port", "45600"), ("image_name", "grid-server")],
        HostConfig::default(),
    );
    let metrics = MetricsRegistry::with_machine("test");
    let fleet = fleet(engine.clone(), docker_config(), &metrics);
    fleet.discover().await.unwrap();

    assert!(fleet.update_resources(&ResourceJob::new("c9", 2.0, 1024)).await.unwrap());
    let container = fleet.get_container("c9").unwrap();
    assert_eq!(container.resources().cpu_quota, 400_000);
    assert_eq!(container.resources().memory_bytes, 1024 * 1024 * 1024);

    engine.state().fail_update = true;
    assert!(!fleet.update_resources(&ResourceJob::new("c9", 1.0, 64)).await.unwrap());
    assert!(matches!(
        fleet.update_resources(&ResourceJob::new("", 1.0, 64)).await,
        Err(FleetError::InvalidArgument(_))
    ));
}

#[tokio::test]
async fn native_ids_are_not_containers() {
    let engine = FakeEngine::new();
    let metrics = MetricsRegistry::with_machine("test");
    let fleet = fleet(engine, docker_config(), &metrics);
    assert!(!fleet.terminate(&InstanceId::Process(42)).await.unwrap());
}
