//! Subcommands, written once against [`GridServerBackend`].

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use gridfleet_core::{GridServerBackend, InstanceInfo, ProvisionRequest, ResourceJob};
use gridfleet_metrics::{MetricsRegistry, render_prometheus};
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::Command;

pub async fn execute<B: GridServerBackend>(
    backend: &B,
    command: Command,
    metrics: Arc<MetricsRegistry>,
) -> anyhow::Result<()> {
    match command {
        Command::Provision { count } => {
            let started = provision(backend, count).await;
            print_instances(&started);
            if started.len() < count {
                anyhow::bail!("{} of {count} grid servers failed to start", count - started.len());
            }
            Ok(())
        }
        Command::Discover => {
            let adopted = backend.discover().await?;
            info!(backend = backend.name(), count = adopted.len(), "discovery finished");
            print_instances(&adopted);
            Ok(())
        }
        Command::KillAll => {
            backend.discover().await?;
            let stopped = backend.terminate_all().await?;
            info!(backend = backend.name(), stopped, "all grid servers stopped");
            Ok(())
        }
        Command::Run {
            count,
            metrics_interval,
        } => run(backend, count, Duration::from_secs(metrics_interval), metrics).await,
        Command::UpdateResources {
            instance,
            cores,
            memory_mb,
        } => {
            backend.discover().await?;
            let job = ResourceJob::new(instance, cores, memory_mb);
            if backend.update_resources(&job).await? {
                info!(container = %job.container_id, cores, memory_mb, "resources updated");
                Ok(())
            } else {
                anyhow::bail!("engine rejected the resource update for {}", job.container_id)
            }
        }
    }
}

/// Start `count` grid servers concurrently. Failures are logged and
/// left out of the result.
async fn provision<B: GridServerBackend>(backend: &B, count: usize) -> Vec<InstanceInfo> {
    let attempts = (0..count).map(|_| backend.provision(ProvisionRequest::default()));
    let mut started = Vec::with_capacity(count);
    for result in join_all(attempts).await {
        match result {
            Ok(info) => started.push(info),
            Err(e) => error!(backend = backend.name(), error = %e, "failed to provision grid server"),
        }
    }
    started
}

async fn run<B: GridServerBackend>(
    backend: &B,
    count: usize,
    interval: Duration,
    metrics: Arc<MetricsRegistry>,
) -> anyhow::Result<()> {
    let adopted = backend.discover().await?;
    if !adopted.is_empty() {
        info!(count = adopted.len(), "adopted running grid servers");
    }

    let missing = count.saturating_sub(adopted.len());
    let started = provision(backend, missing).await;
    info!(
        backend = backend.name(),
        running = adopted.len() + started.len(),
        requested = count,
        "grid server pool up"
    );

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let reporter = metrics.clone();
    let metrics_handle = tokio::spawn(async move {
        reporter.run(interval, shutdown_rx).await;
    });

    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let instances = backend.instances().await;
                info!(instances = instances.len(), "pool status");
            }
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    warn!(error = %e, "cannot listen for Ctrl-C, shutting down");
                }
                info!("shutdown signal received");
                break;
            }
        }
    }

    let _ = shutdown_tx.send(true);
    let stopped = backend.terminate_all().await?;
    info!(stopped, "grid server pool torn down");
    let _ = metrics_handle.await;

    print!("{}", render_prometheus(&metrics.snapshot()));
    Ok(())
}

fn print_instances(instances: &[InstanceInfo]) {
    for instance in instances {
        println!("{instance}");
    }
}
