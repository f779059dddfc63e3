//! gridfleetd: the grid server fleet daemon.
//!
//! Assembles one execution backend from `gridfleet.toml`:
//! - Port allocator
//! - Native process backend (process table, deployer) or
//!   container backend (engine client, authority, fleet)
//! - Health probe settings
//! - Operation counters
//!
//! # Usage
//!
//! ```text
//! gridfleetd --config /etc/gridfleet.toml provision --count 4
//! gridfleetd --backend native run --count 8
//! ```

mod commands;
mod setup;

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use gridfleet_core::FleetConfig;
use gridfleet_metrics::MetricsRegistry;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "gridfleetd", about = "Grid server fleet daemon")]
struct Cli {
    /// Path to gridfleet.toml. Defaults apply when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Execution backend.
    #[arg(long, value_enum, global = true, default_value_t = BackendKind::for_host())]
    backend: BackendKind,

    /// Emit logs as JSON.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum BackendKind {
    Native,
    Docker,
}

impl BackendKind {
    /// Native processes on Windows hosts, containers elsewhere.
    fn for_host() -> Self {
        if cfg!(windows) {
            BackendKind::Native
        } else {
            BackendKind::Docker
        }
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start grid servers and wait until they accept connections.
    Provision {
        #[arg(long, default_value = "1")]
        count: usize,
    },

    /// Adopt grid servers left running by a previous run.
    Discover,

    /// Stop every grid server this backend knows about.
    KillAll,

    /// Keep a pool running until Ctrl-C, then tear it down.
    Run {
        #[arg(long, default_value = "1")]
        count: usize,

        /// Counter report interval in seconds.
        #[arg(long, default_value = "60")]
        metrics_interval: u64,
    },

    /// Change the CPU/memory budget of a running container.
    UpdateResources {
        /// Container id or name.
        #[arg(long)]
        instance: String,

        /// Physical cores; 0 removes the CPU limit.
        #[arg(long)]
        cores: f64,

        #[arg(long)]
        memory_mb: i64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,gridfleet=debug"));
    if cli.json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let config = match &cli.config {
        Some(path) => FleetConfig::from_file(path)?,
        None => {
            let config = FleetConfig::default();
            config.validate()?;
            config
        }
    };

    let metrics = Arc::new(MetricsRegistry::new());
    info!(backend = ?cli.backend, machine = metrics.machine(), "gridfleet daemon starting");

    match cli.backend {
        BackendKind::Native => {
            let backend = setup::native_backend(&config, &metrics)?;
            commands::execute(&backend, cli.command, metrics).await
        }
        BackendKind::Docker => {
            let backend = setup::docker_backend(&config, &metrics).await?;
            commands::execute(&backend, cli.command, metrics).await
        }
    }
}
