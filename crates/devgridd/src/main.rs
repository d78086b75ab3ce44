//! devgridd — the DevGrid daemon.
//!
//! Single binary that assembles the orchestration core:
//! - Document store (redb)
//! - Cluster registry + health monitors
//! - Environment orchestrator
//! - Terminal session relay + idle sweep
//! - Metrics sampler
//!
//! # Usage
//!
//! ```text
//! devgridd standalone --data-dir /var/lib/devgrid
//! ```

use devgridd::local;

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::info;

use devgrid_core::DevGridConfig;
use devgrid_orchestrator::RetryPolicy;

#[derive(Parser)]
#[command(name = "devgridd", about = "DevGrid daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run all subsystems in one process with the local cluster driver.
    Standalone {
        /// Data directory for persistent state.
        #[arg(long, default_value = "/var/lib/devgrid")]
        data_dir: PathBuf,

        /// Optional devgrid.toml configuration file.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Shell used by the local driver's exec streams.
        #[arg(long, default_value = "/bin/sh")]
        shell: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,devgridd=debug,devgrid=debug".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Standalone {
            data_dir,
            config,
            shell,
        } => run_standalone(data_dir, config, shell).await,
    }
}

async fn run_standalone(
    data_dir: PathBuf,
    config_path: Option<PathBuf>,
    shell: String,
) -> anyhow::Result<()> {
    info!("DevGrid daemon starting in standalone mode");

    let config = match &config_path {
        Some(path) => DevGridConfig::from_file(path)?,
        None => DevGridConfig::default(),
    };

    std::fs::create_dir_all(&data_dir)?;
    let db_path = data_dir.join("devgrid.redb");

    // ── Initialize subsystems ──────────────────────────────────

    let state = devgrid_state::StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");

    let registry = Arc::new(devgrid_cluster::ClusterRegistry::new(
        state.clone(),
        Arc::new(local::LocalConnector::new(shell)),
        config.unreachable_threshold(),
        config.healthy_threshold(),
    ));
    info!("cluster registry initialized");

    let orchestrator = devgrid_orchestrator::Orchestrator::new(
        state.clone(),
        registry.clone(),
        RetryPolicy::from_config(&config),
        config.provision_poll(),
        config.provision_deadline(),
    );
    info!("orchestrator initialized");

    let relay = devgrid_relay::Relay::new(
        state.clone(),
        registry.clone(),
        orchestrator.clone(),
        config.input_burst(),
        config.input_per_sec(),
        config.idle_timeout(),
    );
    // Orphaned sessions must be reconciled before anything can connect.
    let reconciled = relay.recover()?;
    info!(reconciled, "terminal relay initialized");

    let sampler = devgrid_metrics::MetricsSampler::new(
        state.clone(),
        registry.clone(),
        config.sample_interval(),
        config.retention(),
        config.call_timeout(),
    );
    info!(
        interval_secs = config.sample_interval().as_secs(),
        "metrics sampler initialized"
    );

    let health = devgrid_cluster::HealthMonitor::new(
        registry.clone(),
        config.health_interval(),
        config.health_timeout(),
    );
    health.start_all().await?;
    info!("cluster health monitors started");

    // ── Background loops ───────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let sweep_relay = relay.clone();
    let sweep_interval = config.sweep_interval();
    let sweep_shutdown = shutdown_rx.clone();
    let sweep_handle = tokio::spawn(async move {
        sweep_relay.run_sweep(sweep_interval, sweep_shutdown).await;
    });

    let sampler_shutdown = shutdown_rx.clone();
    let sampler_handle = tokio::spawn(async move {
        sampler.run(sampler_shutdown).await;
    });

    info!("DevGrid daemon running, press ctrl-c to stop");
    tokio::signal::ctrl_c().await?;

    // ── Shutdown ───────────────────────────────────────────────

    info!("shutting down");
    let _ = shutdown_tx.send(true);
    health.stop_all().await;
    let _ = sweep_handle.await;
    let _ = sampler_handle.await;
    info!("DevGrid daemon stopped");
    Ok(())
}
