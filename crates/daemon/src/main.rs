//! Fleetrelay Daemon
//!
//! Bridges a RouterOS device fleet to the backend: runs the mesh
//! reconciliation loop and drains the paid-access authorization retry queue.

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use fleetrelay_common::Store;
use fleetrelay_daemon::authorize::Authorizer;
use fleetrelay_daemon::config::RelayConfig;
use fleetrelay_daemon::device::{ApiExecutor, CommandExecutor, DryRunExecutor};
use fleetrelay_daemon::health::HealthTracker;
use fleetrelay_daemon::jobs::{self, JobQueue};
use fleetrelay_daemon::ledger::IdentityLedger;
use fleetrelay_daemon::mesh::WgCli;
use fleetrelay_daemon::metrics::Metrics;
use fleetrelay_daemon::reconciler::Reconciler;

#[derive(Parser)]
#[command(name = "fleetrelayd")]
#[command(about = "Fleetrelay daemon - device fleet reconciliation and paid-access control")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "~/.fleetrelay/config.toml")]
    config: PathBuf,

    /// Store directory
    #[arg(short, long)]
    store: Option<PathBuf>,

    /// Short-circuit device commands to a no-op success
    #[arg(long)]
    dry_run: bool,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

fn expand_home(path: &std::path::Path) -> PathBuf {
    let raw = path.to_string_lossy();
    match raw.strip_prefix("~/") {
        Some(rest) => std::env::var_os("HOME")
            .map(|home| PathBuf::from(home).join(rest))
            .unwrap_or_else(|| PathBuf::from(rest)),
        None => path.to_path_buf(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    info!("fleetrelayd v{}", env!("CARGO_PKG_VERSION"));

    let mut config = RelayConfig::load(&expand_home(&cli.config))?;
    if let Some(store_path) = cli.store {
        config.store_path = store_path;
    }
    if cli.dry_run {
        config.authorize.dry_run = true;
    }
    let config = Arc::new(config);

    tokio::fs::create_dir_all(&config.store_path).await?;
    let store = Store::open(config.db_path())?;
    // the default tenant must exist before the first cycle
    store.default_tenant()?;

    let metrics = Metrics::new();
    let health = HealthTracker::new(metrics.clone());
    let ledger = IdentityLedger::new(store.clone());
    let queue = JobQueue::new(store.clone());

    let executor: Arc<dyn CommandExecutor> = if config.authorize.dry_run {
        info!("device executor in dry-run mode");
        Arc::new(DryRunExecutor)
    } else {
        Arc::new(ApiExecutor)
    };

    let authorizer = Arc::new(Authorizer::new(
        config.clone(),
        ledger,
        health,
        queue.clone(),
        executor,
        metrics.clone(),
    ));

    let mesh = Arc::new(WgCli::new(config.mesh.interface.clone()));
    let reconciler = Reconciler::new(config.clone(), store, mesh, metrics);
    let reconciler_handle = tokio::spawn(async move { reconciler.run().await });

    let runner_handle = if config.authorize.job_runner_enabled {
        Some(tokio::spawn(jobs::run_job_loop(
            queue,
            authorizer.clone(),
            config.authorize.job_poll_ms,
        )))
    } else {
        info!("job runner disabled");
        None
    };

    info!(devices = config.devices.len(), "daemon started");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("received shutdown signal");
        }
        result = reconciler_handle => {
            if let Err(e) = result {
                tracing::error!("reconciler error: {}", e);
            }
        }
    }

    if let Some(handle) = runner_handle {
        handle.abort();
    }

    info!("daemon shutdown complete");
    Ok(())
}
