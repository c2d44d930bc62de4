use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tokio::sync::watch;
use tracing::{error, info, warn};

use labs_config::ConfigLoader;
use labs_orchestrator::Orchestrator;

#[derive(Debug, Parser)]
#[command(name = "labsd")]
#[command(about = "Workshop lab provisioning daemon")]
#[command(version)]
struct Args {
    /// Path to labs.yaml
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Run one lifecycle sweep, print its summary and exit
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let loader = match &args.config {
        Some(path) => ConfigLoader::with_path(path.clone()),
        None => ConfigLoader::new(),
    };
    let config = loader.load()?;
    let _log_guard = labs_logging::init_subscriber(&config.logging);

    info!(
        db_path = %config.database.path.display(),
        workspace_dir = %config.provisioning.workspace_dir.display(),
        "starting labsd"
    );

    let orchestrator = Orchestrator::from_config(&config)
        .await
        .context("Failed to initialise orchestrator")?;

    if args.once {
        let summary = orchestrator.process_due_lifecycle_events().await;
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }

    // Nothing else can be running: whatever the store says is running was
    // interrupted by the previous shutdown.
    let requeued = orchestrator.recover_in_flight_tasks().await?;
    if requeued > 0 {
        info!(requeued, "recovered interrupted tasks");
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut handles = orchestrator
        .worker_pool(&config.workers)
        .spawn(shutdown_rx.clone());
    info!(
        provisioning = config.workers.provisioning,
        cleanup = config.workers.cleanup,
        "worker pool started"
    );

    let scheduler = orchestrator.scheduler(config.scheduler.interval());
    handles.push(tokio::spawn(scheduler.run(shutdown_rx)));

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!("shutdown requested, waiting for running tasks");

    if shutdown_tx.send(true).is_err() {
        warn!("no background task was listening for shutdown");
    }
    for handle in handles {
        if let Err(e) = handle.await {
            error!(error = %e, "background task panicked");
        }
    }

    info!("labsd stopped");
    Ok(())
}
