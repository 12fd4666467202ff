//! twinlink: bridge a fleet of instruments to their cloud twins

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use twinlink_bridge::{logging, BridgeConfig, PlantSimulator};
use twinlink_core::memory::{MemoryCloud, MemoryInstrument};
use twinlink_supervisor::Fleet;

#[derive(Parser)]
#[command(name = "twinlink")]
#[command(about = "Bridge instrument metrics to cloud device twins")]
#[command(version)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, short, default_value = "twinlink.toml")]
    config: PathBuf,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    if cli.json_logs {
        logging::init_json();
    } else {
        logging::init();
    }

    let config = BridgeConfig::from_file(&cli.config)?;
    let fleet_config = config.fleet_config()?;
    info!(
        config = %cli.config.display(),
        devices = fleet_config.devices.len(),
        "configuration loaded"
    );

    let plant = MemoryInstrument::new();
    let cloud = MemoryCloud::new();
    let simulator = PlantSimulator::new(
        plant.clone(),
        config.device_numbers(),
        config.simulation.clone(),
    );

    let fleet = Fleet::start(fleet_config, Arc::new(plant), Arc::new(cloud))
        .await
        .context("fleet failed to start")?;

    let shutdown = CancellationToken::new();
    let simulation = tokio::spawn(simulator.run(shutdown.child_token()));

    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("interrupt received"),
                Err(err) => warn!(error = %err, "cannot listen for interrupt, stopping"),
            }
            shutdown.cancel();
        }
    });

    let stats = fleet.run(shutdown.clone()).await;
    shutdown.cancel();
    if let Err(err) = simulation.await {
        warn!(error = %err, "simulation task failed");
    }

    let total = stats.total();
    info!(
        completed = total.completed,
        failed = total.failed,
        skipped = total.skipped,
        "bridge stopped"
    );
    Ok(())
}
