//! # fleetd
//!
//! Command-line entry point for the fleet orchestrator. `validate` checks a
//! configuration directory; `simulate` runs boxes through start, monitoring and stop
//! against the in-process session driver and egress provider.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use fleet_core::config::ConfigManager;
use fleet_core::logging::init_structured_logging;
use fleet_core::orchestration::{FleetOrchestrator, NewBox};
use fleet_core::simulation::{SimulatedEgressProvider, SimulatedSessionDriver};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[derive(Parser)]
#[command(name = "fleetd")]
#[command(about = "Fleet orchestrator daemon")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Configuration directory (default: $FLEET_CONFIG_DIR or ./config)
    #[arg(short, long, global = true)]
    config_dir: Option<PathBuf>,

    /// Environment section to apply (default: $FLEET_ENV or development)
    #[arg(short, long, global = true)]
    env: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load and validate configuration, printing the effective values
    Validate,

    /// Run boxes against simulated upstreams and print status snapshots
    Simulate {
        /// Number of boxes to create
        #[arg(short, long, default_value_t = 1)]
        boxes: u32,

        /// Workers per box (default: fleet.viewers_per_box)
        #[arg(short, long)]
        workers: Option<u32>,

        /// Target stream for every box (default: fleet.default_target)
        #[arg(short, long)]
        target: Option<String>,

        /// Seconds to keep the fleet running before stopping it
        #[arg(long, default_value_t = 30)]
        duration_secs: u64,
    },
}

fn load_config(cli: &Cli) -> Result<Arc<ConfigManager>> {
    let manager = match &cli.env {
        Some(env) => ConfigManager::load_from_directory_with_env(cli.config_dir.clone(), env),
        None => ConfigManager::load_from_directory(cli.config_dir.clone()),
    };
    manager.context("failed to load fleet configuration")
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    if let Some(env) = &cli.env {
        std::env::set_var("FLEET_ENV", env);
    }
    init_structured_logging();

    let manager = load_config(&cli)?;
    match &cli.command {
        Commands::Validate => {
            println!("environment: {}", manager.environment());
            println!("{}", serde_yaml::to_string(manager.config())?);
            Ok(())
        }
        Commands::Simulate {
            boxes,
            workers,
            target,
            duration_secs,
        } => {
            simulate(
                &manager,
                *boxes,
                *workers,
                target.clone(),
                Duration::from_secs(*duration_secs),
            )
            .await
        }
    }
}

async fn simulate(
    manager: &ConfigManager,
    boxes: u32,
    workers: Option<u32>,
    target: Option<String>,
    duration: Duration,
) -> Result<()> {
    let mut config = manager.config().clone();
    config.environment = manager.environment().to_string();
    let target = target
        .or_else(|| config.fleet.default_target.clone())
        .unwrap_or_else(|| "sim://stream/main".to_string());

    let fleet = FleetOrchestrator::from_config(
        config,
        Arc::new(SimulatedSessionDriver::new()),
        Arc::new(SimulatedEgressProvider::new()),
    )
    .await?;
    fleet.start();

    let mut box_ids = Vec::new();
    for n in 0..boxes {
        let created = fleet
            .create_box(NewBox {
                name: format!("sim-box-{n}"),
                egress_profile: "simulated".to_string(),
                worker_count: workers,
                target: Some(target.clone()),
                resource_limits: None,
            })
            .await?;
        fleet.start_box(&created.id).await?;
        box_ids.push(created.id);
    }
    info!(boxes = box_ids.len(), target = %target, "🚀 FLEETD: Simulation started");

    let deadline = tokio::time::Instant::now() + duration;
    let mut ticker = tokio::time::interval(Duration::from_secs(5));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("🛑 FLEETD: Interrupted");
                break;
            }
            _ = tokio::time::sleep_until(deadline) => break,
            _ = ticker.tick() => {
                let status = fleet.status().await?;
                println!("{}", serde_json::to_string(&status)?);
            }
        }
    }

    for box_id in &box_ids {
        let stopped = fleet.stop_box(box_id).await?;
        info!(box_id = %box_id, status = %stopped.status, "🛑 FLEETD: Box stopped");
    }
    fleet.shutdown().await?;
    println!("{}", serde_json::to_string_pretty(&fleet.status().await?)?);
    Ok(())
}
