//! # Switchboard - Mesh Runner
//!
//! Entry point of the `switchboard` binary.
//!
//! ## Startup Sequence
//!
//! 1. **Configuration** - Load and validate the TOML file, apply overrides
//! 2. **Mesh** - Build every component on one event bus
//! 3. **Restore** - Pre-seed registry and routes from snapshots, if any
//! 4. **Background loops** - Reply pump, inbound events, health, optimizer, snapshots
//!
//! ## Shutdown
//!
//! Ctrl+C stops every loop, cancels scheduled retries and writes final
//! snapshots before exiting.

#![forbid(unsafe_code)]
#![forbid(clippy::unwrap_used)]
#![forbid(clippy::panic)]
#![deny(clippy::expect_used)]

use std::path::PathBuf;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use switchboard::cli::{Cli, Commands};
use switchboard_mesh::balancer::available_strategies;
use switchboard_mesh::{Mesh, MeshConfig};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();

    match cli.command {
        Commands::Run {
            config,
            snapshot_dir,
            no_restore,
        } => run(config, snapshot_dir, no_restore).await,
        Commands::CheckConfig { config, print } => check_config(config, print).await,
        Commands::DefaultConfig => {
            let rendered = MeshConfig::default()
                .to_toml_string()
                .context("Failed to render default configuration")?;
            println!("{rendered}");
            Ok(())
        }
        Commands::Strategies => {
            available_strategies()
                .iter()
                .for_each(|name| println!("{name}"));
            Ok(())
        }
    }
}

/// Initialize tracing subscriber with environment filter.
fn init_tracing() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn load_config(path: Option<PathBuf>) -> Result<MeshConfig> {
    match path {
        Some(path) => MeshConfig::load(&path)
            .await
            .with_context(|| format!("Failed to load configuration from {}", path.display())),
        None => Ok(MeshConfig::default()),
    }
}

async fn run(config: Option<PathBuf>, snapshot_dir: Option<PathBuf>, no_restore: bool) -> Result<()> {
    let start_time = Instant::now();
    info!("Switchboard starting...");

    let mut config = load_config(config).await?;
    if let Some(dir) = snapshot_dir {
        config.persistence.directory = Some(dir);
    }

    let mesh = Mesh::new(config).context("Failed to build the mesh")?;

    if no_restore {
        info!("Snapshot restore skipped");
    } else {
        match mesh.restore().await {
            Ok(Some(report)) => info!(
                agents = report.agents,
                routes = report.routes,
                "Restored previous state"
            ),
            Ok(None) => info!("No previous state to restore"),
            // A lost snapshot only costs warm-up.
            Err(e) => warn!(error = %e, "Snapshot restore failed; starting empty"),
        }
    }

    mesh.start().await;
    info!(
        strategy = %mesh.config().balancer.strategy,
        "Switchboard started in {:?}",
        start_time.elapsed()
    );

    info!("Switchboard is running. Press Ctrl+C to stop.");
    wait_for_shutdown().await;

    let stats = mesh.stats().await;
    mesh.shutdown().await;
    match serde_json::to_string(&stats) {
        Ok(json) => info!(stats = %json, "Switchboard stopped gracefully"),
        Err(e) => warn!(error = %e, "Switchboard stopped; stats unavailable"),
    }
    Ok(())
}

async fn check_config(path: PathBuf, print: bool) -> Result<()> {
    let config = load_config(Some(path.clone())).await?;
    println!("{}: valid", path.display());
    if print {
        let rendered = config
            .to_toml_string()
            .context("Failed to render configuration")?;
        println!("{rendered}");
    }
    Ok(())
}

/// Wait for shutdown signal (Ctrl+C).
async fn wait_for_shutdown() {
    match signal::ctrl_c().await {
        Ok(()) => info!("Received Ctrl+C, initiating graceful shutdown"),
        Err(err) => error!("Failed to listen for shutdown signal: {}", err),
    }
}
