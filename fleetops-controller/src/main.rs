//! Fleetops Controller
//!
//! Runs the batch operation control loop against an in-memory resource
//! store, optionally seeded from a JSON snapshot, and reaches nodes over ssh.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::Path;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use fleetops_controller::remote::SshShell;
use fleetops_controller::store::InMemoryStore;
use fleetops_controller::{Controller, ControllerConfig};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "fleetops_controller=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Fleetops Controller");

    let config = ControllerConfig::parse();
    config.validate()?;
    info!(
        "Loaded configuration: controller_id={}, workers={}, ssh_user={}",
        config.controller_id, config.workers, config.ssh_user
    );

    let store = match &config.state_file {
        Some(path) => load_store(path)?,
        None => {
            info!("No state file given, starting with an empty store");
            InMemoryStore::new()
        }
    };

    let shell = Arc::new(SshShell::new(config.ssh_options()));
    let controller = Arc::new(Controller::new(config, Arc::new(store), shell));

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for shutdown signal: {}", e);
        }
    };
    if let Err(e) = controller.run(shutdown).await {
        error!("Controller error: {}", e);
        return Err(e.into());
    }

    info!("Controller stopped");
    Ok(())
}

/// Seeds the store from a JSON snapshot
fn load_store(path: &Path) -> Result<InMemoryStore> {
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read state file {}", path.display()))?;
    let store = InMemoryStore::from_json(&json)
        .with_context(|| format!("Failed to parse state file {}", path.display()))?;
    info!("Loaded store snapshot from {}", path.display());
    Ok(store)
}
