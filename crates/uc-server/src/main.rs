//! Unfolded Circle remote bridge
//!
//! Usage: `uc-bridge [CONFIG_DIR]`. The config directory defaults to
//! `$UC_BRIDGE_CONFIG` and then to the working directory.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use uc_bridge::selection::SelectionTiming;
use uc_bridge::{start_server, BridgeState, Integration, RemoteCoordinator};
use uc_config::BridgeConfig;
use uc_core::Context;
use uc_hass::{EventBus, StateStore};

fn config_dir() -> PathBuf {
    std::env::args_os()
        .nth(1)
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("UC_BRIDGE_CONFIG").map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("."))
}

#[tokio::main]
async fn main() -> Result<()> {
    let config_dir = config_dir();
    let config = BridgeConfig::load(&config_dir)
        .with_context(|| format!("loading configuration from {}", config_dir.display()))?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();

    info!(config_dir = %config_dir.display(), "Starting Unfolded Circle bridge");

    let bus = Arc::new(EventBus::new());
    let states = Arc::new(StateStore::new(bus));
    for seed in &config.entities {
        states.set(
            seed.entity_id.clone(),
            seed.state.clone(),
            seed.attributes.clone(),
            Context::new(),
        );
    }

    let mut remotes = Vec::with_capacity(config.remotes.len());
    for settings in &config.remotes {
        let coordinator = RemoteCoordinator::from_settings(settings)
            .with_context(|| format!("setting up remote {}", settings.host))?;
        if coordinator.socket().is_none() {
            warn!(remote = coordinator.name(), "No API key configured, remote updates disabled");
        }
        remotes.push(Arc::new(coordinator));
    }

    let integration = Arc::new(Integration::new(
        states,
        remotes,
        SelectionTiming::from(&config.selection),
    ));
    integration.setup();

    let state = BridgeState::new(integration.clone(), config.server.access_tokens.clone());
    let listen = config.server.listen;
    let server = tokio::spawn(async move { start_server(state, listen).await });

    tokio::select! {
        result = server => {
            result.context("server task failed")?.context("server stopped")?;
        }
        signal = tokio::signal::ctrl_c() => {
            signal?;
            info!("Shutting down...");
        }
    }

    let closed = integration.unload();
    info!(subscriptions = closed, "Bridge stopped");
    Ok(())
}
