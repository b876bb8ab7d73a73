//! Civ bridge server binary
//!
//! Connects to the native game process over its named pipe, keeps the
//! connection alive and logs the game events it receives until Ctrl-C.

use anyhow::Result;
use civ_bridge::{BridgeConfig, BridgeServices};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::sleep;
use tracing::{debug, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let mut config = BridgeConfig::from_env();
    if let Some(pipe_name) = std::env::args().nth(1) {
        config.pipe_name = pipe_name;
    }

    info!("Civ bridge starting");
    info!("Pipe name: {}", config.pipe_name);

    let services = BridgeServices::new(config);
    let mut events = services.subscribe_events();

    let connected = async {
        loop {
            match services.connect().await {
                Ok(()) => break,
                Err(e) => {
                    info!("Waiting for native process... ({})", e);
                    sleep(Duration::from_secs(2)).await;
                }
            }
        }
    };
    tokio::select! {
        _ = connected => {}
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted before the native process came up");
            services.shutdown().await;
            return Ok(());
        }
    }

    let health = services.health();
    info!(
        "Bridge ready: {} ({} Lua function(s) announced)",
        health.connection.endpoint, health.lua_functions
    );

    loop {
        tokio::select! {
            batch = events.recv() => match batch {
                Ok(batch) => {
                    for event in &batch.events {
                        debug!("Game event {} {}", event.event, event.payload);
                    }
                    info!("Delivered batch of {} event(s)", batch.len());
                }
                Err(RecvError::Lagged(skipped)) => warn!("Event log fell behind by {} batch(es)", skipped),
                Err(RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    services.shutdown().await;
    info!("Civ bridge shutting down");
    Ok(())
}
