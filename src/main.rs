mod agent;
mod connection;
mod hardware;
mod telemetry;

use agent::{
    handle_reboot, Agent, ConnectionSink, REBOOT_COMMAND, TARGET_TEMPERATURE, THERMOSTAT_COMPONENT,
};
use anyhow::Result;
use connection::{ConnectionConfig, ConnectionEvent, ConnectionManager};
use hardware::{FirmwareInstaller, Thermostat};
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Duration;
use twinlink_engine::{Bounds, CommandClient, CommandDispatcher, PropertyRouter, SetpointReconciler};

use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Writable range for the thermostat setpoint
const MIN_TEMPERATURE: f64 = -15.0;
const MAX_TEMPERATURE: f64 = 33.5;

const INITIAL_TARGET: f64 = 22.0;
const INITIAL_AMBIENT: f64 = 18.0;
const INSTALLED_FIRMWARE: &str = "2.0.0";

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let mut config = ConnectionConfig::default();
    if let Ok(addr) = std::env::var("TWINLINK_HUB_ADDR") {
        config.hub_addr = addr;
    }
    if let Ok(device_id) = std::env::var("TWINLINK_DEVICE_ID") {
        config.device_id = device_id;
    }

    info!("Device agent starting: {}", config.device_id);
    info!("  hub: {}", config.hub_addr);

    let mut conn = ConnectionManager::new(config.clone());

    // Simulated hardware behind the twin
    let thermostat = Arc::new(Thermostat::new(INITIAL_TARGET, INITIAL_AMBIENT));
    let firmware = Arc::new(FirmwareInstaller::new(INSTALLED_FIRMWARE));

    // Writable properties
    let bounds = Bounds::new(MIN_TEMPERATURE, MAX_TEMPERATURE)?;
    let reconciler = SetpointReconciler::new(bounds, INITIAL_TARGET, thermostat.clone());
    let mut router = PropertyRouter::new();
    router.register(THERMOSTAT_COMPONENT, TARGET_TEMPERATURE, Arc::new(reconciler));

    // Hub-issued commands
    let dispatcher = Arc::new(CommandDispatcher::new());
    dispatcher
        .register(THERMOSTAT_COMPONENT, REBOOT_COMMAND, handle_reboot)
        .await;
    info!("Command handlers registered");

    // Device-issued commands (shares sequence_id with every other sender)
    let sequence_id = Arc::new(AtomicU64::new(0));
    let sink = ConnectionSink::new(config.device_id.clone(), sequence_id.clone(), conn.sender());
    let commands = Arc::new(CommandClient::new(Arc::new(sink)));

    let agent = Arc::new(Agent::new(
        config.device_id.clone(),
        sequence_id.clone(),
        conn.sender(),
        router,
        dispatcher,
        commands.clone(),
        firmware,
    ));

    // Spawn telemetry streaming task
    tokio::spawn(telemetry::run_telemetry_loop(
        config.device_id.clone(),
        thermostat.clone(),
        sequence_id.clone(),
        conn.sender(),
    ));

    // Spawn sweep for command entries orphaned by cancelled callers
    let sweep = commands.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(5));
        loop {
            ticker.tick().await;
            let dropped = sweep.discard_expired().await;
            if dropped > 0 {
                warn!(dropped, "discarded expired command entries");
            }
        }
    });

    // Main event loop
    loop {
        match conn.recv().await {
            Some(ConnectionEvent::Connected) => {
                info!("Connected to hub");
                if let Err(e) = agent.report_identity().await {
                    error!("Failed to report identity: {}", e);
                }
            }
            Some(ConnectionEvent::Disconnected { reason }) => {
                warn!("Disconnected: {}", reason);
            }
            Some(ConnectionEvent::Received(envelope)) => {
                agent.handle_hub_message(envelope).await;
            }
            None => {
                error!("Connection manager closed");
                break;
            }
        }
    }

    Ok(())
}
