//! RS-485 Modbus switch bridge.
//!
//! Polls relay and sensor boards on serial buses and exposes them as
//! switches and sensors over Zenoh.

use anyhow::{Context, Result};
use clap::Parser;
use modbus_sw::bridge;
use modbus_sw::config::ModbusSwConfig;
use modbus_sw::registry::Registry;
use modbus_sw::transport::{BusTransport, RtuTransport, SerialSettings};
use modbus_sw_common::{KeyExprBuilder, LoggingConfig};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tracing::{error, info};

/// Modbus RTU switch/sensor bridge.
#[derive(Parser, Debug)]
#[command(name = "modbus-sw")]
#[command(about = "Exposes RS-485 Modbus relay boards as switches and sensors over Zenoh")]
#[command(version)]
struct Args {
    /// Path to configuration file (JSON5 format)
    #[arg(short, long, default_value = "modbus-sw.json5")]
    config: PathBuf,

    /// Override log level (trace, debug, info, warn, error).
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = ModbusSwConfig::load_from_file(&args.config)
        .with_context(|| format!("Failed to load config from {:?}", args.config))?;

    let log_config = LoggingConfig {
        level: args
            .log_level
            .clone()
            .unwrap_or_else(|| config.logging.level.clone()),
        format: config.logging.format,
    };
    modbus_sw_common::init_tracing(&log_config)
        .map_err(|e| anyhow::anyhow!("Failed to init tracing: {}", e))?;

    info!("Starting modbus-sw");
    info!("Loaded configuration from {:?}", args.config);

    // Bus side: one scheduler per port
    let runtime = Handle::current();
    let registry = Registry::build(&config, |port| {
        Box::new(RtuTransport::new(SerialSettings::from(port), runtime.clone()))
            as Box<dyn BusTransport>
    })?;
    registry
        .connect_all()
        .await
        .context("Failed to open serial ports")?;
    let registry = Arc::new(registry);

    // Host side
    let session = modbus_sw_common::connect(&config.zenoh)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to connect to Zenoh: {}", e))?;
    let keys = KeyExprBuilder::new(&config.key_prefix);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let (publisher, states) = bridge::state_channel();
    let forwarder = tokio::spawn(bridge::forward_states(
        session.clone(),
        keys.clone(),
        config.serialization,
        states,
        shutdown_rx.clone(),
    ));

    let registered = registry.register_all(Arc::new(publisher));
    info!(entities = registered, "Entities registered");
    if registry.has_coils() {
        info!("Switch platform enabled");
    }
    if registry.has_inputs() {
        info!("Sensor platform enabled");
    }

    let commands = tokio::spawn(bridge::serve_commands(
        session.clone(),
        keys.clone(),
        Arc::clone(&registry),
        shutdown_rx,
    ));

    let status_key = keys.status_key();
    let status = bridge::bridge_status(&registry, "running");
    if let Err(e) = session.put(&status_key, status.to_string()).await {
        error!("Failed to publish bridge status: {}", e);
    }

    let polls = registry.start_polling(config.poll.interval(), config.poll.run_immediately);
    info!(polls, "modbus-sw running");

    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal");

    registry.stop_polling().await;
    let _ = shutdown_tx.send(true);

    match commands.await {
        Ok(Err(e)) => error!("Command handler failed: {}", e),
        Err(e) => error!("Command handler task failed: {}", e),
        Ok(Ok(())) => {}
    }
    let _ = forwarder.await;

    let status = bridge::bridge_status(&registry, "offline");
    let _ = session.put(&status_key, status.to_string()).await;

    session
        .close()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to close Zenoh session: {}", e))?;
    info!("modbus-sw stopped");

    Ok(())
}
