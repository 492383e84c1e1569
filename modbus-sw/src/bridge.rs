//! Zenoh side of the bridge: state publishing and switch commands.
//!
//! Entities publish into an unbounded channel from the bus worker; a task
//! drains it and puts every state on `<prefix>/<port>/<slave>/<kind><address>`.
//! Switch commands arrive on `<prefix>/<port>/<slave>/coil<address>/set`.

use crate::entity::StatePublisher;
use crate::registry::Registry;
use crate::scheduler::SchedulerError;
use modbus_sw_common::{EntityKind, EntityState, Format, KeyExprBuilder, SwitchCommand, encode};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, trace, warn};
use zenoh::Session;
use zenoh::sample::SampleKind;

/// Errors raised while handling a host command.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("Not a command key: {0}")]
    NotACommand(String),
    #[error("Invalid command payload: {0}")]
    Payload(#[from] modbus_sw_common::Error),
    #[error("No coil at {0}")]
    UnknownCoil(String),
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
    #[error("Zenoh error: {0}")]
    Zenoh(String),
}

/// [`StatePublisher`] that hands states to the Zenoh publishing task.
#[derive(Debug, Clone)]
pub struct ChannelPublisher {
    tx: mpsc::UnboundedSender<EntityState>,
}

impl StatePublisher for ChannelPublisher {
    fn publish(&self, state: EntityState) {
        if self.tx.send(state).is_err() {
            trace!("State channel closed, dropping state");
        }
    }
}

/// Create a publisher and the receiving end drained by [`forward_states`].
pub fn state_channel() -> (ChannelPublisher, mpsc::UnboundedReceiver<EntityState>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (ChannelPublisher { tx }, rx)
}

/// Put every received state on its key until shutdown or until every
/// publisher is gone.
pub async fn forward_states(
    session: Session,
    keys: KeyExprBuilder,
    format: Format,
    mut rx: mpsc::UnboundedReceiver<EntityState>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }

            state = rx.recv() => {
                let Some(state) = state else { break };
                let key = keys.build(&state.key_suffix());

                match encode(&state, format) {
                    Ok(payload) => {
                        if let Err(e) = session.put(&key, payload).await {
                            warn!(key = %key, error = %e, "Failed to publish state");
                        } else {
                            debug!(key = %key, value = ?state.value, "Published state");
                        }
                    }
                    Err(e) => warn!(key = %key, error = %e, "Failed to encode state"),
                }
            }
        }
    }

    debug!("State forwarding stopped");
}

/// Apply one host command to the coil its key names.
///
/// The coil's state is committed and published only after the bus write
/// succeeded.
pub async fn handle_command(
    registry: &Registry,
    keys: &KeyExprBuilder,
    key: &str,
    payload: &[u8],
) -> Result<SwitchCommand, BridgeError> {
    let parsed = keys
        .parse(key)
        .filter(|parsed| parsed.command && parsed.kind == EntityKind::Coil)
        .ok_or_else(|| BridgeError::NotACommand(key.to_string()))?;

    let command = SwitchCommand::parse(payload)?;

    let (scheduler, handle) = registry
        .find_coil(parsed.port, parsed.slave_id, parsed.address)
        .ok_or_else(|| {
            BridgeError::UnknownCoil(format!(
                "{}/{}/coil{}",
                parsed.port, parsed.slave_id, parsed.address
            ))
        })?;

    scheduler.set_coil(handle, command.value()).await?;
    Ok(command)
}

/// Serve switch commands until shutdown.
pub async fn serve_commands(
    session: Session,
    keys: KeyExprBuilder,
    registry: Arc<Registry>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), BridgeError> {
    let key_expr = keys.command_wildcard();
    info!(key_expr = %key_expr, "Subscribing to switch commands");

    let subscriber = session
        .declare_subscriber(&key_expr)
        .await
        .map_err(|e| BridgeError::Zenoh(format!("Failed to create subscriber: {}", e)))?;

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("Shutdown signal received, stopping command handler");
                    break;
                }
            }

            sample = subscriber.recv_async() => {
                let sample = match sample {
                    Ok(sample) => sample,
                    Err(e) => {
                        warn!("Error receiving command: {}", e);
                        break;
                    }
                };

                if sample.kind() == SampleKind::Delete {
                    trace!(key = %sample.key_expr(), "Ignoring delete sample");
                    continue;
                }

                let key = sample.key_expr().as_str().to_string();
                let payload = sample.payload().to_bytes().into_owned();

                // Commands run concurrently; each port's gate orders them
                let registry = Arc::clone(&registry);
                let keys = keys.clone();
                tokio::spawn(async move {
                    match handle_command(&registry, &keys, &key, &payload).await {
                        Ok(command) => info!(key = %key, ?command, "Switch command applied"),
                        Err(e) => warn!(key = %key, error = %e, "Switch command failed"),
                    }
                });
            }
        }
    }

    subscriber
        .undeclare()
        .await
        .map_err(|e| BridgeError::Zenoh(format!("Failed to undeclare subscriber: {}", e)))?;
    Ok(())
}

/// Status document published on `<prefix>/@/status`.
pub fn bridge_status(registry: &Registry, status: &str) -> serde_json::Value {
    serde_json::json!({
        "bridge": "modbus-sw",
        "version": env!("CARGO_PKG_VERSION"),
        "ports": registry.ports().iter().map(|port| port.name()).collect::<Vec<_>>(),
        "switches": registry.has_coils(),
        "sensors": registry.has_inputs(),
        "status": status,
    })
}
