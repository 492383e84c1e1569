//! Port scheduler: exclusive owner of one bus transport.
//!
//! Every bus operation (single read, single write, full poll sweep) runs on a
//! blocking worker that holds the port's gate for the whole operation. The
//! gate is a FIFO mutex, so a write issued during a sweep is admitted as soon
//! as that sweep ends, and the sweep deadline keeps each hold finite.
//!
//! Reads and writes have no gate timeout: a caller waits as long as the
//! operations queued before it take.

use crate::entity::{apply_coil_value, apply_input_value};
use crate::register_map::RegisterSpan;
use crate::topology::{CoilHandle, Device, Topology};
use crate::transport::{BusTransport, TransportError};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Error type for scheduler operations.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("Unknown entity: {0}")]
    UnknownEntity(String),
    #[error("Bus worker failed: {0}")]
    Worker(String),
}

/// Pacing and deadline of poll sweeps.
#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    /// Bus settle time between two devices of a sweep.
    pub settle_delay: Duration,
    /// Upper bound of one sweep; the rest of the sweep is skipped past it.
    pub sweep_deadline: Duration,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            settle_delay: Duration::from_millis(30),
            sweep_deadline: Duration::from_secs(10),
        }
    }
}

impl From<&crate::config::PollConfig> for SchedulerSettings {
    fn from(config: &crate::config::PollConfig) -> Self {
        Self {
            settle_delay: config.settle_delay(),
            sweep_deadline: config.sweep_timeout(),
        }
    }
}

/// A device whose sub-sweep failed.
#[derive(Debug)]
pub struct DeviceFailure {
    pub slave_id: u8,
    pub error: TransportError,
}

/// Outcome of one poll sweep.
#[derive(Debug, Default)]
pub struct SweepReport {
    /// Devices whose coils and inputs were all read.
    pub devices_polled: usize,
    pub failures: Vec<DeviceFailure>,
    /// The sweep hit its deadline and skipped the remaining devices.
    pub abandoned: bool,
    pub elapsed: Duration,
}

enum DeviceOutcome {
    Complete,
    DeadlineExceeded,
}

type Gate = Arc<Mutex<Box<dyn BusTransport>>>;

/// Serializes all bus access of one port.
pub struct PortScheduler {
    topology: Arc<Topology>,
    gate: Gate,
    settings: SchedulerSettings,
}

impl PortScheduler {
    pub fn new(
        topology: Topology,
        transport: Box<dyn BusTransport>,
        settings: SchedulerSettings,
    ) -> Self {
        Self {
            topology: Arc::new(topology),
            gate: Arc::new(Mutex::new(transport)),
            settings,
        }
    }

    pub fn name(&self) -> &str {
        self.topology.port_name()
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn settings(&self) -> &SchedulerSettings {
        &self.settings
    }

    /// Run `op` on a blocking worker while holding the gate.
    ///
    /// The guard moves into the worker and is dropped when `op` returns or
    /// unwinds, even if the awaiting caller went away.
    async fn with_bus<T, F>(&self, op: F) -> Result<T, SchedulerError>
    where
        F: FnOnce(&mut dyn BusTransport) -> T + Send + 'static,
        T: Send + 'static,
    {
        let bus = Arc::clone(&self.gate).lock_owned().await;
        tokio::task::spawn_blocking(move || {
            let mut bus = bus;
            op(&mut **bus)
        })
        .await
        .map_err(|e| SchedulerError::Worker(e.to_string()))
    }

    /// Open the transport.
    pub async fn connect(&self) -> Result<(), SchedulerError> {
        info!(port = %self.name(), "Connecting transport");
        self.with_bus(|bus| bus.connect()).await??;
        Ok(())
    }

    /// Read one coil from the bus. The coil's state is left untouched.
    pub async fn read_coil(&self, handle: CoilHandle) -> Result<bool, SchedulerError> {
        let coil = self.resolve(handle)?;
        let (slave_id, address) = (coil.slave_id(), coil.address());

        let bits = self
            .with_bus(move |bus| {
                bus.select_slave(slave_id);
                bus.read_bits(address, 1)
            })
            .await??;

        let observed = bits.first().copied().ok_or_else(|| {
            TransportError::Malformed(format!(
                "empty response reading coil {} of slave {}",
                address, slave_id
            ))
        })?;
        Ok(observed)
    }

    /// Write one coil on the bus.
    ///
    /// The coil's in-memory state is not touched; on failure it keeps its
    /// previous value.
    pub async fn write_coil(&self, handle: CoilHandle, value: bool) -> Result<(), SchedulerError> {
        let coil = self.resolve(handle)?;
        let (slave_id, address) = (coil.slave_id(), coil.address());

        self.with_bus(move |bus| {
            bus.select_slave(slave_id);
            bus.write_bit(address, value)
        })
        .await??;

        debug!(port = %self.name(), slave_id, address, value, "Coil written");
        Ok(())
    }

    /// Switch a coil: write it, then commit and publish the new state.
    ///
    /// The commit happens on the bus worker before the gate is released, so
    /// no other write or sweep can land between the write and its commit.
    pub async fn set_coil(&self, handle: CoilHandle, value: bool) -> Result<(), SchedulerError> {
        let coil = self.resolve(handle)?;
        let (slave_id, address) = (coil.slave_id(), coil.address());
        let topology = Arc::clone(&self.topology);

        self.with_bus(move |bus| {
            bus.select_slave(slave_id);
            bus.write_bit(address, value)?;
            if let Some(coil) = topology.coil(handle) {
                coil.confirm_write(value);
            }
            Ok::<(), TransportError>(())
        })
        .await??;

        debug!(port = %self.name(), slave_id, address, value, "Coil switched");
        Ok(())
    }

    /// Poll every device once, holding the gate for the whole sweep.
    pub async fn poll_once(&self) -> Result<SweepReport, SchedulerError> {
        let topology = Arc::clone(&self.topology);
        let settings = self.settings.clone();
        self.with_bus(move |bus| sweep(bus, &topology, &settings))
            .await
    }

    /// Poll every `interval` until the returned handle is cancelled or dropped.
    ///
    /// With `run_immediately` the first sweep starts right away. Ticks missed
    /// while a sweep runs are skipped, never queued.
    pub fn start_periodic_poll(
        self: &Arc<Self>,
        interval: Duration,
        run_immediately: bool,
    ) -> PollHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let scheduler = Arc::clone(self);
        let port = self.name().to_string();

        info!(
            port = %port,
            interval_secs = interval.as_secs_f64(),
            run_immediately,
            "Starting periodic poll"
        );

        let task = tokio::spawn(async move {
            let first = if run_immediately {
                tokio::time::Instant::now()
            } else {
                tokio::time::Instant::now() + interval
            };
            let mut ticker = tokio::time::interval_at(first, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    biased;

                    _ = shutdown_rx.changed() => break,
                    _ = ticker.tick() => {
                        match scheduler.poll_once().await {
                            Ok(report) => log_sweep(scheduler.name(), &report),
                            Err(e) => error!(port = %scheduler.name(), error = %e, "Poll sweep failed"),
                        }
                    }
                }
            }

            info!(port = %scheduler.name(), "Periodic poll stopped");
        });

        PollHandle {
            port,
            shutdown: shutdown_tx,
            task: Some(task),
        }
    }

    fn resolve(&self, handle: CoilHandle) -> Result<&crate::entity::Coil, SchedulerError> {
        self.topology.coil(handle).ok_or_else(|| {
            SchedulerError::UnknownEntity(format!(
                "coil {} of device #{} on port {}",
                handle.address,
                handle.device,
                self.name()
            ))
        })
    }
}

/// Cancels a periodic poll. Dropping the handle cancels it too.
///
/// Cancellation takes effect before the next tick; an in-flight sweep
/// completes.
#[derive(Debug)]
pub struct PollHandle {
    port: String,
    shutdown: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl PollHandle {
    pub fn port(&self) -> &str {
        &self.port
    }

    pub fn cancel(&self) {
        // Err only means the poll task is already gone
        let _ = self.shutdown.send(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Cancel and wait for the poll task to finish its current sweep.
    pub async fn stop(mut self) {
        self.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(port = %self.port, error = %e, "Periodic poll task ended abnormally");
            }
        }
    }
}

impl Drop for PollHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}

fn log_sweep(port: &str, report: &SweepReport) {
    if report.abandoned {
        warn!(
            port = %port,
            devices_polled = report.devices_polled,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "Poll sweep abandoned at deadline"
        );
    } else {
        debug!(
            port = %port,
            devices_polled = report.devices_polled,
            failures = report.failures.len(),
            elapsed_ms = report.elapsed.as_millis() as u64,
            "Poll sweep finished"
        );
    }
}

/// One full pass over the topology. Runs on the bus worker with the gate held.
fn sweep(
    bus: &mut dyn BusTransport,
    topology: &Topology,
    settings: &SchedulerSettings,
) -> SweepReport {
    let started = Instant::now();
    let deadline = started + settings.sweep_deadline;
    let mut report = SweepReport::default();
    let mut touched_bus = false;

    for device in topology.devices() {
        if device.is_empty() {
            continue;
        }

        if touched_bus {
            let remaining = deadline.saturating_duration_since(Instant::now());
            std::thread::sleep(settings.settle_delay.min(remaining));
        }

        if Instant::now() >= deadline {
            report.abandoned = true;
            break;
        }

        touched_bus = true;
        match poll_device(bus, device, deadline) {
            Ok(DeviceOutcome::Complete) => report.devices_polled += 1,
            Ok(DeviceOutcome::DeadlineExceeded) => {
                report.abandoned = true;
                break;
            }
            Err(error) => {
                warn!(device = %device, error = %error, "Device poll failed, continuing sweep");
                report.failures.push(DeviceFailure {
                    slave_id: device.slave_id(),
                    error,
                });
            }
        }
    }

    report.elapsed = started.elapsed();
    report
}

/// Read a device's coils then its inputs, one span read each.
fn poll_device(
    bus: &mut dyn BusTransport,
    device: &Device,
    deadline: Instant,
) -> Result<DeviceOutcome, TransportError> {
    if let Some(span) = RegisterSpan::covering(device.coil_addresses()) {
        debug!(device = %device, %span, "Update coils");
        bus.select_slave(device.slave_id());
        let bits = bus.read_bits(span.start, span.count)?;
        for (address, observed) in span.scatter(&bits) {
            if let Some(coil) = device.coil(address) {
                apply_coil_value(coil, observed);
            }
        }
    }

    let Some(span) = RegisterSpan::covering(device.input_addresses()) else {
        return Ok(DeviceOutcome::Complete);
    };

    if Instant::now() >= deadline {
        return Ok(DeviceOutcome::DeadlineExceeded);
    }

    debug!(device = %device, %span, "Update inputs");
    bus.select_slave(device.slave_id());
    let registers = bus.read_input_registers(span.start, span.count)?;
    for (address, raw) in span.scatter(&registers) {
        if let Some(input) = device.input(address) {
            apply_input_value(input, raw);
        }
    }

    Ok(DeviceOutcome::Complete)
}
