//! Application context: every configured port and its scheduler.
//!
//! The registry is built once at startup and owned by the bridge. It hands
//! entities to the host, starts periodic polling and routes host commands to
//! the scheduler of the right port.

use crate::config::{ConfigError, ModbusSwConfig, PortConfig};
use crate::entity::{Entity, HostEntity, StatePublisher};
use crate::scheduler::{PollHandle, PortScheduler, SchedulerError, SchedulerSettings};
use crate::topology::{CoilHandle, Topology};
use crate::transport::BusTransport;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{error, info};

/// All ports of the bridge, in configuration order.
///
/// The registry owns the periodic polls it starts: dropping it cancels them.
pub struct Registry {
    ports: Vec<Arc<PortScheduler>>,
    polls: Mutex<Vec<PollHandle>>,
}

impl Registry {
    /// Build one topology and scheduler per configured port.
    ///
    /// `transport` is asked for the bus driver of each port; it is not
    /// connected yet.
    pub fn build<F>(config: &ModbusSwConfig, mut transport: F) -> Result<Self, ConfigError>
    where
        F: FnMut(&PortConfig) -> Box<dyn BusTransport>,
    {
        config.validate()?;
        let settings = SchedulerSettings::from(&config.poll);

        let mut ports = Vec::with_capacity(config.ports.len());
        for port in &config.ports {
            let topology = Topology::build(port)?;
            info!(
                port = %port.name,
                path = %port.port,
                devices = topology.devices().len(),
                "Port configured"
            );
            ports.push(Arc::new(PortScheduler::new(
                topology,
                transport(port),
                settings.clone(),
            )));
        }

        Ok(Self {
            ports,
            polls: Mutex::new(Vec::new()),
        })
    }

    /// Connect every port's transport. Stops at the first failure.
    pub async fn connect_all(&self) -> Result<(), SchedulerError> {
        for port in &self.ports {
            if let Err(e) = port.connect().await {
                error!(port = %port.name(), error = %e, "Failed to connect port");
                return Err(e);
            }
        }
        Ok(())
    }

    /// Register every entity with the host publisher.
    ///
    /// Each entity publishes its current state on registration. Returns the
    /// number of newly registered entities.
    pub fn register_all(&self, publisher: Arc<dyn StatePublisher>) -> usize {
        self.entities()
            .filter(|entity| entity.register(Arc::clone(&publisher)))
            .count()
    }

    /// Start one periodic poll per port.
    ///
    /// Returns the number of polls started; nothing is started while polls
    /// are already running.
    pub fn start_polling(&self, interval: Duration, run_immediately: bool) -> usize {
        let mut polls = self.polls();
        if !polls.is_empty() {
            return 0;
        }

        polls.extend(
            self.ports
                .iter()
                .map(|port| port.start_periodic_poll(interval, run_immediately)),
        );
        polls.len()
    }

    pub fn is_polling(&self) -> bool {
        !self.polls().is_empty()
    }

    /// Cancel every periodic poll and wait for in-flight sweeps to finish.
    pub async fn stop_polling(&self) {
        let polls = std::mem::take(&mut *self.polls());
        for poll in polls {
            poll.stop().await;
        }
    }

    fn polls(&self) -> MutexGuard<'_, Vec<PollHandle>> {
        self.polls.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn ports(&self) -> &[Arc<PortScheduler>] {
        &self.ports
    }

    pub fn port(&self, name: &str) -> Option<&Arc<PortScheduler>> {
        self.ports.iter().find(|port| port.name() == name)
    }

    /// Locate a coil by port name, slave address and coil address.
    pub fn find_coil(
        &self,
        port: &str,
        slave_id: u8,
        address: u16,
    ) -> Option<(&Arc<PortScheduler>, CoilHandle)> {
        let scheduler = self.port(port)?;
        let handle = scheduler.topology().coil_handle(slave_id, address)?;
        Some((scheduler, handle))
    }

    /// Every entity of every port, in configuration order.
    pub fn entities(&self) -> impl Iterator<Item = Entity<'_>> {
        self.ports.iter().flat_map(|port| port.topology().entities())
    }

    pub fn entity_by_unique_id(&self, unique_id: &str) -> Option<Entity<'_>> {
        self.entities()
            .find(|entity| entity.unique_id() == unique_id)
    }

    /// Whether the switch platform has anything to expose.
    pub fn has_coils(&self) -> bool {
        self.ports.iter().any(|port| port.topology().has_coils())
    }

    /// Whether the sensor platform has anything to expose.
    pub fn has_inputs(&self) -> bool {
        self.ports.iter().any(|port| port.topology().has_inputs())
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field(
                "ports",
                &self.ports.iter().map(|port| port.name()).collect::<Vec<_>>(),
            )
            .field("polling", &self.is_polling())
            .finish()
    }
}
