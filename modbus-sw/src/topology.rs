//! Static port → device → entity graph, built once from configuration.
//!
//! Entities are addressed by index-based handles (device index plus register
//! address) instead of back-references to their device or port.

use crate::config::{ConfigError, DeviceConfig, PortConfig};
use crate::entity::{Coil, Entity, Input};
use std::collections::BTreeMap;
use std::fmt;

/// Handle of a coil inside a [`Topology`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CoilHandle {
    pub device: usize,
    pub address: u16,
}

/// Handle of an input inside a [`Topology`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InputHandle {
    pub device: usize,
    pub address: u16,
}

/// A slave on the bus with its coils and inputs.
#[derive(Debug)]
pub struct Device {
    port: String,
    slave_id: u8,
    label: Option<String>,
    coils: BTreeMap<u16, Coil>,
    inputs: BTreeMap<u16, Input>,
}

impl Device {
    fn build(port: &str, config: &DeviceConfig) -> Self {
        let coils = config
            .coils
            .iter()
            .map(|coil| (coil.id, Coil::new(port, config.slave_id, coil)))
            .collect();
        let inputs = config
            .inputs
            .iter()
            .map(|input| (input.id, Input::new(port, config.slave_id, input)))
            .collect();

        Self {
            port: port.to_string(),
            slave_id: config.slave_id,
            label: config.device_id.clone(),
            coils,
            inputs,
        }
    }

    pub fn slave_id(&self) -> u8 {
        self.slave_id
    }

    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    pub fn coil(&self, address: u16) -> Option<&Coil> {
        self.coils.get(&address)
    }

    pub fn input(&self, address: u16) -> Option<&Input> {
        self.inputs.get(&address)
    }

    /// Coils in address order.
    pub fn coils(&self) -> impl Iterator<Item = &Coil> {
        self.coils.values()
    }

    /// Inputs in address order.
    pub fn inputs(&self) -> impl Iterator<Item = &Input> {
        self.inputs.values()
    }

    pub fn coil_addresses(&self) -> impl Iterator<Item = u16> + '_ {
        self.coils.keys().copied()
    }

    pub fn input_addresses(&self) -> impl Iterator<Item = u16> + '_ {
        self.inputs.keys().copied()
    }

    /// A device without coils and inputs never touches the bus.
    pub fn is_empty(&self) -> bool {
        self.coils.is_empty() && self.inputs.is_empty()
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.label {
            Some(label) => write!(f, "<ModbusDevice {}:{} {}>", self.port, self.slave_id, label),
            None => write!(f, "<ModbusDevice {}:{}>", self.port, self.slave_id),
        }
    }
}

/// The devices of one port, in configuration order.
#[derive(Debug)]
pub struct Topology {
    port: String,
    devices: Vec<Device>,
}

impl Topology {
    /// Build the topology of a port. Fails on any invalid setting.
    pub fn build(config: &PortConfig) -> Result<Self, ConfigError> {
        config.validate()?;

        let devices = config
            .devices
            .iter()
            .map(|device| Device::build(&config.name, device))
            .collect();

        Ok(Self {
            port: config.name.clone(),
            devices,
        })
    }

    pub fn port_name(&self) -> &str {
        &self.port
    }

    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    pub fn device_by_slave(&self, slave_id: u8) -> Option<(usize, &Device)> {
        self.devices
            .iter()
            .enumerate()
            .find(|(_, device)| device.slave_id == slave_id)
    }

    pub fn coil(&self, handle: CoilHandle) -> Option<&Coil> {
        self.devices.get(handle.device)?.coil(handle.address)
    }

    pub fn input(&self, handle: InputHandle) -> Option<&Input> {
        self.devices.get(handle.device)?.input(handle.address)
    }

    pub fn coil_handle(&self, slave_id: u8, address: u16) -> Option<CoilHandle> {
        let (device, found) = self.device_by_slave(slave_id)?;
        found.coil(address)?;
        Some(CoilHandle { device, address })
    }

    pub fn input_handle(&self, slave_id: u8, address: u16) -> Option<InputHandle> {
        let (device, found) = self.device_by_slave(slave_id)?;
        found.input(address)?;
        Some(InputHandle { device, address })
    }

    /// Every entity, devices in configuration order, coils before inputs.
    pub fn entities(&self) -> impl Iterator<Item = Entity<'_>> {
        self.devices.iter().flat_map(|device| {
            device
                .coils()
                .map(Entity::Coil)
                .chain(device.inputs().map(Entity::Input))
        })
    }

    pub fn has_coils(&self) -> bool {
        self.devices.iter().any(|device| !device.coils.is_empty())
    }

    pub fn has_inputs(&self) -> bool {
        self.devices.iter().any(|device| !device.inputs.is_empty())
    }
}
