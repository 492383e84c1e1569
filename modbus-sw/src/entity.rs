//! Coil and input entities and the reconciliation of polled values.
//!
//! Entities hold their last known state and identity. The scheduler feeds
//! them observed values through [`apply_coil_value`] and
//! [`apply_input_value`]; changes flow outward to the host through a
//! [`StatePublisher`] once the entity has been registered with one.

use crate::config::{CoilConfig, InputConfig, InputMode};
use modbus_sw_common::{EntityKind, EntityState, StateValue, current_timestamp_millis};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use tracing::{debug, info};

/// Prefix of every unique id issued by this bridge.
pub const UNIQUE_ID_PREFIX: &str = "modbus_sw";

/// Host-side sink for entity state changes.
///
/// Called from the bus worker, so implementations must not block.
pub trait StatePublisher: Send + Sync {
    fn publish(&self, state: EntityState);
}

/// Capability shared by every entity the host platform sees.
pub trait HostEntity {
    /// Globally unique identifier.
    fn unique_id(&self) -> &str;

    /// Human-readable name.
    fn name(&self) -> &str;

    fn kind(&self) -> EntityKind;

    /// Current state as sent to the host.
    fn snapshot(&self) -> EntityState;

    /// Attach the host publisher and publish the current state.
    ///
    /// Returns `false` if the entity was already registered.
    fn register(&self, publisher: Arc<dyn StatePublisher>) -> bool;

    fn is_registered(&self) -> bool;

    /// Publish the current state, if registered.
    fn publish_state(&self);
}

/// Unit, device class and state class reported for an input mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SensorAttributes {
    pub unit: &'static str,
    pub device_class: &'static str,
    pub state_class: &'static str,
}

impl InputMode {
    pub fn attributes(&self) -> SensorAttributes {
        match self {
            InputMode::Temperature => SensorAttributes {
                unit: "°C",
                device_class: "temperature",
                state_class: "measurement",
            },
            InputMode::Voltage => SensorAttributes {
                unit: "V",
                device_class: "voltage",
                state_class: "measurement",
            },
        }
    }
}

/// Identity shared by coils and inputs.
#[derive(Debug, Clone)]
struct Identity {
    port: String,
    slave_id: u8,
    address: u16,
    name: String,
    unique_id: String,
}

impl Identity {
    fn new(port: &str, slave_id: u8, kind: EntityKind, address: u16, name: &str) -> Self {
        Self {
            port: port.to_string(),
            slave_id,
            address,
            name: name.to_string(),
            unique_id: unique_id(port, slave_id, kind, address),
        }
    }

    fn state(&self, kind: EntityKind, value: StateValue) -> EntityState {
        EntityState {
            timestamp: current_timestamp_millis(),
            unique_id: self.unique_id.clone(),
            name: self.name.clone(),
            kind,
            port: self.port.clone(),
            slave_id: self.slave_id,
            address: self.address,
            value,
            unit: None,
            device_class: None,
            state_class: None,
        }
    }
}

/// Build the unique id of an entity: `modbus_sw-<port>-<slave>-<kind><address>`.
pub fn unique_id(port: &str, slave_id: u8, kind: EntityKind, address: u16) -> String {
    format!(
        "{}-{}-{}-{}{}",
        UNIQUE_ID_PREFIX,
        port,
        slave_id,
        kind.as_str(),
        address
    )
}

/// A coil of a device, surfaced as a switch.
pub struct Coil {
    identity: Identity,
    state: AtomicBool,
    publisher: OnceLock<Arc<dyn StatePublisher>>,
}

impl Coil {
    pub fn new(port: &str, slave_id: u8, config: &CoilConfig) -> Self {
        Self {
            identity: Identity::new(port, slave_id, EntityKind::Coil, config.id, &config.name),
            state: AtomicBool::new(false),
            publisher: OnceLock::new(),
        }
    }

    pub fn address(&self) -> u16 {
        self.identity.address
    }

    pub fn slave_id(&self) -> u8 {
        self.identity.slave_id
    }

    pub fn is_on(&self) -> bool {
        self.state.load(Ordering::SeqCst)
    }

    /// Record a value whose bus write has been confirmed and publish it.
    pub fn confirm_write(&self, value: bool) {
        self.state.store(value, Ordering::SeqCst);
        self.publish_state();
    }
}

impl HostEntity for Coil {
    fn unique_id(&self) -> &str {
        &self.identity.unique_id
    }

    fn name(&self) -> &str {
        &self.identity.name
    }

    fn kind(&self) -> EntityKind {
        EntityKind::Coil
    }

    fn snapshot(&self) -> EntityState {
        self.identity
            .state(EntityKind::Coil, StateValue::Switch(self.is_on()))
    }

    fn register(&self, publisher: Arc<dyn StatePublisher>) -> bool {
        let registered = self.publisher.set(publisher).is_ok();
        if registered {
            self.publish_state();
        }
        registered
    }

    fn is_registered(&self) -> bool {
        self.publisher.get().is_some()
    }

    fn publish_state(&self) {
        if let Some(publisher) = self.publisher.get() {
            publisher.publish(self.snapshot());
        }
    }
}

impl std::fmt::Debug for Coil {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coil")
            .field("unique_id", &self.identity.unique_id)
            .field("name", &self.identity.name)
            .field("on", &self.is_on())
            .finish()
    }
}

/// An input register of a device, surfaced as a sensor.
pub struct Input {
    identity: Identity,
    mode: InputMode,
    /// `f64` bits
    value: AtomicU64,
    publisher: OnceLock<Arc<dyn StatePublisher>>,
}

impl Input {
    pub fn new(port: &str, slave_id: u8, config: &InputConfig) -> Self {
        Self {
            identity: Identity::new(port, slave_id, EntityKind::Input, config.id, &config.name),
            mode: config.mode,
            value: AtomicU64::new(0f64.to_bits()),
            publisher: OnceLock::new(),
        }
    }

    pub fn address(&self) -> u16 {
        self.identity.address
    }

    pub fn slave_id(&self) -> u8 {
        self.identity.slave_id
    }

    pub fn mode(&self) -> InputMode {
        self.mode
    }

    pub fn value(&self) -> f64 {
        f64::from_bits(self.value.load(Ordering::SeqCst))
    }
}

impl HostEntity for Input {
    fn unique_id(&self) -> &str {
        &self.identity.unique_id
    }

    fn name(&self) -> &str {
        &self.identity.name
    }

    fn kind(&self) -> EntityKind {
        EntityKind::Input
    }

    fn snapshot(&self) -> EntityState {
        let attributes = self.mode.attributes();
        let mut state = self
            .identity
            .state(EntityKind::Input, StateValue::Measurement(self.value()));
        state.unit = Some(attributes.unit.to_string());
        state.device_class = Some(attributes.device_class.to_string());
        state.state_class = Some(attributes.state_class.to_string());
        state
    }

    fn register(&self, publisher: Arc<dyn StatePublisher>) -> bool {
        let registered = self.publisher.set(publisher).is_ok();
        if registered {
            self.publish_state();
        }
        registered
    }

    fn is_registered(&self) -> bool {
        self.publisher.get().is_some()
    }

    fn publish_state(&self) {
        if let Some(publisher) = self.publisher.get() {
            publisher.publish(self.snapshot());
        }
    }
}

impl std::fmt::Debug for Input {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Input")
            .field("unique_id", &self.identity.unique_id)
            .field("name", &self.identity.name)
            .field("mode", &self.mode)
            .field("value", &self.value())
            .finish()
    }
}

/// Any entity of the topology.
#[derive(Debug, Clone, Copy)]
pub enum Entity<'a> {
    Coil(&'a Coil),
    Input(&'a Input),
}

impl HostEntity for Entity<'_> {
    fn unique_id(&self) -> &str {
        match self {
            Entity::Coil(coil) => coil.unique_id(),
            Entity::Input(input) => input.unique_id(),
        }
    }

    fn name(&self) -> &str {
        match self {
            Entity::Coil(coil) => coil.name(),
            Entity::Input(input) => input.name(),
        }
    }

    fn kind(&self) -> EntityKind {
        match self {
            Entity::Coil(_) => EntityKind::Coil,
            Entity::Input(_) => EntityKind::Input,
        }
    }

    fn snapshot(&self) -> EntityState {
        match self {
            Entity::Coil(coil) => coil.snapshot(),
            Entity::Input(input) => input.snapshot(),
        }
    }

    fn register(&self, publisher: Arc<dyn StatePublisher>) -> bool {
        match self {
            Entity::Coil(coil) => coil.register(publisher),
            Entity::Input(input) => input.register(publisher),
        }
    }

    fn is_registered(&self) -> bool {
        match self {
            Entity::Coil(coil) => coil.is_registered(),
            Entity::Input(input) => input.is_registered(),
        }
    }

    fn publish_state(&self) {
        match self {
            Entity::Coil(coil) => coil.publish_state(),
            Entity::Input(input) => input.publish_state(),
        }
    }
}

/// Reconcile a polled coil bit with the coil's state.
///
/// Returns whether the state changed. A change is published only when the
/// coil is registered with the host.
pub fn apply_coil_value(coil: &Coil, observed: bool) -> bool {
    let previous = coil.state.swap(observed, Ordering::SeqCst);
    if previous == observed {
        return false;
    }

    if coil.is_registered() {
        coil.publish_state();
        info!(entity = %coil.unique_id(), on = observed, "Coil state updated");
    } else {
        debug!(entity = %coil.unique_id(), on = observed, "Coil state set before registration");
    }
    true
}

/// Reconcile a polled input register with the input's value.
///
/// Returns whether the value changed.
pub fn apply_input_value(input: &Input, observed_raw: u16) -> bool {
    let value = f64::from(observed_raw);
    debug!(entity = %input.unique_id(), value, "Input value measured");

    let previous = f64::from_bits(input.value.swap(value.to_bits(), Ordering::SeqCst));
    if previous == value {
        return false;
    }

    if input.is_registered() {
        input.publish_state();
        info!(entity = %input.unique_id(), value, "Input state updated");
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        states: Mutex<Vec<EntityState>>,
    }

    impl StatePublisher for Recorder {
        fn publish(&self, state: EntityState) {
            self.states.lock().unwrap().push(state);
        }
    }

    impl Recorder {
        fn count(&self) -> usize {
            self.states.lock().unwrap().len()
        }
    }

    fn coil(id: u16) -> Coil {
        Coil::new(
            "P1",
            5,
            &CoilConfig {
                id,
                name: format!("Relay {}", id),
            },
        )
    }

    fn input(mode: InputMode) -> Input {
        Input::new(
            "P1",
            5,
            &InputConfig {
                id: 2,
                name: "Boiler".to_string(),
                mode,
            },
        )
    }

    #[test]
    fn test_unique_ids() {
        assert_eq!(coil(3).unique_id(), "modbus_sw-P1-5-coil3");
        assert_eq!(
            input(InputMode::Voltage).unique_id(),
            "modbus_sw-P1-5-input2"
        );
    }

    #[test]
    fn test_registration_publishes_initial_state() {
        let recorder = Arc::new(Recorder::default());
        let coil = coil(0);

        assert!(coil.register(recorder.clone()));
        assert!(!coil.register(recorder.clone()));
        assert_eq!(recorder.count(), 1);
        assert_eq!(
            recorder.states.lock().unwrap()[0].value,
            StateValue::Switch(false)
        );
    }

    #[test]
    fn test_repeated_coil_value_notifies_once() {
        let recorder = Arc::new(Recorder::default());
        let coil = coil(1);
        coil.register(recorder.clone());

        assert!(apply_coil_value(&coil, true));
        assert!(!apply_coil_value(&coil, true));

        // initial registration + one change
        assert_eq!(recorder.count(), 2);
        assert!(coil.is_on());
    }

    #[test]
    fn test_unregistered_coil_updates_silently() {
        let coil = coil(1);
        assert!(apply_coil_value(&coil, true));
        assert!(coil.is_on());
        assert!(!coil.is_registered());
    }

    #[test]
    fn test_repeated_input_value_notifies_once() {
        let recorder = Arc::new(Recorder::default());
        let input = input(InputMode::Temperature);
        input.register(recorder.clone());

        assert!(apply_input_value(&input, 215));
        assert!(!apply_input_value(&input, 215));
        assert_eq!(recorder.count(), 2);
        assert_eq!(input.value(), 215.0);

        let last = recorder.states.lock().unwrap().last().cloned().unwrap();
        assert_eq!(last.value, StateValue::Measurement(215.0));
        assert_eq!(last.unit.as_deref(), Some("°C"));
        assert_eq!(last.device_class.as_deref(), Some("temperature"));
    }

    #[test]
    fn test_zero_reading_is_not_a_change() {
        let input = input(InputMode::Voltage);
        assert!(!apply_input_value(&input, 0));
    }

    #[test]
    fn test_confirm_write_always_publishes() {
        let recorder = Arc::new(Recorder::default());
        let coil = coil(2);
        coil.register(recorder.clone());

        coil.confirm_write(false);
        coil.confirm_write(true);

        assert_eq!(recorder.count(), 3);
        assert!(coil.is_on());
    }

    #[test]
    fn test_entity_delegates() {
        let coil = coil(4);
        let input = input(InputMode::Voltage);

        let entities = [Entity::Coil(&coil), Entity::Input(&input)];
        assert_eq!(entities[0].kind(), EntityKind::Coil);
        assert_eq!(entities[1].name(), "Boiler");
        assert_eq!(entities[1].snapshot().unit.as_deref(), Some("V"));
    }
}
