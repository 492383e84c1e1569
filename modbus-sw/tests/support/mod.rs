//! Shared fixtures: an in-memory bus and configuration builders.

#![allow(dead_code)]

use modbus_sw::config::{
    CoilConfig, DeviceConfig, InputConfig, InputMode, ModbusSwConfig, Parity, PollConfig,
    PortConfig, RtsMode,
};
use modbus_sw::entity::StatePublisher;
use modbus_sw::transport::{BusTransport, TransportError};
use modbus_sw_common::{EntityState, Format, StateValue};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

/// A bus call as seen by the mock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Connect,
    ReadBits { slave: u8, start: u16, count: u16 },
    ReadInputs { slave: u8, start: u16, count: u16 },
    WriteBit { slave: u8, address: u16, value: bool },
}

impl Call {
    pub fn is_write(&self) -> bool {
        matches!(self, Call::WriteBit { .. })
    }
}

#[derive(Default)]
struct BusState {
    calls: Vec<Call>,
    coils: HashMap<(u8, u16), bool>,
    registers: HashMap<(u8, u16), u16>,
    failing_slaves: HashSet<u8>,
    fail_writes: bool,
    short_reads: bool,
    delay: Duration,
    paused: bool,
    waiting: usize,
    in_flight: usize,
    max_in_flight: usize,
}

/// In-memory bus. Clones share the same devices and call log, so a test
/// keeps one clone to inspect while the scheduler owns another.
#[derive(Clone, Default)]
pub struct MockBus {
    shared: Arc<(Mutex<BusState>, Condvar)>,
    slave: u8,
}

impl MockBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn boxed(&self) -> Box<dyn BusTransport> {
        Box::new(self.clone())
    }

    fn state(&self) -> std::sync::MutexGuard<'_, BusState> {
        self.shared.0.lock().unwrap()
    }

    pub fn set_coil(&self, slave: u8, address: u16, value: bool) {
        self.state().coils.insert((slave, address), value);
    }

    pub fn coil(&self, slave: u8, address: u16) -> bool {
        self.state()
            .coils
            .get(&(slave, address))
            .copied()
            .unwrap_or(false)
    }

    pub fn set_register(&self, slave: u8, address: u16, value: u16) {
        self.state().registers.insert((slave, address), value);
    }

    pub fn fail_slave(&self, slave: u8) {
        self.state().failing_slaves.insert(slave);
    }

    pub fn heal_slave(&self, slave: u8) {
        self.state().failing_slaves.remove(&slave);
    }

    /// Answer coil reads with no bits at all.
    pub fn short_reads(&self, short: bool) {
        self.state().short_reads = short;
    }

    pub fn fail_writes(&self, fail: bool) {
        self.state().fail_writes = fail;
    }

    /// Every bus call takes at least `delay`.
    pub fn set_delay(&self, delay: Duration) {
        self.state().delay = delay;
    }

    /// Hold every bus call at its start until [`MockBus::resume`].
    pub fn pause(&self) {
        self.state().paused = true;
    }

    pub fn resume(&self) {
        self.state().paused = false;
        self.shared.1.notify_all();
    }

    /// Number of calls held by [`MockBus::pause`].
    pub fn waiting(&self) -> usize {
        self.state().waiting
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state().calls.clear();
    }

    pub fn max_in_flight(&self) -> usize {
        self.state().max_in_flight
    }

    fn call<T>(&self, call: Call, op: impl FnOnce(&mut BusState) -> T) -> T {
        let (lock, resumed) = &*self.shared;

        let mut state = lock.lock().unwrap();
        state.waiting += 1;
        while state.paused {
            state = resumed.wait(state).unwrap();
        }
        state.waiting -= 1;
        state.in_flight += 1;
        state.max_in_flight = state.max_in_flight.max(state.in_flight);
        let delay = state.delay;
        drop(state);

        if !delay.is_zero() {
            std::thread::sleep(delay);
        }

        let mut state = lock.lock().unwrap();
        state.calls.push(call);
        let result = op(&mut *state);
        state.in_flight -= 1;
        result
    }
}

impl BusTransport for MockBus {
    fn connect(&mut self) -> Result<(), TransportError> {
        self.call(Call::Connect, |_| Ok(()))
    }

    fn select_slave(&mut self, slave_id: u8) {
        self.slave = slave_id;
    }

    fn read_bits(&mut self, start: u16, count: u16) -> Result<Vec<bool>, TransportError> {
        let slave = self.slave;
        self.call(Call::ReadBits { slave, start, count }, |state| {
            if state.failing_slaves.contains(&slave) {
                return Err(TransportError::Timeout(Duration::from_millis(1000)));
            }
            if state.short_reads {
                return Ok(Vec::new());
            }
            Ok((start..start + count)
                .map(|address| state.coils.get(&(slave, address)).copied().unwrap_or(false))
                .collect())
        })
    }

    fn read_input_registers(
        &mut self,
        start: u16,
        count: u16,
    ) -> Result<Vec<u16>, TransportError> {
        let slave = self.slave;
        self.call(Call::ReadInputs { slave, start, count }, |state| {
            if state.failing_slaves.contains(&slave) {
                return Err(TransportError::Timeout(Duration::from_millis(1000)));
            }
            Ok((start..start + count)
                .map(|address| state.registers.get(&(slave, address)).copied().unwrap_or(0))
                .collect())
        })
    }

    fn write_bit(&mut self, address: u16, value: bool) -> Result<(), TransportError> {
        let slave = self.slave;
        self.call(Call::WriteBit { slave, address, value }, |state| {
            if state.fail_writes || state.failing_slaves.contains(&slave) {
                return Err(TransportError::Io("write rejected".to_string()));
            }
            state.coils.insert((slave, address), value);
            Ok(())
        })
    }
}

/// Publisher that records each coil state it receives next to the bus value
/// at that moment.
pub struct BusMirror {
    bus: MockBus,
    slave: u8,
    address: u16,
    seen: Mutex<Vec<(bool, bool)>>,
}

impl BusMirror {
    pub fn new(bus: &MockBus, slave: u8, address: u16) -> Self {
        Self {
            bus: bus.clone(),
            slave,
            address,
            seen: Mutex::new(Vec::new()),
        }
    }

    /// `(published, on_bus)` pairs in publish order.
    pub fn seen(&self) -> Vec<(bool, bool)> {
        self.seen.lock().unwrap().clone()
    }
}

impl StatePublisher for BusMirror {
    fn publish(&self, state: EntityState) {
        let published = state.value == StateValue::Switch(true);
        let on_bus = self.bus.coil(self.slave, self.address);
        self.seen.lock().unwrap().push((published, on_bus));
    }
}

/// Publisher that keeps every state it receives.
#[derive(Default)]
pub struct Recorder {
    states: Mutex<Vec<EntityState>>,
}

impl StatePublisher for Recorder {
    fn publish(&self, state: EntityState) {
        self.states.lock().unwrap().push(state);
    }
}

impl Recorder {
    pub fn states(&self) -> Vec<EntityState> {
        self.states.lock().unwrap().clone()
    }

    pub fn count(&self) -> usize {
        self.states.lock().unwrap().len()
    }

    pub fn clear(&self) {
        self.states.lock().unwrap().clear();
    }
}

pub fn device(slave_id: u8, coils: &[u16], inputs: &[u16]) -> DeviceConfig {
    DeviceConfig {
        device_id: None,
        slave_id,
        coils: coils
            .iter()
            .map(|&id| CoilConfig {
                id,
                name: format!("Relay {}", id),
            })
            .collect(),
        inputs: inputs
            .iter()
            .map(|&id| InputConfig {
                id,
                name: format!("Sensor {}", id),
                mode: InputMode::Temperature,
            })
            .collect(),
    }
}

pub fn port(name: &str, devices: Vec<DeviceConfig>) -> PortConfig {
    PortConfig {
        name: name.to_string(),
        port: format!("/dev/tty{}", name),
        baudrate: 9600,
        stopbits: 1,
        bytesize: 8,
        parity: Parity::None,
        rtsmode: RtsMode::Up,
        rtspin: 22,
        rtsdelay: 100,
        timeout_ms: 1000,
        devices,
    }
}

pub fn config(ports: Vec<PortConfig>) -> ModbusSwConfig {
    ModbusSwConfig {
        zenoh: Default::default(),
        key_prefix: "modbus_sw".to_string(),
        serialization: Format::Json,
        poll: PollConfig {
            interval_secs: 30,
            settle_delay_ms: 0,
            sweep_timeout_ms: 10_000,
            run_immediately: true,
        },
        ports,
        logging: Default::default(),
    }
}

/// Poll `condition` until it holds or `timeout` elapses.
pub async fn eventually(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}
