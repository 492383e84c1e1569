//! Configuration for the Modbus switch bridge.

use modbus_sw_common::{Format, LoggingConfig, ZenohConfig};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Highest slave address a Modbus RTU device may use.
pub const MAX_SLAVE_ID: u8 = 247;

/// Highest coil address a device may expose.
pub const MAX_COIL_ADDRESS: u16 = 31;

/// Input register addresses are 1-based on the supported boards.
pub const INPUT_ADDRESS_RANGE: std::ops::RangeInclusive<u16> = 1..=31;

/// Longest accepted poll interval (one day).
pub const MAX_POLL_INTERVAL_SECS: u64 = 86_400;

/// Longest accepted sweep deadline (one hour).
pub const MAX_SWEEP_TIMEOUT_MS: u64 = 3_600_000;

/// Longest accepted settle delay between two devices.
pub const MAX_SETTLE_DELAY_MS: u64 = 10_000;

/// Longest accepted timeout of a single bus call.
pub const MAX_CALL_TIMEOUT_MS: u64 = 60_000;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load config: {0}")]
    Load(#[from] modbus_sw_common::Error),
    #[error("Validation error: {0}")]
    Validation(String),
}

/// Complete bridge configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModbusSwConfig {
    /// Zenoh connection settings
    #[serde(default)]
    pub zenoh: ZenohConfig,

    /// Key expression prefix (default: "modbus_sw")
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Wire format for published entity state
    #[serde(default)]
    pub serialization: Format,

    /// Periodic poll settings, shared by every port
    #[serde(default)]
    pub poll: PollConfig,

    /// Serial ports, one bus scheduler each
    pub ports: Vec<PortConfig>,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_key_prefix() -> String {
    modbus_sw_common::KEY_PREFIX.to_string()
}

/// Periodic poll settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollConfig {
    /// Seconds between two poll sweeps
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,

    /// Bus settle time between two devices, in milliseconds
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,

    /// Deadline for one full sweep, in milliseconds
    #[serde(default = "default_sweep_timeout_ms")]
    pub sweep_timeout_ms: u64,

    /// Run one sweep right away instead of waiting for the first tick
    #[serde(default = "default_run_immediately")]
    pub run_immediately: bool,
}

fn default_interval_secs() -> u64 {
    30
}

fn default_settle_delay_ms() -> u64 {
    30
}

fn default_sweep_timeout_ms() -> u64 {
    10_000
}

fn default_run_immediately() -> bool {
    true
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            settle_delay_ms: default_settle_delay_ms(),
            sweep_timeout_ms: default_sweep_timeout_ms(),
            run_immediately: default_run_immediately(),
        }
    }
}

impl PollConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=MAX_POLL_INTERVAL_SECS).contains(&self.interval_secs) {
            return Err(ConfigError::Validation(format!(
                "poll.interval_secs must be 1-{}, got {}",
                MAX_POLL_INTERVAL_SECS, self.interval_secs
            )));
        }

        if !(1..=MAX_SWEEP_TIMEOUT_MS).contains(&self.sweep_timeout_ms) {
            return Err(ConfigError::Validation(format!(
                "poll.sweep_timeout_ms must be 1-{}, got {}",
                MAX_SWEEP_TIMEOUT_MS, self.sweep_timeout_ms
            )));
        }

        if self.settle_delay_ms > MAX_SETTLE_DELAY_MS {
            return Err(ConfigError::Validation(format!(
                "poll.settle_delay_ms must be at most {}, got {}",
                MAX_SETTLE_DELAY_MS, self.settle_delay_ms
            )));
        }

        Ok(())
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn sweep_timeout(&self) -> Duration {
        Duration::from_millis(self.sweep_timeout_ms)
    }
}

/// Configuration for one RS-485 port.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortConfig {
    /// Port name (used in unique ids and key expressions)
    pub name: String,

    /// Serial device path (e.g., "/dev/ttyAMA0")
    pub port: String,

    /// Baud rate (default: 9600)
    #[serde(default = "default_baudrate")]
    pub baudrate: u32,

    /// Stop bits: 1 or 2 (default: 1)
    #[serde(default = "default_stopbits")]
    pub stopbits: u8,

    /// Data bits: 5 to 8 (default: 8)
    #[serde(default = "default_bytesize")]
    pub bytesize: u8,

    /// Parity: "N", "E" or "O" (default: "N")
    #[serde(default)]
    pub parity: Parity,

    /// RTS mode: "U" (up while sending) or "D" (down while sending)
    #[serde(default)]
    pub rtsmode: RtsMode,

    /// GPIO pin driving the transceiver's RTS line. Only the idle level is
    /// set on connect; per-frame direction switching belongs to the serial
    /// driver (e.g. kernel RS-485 mode) or an auto-direction transceiver.
    pub rtspin: u32,

    /// RTS delay in microseconds (default: 100). Logged, applied by the driver.
    #[serde(default = "default_rtsdelay")]
    pub rtsdelay: u32,

    /// Timeout of a single bus call, in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Devices on this bus
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
}

fn default_baudrate() -> u32 {
    9600
}

fn default_stopbits() -> u8 {
    1
}

fn default_bytesize() -> u8 {
    8
}

fn default_rtsdelay() -> u32 {
    100
}

fn default_timeout_ms() -> u64 {
    1000
}

/// Serial parity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Parity {
    #[default]
    #[serde(rename = "N", alias = "none")]
    None,
    #[serde(rename = "E", alias = "even")]
    Even,
    #[serde(rename = "O", alias = "odd")]
    Odd,
}

/// RTS line polarity while transmitting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RtsMode {
    #[default]
    #[serde(rename = "U")]
    Up,
    #[serde(rename = "D")]
    Down,
}

impl RtsMode {
    /// RTS level while the line is idle (receiving).
    pub fn idle_level(self) -> bool {
        match self {
            RtsMode::Up => false,
            RtsMode::Down => true,
        }
    }
}

/// Configuration for a single device (slave) on a port.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Optional label used in log output
    #[serde(default)]
    pub device_id: Option<String>,

    /// Modbus slave address (1-247)
    pub slave_id: u8,

    /// Coils exposed as switches
    #[serde(default)]
    pub coils: Vec<CoilConfig>,

    /// Input registers exposed as sensors
    #[serde(default)]
    pub inputs: Vec<InputConfig>,
}

/// A coil exposed as a switch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoilConfig {
    /// Coil address (0-31)
    pub id: u16,
    /// Human-readable name
    pub name: String,
}

/// An input register exposed as a sensor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputConfig {
    /// Register address (1-31)
    pub id: u16,
    /// Human-readable name
    pub name: String,
    /// What the register measures
    pub mode: InputMode,
}

/// Measurement class of an input register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputMode {
    Temperature,
    Voltage,
}

impl ModbusSwConfig {
    /// Load configuration from a JSON5 file.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config: ModbusSwConfig = modbus_sw_common::load_config(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ports.is_empty() {
            return Err(ConfigError::Validation(
                "At least one port must be configured".to_string(),
            ));
        }

        self.poll.validate()?;

        let mut names = HashSet::new();
        for port in &self.ports {
            port.validate()?;
            if !names.insert(port.name.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "Duplicate port name '{}'",
                    port.name
                )));
            }
        }

        Ok(())
    }
}

impl PortConfig {
    /// Validate serial settings and the device list of this port.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.is_empty() {
            return Err(ConfigError::Validation(
                "Port name cannot be empty".to_string(),
            ));
        }

        // The name becomes a single key expression chunk
        if self.name.contains(['/', '*', '$', '?', '#']) {
            return Err(ConfigError::Validation(format!(
                "Port '{}': name must not contain '/', '*', '$', '?' or '#'",
                self.name
            )));
        }

        if self.port.is_empty() {
            return Err(ConfigError::Validation(format!(
                "Port '{}': serial device path cannot be empty",
                self.name
            )));
        }

        if self.baudrate == 0 {
            return Err(ConfigError::Validation(format!(
                "Port '{}': baudrate must be positive",
                self.name
            )));
        }

        if !matches!(self.stopbits, 1 | 2) {
            return Err(ConfigError::Validation(format!(
                "Port '{}': stopbits must be 1 or 2, got {}",
                self.name, self.stopbits
            )));
        }

        if !(5..=8).contains(&self.bytesize) {
            return Err(ConfigError::Validation(format!(
                "Port '{}': bytesize must be 5-8, got {}",
                self.name, self.bytesize
            )));
        }

        if !(1..=MAX_CALL_TIMEOUT_MS).contains(&self.timeout_ms) {
            return Err(ConfigError::Validation(format!(
                "Port '{}': timeout_ms must be 1-{}, got {}",
                self.name, MAX_CALL_TIMEOUT_MS, self.timeout_ms
            )));
        }

        let mut slaves = HashSet::new();
        for device in &self.devices {
            device.validate(&self.name)?;
            if !slaves.insert(device.slave_id) {
                return Err(ConfigError::Validation(format!(
                    "Port '{}': slave_id {} is configured twice",
                    self.name, device.slave_id
                )));
            }
        }

        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl DeviceConfig {
    fn validate(&self, port: &str) -> Result<(), ConfigError> {
        if self.slave_id == 0 || self.slave_id > MAX_SLAVE_ID {
            return Err(ConfigError::Validation(format!(
                "Port '{}': slave_id must be 1-{}, got {}",
                port, MAX_SLAVE_ID, self.slave_id
            )));
        }

        let mut seen = HashSet::new();
        for coil in &self.coils {
            if coil.id > MAX_COIL_ADDRESS {
                return Err(ConfigError::Validation(format!(
                    "Port '{}' slave {}: coil id must be 0-{}, got {}",
                    port, self.slave_id, MAX_COIL_ADDRESS, coil.id
                )));
            }
            if !seen.insert(coil.id) {
                return Err(ConfigError::Validation(format!(
                    "Port '{}' slave {}: duplicate coil id {}",
                    port, self.slave_id, coil.id
                )));
            }
        }

        let mut seen = HashSet::new();
        for input in &self.inputs {
            if !INPUT_ADDRESS_RANGE.contains(&input.id) {
                return Err(ConfigError::Validation(format!(
                    "Port '{}' slave {}: input id must be {}-{}, got {}",
                    port,
                    self.slave_id,
                    INPUT_ADDRESS_RANGE.start(),
                    INPUT_ADDRESS_RANGE.end(),
                    input.id
                )));
            }
            if !seen.insert(input.id) {
                return Err(ConfigError::Validation(format!(
                    "Port '{}' slave {}: duplicate input id {}",
                    port, self.slave_id, input.id
                )));
            }
        }

        Ok(())
    }
}
