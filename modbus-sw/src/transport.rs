//! Blocking bus transport contract and its Modbus RTU implementation.
//!
//! Every method blocks the calling thread. The scheduler only calls them from
//! a blocking worker while it holds the port's gate.

use crate::config::{Parity, PortConfig, RtsMode};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio_modbus::client::Context;
use tokio_modbus::prelude::*;
use tokio_serial::SerialPort;
use tracing::{debug, info};

/// Errors raised by a bus transport call.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    Connection(String),
    #[error("Transport is not connected")]
    NotConnected,
    #[error("Bus call timed out after {0:?}")]
    Timeout(Duration),
    #[error("Bus I/O error: {0}")]
    Io(String),
    #[error("Modbus exception: {0}")]
    Exception(String),
    #[error("Malformed response: {0}")]
    Malformed(String),
}

/// Synchronous driver bound to one physical port.
pub trait BusTransport: Send {
    fn connect(&mut self) -> Result<(), TransportError>;

    /// Address the next operations to `slave_id`.
    fn select_slave(&mut self, slave_id: u8);

    fn read_bits(&mut self, start: u16, count: u16) -> Result<Vec<bool>, TransportError>;

    fn read_input_registers(&mut self, start: u16, count: u16)
    -> Result<Vec<u16>, TransportError>;

    fn write_bit(&mut self, address: u16, value: bool) -> Result<(), TransportError>;
}

/// Serial line settings of an RTU port.
#[derive(Debug, Clone, PartialEq)]
pub struct SerialSettings {
    pub path: String,
    pub baud_rate: u32,
    pub parity: Parity,
    pub data_bits: u8,
    pub stop_bits: u8,
    pub rts_mode: RtsMode,
    pub rts_pin: u32,
    pub rts_delay_us: u32,
    /// Per-call timeout
    pub timeout: Duration,
}

impl From<&PortConfig> for SerialSettings {
    fn from(config: &PortConfig) -> Self {
        Self {
            path: config.port.clone(),
            baud_rate: config.baudrate,
            parity: config.parity,
            data_bits: config.bytesize,
            stop_bits: config.stopbits,
            rts_mode: config.rtsmode,
            rts_pin: config.rtspin,
            rts_delay_us: config.rtsdelay,
            timeout: config.timeout(),
        }
    }
}

impl SerialSettings {
    fn builder(&self) -> tokio_serial::SerialPortBuilder {
        let parity = match self.parity {
            Parity::None => tokio_serial::Parity::None,
            Parity::Even => tokio_serial::Parity::Even,
            Parity::Odd => tokio_serial::Parity::Odd,
        };

        let stop_bits = match self.stop_bits {
            2 => tokio_serial::StopBits::Two,
            _ => tokio_serial::StopBits::One,
        };

        let data_bits = match self.data_bits {
            5 => tokio_serial::DataBits::Five,
            6 => tokio_serial::DataBits::Six,
            7 => tokio_serial::DataBits::Seven,
            _ => tokio_serial::DataBits::Eight,
        };

        tokio_serial::new(&self.path, self.baud_rate)
            .parity(parity)
            .stop_bits(stop_bits)
            .data_bits(data_bits)
            .timeout(self.timeout)
    }
}

/// Modbus RTU transport over a serial line.
///
/// Wraps the async `tokio-modbus` client and drives it to completion on the
/// runtime behind `runtime`. Must only be used from threads that are not
/// runtime workers, e.g. `spawn_blocking` workers, and requires a
/// multi-threaded runtime so the I/O driver keeps running.
pub struct RtuTransport {
    settings: SerialSettings,
    runtime: Handle,
    ctx: Option<Context>,
    slave: Slave,
}

impl RtuTransport {
    pub fn new(settings: SerialSettings, runtime: Handle) -> Self {
        Self {
            settings,
            runtime,
            ctx: None,
            slave: Slave::broadcast(),
        }
    }

    pub fn settings(&self) -> &SerialSettings {
        &self.settings
    }

    fn context(&mut self) -> Result<&mut Context, TransportError> {
        self.ctx.as_mut().ok_or(TransportError::NotConnected)
    }
}

impl fmt::Debug for RtuTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RtuTransport")
            .field("settings", &self.settings)
            .field("connected", &self.ctx.is_some())
            .finish()
    }
}

/// Collapse timeout, transport and Modbus exception layers into one error.
fn flatten<T, E, X>(
    outcome: Result<Result<Result<T, X>, E>, tokio::time::error::Elapsed>,
    timeout: Duration,
) -> Result<T, TransportError>
where
    E: fmt::Display,
    X: fmt::Debug,
{
    outcome
        .map_err(|_| TransportError::Timeout(timeout))?
        .map_err(|e| TransportError::Io(e.to_string()))?
        .map_err(|e| TransportError::Exception(format!("{:?}", e)))
}

impl BusTransport for RtuTransport {
    fn connect(&mut self) -> Result<(), TransportError> {
        let settings = &self.settings;
        info!(
            port = %settings.path,
            baud_rate = settings.baud_rate,
            parity = ?settings.parity,
            data_bits = settings.data_bits,
            stop_bits = settings.stop_bits,
            rts_mode = ?settings.rts_mode,
            rts_pin = settings.rts_pin,
            rts_delay_us = settings.rts_delay_us,
            "Opening RS-485 port"
        );

        let builder = settings.builder();
        let mut serial = {
            // Registering the stream needs the runtime's reactor
            let _guard = self.runtime.enter();
            tokio_serial::SerialStream::open(&builder)
        }
        .map_err(|e| {
            TransportError::Connection(format!("Serial open failed on {}: {}", settings.path, e))
        })?;

        serial
            .write_request_to_send(settings.rts_mode.idle_level())
            .map_err(|e| {
                TransportError::Connection(format!("Cannot set RTS on {}: {}", settings.path, e))
            })?;

        self.ctx = Some(rtu::attach_slave(serial, self.slave));
        Ok(())
    }

    fn select_slave(&mut self, slave_id: u8) {
        self.slave = Slave(slave_id);
        if let Some(ctx) = self.ctx.as_mut() {
            ctx.set_slave(self.slave);
        }
    }

    fn read_bits(&mut self, start: u16, count: u16) -> Result<Vec<bool>, TransportError> {
        let runtime = self.runtime.clone();
        let timeout = self.settings.timeout;
        let ctx = self.context()?;

        debug!(start, count, "read_coils");
        let outcome = runtime
            .block_on(async { tokio::time::timeout(timeout, ctx.read_coils(start, count)).await });
        flatten(outcome, timeout)
    }

    fn read_input_registers(
        &mut self,
        start: u16,
        count: u16,
    ) -> Result<Vec<u16>, TransportError> {
        let runtime = self.runtime.clone();
        let timeout = self.settings.timeout;
        let ctx = self.context()?;

        debug!(start, count, "read_input_registers");
        let outcome = runtime.block_on(async {
            tokio::time::timeout(timeout, ctx.read_input_registers(start, count)).await
        });
        flatten(outcome, timeout)
    }

    fn write_bit(&mut self, address: u16, value: bool) -> Result<(), TransportError> {
        let runtime = self.runtime.clone();
        let timeout = self.settings.timeout;
        let ctx = self.context()?;

        debug!(address, value, "write_single_coil");
        let outcome = runtime.block_on(async {
            tokio::time::timeout(timeout, ctx.write_single_coil(address, value)).await
        });
        flatten(outcome, timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModbusSwConfig;

    #[test]
    fn test_settings_from_port_config() {
        let json = r#"{
            ports: [
                { name: "P1", port: "/dev/ttyUSB1", baudrate: 19200, parity: "O", rtspin: 4, timeout_ms: 250 }
            ]
        }"#;
        let config: ModbusSwConfig = modbus_sw_common::parse_config(json).unwrap();
        let settings = SerialSettings::from(&config.ports[0]);

        assert_eq!(settings.path, "/dev/ttyUSB1");
        assert_eq!(settings.baud_rate, 19200);
        assert_eq!(settings.parity, Parity::Odd);
        assert_eq!(settings.rts_mode, RtsMode::Up);
        assert!(!settings.rts_mode.idle_level());
        assert_eq!(settings.rts_pin, 4);
        assert_eq!(settings.rts_delay_us, 100);
        assert_eq!(settings.timeout, Duration::from_millis(250));
    }

    #[test]
    fn test_flatten_layers() {
        let timeout = Duration::from_millis(5);

        let ok: Result<Result<Result<u8, String>, String>, tokio::time::error::Elapsed> =
            Ok(Ok(Ok(7)));
        assert_eq!(flatten(ok, timeout).unwrap(), 7);

        let io: Result<Result<Result<u8, String>, String>, tokio::time::error::Elapsed> =
            Ok(Err("broken pipe".to_string()));
        assert!(matches!(flatten(io, timeout), Err(TransportError::Io(_))));

        let exception: Result<Result<Result<u8, String>, String>, tokio::time::error::Elapsed> =
            Ok(Ok(Err("IllegalDataAddress".to_string())));
        assert!(matches!(
            flatten(exception, timeout),
            Err(TransportError::Exception(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn test_calls_before_connect_fail() {
        let settings = SerialSettings {
            path: "/dev/null-modbus".to_string(),
            baud_rate: 9600,
            parity: Parity::None,
            data_bits: 8,
            stop_bits: 1,
            rts_mode: RtsMode::Up,
            rts_pin: 22,
            rts_delay_us: 100,
            timeout: Duration::from_millis(50),
        };
        let mut transport = RtuTransport::new(settings, Handle::current());

        let result = tokio::task::spawn_blocking(move || {
            transport.select_slave(3);
            transport.read_bits(0, 4)
        })
        .await
        .unwrap();

        assert!(matches!(result, Err(TransportError::NotConnected)));
    }
}
