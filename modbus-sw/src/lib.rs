//! RS-485 Modbus RTU switch bridge.
//!
//! Relay and sensor boards on one or more serial buses are exposed to a home
//! automation host over Zenoh: coils become switches, input registers become
//! sensors.
//!
//! Each port is owned by a [`scheduler::PortScheduler`] that serializes every
//! bus operation behind a FIFO gate, so a switch command never interleaves
//! with a poll sweep on the wire.
//!
//! # Key Expressions
//!
//! ```text
//! modbus_sw/<port>/<slave>/coil<address>        switch state
//! modbus_sw/<port>/<slave>/coil<address>/set    switch command
//! modbus_sw/<port>/<slave>/input<address>       sensor state
//! modbus_sw/@/status                            bridge status
//! ```

pub mod bridge;
pub mod config;
pub mod entity;
pub mod register_map;
pub mod registry;
pub mod scheduler;
pub mod topology;
pub mod transport;
