//! Supervision and control of a NIBE 1155 ground-source heat pump over
//! its MODBUS 40 serial interface.
//!
//! The device speaks a hex-ASCII variant of Modbus on a half-duplex
//! RS-485 link. This crate provides the full stack on top of that link:
//!
//! 1. **Frame codec** ([`frame`]): pure encode/decode of the hex-ASCII
//!    wire format with LRC checksum handling.
//! 2. **Serial transport** ([`transport`]): strictly sequential
//!    request/response exchanges with echo suppression, byte-stream
//!    reframing and two-tier timeouts.
//! 3. **Register catalog** ([`registers`]): immutable decoding metadata
//!    per register, partitioned into the high-rate LOG.SET block and a
//!    slow round-robin set.
//! 4. **Value cache & scheduler** ([`device`]): keeps every register's
//!    latest decoded value fresh while multiplexing ad-hoc reads and
//!    writes onto the single link.
//! 5. **Controller** ([`controller`]): the heat pump control state
//!    machine: degree-minutes steering, cut-off frequency bands and
//!    bounded switch-on/off sequencing under hard safety limits.
//!
//! # Quick start
//!
//! ```no_run
//! use nibe1155_lib::controller::{HeatPump, HeatPumpConfig, Timing};
//! use nibe1155_lib::device::{Nibe1155, POLL_PERIOD};
//! use nibe1155_lib::dmlog::DmLog;
//! use nibe1155_lib::registers::Catalog;
//! use nibe1155_lib::transport::ModbusSerial;
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let serial = ModbusSerial::open("/dev/ttyUSB0", 9600, Default::default())?;
//!     let dev = Nibe1155::start(serial, Catalog::new(), POLL_PERIOD);
//!
//!     let config = HeatPumpConfig::Frequency {
//!         f_setpoint: 50.0,
//!         p_add_heater: 0.0,
//!     };
//!     let (controller, handle) =
//!         HeatPump::new(dev.clone(), config, DmLog::new("/var/log/nibehpc"), Timing::default())?;
//!     controller.spawn();
//!
//!     loop {
//!         tokio::time::sleep(std::time::Duration::from_secs(10)).await;
//!         let snapshot = handle.snapshot();
//!         println!("{:?} at {:.1} Hz", snapshot.state, snapshot.f_compressor);
//!     }
//! }
//! ```

pub mod config;
pub mod controller;
pub mod device;
pub mod dmlog;
pub mod error;
pub mod frame;
pub mod registers;
pub mod request;
pub mod transport;
pub mod value;

#[cfg(test)]
pub(crate) mod testutil;
