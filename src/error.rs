//! Error taxonomy for the whole device stack.
//!
//! Transport-level errors always resolve exactly one pending exchange and
//! leave the queue intact for the next one; controller-level errors are
//! caught at the tick boundary and logged rather than crashing the process.

use std::time::Duration;

/// All errors produced by the frame codec, the serial transport, the value
/// cache and the heat pump controller.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Wire text that does not form a hex-ASCII frame. Fatal to that frame
    /// only, and distinct from [`Error::Checksum`]: a frame with a bad LRC
    /// still parses.
    #[error("malformed frame: {0}")]
    Frame(String),

    /// Frame was well-formed but its LRC did not match the payload.
    #[error("LRC checksum mismatch in response frame")]
    Checksum,

    /// No (or only a partial) response arrived within the bound.
    #[error("modbus exchange timed out after {0:?}")]
    Timeout(Duration),

    /// Arguments to a request builder outside the protocol's domain.
    #[error("invalid request: {0}")]
    InvalidRequest(&'static str),

    /// Caller supplied a register value outside the descriptor's valid
    /// domain. Rejected before anything is written to the wire.
    #[error("value {value} out of range for register {register}")]
    Range { register: u16, value: f64 },

    /// Register id that is not part of the catalog.
    #[error("register {0} is not known")]
    UnknownRegister(u16),

    /// Write attempt on a register the catalog marks read-only.
    #[error("register {0} is read-only")]
    ReadOnly(u16),

    /// A bounded wait loop detected that the controller's mode was replaced
    /// while it was waiting.
    #[error("controller mode changed away from {expected} while waiting")]
    StateAborted { expected: &'static str },

    /// The device answered, but not with what the exchange called for.
    #[error("unexpected response: {0}")]
    Response(String),

    /// Serial channel I/O failure.
    #[error("serial I/O: {0}")]
    Io(#[from] std::io::Error),

    /// The transport worker is gone; no further exchanges are possible.
    #[error("transport closed")]
    TransportClosed,

    /// Operator-supplied controller configuration failed validation. The
    /// previous configuration and state stay untouched.
    #[error("invalid config: {0}")]
    Config(String),

    /// The controller task is no longer running.
    #[error("controller stopped")]
    ControllerStopped,
}

pub type Result<T> = std::result::Result<T, Error>;
