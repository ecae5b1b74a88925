//! Half-duplex serial link to a remote microcontroller
//!
//! The link is a byte-oriented full-duplex transfer (every byte written shifts
//! one byte back, SPI style) plus a single "ready" line driven by the remote
//! device. On top of it runs a small protocol:
//!
//! - **Handshake**: probe with `0xFF` until the remote answers `FF FE FD` while
//!   raising the ready line, seed the heartbeat from a config exchange, then send
//!   the 4-byte payload format message
//! - **Steady state**: every tick read one heartbeat byte (must strictly
//!   increase); when the ready line is high send `MESSAGE` plus the payload
//! - **Recovery**: 50 consecutive heartbeat errors force a new handshake
//!
//! [`SerialLinkSession`] runs the protocol on its own thread and is fed by the
//! pipeline's postprocessor. [`SimulatedPeripheral`] emulates the remote firmware.

use thiserror::Error;

pub mod peripheral;
pub mod port;
pub mod protocol;
pub mod session;

pub use peripheral::{PeripheralPhase, SimulatedPeripheral, SimulatedPort, SimulatedSignal};
pub use port::{LinkPort, SignalLine};
pub use protocol::{HandshakeWindow, HeartbeatMonitor, PayloadFormat};
pub use session::{BoxedDriver, LinkDriver, LinkSettings, LinkState, LinkStatus, SerialLinkSession, TickOutcome};

#[derive(Error, Debug)]
pub enum LinkError {
    #[error("Link I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Short transfer: sent {expected} bytes, got {actual} back")]
    ShortTransfer { expected: usize, actual: usize },

    #[error("Payload must be {expected} bytes, got {actual}")]
    PayloadLength { expected: usize, actual: usize },

    #[error("Payload of {0} elements does not fit the one-byte format field")]
    PayloadTooLong(usize),

    #[error("Payload must contain at least one element")]
    EmptyPayload,

    #[error("Unsupported payload data type {0}")]
    UnsupportedDataType(u8),

    #[error("Link session already started")]
    AlreadyStarted,
}
