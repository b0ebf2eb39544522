//! Error types for the meterlink library.

use thiserror::Error;

/// The main error type for meterlink operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Serial port error.
    #[error("serial port error: {0}")]
    Serial(#[from] tokio_serial::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Link-layer frame decoding error.
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    /// Link-layer exchange failure.
    #[error("link error: {0}")]
    Link(#[from] LinkError),

    /// The channel is not open (never opened, closed, or the peer hung up).
    #[error("channel not open")]
    NotOpen,

    /// A channel with this name is already open.
    #[error("channel already open: {name}")]
    AlreadyOpen { name: String },

    /// No channel is registered under the given handle.
    #[error("unknown channel handle: {0}")]
    UnknownChannel(u32),

    /// The component was shut down and no longer accepts work.
    #[error("shut down")]
    ShutDown,

    /// A background task was requested outside of a Tokio runtime.
    #[error("no Tokio runtime available")]
    NoRuntime,
}

/// Link-layer frame errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// Frame payload exceeds what the length byte can describe.
    #[error("payload too large: {size} bytes exceeds maximum {max}")]
    TooLarge { size: usize, max: usize },

    /// Ack and Nak frames do not carry a payload.
    #[error("{kind} frames carry no payload")]
    UnexpectedPayload { kind: &'static str },
}

/// Failures of a single ARQ exchange.
///
/// None of these are fatal to the channel; only [`LinkError::Degraded`]
/// requires an explicit resync before the next send.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LinkError {
    /// No acknowledgment after the configured number of retransmissions.
    #[error("no acknowledgment after {attempts} attempts")]
    RetriesExhausted { attempts: u32 },

    /// The peer answered with an Error frame.
    #[error("peer reported error code {code:#04x}")]
    Peer { code: u8 },

    /// A previous Error frame degraded the link; resync first.
    #[error("link degraded, resync required")]
    Degraded,

    /// The peer kept signalling not-ready past the poll timeout.
    #[error("peer not ready after {timeout_ms}ms")]
    PeerNotReady { timeout_ms: u64 },

    /// The exchange was cancelled by the caller.
    #[error("exchange cancelled")]
    Cancelled,

    /// The underlying channel closed during the exchange.
    #[error("channel closed")]
    Closed,

    /// The payload could not be framed.
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    /// Writing to the channel failed.
    #[error("transport failure: {message}")]
    Transport { message: String },
}

/// Result type alias for meterlink operations.
pub type Result<T> = std::result::Result<T, Error>;
