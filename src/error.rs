//! Error types for the servolink library.

use thiserror::Error;

/// The main error type for servolink operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Serial port error.
    #[error("serial port error: {0}")]
    Serial(#[from] tokio_serial::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Frame encoding/decoding error.
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    /// Packet text could not be parsed or produced.
    #[error("packet error: {0}")]
    Packet(#[from] serde_json::Error),

    /// A field the caller required is absent from the packet.
    #[error("missing field: {field}")]
    MissingField { field: &'static str },

    /// Error reported verbatim by the device.
    #[error("device error: {message}")]
    Device { message: String },

    /// Broker client error.
    #[error("broker error: {message}")]
    Broker { message: String },

    /// Operation timed out waiting for a response.
    #[error("timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// Connection is not established.
    #[error("not connected")]
    NotConnected,

    /// Channel send error.
    #[error("channel send error")]
    ChannelSend,

    /// Channel receive error.
    #[error("channel closed")]
    ChannelClosed,
}

impl From<rumqttc::ClientError> for Error {
    fn from(e: rumqttc::ClientError) -> Self {
        Self::Broker {
            message: e.to_string(),
        }
    }
}

impl From<rumqttc::ConnectionError> for Error {
    fn from(e: rumqttc::ConnectionError) -> Self {
        Self::Broker {
            message: e.to_string(),
        }
    }
}

/// Frame-specific errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    /// Payload contains one of the reserved marker bytes.
    #[error("payload contains reserved byte 0x{byte:02x} at offset {offset}")]
    ReservedByte { byte: u8, offset: usize },

    /// Frame payload exceeds maximum size.
    #[error("frame too large: {size} bytes exceeds maximum {max}")]
    TooLarge { size: usize, max: usize },
}

/// Result type alias for servolink operations.
pub type Result<T> = std::result::Result<T, Error>;
