// src/io/error.rs
//
// Error taxonomy for the transport and messaging stack.

use thiserror::Error;

/// Errors raised by transports, the byte pump, the frame decoder, the message
/// layer and the connection manager.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum LinkError {
    /// The host exposes no serial or USB access. Terminal.
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// No device was chosen. The caller may retry.
    #[error("No device selected")]
    NoSelection,

    #[error("Open failed: {0}")]
    OpenFailed(String),

    #[error("Read failed: {0}")]
    ReadFailed(String),

    #[error("Write failed: {0}")]
    WriteFailed(String),

    /// The byte stream ended in the middle of a value.
    #[error("Truncated frame: stream closed with {pending} byte(s) of a partial value")]
    TruncatedFrame { pending: usize },

    #[error("Decode error: {0}")]
    DecodeError(String),

    #[error("Encode failed: {0}")]
    EncodeFailed(String),

    /// A decoded value is not a message this layer understands. Non-fatal.
    #[error("Unrecognized message: {0}")]
    UnrecognizedMessage(String),

    #[error("Not connected")]
    NotConnected,

    /// An awaited request for this operation is still outstanding.
    #[error("Request already in flight for '{0}'")]
    RequestInFlight(String),

    /// The device went away or the connection was torn down underneath the caller.
    #[error("Device disconnected")]
    Disconnected,

    #[error("Configuration error: {0}")]
    Config(String),
}

impl LinkError {
    /// Open failure prefixed with the device it concerns.
    pub fn open_failed(device: &str, message: impl std::fmt::Display) -> Self {
        LinkError::OpenFailed(format!("{}: {}", device, message))
    }

    /// Read failure prefixed with the device it concerns.
    pub fn read_failed(device: &str, message: impl std::fmt::Display) -> Self {
        LinkError::ReadFailed(format!("{}: {}", device, message))
    }

    /// Write failure prefixed with the device it concerns.
    pub fn write_failed(device: &str, message: impl std::fmt::Display) -> Self {
        LinkError::WriteFailed(format!("{}: {}", device, message))
    }

    pub fn decode(message: impl std::fmt::Display) -> Self {
        LinkError::DecodeError(message.to_string())
    }

    pub fn unrecognized(message: impl std::fmt::Display) -> Self {
        LinkError::UnrecognizedMessage(message.to_string())
    }

    /// Whether this error ends the current connection.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            LinkError::OpenFailed(_)
                | LinkError::ReadFailed(_)
                | LinkError::WriteFailed(_)
                | LinkError::TruncatedFrame { .. }
                | LinkError::DecodeError(_)
                | LinkError::Disconnected
        )
    }

    /// Whether the same action may simply be retried by the user.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, LinkError::Unsupported(_) | LinkError::Config(_))
    }
}
