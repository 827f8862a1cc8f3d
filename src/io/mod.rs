// src/io/mod.rs
//
// Device IO: physical transports, the byte pump and the frame decoder.
// Transports deliver raw chunks; the pump republishes them on a channel and the
// framer turns that channel into decoded CBOR values.

// Core modules
pub mod error;
pub mod framer;
pub mod pump;
pub mod subscribers;
pub mod transport;

// Physical channels
pub mod serial;
pub mod usb;

pub use error::LinkError;
pub use framer::{decode, CborFramer, DEFAULT_MAX_FRAME_LEN};
pub use pump::{BytePump, ChunkItem, ChunkSource, RawChunk};
pub use subscribers::{SubscriptionId, Subscribers};
pub use transport::{
    DeviceFilter, LinkStatus, ReadOutcome, Transport, TransportConfig, TransportKind,
    TransportProvider,
};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

// ============================================================================
// Shared Types
// ============================================================================

/// Connection lifecycle as seen by the application
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    /// Waiting for a device to be chosen
    Requesting,
    Opening,
    /// Open, no read loop running
    ConnectedIdle,
    /// Open with the pump and decoder running
    ConnectedReading,
    Closing,
}

impl ConnectionState {
    /// Whether writes are accepted in this state
    pub fn is_connected(self) -> bool {
        matches!(
            self,
            ConnectionState::ConnectedIdle | ConnectionState::ConnectedReading
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Requesting => "requesting",
            ConnectionState::Opening => "opening",
            ConnectionState::ConnectedIdle => "connected_idle",
            ConnectionState::ConnectedReading => "connected_reading",
            ConnectionState::Closing => "closing",
        };
        f.write_str(s)
    }
}

/// Get current time in microseconds since UNIX epoch
pub fn now_us() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connected_states() {
        assert!(ConnectionState::ConnectedIdle.is_connected());
        assert!(ConnectionState::ConnectedReading.is_connected());
        assert!(!ConnectionState::Opening.is_connected());
        assert!(!ConnectionState::Closing.is_connected());
        assert!(!ConnectionState::default().is_connected());
    }

    #[test]
    fn test_state_serializes_snake_case() {
        let json = serde_json::to_string(&ConnectionState::ConnectedReading).unwrap();
        assert_eq!(json, "\"connected_reading\"");
        assert_eq!(ConnectionState::ConnectedIdle.to_string(), "connected_idle");
    }
}
