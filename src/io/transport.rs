// src/io/transport.rs
//
// Uniform open/close/read/write over a physical channel.
// Serial and USB bulk implementations live in io/serial and io/usb.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;

use super::error::LinkError;
use super::serial::SerialConfig;
use super::usb::UsbConfig;

/// Physical channel family
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    #[default]
    Serial,
    Usb,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Serial => write!(f, "serial"),
            TransportKind::Usb => write!(f, "usb"),
        }
    }
}

/// Channel-specific settings passed to [`Transport::open`]
#[derive(Clone, Debug, PartialEq)]
pub enum TransportConfig {
    Serial(SerialConfig),
    Usb(UsbConfig),
}

impl TransportConfig {
    pub fn kind(&self) -> TransportKind {
        match self {
            TransportConfig::Serial(_) => TransportKind::Serial,
            TransportConfig::Usb(_) => TransportKind::Usb,
        }
    }
}

/// Criteria used by [`TransportProvider::request`] to pick a device.
/// Every field that is set must match; an empty filter matches anything.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceFilter {
    pub vendor_id: Option<u16>,
    pub product_id: Option<u16>,
    /// USB interface class (USB only)
    pub class_code: Option<u8>,
    pub serial_number: Option<String>,
    /// Port path such as "/dev/ttyACM0" or "COM3" (serial only)
    pub path: Option<String>,
}

impl DeviceFilter {
    pub fn vid_pid(vendor_id: u16, product_id: u16) -> Self {
        DeviceFilter {
            vendor_id: Some(vendor_id),
            product_id: Some(product_id),
            ..DeviceFilter::default()
        }
    }

    pub fn path(path: impl Into<String>) -> Self {
        DeviceFilter {
            path: Some(path.into()),
            ..DeviceFilter::default()
        }
    }

    /// Check the identity fields shared by serial and USB candidates.
    pub fn matches_ids(
        &self,
        vendor_id: Option<u16>,
        product_id: Option<u16>,
        serial_number: Option<&str>,
    ) -> bool {
        if self.vendor_id.is_some() && self.vendor_id != vendor_id {
            return false;
        }
        if self.product_id.is_some() && self.product_id != product_id {
            return false;
        }
        if let Some(ref want) = self.serial_number {
            if serial_number != Some(want.as_str()) {
                return false;
            }
        }
        true
    }
}

/// Result of a single read
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReadOutcome {
    /// Bytes delivered by one read; may be empty
    Chunk(Vec<u8>),
    /// The channel was closed locally or by the peer
    EndOfStream,
}

/// An open-able physical channel. Implementations use interior mutability so a
/// single `Arc<dyn Transport>` can be read by the pump while being written to.
#[async_trait]
pub trait Transport: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Human-readable device description used in logs and errors
    fn describe(&self) -> String;

    fn is_open(&self) -> bool;

    /// Watch the open flag. Flips to `false` on close or when the device disappears.
    fn status(&self) -> watch::Receiver<bool>;

    /// Open with the given settings. Opening an open channel is a no-op.
    async fn open(&self, config: &TransportConfig) -> Result<(), LinkError>;

    /// Close the channel. Always safe to call, also while a read is in flight.
    async fn close(&self) -> Result<(), LinkError>;

    /// Read at most one buffer's worth of bytes.
    async fn read_chunk(&self) -> Result<ReadOutcome, LinkError>;

    /// Write a complete buffer.
    async fn write_chunk(&self, bytes: &[u8]) -> Result<(), LinkError>;
}

/// Obtains transports of one kind.
#[async_trait]
pub trait TransportProvider: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Whether the host exposes this kind of channel at all
    fn is_supported(&self) -> bool;

    /// Pick a device matching any of `filters` (all devices when empty).
    async fn request(&self, filters: &[DeviceFilter]) -> Result<Arc<dyn Transport>, LinkError>;
}

/// Open flag shared between a transport and its observers.
#[derive(Debug)]
pub struct LinkStatus {
    tx: watch::Sender<bool>,
}

impl LinkStatus {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        LinkStatus { tx }
    }

    pub fn set(&self, open: bool) {
        self.tx.send_replace(open);
    }

    pub fn get(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

impl Default for LinkStatus {
    fn default() -> Self {
        LinkStatus::new()
    }
}
