// src/io/usb/mod.rs
//
// USB bulk transport using the nusb crate.
//
// The device is reached directly through libusb-free platform APIs: one interface
// is claimed and a bulk IN / bulk OUT endpoint pair carries the byte stream.

use serde::{Deserialize, Serialize};

use crate::io::transport::DeviceFilter;

pub mod transport;

pub use transport::{list_usb_devices, UsbProvider, UsbTransport};

// ============================================================================
// Configuration
// ============================================================================

/// Interface and endpoint selection applied when a USB device is opened
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UsbConfig {
    /// Configuration value to select if the device is not already in it
    pub configuration: u8,
    /// Interface number to claim
    pub interface: u8,
    /// Bulk IN endpoint number (direction bit optional)
    pub endpoint_in: u8,
    /// Bulk OUT endpoint number
    pub endpoint_out: u8,
    /// Bytes requested per IN transfer, rounded up to the max packet size
    pub transfer_size: usize,
}

impl Default for UsbConfig {
    fn default() -> Self {
        UsbConfig {
            configuration: 1,
            interface: 0,
            endpoint_in: 1,
            endpoint_out: 1,
            transfer_size: 64,
        }
    }
}

impl UsbConfig {
    /// Endpoint address of the bulk IN endpoint (0x80 | number)
    pub fn in_address(&self) -> u8 {
        0x80 | (self.endpoint_in & 0x0f)
    }

    /// Endpoint address of the bulk OUT endpoint
    pub fn out_address(&self) -> u8 {
        self.endpoint_out & 0x0f
    }
}

// ============================================================================
// Device Description
// ============================================================================

/// A USB device visible on this host
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct UsbDeviceInfo {
    pub bus_id: String,
    pub address: u8,
    pub vendor_id: u16,
    pub product_id: u16,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
    pub serial_number: Option<String>,
    /// Class codes of every interface the device exposes
    pub interface_classes: Vec<u8>,
}

impl UsbDeviceInfo {
    pub fn matches(&self, filter: &DeviceFilter) -> bool {
        if filter.path.is_some() {
            // Port paths only make sense for serial devices
            return false;
        }
        if let Some(class) = filter.class_code {
            if !self.interface_classes.contains(&class) {
                return false;
            }
        }
        filter.matches_ids(
            Some(self.vendor_id),
            Some(self.product_id),
            self.serial_number.as_deref(),
        )
    }

    pub fn describe(&self) -> String {
        format!(
            "usb({}:{} {:04x}:{:04x})",
            self.bus_id, self.address, self.vendor_id, self.product_id
        )
    }
}

/// Index of the first device matching any filter. No filters means any device.
pub fn select_device(devices: &[UsbDeviceInfo], filters: &[DeviceFilter]) -> Option<usize> {
    devices
        .iter()
        .position(|d| filters.is_empty() || filters.iter().any(|f| d.matches(f)))
}

// ============================================================================
// Tests
// ============================================================================
