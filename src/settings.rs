// src/settings.rs
//
// Link configuration: which transport to use, its line/endpoint settings and the
// device filters used when requesting a device. Loaded from TOML or built from a
// connection profile.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

use crate::io::error::LinkError;
use crate::io::framer::DEFAULT_MAX_FRAME_LEN;
use crate::io::serial::{parse_flow_control, parse_parity, SerialConfig};
use crate::io::transport::{DeviceFilter, TransportConfig, TransportKind};
use crate::io::usb::UsbConfig;

/// Saved connection profile
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct LinkProfile {
    pub id: String,
    pub name: String,
    pub kind: String, // "serial", "usb"
    pub connection: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct LinkSettings {
    #[serde(default)]
    pub kind: TransportKind,
    #[serde(default)]
    pub serial: SerialConfig,
    #[serde(default)]
    pub usb: UsbConfig,
    /// Devices accepted by request(); empty accepts any device
    #[serde(default)]
    pub filters: Vec<DeviceFilter>,
    /// Chunks buffered between the pump and the decoder
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    #[serde(default = "default_max_frame_len")]
    pub max_frame_len: usize,
}

fn default_channel_capacity() -> usize {
    64
}

fn default_max_frame_len() -> usize {
    DEFAULT_MAX_FRAME_LEN
}

impl Default for LinkSettings {
    fn default() -> Self {
        LinkSettings {
            kind: TransportKind::default(),
            serial: SerialConfig::default(),
            usb: UsbConfig::default(),
            filters: Vec::new(),
            channel_capacity: default_channel_capacity(),
            max_frame_len: default_max_frame_len(),
        }
    }
}

impl LinkSettings {
    pub fn serial() -> Self {
        LinkSettings::default()
    }

    pub fn usb() -> Self {
        LinkSettings {
            kind: TransportKind::Usb,
            ..LinkSettings::default()
        }
    }

    pub fn with_filter(mut self, filter: DeviceFilter) -> Self {
        self.filters.push(filter);
        self
    }

    /// Settings handed to `Transport::open` for the selected kind
    pub fn transport_config(&self) -> TransportConfig {
        match self.kind {
            TransportKind::Serial => TransportConfig::Serial(self.serial.clone()),
            TransportKind::Usb => TransportConfig::Usb(self.usb.clone()),
        }
    }

    pub fn validate(&self) -> Result<(), LinkError> {
        if self.channel_capacity == 0 {
            return Err(LinkError::Config("channel_capacity must be at least 1".to_string()));
        }
        if self.max_frame_len == 0 {
            return Err(LinkError::Config("max_frame_len must be at least 1".to_string()));
        }
        if self.kind == TransportKind::Serial {
            self.serial
                .validate()
                .map_err(|e| LinkError::Config(e.to_string()))?;
        }
        if self.kind == TransportKind::Usb && self.usb.transfer_size == 0 {
            return Err(LinkError::Config("usb.transfer_size must be at least 1".to_string()));
        }
        Ok(())
    }

    pub fn from_toml_str(text: &str) -> Result<Self, LinkError> {
        let settings: LinkSettings =
            toml::from_str(text).map_err(|e| LinkError::Config(format!("Invalid settings: {}", e)))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn to_toml_string(&self) -> Result<String, LinkError> {
        toml::to_string_pretty(self)
            .map_err(|e| LinkError::Config(format!("Failed to serialize settings: {}", e)))
    }
}

/// Load settings from a TOML file. A missing file yields the defaults.
pub fn load_settings(path: &Path) -> Result<LinkSettings, LinkError> {
    if !path.exists() {
        tlog!("[settings] {} not found, using defaults", path.display());
        return Ok(LinkSettings::default());
    }
    let text = std::fs::read_to_string(path)
        .map_err(|e| LinkError::Config(format!("Failed to read {}: {}", path.display(), e)))?;
    LinkSettings::from_toml_str(&text)
}

pub fn save_settings(path: &Path, settings: &LinkSettings) -> Result<(), LinkError> {
    let text = settings.to_toml_string()?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| {
            LinkError::Config(format!("Failed to create {}: {}", parent.display(), e))
        })?;
    }
    std::fs::write(path, text)
        .map_err(|e| LinkError::Config(format!("Failed to write {}: {}", path.display(), e)))
}

// ============================================================================
// Profile Parsing
// ============================================================================

/// Integer from a number or a decimal/"0x" hex string
fn get_int(connection: &HashMap<String, serde_json::Value>, key: &str) -> Option<i64> {
    connection.get(key).and_then(|v| {
        v.as_i64().or_else(|| {
            v.as_str().and_then(|s| {
                let s = s.trim();
                match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
                    Some(hex) => i64::from_str_radix(hex, 16).ok(),
                    None => s.parse().ok(),
                }
            })
        })
    })
}

fn get_str<'a>(connection: &'a HashMap<String, serde_json::Value>, key: &str) -> Option<&'a str> {
    connection.get(key).and_then(|v| v.as_str())
}

fn get_ranged<T: TryFrom<i64>>(
    connection: &HashMap<String, serde_json::Value>,
    key: &str,
) -> Result<Option<T>, LinkError> {
    match get_int(connection, key) {
        None => Ok(None),
        Some(n) => T::try_from(n)
            .map(Some)
            .map_err(|_| LinkError::Config(format!("'{}' out of range: {}", key, n))),
    }
}

/// Build link settings from a profile. Unknown keys are ignored; numbers may be
/// given as JSON numbers or strings.
pub fn parse_link_profile(profile: &LinkProfile) -> Result<LinkSettings, LinkError> {
    let conn = &profile.connection;
    let mut settings = match profile.kind.to_lowercase().as_str() {
        "serial" => LinkSettings::serial(),
        "usb" => LinkSettings::usb(),
        other => {
            return Err(LinkError::Config(format!(
                "Profile '{}' has unsupported kind '{}'",
                profile.name, other
            )))
        }
    };

    // Serial line settings
    if let Some(v) = get_ranged::<u32>(conn, "baud_rate")? {
        settings.serial.baud_rate = v;
    }
    if let Some(v) = get_ranged::<u8>(conn, "data_bits")? {
        settings.serial.data_bits = v;
    }
    if let Some(v) = get_ranged::<u8>(conn, "stop_bits")? {
        settings.serial.stop_bits = v;
    }
    if let Some(v) = get_str(conn, "parity") {
        settings.serial.parity = parse_parity(v);
    }
    if let Some(v) = get_str(conn, "flow_control") {
        settings.serial.flow_control = parse_flow_control(v);
    }
    if let Some(v) = get_ranged::<usize>(conn, "buffer_size")? {
        settings.serial.buffer_size = v;
    }

    // USB endpoint settings
    if let Some(v) = get_ranged::<u8>(conn, "configuration")? {
        settings.usb.configuration = v;
    }
    if let Some(v) = get_ranged::<u8>(conn, "interface")? {
        settings.usb.interface = v;
    }
    if let Some(v) = get_ranged::<u8>(conn, "endpoint_in")? {
        settings.usb.endpoint_in = v;
    }
    if let Some(v) = get_ranged::<u8>(conn, "endpoint_out")? {
        settings.usb.endpoint_out = v;
    }
    if let Some(v) = get_ranged::<usize>(conn, "transfer_size")? {
        settings.usb.transfer_size = v;
    }

    // Device selection
    let filter = DeviceFilter {
        vendor_id: get_ranged::<u16>(conn, "vendor_id")?,
        product_id: get_ranged::<u16>(conn, "product_id")?,
        class_code: get_ranged::<u8>(conn, "class_code")?,
        serial_number: get_str(conn, "serial_number").map(|s| s.to_string()),
        path: get_str(conn, "port").map(|s| s.to_string()),
    };
    if filter != DeviceFilter::default() {
        settings.filters.push(filter);
    }

    if let Some(v) = get_ranged::<usize>(conn, "max_frame_len")? {
        settings.max_frame_len = v;
    }

    settings.validate()?;
    Ok(settings)
}
