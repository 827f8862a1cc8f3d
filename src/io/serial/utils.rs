// src/io/serial/utils.rs
//
// Serial line settings and their conversion to the serialport crate's types.

use serde::{Deserialize, Serialize};
use serialport::{DataBits, FlowControl as SpFlowControl, Parity as SpParity, StopBits};

use crate::io::error::LinkError;

// ============================================================================
// Types
// ============================================================================

/// Parity setting for serial port configuration
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    #[default]
    None,
    Odd,
    Even,
}

impl Parity {
    /// Single-letter form used in "8N1" style descriptions
    pub fn letter(self) -> char {
        match self {
            Parity::None => 'N',
            Parity::Odd => 'O',
            Parity::Even => 'E',
        }
    }
}

/// Flow control setting for serial port configuration
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlowControl {
    #[default]
    None,
    Hardware,
}

/// Line settings applied when a serial port is opened.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    pub baud_rate: u32,
    /// 7 or 8
    pub data_bits: u8,
    /// 1 or 2
    pub stop_bits: u8,
    pub parity: Parity,
    /// Size of a single read, in bytes
    pub buffer_size: usize,
    pub flow_control: FlowControl,
}

impl Default for SerialConfig {
    fn default() -> Self {
        SerialConfig {
            baud_rate: 115_200,
            data_bits: 8,
            stop_bits: 1,
            parity: Parity::None,
            buffer_size: 255,
            flow_control: FlowControl::None,
        }
    }
}

impl SerialConfig {
    /// Short line description, e.g. "115200 8N1"
    pub fn describe(&self) -> String {
        format!(
            "{} {}{}{}",
            self.baud_rate,
            self.data_bits,
            self.parity.letter(),
            self.stop_bits
        )
    }

    /// Reject settings the port would refuse, before touching the hardware.
    pub fn validate(&self) -> Result<(), LinkError> {
        if self.baud_rate == 0 {
            return Err(LinkError::OpenFailed("baud rate must be non-zero".to_string()));
        }
        if !matches!(self.data_bits, 7 | 8) {
            return Err(LinkError::OpenFailed(format!(
                "unsupported data bits {} (expected 7 or 8)",
                self.data_bits
            )));
        }
        if !matches!(self.stop_bits, 1 | 2) {
            return Err(LinkError::OpenFailed(format!(
                "unsupported stop bits {} (expected 1 or 2)",
                self.stop_bits
            )));
        }
        if self.buffer_size == 0 {
            return Err(LinkError::OpenFailed("buffer size must be non-zero".to_string()));
        }
        Ok(())
    }
}

// ============================================================================
// Conversion Functions
// ============================================================================

/// Convert our Parity enum to serialport crate's Parity type
pub fn to_serialport_parity(p: Parity) -> SpParity {
    match p {
        Parity::None => SpParity::None,
        Parity::Odd => SpParity::Odd,
        Parity::Even => SpParity::Even,
    }
}

/// Convert a validated data bits count to serialport crate's DataBits type
pub fn to_serialport_data_bits(bits: u8) -> DataBits {
    match bits {
        7 => DataBits::Seven,
        _ => DataBits::Eight,
    }
}

/// Convert a validated stop bits count to serialport crate's StopBits type
pub fn to_serialport_stop_bits(bits: u8) -> StopBits {
    match bits {
        2 => StopBits::Two,
        _ => StopBits::One,
    }
}

pub fn to_serialport_flow_control(flow: FlowControl) -> SpFlowControl {
    match flow {
        FlowControl::None => SpFlowControl::None,
        FlowControl::Hardware => SpFlowControl::Hardware,
    }
}

/// Parse a parity string ("none", "odd", "even"); anything else is no parity
pub fn parse_parity(s: &str) -> Parity {
    match s.to_lowercase().as_str() {
        "odd" => Parity::Odd,
        "even" => Parity::Even,
        _ => Parity::None,
    }
}

/// Parse a flow control string ("none", "hardware")
pub fn parse_flow_control(s: &str) -> FlowControl {
    match s.to_lowercase().as_str() {
        "hardware" | "rtscts" => FlowControl::Hardware,
        _ => FlowControl::None,
    }
}

// ============================================================================
// Tests
// ============================================================================
