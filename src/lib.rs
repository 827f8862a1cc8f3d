// src/lib.rs
//
// devlink: talk to a configurable device over a serial link or a USB bulk interface.
//
// Layers, leaf first:
//   io::transport / io::serial / io::usb   physical channels
//   io::pump                               cancellable read loop
//   io::framer                             incremental CBOR decoding
//   protocol                               typed messages and dispatch
//   connection                             lifecycle state machine

#[macro_use]
mod logging;

pub mod connection;
pub mod io;
pub mod protocol;
pub mod settings;

pub use connection::Connection;
pub use io::serial::list_serial_ports;
pub use io::usb::list_usb_devices;
pub use io::{ConnectionState, DeviceFilter, LinkError, RawChunk, SubscriptionId, TransportKind};
pub use logging::{init_file_logging, stop_file_logging};
pub use protocol::{
    Device, Message, MessageType, Op, Payload, Route, Setting, SettingKind, SettingValue,
    SettingsModel, WriteResult,
};
pub use settings::{load_settings, parse_link_profile, save_settings, LinkProfile, LinkSettings};
