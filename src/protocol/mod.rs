// src/protocol/mod.rs
//
// Application message layer on top of the decoded value stream: typed messages,
// the device snapshot model, the CBOR message codec and dispatch.

pub mod codec;
pub mod device;
pub mod message;
pub mod router;

pub use codec::{encode, to_message, CborCodec, MessageCodec};
pub use device::{Device, DeviceInfo, Group, Module, Setting, SettingKind, SettingValue, WriteResult};
pub use message::{Message, MessageType, Op, Payload, Route};
pub use router::{MessageRouter, PendingResponse, SettingsModel};
