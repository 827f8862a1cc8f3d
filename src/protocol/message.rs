// src/protocol/message.rs
//
// Typed application messages: { op, type, payload }.

use ciborium::Value;
use serde::{Deserialize, Serialize};
use std::fmt;

use super::device::{Device, WriteResult};

/// Operations understood by the device
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Op {
    ReadDevice,
    WriteDevice,
}

impl Op {
    pub fn as_str(self) -> &'static str {
        match self {
            Op::ReadDevice => "read.device",
            Op::WriteDevice => "write.device",
        }
    }

    pub fn parse(s: &str) -> Option<Op> {
        match s {
            "read.device" => Some(Op::ReadDevice),
            "write.device" => Some(Op::WriteDevice),
            _ => None,
        }
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Request,
    Response,
    Event,
}

impl MessageType {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageType::Request => "request",
            MessageType::Response => "response",
            MessageType::Event => "event",
        }
    }

    pub fn parse(s: &str) -> Option<MessageType> {
        match s {
            "request" => Some(MessageType::Request),
            "response" => Some(MessageType::Response),
            "event" => Some(MessageType::Event),
            _ => None,
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The (op, type) pair a listener can filter on
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Route {
    pub op: Op,
    pub kind: MessageType,
}

impl Route {
    pub fn new(op: Op, kind: MessageType) -> Self {
        Route { op, kind }
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.op, self.kind)
    }
}

/// Message body
#[derive(Clone, Debug, PartialEq)]
pub enum Payload {
    /// No payload key on the wire
    Empty,
    Device(Device),
    WriteResult(WriteResult),
    /// Uninterpreted value (extra request arguments, event bodies)
    Raw(Value),
}

impl Payload {
    fn shape(&self) -> &'static str {
        match self {
            Payload::Empty => "no payload",
            Payload::Device(_) => "a device snapshot",
            Payload::WriteResult(_) => "a write result",
            Payload::Raw(_) => "a raw value",
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Message {
    pub op: Op,
    pub kind: MessageType,
    pub payload: Payload,
}

impl Message {
    pub fn new(op: Op, kind: MessageType, payload: Payload) -> Self {
        Message { op, kind, payload }
    }

    pub fn request(op: Op, payload: Payload) -> Self {
        Message::new(op, MessageType::Request, payload)
    }

    pub fn read_device_request() -> Self {
        Message::request(Op::ReadDevice, Payload::Empty)
    }

    pub fn read_device_response(device: Device) -> Self {
        Message::new(Op::ReadDevice, MessageType::Response, Payload::Device(device))
    }

    pub fn write_device_request(device: Device) -> Self {
        Message::request(Op::WriteDevice, Payload::Device(device))
    }

    pub fn write_device_response(result: WriteResult) -> Self {
        Message::new(
            Op::WriteDevice,
            MessageType::Response,
            Payload::WriteResult(result),
        )
    }

    pub fn event(op: Op, body: Option<Value>) -> Self {
        let payload = body.map(Payload::Raw).unwrap_or(Payload::Empty);
        Message::new(op, MessageType::Event, payload)
    }

    pub fn route(&self) -> Route {
        Route::new(self.op, self.kind)
    }

    /// Check the payload has the shape this (op, type) pair requires.
    pub fn check_payload(&self) -> Result<(), String> {
        let ok = match (self.op, self.kind, &self.payload) {
            (_, MessageType::Event, Payload::Empty | Payload::Raw(_)) => true,
            (Op::ReadDevice, MessageType::Request, Payload::Empty | Payload::Raw(_)) => true,
            (Op::ReadDevice, MessageType::Response, Payload::Device(_)) => true,
            (Op::WriteDevice, MessageType::Request, Payload::Device(_)) => true,
            (Op::WriteDevice, MessageType::Response, Payload::WriteResult(_)) => true,
            _ => false,
        };
        if ok {
            Ok(())
        } else {
            Err(format!("{} cannot carry {}", self.route(), self.payload.shape()))
        }
    }

    pub fn device(&self) -> Option<&Device> {
        match &self.payload {
            Payload::Device(d) => Some(d),
            _ => None,
        }
    }

    pub fn write_result(&self) -> Option<&WriteResult> {
        match &self.payload {
            Payload::WriteResult(r) => Some(r),
            _ => None,
        }
    }
}
