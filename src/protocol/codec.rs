// src/protocol/codec.rs
//
// Message codec: decoded CBOR values to typed messages and back to bytes.
//
// Wire shape is a CBOR map with text keys:
//   { "op": text, "type": "request" | "response" | "event", "payload"?: any }

use ciborium::Value;
use serde::{Deserialize, Serialize};

use super::device::{Device, WriteResult};
use super::message::{Message, MessageType, Op, Payload};
use crate::io::error::LinkError;

// ============================================================================
// Message Codec Trait
// ============================================================================

/// Converts between decoded values, typed messages and wire bytes.
pub trait MessageCodec {
    /// Interpret one decoded value as a message.
    ///
    /// Returns `Err(LinkError::UnrecognizedMessage)` when the value is not a
    /// message this layer knows; the caller drops it and keeps decoding.
    fn to_message(value: Value) -> Result<Message, LinkError>;

    /// Serialize a message for transmission.
    fn encode(message: &Message) -> Result<Vec<u8>, LinkError>;
}

/// CBOR codec with named map keys
pub struct CborCodec;

#[derive(Serialize)]
struct WireMessage {
    op: String,
    #[serde(rename = "type")]
    kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    payload: Option<Value>,
}

/// Remove `key` from a message map. A present `null` comes back as `Some(Value::Null)`.
fn take_entry(entries: &mut Vec<(Value, Value)>, key: &str) -> Option<Value> {
    let index = entries
        .iter()
        .position(|(k, _)| k.as_text() == Some(key))?;
    Some(entries.swap_remove(index).1)
}

fn take_text(entries: &mut Vec<(Value, Value)>, key: &str) -> Result<String, LinkError> {
    match take_entry(entries, key) {
        Some(Value::Text(text)) => Ok(text),
        Some(other) => Err(LinkError::unrecognized(format!(
            "'{}' is not text: {:?}",
            key, other
        ))),
        None => Err(LinkError::unrecognized(format!("missing '{}'", key))),
    }
}

fn payload_as<T>(value: &Value, what: &str) -> Result<T, LinkError>
where
    T: for<'de> Deserialize<'de>,
{
    value
        .deserialized::<T>()
        .map_err(|e| LinkError::unrecognized(format!("payload is not {}: {}", what, e)))
}

fn to_value<T: Serialize>(item: &T) -> Result<Value, LinkError> {
    Value::serialized(item).map_err(|e| LinkError::EncodeFailed(e.to_string()))
}

impl MessageCodec for CborCodec {
    fn to_message(value: Value) -> Result<Message, LinkError> {
        let mut entries = match value {
            Value::Map(entries) => entries,
            other => {
                return Err(LinkError::unrecognized(format!(
                    "expected a map, got {:?}",
                    other
                )))
            }
        };
        let op_name = take_text(&mut entries, "op")?;
        let kind_name = take_text(&mut entries, "type")?;

        let op = Op::parse(&op_name)
            .ok_or_else(|| LinkError::unrecognized(format!("unknown op '{}'", op_name)))?;
        let kind = MessageType::parse(&kind_name)
            .ok_or_else(|| LinkError::unrecognized(format!("unknown type '{}'", kind_name)))?;

        let payload = match (op, kind, take_entry(&mut entries, "payload")) {
            (Op::ReadDevice, MessageType::Response, Some(v))
            | (Op::WriteDevice, MessageType::Request, Some(v)) => {
                Payload::Device(payload_as::<Device>(&v, "a device snapshot")?)
            }
            (Op::WriteDevice, MessageType::Response, Some(v)) => {
                Payload::WriteResult(payload_as::<WriteResult>(&v, "a write result")?)
            }
            (_, MessageType::Request | MessageType::Event, Some(v)) => Payload::Raw(v),
            (_, _, None) => Payload::Empty,
        };

        let message = Message::new(op, kind, payload);
        message.check_payload().map_err(LinkError::unrecognized)?;
        Ok(message)
    }

    fn encode(message: &Message) -> Result<Vec<u8>, LinkError> {
        message.check_payload().map_err(LinkError::EncodeFailed)?;

        let payload = match &message.payload {
            Payload::Empty => None,
            Payload::Device(d) => Some(to_value(d)?),
            Payload::WriteResult(r) => Some(to_value(r)?),
            Payload::Raw(v) => Some(v.clone()),
        };
        let wire = WireMessage {
            op: message.op.as_str().to_string(),
            kind: message.kind.as_str().to_string(),
            payload,
        };

        let mut out = Vec::new();
        ciborium::ser::into_writer(&wire, &mut out)
            .map_err(|e| LinkError::EncodeFailed(e.to_string()))?;
        Ok(out)
    }
}

/// Interpret a decoded value with the default codec.
pub fn to_message(value: Value) -> Result<Message, LinkError> {
    CborCodec::to_message(value)
}

/// Encode a message with the default codec.
pub fn encode(message: &Message) -> Result<Vec<u8>, LinkError> {
    CborCodec::encode(message)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::device::{DeviceInfo, Group, Module, Setting, SettingKind, SettingValue};
    use proptest::prelude::*;

    fn decode_one(bytes: &[u8]) -> Value {
        ciborium::de::from_reader(bytes).unwrap()
    }

    fn map(entries: Vec<(&str, Value)>) -> Value {
        Value::Map(
            entries
                .into_iter()
                .map(|(k, v)| (Value::Text(k.to_string()), v))
                .collect(),
        )
    }

    fn device() -> Device {
        let mut level = Setting::new("led.level", "Brightness", SettingKind::Range, 40i64);
        level.min = Some(0.0);
        level.max = Some(100.0);
        level.step = Some(5.0);
        level.unit = Some("%".to_string());
        let mut mode = Setting::new("led.mode", "Mode", SettingKind::Options, "blink");
        mode.options = Some(vec!["off".into(), "on".into(), "blink".into()]);
        mode.address = Some(7);
        let mut ratio = Setting::new("led.ratio", "Duty", SettingKind::Float, 0.25);
        ratio.readonly = Some(true);

        Device {
            device_info: Some(DeviceInfo {
                model: Some("DL-1".to_string()),
                fw: None,
            }),
            modules: vec![Module {
                id: "led".to_string(),
                label: "LED".to_string(),
                groups: vec![Group {
                    id: "main".to_string(),
                    label: "Main".to_string(),
                    settings: vec![
                        level,
                        mode,
                        ratio,
                        Setting::new("led.on", "On", SettingKind::Bool, false),
                        Setting::new("led.name", "Name", SettingKind::String, "status"),
                    ],
                }],
            }],
        }
    }

    #[test]
    fn test_roundtrip_every_shape() {
        let messages = vec![
            Message::read_device_request(),
            Message::request(Op::ReadDevice, Payload::Raw(Value::Text("full".into()))),
            Message::read_device_response(device()),
            Message::write_device_request(device()),
            Message::write_device_response(WriteResult::ok()),
            Message::write_device_response(WriteResult::failed("flash locked")),
            Message::event(Op::WriteDevice, None),
            Message::event(Op::ReadDevice, Some(map(vec![("changed", Value::Bool(true))]))),
        ];

        for message in messages {
            let bytes = encode(&message).unwrap();
            let back = to_message(decode_one(&bytes)).unwrap();
            assert_eq!(back, message);
        }
    }

    #[test]
    fn test_request_without_payload_omits_key() {
        let bytes = encode(&Message::read_device_request()).unwrap();
        let value = decode_one(&bytes);
        assert_eq!(
            value,
            map(vec![
                ("op", Value::Text("read.device".into())),
                ("type", Value::Text("request".into())),
            ])
        );
    }

    #[test]
    fn test_encode_rejects_mismatched_payload() {
        let bad = Message::new(Op::WriteDevice, MessageType::Request, Payload::Empty);
        assert!(matches!(encode(&bad), Err(LinkError::EncodeFailed(_))));
    }

    #[test]
    fn test_unrecognized_values() {
        let cases = vec![
            Value::Integer(3.into()),
            map(vec![("type", Value::Text("request".into()))]),
            map(vec![
                ("op", Value::Text("reboot".into())),
                ("type", Value::Text("request".into())),
            ]),
            map(vec![
                ("op", Value::Text("read.device".into())),
                ("type", Value::Text("notify".into())),
            ]),
            // Response with no device
            map(vec![
                ("op", Value::Text("read.device".into())),
                ("type", Value::Text("response".into())),
            ]),
            // Device payload of the wrong shape
            map(vec![
                ("op", Value::Text("write.device".into())),
                ("type", Value::Text("request".into())),
                ("payload", Value::Text("nope".into())),
            ]),
        ];

        for value in cases {
            let err = to_message(value.clone()).unwrap_err();
            assert!(
                matches!(err, LinkError::UnrecognizedMessage(_)),
                "{:?} gave {:?}",
                value,
                err
            );
        }
    }

    #[test]
    fn test_accepts_integer_bounds() {
        let setting = map(vec![
            ("id", Value::Text("x".into())),
            ("label", Value::Text("X".into())),
            ("type", Value::Text("int".into())),
            ("value", Value::Integer(4.into())),
            ("min", Value::Integer(0.into())),
            ("max", Value::Integer(10.into())),
        ]);
        let payload = map(vec![(
            "modules",
            Value::Array(vec![map(vec![
                ("id", Value::Text("m".into())),
                ("label", Value::Text("M".into())),
                (
                    "groups",
                    Value::Array(vec![map(vec![
                        ("id", Value::Text("g".into())),
                        ("label", Value::Text("G".into())),
                        ("settings", Value::Array(vec![setting])),
                    ])]),
                ),
            ])]),
        )]);
        let value = map(vec![
            ("op", Value::Text("read.device".into())),
            ("type", Value::Text("response".into())),
            ("payload", payload),
        ]);

        let message = to_message(value).unwrap();
        let s = message.device().unwrap().find_setting("x").unwrap().clone();
        assert_eq!(s.min, Some(0.0));
        assert_eq!(s.max, Some(10.0));
    }

    #[test]
    fn test_null_payload_is_kept() {
        let messages = vec![
            Message::event(Op::ReadDevice, Some(Value::Null)),
            Message::request(Op::ReadDevice, Payload::Raw(Value::Null)),
        ];
        for message in messages {
            let value = decode_one(&encode(&message).unwrap());
            assert!(value
                .as_map()
                .unwrap()
                .iter()
                .any(|(k, v)| k.as_text() == Some("payload") && v.is_null()));
            assert_eq!(to_message(value).unwrap(), message);
        }
    }

    #[test]
    fn test_null_device_payload_is_unrecognized() {
        let value = map(vec![
            ("op", Value::Text("read.device".into())),
            ("type", Value::Text("response".into())),
            ("payload", Value::Null),
        ]);
        assert!(matches!(
            to_message(value),
            Err(LinkError::UnrecognizedMessage(_))
        ));
    }

    #[test]
    fn test_snapshot_with_mixed_bounds() {
        // Integer min/max next to a float step, as devices report them
        let setting = map(vec![
            ("id", Value::Text("s3".into())),
            ("label", Value::Text("Target temperature".into())),
            ("type", Value::Text("float".into())),
            ("value", Value::Float(12.0)),
            ("min", Value::Integer(0.into())),
            ("max", Value::Integer(24.into())),
            ("step", Value::Float(0.1)),
        ]);
        let payload = map(vec![(
            "modules",
            Value::Array(vec![map(vec![
                ("id", Value::Text("m".into())),
                ("label", Value::Text("M".into())),
                (
                    "groups",
                    Value::Array(vec![map(vec![
                        ("id", Value::Text("g".into())),
                        ("label", Value::Text("G".into())),
                        ("settings", Value::Array(vec![setting])),
                    ])]),
                ),
            ])]),
        )]);
        let mut bytes = Vec::new();
        ciborium::ser::into_writer(
            &map(vec![
                ("op", Value::Text("read.device".into())),
                ("type", Value::Text("response".into())),
                ("payload", payload),
            ]),
            &mut bytes,
        )
        .unwrap();

        let message = to_message(decode_one(&bytes)).unwrap();
        let s = message.device().unwrap().find_setting("s3").unwrap();
        assert_eq!(s.value, SettingValue::Float(12.0));
        assert_eq!((s.min, s.max, s.step), (Some(0.0), Some(24.0), Some(0.1)));
    }

    // ------------------------------------------------------------------------
    // Generated messages
    // ------------------------------------------------------------------------

    fn finite_f64() -> impl Strategy<Value = f64> {
        prop_oneof![
            (-1000i32..1000).prop_map(f64::from),
            (-1.0e6f64..1.0e6f64),
        ]
    }

    fn raw_value() -> impl Strategy<Value = Value> {
        let leaf = prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::Bool),
            any::<i64>().prop_map(|i| Value::Integer(i.into())),
            finite_f64().prop_map(Value::Float),
            ".{0,12}".prop_map(Value::Text),
            proptest::collection::vec(any::<u8>(), 0..8).prop_map(Value::Bytes),
        ];
        leaf.prop_recursive(3, 24, 4, |inner| {
            prop_oneof![
                proptest::collection::vec(inner.clone(), 0..4).prop_map(Value::Array),
                proptest::collection::vec(("[a-z]{1,6}", inner), 0..4).prop_map(|entries| {
                    Value::Map(
                        entries
                            .into_iter()
                            .map(|(k, v)| (Value::Text(k), v))
                            .collect(),
                    )
                }),
            ]
        })
    }

    fn setting_value() -> impl Strategy<Value = SettingValue> {
        prop_oneof![
            any::<bool>().prop_map(SettingValue::Bool),
            any::<i64>().prop_map(SettingValue::Int),
            finite_f64().prop_map(SettingValue::Float),
            "[a-z ]{0,10}".prop_map(SettingValue::Text),
        ]
    }

    fn setting() -> impl Strategy<Value = Setting> {
        let kind = prop_oneof![
            Just(SettingKind::Bool),
            Just(SettingKind::Int),
            Just(SettingKind::Float),
            Just(SettingKind::Range),
            Just(SettingKind::String),
            Just(SettingKind::Options),
        ];
        (
            ("[a-z.]{1,10}", kind, setting_value()),
            (
                proptest::option::of(finite_f64()),
                proptest::option::of(finite_f64()),
                proptest::option::of(finite_f64()),
            ),
            (
                proptest::option::of(any::<u32>()),
                proptest::option::of("[a-z%]{0,3}"),
                proptest::option::of(proptest::collection::vec(setting_value(), 0..4)),
                proptest::option::of(any::<bool>()),
            ),
        )
            .prop_map(|((id, kind, value), (min, max, step), (address, unit, options, readonly))| {
                let mut setting = Setting::new(id.clone(), id, kind, value);
                setting.min = min;
                setting.max = max;
                setting.step = step;
                setting.address = address;
                setting.unit = unit;
                setting.options = options;
                setting.readonly = readonly;
                setting
            })
    }

    fn any_device() -> impl Strategy<Value = Device> {
        (
            proptest::option::of((
                proptest::option::of("[A-Z0-9-]{1,6}"),
                proptest::option::of("[0-9.]{1,6}"),
            )),
            proptest::collection::vec(setting(), 0..5),
        )
            .prop_map(|(info, settings)| Device {
                device_info: info.map(|(model, fw)| DeviceInfo { model, fw }),
                modules: vec![Module {
                    id: "m".to_string(),
                    label: "M".to_string(),
                    groups: vec![Group {
                        id: "g".to_string(),
                        label: "G".to_string(),
                        settings,
                    }],
                }],
            })
    }

    fn any_op() -> impl Strategy<Value = Op> {
        prop_oneof![Just(Op::ReadDevice), Just(Op::WriteDevice)]
    }

    fn any_message() -> impl Strategy<Value = Message> {
        prop_oneof![
            Just(Message::read_device_request()),
            raw_value().prop_map(|v| Message::request(Op::ReadDevice, Payload::Raw(v))),
            any_device().prop_map(Message::read_device_response),
            any_device().prop_map(Message::write_device_request),
            (any::<bool>(), proptest::option::of(".{0,16}")).prop_map(|(success, error_message)| {
                Message::write_device_response(WriteResult {
                    success,
                    error_message,
                })
            }),
            (any_op(), proptest::option::of(raw_value()))
                .prop_map(|(op, body)| Message::event(op, body)),
        ]
    }

    proptest! {
        #[test]
        fn test_generated_messages_roundtrip(message in any_message()) {
            let bytes = encode(&message).unwrap();
            let back = to_message(decode_one(&bytes)).unwrap();
            prop_assert_eq!(back, message);
        }
    }
}
