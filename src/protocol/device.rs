// src/protocol/device.rs
//
// Device snapshot carried by read.device responses and write.device requests:
// modules contain groups, groups contain settings.

use serde::de::{self, Deserializer, Visitor};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Complete settings tree reported by a device
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Device {
    #[serde(rename = "deviceInfo", default, skip_serializing_if = "Option::is_none")]
    pub device_info: Option<DeviceInfo>,
    #[serde(default)]
    pub modules: Vec<Module>,
}

/// Identification block
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fw: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Module {
    pub id: String,
    pub label: String,
    #[serde(default)]
    pub groups: Vec<Group>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Group {
    pub id: String,
    pub label: String,
    #[serde(default)]
    pub settings: Vec<Setting>,
}

/// Widget family of a setting. The value's representation follows from it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SettingKind {
    Bool,
    Int,
    Float,
    Range,
    String,
    Options,
}

/// A setting's value as it appears on the wire
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SettingValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl SettingValue {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            SettingValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Numeric view; integers widen to f64
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            SettingValue::Int(i) => Some(*i as f64),
            SettingValue::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            SettingValue::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl From<bool> for SettingValue {
    fn from(v: bool) -> Self {
        SettingValue::Bool(v)
    }
}

impl From<i64> for SettingValue {
    fn from(v: i64) -> Self {
        SettingValue::Int(v)
    }
}

impl From<f64> for SettingValue {
    fn from(v: f64) -> Self {
        SettingValue::Float(v)
    }
}

impl From<&str> for SettingValue {
    fn from(v: &str) -> Self {
        SettingValue::Text(v.to_string())
    }
}

impl From<String> for SettingValue {
    fn from(v: String) -> Self {
        SettingValue::Text(v)
    }
}

/// A single configurable value
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Setting {
    /// Device register the setting lives at
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<u32>,
    pub id: String,
    pub label: String,
    #[serde(rename = "type")]
    pub kind: SettingKind,
    pub value: SettingValue,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    #[serde(
        default,
        deserialize_with = "deserialize_bound",
        skip_serializing_if = "Option::is_none"
    )]
    pub min: Option<f64>,
    #[serde(
        default,
        deserialize_with = "deserialize_bound",
        skip_serializing_if = "Option::is_none"
    )]
    pub max: Option<f64>,
    #[serde(
        default,
        deserialize_with = "deserialize_bound",
        skip_serializing_if = "Option::is_none"
    )]
    pub step: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<Vec<SettingValue>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub readonly: Option<bool>,
}

/// Numeric bound that arrives as either an integer or a float.
struct Bound(f64);

impl<'de> Deserialize<'de> for Bound {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct BoundVisitor;

        impl<'de> Visitor<'de> for BoundVisitor {
            type Value = Bound;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("an integer or float")
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<Bound, E> {
                Ok(Bound(v as f64))
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Bound, E> {
                Ok(Bound(v as f64))
            }

            fn visit_i128<E: de::Error>(self, v: i128) -> Result<Bound, E> {
                Ok(Bound(v as f64))
            }

            fn visit_u128<E: de::Error>(self, v: u128) -> Result<Bound, E> {
                Ok(Bound(v as f64))
            }

            fn visit_f64<E: de::Error>(self, v: f64) -> Result<Bound, E> {
                Ok(Bound(v))
            }
        }

        deserializer.deserialize_any(BoundVisitor)
    }
}

// CBOR keeps integers and floats apart, so a plain f64 field rejects `min: 0`
fn deserialize_bound<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<f64>, D::Error> {
    Ok(Option::<Bound>::deserialize(deserializer)?.map(|b| b.0))
}

impl Setting {
    pub fn new(
        id: impl Into<String>,
        label: impl Into<String>,
        kind: SettingKind,
        value: impl Into<SettingValue>,
    ) -> Self {
        Setting {
            address: None,
            id: id.into(),
            label: label.into(),
            kind,
            value: value.into(),
            unit: None,
            min: None,
            max: None,
            step: None,
            options: None,
            readonly: None,
        }
    }

    pub fn is_readonly(&self) -> bool {
        self.readonly.unwrap_or(false)
    }
}

/// Outcome of a write.device request
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteResult {
    pub success: bool,
    #[serde(rename = "errorMessage", default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl WriteResult {
    pub fn ok() -> Self {
        WriteResult {
            success: true,
            error_message: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        WriteResult {
            success: false,
            error_message: Some(message.into()),
        }
    }
}

impl Device {
    /// Iterate over every setting in module and group order.
    pub fn settings(&self) -> impl Iterator<Item = &Setting> {
        self.modules
            .iter()
            .flat_map(|m| m.groups.iter())
            .flat_map(|g| g.settings.iter())
    }

    pub fn find_setting(&self, id: &str) -> Option<&Setting> {
        self.settings().find(|s| s.id == id)
    }

    pub fn find_setting_mut(&mut self, id: &str) -> Option<&mut Setting> {
        self.modules
            .iter_mut()
            .flat_map(|m| m.groups.iter_mut())
            .flat_map(|g| g.settings.iter_mut())
            .find(|s| s.id == id)
    }
}
