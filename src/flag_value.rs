use std::collections::HashMap;

use derive_more::From;
use serde::{Deserialize, Serialize};

/// A feature flag value.
///
/// Flag values are dynamically typed on the wire, so they are modeled as a closed tagged union.
/// `Null` doubles as "absent": a flag that carries no value compares equal to one whose value is
/// explicitly null.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize, From)]
#[serde(untagged)]
pub enum FlagValue {
    /// Null or absent value.
    #[default]
    Null,
    /// A boolean value.
    Bool(bool),
    /// An integer value.
    Int(i64),
    /// A floating-point value.
    Double(f64),
    /// A string value.
    String(String),
    /// An array of values.
    Array(Vec<FlagValue>),
    /// A map of values.
    Object(HashMap<String, FlagValue>),
}

impl FlagValue {
    /// Whether this value is null/absent.
    pub fn is_null(&self) -> bool {
        matches!(self, FlagValue::Null)
    }

    /// Returns the boolean value if this is of type Bool, otherwise `None`.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            FlagValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Returns the integer value if this is of type Int, otherwise `None`.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            FlagValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Returns the numeric value if this is of type Int or Double, otherwise `None`.
    pub fn as_double(&self) -> Option<f64> {
        match self {
            FlagValue::Int(i) => Some(*i as f64),
            FlagValue::Double(d) => Some(*d),
            _ => None,
        }
    }

    /// Returns the string value if this is of type String, otherwise `None`.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            FlagValue::String(s) => Some(s),
            _ => None,
        }
    }
}

impl From<&str> for FlagValue {
    fn from(value: &str) -> Self {
        FlagValue::String(value.to_owned())
    }
}

impl From<serde_json::Value> for FlagValue {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => FlagValue::Null,
            serde_json::Value::Bool(b) => FlagValue::Bool(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => FlagValue::Int(i),
                None => FlagValue::Double(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(s) => FlagValue::String(s),
            serde_json::Value::Array(values) => {
                FlagValue::Array(values.into_iter().map(FlagValue::from).collect())
            }
            serde_json::Value::Object(map) => FlagValue::Object(
                map.into_iter()
                    .map(|(key, value)| (key, FlagValue::from(value)))
                    .collect(),
            ),
        }
    }
}

impl From<FlagValue> for serde_json::Value {
    fn from(value: FlagValue) -> Self {
        match value {
            FlagValue::Null => serde_json::Value::Null,
            FlagValue::Bool(b) => serde_json::Value::Bool(b),
            FlagValue::Int(i) => serde_json::Value::from(i),
            FlagValue::Double(d) => serde_json::Value::from(d),
            FlagValue::String(s) => serde_json::Value::String(s),
            FlagValue::Array(values) => {
                serde_json::Value::Array(values.into_iter().map(Into::into).collect())
            }
            FlagValue::Object(map) => serde_json::Value::Object(
                map.into_iter()
                    .map(|(key, value)| (key, value.into()))
                    .collect(),
            ),
        }
    }
}
