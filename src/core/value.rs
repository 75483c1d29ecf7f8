//! Purpose: Closed dynamic value model for schema-less records.
//! Exports: `Value`, `Record`, `record_from_json`, `record_to_json`.
//! Role: Boundary type between JSON input/output and the typed field codec.
//! Invariants: JSON integers that fit `i64` become `Int64`; every other number stays `Json`.
//! Invariants: `Null` is a present value; absence is the key missing from the `Record`.
use std::collections::BTreeMap;

use serde::{Serialize, Serializer};
use serde_json::Value as JsonValue;

use crate::core::error::{Error, ErrorKind};

#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Null,
    Int8(i8),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    String(String),
    Json(JsonValue),
}

pub type Record = BTreeMap<String, Value>;

impl Value {
    pub fn from_json(value: JsonValue) -> Self {
        match value {
            JsonValue::Null => Value::Null,
            JsonValue::String(text) => Value::String(text),
            JsonValue::Number(number) => match number.as_i64() {
                Some(int) => Value::Int64(int),
                None => Value::Json(JsonValue::Number(number)),
            },
            other => Value::Json(other),
        }
    }

    pub fn to_json(&self) -> JsonValue {
        match self {
            Value::Null => JsonValue::Null,
            Value::Int8(v) => JsonValue::from(*v),
            Value::Int16(v) => JsonValue::from(*v),
            Value::Int32(v) => JsonValue::from(*v),
            Value::Int64(v) => JsonValue::from(*v),
            Value::String(v) => JsonValue::String(v.clone()),
            Value::Json(v) => v.clone(),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Integer-typed values widened to `i64`; everything else is `None`.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int8(v) => Some(i64::from(*v)),
            Value::Int16(v) => Some(i64::from(*v)),
            Value::Int32(v) => Some(i64::from(*v)),
            Value::Int64(v) => Some(*v),
            _ => None,
        }
    }

    /// Text form used for tally buckets: strings unquoted, everything else as JSON.
    pub fn display_key(&self) -> String {
        match self {
            Value::String(text) => text.clone(),
            other => other.to_json().to_string(),
        }
    }
}

impl From<i8> for Value {
    fn from(value: i8) -> Self {
        Value::Int8(value)
    }
}

impl From<i16> for Value {
    fn from(value: i16) -> Self {
        Value::Int16(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Int32(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int64(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(value)
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Value::Null => serializer.serialize_unit(),
            Value::Int8(v) => serializer.serialize_i8(*v),
            Value::Int16(v) => serializer.serialize_i16(*v),
            Value::Int32(v) => serializer.serialize_i32(*v),
            Value::Int64(v) => serializer.serialize_i64(*v),
            Value::String(v) => serializer.serialize_str(v),
            Value::Json(v) => v.serialize(serializer),
        }
    }
}

pub fn record_from_json(value: JsonValue) -> Result<Record, Error> {
    match value {
        JsonValue::Object(map) => Ok(map
            .into_iter()
            .map(|(name, value)| (name, Value::from_json(value)))
            .collect()),
        _ => Err(Error::new(ErrorKind::Usage).with_message("record must be a JSON object")),
    }
}

pub fn record_to_json(record: &Record) -> JsonValue {
    JsonValue::Object(
        record
            .iter()
            .map(|(name, value)| (name.clone(), value.to_json()))
            .collect(),
    )
}
