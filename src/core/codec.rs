//! Purpose: Typed field codec turning dynamic values into self-delimiting bytes and back.
//! Exports: `FieldKind`, `MAX_VARLEN`.
//! Role: Single source of the key/value byte layouts used by the writer and merge engine.
//! Invariants: Integers are big-endian two's complement of exactly 1/2/4/8 bytes.
//! Invariants: Strings and JSON carry a 2-byte big-endian length prefix; longer bodies fail.
//! Invariants: `decode` never reads past the declared length and reports bytes consumed.
//! Notes: Byte order matches numeric order only between values of the same sign;
//! length-prefixed fields partition keys but do not sort them lexicographically.
use std::fmt;
use std::str::FromStr;

use serde_json::Value as JsonValue;

use crate::core::error::{Error, ErrorKind};
use crate::core::value::Value;

pub const MAX_VARLEN: usize = u16::MAX as usize;
const LEN_PREFIX: usize = 2;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum FieldKind {
    Int8,
    Int16,
    Int32,
    Int64,
    String,
    Json,
}

impl FieldKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FieldKind::Int8 => "int8",
            FieldKind::Int16 => "int16",
            FieldKind::Int32 => "int32",
            FieldKind::Int64 => "int64",
            FieldKind::String => "string",
            FieldKind::Json => "json",
        }
    }

    /// Encoded width for fixed-width kinds.
    pub fn fixed_width(self) -> Option<usize> {
        match self {
            FieldKind::Int8 => Some(1),
            FieldKind::Int16 => Some(2),
            FieldKind::Int32 => Some(4),
            FieldKind::Int64 => Some(8),
            FieldKind::String | FieldKind::Json => None,
        }
    }

    pub fn encode(self, value: &Value) -> Result<Vec<u8>, Error> {
        let mut out = Vec::with_capacity(self.fixed_width().unwrap_or(LEN_PREFIX + 16));
        self.encode_into(value, &mut out)?;
        Ok(out)
    }

    pub fn encode_into(self, value: &Value, out: &mut Vec<u8>) -> Result<(), Error> {
        match self {
            FieldKind::Int8 => out.push(lossy_i64(value) as i8 as u8),
            FieldKind::Int16 => out.extend_from_slice(&(lossy_i64(value) as i16).to_be_bytes()),
            FieldKind::Int32 => out.extend_from_slice(&(lossy_i64(value) as i32).to_be_bytes()),
            FieldKind::Int64 => out.extend_from_slice(&lossy_i64(value).to_be_bytes()),
            FieldKind::String => {
                let text = string_form(value);
                put_varlen(self, text.as_bytes(), out)?;
            }
            FieldKind::Json => {
                let body = serde_json::to_vec(&value.to_json()).map_err(|err| {
                    Error::new(ErrorKind::Encoding)
                        .with_message("failed to serialize json field")
                        .with_source(err)
                })?;
                put_varlen(self, &body, out)?;
            }
        }
        Ok(())
    }

    pub fn decode(self, bytes: &[u8]) -> Result<(Value, usize), Error> {
        match self {
            FieldKind::Int8 => {
                let [b] = take::<1>(self, bytes)?;
                Ok((Value::Int8(b as i8), 1))
            }
            FieldKind::Int16 => Ok((Value::Int16(i16::from_be_bytes(take(self, bytes)?)), 2)),
            FieldKind::Int32 => Ok((Value::Int32(i32::from_be_bytes(take(self, bytes)?)), 4)),
            FieldKind::Int64 => Ok((Value::Int64(i64::from_be_bytes(take(self, bytes)?)), 8)),
            FieldKind::String => {
                let (body, consumed) = get_varlen(self, bytes)?;
                let text = std::str::from_utf8(body).map_err(|err| {
                    Error::new(ErrorKind::Encoding)
                        .with_message("string field is not valid utf-8")
                        .with_source(err)
                })?;
                Ok((Value::String(text.to_string()), consumed))
            }
            FieldKind::Json => {
                let (body, consumed) = get_varlen(self, bytes)?;
                let parsed: JsonValue = serde_json::from_slice(body).map_err(|err| {
                    Error::new(ErrorKind::Encoding)
                        .with_message("json field is malformed")
                        .with_source(err)
                })?;
                Ok((Value::from_json(parsed), consumed))
            }
        }
    }

    /// Value written for a key field missing from the record.
    pub fn default_value(self) -> Value {
        match self {
            FieldKind::Int8 => Value::Int8(0),
            FieldKind::Int16 => Value::Int16(0),
            FieldKind::Int32 => Value::Int32(0),
            FieldKind::Int64 => Value::Int64(0),
            FieldKind::String => Value::String(String::new()),
            FieldKind::Json => Value::Null,
        }
    }
}

impl fmt::Display for FieldKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FieldKind {
    type Err = Error;

    fn from_str(kind: &str) -> Result<Self, Self::Err> {
        match kind {
            "int8" => Ok(FieldKind::Int8),
            "int16" => Ok(FieldKind::Int16),
            "int32" => Ok(FieldKind::Int32),
            "int64" => Ok(FieldKind::Int64),
            "string" => Ok(FieldKind::String),
            "json" => Ok(FieldKind::Json),
            other => Err(Error::new(ErrorKind::Schema)
                .with_message(format!("unsupported field type {other:?}"))
                .with_hint("Use one of int8, int16, int32, int64, string, json.")),
        }
    }
}

// Non-numeric inputs collapse to zero; floats truncate toward zero.
fn lossy_i64(value: &Value) -> i64 {
    if let Some(int) = value.as_i64() {
        return int;
    }
    match value {
        Value::Json(JsonValue::Number(number)) => number
            .as_i64()
            .or_else(|| number.as_u64().map(|v| v as i64))
            .or_else(|| number.as_f64().map(|v| v as i64))
            .unwrap_or(0),
        _ => 0,
    }
}

fn string_form(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(text) => text.clone(),
        Value::Json(JsonValue::String(text)) => text.clone(),
        other => other.to_json().to_string(),
    }
}

fn put_varlen(kind: FieldKind, body: &[u8], out: &mut Vec<u8>) -> Result<(), Error> {
    if body.len() > MAX_VARLEN {
        return Err(Error::new(ErrorKind::Encoding).with_message(format!(
            "{kind} value is {} bytes; the limit is {MAX_VARLEN}",
            body.len()
        )));
    }
    out.extend_from_slice(&(body.len() as u16).to_be_bytes());
    out.extend_from_slice(body);
    Ok(())
}

fn get_varlen(kind: FieldKind, bytes: &[u8]) -> Result<(&[u8], usize), Error> {
    let len = u16::from_be_bytes(take(kind, bytes)?) as usize;
    let end = LEN_PREFIX + len;
    match bytes.get(LEN_PREFIX..end) {
        Some(body) => Ok((body, end)),
        None => Err(truncated(kind, end, bytes.len())),
    }
}

fn take<const N: usize>(kind: FieldKind, bytes: &[u8]) -> Result<[u8; N], Error> {
    bytes
        .get(..N)
        .and_then(|head| head.try_into().ok())
        .ok_or_else(|| truncated(kind, N, bytes.len()))
}

fn truncated(kind: FieldKind, needed: usize, available: usize) -> Error {
    Error::new(ErrorKind::Encoding).with_message(format!(
        "truncated {kind} field: need {needed} bytes, have {available}"
    ))
}

#[cfg(test)]
mod tests {
    use super::{FieldKind, MAX_VARLEN};
    use crate::core::error::ErrorKind;
    use crate::core::value::Value;
    use serde_json::json;

    #[test]
    fn integers_are_big_endian_twos_complement() {
        assert_eq!(FieldKind::Int8.encode(&Value::Int64(-1)).expect("enc"), vec![0xFF]);
        assert_eq!(
            FieldKind::Int16.encode(&Value::Int64(258)).expect("enc"),
            vec![0x01, 0x02]
        );
        assert_eq!(
            FieldKind::Int32.encode(&Value::Int32(1)).expect("enc"),
            vec![0, 0, 0, 1]
        );
        assert_eq!(
            FieldKind::Int64.encode(&Value::Int8(-2)).expect("enc"),
            (-2i64).to_be_bytes().to_vec()
        );
    }

    #[test]
    fn integers_round_trip_with_exact_width() {
        let cases = [
            (FieldKind::Int8, Value::Int8(-128)),
            (FieldKind::Int16, Value::Int16(i16::MAX)),
            (FieldKind::Int32, Value::Int32(-123_456)),
            (FieldKind::Int64, Value::Int64(i64::MIN)),
        ];
        for (kind, value) in cases {
            let bytes = kind.encode(&value).expect("encode");
            assert_eq!(Some(bytes.len()), kind.fixed_width());
            let (decoded, used) = kind.decode(&bytes).expect("decode");
            assert_eq!(decoded, value);
            assert_eq!(used, bytes.len());
        }
    }

    #[test]
    fn numeric_inputs_truncate_to_width() {
        let (value, _) = FieldKind::Int8
            .decode(&FieldKind::Int8.encode(&Value::Int64(300)).expect("enc"))
            .expect("dec");
        assert_eq!(value, Value::Int8(44));

        let (value, _) = FieldKind::Int32
            .decode(&FieldKind::Int32.encode(&Value::Json(json!(7.9))).expect("enc"))
            .expect("dec");
        assert_eq!(value, Value::Int32(7));
    }

    #[test]
    fn non_numeric_inputs_encode_as_zero() {
        for value in [
            Value::Null,
            Value::String("12".into()),
            Value::Json(json!({"a": 1})),
        ] {
            assert_eq!(FieldKind::Int32.encode(&value).expect("enc"), vec![0, 0, 0, 0]);
        }
    }

    #[test]
    fn same_width_non_negative_order_is_preserved() {
        let pairs = [(0i64, 1i64), (1, 255), (255, 256), (65_535, 1 << 31)];
        for (a, b) in pairs {
            let ea = FieldKind::Int64.encode(&Value::Int64(a)).expect("a");
            let eb = FieldKind::Int64.encode(&Value::Int64(b)).expect("b");
            assert!(ea < eb, "{a} should sort before {b}");
        }
        let ea = FieldKind::Int32.encode(&Value::Int32(-5)).expect("a");
        let eb = FieldKind::Int32.encode(&Value::Int32(-4)).expect("b");
        assert!(ea < eb);
    }

    #[test]
    fn negative_integers_sort_after_non_negative_ones() {
        let minus_one = FieldKind::Int32.encode(&Value::Int32(-1)).expect("neg");
        let one = FieldKind::Int32.encode(&Value::Int32(1)).expect("pos");
        assert_eq!(minus_one, vec![0xFF, 0xFF, 0xFF, 0xFF]);
        assert!(one < minus_one);
        let min = FieldKind::Int8.encode(&Value::Int8(i8::MIN)).expect("min");
        let max = FieldKind::Int8.encode(&Value::Int8(i8::MAX)).expect("max");
        assert!(max < min);
    }

    #[test]
    fn string_layout_has_length_prefix() {
        let bytes = FieldKind::String.encode(&Value::from("abc")).expect("enc");
        assert_eq!(bytes, vec![0, 3, b'a', b'b', b'c']);

        let mut tail = bytes.clone();
        tail.extend_from_slice(b"trailing");
        let (value, used) = FieldKind::String.decode(&tail).expect("dec");
        assert_eq!(value, Value::from("abc"));
        assert_eq!(used, 5);
    }

    #[test]
    fn string_conversions_are_total() {
        let (value, _) = FieldKind::String
            .decode(&FieldKind::String.encode(&Value::Int32(42)).expect("enc"))
            .expect("dec");
        assert_eq!(value, Value::from("42"));
        assert_eq!(
            FieldKind::String.encode(&Value::Null).expect("enc"),
            vec![0, 0]
        );
    }

    #[test]
    fn long_strings_above_signed_range_round_trip() {
        let text = "x".repeat(40_000);
        let bytes = FieldKind::String.encode(&Value::from(text.as_str())).expect("enc");
        let (value, used) = FieldKind::String.decode(&bytes).expect("dec");
        assert_eq!(value, Value::String(text));
        assert_eq!(used, 40_002);
    }

    #[test]
    fn oversized_string_is_rejected() {
        let text = "y".repeat(MAX_VARLEN + 1);
        let err = FieldKind::String
            .encode(&Value::String(text))
            .expect_err("should fail");
        assert_eq!(err.kind(), ErrorKind::Encoding);

        let exact = "z".repeat(MAX_VARLEN);
        FieldKind::String
            .encode(&Value::String(exact))
            .expect("limit is inclusive");
    }

    #[test]
    fn json_round_trips_structured_values() {
        let value = Value::Json(json!({"a": [1, 2, {"b": null}], "c": "d"}));
        let bytes = FieldKind::Json.encode(&value).expect("enc");
        let (decoded, used) = FieldKind::Json.decode(&bytes).expect("dec");
        assert_eq!(decoded, value);
        assert_eq!(used, bytes.len());

        let (decoded, _) = FieldKind::Json
            .decode(&FieldKind::Json.encode(&Value::Int64(5)).expect("enc"))
            .expect("dec");
        assert_eq!(decoded, Value::Int64(5));
    }

    #[test]
    fn truncated_input_is_an_error() {
        assert!(FieldKind::Int32.decode(&[0, 1]).is_err());
        assert!(FieldKind::String.decode(&[0]).is_err());
        let err = FieldKind::String.decode(&[0, 5, b'a']).expect_err("short body");
        assert_eq!(err.kind(), ErrorKind::Encoding);
    }

    #[test]
    fn kinds_parse_by_name() {
        for kind in [
            FieldKind::Int8,
            FieldKind::Int16,
            FieldKind::Int32,
            FieldKind::Int64,
            FieldKind::String,
            FieldKind::Json,
        ] {
            assert_eq!(kind.as_str().parse::<FieldKind>().expect("parse"), kind);
        }
        let err = "float64".parse::<FieldKind>().expect_err("unsupported");
        assert_eq!(err.kind(), ErrorKind::Schema);
        assert!(err.message().unwrap().contains("unsupported field type"));
    }
}
