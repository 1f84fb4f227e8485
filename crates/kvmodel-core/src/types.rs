//! Field kinds and their backend string encoding.

use std::fmt::Write as _;

use crate::error::{Error, Result, TypeError};
use crate::value::Value;

/// Storage kind of a model field.
///
/// Every value lands in the store as a string; the kind decides how it is
/// encoded, decoded, scored for sorted sets and sorted by `SORT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldType {
    Bool,
    Int,
    Float,
    Text,
    Bytes,
    Json,
}

impl FieldType {
    pub const fn name(self) -> &'static str {
        match self {
            FieldType::Bool => "bool",
            FieldType::Int => "int",
            FieldType::Float => "float",
            FieldType::Text => "text",
            FieldType::Bytes => "bytes",
            FieldType::Json => "json",
        }
    }

    /// Numeric kinds can score a sorted set and sort without `ALPHA`.
    pub const fn is_numeric(self) -> bool {
        matches!(self, FieldType::Bool | FieldType::Int | FieldType::Float)
    }

    /// Scalar kinds can be sorted on and used as index values.
    pub const fn is_scalar(self) -> bool {
        !matches!(self, FieldType::Json)
    }

    /// Encode a value into its backend string form. `Null` has none.
    pub fn encode(self, value: &Value) -> Option<String> {
        match value {
            Value::Null => None,
            Value::Bool(b) => Some(if *b { "1" } else { "0" }.to_string()),
            Value::Int(i) => Some(i.to_string()),
            Value::Float(x) => Some(x.to_string()),
            Value::Text(s) => Some(s.clone()),
            Value::Bytes(b) => Some(match self {
                FieldType::Bytes => hex_encode(b),
                _ => String::from_utf8_lossy(b).into_owned(),
            }),
            Value::Json(j) => Some(match (self, j) {
                (FieldType::Text, serde_json::Value::String(s)) => s.clone(),
                _ => j.to_string(),
            }),
        }
    }

    /// Decode a backend string back into a value of this kind.
    pub fn decode(self, raw: &str) -> Result<Value> {
        let mismatch = |expected: &'static str| {
            Error::Type(TypeError {
                expected,
                actual: format!("{raw:?}"),
                field: None,
            })
        };
        match self {
            FieldType::Bool => match raw {
                "1" | "true" => Ok(Value::Bool(true)),
                "0" | "false" | "" => Ok(Value::Bool(false)),
                _ => Err(mismatch("bool")),
            },
            FieldType::Int => raw
                .parse::<i64>()
                .map(Value::Int)
                .map_err(|_| mismatch("int")),
            FieldType::Float => raw
                .parse::<f64>()
                .map(Value::Float)
                .map_err(|_| mismatch("float")),
            FieldType::Text => Ok(Value::Text(raw.to_string())),
            FieldType::Bytes => hex_decode(raw)
                .map(Value::Bytes)
                .ok_or_else(|| mismatch("hex bytes")),
            FieldType::Json => serde_json::from_str(raw)
                .map(Value::Json)
                .map_err(|_| mismatch("json")),
        }
    }

    /// Sorted-set score for a value of this kind.
    pub fn score(self, value: &Value) -> Option<f64> {
        if !self.is_numeric() {
            return None;
        }
        value.as_f64()
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(out, "{b:02x}");
    }
    out
}

fn hex_decode(raw: &str) -> Option<Vec<u8>> {
    if raw.len() % 2 != 0 {
        return None;
    }
    (0..raw.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(raw.get(i..i + 2)?, 16).ok())
        .collect()
}
