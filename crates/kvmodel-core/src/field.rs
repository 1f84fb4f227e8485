//! Field descriptors and Rust type mapping.

use crate::error::{Error, Result, TypeError};
use crate::types::FieldType;
use crate::value::Value;

/// Static description of one model field.
///
/// Generated by `#[derive(Model)]`; the model catalog reads these once at
/// registration time to decide key layout and lowering strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldInfo {
    /// Rust field name, also the record field name
    pub name: &'static str,
    /// Storage kind
    pub field_type: FieldType,
    /// Whether `Null` is an acceptable value
    pub nullable: bool,
    /// Whether this is the identity field
    pub primary_key: bool,
    /// Whether the backend assigns the identity from a counter
    pub auto: bool,
    /// Whether a permanent index set is kept per distinct value
    pub index: bool,
    /// Whether a value maps to at most one id
    pub unique: bool,
    /// Whether an empty string is acceptable for a text field
    pub blank: bool,
    /// Whether this is the optimistic version counter
    pub version: bool,
    /// Maximum length in characters for text fields
    pub max_length: Option<usize>,
    /// Regex a text value must match
    pub pattern: Option<&'static str>,
}

impl FieldInfo {
    /// Create a new field info with minimal required data.
    pub const fn new(name: &'static str, field_type: FieldType) -> Self {
        Self {
            name,
            field_type,
            nullable: false,
            primary_key: false,
            auto: false,
            index: false,
            unique: false,
            blank: false,
            version: false,
            max_length: None,
            pattern: None,
        }
    }

    pub const fn nullable(mut self, value: bool) -> Self {
        self.nullable = value;
        self
    }

    pub const fn primary_key(mut self, value: bool) -> Self {
        self.primary_key = value;
        self
    }

    pub const fn auto(mut self, value: bool) -> Self {
        self.auto = value;
        self
    }

    pub const fn index(mut self, value: bool) -> Self {
        self.index = value;
        self
    }

    /// Unique fields are always indexed.
    pub const fn unique(mut self, value: bool) -> Self {
        self.unique = value;
        if value {
            self.index = true;
        }
        self
    }

    pub const fn blank(mut self, value: bool) -> Self {
        self.blank = value;
        self
    }

    pub const fn version(mut self, value: bool) -> Self {
        self.version = value;
        self
    }

    pub const fn max_length(mut self, value: usize) -> Self {
        self.max_length = Some(value);
        self
    }

    pub const fn max_length_opt(mut self, value: Option<usize>) -> Self {
        self.max_length = value;
        self
    }

    pub const fn pattern(mut self, value: &'static str) -> Self {
        self.pattern = Some(value);
        self
    }

    pub const fn pattern_opt(mut self, value: Option<&'static str>) -> Self {
        self.pattern = value;
        self
    }

    /// Lookups on this field need a backend structure (identity, index or unique map).
    pub const fn is_queryable(&self) -> bool {
        self.primary_key || self.index || self.unique
    }
}

/// A Rust type that can live in a model field.
///
/// A field absent from a stored record reads as `Default::default()`.
pub trait FieldValue: Sized + Default {
    const FIELD_TYPE: FieldType;
    const NULLABLE: bool = false;

    fn to_value(&self) -> Value;

    fn from_value(value: Value) -> Result<Self>;
}

fn null_error(expected: &'static str) -> Error {
    Error::Type(TypeError {
        expected,
        actual: "NULL".to_string(),
        field: None,
    })
}

macro_rules! impl_field_value {
    ($ty:ty, $kind:expr, $name:literal, $to:expr) => {
        impl FieldValue for $ty {
            const FIELD_TYPE: FieldType = $kind;

            fn to_value(&self) -> Value {
                let to: fn(&$ty) -> Value = $to;
                to(self)
            }

            fn from_value(value: Value) -> Result<Self> {
                if value.is_null() {
                    return Err(null_error($name));
                }
                <$ty>::try_from(value)
            }
        }
    };
}

impl_field_value!(bool, FieldType::Bool, "bool", |v| Value::Bool(*v));
impl_field_value!(i64, FieldType::Int, "i64", |v| Value::Int(*v));
impl_field_value!(i32, FieldType::Int, "i32", |v| Value::Int(i64::from(*v)));
impl_field_value!(u32, FieldType::Int, "u32", |v| Value::Int(i64::from(*v)));
impl_field_value!(f64, FieldType::Float, "f64", |v| Value::Float(*v));
impl_field_value!(String, FieldType::Text, "String", |v| Value::Text(v.clone()));
impl_field_value!(Vec<u8>, FieldType::Bytes, "Vec<u8>", |v| Value::Bytes(v.clone()));
impl_field_value!(serde_json::Value, FieldType::Json, "JSON", |v| Value::Json(v.clone()));

impl FieldValue for f32 {
    const FIELD_TYPE: FieldType = FieldType::Float;

    fn to_value(&self) -> Value {
        Value::Float(f64::from(*self))
    }

    fn from_value(value: Value) -> Result<Self> {
        if value.is_null() {
            return Err(null_error("f32"));
        }
        f64::try_from(value).map(|v| v as f32)
    }
}

impl<T: FieldValue> FieldValue for Option<T> {
    const FIELD_TYPE: FieldType = T::FIELD_TYPE;
    const NULLABLE: bool = true;

    fn to_value(&self) -> Value {
        match self {
            Some(v) => v.to_value(),
            None => Value::Null,
        }
    }

    fn from_value(value: Value) -> Result<Self> {
        if value.is_null() {
            Ok(None)
        } else {
            T::from_value(value).map(Some)
        }
    }
}
