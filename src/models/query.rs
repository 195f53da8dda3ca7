//! Query-related data models.
//!
//! This module defines the driver-neutral cell value, the declared parameter
//! and column metadata shared by every backend.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

/// Default command timeout in seconds.
pub const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 30;

/// A single cell or parameter value.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    /// NULL value
    Null,
    Bool(bool),
    /// Integer value (stored as i64 for maximum range)
    Int(i64),
    Float(f64),
    /// Exact numeric kept in its textual database representation.
    Decimal(String),
    Text(String),
    /// Binary data (base64 encoded in JSON)
    #[serde(serialize_with = "base64_bytes::serialize")]
    Bytes(Vec<u8>),
    Json(JsonValue),
    Uuid(Uuid),
    Date(NaiveDate),
    Timestamp(NaiveDateTime),
    TimestampTz(DateTime<Utc>),
}

impl Value {
    /// Check if this value is null.
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Get the type name of this value for debugging.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Decimal(_) => "decimal",
            Self::Text(_) => "text",
            Self::Bytes(_) => "bytes",
            Self::Json(_) => "json",
            Self::Uuid(_) => "uuid",
            Self::Date(_) => "date",
            Self::Timestamp(_) => "timestamp",
            Self::TimestampTz(_) => "timestamptz",
        }
    }

    /// Render as JSON, the way rows are printed by the CLI.
    pub fn to_json(&self) -> JsonValue {
        match self {
            Self::Null => JsonValue::Null,
            Self::Bool(v) => JsonValue::Bool(*v),
            Self::Int(v) => JsonValue::Number((*v).into()),
            Self::Float(v) => serde_json::Number::from_f64(*v)
                .map(JsonValue::Number)
                .unwrap_or_else(|| JsonValue::String(v.to_string())),
            Self::Decimal(v) | Self::Text(v) => JsonValue::String(v.clone()),
            Self::Bytes(v) => {
                use base64::{Engine as _, engine::general_purpose::STANDARD};
                JsonValue::String(STANDARD.encode(v))
            }
            Self::Json(v) => v.clone(),
            Self::Uuid(v) => JsonValue::String(v.to_string()),
            Self::Date(v) => JsonValue::String(v.to_string()),
            Self::Timestamp(v) => JsonValue::String(v.to_string()),
            Self::TimestampTz(v) => JsonValue::String(v.to_rfc3339()),
        }
    }

    /// Build a value from a JSON literal (CLI parameters).
    pub fn from_json(value: JsonValue) -> Self {
        match value {
            JsonValue::Null => Self::Null,
            JsonValue::Bool(v) => Self::Bool(v),
            JsonValue::Number(n) => match n.as_i64() {
                Some(i) => Self::Int(i),
                None => n.as_f64().map(Self::Float).unwrap_or(Self::Null),
            },
            JsonValue::String(s) => Self::Text(s),
            other => Self::Json(other),
        }
    }
}

macro_rules! impl_from_for_value {
    ($($ty:ty => |$v:ident| $body:expr),+ $(,)?) => {
        $(
            impl From<$ty> for Value {
                fn from($v: $ty) -> Self {
                    $body
                }
            }
        )+
    };
}

impl_from_for_value! {
    bool => |v| Value::Bool(v),
    i8 => |v| Value::Int(v.into()),
    i16 => |v| Value::Int(v.into()),
    i32 => |v| Value::Int(v.into()),
    i64 => |v| Value::Int(v),
    u8 => |v| Value::Int(v.into()),
    u16 => |v| Value::Int(v.into()),
    u32 => |v| Value::Int(v.into()),
    f32 => |v| Value::Float(v.into()),
    f64 => |v| Value::Float(v),
    String => |v| Value::Text(v),
    &str => |v| Value::Text(v.to_string()),
    Vec<u8> => |v| Value::Bytes(v),
    &[u8] => |v| Value::Bytes(v.to_vec()),
    JsonValue => |v| Value::Json(v),
    Uuid => |v| Value::Uuid(v),
    NaiveDate => |v| Value::Date(v),
    NaiveDateTime => |v| Value::Timestamp(v),
    DateTime<Utc> => |v| Value::TimestampTz(v),
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

/// Declared database type for a parameter.
///
/// Used to type NULLs and to pick the provider representation of values the
/// backend cannot bind natively.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SqlType {
    Bool,
    SmallInt,
    Int,
    BigInt,
    Real,
    Double,
    Decimal,
    Text,
    Char,
    Binary,
    Json,
    Uuid,
    Date,
    Timestamp,
    TimestampTz,
}

impl SqlType {
    /// The natural declared type for a value.
    pub fn of(value: &Value) -> Option<Self> {
        match value {
            Value::Null => None,
            Value::Bool(_) => Some(Self::Bool),
            Value::Int(_) => Some(Self::BigInt),
            Value::Float(_) => Some(Self::Double),
            Value::Decimal(_) => Some(Self::Decimal),
            Value::Text(_) => Some(Self::Text),
            Value::Bytes(_) => Some(Self::Binary),
            Value::Json(_) => Some(Self::Json),
            Value::Uuid(_) => Some(Self::Uuid),
            Value::Date(_) => Some(Self::Date),
            Value::Timestamp(_) => Some(Self::Timestamp),
            Value::TimestampTz(_) => Some(Self::TimestampTz),
        }
    }
}

/// A named command parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct Parameter {
    /// Name without the provider marker (`@`, `:` or `?`).
    pub name: String,
    pub value: Value,
    pub sql_type: Option<SqlType>,
    pub size: Option<u32>,
    pub precision: Option<u8>,
    pub scale: Option<u8>,
}

impl Parameter {
    pub fn new(name: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            sql_type: None,
            size: None,
            precision: None,
            scale: None,
        }
    }

    pub fn with_type(mut self, sql_type: SqlType) -> Self {
        self.sql_type = Some(sql_type);
        self
    }

    pub fn with_size(mut self, size: u32) -> Self {
        self.size = Some(size);
        self
    }

    pub fn with_precision(mut self, precision: u8, scale: u8) -> Self {
        self.precision = Some(precision);
        self.scale = Some(scale);
        self
    }

    /// Declared type, falling back to the value's natural type.
    pub fn effective_type(&self) -> Option<SqlType> {
        self.sql_type.or_else(|| SqlType::of(&self.value))
    }
}

/// Custom serialization for binary data as base64.
mod base64_bytes {
    use base64::{Engine as _, engine::general_purpose::STANDARD};
    use serde::{Serialize, Serializer};

    #[allow(clippy::ptr_arg)]
    pub fn serialize<S>(bytes: &Vec<u8>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        STANDARD.encode(bytes).serialize(serializer)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnMetadata {
    pub name: String,
    /// Database-specific type (e.g., "int8", "varchar", "TEXT")
    pub type_name: String,
    pub nullable: bool,
}

impl ColumnMetadata {
    /// Create new column metadata.
    pub fn new(name: impl Into<String>, type_name: impl Into<String>, nullable: bool) -> Self {
        Self {
            name: name.into(),
            type_name: type_name.into(),
            nullable,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_types() {
        assert!(Value::Null.is_null());
        assert!(!Value::Bool(true).is_null());
        assert_eq!(Value::Int(42).type_name(), "int");
        assert_eq!(Value::from("hello").type_name(), "text");
    }

    #[test]
    fn test_option_none_becomes_null() {
        let v: Value = None::<i32>.into();
        assert!(v.is_null());
        let v: Value = Some(7i32).into();
        assert_eq!(v, Value::Int(7));
    }

    #[test]
    fn test_value_serializes_bytes_as_base64() {
        let json = serde_json::to_string(&Value::Bytes(b"hello world".to_vec())).unwrap();
        assert_eq!(json, "\"aGVsbG8gd29ybGQ=\"");
        assert_eq!(Value::Bytes(vec![0xFF, 0xFE, 0x00, 0x01]).to_json(), "//4AAQ==");
    }

    #[test]
    fn test_value_from_json() {
        assert_eq!(Value::from_json(serde_json::json!(5)), Value::Int(5));
        assert_eq!(Value::from_json(serde_json::json!(1.5)), Value::Float(1.5));
        assert_eq!(
            Value::from_json(serde_json::json!("x")),
            Value::Text("x".into())
        );
        assert!(matches!(
            Value::from_json(serde_json::json!({"a": 1})),
            Value::Json(_)
        ));
    }

    #[test]
    fn test_parameter_effective_type() {
        let p = Parameter::new("id", 3i64);
        assert_eq!(p.effective_type(), Some(SqlType::BigInt));
        let p = Parameter::new("note", None::<String>);
        assert_eq!(p.effective_type(), None);
        let p = Parameter::new("note", None::<String>).with_type(SqlType::Text);
        assert_eq!(p.effective_type(), Some(SqlType::Text));
    }

    #[test]
    fn test_parameter_precision() {
        let p = Parameter::new("price", Value::Decimal("10.50".into())).with_precision(10, 2);
        assert_eq!(p.precision, Some(10));
        assert_eq!(p.scale, Some(2));
    }
}
