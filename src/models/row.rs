//! Result rows, buffered tables and typed value extraction.

use crate::error::{DbError, DbResult};
use crate::models::query::{ColumnMetadata, Value};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde_json::Value as JsonValue;
use std::sync::Arc;
use uuid::Uuid;

/// Why a [`Value`] could not become the requested Rust type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValueError {
    Null,
    Mismatch {
        expected: &'static str,
        found: &'static str,
    },
}

impl From<ValueError> for DbError {
    fn from(err: ValueError) -> Self {
        match err {
            ValueError::Null => DbError::NullScalar,
            ValueError::Mismatch { expected, found } => {
                DbError::invalid_input(format!("Cannot convert {found} value to {expected}"))
            }
        }
    }
}

/// Conversion out of a driver-neutral [`Value`].
///
/// NULL is an error for every plain type; request `Option<T>` to accept it.
pub trait FromValue: Sized {
    fn from_value(value: Value) -> Result<Self, ValueError>;
}

fn mismatch<T>(expected: &'static str, value: &Value) -> Result<T, ValueError> {
    Err(ValueError::Mismatch {
        expected,
        found: value.type_name(),
    })
}

impl FromValue for Value {
    fn from_value(value: Value) -> Result<Self, ValueError> {
        match value {
            Value::Null => Err(ValueError::Null),
            v => Ok(v),
        }
    }
}

impl<T: FromValue> FromValue for Option<T> {
    fn from_value(value: Value) -> Result<Self, ValueError> {
        match value {
            Value::Null => Ok(None),
            v => T::from_value(v).map(Some),
        }
    }
}

impl FromValue for i64 {
    fn from_value(value: Value) -> Result<Self, ValueError> {
        match value {
            Value::Null => Err(ValueError::Null),
            Value::Int(v) => Ok(v),
            Value::Bool(v) => Ok(v as i64),
            Value::Float(v) if v.fract() == 0.0 && v.abs() < i64::MAX as f64 => Ok(v as i64),
            Value::Decimal(ref s) | Value::Text(ref s) => match s.trim().parse::<i64>() {
                Ok(v) => Ok(v),
                Err(_) => mismatch("i64", &value),
            },
            ref other => mismatch("i64", other),
        }
    }
}

macro_rules! impl_narrow_int {
    ($($ty:ty),+) => {
        $(
            impl FromValue for $ty {
                fn from_value(value: Value) -> Result<Self, ValueError> {
                    let found = value.type_name();
                    let wide = i64::from_value(value)?;
                    <$ty>::try_from(wide).map_err(|_| ValueError::Mismatch {
                        expected: stringify!($ty),
                        found,
                    })
                }
            }
        )+
    };
}

impl_narrow_int!(i8, i16, i32, u8, u16, u32, u64);

impl FromValue for f64 {
    fn from_value(value: Value) -> Result<Self, ValueError> {
        match value {
            Value::Null => Err(ValueError::Null),
            Value::Float(v) => Ok(v),
            Value::Int(v) => Ok(v as f64),
            Value::Decimal(ref s) | Value::Text(ref s) => match s.trim().parse::<f64>() {
                Ok(v) => Ok(v),
                Err(_) => mismatch("f64", &value),
            },
            ref other => mismatch("f64", other),
        }
    }
}

impl FromValue for f32 {
    fn from_value(value: Value) -> Result<Self, ValueError> {
        f64::from_value(value).map(|v| v as f32)
    }
}

impl FromValue for bool {
    fn from_value(value: Value) -> Result<Self, ValueError> {
        match value {
            Value::Null => Err(ValueError::Null),
            Value::Bool(v) => Ok(v),
            // MySQL TINYINT(1) and SQLite integers
            Value::Int(0) => Ok(false),
            Value::Int(1) => Ok(true),
            Value::Text(ref s) => match s.to_ascii_lowercase().as_str() {
                "true" | "t" | "1" => Ok(true),
                "false" | "f" | "0" => Ok(false),
                _ => mismatch("bool", &value),
            },
            ref other => mismatch("bool", other),
        }
    }
}

impl FromValue for String {
    fn from_value(value: Value) -> Result<Self, ValueError> {
        match value {
            Value::Null => Err(ValueError::Null),
            Value::Text(s) | Value::Decimal(s) => Ok(s),
            Value::Bytes(ref b) => match String::from_utf8(b.clone()) {
                Ok(s) => Ok(s),
                Err(_) => mismatch("String", &value),
            },
            Value::Json(JsonValue::String(s)) => Ok(s),
            other => match other.to_json() {
                JsonValue::String(s) => Ok(s),
                json => Ok(json.to_string()),
            },
        }
    }
}

impl FromValue for Vec<u8> {
    fn from_value(value: Value) -> Result<Self, ValueError> {
        match value {
            Value::Null => Err(ValueError::Null),
            Value::Bytes(b) => Ok(b),
            Value::Text(s) => Ok(s.into_bytes()),
            other => mismatch("Vec<u8>", &other),
        }
    }
}

impl FromValue for JsonValue {
    fn from_value(value: Value) -> Result<Self, ValueError> {
        match value {
            Value::Null => Err(ValueError::Null),
            Value::Json(v) => Ok(v),
            Value::Text(ref s) => match serde_json::from_str(s) {
                Ok(v) => Ok(v),
                Err(_) => mismatch("JSON", &value),
            },
            other => Ok(other.to_json()),
        }
    }
}

impl FromValue for Uuid {
    fn from_value(value: Value) -> Result<Self, ValueError> {
        match value {
            Value::Null => Err(ValueError::Null),
            Value::Uuid(v) => Ok(v),
            Value::Text(ref s) => match Uuid::parse_str(s.trim()) {
                Ok(v) => Ok(v),
                Err(_) => mismatch("Uuid", &value),
            },
            Value::Bytes(ref b) => match Uuid::from_slice(b) {
                Ok(v) => Ok(v),
                Err(_) => mismatch("Uuid", &value),
            },
            ref other => mismatch("Uuid", other),
        }
    }
}

impl FromValue for NaiveDate {
    fn from_value(value: Value) -> Result<Self, ValueError> {
        match value {
            Value::Null => Err(ValueError::Null),
            Value::Date(v) => Ok(v),
            Value::Timestamp(v) => Ok(v.date()),
            Value::TimestampTz(v) => Ok(v.date_naive()),
            Value::Text(ref s) => match NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d") {
                Ok(v) => Ok(v),
                Err(_) => mismatch("NaiveDate", &value),
            },
            ref other => mismatch("NaiveDate", other),
        }
    }
}

fn parse_naive_timestamp(s: &str) -> Option<NaiveDateTime> {
    const FORMATS: &[&str] = &["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"];
    FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
}

impl FromValue for NaiveDateTime {
    fn from_value(value: Value) -> Result<Self, ValueError> {
        match value {
            Value::Null => Err(ValueError::Null),
            Value::Timestamp(v) => Ok(v),
            Value::TimestampTz(v) => Ok(v.naive_utc()),
            Value::Text(ref s) => match parse_naive_timestamp(s.trim()) {
                Some(v) => Ok(v),
                None => mismatch("NaiveDateTime", &value),
            },
            ref other => mismatch("NaiveDateTime", other),
        }
    }
}

impl FromValue for DateTime<Utc> {
    fn from_value(value: Value) -> Result<Self, ValueError> {
        match value {
            Value::Null => Err(ValueError::Null),
            Value::TimestampTz(v) => Ok(v),
            Value::Timestamp(v) => Ok(v.and_utc()),
            Value::Text(ref s) => {
                let s = s.trim();
                if let Ok(v) = DateTime::parse_from_rfc3339(s) {
                    return Ok(v.with_timezone(&Utc));
                }
                match parse_naive_timestamp(s) {
                    Some(v) => Ok(v.and_utc()),
                    None => mismatch("DateTime<Utc>", &value),
                }
            }
            ref other => mismatch("DateTime<Utc>", other),
        }
    }
}

/// One result row. Column names are shared across the rows of a result set.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    columns: Arc<[String]>,
    values: Vec<Value>,
}

impl Row {
    pub fn new(columns: Arc<[String]>, values: Vec<Value>) -> Self {
        debug_assert_eq!(columns.len(), values.len());
        Self { columns, values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn into_values(self) -> Vec<Value> {
        self.values
    }

    pub fn get(&self, idx: usize) -> Option<&Value> {
        self.values.get(idx)
    }

    /// Column lookup: exact match first, then case-insensitive.
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|c| c == name)
            .or_else(|| self.columns.iter().position(|c| c.eq_ignore_ascii_case(name)))
    }

    pub fn get_by_name(&self, name: &str) -> Option<&Value> {
        self.column_index(name).and_then(|idx| self.values.get(idx))
    }

    /// Typed access by position.
    pub fn try_get<T: FromValue>(&self, idx: usize) -> DbResult<T> {
        let value = self.values.get(idx).cloned().ok_or_else(|| {
            DbError::internal(format!(
                "Column index {} out of bounds (len: {})",
                idx,
                self.values.len()
            ))
        })?;
        T::from_value(value).map_err(|e| match e {
            // a NULL cell is only a null-scalar fault for scalars
            ValueError::Null => DbError::invalid_input(format!(
                "Column {} is NULL; request Option<_> to read it",
                self.columns[idx]
            )),
            other => other.into(),
        })
    }

    /// Typed access by column name.
    pub fn try_get_by_name<T: FromValue>(&self, name: &str) -> DbResult<T> {
        let idx = self
            .column_index(name)
            .ok_or_else(|| DbError::schema(format!("Column not found: {}", name), name))?;
        self.try_get(idx)
    }

    pub fn to_json_map(&self) -> serde_json::Map<String, JsonValue> {
        self.columns
            .iter()
            .zip(&self.values)
            .map(|(c, v)| (c.clone(), v.to_json()))
            .collect()
    }
}

/// A fully buffered result set.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DataTable {
    pub columns: Vec<ColumnMetadata>,
    pub rows: Vec<Row>,
}

impl DataTable {
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name).or_else(|| {
            self.columns
                .iter()
                .position(|c| c.name.eq_ignore_ascii_case(name))
        })
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Row> {
        self.rows.iter()
    }

    /// First cell of the first row, or NULL when the table is empty.
    pub fn first_value(&self) -> Value {
        self.rows
            .first()
            .and_then(|r| r.get(0))
            .cloned()
            .unwrap_or(Value::Null)
    }
}

impl IntoIterator for DataTable {
    type Item = Row;
    type IntoIter = std::vec::IntoIter<Row>;

    fn into_iter(self) -> Self::IntoIter {
        self.rows.into_iter()
    }
}
