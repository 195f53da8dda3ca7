//! Database-agnostic type mappings.
//!
//! This module provides utilities for mapping between database-specific types
//! and the driver-neutral [`Value`].
//!
//! # Architecture
//!
//! Type conversion uses a two-phase approach:
//! 1. `TypeCategory` classifies column types into logical categories
//! 2. Database-specific decoders handle the actual value extraction
//!
//! A cell that cannot be decoded in its category falls back to text and, failing
//! that, to NULL with an error logged, so one odd column never fails a whole row.

use crate::models::{ColumnMetadata, DatabaseType, Row as ValueRow, Value};
use chrono::{DateTime, NaiveTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::mysql::{MySqlRow, MySqlTypeInfo, MySqlValueRef};
use sqlx::postgres::{PgRow, PgTypeInfo, PgValueFormat, PgValueRef};
use sqlx::sqlite::SqliteRow;
use sqlx::{Column, Decode, Row, Type, TypeInfo};
use std::sync::Arc;

// =============================================================================
// Type Classification
// =============================================================================

/// Logical category for database column types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeCategory {
    Integer,
    Float,
    Decimal,
    Boolean,
    Text,
    Binary,
    Json,
    Uuid,
    Date,
    Time,
    Timestamp,
    TimestampTz,
    Unknown,
}

/// Classify a database type name into a logical category.
pub fn categorize_type(type_name: &str, db: DatabaseType) -> TypeCategory {
    let lower = type_name.to_lowercase();

    // Decimal/Numeric - check first as it overlaps with "numeric" in float checks
    if lower.contains("decimal") || lower.contains("numeric") || lower == "money" {
        // SQLite's NUMERIC is actually a float
        if db == DatabaseType::SQLite && lower == "numeric" {
            return TypeCategory::Float;
        }
        return TypeCategory::Decimal;
    }

    // Temporal types, before the "int" check ("interval" is left as text)
    if lower == "timestamptz" || lower == "timestamp with time zone" {
        return TypeCategory::TimestampTz;
    }
    // MySQL TIMESTAMP is stored in UTC
    if lower == "timestamp" && db == DatabaseType::MySQL {
        return TypeCategory::TimestampTz;
    }
    if lower.contains("timestamp") || lower.contains("datetime") {
        return TypeCategory::Timestamp;
    }
    if lower == "date" {
        return TypeCategory::Date;
    }
    if lower == "time" || lower == "time without time zone" {
        return TypeCategory::Time;
    }

    // Boolean
    if lower == "bool" || lower == "boolean" {
        return TypeCategory::Boolean;
    }

    // Integer types
    if (lower.contains("int") && lower != "interval")
        || lower.contains("serial")
        || lower.contains("tiny")
    {
        return TypeCategory::Integer;
    }

    // Float types
    if lower.contains("float")
        || lower.contains("double")
        || lower == "real"
        || lower == "float4"
        || lower == "float8"
    {
        return TypeCategory::Float;
    }

    // JSON types
    if lower == "json" || lower == "jsonb" {
        return TypeCategory::Json;
    }

    if lower == "uuid" {
        return TypeCategory::Uuid;
    }

    // Binary types
    if lower.contains("blob") || lower.contains("binary") || lower == "bytea" {
        return TypeCategory::Binary;
    }

    if lower.contains("char") || lower.contains("text") || lower == "name" {
        return TypeCategory::Text;
    }

    TypeCategory::Unknown
}

// =============================================================================
// Decimal Type Support
// =============================================================================

/// Wrapper type for raw DECIMAL/NUMERIC values as strings.
/// This preserves the exact database representation.
#[derive(Debug)]
pub struct RawDecimal(pub String);

impl Type<sqlx::MySql> for RawDecimal {
    fn type_info() -> MySqlTypeInfo {
        <String as Type<sqlx::MySql>>::type_info()
    }

    fn compatible(ty: &MySqlTypeInfo) -> bool {
        let name = ty.name().to_lowercase();
        name.contains("decimal") || name.contains("numeric")
    }
}

impl<'r> Decode<'r, sqlx::MySql> for RawDecimal {
    fn decode(value: MySqlValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let s = <&str as Decode<sqlx::MySql>>::decode(value)?;
        Ok(RawDecimal(s.to_string()))
    }
}

impl Type<sqlx::Postgres> for RawDecimal {
    fn type_info() -> PgTypeInfo {
        PgTypeInfo::with_name("numeric")
    }

    fn compatible(ty: &PgTypeInfo) -> bool {
        let name = ty.name().to_lowercase();
        name.contains("numeric") || name.contains("decimal") || name == "money"
    }
}

impl<'r> Decode<'r, sqlx::Postgres> for RawDecimal {
    fn decode(value: PgValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        // unprepared statements return text, prepared ones binary digit groups
        match value.format() {
            PgValueFormat::Text => Ok(RawDecimal(value.as_str()?.to_string())),
            PgValueFormat::Binary => Ok(RawDecimal(pg_numeric_to_string(value.as_bytes()?)?)),
        }
    }
}

/// Render a PostgreSQL binary NUMERIC (base-10000 digit groups) as text.
fn pg_numeric_to_string(bytes: &[u8]) -> Result<String, sqlx::error::BoxDynError> {
    if bytes.len() < 8 {
        return Err("numeric value too short".into());
    }
    let read_u16 = |i: usize| u16::from_be_bytes([bytes[i], bytes[i + 1]]);
    let ndigits = read_u16(0) as usize;
    let weight = read_u16(2) as i16 as i32;
    let sign = read_u16(4);
    let dscale = read_u16(6) as usize;

    match sign {
        0xC000 => return Ok("NaN".to_string()),
        0xD000 => return Ok("Infinity".to_string()),
        0xF000 => return Ok("-Infinity".to_string()),
        _ => {}
    }
    if bytes.len() < 8 + ndigits * 2 {
        return Err("numeric value truncated".into());
    }
    let digits: Vec<u16> = (0..ndigits).map(|i| read_u16(8 + i * 2)).collect();

    let mut out = String::new();
    if sign == 0x4000 {
        out.push('-');
    }

    // integer part: groups with weight >= 0
    if weight < 0 {
        out.push('0');
    } else {
        for w in 0..=weight {
            let group = digits.get(w as usize).copied().unwrap_or(0);
            if w == 0 {
                out.push_str(&group.to_string());
            } else {
                out.push_str(&format!("{:04}", group));
            }
        }
    }

    if dscale > 0 {
        let mut frac = String::new();
        let mut group_idx = weight + 1;
        while frac.len() < dscale {
            let group = if group_idx < 0 {
                0
            } else {
                digits.get(group_idx as usize).copied().unwrap_or(0)
            };
            frac.push_str(&format!("{:04}", group));
            group_idx += 1;
        }
        frac.truncate(dscale);
        out.push('.');
        out.push_str(&frac);
    }
    Ok(out)
}

// =============================================================================
// Binary Encoding
// =============================================================================

/// Decode binary data for display.
///
/// If `decode_binary` is true, attempts to decode as UTF-8 text first.
/// Falls back to base64 encoding if not valid UTF-8 or if `decode_binary` is false.
pub fn decode_binary_value(bytes: &[u8], decode_binary: bool) -> JsonValue {
    use base64::{Engine as _, engine::general_purpose::STANDARD};

    if decode_binary {
        if let Ok(s) = std::str::from_utf8(bytes) {
            return JsonValue::String(s.to_string());
        }
    }
    JsonValue::String(STANDARD.encode(bytes))
}

// =============================================================================
// Row Conversion Trait
// =============================================================================

/// Conversion from driver rows to driver-neutral rows.
pub trait RowToValues {
    fn column_names(&self) -> Arc<[String]>;
    fn to_values(&self) -> Vec<Value>;
    fn get_column_metadata(&self) -> Vec<ColumnMetadata>;

    /// Convert, reusing `columns` across the rows of one result set.
    fn to_row(&self, columns: &mut Option<Arc<[String]>>) -> ValueRow {
        let names = columns.get_or_insert_with(|| self.column_names()).clone();
        ValueRow::new(names, self.to_values())
    }
}

macro_rules! impl_row_to_values {
    ($row:ty, $db:expr, $decoder:ident) => {
        impl RowToValues for $row {
            fn column_names(&self) -> Arc<[String]> {
                self.columns().iter().map(|c| c.name().to_string()).collect()
            }

            fn to_values(&self) -> Vec<Value> {
                self.columns()
                    .iter()
                    .enumerate()
                    .map(|(idx, col)| {
                        let type_name = col.type_info().name();
                        let category = categorize_type(type_name, $db);
                        $decoder::decode_column(self, idx, category)
                    })
                    .collect()
            }

            fn get_column_metadata(&self) -> Vec<ColumnMetadata> {
                self.columns()
                    .iter()
                    // nullability is not reported by the drivers at runtime
                    .map(|col| ColumnMetadata::new(col.name(), col.type_info().name(), true))
                    .collect()
            }
        }
    };
}

impl_row_to_values!(MySqlRow, DatabaseType::MySQL, mysql);
impl_row_to_values!(PgRow, DatabaseType::PostgreSQL, postgres);
impl_row_to_values!(SqliteRow, DatabaseType::SQLite, sqlite);

/// Decode `T`, mapping NULL to [`Value::Null`]; `None` when the decoder is incompatible.
fn try_decode<'r, R, T>(row: &'r R, idx: usize, wrap: impl FnOnce(T) -> Value) -> Option<Value>
where
    R: Row,
    T: Decode<'r, R::Database> + Type<R::Database>,
    usize: sqlx::ColumnIndex<R>,
{
    match row.try_get::<Option<T>, _>(idx) {
        Ok(Some(v)) => Some(wrap(v)),
        Ok(None) => Some(Value::Null),
        Err(_) => None,
    }
}

fn float_value(v: f64) -> Value {
    Value::Float(v)
}

// =============================================================================
// Database-Specific Decoders
// =============================================================================

mod mysql {
    use super::*;

    pub fn decode_column(row: &MySqlRow, idx: usize, category: TypeCategory) -> Value {
        let decoded = match category {
            TypeCategory::Decimal => try_decode(row, idx, |v: RawDecimal| Value::Decimal(v.0)),
            TypeCategory::Integer => try_decode(row, idx, Value::Int).or_else(|| {
                try_decode(row, idx, |v: u64| match i64::try_from(v) {
                    Ok(i) => Value::Int(i),
                    Err(_) => Value::Decimal(v.to_string()),
                })
            }),
            TypeCategory::Boolean => try_decode(row, idx, Value::Bool),
            TypeCategory::Float => try_decode(row, idx, float_value)
                .or_else(|| try_decode(row, idx, |v: f32| Value::Float(v.into()))),
            TypeCategory::Binary => try_decode(row, idx, Value::Bytes),
            TypeCategory::Json => try_decode(row, idx, Value::Json),
            TypeCategory::Date => try_decode(row, idx, Value::Date),
            TypeCategory::Time => try_decode(row, idx, |v: NaiveTime| Value::Text(v.to_string())),
            TypeCategory::Timestamp => try_decode(row, idx, Value::Timestamp),
            TypeCategory::TimestampTz => try_decode(row, idx, |v: DateTime<Utc>| Value::TimestampTz(v)),
            TypeCategory::Uuid | TypeCategory::Text | TypeCategory::Unknown => None,
        };
        decoded.unwrap_or_else(|| decode_text(row, idx))
    }

    fn decode_text(row: &MySqlRow, idx: usize) -> Value {
        if let Some(v) = try_decode(row, idx, Value::Text) {
            return v;
        }
        // VARBINARY-backed text columns
        match row.try_get::<Option<Vec<u8>>, _>(idx) {
            Ok(Some(b)) => match String::from_utf8(b) {
                Ok(s) => Value::Text(s),
                Err(e) => Value::Bytes(e.into_bytes()),
            },
            Ok(None) => Value::Null,
            Err(e) => {
                tracing::error!(column = idx, "Failed to decode MySQL column: {:?}", e);
                Value::Null
            }
        }
    }
}

mod postgres {
    use super::*;

    pub fn decode_column(row: &PgRow, idx: usize, category: TypeCategory) -> Value {
        let decoded = match category {
            TypeCategory::Decimal => try_decode(row, idx, |v: RawDecimal| Value::Decimal(v.0)),
            TypeCategory::Integer => try_decode(row, idx, Value::Int)
                .or_else(|| try_decode(row, idx, |v: i32| Value::Int(v.into())))
                .or_else(|| try_decode(row, idx, |v: i16| Value::Int(v.into()))),
            TypeCategory::Boolean => try_decode(row, idx, Value::Bool),
            TypeCategory::Float => try_decode(row, idx, float_value)
                .or_else(|| try_decode(row, idx, |v: f32| Value::Float(v.into()))),
            TypeCategory::Binary => try_decode(row, idx, Value::Bytes),
            TypeCategory::Json => try_decode(row, idx, Value::Json),
            TypeCategory::Uuid => try_decode(row, idx, Value::Uuid),
            TypeCategory::Date => try_decode(row, idx, Value::Date),
            TypeCategory::Time => try_decode(row, idx, |v: NaiveTime| Value::Text(v.to_string())),
            TypeCategory::Timestamp => try_decode(row, idx, Value::Timestamp),
            TypeCategory::TimestampTz => try_decode(row, idx, |v: DateTime<Utc>| Value::TimestampTz(v)),
            TypeCategory::Text | TypeCategory::Unknown => None,
        };
        decoded.unwrap_or_else(|| decode_text(row, idx))
    }

    fn decode_text(row: &PgRow, idx: usize) -> Value {
        match row.try_get::<Option<String>, _>(idx) {
            Ok(Some(v)) => Value::Text(v),
            Ok(None) => Value::Null,
            Err(e) => {
                tracing::error!(column = idx, "Failed to decode PostgreSQL column: {:?}", e);
                Value::Null
            }
        }
    }
}

mod sqlite {
    use super::*;

    pub fn decode_column(row: &SqliteRow, idx: usize, category: TypeCategory) -> Value {
        let decoded = match category {
            TypeCategory::Integer => try_decode(row, idx, Value::Int),
            TypeCategory::Boolean => try_decode(row, idx, Value::Bool),
            TypeCategory::Float => try_decode(row, idx, float_value),
            // stored with REAL/TEXT affinity; keep exact digits when the cell is text
            TypeCategory::Decimal => try_decode(row, idx, Value::Decimal)
                .or_else(|| try_decode(row, idx, float_value)),
            TypeCategory::Binary => try_decode(row, idx, Value::Bytes),
            TypeCategory::Date => try_decode(row, idx, Value::Date),
            TypeCategory::Timestamp => try_decode(row, idx, Value::Timestamp),
            TypeCategory::TimestampTz => try_decode(row, idx, |v: DateTime<Utc>| Value::TimestampTz(v)),
            TypeCategory::Json => try_decode(row, idx, |v: String| {
                serde_json::from_str(&v)
                    .map(Value::Json)
                    .unwrap_or(Value::Text(v))
            }),
            TypeCategory::Uuid | TypeCategory::Time | TypeCategory::Text | TypeCategory::Unknown => {
                None
            }
        };
        decoded.unwrap_or_else(|| decode_dynamic(row, idx))
    }

    /// SQLite cells carry their own storage class; try each in turn.
    fn decode_dynamic(row: &SqliteRow, idx: usize) -> Value {
        try_decode(row, idx, Value::Text)
            .or_else(|| try_decode(row, idx, Value::Int))
            .or_else(|| try_decode(row, idx, float_value))
            .or_else(|| try_decode(row, idx, Value::Bytes))
            .unwrap_or_else(|| {
                tracing::error!(column = idx, "Failed to decode SQLite column");
                Value::Null
            })
    }
}

// =============================================================================
// Type Normalization
// =============================================================================

/// Normalize a database type name to a more consistent format.
pub fn normalize_type_name(type_name: &str) -> String {
    let lower = type_name.to_lowercase();

    match lower.as_str() {
        // Integers
        "int4" | "integer" | "int" => "integer".to_string(),
        "int8" | "bigint" | "bigserial" => "bigint".to_string(),
        "int2" | "smallint" => "smallint".to_string(),
        "tinyint" | "tiny" => "tinyint".to_string(),
        // Text
        "varchar" | "character varying" | "text" | "string" | "nvarchar" | "ntext" => {
            "text".to_string()
        }
        "char" | "character" | "bpchar" | "nchar" => "char".to_string(),
        // Boolean
        "bool" | "boolean" | "bit" => "boolean".to_string(),
        // Float
        "float4" | "real" => "real".to_string(),
        "float8" | "double precision" | "double" | "float" => "double".to_string(),
        // Binary
        "bytea" | "blob" | "binary" | "varbinary" | "image" => "binary".to_string(),
        // Date/Time
        "timestamp" | "datetime" | "datetime2" => "timestamp".to_string(),
        "timestamptz" | "datetimeoffset" => "timestamptz".to_string(),
        "date" => "date".to_string(),
        "time" | "timetz" => "time".to_string(),
        // JSON
        "json" | "jsonb" => "json".to_string(),
        // UUID
        "uuid" | "uniqueidentifier" => "uuid".to_string(),
        // Default
        _ => lower,
    }
}
