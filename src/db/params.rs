//! Parameter binding utilities for database queries.
//!
//! This module binds declared [`Parameter`]s to database-specific query objects.
//! NULLs are typed from the declared [`SqlType`]; values a backend has no native
//! type for are bound in their textual form.

use crate::db::command::Command;
use crate::error::{DbError, DbResult};
use crate::models::{Parameter, SqlType, Value};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::mysql::MySqlArguments;
use sqlx::postgres::PgArguments;
use sqlx::query::Query;
use sqlx::sqlite::SqliteArguments;
use sqlx::types::Json;
use sqlx::{MySql, Postgres, Sqlite};
use uuid::Uuid;

fn out_of_range(param: &Parameter, target: &str) -> DbError {
    DbError::invalid_input(format!(
        "Value for parameter '{}' does not fit {}",
        param.name, target
    ))
}

/// Bind every parameter of a command to a MySQL query.
pub(crate) fn bind_mysql(command: &Command) -> DbResult<Query<'_, MySql, MySqlArguments>> {
    let mut query = sqlx::query(&command.sql);
    for param in &command.params {
        query = bind_mysql_param(query, param)?;
    }
    Ok(query)
}

/// Bind every parameter of a command to a PostgreSQL query.
pub(crate) fn bind_postgres(command: &Command) -> DbResult<Query<'_, Postgres, PgArguments>> {
    let mut query = sqlx::query(&command.sql);
    for param in &command.params {
        query = bind_postgres_param(query, param)?;
    }
    Ok(query)
}

/// Bind every parameter of a command to a SQLite query.
pub(crate) fn bind_sqlite(command: &Command) -> DbResult<Query<'_, Sqlite, SqliteArguments<'_>>> {
    let mut query = sqlx::query(&command.sql);
    for param in &command.params {
        query = bind_sqlite_param(query, param)?;
    }
    Ok(query)
}

/// Bind a parameter to a MySQL query.
pub(crate) fn bind_mysql_param<'q>(
    query: Query<'q, MySql, MySqlArguments>,
    param: &'q Parameter,
) -> DbResult<Query<'q, MySql, MySqlArguments>> {
    Ok(match &param.value {
        Value::Null => match param.sql_type {
            Some(SqlType::Bool) => query.bind(None::<bool>),
            Some(SqlType::SmallInt | SqlType::Int | SqlType::BigInt) => query.bind(None::<i64>),
            Some(SqlType::Real | SqlType::Double) => query.bind(None::<f64>),
            Some(SqlType::Binary) => query.bind(None::<Vec<u8>>),
            Some(SqlType::Date) => query.bind(None::<NaiveDate>),
            Some(SqlType::Timestamp) => query.bind(None::<NaiveDateTime>),
            Some(SqlType::TimestampTz) => query.bind(None::<DateTime<Utc>>),
            _ => query.bind(None::<String>),
        },
        Value::Bool(v) => query.bind(*v),
        Value::Int(v) => match param.sql_type {
            Some(SqlType::SmallInt) => {
                query.bind(i16::try_from(*v).map_err(|_| out_of_range(param, "SMALLINT"))?)
            }
            Some(SqlType::Int) => {
                query.bind(i32::try_from(*v).map_err(|_| out_of_range(param, "INT"))?)
            }
            Some(SqlType::Bool) => query.bind(*v != 0),
            _ => query.bind(*v),
        },
        Value::Float(v) => match param.sql_type {
            Some(SqlType::Real) => query.bind(*v as f32),
            _ => query.bind(*v),
        },
        Value::Decimal(v) | Value::Text(v) => query.bind(v.as_str()),
        Value::Bytes(v) => query.bind(v.as_slice()),
        Value::Json(v) => query.bind(Json(v)),
        // stored as CHAR(36)
        Value::Uuid(v) => query.bind(v.hyphenated().to_string()),
        Value::Date(v) => query.bind(*v),
        Value::Timestamp(v) => query.bind(*v),
        Value::TimestampTz(v) => query.bind(*v),
    })
}

/// Bind a parameter to a PostgreSQL query.
pub(crate) fn bind_postgres_param<'q>(
    query: Query<'q, Postgres, PgArguments>,
    param: &'q Parameter,
) -> DbResult<Query<'q, Postgres, PgArguments>> {
    Ok(match &param.value {
        Value::Null => match param.sql_type {
            Some(SqlType::Bool) => query.bind(None::<bool>),
            Some(SqlType::SmallInt) => query.bind(None::<i16>),
            Some(SqlType::Int) => query.bind(None::<i32>),
            Some(SqlType::BigInt) => query.bind(None::<i64>),
            Some(SqlType::Real) => query.bind(None::<f32>),
            Some(SqlType::Double) => query.bind(None::<f64>),
            Some(SqlType::Binary) => query.bind(None::<Vec<u8>>),
            Some(SqlType::Json) => query.bind(None::<Json<JsonValue>>),
            Some(SqlType::Uuid) => query.bind(None::<Uuid>),
            Some(SqlType::Date) => query.bind(None::<NaiveDate>),
            Some(SqlType::Timestamp) => query.bind(None::<NaiveDateTime>),
            Some(SqlType::TimestampTz) => query.bind(None::<DateTime<Utc>>),
            _ => query.bind(None::<String>),
        },
        Value::Bool(v) => query.bind(*v),
        Value::Int(v) => match param.sql_type {
            Some(SqlType::SmallInt) => {
                query.bind(i16::try_from(*v).map_err(|_| out_of_range(param, "SMALLINT"))?)
            }
            Some(SqlType::Int) => {
                query.bind(i32::try_from(*v).map_err(|_| out_of_range(param, "INTEGER"))?)
            }
            Some(SqlType::Bool) => query.bind(*v != 0),
            _ => query.bind(*v),
        },
        Value::Float(v) => match param.sql_type {
            Some(SqlType::Real) => query.bind(*v as f32),
            _ => query.bind(*v),
        },
        // placeholders of decimal parameters carry a ::numeric cast
        Value::Decimal(v) => query.bind(v.as_str()),
        Value::Text(v) => match param.sql_type {
            Some(SqlType::Uuid) => query.bind(
                Uuid::parse_str(v.trim())
                    .map_err(|e| DbError::invalid_input(format!("Parameter '{}': {}", param.name, e)))?,
            ),
            Some(SqlType::Json) => query.bind(Json(
                serde_json::from_str::<JsonValue>(v)
                    .map_err(|e| DbError::invalid_input(format!("Parameter '{}': {}", param.name, e)))?,
            )),
            _ => query.bind(v.as_str()),
        },
        Value::Bytes(v) => query.bind(v.as_slice()),
        Value::Json(v) => query.bind(Json(v)),
        Value::Uuid(v) => query.bind(*v),
        Value::Date(v) => query.bind(*v),
        Value::Timestamp(v) => query.bind(*v),
        Value::TimestampTz(v) => query.bind(*v),
    })
}

/// Bind a parameter to a SQLite query.
pub(crate) fn bind_sqlite_param<'q>(
    query: Query<'q, Sqlite, SqliteArguments<'q>>,
    param: &'q Parameter,
) -> DbResult<Query<'q, Sqlite, SqliteArguments<'q>>> {
    Ok(match &param.value {
        Value::Null => match param.sql_type {
            Some(SqlType::Bool | SqlType::SmallInt | SqlType::Int | SqlType::BigInt) => {
                query.bind(None::<i64>)
            }
            Some(SqlType::Real | SqlType::Double) => query.bind(None::<f64>),
            Some(SqlType::Binary) => query.bind(None::<Vec<u8>>),
            _ => query.bind(None::<String>),
        },
        Value::Bool(v) => query.bind(*v),
        Value::Int(v) => query.bind(*v),
        Value::Float(v) => query.bind(*v),
        Value::Decimal(v) | Value::Text(v) => query.bind(v.as_str()),
        Value::Bytes(v) => query.bind(v.as_slice()),
        // SQLite doesn't have native JSON type, store as string
        Value::Json(v) => query.bind(v.to_string()),
        Value::Uuid(v) => query.bind(v.hyphenated().to_string()),
        Value::Date(v) => query.bind(*v),
        Value::Timestamp(v) => query.bind(*v),
        Value::TimestampTz(v) => query.bind(*v),
    })
}
