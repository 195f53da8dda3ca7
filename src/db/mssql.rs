//! SQL Server sessions over tiberius.
//!
//! Connection strings are accepted in ADO form (`Server=tcp:host,1433;...`) and
//! as `jdbc:sqlserver://` URLs. Parameters bind positionally to `@P1..@Pn`.

use crate::db::command::Command;
use crate::error::{DbError, DbResult};
use crate::models::{ColumnMetadata, DataTable, Parameter, Row, SqlType, Value};
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use futures_util::future::ready;
use futures_util::stream::{self, BoxStream};
use futures_util::{StreamExt, TryStreamExt};
use std::sync::Arc;
use tiberius::{Client, ColumnData, Config, FromSql, Query};
use tokio::net::TcpStream;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};
use tracing::warn;
use uuid::Uuid;

pub(crate) struct MssqlSession {
    client: Client<Compat<TcpStream>>,
}

fn parse_config(conn_str: &str) -> DbResult<Config> {
    let trimmed = conn_str.trim();
    let lower = trimmed.to_lowercase();
    let parsed = if lower.starts_with("jdbc:") {
        Config::from_jdbc_string(trimmed)
    } else if lower.starts_with("sqlserver://") {
        Config::from_jdbc_string(&format!("jdbc:{}", trimmed))
    } else {
        Config::from_ado_string(trimmed)
    };
    parsed.map_err(|e| {
        DbError::connection(
            format!("Invalid SQL Server connection string: {}", e),
            "Check the connection string format: Server=tcp:host,1433;User Id=...;Password=...",
        )
    })
}

impl MssqlSession {
    pub async fn connect(conn_str: &str) -> DbResult<Self> {
        let config = parse_config(conn_str)?;
        let addr = config.get_addr();
        let tcp = TcpStream::connect(&addr).await.map_err(|e| {
            DbError::connection(
                format!("Failed to connect to {}: {}", addr, e),
                "Check that the SQL Server instance is running and accessible",
            )
        })?;
        tcp.set_nodelay(true).map_err(|e| {
            DbError::connection(
                format!("Failed to configure socket: {}", e),
                "Check network configuration",
            )
        })?;

        let client = Client::connect(config, tcp.compat_write())
            .await
            .map_err(|e| match DbError::from(e) {
                DbError::Database { message, .. } => DbError::connection(
                    format!("Failed to connect: {}", message),
                    "Verify the username and password in the connection string",
                ),
                other => other,
            })?;
        Ok(Self { client })
    }

    pub async fn close(self) -> DbResult<()> {
        self.client.close().await.map_err(DbError::from)
    }

    pub async fn execute(&mut self, command: &Command) -> DbResult<u64> {
        let result = bind(command).execute(&mut self.client).await?;
        Ok(result.rows_affected().iter().sum())
    }

    pub async fn query(&mut self, command: &Command) -> DbResult<DataTable> {
        let mut stream = bind(command).query(&mut self.client).await?;
        let mut table = DataTable::default();
        if let Some(columns) = stream.columns().await? {
            table.columns = columns
                .iter()
                .map(|c| {
                    let type_name = format!("{:?}", c.column_type()).to_lowercase();
                    ColumnMetadata::new(c.name(), type_name, true)
                })
                .collect();
        }

        let mut names = None;
        let mut rows = stream.into_row_stream();
        while let Some(row) = rows.try_next().await? {
            table.rows.push(convert_row(row, &mut names)?);
        }
        Ok(table)
    }

    pub fn fetch<'c>(&'c mut self, command: &'c Command) -> BoxStream<'c, DbResult<Row>> {
        let client = &mut self.client;
        let mut names = None;
        stream::once(async move {
            let stream = bind(command).query(client).await?;
            Ok::<_, DbError>(stream.into_row_stream().map_err(DbError::from))
        })
        .try_flatten()
        .and_then(move |row| ready(convert_row(row, &mut names)))
        .boxed()
    }

    pub async fn execute_batch(&mut self, sql: &str) -> DbResult<()> {
        self.client.simple_query(sql).await?.into_results().await?;
        Ok(())
    }
}

fn bind(command: &Command) -> Query<'_> {
    let mut query = Query::new(command.sql.as_str());
    for param in &command.params {
        bind_param(&mut query, param);
    }
    query
}

fn bind_param(query: &mut Query<'_>, param: &Parameter) {
    match &param.value {
        Value::Null => match param.sql_type {
            Some(SqlType::Bool) => query.bind(Option::<bool>::None),
            Some(SqlType::SmallInt | SqlType::Int | SqlType::BigInt) => {
                query.bind(Option::<i64>::None)
            }
            Some(SqlType::Real | SqlType::Double) => query.bind(Option::<f64>::None),
            Some(SqlType::Binary) => query.bind(Option::<Vec<u8>>::None),
            Some(SqlType::Uuid) => query.bind(Option::<Uuid>::None),
            Some(SqlType::Date) => query.bind(Option::<NaiveDate>::None),
            Some(SqlType::Timestamp) => query.bind(Option::<NaiveDateTime>::None),
            Some(SqlType::TimestampTz) => query.bind(Option::<DateTime<Utc>>::None),
            _ => query.bind(Option::<String>::None),
        },
        Value::Bool(v) => query.bind(*v),
        Value::Int(v) => match param.sql_type {
            Some(SqlType::SmallInt) => match i16::try_from(*v) {
                Ok(n) => query.bind(n),
                Err(_) => query.bind(*v),
            },
            Some(SqlType::Int) => match i32::try_from(*v) {
                Ok(n) => query.bind(n),
                Err(_) => query.bind(*v),
            },
            _ => query.bind(*v),
        },
        Value::Float(v) => match param.sql_type {
            Some(SqlType::Real) => query.bind(*v as f32),
            _ => query.bind(*v),
        },
        // nvarchar converts implicitly to decimal
        Value::Decimal(v) | Value::Text(v) => query.bind(v.clone()),
        Value::Bytes(v) => query.bind(v.clone()),
        Value::Json(v) => query.bind(v.to_string()),
        Value::Uuid(v) => query.bind(*v),
        Value::Date(v) => query.bind(*v),
        Value::Timestamp(v) => query.bind(*v),
        Value::TimestampTz(v) => query.bind(*v),
    }
}

fn convert_row(row: tiberius::Row, names: &mut Option<Arc<[String]>>) -> DbResult<Row> {
    let columns = names
        .get_or_insert_with(|| row.columns().iter().map(|c| c.name().to_string()).collect())
        .clone();
    let values = row
        .into_iter()
        .map(convert_value)
        .collect::<DbResult<Vec<_>>>()?;
    Ok(Row::new(columns, values))
}

fn convert_value(data: ColumnData<'static>) -> DbResult<Value> {
    let value = match data {
        ColumnData::U8(v) => v.map(|n| Value::Int(n.into())),
        ColumnData::I16(v) => v.map(|n| Value::Int(n.into())),
        ColumnData::I32(v) => v.map(|n| Value::Int(n.into())),
        ColumnData::I64(v) => v.map(Value::Int),
        ColumnData::F32(v) => v.map(|n| Value::Float(n.into())),
        ColumnData::F64(v) => v.map(Value::Float),
        ColumnData::Bit(v) => v.map(Value::Bool),
        ColumnData::String(v) => v.map(|s| Value::Text(s.into_owned())),
        ColumnData::Guid(v) => v.map(Value::Uuid),
        ColumnData::Binary(v) => v.map(|b| Value::Bytes(b.into_owned())),
        ColumnData::Numeric(v) => v.map(|n| Value::Decimal(n.to_string())),
        ColumnData::Xml(v) => v.map(|x| Value::Text(x.into_owned().into_string())),
        ref data @ (ColumnData::DateTime(_)
        | ColumnData::SmallDateTime(_)
        | ColumnData::DateTime2(_)) => NaiveDateTime::from_sql(data)?.map(Value::Timestamp),
        ref data @ ColumnData::Date(_) => NaiveDate::from_sql(data)?.map(Value::Date),
        ref data @ ColumnData::Time(_) => {
            NaiveTime::from_sql(data)?.map(|t| Value::Text(t.to_string()))
        }
        ref data @ ColumnData::DateTimeOffset(_) => {
            DateTime::<Utc>::from_sql(data)?.map(Value::TimestampTz)
        }
        #[allow(unreachable_patterns)]
        other => {
            warn!(column = ?other, "Unsupported SQL Server column type, returning NULL");
            None
        }
    };
    Ok(value.unwrap_or(Value::Null))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config_forms() {
        assert!(parse_config("Server=tcp:localhost,1433;User Id=sa;Password=x;TrustServerCertificate=true").is_ok());
        assert!(parse_config("jdbc:sqlserver://localhost:1433;user=sa;password=x").is_ok());
        assert!(parse_config("sqlserver://localhost:1433;user=sa;password=x").is_ok());
    }

    #[test]
    fn test_convert_value_nulls_and_scalars() {
        assert_eq!(convert_value(ColumnData::I32(None)).unwrap(), Value::Null);
        assert_eq!(convert_value(ColumnData::I32(Some(7))).unwrap(), Value::Int(7));
        assert_eq!(convert_value(ColumnData::Bit(Some(true))).unwrap(), Value::Bool(true));
        assert_eq!(
            convert_value(ColumnData::String(Some("abc".into()))).unwrap(),
            Value::Text("abc".into())
        );
    }
}
