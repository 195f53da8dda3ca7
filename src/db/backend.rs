//! Backend-specific parameter construction and table filling.
//!
//! Each backend decides how a declared [`SqlType`] is represented on the wire
//! and how buffered tables are filled. [`DataConnector`](crate::db::DataConnector)
//! is generic over the backend, so the choice is static.

use crate::db::command::Command;
use crate::db::connection::Connection;
use crate::db::types::normalize_type_name;
use crate::error::DbResult;
use crate::models::{DataTable, DatabaseType, Parameter, SqlType, Value};

/// Strip a provider marker (`@`, `:` or `?`) from a parameter name.
pub fn normalize_parameter_name(name: &str) -> &str {
    name.strip_prefix(['@', ':', '?']).unwrap_or(name)
}

pub trait Backend: Send + Sync + Clone + 'static {
    fn database_type(&self) -> DatabaseType;

    /// The type this backend binds for a declared type.
    fn map_type(&self, sql_type: SqlType) -> SqlType {
        sql_type
    }

    fn build_parameter(&self, name: &str, value: impl Into<Value>) -> Parameter {
        let value = value.into();
        let param = Parameter::new(normalize_parameter_name(name), value);
        match param.effective_type() {
            Some(natural) if self.map_type(natural) != natural => {
                let mapped = self.map_type(natural);
                param.with_type(mapped)
            }
            _ => param,
        }
    }

    fn build_typed_parameter(
        &self,
        name: &str,
        value: impl Into<Value>,
        sql_type: SqlType,
    ) -> Parameter {
        Parameter::new(normalize_parameter_name(name), value).with_type(self.map_type(sql_type))
    }

    fn build_sized_parameter(
        &self,
        name: &str,
        value: impl Into<Value>,
        sql_type: SqlType,
        size: u32,
    ) -> Parameter {
        self.build_typed_parameter(name, value, sql_type)
            .with_size(size)
    }

    fn build_precise_parameter(
        &self,
        name: &str,
        value: impl Into<Value>,
        sql_type: SqlType,
        size: u32,
        precision: u8,
        scale: u8,
    ) -> Parameter {
        self.build_sized_parameter(name, value, sql_type, size)
            .with_precision(precision, scale)
    }

    fn build_scaled_parameter(
        &self,
        name: &str,
        value: impl Into<Value>,
        sql_type: SqlType,
        precision: u8,
        scale: u8,
    ) -> Parameter {
        self.build_typed_parameter(name, value, sql_type)
            .with_precision(precision, scale)
    }

    fn build_data_adapter(&self, command: Command) -> DataAdapter {
        DataAdapter::new(command)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PostgresBackend;

impl Backend for PostgresBackend {
    fn database_type(&self) -> DatabaseType {
        DatabaseType::PostgreSQL
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MySqlBackend;

impl Backend for MySqlBackend {
    fn database_type(&self) -> DatabaseType {
        DatabaseType::MySQL
    }

    fn map_type(&self, sql_type: SqlType) -> SqlType {
        match sql_type {
            // CHAR(36)
            SqlType::Uuid => SqlType::Char,
            other => other,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteBackend;

impl Backend for SqliteBackend {
    fn database_type(&self) -> DatabaseType {
        DatabaseType::SQLite
    }

    fn map_type(&self, sql_type: SqlType) -> SqlType {
        match sql_type {
            SqlType::Uuid => SqlType::Char,
            SqlType::Json => SqlType::Text,
            other => other,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SqlServerBackend;

impl Backend for SqlServerBackend {
    fn database_type(&self) -> DatabaseType {
        DatabaseType::SqlServer
    }

    fn map_type(&self, sql_type: SqlType) -> SqlType {
        match sql_type {
            // nvarchar(max)
            SqlType::Json => SqlType::Text,
            other => other,
        }
    }
}

/// Fills a [`DataTable`] from one command.
#[derive(Debug, Clone)]
pub struct DataAdapter {
    command: Command,
}

impl DataAdapter {
    pub fn new(command: Command) -> Self {
        Self { command }
    }

    pub fn command(&self) -> &Command {
        &self.command
    }

    /// Run the command and buffer every row. Column type names are normalized
    /// across backends (`int4` and `integer` both become `integer`).
    pub async fn fill(&self, connection: &mut dyn Connection) -> DbResult<DataTable> {
        let mut table = connection.query(&self.command).await?;
        for column in &mut table.columns {
            column.type_name = normalize_type_name(&column.type_name);
        }
        Ok(table)
    }
}
