//! Parameterized commands bound to a connection key.

use crate::db::placeholders::{PlaceholderStyle, translate_named};
use crate::db::providers::{CommandTimeoutProvider, FixedCommandTimeout};
use crate::error::{DbError, DbResult};
use crate::models::{DatabaseType, Parameter};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// A ready-to-execute command: native placeholders, parameters in bind order.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub connection_key: String,
    pub database_type: DatabaseType,
    /// Explicit transaction the command runs in, if any.
    pub transaction_id: Option<Uuid>,
    pub sql: String,
    pub params: Vec<Parameter>,
    /// `None` means no timeout.
    pub timeout: Option<Duration>,
}

impl Command {
    /// A parameterless command with no timeout, used for session control statements.
    pub fn text(database_type: DatabaseType, sql: impl Into<String>) -> Self {
        Self {
            connection_key: String::new(),
            database_type,
            transaction_id: None,
            sql: sql.into(),
            params: Vec::new(),
            timeout: None,
        }
    }

    pub fn has_params(&self) -> bool {
        !self.params.is_empty()
    }
}

/// Builds [`Command`]s, applying the timeout policy for the key.
#[derive(Clone)]
pub struct CommandFactory {
    timeouts: Arc<dyn CommandTimeoutProvider>,
}

impl CommandFactory {
    pub fn new(timeouts: Arc<dyn CommandTimeoutProvider>) -> Self {
        Self { timeouts }
    }

    /// Normalize command text before execution.
    pub fn format_sql(sql: &str) -> &str {
        sql.trim()
    }

    pub fn build(
        &self,
        database_type: DatabaseType,
        connection_key: &str,
        transaction_id: Option<Uuid>,
        sql: &str,
        params: &[Parameter],
    ) -> DbResult<Command> {
        let sql = Self::format_sql(sql);
        if sql.is_empty() {
            return Err(DbError::invalid_input("Command text cannot be empty"));
        }

        let translated = translate_named(
            sql,
            params,
            PlaceholderStyle::for_database(database_type),
        )?;
        let params = translated
            .bind_order
            .iter()
            .map(|&idx| params[idx].clone())
            .collect();

        let timeout = self.timeouts.lookup(connection_key);
        Ok(Command {
            connection_key: connection_key.to_string(),
            database_type,
            transaction_id,
            sql: translated.sql,
            params,
            timeout: (!timeout.is_zero()).then_some(timeout),
        })
    }
}

impl Default for CommandFactory {
    fn default() -> Self {
        Self::new(Arc::new(FixedCommandTimeout::thirty_seconds()))
    }
}

impl std::fmt::Debug for CommandFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandFactory").finish_non_exhaustive()
    }
}
