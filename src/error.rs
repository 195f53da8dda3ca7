//! Error types for ambient-db.
//!
//! This module defines all error types using `thiserror` for ergonomic error handling.
//! Variants map one-to-one onto the fault taxonomy of the ambient core (undeclared keys,
//! out-of-order disposal, use after dispose, null scalars, aborted transactions) plus the
//! driver-level faults surfaced by sqlx and tiberius.

use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Connection failed: {message}")]
    Connection { message: String, suggestion: String },

    #[error("Database error: {message}")]
    Database {
        message: String,
        /// e.g., "42P01" for undefined table
        sql_state: Option<String>,
        suggestion: String,
    },

    #[error("No connection string configured for key '{key}'")]
    ConnectionStringNotFound { key: String },

    #[error("No connection with the key '{key}' is available in this ambient scope")]
    NotDeclared { key: String },

    #[error("Ambient scope {scope_id} disposed out of order (innermost active scope is {innermost})")]
    OrderingViolation { scope_id: String, innermost: String },

    #[error("{object} has already been disposed")]
    Disposed { object: &'static str },

    #[error("Query resulted in NULL but the requested scalar type is not nullable")]
    NullScalar,

    #[error("Transaction {transaction_id} aborted: {reason}")]
    TransactionAborted {
        transaction_id: String,
        reason: String,
    },

    #[error("Transaction error: {message}")]
    Transaction { message: String },

    #[error("Timeout: {operation} exceeded {elapsed_ms}ms")]
    Timeout { operation: String, elapsed_ms: u64 },

    #[error("No ambient flow is active on the current task")]
    NoAmbientFlow,

    #[error("Schema error: {message} (object: {object})")]
    Schema { message: String, object: String },

    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl DbError {
    /// Create a connection error with a helpful suggestion.
    pub fn connection(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    /// Create a database error with optional SQL state.
    pub fn database(
        message: impl Into<String>,
        sql_state: Option<String>,
        suggestion: impl Into<String>,
    ) -> Self {
        Self::Database {
            message: message.into(),
            sql_state,
            suggestion: suggestion.into(),
        }
    }

    pub fn connection_string_not_found(key: impl Into<String>) -> Self {
        Self::ConnectionStringNotFound { key: key.into() }
    }

    pub fn not_declared(key: impl Into<String>) -> Self {
        Self::NotDeclared { key: key.into() }
    }

    pub fn ordering_violation(scope_id: impl Into<String>, innermost: impl Into<String>) -> Self {
        Self::OrderingViolation {
            scope_id: scope_id.into(),
            innermost: innermost.into(),
        }
    }

    pub fn disposed(object: &'static str) -> Self {
        Self::Disposed { object }
    }

    pub fn transaction_aborted(
        transaction_id: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::TransactionAborted {
            transaction_id: transaction_id.into(),
            reason: reason.into(),
        }
    }

    /// Create a transaction error.
    pub fn transaction(message: impl Into<String>) -> Self {
        Self::Transaction {
            message: message.into(),
        }
    }

    /// Create a timeout error.
    pub fn timeout(operation: impl Into<String>, limit: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            elapsed_ms: limit.as_millis() as u64,
        }
    }

    /// Create a schema error.
    pub fn schema(message: impl Into<String>, object: impl Into<String>) -> Self {
        Self::Schema {
            message: message.into(),
            object: object.into(),
        }
    }

    /// Create an invalid input error.
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Get the suggestion for this error, if available.
    pub fn suggestion(&self) -> Option<&str> {
        match self {
            Self::Connection { suggestion, .. } => Some(suggestion),
            Self::Database { suggestion, .. } => Some(suggestion),
            Self::NotDeclared { .. } => {
                Some("Declare the connection key when creating the ambient scope")
            }
            Self::NoAmbientFlow => Some("Run the caller inside ambient::flow or ambient::scoped"),
            _ => None,
        }
    }

    /// Check if this error is retryable.
    ///
    /// Nothing in this crate retries; callers that know their statements are
    /// idempotent can use this to decide.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connection { .. } | Self::Timeout { .. })
    }

    pub fn is_transaction_aborted(&self) -> bool {
        matches!(self, Self::TransactionAborted { .. })
    }

    /// True when the driver lost the session (I/O or protocol failure).
    pub(crate) fn breaks_connection(&self) -> bool {
        matches!(self, Self::Connection { .. })
    }
}

/// Convert sqlx errors to DbError.
impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Configuration(msg) => DbError::connection(
                msg.to_string(),
                "Check the connection string format and credentials",
            ),
            sqlx::Error::Database(db_err) => {
                let code = db_err.code().map(|c| c.to_string());
                DbError::database(
                    db_err.message(),
                    code,
                    "Check the SQL syntax and referenced objects",
                )
            }
            sqlx::Error::RowNotFound => DbError::database(
                "No rows returned",
                None,
                "Verify the query conditions match existing data",
            ),
            sqlx::Error::Io(io_err) => DbError::connection(
                format!("I/O error: {}", io_err),
                "Check network connectivity and database server status",
            ),
            sqlx::Error::Tls(tls_err) => DbError::connection(
                format!("TLS error: {}", tls_err),
                "Verify TLS configuration and certificates",
            ),
            sqlx::Error::Protocol(msg) => DbError::connection(
                format!("Protocol error: {}", msg),
                "Check database server compatibility",
            ),
            sqlx::Error::TypeNotFound { type_name } => DbError::schema(
                format!("Type not found: {}", type_name),
                type_name.to_string(),
            ),
            sqlx::Error::ColumnNotFound(col) => {
                DbError::schema(format!("Column not found: {}", col), col.to_string())
            }
            sqlx::Error::ColumnIndexOutOfBounds { index, len } => DbError::internal(format!(
                "Column index {} out of bounds (len: {})",
                index, len
            )),
            sqlx::Error::ColumnDecode { index, source } => {
                DbError::internal(format!("Failed to decode column {}: {}", index, source))
            }
            sqlx::Error::Decode(source) => DbError::internal(format!("Decode error: {}", source)),
            sqlx::Error::WorkerCrashed => DbError::connection(
                "Database worker crashed",
                "Reopen the connection",
            ),
            _ => DbError::internal(format!("Unknown database error: {}", err)),
        }
    }
}

#[cfg(feature = "mssql")]
impl From<tiberius::error::Error> for DbError {
    fn from(err: tiberius::error::Error) -> Self {
        match err {
            tiberius::error::Error::Server(token) => DbError::database(
                token.message().to_string(),
                Some(token.code().to_string()),
                "Check the SQL syntax and referenced objects",
            ),
            tiberius::error::Error::Io { message, .. } => DbError::connection(
                format!("I/O error: {}", message),
                "Check network connectivity and database server status",
            ),
            tiberius::error::Error::Tls(msg) => DbError::connection(
                format!("TLS error: {}", msg),
                "Verify TLS configuration and certificates",
            ),
            tiberius::error::Error::Protocol(msg) => DbError::connection(
                format!("Protocol error: {}", msg),
                "Check database server compatibility",
            ),
            other => DbError::internal(format!("SQL Server error: {}", other)),
        }
    }
}

/// Result type alias for database operations.
pub type DbResult<T> = Result<T, DbError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sub_second_timeout_display() {
        let err = DbError::timeout("command execution", Duration::from_millis(250));
        assert_eq!(
            err.to_string(),
            "Timeout: command execution exceeded 250ms"
        );
    }

    #[test]
    fn test_error_display() {
        let err = DbError::connection("Failed to connect", "Check credentials");
        assert!(err.to_string().contains("Connection failed"));
    }

    #[test]
    fn test_error_suggestion() {
        let err = DbError::database(
            "Syntax error",
            Some("42601".to_string()),
            "Check SQL syntax",
        );
        assert_eq!(err.suggestion(), Some("Check SQL syntax"));
    }

    #[test]
    fn test_error_retryable() {
        assert!(DbError::timeout("query", Duration::from_secs(30)).is_retryable());
        assert!(DbError::connection("err", "sugg").is_retryable());
        assert!(!DbError::not_declared("db1").is_retryable());
        assert!(!DbError::NullScalar.is_retryable());
    }

    #[test]
    fn test_not_declared_names_key() {
        let err = DbError::not_declared("orders");
        assert!(err.to_string().contains("'orders'"));
        assert!(err.suggestion().is_some());
    }

    #[test]
    fn test_transaction_aborted_detection() {
        let err = DbError::transaction_aborted("tx_1", "timed out");
        assert!(err.is_transaction_aborted());
        assert!(!DbError::transaction("already committed").is_transaction_aborted());
    }

    #[test]
    fn test_disposed_display() {
        let err = DbError::disposed("ConnectionContext");
        assert_eq!(err.to_string(), "ConnectionContext has already been disposed");
    }

    #[test]
    fn test_only_connection_faults_break_sessions() {
        assert!(DbError::connection("io", "retry").breaks_connection());
        assert!(!DbError::database("syntax", None, "fix").breaks_connection());
    }

    #[test]
    fn test_sqlx_row_not_found_maps_to_database() {
        let err: DbError = sqlx::Error::RowNotFound.into();
        assert!(matches!(err, DbError::Database { .. }));
    }

    #[test]
    fn test_sqlx_column_not_found_maps_to_schema() {
        let err: DbError = sqlx::Error::ColumnNotFound("total".to_string()).into();
        match err {
            DbError::Schema { object, .. } => assert_eq!(object, "total"),
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
