//! Data models for ambient-db.
//!
//! This module re-exports all model types used throughout the crate.

pub mod connection;
pub mod query;
pub mod row;

// Re-export commonly used types
pub use connection::{ConnectionState, DatabaseType, IsolationLevel, masked_connection_string};
pub use query::{ColumnMetadata, DEFAULT_COMMAND_TIMEOUT_SECS, Parameter, SqlType, Value};
pub use row::{DataTable, FromValue, Row, ValueError};
