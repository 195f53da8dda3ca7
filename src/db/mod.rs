//! Database abstraction layer.
//!
//! This module provides database access functionality:
//! - Connection providers and physical sessions (sqlx, tiberius)
//! - Lookup policies for connection strings and command timeouts
//! - Command construction and named placeholder translation
//! - Explicit connection contexts with local transactions
//! - Backend-specific parameters and the [`DataConnector`] query surface

pub mod backend;
pub mod command;
pub mod connection;
pub mod connector;
pub mod context;
pub mod dialect;
pub mod driver;
#[cfg(feature = "mssql")]
pub mod mssql;
pub mod params;
pub mod placeholders;
pub mod providers;
pub mod types;

pub use backend::{
    Backend, DataAdapter, MySqlBackend, PostgresBackend, SqlServerBackend, SqliteBackend,
    normalize_parameter_name,
};
pub use command::{Command, CommandFactory};
pub use connection::{
    Connection, ConnectionProvider, DEFAULT_CONNECT_TIMEOUT_SECS, SqlConnectionProvider,
};
pub use connector::{ContextConnector, DataConnector};
pub use context::{ConnectionContext, ConnectionContextFactory, TransactionDisposeBehavior};
pub use driver::SqlConnection;
pub use providers::{
    CommandTimeoutProvider, ConfiguredCommandTimeouts, ConfiguredConnectionStrings,
    ConnectionStringProvider, DEFAULT_ENV_PREFIX, EnvConnectionStrings, FixedCommandTimeout,
};
