//! Ambient DB Library
//!
//! Flow-scoped ambient transactions and connection resolution over
//! PostgreSQL, MySQL, SQLite and (with the `mssql` feature) SQL Server.
//!
//! Code inside an [`ambient::AmbientTransactionScope`] that asks the
//! [`ambient::ConnectionResolver`] for a declared connection key gets the one
//! physical connection shared by every scope in the flow, enlisted in the
//! innermost scope's transaction. Outside a scope each request opens its own
//! connection.

pub mod ambient;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod testing;

pub use ambient::{
    AmbientTransactionFactory, AmbientTransactionScope, ConnectionResolver, ScopeOption,
    TransactionOptions,
};
pub use config::Config;
pub use db::{CommandFactory, ConnectionContext, DataConnector, SqlConnectionProvider};
pub use error::{DbError, DbResult};
pub use models::{DatabaseType, IsolationLevel, Parameter, Value};
