//! Physical connections and the provider that builds them.
//!
//! A [`Connection`] is a single driver session. It is exclusively owned by
//! whoever created it: a registry entry, an ad-hoc resolved handle or a
//! [`ConnectionContext`](crate::db::ConnectionContext). There is no pooling.

use crate::db::command::Command;
use crate::db::dialect;
use crate::db::driver::SqlConnection;
use crate::db::providers::ConnectionStringProvider;
use crate::error::{DbError, DbResult};
use crate::models::{ConnectionState, DataTable, DatabaseType, IsolationLevel, Row};
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Default bound on a single connect attempt.
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

/// A live (or not yet opened) database session.
#[async_trait]
pub trait Connection: Send {
    fn connection_key(&self) -> &str;

    fn database_type(&self) -> DatabaseType;

    fn state(&self) -> ConnectionState;

    /// Open the session. A no-op when already open; a broken session is replaced.
    async fn open(&mut self) -> DbResult<()>;

    /// Close the session. Closing a closed connection is a no-op.
    async fn close(&mut self) -> DbResult<()>;

    /// Run a command, returning the number of rows affected.
    async fn execute(&mut self, command: &Command) -> DbResult<u64>;

    /// Run a command and buffer every row.
    async fn query(&mut self, command: &Command) -> DbResult<DataTable>;

    /// Stream rows as the driver produces them.
    fn fetch<'c>(&'c mut self, command: &'c Command) -> BoxStream<'c, DbResult<Row>>;

    /// Run unparameterized SQL through the simple protocol. Used for
    /// transaction control and statements that cannot be prepared.
    async fn execute_batch(&mut self, sql: &str) -> DbResult<()>;

    /// Flag the session as Broken after an exchange was cut off midway,
    /// e.g. by a command timeout. The next `open` replaces it.
    fn mark_broken(&mut self);

    async fn begin(&mut self, isolation: IsolationLevel) -> DbResult<()> {
        for stmt in dialect::begin_statements(self.database_type(), isolation) {
            self.execute_batch(&stmt).await?;
        }
        debug!(
            connection_key = %self.connection_key(),
            isolation = %isolation,
            "Transaction begun"
        );
        Ok(())
    }

    async fn commit(&mut self) -> DbResult<()> {
        let stmt = dialect::commit_statement(self.database_type());
        self.execute_batch(stmt).await
    }

    async fn rollback(&mut self) -> DbResult<()> {
        let stmt = dialect::rollback_statement(self.database_type());
        self.execute_batch(stmt).await
    }

    async fn save(&mut self, name: &str) -> DbResult<()> {
        let stmt = dialect::savepoint_statement(self.database_type(), name)?;
        self.execute_batch(&stmt).await
    }

    async fn rollback_to(&mut self, name: &str) -> DbResult<()> {
        let stmt = dialect::rollback_to_savepoint_statement(self.database_type(), name)?;
        self.execute_batch(&stmt).await
    }
}

/// Builds physical connections for connection keys.
#[async_trait]
pub trait ConnectionProvider: Send + Sync {
    /// Build an unopened connection for `connection_key`.
    fn create(&self, connection_key: &str) -> DbResult<Box<dyn Connection>>;

    /// Build a connection, opening it when `eager` is set.
    async fn open(&self, connection_key: &str, eager: bool) -> DbResult<Box<dyn Connection>> {
        let mut connection = self.create(connection_key)?;
        if eager {
            connection.open().await?;
        }
        Ok(connection)
    }
}

/// Provider backed by sqlx sessions (and tiberius for SQL Server).
#[derive(Clone)]
pub struct SqlConnectionProvider {
    strings: Arc<dyn ConnectionStringProvider>,
    connect_timeout: Duration,
}

impl SqlConnectionProvider {
    pub fn new(strings: Arc<dyn ConnectionStringProvider>) -> Self {
        Self {
            strings,
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
        }
    }

    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    /// Detect the backend for a key without connecting.
    pub fn database_type(&self, connection_key: &str) -> DbResult<DatabaseType> {
        let connection_string = self.strings.lookup(connection_key)?;
        detect(connection_key, &connection_string)
    }
}

fn detect(connection_key: &str, connection_string: &str) -> DbResult<DatabaseType> {
    let db_type = DatabaseType::from_connection_string(connection_string).ok_or_else(|| {
        DbError::connection(
            format!(
                "Unrecognized connection string for '{}'",
                connection_key
            ),
            "Use postgres://, mysql://, sqlite: or a SQL Server 'Server=...' string",
        )
    })?;

    if db_type == DatabaseType::SqlServer && !cfg!(feature = "mssql") {
        return Err(DbError::connection(
            format!("SQL Server support is not enabled for '{}'", connection_key),
            "Rebuild with the 'mssql' feature",
        ));
    }
    Ok(db_type)
}

#[async_trait]
impl ConnectionProvider for SqlConnectionProvider {
    fn create(&self, connection_key: &str) -> DbResult<Box<dyn Connection>> {
        let connection_string = self.strings.lookup(connection_key)?;
        let db_type = detect(connection_key, &connection_string)?;
        Ok(Box::new(SqlConnection::new(
            connection_key,
            db_type,
            connection_string,
            self.connect_timeout,
        )))
    }
}

impl std::fmt::Debug for SqlConnectionProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqlConnectionProvider")
            .field("connect_timeout", &self.connect_timeout)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::providers::ConfiguredConnectionStrings;

    fn provider() -> SqlConnectionProvider {
        SqlConnectionProvider::new(Arc::new(
            ConfiguredConnectionStrings::new()
                .with("main", "sqlite::memory:")
                .with("bogus", "redis://localhost"),
        ))
    }

    #[test]
    fn test_create_is_unopened() {
        let connection = provider().create("main").unwrap();
        assert_eq!(connection.connection_key(), "main");
        assert_eq!(connection.database_type(), DatabaseType::SQLite);
        assert_eq!(connection.state(), ConnectionState::Closed);
    }

    #[test]
    fn test_create_unknown_key() {
        let err = provider().create("missing").err().unwrap();
        assert!(matches!(err, DbError::ConnectionStringNotFound { .. }));
    }

    #[test]
    fn test_create_unrecognized_scheme() {
        let err = provider().create("bogus").err().unwrap();
        assert!(matches!(err, DbError::Connection { .. }));
    }

    #[tokio::test]
    async fn test_open_eager() {
        let connection = provider().open("main", true).await.unwrap();
        assert_eq!(connection.state(), ConnectionState::Open);
    }

    #[test]
    fn test_connect_timeout_default() {
        assert_eq!(
            provider().connect_timeout(),
            Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS)
        );
    }
}
