//! Query surface over resolved connections.
//!
//! A [`DataConnector`] runs commands against one connection key. Each call
//! resolves a connection through the [`ConnectionResolver`], so inside an
//! ambient scope it uses the scope's shared connection and otherwise opens an
//! ad-hoc one that is closed again before the call returns.
//! [`DataConnector::with_context`] runs against an explicit
//! [`ConnectionContext`] instead.

use crate::ambient::{ConnectionResolver, ResolvedConnection};
use crate::db::backend::Backend;
use crate::db::command::{Command, CommandFactory};
use crate::db::connection::{Connection, ConnectionProvider};
use crate::db::context::ConnectionContext;
use crate::error::{DbError, DbResult};
use crate::models::{DataTable, FromValue, Parameter, Row, Value};
use futures_util::TryStreamExt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use uuid::Uuid;

/// Resolve a connection, build the command on it, run `$body`, dispose.
macro_rules! with_resolved {
    ($self:ident, $sql:expr, $params:expr, |$conn:ident, $cmd:ident| $body:expr) => {{
        let mut resolved = $self
            .resolver
            .resolve(&$self.connection_key, true)
            .await?;
        let result = async {
            let mut guard = resolved.lock().await?;
            let $conn: &mut dyn Connection = &mut *guard;
            let command = $self.command(&*$conn, &$self.connection_key, None, $sql, $params)?;
            let $cmd = &command;
            $body.await
        }
        .await;
        finish(&mut resolved, result).await
    }};
}

/// Runs commands for one connection key on backend `B`.
#[derive(Clone)]
pub struct DataConnector<B: Backend> {
    backend: B,
    resolver: ConnectionResolver,
    commands: CommandFactory,
    connection_key: String,
}

impl<B: Backend> DataConnector<B> {
    pub fn new(
        backend: B,
        provider: Arc<dyn ConnectionProvider>,
        commands: CommandFactory,
        connection_key: impl Into<String>,
    ) -> Self {
        Self {
            backend,
            resolver: ConnectionResolver::new(provider),
            commands,
            connection_key: connection_key.into(),
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn connection_key(&self) -> &str {
        &self.connection_key
    }

    /// Shorthand for the backend's untyped parameter.
    pub fn parameter(&self, name: &str, value: impl Into<Value>) -> Parameter {
        self.backend.build_parameter(name, value)
    }

    /// Run against an explicit context instead of resolving a connection.
    pub fn with_context<'a>(&'a self, context: &'a mut ConnectionContext) -> ContextConnector<'a, B> {
        ContextConnector {
            connector: self,
            context,
        }
    }

    fn command(
        &self,
        connection: &dyn Connection,
        connection_key: &str,
        transaction_id: Option<Uuid>,
        sql: &str,
        params: &[Parameter],
    ) -> DbResult<Command> {
        self.commands.build(
            connection.database_type(),
            connection_key,
            transaction_id,
            sql,
            params,
        )
    }

    /// Rows affected.
    pub async fn execute_non_query(&self, sql: &str, params: &[Parameter]) -> DbResult<u64> {
        with_resolved!(self, sql, params, |connection, command| non_query(connection, command))
    }

    /// First column of the first row.
    ///
    /// NULL or an empty result is [`DbError::NullScalar`] unless `T` is an
    /// `Option`, which yields `None`.
    pub async fn execute_scalar<T>(&self, sql: &str, params: &[Parameter]) -> DbResult<T>
    where
        T: FromValue + Send,
    {
        let value = with_resolved!(self, sql, params, |connection, command| scalar(
            connection, command
        ))?;
        T::from_value(value).map_err(DbError::from)
    }

    /// Stream rows into `on_row` without buffering. Returns the row count.
    pub async fn execute_reader<F>(&self, sql: &str, params: &[Parameter], on_row: F) -> DbResult<usize>
    where
        F: FnMut(Row) -> DbResult<()> + Send,
    {
        with_resolved!(self, sql, params, |connection, command| read(
            connection, command, on_row
        ))
    }

    /// Map each streamed row through `project`.
    pub async fn execute_projection<T, F>(
        &self,
        sql: &str,
        params: &[Parameter],
        mut project: F,
    ) -> DbResult<Vec<T>>
    where
        T: Send,
        F: FnMut(&Row) -> DbResult<T> + Send,
    {
        let mut projected = Vec::new();
        self.execute_reader(sql, params, |row| {
            projected.push(project(&row)?);
            Ok(())
        })
        .await?;
        Ok(projected)
    }

    /// Buffer the whole result through the backend's data adapter.
    pub async fn execute_table(&self, sql: &str, params: &[Parameter]) -> DbResult<DataTable> {
        with_resolved!(self, sql, params, |connection, command| table(
            &self.backend,
            connection,
            command
        ))
    }

    /// Buffer the result, then map each row through `project`.
    pub async fn execute_table_projection<T, F>(
        &self,
        sql: &str,
        params: &[Parameter],
        project: F,
    ) -> DbResult<Vec<T>>
    where
        F: FnMut(&Row) -> DbResult<T>,
    {
        let table = self.execute_table(sql, params).await?;
        table.rows.iter().map(project).collect()
    }
}

impl<B: Backend + std::fmt::Debug> std::fmt::Debug for DataConnector<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataConnector")
            .field("backend", &self.backend)
            .field("connection_key", &self.connection_key)
            .finish_non_exhaustive()
    }
}

/// A [`DataConnector`] bound to an explicit [`ConnectionContext`].
///
/// Commands carry the context's transaction id and run on its connection.
pub struct ContextConnector<'a, B: Backend> {
    connector: &'a DataConnector<B>,
    context: &'a mut ConnectionContext,
}

impl<B: Backend> ContextConnector<'_, B> {
    async fn prepare(&mut self, sql: &str, params: &[Parameter]) -> DbResult<(&mut dyn Connection, Command)> {
        let key = self.context.connection_key().to_string();
        let transaction_id = self.context.transaction_id();
        let connection = self.context.connection().await?;
        let command = self
            .connector
            .command(&*connection, &key, transaction_id, sql, params)?;
        Ok((connection, command))
    }

    pub async fn execute_non_query(&mut self, sql: &str, params: &[Parameter]) -> DbResult<u64> {
        let (connection, command) = self.prepare(sql, params).await?;
        non_query(connection, &command).await
    }

    pub async fn execute_scalar<T>(&mut self, sql: &str, params: &[Parameter]) -> DbResult<T>
    where
        T: FromValue + Send,
    {
        let (connection, command) = self.prepare(sql, params).await?;
        let value = scalar(connection, &command).await?;
        T::from_value(value).map_err(DbError::from)
    }

    pub async fn execute_reader<F>(&mut self, sql: &str, params: &[Parameter], on_row: F) -> DbResult<usize>
    where
        F: FnMut(Row) -> DbResult<()> + Send,
    {
        let (connection, command) = self.prepare(sql, params).await?;
        read(connection, &command, on_row).await
    }

    pub async fn execute_projection<T, F>(
        &mut self,
        sql: &str,
        params: &[Parameter],
        mut project: F,
    ) -> DbResult<Vec<T>>
    where
        T: Send,
        F: FnMut(&Row) -> DbResult<T> + Send,
    {
        let mut projected = Vec::new();
        self.execute_reader(sql, params, |row| {
            projected.push(project(&row)?);
            Ok(())
        })
        .await?;
        Ok(projected)
    }

    pub async fn execute_table(&mut self, sql: &str, params: &[Parameter]) -> DbResult<DataTable> {
        let connector = self.connector;
        let (connection, command) = self.prepare(sql, params).await?;
        table(&connector.backend, connection, &command).await
    }

    pub async fn execute_table_projection<T, F>(
        &mut self,
        sql: &str,
        params: &[Parameter],
        project: F,
    ) -> DbResult<Vec<T>>
    where
        F: FnMut(&Row) -> DbResult<T>,
    {
        let table = self.execute_table(sql, params).await?;
        table.rows.iter().map(project).collect()
    }
}

// =============================================================================
// Operations
// =============================================================================

async fn non_query(connection: &mut dyn Connection, command: &Command) -> DbResult<u64> {
    let start = Instant::now();
    log_command(command, "Executing non-query");
    let affected = with_timeout(command.timeout, connection.execute(command)).await;
    let affected = interrupted(connection, affected)?;
    debug!(
        connection_key = %command.connection_key,
        rows_affected = affected,
        elapsed_ms = start.elapsed().as_millis() as u64,
        "Non-query completed"
    );
    Ok(affected)
}

async fn scalar(connection: &mut dyn Connection, command: &Command) -> DbResult<Value> {
    log_command(command, "Executing scalar");
    let first = with_timeout(command.timeout, async {
        let mut rows = connection.fetch(command);
        rows.try_next().await
    })
    .await;
    let first = interrupted(connection, first)?;
    Ok(first
        .and_then(|row| row.into_values().into_iter().next())
        .unwrap_or(Value::Null))
}

async fn table<B: Backend>(
    backend: &B,
    connection: &mut dyn Connection,
    command: &Command,
) -> DbResult<DataTable> {
    log_command(command, "Filling table");
    let adapter = backend.build_data_adapter(command.clone());
    let table = with_timeout(command.timeout, adapter.fill(&mut *connection)).await;
    let table = interrupted(connection, table)?;
    debug!(
        connection_key = %command.connection_key,
        rows = table.row_count(),
        "Table filled"
    );
    Ok(table)
}

async fn read<F>(connection: &mut dyn Connection, command: &Command, mut on_row: F) -> DbResult<usize>
where
    F: FnMut(Row) -> DbResult<()> + Send,
{
    log_command(command, "Executing reader");
    let count = with_timeout(command.timeout, async {
        let mut rows = connection.fetch(command);
        let mut count = 0;
        while let Some(row) = rows.try_next().await? {
            on_row(row)?;
            count += 1;
        }
        Ok(count)
    })
    .await;
    interrupted(connection, count)
}

fn log_command(command: &Command, message: &'static str) {
    debug!(
        connection_key = %command.connection_key,
        transaction_id = ?command.transaction_id,
        sql = %command.sql,
        params = command.params.len(),
        timeout = ?command.timeout,
        "{}",
        message
    );
}

/// Bound `fut` by the command timeout; `None` waits indefinitely.
async fn with_timeout<T>(
    limit: Option<Duration>,
    fut: impl Future<Output = DbResult<T>>,
) -> DbResult<T> {
    match limit {
        Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| DbError::timeout("command execution", limit))?,
        None => fut.await,
    }
}

/// A timed-out command was dropped mid-exchange, so its session is broken.
/// Inside an ambient transaction that aborts the transaction.
fn interrupted<T>(connection: &mut dyn Connection, result: DbResult<T>) -> DbResult<T> {
    if let Err(e @ DbError::Timeout { .. }) = &result {
        warn!(
            connection_key = %connection.connection_key(),
            error = %e,
            "Command interrupted; session marked broken"
        );
        connection.mark_broken();
    }
    result
}

/// Dispose the handle; an execution error wins over a dispose error.
async fn finish<T>(resolved: &mut ResolvedConnection, result: DbResult<T>) -> DbResult<T> {
    let disposed = resolved.dispose().await;
    let value = result?;
    disposed?;
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ambient::{AmbientTransactionScope, flow};
    use crate::db::backend::PostgresBackend;
    use crate::db::context::{ConnectionContextFactory, TransactionDisposeBehavior};
    use crate::models::{ColumnMetadata, DatabaseType};
    use crate::testing::RecordingProvider;

    fn connector() -> (DataConnector<PostgresBackend>, RecordingProvider) {
        let provider = RecordingProvider::new();
        let connector = DataConnector::new(
            PostgresBackend,
            Arc::new(provider.clone()),
            CommandFactory::default(),
            "main",
        );
        (connector, provider)
    }

    fn single(value: Value) -> DataTable {
        let columns: Arc<[String]> = vec!["v".to_string()].into();
        DataTable {
            columns: vec![ColumnMetadata::new("v", "int8", true)],
            rows: vec![Row::new(columns, vec![value])],
        }
    }

    #[tokio::test]
    async fn test_ad_hoc_connection_per_call() {
        let (connector, provider) = connector();
        let affected = connector
            .execute_non_query(" DELETE FROM t WHERE id = @id ", &[connector.parameter("@id", 1i64)])
            .await
            .unwrap();
        assert_eq!(affected, 1);
        connector.execute_non_query("DELETE FROM t", &[]).await.unwrap();
        assert_eq!(
            provider.events(),
            vec![
                "open:main",
                "exec:DELETE FROM t WHERE id = $1",
                "close:main",
                "open:main",
                "exec:DELETE FROM t",
                "close:main"
            ]
        );
    }

    #[tokio::test]
    async fn test_scalar_null_handling() {
        let (connector, provider) = connector();
        provider.respond("SELECT v", single(Value::Null));
        provider.respond("SELECT n", single(Value::Int(3)));

        let err = connector.execute_scalar::<i64>("SELECT v", &[]).await.unwrap_err();
        assert!(matches!(err, DbError::NullScalar));
        let none: Option<i64> = connector.execute_scalar("SELECT v", &[]).await.unwrap();
        assert_eq!(none, None);
        let missing = connector.execute_scalar::<i64>("SELECT nothing", &[]).await.unwrap_err();
        assert!(matches!(missing, DbError::NullScalar));
        let three: i64 = connector.execute_scalar("SELECT n", &[]).await.unwrap();
        assert_eq!(three, 3);
    }

    #[tokio::test]
    async fn test_reader_and_projections() {
        let (connector, provider) = connector();
        let columns: Arc<[String]> = vec!["v".to_string()].into();
        provider.respond(
            "SELECT v FROM t",
            DataTable {
                columns: vec![ColumnMetadata::new("v", "int4", false)],
                rows: (1..=3)
                    .map(|n| Row::new(columns.clone(), vec![Value::Int(n)]))
                    .collect(),
            },
        );

        let mut seen = Vec::new();
        let count = connector
            .execute_reader("SELECT v FROM t", &[], |row| {
                seen.push(row.try_get::<i64>(0)?);
                Ok(())
            })
            .await
            .unwrap();
        assert_eq!(count, 3);
        assert_eq!(seen, vec![1, 2, 3]);

        let doubled = connector
            .execute_projection("SELECT v FROM t", &[], |row| Ok(row.try_get::<i64>(0)? * 2))
            .await
            .unwrap();
        assert_eq!(doubled, vec![2, 4, 6]);

        let table = connector.execute_table("SELECT v FROM t", &[]).await.unwrap();
        assert_eq!(table.columns[0].type_name, "integer");
        let names = connector
            .execute_table_projection("SELECT v FROM t", &[], |row| row.try_get::<String>(0))
            .await
            .unwrap();
        assert_eq!(names, vec!["1", "2", "3"]);
    }

    #[tokio::test]
    async fn test_failed_command_still_closes() {
        let (connector, provider) = connector();
        provider.fail_statement("DROP TABLE t");
        assert!(connector.execute_non_query("DROP TABLE t", &[]).await.is_err());
        assert_eq!(
            provider.events(),
            vec!["open:main", "exec:DROP TABLE t", "close:main"]
        );
    }

    #[tokio::test]
    async fn test_ambient_scope_shares_one_connection() {
        let (connector, provider) = connector();
        let shared: Arc<dyn ConnectionProvider> = Arc::new(provider.clone());
        flow(async move {
            let mut scope = AmbientTransactionScope::new(shared, ["main"]).unwrap();
            connector.execute_non_query("UPDATE a SET x = 1", &[]).await.unwrap();
            connector.execute_non_query("UPDATE b SET x = 1", &[]).await.unwrap();
            scope.commit().unwrap();
            scope.dispose().await.unwrap();
        })
        .await;
        assert_eq!(
            provider.events(),
            vec![
                "open:main",
                "BEGIN ISOLATION LEVEL SERIALIZABLE",
                "exec:UPDATE a SET x = 1",
                "exec:UPDATE b SET x = 1",
                "COMMIT",
                "close:main"
            ]
        );
    }

    #[tokio::test]
    async fn test_context_commands_carry_transaction() {
        let (connector, provider) = connector();
        let factory = ConnectionContextFactory::new(Arc::new(provider.clone()));
        let mut context = factory
            .create_with_transaction("main", TransactionDisposeBehavior::CommitIfUnfinalized)
            .await
            .unwrap();
        {
            let mut bound = connector.with_context(&mut context);
            bound.execute_non_query("INSERT INTO t VALUES (1)", &[]).await.unwrap();
            let count: Option<i64> = bound.execute_scalar("SELECT count(*) FROM t", &[]).await.unwrap();
            assert_eq!(count, None);
        }
        context.dispose().await.unwrap();
        assert_eq!(
            provider.events(),
            vec![
                "open:main",
                "BEGIN",
                "exec:INSERT INTO t VALUES (1)",
                "query:SELECT count(*) FROM t",
                "COMMIT",
                "close:main"
            ]
        );
        assert_eq!(context.database_type(), DatabaseType::PostgreSQL);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_expiry() {
        let result = with_timeout(Some(Duration::from_secs(1)), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        assert!(matches!(result, Err(DbError::Timeout { elapsed_ms: 1000, .. })));
    }
}
