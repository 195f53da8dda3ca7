//! In-memory recording connections.
//!
//! [`RecordingProvider`] hands out connections that talk to no database and
//! log every lifecycle event and statement instead. Code built on the ambient
//! core can be exercised against it to check what would be sent, and when.

use crate::db::{Command, Connection, ConnectionProvider};
use crate::error::{DbError, DbResult};
use crate::models::{ConnectionState, DataTable, DatabaseType, Row};
use async_trait::async_trait;
use futures_util::StreamExt;
use futures_util::stream::{self, BoxStream};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

#[derive(Default)]
struct Shared {
    events: Vec<(String, String)>,
    failing_keys: HashSet<String>,
    failing_statements: HashSet<String>,
    breaking_statements: HashSet<String>,
    delays: HashMap<String, Duration>,
    responses: HashMap<String, DataTable>,
}

/// Provider whose connections record what they are asked to do.
///
/// Events are `open:<key>`, `close:<key>`, `exec:<sql>`, `query:<sql>` and
/// transaction-control statements verbatim (`BEGIN`, `COMMIT`, ...).
#[derive(Clone)]
pub struct RecordingProvider {
    database_type: DatabaseType,
    shared: Arc<Mutex<Shared>>,
    created: Arc<AtomicUsize>,
}

impl RecordingProvider {
    /// Connections speak the PostgreSQL dialect.
    pub fn new() -> Self {
        Self::with_database_type(DatabaseType::PostgreSQL)
    }

    pub fn with_database_type(database_type: DatabaseType) -> Self {
        Self {
            database_type,
            shared: Arc::new(Mutex::new(Shared::default())),
            created: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Shared> {
        lock(&self.shared)
    }

    /// Every event, in order.
    pub fn events(&self) -> Vec<String> {
        self.lock().events.iter().map(|(_, e)| e.clone()).collect()
    }

    /// Events recorded by connections for `key`.
    pub fn events_for(&self, key: &str) -> Vec<String> {
        self.lock()
            .events
            .iter()
            .filter(|(k, _)| k == key)
            .map(|(_, e)| e.clone())
            .collect()
    }

    pub fn clear(&self) {
        self.lock().events.clear();
    }

    /// Number of connections created so far.
    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    /// Make every later open of `key` fail with a connect fault.
    pub fn fail_open(&self, key: &str) {
        self.lock().failing_keys.insert(key.to_string());
    }

    /// Make a statement fail with a database fault wherever it runs.
    pub fn fail_statement(&self, sql: &str) {
        self.lock().failing_statements.insert(sql.to_string());
    }

    /// Make a statement lose the session: it fails with a connect fault and
    /// the connection turns Broken until it is reopened.
    pub fn break_on(&self, sql: &str) {
        self.lock().breaking_statements.insert(sql.to_string());
    }

    /// Hold a statement for `delay` after it is recorded.
    pub fn delay_statement(&self, sql: &str, delay: Duration) {
        self.lock().delays.insert(sql.to_string(), delay);
    }

    /// Result returned by queries whose text is exactly `sql`.
    pub fn respond(&self, sql: &str, table: DataTable) {
        self.lock().responses.insert(sql.to_string(), table);
    }
}

impl Default for RecordingProvider {
    fn default() -> Self {
        Self::new()
    }
}

fn lock(shared: &Mutex<Shared>) -> MutexGuard<'_, Shared> {
    // a panicking test must not hide the log from the others
    shared.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl ConnectionProvider for RecordingProvider {
    fn create(&self, connection_key: &str) -> DbResult<Box<dyn Connection>> {
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(RecordingConnection {
            connection_key: connection_key.to_string(),
            database_type: self.database_type,
            open: false,
            broken: false,
            shared: Arc::clone(&self.shared),
        }))
    }
}

/// A connection that only records.
pub struct RecordingConnection {
    connection_key: String,
    database_type: DatabaseType,
    open: bool,
    broken: bool,
    shared: Arc<Mutex<Shared>>,
}

impl RecordingConnection {
    fn record(&mut self, event: String) -> DbResult<()> {
        let mut shared = lock(&self.shared);
        let sql = event.split_once(':').map(|(_, sql)| sql);
        let matches = |set: &HashSet<String>| {
            set.contains(&event) || sql.is_some_and(|sql| set.contains(sql))
        };
        let failing = matches(&shared.failing_statements);
        let breaking = matches(&shared.breaking_statements);
        shared.events.push((self.connection_key.clone(), event.clone()));
        if breaking {
            self.broken = true;
            return Err(DbError::connection(
                format!("Connection '{}' lost during: {}", self.connection_key, event),
                "Recorded failure",
            ));
        }
        if failing {
            return Err(DbError::database(
                format!("statement failed: {}", event),
                None,
                "Recorded failure",
            ));
        }
        Ok(())
    }

    /// Sleep for the delay registered for `sql`, if any.
    async fn hold(&self, sql: &str) {
        let delay = lock(&self.shared).delays.get(sql).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }

    fn ensure_open(&self) -> DbResult<()> {
        if self.broken {
            Err(DbError::connection(
                format!("Connection '{}' is broken", self.connection_key),
                "Reopen the connection",
            ))
        } else if self.open {
            Ok(())
        } else {
            Err(DbError::connection(
                format!("Connection '{}' is not open", self.connection_key),
                "Open the connection before executing commands",
            ))
        }
    }

    fn response(&self, sql: &str) -> DataTable {
        lock(&self.shared)
            .responses
            .get(sql)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl Connection for RecordingConnection {
    fn connection_key(&self) -> &str {
        &self.connection_key
    }

    fn database_type(&self) -> DatabaseType {
        self.database_type
    }

    fn state(&self) -> ConnectionState {
        if self.broken {
            ConnectionState::Broken
        } else if self.open {
            ConnectionState::Open
        } else {
            ConnectionState::Closed
        }
    }

    async fn open(&mut self) -> DbResult<()> {
        if std::mem::take(&mut self.broken) {
            self.open = false;
        }
        if self.open {
            return Ok(());
        }
        if lock(&self.shared).failing_keys.contains(&self.connection_key) {
            return Err(DbError::connection(
                format!("Failed to connect '{}'", self.connection_key),
                "Recorded failure",
            ));
        }
        self.record(format!("open:{}", self.connection_key))?;
        self.open = true;
        Ok(())
    }

    async fn close(&mut self) -> DbResult<()> {
        if !self.open {
            return Ok(());
        }
        self.open = false;
        self.broken = false;
        self.record(format!("close:{}", self.connection_key))
    }

    async fn execute(&mut self, command: &Command) -> DbResult<u64> {
        self.ensure_open()?;
        self.record(format!("exec:{}", command.sql))?;
        self.hold(&command.sql).await;
        Ok(1)
    }

    async fn query(&mut self, command: &Command) -> DbResult<DataTable> {
        self.ensure_open()?;
        self.record(format!("query:{}", command.sql))?;
        self.hold(&command.sql).await;
        Ok(self.response(&command.sql))
    }

    fn fetch<'c>(&'c mut self, command: &'c Command) -> BoxStream<'c, DbResult<Row>> {
        let recorded = self
            .ensure_open()
            .and_then(|_| self.record(format!("query:{}", command.sql)));
        let rows: Vec<DbResult<Row>> = match recorded {
            Ok(()) => self.response(&command.sql).rows.into_iter().map(Ok).collect(),
            Err(e) => vec![Err(e)],
        };
        let delay = lock(&self.shared).delays.get(&command.sql).copied();
        stream::once(async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            stream::iter(rows)
        })
        .flatten()
        .boxed()
    }

    async fn execute_batch(&mut self, sql: &str) -> DbResult<()> {
        self.ensure_open()?;
        self.record(sql.to_string())
    }

    fn mark_broken(&mut self) {
        if self.open {
            self.broken = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_recording_connection_logs_lifecycle() {
        let provider = RecordingProvider::new();
        let mut conn = provider.open("a", true).await.unwrap();
        conn.begin(crate::models::IsolationLevel::Serializable)
            .await
            .unwrap();
        conn.commit().await.unwrap();
        conn.close().await.unwrap();
        assert_eq!(
            provider.events(),
            vec![
                "open:a",
                "BEGIN ISOLATION LEVEL SERIALIZABLE",
                "COMMIT",
                "close:a"
            ]
        );
        assert_eq!(provider.created(), 1);
    }

    #[tokio::test]
    async fn test_break_on_leaves_connection_broken_until_reopened() {
        let provider = RecordingProvider::new();
        provider.break_on("LOST");
        let mut conn = provider.open("a", true).await.unwrap();
        let lost = Command::text(DatabaseType::PostgreSQL, "LOST");
        assert!(matches!(
            conn.execute(&lost).await,
            Err(DbError::Connection { .. })
        ));
        assert_eq!(conn.state(), ConnectionState::Broken);
        assert!(conn.commit().await.is_err());

        conn.open().await.unwrap();
        assert_eq!(conn.state(), ConnectionState::Open);
        assert_eq!(provider.events(), vec!["open:a", "exec:LOST", "open:a"]);
    }

    #[tokio::test]
    async fn test_failures_are_injectable() {
        let provider = RecordingProvider::new();
        provider.fail_open("down");
        assert!(provider.open("down", true).await.is_err());

        provider.fail_statement("COMMIT");
        let mut conn = provider.open("a", true).await.unwrap();
        assert!(conn.commit().await.is_err());
        assert_eq!(provider.events_for("a"), vec!["open:a", "COMMIT"]);
    }
}
