//! Explicit connection contexts.
//!
//! A [`ConnectionContext`] owns exactly one connection and at most one local
//! transaction. Callers pass it down explicitly instead of relying on an
//! ambient scope.

use crate::db::connection::{Connection, ConnectionProvider};
use crate::error::{DbError, DbResult};
use crate::models::{ConnectionState, DatabaseType, IsolationLevel};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// What [`ConnectionContext::dispose`] does with a transaction that was
/// neither committed nor rolled back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransactionDisposeBehavior {
    CommitIfUnfinalized,
    #[default]
    RollbackIfUnfinalized,
    /// Leave it to the server, which rolls back when the session closes.
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Committed,
    RolledBack,
}

#[derive(Debug)]
struct LocalTransaction {
    id: Uuid,
    isolation: IsolationLevel,
    outcome: Option<Outcome>,
}

/// One connection plus an optional local transaction.
pub struct ConnectionContext {
    connection_key: String,
    database_type: DatabaseType,
    connection: Box<dyn Connection>,
    transaction: Option<LocalTransaction>,
    dispose_behavior: TransactionDisposeBehavior,
    disposed: bool,
}

impl ConnectionContext {
    /// Wrap a connection without a transaction.
    pub fn new(connection: Box<dyn Connection>) -> Self {
        Self {
            connection_key: connection.connection_key().to_string(),
            database_type: connection.database_type(),
            connection,
            transaction: None,
            dispose_behavior: TransactionDisposeBehavior::None,
            disposed: false,
        }
    }

    /// Open the connection if needed and begin a local transaction on it.
    pub async fn begin(
        mut connection: Box<dyn Connection>,
        isolation: IsolationLevel,
        dispose_behavior: TransactionDisposeBehavior,
    ) -> DbResult<Self> {
        if !connection.state().is_open() {
            connection.open().await?;
        }
        connection.begin(isolation).await?;

        let id = Uuid::new_v4();
        info!(
            transaction_id = %id,
            connection_key = %connection.connection_key(),
            isolation = %isolation,
            "Transaction started"
        );

        let mut context = Self::new(connection);
        context.transaction = Some(LocalTransaction {
            id,
            isolation,
            outcome: None,
        });
        context.dispose_behavior = dispose_behavior;
        Ok(context)
    }

    pub fn connection_key(&self) -> &str {
        &self.connection_key
    }

    pub fn database_type(&self) -> DatabaseType {
        self.database_type
    }

    pub fn transaction_id(&self) -> Option<Uuid> {
        self.transaction.as_ref().map(|tx| tx.id)
    }

    pub fn isolation_level(&self) -> Option<IsolationLevel> {
        self.transaction.as_ref().map(|tx| tx.isolation)
    }

    pub fn dispose_behavior(&self) -> TransactionDisposeBehavior {
        self.dispose_behavior
    }

    /// True once the transaction has been committed or rolled back.
    pub fn is_finalized(&self) -> bool {
        self.transaction
            .as_ref()
            .is_some_and(|tx| tx.outcome.is_some())
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    fn ensure_not_disposed(&self) -> DbResult<()> {
        if self.disposed {
            Err(DbError::disposed("ConnectionContext"))
        } else {
            Ok(())
        }
    }

    /// The underlying connection, opened on demand.
    ///
    /// A session that broke inside an unfinalized transaction is not
    /// reopened; the transaction's work is gone with it.
    pub async fn connection(&mut self) -> DbResult<&mut dyn Connection> {
        self.ensure_not_disposed()?;
        match self.connection.state() {
            ConnectionState::Open => {}
            ConnectionState::Broken if self.transaction.is_some() && !self.is_finalized() => {
                return Err(self.lost_transaction());
            }
            ConnectionState::Broken | ConnectionState::Closed => self.connection.open().await?,
        }
        Ok(self.connection.as_mut())
    }

    fn lost_transaction(&self) -> DbError {
        let id = self.transaction_id().map(|id| id.to_string()).unwrap_or_default();
        DbError::transaction_aborted(
            id,
            format!("connection '{}' broke during the transaction", self.connection_key),
        )
    }

    /// Fails once the session under the transaction has broken.
    fn ensure_intact(&self) -> DbResult<()> {
        if self.connection.state() == ConnectionState::Broken {
            Err(self.lost_transaction())
        } else {
            Ok(())
        }
    }

    fn unfinalized_transaction(&mut self) -> DbResult<&mut LocalTransaction> {
        let tx = self
            .transaction
            .as_mut()
            .ok_or_else(|| DbError::transaction("Connection context has no transaction"))?;
        match tx.outcome {
            None => Ok(tx),
            Some(Outcome::Committed) => Err(DbError::transaction(format!(
                "Transaction {} has already been committed",
                tx.id
            ))),
            Some(Outcome::RolledBack) => Err(DbError::transaction(format!(
                "Transaction {} has already been rolled back",
                tx.id
            ))),
        }
    }

    pub async fn commit(&mut self) -> DbResult<()> {
        self.ensure_not_disposed()?;
        let id = self.unfinalized_transaction()?.id;
        if let Err(e) = self.ensure_intact() {
            self.mark(Outcome::RolledBack);
            return Err(e);
        }
        self.connection.commit().await?;
        self.mark(Outcome::Committed);
        info!(transaction_id = %id, connection_key = %self.connection_key, "Transaction committed");
        Ok(())
    }

    pub async fn rollback(&mut self) -> DbResult<()> {
        self.ensure_not_disposed()?;
        let id = self.unfinalized_transaction()?.id;
        let result = if self.connection.state() == ConnectionState::Broken {
            // the server discards the work along with the session
            Ok(())
        } else {
            self.connection.rollback().await
        };
        // a failed rollback still ends the transaction
        self.mark(Outcome::RolledBack);
        result?;
        info!(transaction_id = %id, connection_key = %self.connection_key, "Transaction rolled back");
        Ok(())
    }

    fn mark(&mut self, outcome: Outcome) {
        if let Some(tx) = self.transaction.as_mut() {
            tx.outcome = Some(outcome);
        }
    }

    /// Create a savepoint inside the transaction.
    pub async fn save(&mut self, name: &str) -> DbResult<()> {
        self.ensure_not_disposed()?;
        self.unfinalized_transaction()?;
        self.ensure_intact()?;
        self.connection.save(name).await?;
        debug!(connection_key = %self.connection_key, savepoint = %name, "Savepoint created");
        Ok(())
    }

    /// Roll back to a savepoint; the transaction stays open.
    pub async fn rollback_to(&mut self, name: &str) -> DbResult<()> {
        self.ensure_not_disposed()?;
        self.unfinalized_transaction()?;
        self.ensure_intact()?;
        self.connection.rollback_to(name).await?;
        debug!(connection_key = %self.connection_key, savepoint = %name, "Rolled back to savepoint");
        Ok(())
    }

    /// Apply the dispose behavior to an unfinalized transaction, then close.
    ///
    /// The connection is closed even when the implicit commit or rollback fails;
    /// the first error is returned.
    pub async fn dispose(&mut self) -> DbResult<()> {
        self.ensure_not_disposed()?;

        let outcome = if self.transaction.is_some() && !self.is_finalized() {
            match self.dispose_behavior {
                TransactionDisposeBehavior::CommitIfUnfinalized => self.commit().await,
                TransactionDisposeBehavior::RollbackIfUnfinalized => self.rollback().await,
                TransactionDisposeBehavior::None => Ok(()),
            }
        } else {
            Ok(())
        };

        let closed = self.connection.close().await;
        self.disposed = true;
        debug!(connection_key = %self.connection_key, "Connection context disposed");
        outcome.and(closed)
    }
}

impl Drop for ConnectionContext {
    fn drop(&mut self) {
        if !self.disposed {
            warn!(
                connection_key = %self.connection_key,
                transaction_id = ?self.transaction_id(),
                "Connection context dropped without dispose; the session is dropped without a clean close"
            );
        }
    }
}

impl std::fmt::Debug for ConnectionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionContext")
            .field("connection_key", &self.connection_key)
            .field("transaction", &self.transaction)
            .field("dispose_behavior", &self.dispose_behavior)
            .field("disposed", &self.disposed)
            .finish_non_exhaustive()
    }
}

/// Creates [`ConnectionContext`]s from a [`ConnectionProvider`].
#[derive(Clone)]
pub struct ConnectionContextFactory {
    provider: Arc<dyn ConnectionProvider>,
}

impl ConnectionContextFactory {
    pub fn new(provider: Arc<dyn ConnectionProvider>) -> Self {
        Self { provider }
    }

    /// A context without a transaction; the connection opens on first use.
    pub async fn create(&self, connection_key: &str) -> DbResult<ConnectionContext> {
        let connection = self.provider.open(connection_key, false).await?;
        Ok(ConnectionContext::new(connection))
    }

    /// A context with a transaction at the server's default isolation level.
    pub async fn create_with_transaction(
        &self,
        connection_key: &str,
        dispose_behavior: TransactionDisposeBehavior,
    ) -> DbResult<ConnectionContext> {
        self.create_with_isolation(connection_key, IsolationLevel::Unspecified, dispose_behavior)
            .await
    }

    pub async fn create_with_isolation(
        &self,
        connection_key: &str,
        isolation: IsolationLevel,
        dispose_behavior: TransactionDisposeBehavior,
    ) -> DbResult<ConnectionContext> {
        let connection = self.provider.open(connection_key, true).await?;
        ConnectionContext::begin(connection, isolation, dispose_behavior).await
    }
}
