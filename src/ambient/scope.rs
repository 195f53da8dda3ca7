//! Nestable ambient scopes.

use crate::ambient::registry::{AmbientTransactionRegistry, ScopeFrame, SharedConnection};
use crate::ambient::transaction::AmbientTransaction;
use crate::ambient::{FlowSlot, current_registry, current_slot};
use crate::db::ConnectionProvider;
use crate::error::{DbError, DbResult};
use crate::models::IsolationLevel;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};
use uuid::Uuid;

pub const DEFAULT_TRANSACTION_TIMEOUT_SECS: u64 = 60;

/// How a scope relates to the ambient transaction it finds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScopeOption {
    /// Join the innermost transaction, or start one.
    #[default]
    Required,
    /// Always start a new transaction.
    RequiresNew,
    /// Run without a transaction.
    Suppress,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransactionOptions {
    pub isolation_level: IsolationLevel,
    /// `None` or zero disables the timeout.
    pub timeout: Option<Duration>,
}

impl TransactionOptions {
    pub fn new(isolation_level: IsolationLevel, timeout: Option<Duration>) -> Self {
        Self {
            isolation_level,
            timeout,
        }
    }

    pub fn with_isolation(mut self, isolation_level: IsolationLevel) -> Self {
        self.isolation_level = isolation_level;
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }
}

impl Default for TransactionOptions {
    fn default() -> Self {
        Self {
            isolation_level: IsolationLevel::Serializable,
            timeout: Some(Duration::from_secs(DEFAULT_TRANSACTION_TIMEOUT_SECS)),
        }
    }
}

/// A unit of ambient work over a declared set of connection keys.
///
/// Every declared connection is shared with the nested scopes that declare the
/// same key. Call [`dispose`](Self::dispose) when the work is done; dropping an
/// undisposed scope rolls back and closes in the background.
pub struct AmbientTransactionScope {
    id: Uuid,
    option: ScopeOption,
    keys: Vec<String>,
    flow: FlowSlot,
    registry: Arc<AmbientTransactionRegistry>,
    transaction: Option<Arc<AmbientTransaction>>,
    owns_transaction: bool,
    committed: bool,
    disposed: bool,
}

impl AmbientTransactionScope {
    /// A `Required` scope with default transaction options.
    pub fn new<I, S>(provider: Arc<dyn ConnectionProvider>, keys: I) -> DbResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::begin(
            provider,
            ScopeOption::Required,
            TransactionOptions::default(),
            keys,
        )
    }

    /// Register a scope in the current flow. Opens nothing.
    pub fn begin<I, S>(
        provider: Arc<dyn ConnectionProvider>,
        option: ScopeOption,
        options: TransactionOptions,
        keys: I,
    ) -> DbResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut declared: Vec<String> = Vec::new();
        for key in keys {
            let key = key.into();
            if key.is_empty() {
                return Err(DbError::invalid_input("Connection keys cannot be empty"));
            }
            if !declared.contains(&key) {
                declared.push(key);
            }
        }
        if declared.is_empty() {
            return Err(DbError::invalid_input(
                "An ambient scope needs at least one connection key",
            ));
        }

        let flow = current_slot().ok_or(DbError::NoAmbientFlow)?;
        let registry = flow.get_or_create();

        let (transaction, owns_transaction) = match option {
            ScopeOption::Suppress => (None, false),
            ScopeOption::RequiresNew => (Some(start(options)), true),
            ScopeOption::Required => match registry.current_transaction() {
                Some(tx) => {
                    if options.isolation_level != IsolationLevel::Unspecified
                        && options.isolation_level != tx.isolation_level()
                    {
                        flow.release_if_empty(&registry);
                        return Err(DbError::invalid_input(format!(
                            "Scope requests isolation level {} but the ambient transaction uses {}",
                            options.isolation_level,
                            tx.isolation_level()
                        )));
                    }
                    (Some(tx), false)
                }
                None => (Some(start(options)), true),
            },
        };

        let id = Uuid::new_v4();
        registry.push(Arc::new(ScopeFrame {
            id,
            keys: declared.clone(),
            provider,
            transaction: transaction.clone(),
        }));
        debug!(
            scope_id = %id,
            option = ?option,
            transaction_id = ?transaction.as_ref().map(|tx| tx.id()),
            owner = owns_transaction,
            keys = ?declared,
            "Ambient scope created"
        );

        Ok(Self {
            id,
            option,
            keys: declared,
            flow,
            registry,
            transaction,
            owns_transaction,
            committed: false,
            disposed: false,
        })
    }

    /// Innermost active scope of the current flow.
    pub fn current() -> Option<ScopeHandle> {
        let registry = current_registry()?;
        let frame = registry.current_scope()?;
        Some(ScopeHandle { frame, registry })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn option(&self) -> ScopeOption {
        self.option
    }

    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    pub fn transaction_id(&self) -> Option<Uuid> {
        self.transaction.as_ref().map(|tx| tx.id())
    }

    pub fn isolation_level(&self) -> Option<IsolationLevel> {
        self.transaction.as_ref().map(|tx| tx.isolation_level())
    }

    /// True when this scope started its transaction rather than joining one.
    pub fn owns_transaction(&self) -> bool {
        self.owns_transaction
    }

    pub fn is_committed(&self) -> bool {
        self.committed
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    fn ensure_not_disposed(&self) -> DbResult<()> {
        if self.disposed {
            Err(DbError::disposed("AmbientTransactionScope"))
        } else {
            Ok(())
        }
    }

    /// Vote the transaction complete. Nothing is sent until dispose.
    pub fn commit(&mut self) -> DbResult<()> {
        self.ensure_not_disposed()?;
        if self.committed {
            return Err(DbError::transaction(format!(
                "Ambient scope {} has already been committed",
                self.id
            )));
        }
        self.committed = true;
        Ok(())
    }

    pub async fn get_connection(
        &self,
        key: &str,
        open_if_closed: bool,
    ) -> DbResult<Arc<SharedConnection>> {
        self.ensure_not_disposed()?;
        self.registry.resolve(key, open_if_closed).await
    }

    /// Leave the scope: settle the transaction and close the connections no
    /// other active scope declares.
    ///
    /// A second call does nothing. When this scope is not the innermost one
    /// the call fails and the scope stays active.
    pub async fn dispose(&mut self) -> DbResult<()> {
        if self.disposed {
            return Ok(());
        }
        let released = self.registry.pop(self.id)?;
        self.disposed = true;

        let result = self.settle().await;
        for connection in released {
            connection.release().await;
        }
        self.flow.release_if_empty(&self.registry);
        debug!(scope_id = %self.id, committed = self.committed, "Ambient scope disposed");
        result
    }

    async fn settle(&self) -> DbResult<()> {
        let Some(tx) = &self.transaction else {
            return Ok(());
        };
        if self.owns_transaction {
            match tx.finalize(self.committed).await {
                Err(e) if e.is_transaction_aborted() => {
                    warn!(scope_id = %self.id, error = %e, "Ambient transaction rolled back");
                    Ok(())
                }
                other => other,
            }
        } else {
            if !self.committed {
                tx.abort(format!("scope {} was disposed without commit", self.id));
            }
            Ok(())
        }
    }
}

fn start(options: TransactionOptions) -> Arc<AmbientTransaction> {
    Arc::new(AmbientTransaction::new(
        options.isolation_level,
        options.timeout,
    ))
}

impl Drop for AmbientTransactionScope {
    fn drop(&mut self) {
        if self.disposed {
            return;
        }
        warn!(scope_id = %self.id, "Ambient scope dropped without dispose");
        let released = match self.registry.pop(self.id) {
            Ok(released) => released,
            Err(e) => {
                error!(scope_id = %self.id, error = %e, "Undisposed scope left registered");
                return;
            }
        };
        self.disposed = true;
        self.flow.release_if_empty(&self.registry);

        let owned = match &self.transaction {
            Some(tx) if self.owns_transaction => Some(Arc::clone(tx)),
            Some(tx) => {
                tx.abort(format!("scope {} was dropped without dispose", self.id));
                None
            }
            None => None,
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Some(tx) = owned {
                        if let Err(e) = tx.finalize(false).await {
                            warn!(transaction_id = %tx.id(), error = %e, "Rollback after drop failed");
                        }
                    }
                    for connection in released {
                        connection.release().await;
                    }
                });
            }
            Err(_) => {
                warn!(scope_id = %self.id, "No runtime to close connections; sessions are dropped");
            }
        }
    }
}

impl std::fmt::Debug for AmbientTransactionScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AmbientTransactionScope")
            .field("id", &self.id)
            .field("option", &self.option)
            .field("keys", &self.keys)
            .field("transaction_id", &self.transaction_id())
            .field("committed", &self.committed)
            .field("disposed", &self.disposed)
            .finish()
    }
}

/// A view of the innermost scope, for code that did not create it.
#[derive(Clone)]
pub struct ScopeHandle {
    frame: Arc<ScopeFrame>,
    registry: Arc<AmbientTransactionRegistry>,
}

impl ScopeHandle {
    pub fn id(&self) -> Uuid {
        self.frame.id
    }

    pub fn keys(&self) -> &[String] {
        &self.frame.keys
    }

    pub fn declares(&self, key: &str) -> bool {
        self.frame.keys.iter().any(|k| k == key)
    }

    pub fn transaction_id(&self) -> Option<Uuid> {
        self.frame.transaction.as_ref().map(|tx| tx.id())
    }

    pub fn isolation_level(&self) -> Option<IsolationLevel> {
        self.frame
            .transaction
            .as_ref()
            .map(|tx| tx.isolation_level())
    }

    pub fn registry(&self) -> &Arc<AmbientTransactionRegistry> {
        &self.registry
    }

    pub async fn get_connection(
        &self,
        key: &str,
        open_if_closed: bool,
    ) -> DbResult<Arc<SharedConnection>> {
        self.registry.resolve(key, open_if_closed).await
    }
}

impl std::fmt::Debug for ScopeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScopeHandle")
            .field("id", &self.frame.id)
            .field("keys", &self.frame.keys)
            .finish_non_exhaustive()
    }
}

/// Creates scopes over one provider with preset transaction options.
#[derive(Clone)]
pub struct AmbientTransactionFactory {
    provider: Arc<dyn ConnectionProvider>,
    options: TransactionOptions,
}

impl AmbientTransactionFactory {
    pub fn new(provider: Arc<dyn ConnectionProvider>) -> Self {
        Self {
            provider,
            options: TransactionOptions::default(),
        }
    }

    pub fn with_options(mut self, options: TransactionOptions) -> Self {
        self.options = options;
        self
    }

    pub fn options(&self) -> TransactionOptions {
        self.options
    }

    /// A `Required` scope.
    pub fn create<I, S>(&self, keys: I) -> DbResult<AmbientTransactionScope>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.create_with_option(ScopeOption::Required, keys)
    }

    pub fn create_with_option<I, S>(
        &self,
        option: ScopeOption,
        keys: I,
    ) -> DbResult<AmbientTransactionScope>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        AmbientTransactionScope::begin(Arc::clone(&self.provider), option, self.options, keys)
    }

    pub fn create_with_options<I, S>(
        &self,
        option: ScopeOption,
        options: TransactionOptions,
        keys: I,
    ) -> DbResult<AmbientTransactionScope>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        AmbientTransactionScope::begin(Arc::clone(&self.provider), option, options, keys)
    }
}

impl std::fmt::Debug for AmbientTransactionFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AmbientTransactionFactory")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}
