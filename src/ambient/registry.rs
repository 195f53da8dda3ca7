//! Flow-local registry of active scopes and the connections they share.
//!
//! The registry keeps a stack of active scope frames and a map from connection
//! key to a reference-counted entry. A key is present iff at least one active
//! scope declared it; its count is the number of such scopes. The physical
//! connection behind an entry is created and opened lazily on first resolve.

use crate::ambient::transaction::AmbientTransaction;
use crate::db::{Connection, ConnectionProvider};
use crate::error::{DbError, DbResult};
use crate::models::ConnectionState;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, warn};
use uuid::Uuid;

/// A connection shared by every scope that declared its key.
///
/// The session sits behind an async mutex so concurrent resolves open it once
/// and commands on it are serialized.
pub struct SharedConnection {
    key: String,
    slot: AsyncMutex<SharedSlot>,
    retired: AtomicBool,
}

pub(crate) struct SharedSlot {
    pub(crate) connection: Box<dyn Connection>,
    /// Transaction the session currently runs in.
    pub(crate) enlisted: Option<Uuid>,
    pub(crate) owner: Weak<AmbientTransaction>,
}

impl SharedSlot {
    /// Clear the enlistment, returning the transaction it pointed at.
    pub(crate) fn unenlist(&mut self) -> Option<Uuid> {
        self.owner = Weak::new();
        self.enlisted.take()
    }
}

impl SharedConnection {
    pub(crate) fn new(key: impl Into<String>, connection: Box<dyn Connection>) -> Self {
        Self {
            key: key.into(),
            slot: AsyncMutex::new(SharedSlot {
                connection,
                enlisted: None,
                owner: Weak::new(),
            }),
            retired: AtomicBool::new(false),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub(crate) async fn lock(&self) -> tokio::sync::MutexGuard<'_, SharedSlot> {
        self.slot.lock().await
    }

    pub async fn state(&self) -> ConnectionState {
        self.slot.lock().await.connection.state()
    }

    /// Id of the ambient transaction the session is enlisted in.
    pub async fn enlisted_in(&self) -> Option<Uuid> {
        self.slot.lock().await.enlisted
    }

    /// Released by the registry while still enlisted; the transaction closes it.
    pub(crate) fn is_retired(&self) -> bool {
        self.retired.load(Ordering::SeqCst)
    }

    /// Close now, or hand the close to the live transaction the session is
    /// enlisted in. Close failures are logged.
    pub(crate) async fn release(&self) {
        let mut slot = self.slot.lock().await;
        if let Some(transaction_id) = slot.enlisted {
            debug!(
                connection_key = %self.key,
                transaction_id = %transaction_id,
                "Connection released while enlisted; closing after the transaction ends"
            );
            self.retired.store(true, Ordering::SeqCst);
            return;
        }
        if let Err(e) = slot.connection.close().await {
            warn!(connection_key = %self.key, error = %e, "Failed to close connection");
        } else {
            debug!(connection_key = %self.key, "Shared connection closed");
        }
    }
}

impl std::fmt::Debug for SharedConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedConnection")
            .field("key", &self.key)
            .field("retired", &self.is_retired())
            .finish_non_exhaustive()
    }
}

/// One active scope as seen by the registry.
pub(crate) struct ScopeFrame {
    pub(crate) id: Uuid,
    pub(crate) keys: Vec<String>,
    pub(crate) provider: Arc<dyn ConnectionProvider>,
    pub(crate) transaction: Option<Arc<AmbientTransaction>>,
}

struct ConnectionEntry {
    ref_count: usize,
    provider: Arc<dyn ConnectionProvider>,
    connection: Option<Arc<SharedConnection>>,
}

#[derive(Default)]
struct RegistryState {
    stack: Vec<Arc<ScopeFrame>>,
    connections: HashMap<String, ConnectionEntry>,
}

/// Stack of active scopes plus the reference-counted connection map of one flow.
#[derive(Default)]
pub struct AmbientTransactionRegistry {
    state: Mutex<RegistryState>,
}

impl AmbientTransactionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        // the state is consistent between statements, so a poisoned lock is usable
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Count the frame's keys in and make it the innermost scope. No I/O.
    pub(crate) fn push(&self, frame: Arc<ScopeFrame>) {
        let mut state = self.lock();
        for key in &frame.keys {
            let entry = state
                .connections
                .entry(key.clone())
                .or_insert_with(|| ConnectionEntry {
                    ref_count: 0,
                    provider: Arc::clone(&frame.provider),
                    connection: None,
                });
            entry.ref_count += 1;
        }
        state.stack.push(frame);
        debug!(depth = state.stack.len(), "Ambient scope pushed");
    }

    /// Remove the innermost scope, which must be `scope_id`.
    ///
    /// Returns the connections whose last declaring scope this was; the caller
    /// releases them. On an ordering violation nothing changes.
    pub(crate) fn pop(&self, scope_id: Uuid) -> DbResult<Vec<Arc<SharedConnection>>> {
        let mut state = self.lock();
        let frame = match state.stack.last() {
            Some(top) if top.id == scope_id => Arc::clone(top),
            Some(top) => {
                return Err(DbError::ordering_violation(
                    scope_id.to_string(),
                    top.id.to_string(),
                ));
            }
            None => {
                return Err(DbError::ordering_violation(scope_id.to_string(), "none"));
            }
        };
        state.stack.pop();

        let mut released = Vec::new();
        for key in &frame.keys {
            let remove = match state.connections.get_mut(key) {
                Some(entry) => {
                    entry.ref_count -= 1;
                    entry.ref_count == 0
                }
                None => false,
            };
            if remove {
                if let Some(connection) = state
                    .connections
                    .remove(key)
                    .and_then(|entry| entry.connection)
                {
                    released.push(connection);
                }
            }
        }
        debug!(
            depth = state.stack.len(),
            released = released.len(),
            "Ambient scope popped"
        );
        Ok(released)
    }

    /// The shared connection for `key`, created on first use and opened when
    /// `open_if_closed` is set.
    ///
    /// Under an ambient transaction an open session that is not yet enlisted
    /// anywhere is enlisted now by beginning a transaction on it.
    ///
    /// A session that broke while enlisted is never reopened inside its
    /// transaction: the transaction is aborted and, when it is the current
    /// one, resolution fails with [`DbError::TransactionAborted`].
    pub async fn resolve(
        &self,
        key: &str,
        open_if_closed: bool,
    ) -> DbResult<Arc<SharedConnection>> {
        let (shared, transaction) = {
            let mut state = self.lock();
            let transaction = state.stack.last().and_then(|f| f.transaction.clone());
            let entry = state
                .connections
                .get_mut(key)
                .ok_or_else(|| DbError::not_declared(key))?;
            let shared = match &entry.connection {
                Some(connection) => Arc::clone(connection),
                None => {
                    let connection = Arc::new(SharedConnection::new(
                        key,
                        entry.provider.create(key)?,
                    ));
                    entry.connection = Some(Arc::clone(&connection));
                    connection
                }
            };
            (shared, transaction)
        };

        if let Some(tx) = &transaction {
            tx.ensure_active()?;
        }

        let mut slot = shared.lock().await;
        if slot.connection.state() == ConnectionState::Broken {
            let owner = slot.owner.upgrade();
            if let Some(transaction_id) = slot.unenlist() {
                let reason = format!("connection '{key}' broke during the transaction");
                warn!(
                    connection_key = %key,
                    transaction_id = %transaction_id,
                    "Enlisted connection broke"
                );
                if let Some(owner) = owner {
                    owner.abort(reason.clone());
                }
                if let Some(tx) = transaction.as_ref().filter(|tx| tx.id() == transaction_id) {
                    return Err(tx.ensure_active().err().unwrap_or_else(|| {
                        DbError::transaction_aborted(transaction_id.to_string(), reason)
                    }));
                }
            }
        }
        if open_if_closed && !slot.connection.state().is_open() {
            slot.connection.open().await?;
        }
        if let Some(tx) = transaction {
            if slot.enlisted.is_none() && slot.connection.state().is_open() {
                slot.connection.begin(tx.isolation_level()).await?;
                slot.enlisted = Some(tx.id());
                slot.owner = Arc::downgrade(&tx);
                tx.enlist(Arc::clone(&shared));
                debug!(
                    connection_key = %key,
                    transaction_id = %tx.id(),
                    "Connection enlisted"
                );
            }
        }
        drop(slot);
        Ok(shared)
    }

    /// Innermost active scope.
    pub(crate) fn current_scope(&self) -> Option<Arc<ScopeFrame>> {
        self.lock().stack.last().cloned()
    }

    pub(crate) fn current_transaction(&self) -> Option<Arc<AmbientTransaction>> {
        self.lock()
            .stack
            .last()
            .and_then(|frame| frame.transaction.clone())
    }

    /// Number of active scopes that declared `key`; zero when absent.
    pub fn reference_count(&self, key: &str) -> usize {
        self.lock()
            .connections
            .get(key)
            .map_or(0, |entry| entry.ref_count)
    }

    /// The shared connection for `key` if it has been created.
    pub fn connection(&self, key: &str) -> Option<Arc<SharedConnection>> {
        self.lock()
            .connections
            .get(key)
            .and_then(|entry| entry.connection.clone())
    }

    pub fn depth(&self) -> usize {
        self.lock().stack.len()
    }

    pub fn is_empty(&self) -> bool {
        let state = self.lock();
        state.stack.is_empty() && state.connections.is_empty()
    }
}

impl std::fmt::Debug for AmbientTransactionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("AmbientTransactionRegistry")
            .field("depth", &state.stack.len())
            .field("keys", &state.connections.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingProvider;

    fn frame(provider: &RecordingProvider, keys: &[&str]) -> Arc<ScopeFrame> {
        Arc::new(ScopeFrame {
            id: Uuid::new_v4(),
            keys: keys.iter().map(|k| k.to_string()).collect(),
            provider: Arc::new(provider.clone()),
            transaction: None,
        })
    }

    #[tokio::test]
    async fn test_reference_counts_follow_scopes() {
        let provider = RecordingProvider::new();
        let registry = AmbientTransactionRegistry::new();

        let outer = frame(&provider, &["a", "b"]);
        registry.push(Arc::clone(&outer));
        let inner = frame(&provider, &["b"]);
        registry.push(Arc::clone(&inner));
        assert_eq!(registry.reference_count("a"), 1);
        assert_eq!(registry.reference_count("b"), 2);

        let first = registry.resolve("b", true).await.unwrap();
        assert!(registry.pop(inner.id).unwrap().is_empty());
        assert_eq!(registry.reference_count("b"), 1);
        let again = registry.resolve("b", true).await.unwrap();
        assert!(Arc::ptr_eq(&first, &again));

        let released = registry.pop(outer.id).unwrap();
        assert_eq!(released.len(), 1);
        assert_eq!(registry.reference_count("b"), 0);
        assert!(registry.is_empty());
        assert_eq!(provider.events(), vec!["open:b"]);
    }

    #[tokio::test]
    async fn test_pop_out_of_order_changes_nothing() {
        let provider = RecordingProvider::new();
        let registry = AmbientTransactionRegistry::new();
        let outer = frame(&provider, &["a"]);
        let inner = frame(&provider, &["a"]);
        registry.push(Arc::clone(&outer));
        registry.push(Arc::clone(&inner));

        let err = registry.pop(outer.id).unwrap_err();
        assert!(matches!(err, DbError::OrderingViolation { .. }));
        assert_eq!(registry.depth(), 2);
        assert_eq!(registry.reference_count("a"), 2);
    }

    #[tokio::test]
    async fn test_resolve_undeclared_key() {
        let provider = RecordingProvider::new();
        let registry = AmbientTransactionRegistry::new();
        registry.push(frame(&provider, &["a"]));
        let err = registry.resolve("z", true).await.unwrap_err();
        assert!(matches!(err, DbError::NotDeclared { .. }));
    }

    #[tokio::test]
    async fn test_lazy_creation_and_single_open() {
        let provider = RecordingProvider::new();
        let registry = AmbientTransactionRegistry::new();
        registry.push(frame(&provider, &["a"]));
        assert_eq!(provider.created(), 0);

        let unopened = registry.resolve("a", false).await.unwrap();
        assert_eq!(unopened.state().await, ConnectionState::Closed);
        registry.resolve("a", true).await.unwrap();
        registry.resolve("a", true).await.unwrap();
        assert_eq!(provider.created(), 1);
        assert_eq!(provider.events(), vec!["open:a"]);
    }

    #[tokio::test]
    async fn test_release_closes_exactly_once() {
        let provider = RecordingProvider::new();
        let registry = AmbientTransactionRegistry::new();
        let scope = frame(&provider, &["a"]);
        registry.push(Arc::clone(&scope));
        registry.resolve("a", true).await.unwrap();
        for connection in registry.pop(scope.id).unwrap() {
            connection.release().await;
            connection.release().await;
        }
        assert_eq!(provider.events(), vec!["open:a", "close:a"]);
    }
}
