//! Ambient, flow-scoped transactions.
//!
//! A *flow* is a logical chain of async work. [`flow`] establishes one for a
//! future; every [`AmbientTransactionScope`] begun inside it registers in the
//! flow's [`AmbientTransactionRegistry`], and data access deeper in the call
//! chain picks up the shared connections through
//! [`ConnectionResolver`](resolver::ConnectionResolver) without any handle being
//! passed down.
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use ambient_db::ambient::{self, ScopeOption, TransactionOptions};
//! # use ambient_db::db::ConnectionProvider;
//! # async fn run(provider: Arc<dyn ConnectionProvider>) -> ambient_db::error::DbResult<()> {
//! ambient::scoped(provider, ScopeOption::Required, TransactionOptions::default(), ["orders"], || async {
//!     // resolve "orders" anywhere below; commits when this returns Ok
//!     Ok(())
//! })
//! .await
//! # }
//! ```
//!
//! The registry lives only as long as the flow has active scopes. Scopes must
//! be disposed in reverse order of creation.

pub mod registry;
pub mod resolver;
pub mod scope;
pub mod transaction;

pub use registry::{AmbientTransactionRegistry, SharedConnection};
pub use resolver::{ConnectionGuard, ConnectionResolver, ResolvedConnection};
pub use scope::{
    AmbientTransactionFactory, AmbientTransactionScope, DEFAULT_TRANSACTION_TIMEOUT_SECS,
    ScopeHandle, ScopeOption, TransactionOptions,
};
pub use transaction::AmbientTransaction;

use crate::db::ConnectionProvider;
use crate::error::DbResult;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, warn};

/// The flow's registry cell. Cloning shares the cell.
#[derive(Clone, Default)]
pub(crate) struct FlowSlot(Arc<Mutex<Option<Arc<AmbientTransactionRegistry>>>>);

impl FlowSlot {
    fn lock(&self) -> MutexGuard<'_, Option<Arc<AmbientTransactionRegistry>>> {
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn registry(&self) -> Option<Arc<AmbientTransactionRegistry>> {
        self.lock().clone()
    }

    pub(crate) fn get_or_create(&self) -> Arc<AmbientTransactionRegistry> {
        Arc::clone(self.lock().get_or_insert_with(|| {
            debug!("Ambient registry created");
            Arc::new(AmbientTransactionRegistry::new())
        }))
    }

    /// Drop the registry once its last scope is gone.
    pub(crate) fn release_if_empty(&self, registry: &Arc<AmbientTransactionRegistry>) {
        let mut cell = self.lock();
        if cell
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(current, registry) && current.is_empty())
        {
            *cell = None;
            debug!("Ambient registry discarded");
        }
    }
}

tokio::task_local! {
    static FLOW: FlowSlot;
}

/// Run `fut` as a new logical flow with no active scopes.
pub async fn flow<F: Future>(fut: F) -> F::Output {
    FLOW.scope(FlowSlot::default(), fut).await
}

/// True when the current task runs inside a flow.
pub fn in_flow() -> bool {
    FLOW.try_with(|_| ()).is_ok()
}

/// Carry the current flow into a future that will run on another task.
///
/// The spawned task shares the caller's registry, so connections it resolves
/// are the caller's shared connections. Scopes the task begins must be
/// disposed before the caller disposes its own. Outside a flow the future gets
/// a fresh one.
pub fn propagate<F: Future>(fut: F) -> impl Future<Output = F::Output> {
    let slot = current_slot().unwrap_or_default();
    FLOW.scope(slot, fut)
}

pub(crate) fn current_slot() -> Option<FlowSlot> {
    FLOW.try_with(Clone::clone).ok()
}

/// The registry of the current flow, if any scope is active in it.
pub fn current_registry() -> Option<Arc<AmbientTransactionRegistry>> {
    current_slot().and_then(|slot| slot.registry())
}

/// Begin a scope, run `f` inside it, and dispose the scope.
///
/// The scope commits when `f` returns `Ok`. A flow is established first when
/// the caller is not already running in one.
pub async fn scoped<T, I, S, F, Fut>(
    provider: Arc<dyn ConnectionProvider>,
    option: ScopeOption,
    options: TransactionOptions,
    keys: I,
    f: F,
) -> DbResult<T>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
    F: FnOnce() -> Fut,
    Fut: Future<Output = DbResult<T>>,
{
    let keys: Vec<String> = keys.into_iter().map(Into::into).collect();
    if in_flow() {
        run_scoped(provider, option, options, keys, f).await
    } else {
        flow(run_scoped(provider, option, options, keys, f)).await
    }
}

async fn run_scoped<T, F, Fut>(
    provider: Arc<dyn ConnectionProvider>,
    option: ScopeOption,
    options: TransactionOptions,
    keys: Vec<String>,
    f: F,
) -> DbResult<T>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = DbResult<T>>,
{
    let mut scope = AmbientTransactionScope::begin(provider, option, options, keys)?;
    let result = f().await;
    match result {
        Ok(value) => {
            if let Err(e) = scope.commit() {
                scope.dispose().await?;
                return Err(e);
            }
            scope.dispose().await?;
            Ok(value)
        }
        Err(e) => {
            if let Err(dispose_err) = scope.dispose().await {
                warn!(scope_id = %scope.id(), error = %dispose_err, "Failed to dispose scope after error");
            }
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DbError;
    use crate::testing::RecordingProvider;

    #[tokio::test]
    async fn test_flow_is_task_local() {
        assert!(!in_flow());
        flow(async {
            assert!(in_flow());
            assert!(current_registry().is_none());
        })
        .await;
        assert!(!in_flow());
    }

    #[tokio::test]
    async fn test_registry_discarded_after_last_scope() {
        let provider: Arc<dyn ConnectionProvider> = Arc::new(RecordingProvider::new());
        flow(async move {
            let mut scope = AmbientTransactionScope::new(provider, ["a"]).unwrap();
            assert_eq!(current_registry().map(|r| r.depth()), Some(1));
            scope.dispose().await.unwrap();
            assert!(current_registry().is_none());
        })
        .await;
    }

    #[tokio::test]
    async fn test_scoped_commits_on_ok() {
        let provider = RecordingProvider::new();
        let shared: Arc<dyn ConnectionProvider> = Arc::new(provider.clone());
        let value = scoped(
            shared,
            ScopeOption::Required,
            TransactionOptions::default(),
            ["a"],
            || async {
                let scope = AmbientTransactionScope::current().ok_or(DbError::NoAmbientFlow)?;
                scope.get_connection("a", true).await?;
                Ok(7)
            },
        )
        .await
        .unwrap();
        assert_eq!(value, 7);
        assert_eq!(
            provider.events(),
            vec!["open:a", "BEGIN ISOLATION LEVEL SERIALIZABLE", "COMMIT", "close:a"]
        );
    }

    #[tokio::test]
    async fn test_scoped_rolls_back_on_err() {
        let provider = RecordingProvider::new();
        let shared: Arc<dyn ConnectionProvider> = Arc::new(provider.clone());
        let err = scoped(
            shared,
            ScopeOption::Required,
            TransactionOptions::default(),
            ["a"],
            || async {
                let scope = AmbientTransactionScope::current().ok_or(DbError::NoAmbientFlow)?;
                scope.get_connection("a", true).await?;
                Err::<(), _>(DbError::invalid_input("boom"))
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, DbError::InvalidInput { .. }));
        assert_eq!(
            provider.events(),
            vec!["open:a", "BEGIN ISOLATION LEVEL SERIALIZABLE", "ROLLBACK", "close:a"]
        );
    }
}
