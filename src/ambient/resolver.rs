//! Connection resolution: ambient when a scope is active, ad hoc otherwise.

use crate::ambient::registry::{SharedConnection, SharedSlot};
use crate::ambient::scope::AmbientTransactionScope;
use crate::db::{Connection, ConnectionProvider};
use crate::error::{DbError, DbResult};
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use tracing::debug;

/// Finds the connection data access should use for a key.
#[derive(Clone)]
pub struct ConnectionResolver {
    provider: Arc<dyn ConnectionProvider>,
}

impl ConnectionResolver {
    pub fn new(provider: Arc<dyn ConnectionProvider>) -> Self {
        Self { provider }
    }

    pub fn provider(&self) -> &Arc<dyn ConnectionProvider> {
        &self.provider
    }

    /// The innermost scope's shared connection for `key`, or a new connection
    /// owned by the returned handle when no scope is active.
    ///
    /// An active scope that did not declare `key` yields
    /// [`DbError::NotDeclared`].
    pub async fn resolve(&self, key: &str, open_if_closed: bool) -> DbResult<ResolvedConnection> {
        match AmbientTransactionScope::current() {
            Some(scope) => {
                let shared = scope.get_connection(key, open_if_closed).await?;
                Ok(ResolvedConnection::shared(shared))
            }
            None => {
                debug!(connection_key = %key, "No ambient scope; opening an ad-hoc connection");
                let connection = self.provider.open(key, open_if_closed).await?;
                Ok(ResolvedConnection::owned(connection))
            }
        }
    }
}

impl std::fmt::Debug for ConnectionResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionResolver").finish_non_exhaustive()
    }
}

enum Resolved {
    Shared(Arc<SharedConnection>),
    Owned(Box<dyn Connection>),
}

/// Handle returned by [`ConnectionResolver::resolve`].
///
/// Disposing a shared handle does nothing; the declaring scopes own the
/// session. Disposing an owned handle closes it.
pub struct ResolvedConnection {
    inner: Resolved,
    disposed: bool,
}

impl ResolvedConnection {
    pub(crate) fn shared(connection: Arc<SharedConnection>) -> Self {
        Self {
            inner: Resolved::Shared(connection),
            disposed: false,
        }
    }

    pub(crate) fn owned(connection: Box<dyn Connection>) -> Self {
        Self {
            inner: Resolved::Owned(connection),
            disposed: false,
        }
    }

    pub fn is_shared(&self) -> bool {
        matches!(self.inner, Resolved::Shared(_))
    }

    pub fn shared_connection(&self) -> Option<&Arc<SharedConnection>> {
        match &self.inner {
            Resolved::Shared(shared) => Some(shared),
            Resolved::Owned(_) => None,
        }
    }

    /// Exclusive access to the session for the duration of the guard.
    pub async fn lock(&mut self) -> DbResult<ConnectionGuard<'_>> {
        if self.disposed {
            return Err(DbError::disposed("ResolvedConnection"));
        }
        Ok(match &mut self.inner {
            Resolved::Shared(shared) => ConnectionGuard(Guard::Shared(shared.lock().await)),
            Resolved::Owned(connection) => ConnectionGuard(Guard::Owned(connection)),
        })
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    /// Idempotent.
    pub async fn dispose(&mut self) -> DbResult<()> {
        if self.disposed {
            return Ok(());
        }
        self.disposed = true;
        match &mut self.inner {
            Resolved::Shared(_) => Ok(()),
            Resolved::Owned(connection) => connection.close().await,
        }
    }
}

impl Drop for ResolvedConnection {
    fn drop(&mut self) {
        if !self.disposed {
            if let Resolved::Owned(connection) = &self.inner {
                debug!(
                    connection_key = %connection.connection_key(),
                    "Ad-hoc connection dropped without dispose"
                );
            }
        }
    }
}

impl std::fmt::Debug for ResolvedConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedConnection")
            .field("shared", &self.is_shared())
            .field("disposed", &self.disposed)
            .finish()
    }
}

enum Guard<'a> {
    Shared(tokio::sync::MutexGuard<'a, SharedSlot>),
    Owned(&'a mut Box<dyn Connection>),
}

/// Borrowed access to a resolved connection.
pub struct ConnectionGuard<'a>(Guard<'a>);

impl Deref for ConnectionGuard<'_> {
    type Target = dyn Connection;

    fn deref(&self) -> &Self::Target {
        match &self.0 {
            Guard::Shared(slot) => slot.connection.as_ref(),
            Guard::Owned(connection) => connection.as_ref(),
        }
    }
}

impl DerefMut for ConnectionGuard<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        match &mut self.0 {
            Guard::Shared(slot) => slot.connection.as_mut(),
            Guard::Owned(connection) => connection.as_mut(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ambient::flow;
    use crate::models::ConnectionState;
    use crate::testing::RecordingProvider;

    #[tokio::test]
    async fn test_resolve_without_scope_owns_connection() {
        let recording = RecordingProvider::new();
        let resolver = ConnectionResolver::new(Arc::new(recording.clone()));

        let mut first = resolver.resolve("a", true).await.unwrap();
        let mut second = resolver.resolve("a", true).await.unwrap();
        assert!(!first.is_shared());
        assert_eq!(recording.created(), 2);
        assert_eq!(first.lock().await.unwrap().state(), ConnectionState::Open);

        first.dispose().await.unwrap();
        first.dispose().await.unwrap();
        second.dispose().await.unwrap();
        assert!(first.lock().await.is_err());
        assert_eq!(
            recording.events(),
            vec!["open:a", "open:a", "close:a", "close:a"]
        );
    }

    #[tokio::test]
    async fn test_resolve_inside_scope_shares_connection() {
        let recording = RecordingProvider::new();
        let provider: Arc<dyn ConnectionProvider> = Arc::new(recording.clone());
        let resolver = ConnectionResolver::new(Arc::clone(&provider));
        flow(async move {
            let mut scope = AmbientTransactionScope::begin(
                provider,
                crate::ambient::ScopeOption::Suppress,
                Default::default(),
                ["a"],
            )
            .unwrap();

            let mut first = resolver.resolve("a", true).await.unwrap();
            let mut second = resolver.resolve("a", true).await.unwrap();
            assert!(first.is_shared());
            assert!(Arc::ptr_eq(
                first.shared_connection().unwrap(),
                second.shared_connection().unwrap()
            ));
            first.dispose().await.unwrap();
            second.dispose().await.unwrap();
            assert_eq!(recording.events(), vec!["open:a"]);

            let err = resolver.resolve("b", true).await.unwrap_err();
            assert!(matches!(err, DbError::NotDeclared { .. }));

            scope.dispose().await.unwrap();
            assert_eq!(recording.events(), vec!["open:a", "close:a"]);
        })
        .await;
    }
}
