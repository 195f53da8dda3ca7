//! Integration tests for ambient scopes, shared connections and resolution.
//!
//! These run against recording connections, so every test checks the exact
//! sequence of opens, transaction control statements and closes.

use ambient_db::ambient::{
    self, AmbientTransactionScope, ConnectionResolver, ScopeOption, TransactionOptions,
};
use ambient_db::db::{
    CommandFactory, ConnectionProvider, DataConnector, FixedCommandTimeout, PostgresBackend,
};
use ambient_db::error::DbError;
use ambient_db::models::IsolationLevel;
use ambient_db::testing::RecordingProvider;
use std::sync::Arc;
use std::time::Duration;
use tokio_test::{assert_err, assert_ok};

const BEGIN: &str = "BEGIN ISOLATION LEVEL SERIALIZABLE";

fn recording() -> (Arc<dyn ConnectionProvider>, RecordingProvider) {
    let recording = RecordingProvider::new();
    (Arc::new(recording.clone()), recording)
}

fn connector(provider: &Arc<dyn ConnectionProvider>, key: &str) -> DataConnector<PostgresBackend> {
    DataConnector::new(
        PostgresBackend,
        Arc::clone(provider),
        CommandFactory::default(),
        key,
    )
}

#[tokio::test]
async fn test_nested_scopes_share_one_connection() {
    let (provider, recording) = recording();
    ambient::flow(async move {
        let mut outer = assert_ok!(AmbientTransactionScope::new(Arc::clone(&provider), ["a", "b"]));
        let registry = ambient::current_registry().unwrap();
        assert_eq!(registry.reference_count("a"), 1);
        assert_eq!(registry.reference_count("b"), 1);

        let mut inner = assert_ok!(AmbientTransactionScope::new(Arc::clone(&provider), ["a"]));
        assert_eq!(registry.reference_count("a"), 2);
        assert_eq!(registry.reference_count("b"), 1);

        let from_outer = assert_ok!(outer.get_connection("a", true).await);
        let from_inner = assert_ok!(inner.get_connection("a", true).await);
        assert!(Arc::ptr_eq(&from_outer, &from_inner));

        assert_ok!(inner.commit());
        assert_ok!(inner.dispose().await);
        assert_eq!(registry.reference_count("a"), 1);
        assert!(from_outer.state().await.is_open());

        assert_ok!(outer.commit());
        assert_ok!(outer.dispose().await);
        assert_eq!(registry.reference_count("a"), 0);
        assert!(ambient::current_registry().is_none());
    })
    .await;

    assert_eq!(recording.events(), vec!["open:a", BEGIN, "COMMIT", "close:a"]);
    assert_eq!(recording.created(), 1);
}

#[tokio::test]
async fn test_out_of_order_dispose_is_rejected() {
    let (provider, recording) = recording();
    ambient::flow(async move {
        let mut outer = AmbientTransactionScope::new(Arc::clone(&provider), ["a"]).unwrap();
        let mut inner = AmbientTransactionScope::new(Arc::clone(&provider), ["a"]).unwrap();

        let err = assert_err!(outer.dispose().await);
        assert!(matches!(err, DbError::OrderingViolation { .. }));
        assert!(!outer.is_disposed());
        assert_eq!(ambient::current_registry().unwrap().depth(), 2);

        inner.commit().unwrap();
        assert_ok!(inner.dispose().await);
        assert_ok!(outer.dispose().await);
    })
    .await;
    assert!(recording.events().is_empty());
}

#[tokio::test]
async fn test_undeclared_key_is_refused() {
    let (provider, recording) = recording();
    let resolver = ConnectionResolver::new(Arc::clone(&provider));
    ambient::flow(async move {
        let mut scope = AmbientTransactionScope::new(provider, ["a"]).unwrap();
        let err = assert_err!(scope.get_connection("b", true).await);
        assert!(matches!(err, DbError::NotDeclared { .. }));
        let err = assert_err!(resolver.resolve("b", true).await);
        assert!(matches!(err, DbError::NotDeclared { .. }));
        assert_ok!(scope.dispose().await);
    })
    .await;
    assert_eq!(recording.created(), 0);
}

#[tokio::test]
async fn test_connection_is_opened_once_per_scope() {
    let (provider, recording) = recording();
    let resolver = ConnectionResolver::new(Arc::clone(&provider));
    ambient::flow(async move {
        let mut scope = AmbientTransactionScope::new(provider, ["a"]).unwrap();
        let registry = ambient::current_registry().unwrap();
        assert!(registry.connection("a").is_none());

        for _ in 0..3 {
            let mut resolved = resolver.resolve("a", true).await.unwrap();
            assert!(resolved.is_shared());
            resolved.dispose().await.unwrap();
        }
        assert!(registry.connection("a").is_some());

        scope.commit().unwrap();
        scope.dispose().await.unwrap();
    })
    .await;
    assert_eq!(recording.created(), 1);
    assert_eq!(recording.events(), vec!["open:a", BEGIN, "COMMIT", "close:a"]);
}

#[tokio::test]
async fn test_without_scope_every_resolve_is_new() {
    let (provider, recording) = recording();
    let resolver = ConnectionResolver::new(provider);

    let mut first = resolver.resolve("a", true).await.unwrap();
    let mut second = resolver.resolve("a", true).await.unwrap();
    assert!(!first.is_shared());
    assert!(!second.is_shared());
    first.dispose().await.unwrap();
    second.dispose().await.unwrap();

    assert_eq!(recording.created(), 2);
    assert_eq!(
        recording.events(),
        vec!["open:a", "open:a", "close:a", "close:a"]
    );
}

#[tokio::test]
async fn test_inner_scope_without_commit_dooms_the_transaction() {
    let (provider, recording) = recording();
    let orders = connector(&provider, "a");
    ambient::flow(async move {
        let mut outer = AmbientTransactionScope::new(Arc::clone(&provider), ["a"]).unwrap();
        let mut inner = AmbientTransactionScope::new(Arc::clone(&provider), ["a"]).unwrap();
        assert_eq!(inner.transaction_id(), outer.transaction_id());

        assert_ok!(orders.execute_non_query("UPDATE t SET x = 1", &[]).await);
        assert_ok!(inner.dispose().await);

        // further work under the doomed transaction fails
        let err = assert_err!(orders.execute_non_query("UPDATE t SET x = 2", &[]).await);
        assert!(err.is_transaction_aborted());

        outer.commit().unwrap();
        assert_ok!(outer.dispose().await);
    })
    .await;

    assert_eq!(
        recording.events(),
        vec![
            "open:a",
            BEGIN,
            "exec:UPDATE t SET x = 1",
            "ROLLBACK",
            "close:a"
        ]
    );
}

#[tokio::test]
async fn test_scope_timeout_aborts_transaction() {
    let (provider, recording) = recording();
    ambient::flow(async move {
        let mut scope = AmbientTransactionScope::begin(
            provider,
            ScopeOption::Required,
            TransactionOptions::default().with_timeout(Some(Duration::from_millis(20))),
            ["a"],
        )
        .unwrap();
        assert_ok!(scope.get_connection("a", true).await);

        tokio::time::sleep(Duration::from_millis(40)).await;

        let err = assert_err!(scope.get_connection("a", true).await);
        assert!(matches!(err, DbError::TransactionAborted { .. }));
        scope.commit().unwrap();
        assert_ok!(scope.dispose().await);
    })
    .await;

    assert_eq!(
        recording.events(),
        vec!["open:a", BEGIN, "ROLLBACK", "close:a"]
    );
}

#[tokio::test]
async fn test_requires_new_runs_its_own_transaction() {
    let (provider, recording) = recording();
    ambient::flow(async move {
        let mut outer = AmbientTransactionScope::new(Arc::clone(&provider), ["a"]).unwrap();
        outer.get_connection("a", true).await.unwrap();

        let mut inner = AmbientTransactionScope::begin(
            Arc::clone(&provider),
            ScopeOption::RequiresNew,
            TransactionOptions::default(),
            ["a", "b"],
        )
        .unwrap();
        assert!(inner.owns_transaction());
        assert_ne!(inner.transaction_id(), outer.transaction_id());

        let b = inner.get_connection("b", true).await.unwrap();
        assert_eq!(b.enlisted_in().await, inner.transaction_id());
        // already enlisted in the outer transaction, so it stays there
        let a = inner.get_connection("a", true).await.unwrap();
        assert_eq!(a.enlisted_in().await, outer.transaction_id());

        inner.commit().unwrap();
        inner.dispose().await.unwrap();

        // the outer transaction never commits
        outer.dispose().await.unwrap();
    })
    .await;

    assert_eq!(
        recording.events_for("a"),
        vec!["open:a", BEGIN, "ROLLBACK", "close:a"]
    );
    assert_eq!(
        recording.events_for("b"),
        vec!["open:b", BEGIN, "COMMIT", "close:b"]
    );
}

#[tokio::test]
async fn test_suppress_runs_outside_the_transaction() {
    let (provider, recording) = recording();
    ambient::flow(async move {
        let mut outer = AmbientTransactionScope::new(Arc::clone(&provider), ["a"]).unwrap();
        let mut suppressed = AmbientTransactionScope::begin(
            Arc::clone(&provider),
            ScopeOption::Suppress,
            TransactionOptions::default(),
            ["b"],
        )
        .unwrap();
        assert_eq!(suppressed.transaction_id(), None);

        let b = suppressed.get_connection("b", true).await.unwrap();
        assert_eq!(b.enlisted_in().await, None);
        suppressed.dispose().await.unwrap();

        outer.commit().unwrap();
        outer.dispose().await.unwrap();
    })
    .await;

    assert_eq!(recording.events_for("b"), vec!["open:b", "close:b"]);
    assert!(recording.events_for("a").is_empty());
}

#[tokio::test]
async fn test_isolation_level_reaches_begin() {
    let (provider, recording) = recording();
    ambient::flow(async move {
        let mut scope = AmbientTransactionScope::begin(
            provider,
            ScopeOption::Required,
            TransactionOptions::new(IsolationLevel::ReadCommitted, None),
            ["a"],
        )
        .unwrap();
        scope.get_connection("a", true).await.unwrap();
        scope.commit().unwrap();
        scope.dispose().await.unwrap();
    })
    .await;

    assert_eq!(
        recording.events(),
        vec![
            "open:a",
            "BEGIN ISOLATION LEVEL READ COMMITTED",
            "COMMIT",
            "close:a"
        ]
    );
}

#[tokio::test]
async fn test_lazy_resolve_enlists_when_opened() {
    let (provider, recording) = recording();
    ambient::flow(async move {
        let mut scope = AmbientTransactionScope::new(provider, ["a"]).unwrap();
        let closed = scope.get_connection("a", false).await.unwrap();
        assert!(!closed.state().await.is_open());
        assert_eq!(closed.enlisted_in().await, None);

        let opened = scope.get_connection("a", true).await.unwrap();
        assert!(Arc::ptr_eq(&closed, &opened));
        assert_eq!(opened.enlisted_in().await, scope.transaction_id());

        scope.commit().unwrap();
        scope.dispose().await.unwrap();
    })
    .await;

    assert_eq!(recording.events(), vec!["open:a", BEGIN, "COMMIT", "close:a"]);
}

#[tokio::test]
async fn test_propagated_task_shares_connections() {
    let (provider, recording) = recording();
    let resolver = ConnectionResolver::new(Arc::clone(&provider));
    ambient::flow(async move {
        let mut scope = AmbientTransactionScope::new(provider, ["a"]).unwrap();
        let ours = scope.get_connection("a", true).await.unwrap();

        let task = tokio::spawn(ambient::propagate(async move {
            let mut resolved = resolver.resolve("a", true).await?;
            let shared = resolved.shared_connection().cloned();
            resolved.dispose().await?;
            Ok::<_, DbError>(shared)
        }));
        let theirs = task.await.unwrap().unwrap().unwrap();
        assert!(Arc::ptr_eq(&ours, &theirs));

        scope.commit().unwrap();
        scope.dispose().await.unwrap();
    })
    .await;

    assert_eq!(recording.created(), 1);
}

#[tokio::test]
async fn test_dropped_scope_rolls_back_in_background() {
    let (provider, recording) = recording();
    ambient::flow(async move {
        let scope = AmbientTransactionScope::new(provider, ["a"]).unwrap();
        scope.get_connection("a", true).await.unwrap();
        drop(scope);
        assert!(ambient::current_registry().is_none());

        tokio::time::sleep(Duration::from_millis(20)).await;
    })
    .await;

    assert_eq!(
        recording.events(),
        vec!["open:a", BEGIN, "ROLLBACK", "close:a"]
    );
}

#[tokio::test]
async fn test_scope_requires_a_flow() {
    let (provider, recording) = recording();
    assert!(!ambient::in_flow());
    let err = assert_err!(AmbientTransactionScope::new(Arc::clone(&provider), ["a"]));
    assert!(matches!(err, DbError::NoAmbientFlow));

    // `scoped` establishes its own flow
    let orders = connector(&provider, "a");
    let inserted = ambient::scoped(
        provider,
        ScopeOption::Required,
        TransactionOptions::default(),
        ["a"],
        || async {
            let first = orders.execute_non_query("INSERT INTO t VALUES (1)", &[]).await?;
            let second = orders.execute_non_query("INSERT INTO t VALUES (2)", &[]).await?;
            Ok(first + second)
        },
    )
    .await;
    assert_eq!(assert_ok!(inserted), 2);
    assert_eq!(
        recording.events(),
        vec![
            "open:a",
            BEGIN,
            "exec:INSERT INTO t VALUES (1)",
            "exec:INSERT INTO t VALUES (2)",
            "COMMIT",
            "close:a"
        ]
    );
}

#[tokio::test]
async fn test_failed_commit_is_reported_once() {
    let (provider, recording) = recording();
    recording.fail_statement("COMMIT");
    ambient::flow(async move {
        let mut scope = AmbientTransactionScope::new(provider, ["a"]).unwrap();
        scope.get_connection("a", true).await.unwrap();
        scope.commit().unwrap();
        let err = assert_err!(scope.dispose().await);
        assert!(matches!(err, DbError::Database { .. }));
        assert_ok!(scope.dispose().await);
    })
    .await;

    assert_eq!(
        recording.events(),
        vec!["open:a", BEGIN, "COMMIT", "close:a"]
    );
}

#[tokio::test]
async fn test_broken_session_aborts_the_transaction() {
    let (provider, recording) = recording();
    recording.break_on("LOST");
    let orders = connector(&provider, "a");
    ambient::flow(async move {
        let mut scope = AmbientTransactionScope::new(provider, ["a"]).unwrap();
        assert_ok!(orders.execute_non_query("INSERT INTO t VALUES (1)", &[]).await);
        let err = assert_err!(orders.execute_non_query("LOST", &[]).await);
        assert!(matches!(err, DbError::Connection { .. }));

        // the session is not silently replaced inside the transaction
        let err = assert_err!(orders.execute_non_query("INSERT INTO t VALUES (2)", &[]).await);
        assert!(err.is_transaction_aborted());

        assert_ok!(scope.commit());
        assert_ok!(scope.dispose().await);
    })
    .await;

    assert_eq!(
        recording.events(),
        vec![
            "open:a",
            BEGIN,
            "exec:INSERT INTO t VALUES (1)",
            "exec:LOST",
            "close:a"
        ]
    );
}

#[tokio::test]
async fn test_suppressed_scope_replaces_a_broken_session() {
    let (provider, recording) = recording();
    recording.break_on("LOST");
    let orders = connector(&provider, "a");
    ambient::flow(async move {
        let mut outer = AmbientTransactionScope::new(Arc::clone(&provider), ["a"]).unwrap();
        assert_err!(orders.execute_non_query("LOST", &[]).await);

        let mut suppressed = AmbientTransactionScope::begin(
            Arc::clone(&provider),
            ScopeOption::Suppress,
            TransactionOptions::default(),
            ["a"],
        )
        .unwrap();
        let a = assert_ok!(suppressed.get_connection("a", true).await);
        assert!(a.state().await.is_open());
        assert_eq!(a.enlisted_in().await, None);
        assert_ok!(suppressed.dispose().await);

        // the transaction that lost its session cannot commit
        assert!(assert_err!(outer.get_connection("a", true).await).is_transaction_aborted());
        assert_ok!(outer.commit());
        assert_ok!(outer.dispose().await);
    })
    .await;

    assert_eq!(
        recording.events(),
        vec!["open:a", BEGIN, "exec:LOST", "open:a", "close:a"]
    );
}

#[tokio::test(start_paused = true)]
async fn test_timed_out_command_rolls_the_scope_back() {
    let (provider, recording) = recording();
    recording.delay_statement("UPDATE t SET x = 1", Duration::from_secs(5));
    let orders = DataConnector::new(
        PostgresBackend,
        Arc::clone(&provider),
        CommandFactory::new(Arc::new(FixedCommandTimeout(Duration::from_secs(1)))),
        "a",
    );
    ambient::flow(async move {
        let mut scope = AmbientTransactionScope::new(provider, ["a"]).unwrap();
        let err = assert_err!(orders.execute_non_query("UPDATE t SET x = 1", &[]).await);
        assert!(matches!(err, DbError::Timeout { elapsed_ms: 1000, .. }));

        // the caller commits anyway; the statement may still have reached the server
        assert_ok!(scope.commit());
        assert_ok!(scope.dispose().await);
    })
    .await;

    let events = recording.events();
    assert!(!events.iter().any(|e| e == "COMMIT"));
    assert_eq!(events, vec!["open:a", BEGIN, "exec:UPDATE t SET x = 1", "close:a"]);
}
