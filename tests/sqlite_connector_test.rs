//! Integration tests for the data connector against a real SQLite file.

use ambient_db::ambient::{self, AmbientTransactionScope, ScopeOption, TransactionOptions};
use ambient_db::db::{
    CommandFactory, ConfiguredConnectionStrings, ConnectionContextFactory, ConnectionProvider,
    DataConnector, SqlConnectionProvider, SqliteBackend, TransactionDisposeBehavior,
};
use ambient_db::error::DbError;
use ambient_db::models::IsolationLevel;
use std::sync::Arc;
use tempfile::TempDir;

const KEY: &str = "main";

struct Fixture {
    _dir: TempDir,
    provider: Arc<dyn ConnectionProvider>,
    items: DataConnector<SqliteBackend>,
}

async fn fixture() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite:{}?mode=rwc", dir.path().join("items.db").display());
    let strings = ConfiguredConnectionStrings::new().with(KEY, url);
    let provider: Arc<dyn ConnectionProvider> =
        Arc::new(SqlConnectionProvider::new(Arc::new(strings)));
    let items = DataConnector::new(
        SqliteBackend,
        Arc::clone(&provider),
        CommandFactory::default(),
        KEY,
    );
    items
        .execute_non_query(
            "CREATE TABLE items (id INTEGER PRIMARY KEY, name TEXT NOT NULL, note TEXT)",
            &[],
        )
        .await
        .unwrap();
    Fixture {
        _dir: dir,
        provider,
        items,
    }
}

async fn insert(items: &DataConnector<SqliteBackend>, id: i64, name: &str) -> Result<u64, DbError> {
    items
        .execute_non_query(
            "INSERT INTO items (id, name) VALUES (@id, @name)",
            &[items.parameter("@id", id), items.parameter("name", name)],
        )
        .await
}

async fn count(items: &DataConnector<SqliteBackend>) -> i64 {
    items
        .execute_scalar("SELECT COUNT(*) FROM items", &[])
        .await
        .unwrap()
}

#[tokio::test]
async fn test_ad_hoc_queries() {
    let Fixture { _dir, items, .. } = fixture().await;

    assert_eq!(insert(&items, 1, "apple").await.unwrap(), 1);
    assert_eq!(insert(&items, 2, "banana").await.unwrap(), 1);
    assert_eq!(count(&items).await, 2);

    let names: Vec<String> = items
        .execute_projection("SELECT name FROM items ORDER BY id", &[], |row| {
            row.try_get(0)
        })
        .await
        .unwrap();
    assert_eq!(names, vec!["apple", "banana"]);

    let table = items
        .execute_table(
            "SELECT id, name FROM items WHERE id = @id",
            &[items.parameter("id", 2)],
        )
        .await
        .unwrap();
    assert_eq!(table.row_count(), 1);
    assert_eq!(table.column_index("name"), Some(1));
    assert_eq!(table.rows[0].try_get_by_name::<String>("name").unwrap(), "banana");

    let mut seen = 0;
    let streamed = items
        .execute_reader("SELECT id FROM items", &[], |_| {
            seen += 1;
            Ok(())
        })
        .await
        .unwrap();
    assert_eq!((streamed, seen), (2, 2));
}

#[tokio::test]
async fn test_scalar_null_handling() {
    let Fixture { _dir, items, .. } = fixture().await;
    insert(&items, 1, "apple").await.unwrap();

    let missing: Option<String> = items
        .execute_scalar("SELECT name FROM items WHERE id = 99", &[])
        .await
        .unwrap();
    assert_eq!(missing, None);

    let err = items
        .execute_scalar::<String>("SELECT note FROM items WHERE id = 1", &[])
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::NullScalar));
}

#[tokio::test]
async fn test_ambient_scope_commits_all_statements() {
    let Fixture {
        _dir,
        items,
        provider,
    } = fixture().await;

    let connector = items.clone();
    ambient::scoped(
        provider,
        ScopeOption::Required,
        TransactionOptions::default(),
        [KEY],
        || async move {
            insert(&connector, 1, "apple").await?;
            insert(&connector, 2, "banana").await?;
            // visible inside the transaction on the shared connection
            assert_eq!(count(&connector).await, 2);
            Ok(())
        },
    )
    .await
    .unwrap();

    assert_eq!(count(&items).await, 2);
}

#[tokio::test]
async fn test_ambient_scope_without_commit_rolls_back() {
    let Fixture {
        _dir,
        items,
        provider,
    } = fixture().await;

    let connector = items.clone();
    ambient::flow(async move {
        let mut scope = AmbientTransactionScope::begin(
            provider,
            ScopeOption::Required,
            TransactionOptions::new(IsolationLevel::ReadCommitted, None),
            [KEY],
        )
        .unwrap();
        insert(&connector, 1, "apple").await.unwrap();
        assert_eq!(count(&connector).await, 1);
        scope.dispose().await.unwrap();
    })
    .await;

    assert_eq!(count(&items).await, 0);
}

#[tokio::test]
async fn test_failed_statement_inside_scope_rolls_back() {
    let Fixture {
        _dir,
        items,
        provider,
    } = fixture().await;

    let connector = items.clone();
    let result = ambient::scoped(
        provider,
        ScopeOption::Required,
        TransactionOptions::default(),
        [KEY],
        || async move {
            insert(&connector, 1, "apple").await?;
            // duplicate primary key
            insert(&connector, 1, "again").await?;
            Ok(())
        },
    )
    .await;
    assert!(result.is_err());
    assert_eq!(count(&items).await, 0);
}

#[tokio::test]
async fn test_context_transaction() {
    let Fixture {
        _dir,
        items,
        provider,
    } = fixture().await;
    let contexts = ConnectionContextFactory::new(provider);

    let mut rolled_back = contexts
        .create_with_transaction(KEY, TransactionDisposeBehavior::RollbackIfUnfinalized)
        .await
        .unwrap();
    items
        .with_context(&mut rolled_back)
        .execute_non_query("INSERT INTO items (id, name) VALUES (1, 'apple')", &[])
        .await
        .unwrap();
    rolled_back.dispose().await.unwrap();
    assert!(matches!(
        rolled_back.dispose().await,
        Err(DbError::Disposed { .. })
    ));
    assert_eq!(count(&items).await, 0);

    let mut committed = contexts
        .create_with_transaction(KEY, TransactionDisposeBehavior::RollbackIfUnfinalized)
        .await
        .unwrap();
    let mut scoped = items.with_context(&mut committed);
    scoped
        .execute_non_query("INSERT INTO items (id, name) VALUES (2, 'banana')", &[])
        .await
        .unwrap();
    let inside: i64 = scoped
        .execute_scalar("SELECT COUNT(*) FROM items", &[])
        .await
        .unwrap();
    assert_eq!(inside, 1);
    committed.commit().await.unwrap();
    committed.dispose().await.unwrap();
    assert_eq!(count(&items).await, 1);
}
