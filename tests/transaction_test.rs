//! Integration tests for transaction functionality on SQLite files.

use database_core::db::DatabaseAdapter;
use database_core::models::{
    Conditions, ConnectionConfig, ConnectionKind, ConnectionStatus, Operation, OperationResult,
    ProviderKind, Record, TransactionState,
};
use database_core::{ConnectionManager, DbError};
use serde_json::{Value as JsonValue, json};
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection};
use sqlx::{ConnectOptions, Connection};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;

fn record(value: JsonValue) -> Record {
    value.as_object().cloned().unwrap()
}

async fn setup() -> (TempDir, ConnectionManager, Arc<dyn DatabaseAdapter>) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tx.db");

    let mut conn: SqliteConnection = SqliteConnectOptions::new()
        .filename(&path)
        .create_if_missing(true)
        .connect()
        .await
        .unwrap();
    sqlx::query(
        "CREATE TABLE accounts (id TEXT PRIMARY KEY, owner TEXT NOT NULL, balance INTEGER, \
         created_at TEXT, updated_at TEXT, deleted_at TEXT)",
    )
    .execute(&mut conn)
    .await
    .unwrap();
    conn.close().await.unwrap();

    let manager = ConnectionManager::new();
    let config = ConnectionConfig::new(
        "bank",
        ProviderKind::RelationalSql,
        ConnectionKind::Embedded,
        Default::default(),
    )
    .with_setting("path", path.to_str().unwrap());
    manager.add_connection(config).await.unwrap();
    let adapter = manager.require_connection("bank").await.unwrap();
    (dir, manager, adapter)
}

fn insert(owner: &str, balance: i64) -> Operation {
    Operation::Insert {
        entity: "accounts".to_string(),
        data: record(json!({"balance": balance, "owner": owner})),
    }
}

async fn owners(adapter: &Arc<dyn DatabaseAdapter>) -> Vec<String> {
    let mut owners: Vec<String> = adapter
        .find("accounts", &Conditions::new(), &Default::default())
        .await
        .unwrap()
        .into_iter()
        .map(|r| r["owner"].as_str().unwrap().to_string())
        .collect();
    owners.sort();
    owners
}

#[tokio::test]
async fn test_commit_makes_writes_visible() {
    let (_dir, manager, adapter) = setup().await;

    let ctx = adapter.begin_transaction().await.unwrap();
    assert!(ctx.id().starts_with("tx_"));
    assert_eq!(ctx.connection_id(), "bank");

    let result = adapter
        .execute_in_transaction(&ctx, insert("ada", 100))
        .await
        .unwrap();
    let stored = result.into_record().unwrap();
    assert_eq!(stored["owner"], json!("ada"));

    let seen = adapter
        .execute_in_transaction(
            &ctx,
            Operation::Count {
                entity: "accounts".to_string(),
                conditions: Conditions::new(),
            },
        )
        .await
        .unwrap();
    assert_eq!(seen.as_count(), Some(1));

    adapter.commit_transaction(&ctx).await.unwrap();
    assert_eq!(ctx.state(), TransactionState::Committed);
    assert_eq!(owners(&adapter).await, vec!["ada"]);

    manager.close_all().await;
}

#[tokio::test]
async fn test_rollback_discards_writes() {
    let (_dir, _manager, adapter) = setup().await;

    let ctx = adapter.begin_transaction().await.unwrap();
    adapter
        .execute_in_transaction(&ctx, insert("ada", 100))
        .await
        .unwrap();
    adapter
        .execute_in_transaction(
            &ctx,
            Operation::InsertMany {
                entity: "accounts".to_string(),
                records: vec![
                    record(json!({"owner": "grace"})),
                    record(json!({"owner": "linus"})),
                ],
            },
        )
        .await
        .unwrap();
    adapter.rollback_transaction(&ctx).await.unwrap();

    assert_eq!(ctx.state(), TransactionState::RolledBack);
    assert!(owners(&adapter).await.is_empty());
}

#[tokio::test]
async fn test_savepoints() {
    let (_dir, _manager, adapter) = setup().await;

    let ctx = adapter.begin_transaction().await.unwrap();
    adapter
        .execute_in_transaction(&ctx, insert("before", 1))
        .await
        .unwrap();

    let a = adapter.create_savepoint(&ctx, "a").await.unwrap();
    adapter
        .execute_in_transaction(&ctx, insert("after_a", 2))
        .await
        .unwrap();
    let b = adapter.create_savepoint(&ctx, "b").await.unwrap();
    adapter
        .execute_in_transaction(&ctx, insert("after_b", 3))
        .await
        .unwrap();
    assert_eq!(ctx.savepoints(), vec!["a", "b"]);

    adapter.rollback_to_savepoint(&ctx, &b).await.unwrap();
    assert_eq!(ctx.savepoints(), vec!["a"]);
    adapter.rollback_to_savepoint(&ctx, &a).await.unwrap();
    assert!(ctx.savepoints().is_empty());

    // b was discarded along with a's later work
    let err = adapter.rollback_to_savepoint(&ctx, &b).await.unwrap_err();
    assert!(matches!(err, DbError::TransactionState { .. }));

    adapter.commit_transaction(&ctx).await.unwrap();
    assert_eq!(owners(&adapter).await, vec!["before"]);
}

#[tokio::test]
async fn test_finished_context_is_terminal() {
    let (_dir, _manager, adapter) = setup().await;

    let ctx = adapter.begin_transaction().await.unwrap();
    let copy = ctx.clone();
    adapter.commit_transaction(&ctx).await.unwrap();

    assert_eq!(copy.state(), TransactionState::Committed);
    for result in [
        adapter.commit_transaction(&copy).await,
        adapter.rollback_transaction(&copy).await,
    ] {
        assert!(matches!(result, Err(DbError::TransactionState { .. })));
    }
    let err = adapter
        .execute_in_transaction(&copy, insert("late", 0))
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::TransactionState { .. }));
    let err = adapter.create_savepoint(&copy, "sp").await.unwrap_err();
    assert!(matches!(err, DbError::TransactionState { .. }));
}

#[tokio::test]
async fn test_transactions_are_isolated_per_connection() {
    let (_dir, manager, adapter) = setup().await;

    let other = ConnectionConfig::new(
        "scratch",
        ProviderKind::RelationalSql,
        ConnectionKind::Embedded,
        Default::default(),
    )
    .with_setting("path", ":memory:");
    manager.add_connection(other).await.unwrap();
    let scratch = manager.require_connection("scratch").await.unwrap();

    let ctx = adapter.begin_transaction().await.unwrap();
    let err = scratch.commit_transaction(&ctx).await.unwrap_err();
    assert!(matches!(err, DbError::TransactionState { .. }));
    assert!(ctx.is_active());
    adapter.rollback_transaction(&ctx).await.unwrap();
}

#[tokio::test]
async fn test_failed_operation_keeps_transaction_usable() {
    let (_dir, _manager, adapter) = setup().await;

    let ctx = adapter.begin_transaction().await.unwrap();
    adapter
        .execute_in_transaction(&ctx, insert("ada", 5))
        .await
        .unwrap();
    let err = adapter
        .execute_in_transaction(
            &ctx,
            Operation::Update {
                entity: "accounts".to_string(),
                conditions: Conditions::new(),
                data: record(json!({"balance": 0})),
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::Validation { .. }));

    let result = adapter
        .execute_in_transaction(
            &ctx,
            Operation::Delete {
                entity: "accounts".to_string(),
                conditions: record(json!({"owner": "ada"})),
                soft: true,
            },
        )
        .await
        .unwrap();
    assert!(matches!(result, OperationResult::Deleted(true)));
    adapter.commit_transaction(&ctx).await.unwrap();
    assert!(owners(&adapter).await.is_empty());
}

#[tokio::test]
async fn test_in_memory_connection_live_during_transaction() {
    let manager = ConnectionManager::new();
    let config = ConnectionConfig::new(
        "mem",
        ProviderKind::RelationalSql,
        ConnectionKind::Embedded,
        Default::default(),
    )
    .with_setting("path", ":memory:")
    .with_timeout_secs(2);
    manager.add_connection(config).await.unwrap();
    let adapter = manager.require_connection("mem").await.unwrap();

    let ctx = adapter.begin_transaction().await.unwrap();

    // The only pooled connection is held by the open transaction
    let started = Instant::now();
    let report = manager.health_check("mem").await;
    assert_eq!(report.status, ConnectionStatus::Connected);
    assert!(report.error.is_none());
    assert!(started.elapsed() < Duration::from_secs(1));
    assert!(ctx.is_active());

    adapter.rollback_transaction(&ctx).await.unwrap();
    let report = manager.health_check("mem").await;
    assert_eq!(report.status, ConnectionStatus::Connected);
}
