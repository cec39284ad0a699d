//! Integration tests for the MongoDB adapter.
//!
//! Set TEST_MONGODB_URL to run these tests.
//! Example: TEST_MONGODB_URL="mongodb://localhost:27017/?replicaSet=rs0"
//! Transaction tests additionally need the deployment to be a replica set.

use database_core::db::DatabaseAdapter;
use database_core::models::{
    Conditions, ConnectionConfig, ConnectionKind, FindOptions, Operation, OrderBy, ProviderKind,
    Record,
};
use database_core::{ConnectionManager, DbError};
use serde_json::{Value as JsonValue, json};
use std::sync::Arc;

fn record(value: JsonValue) -> Record {
    value.as_object().cloned().unwrap()
}

/// Connect to a fresh, uniquely named collection.
async fn setup() -> Option<(ConnectionManager, Arc<dyn DatabaseAdapter>, String)> {
    let uri = match std::env::var("TEST_MONGODB_URL") {
        Ok(uri) => uri,
        Err(_) => {
            eprintln!("Skipping test: TEST_MONGODB_URL not set");
            return None;
        }
    };

    let manager = ConnectionManager::new();
    let config = ConnectionConfig::new(
        "docs",
        ProviderKind::DocumentStore,
        ConnectionKind::External,
        Default::default(),
    )
    .with_setting("uri", uri)
    .with_setting("database", "database_core_test");
    let info = manager.add_connection(config).await.unwrap();
    assert_eq!(info.status.to_string(), "connected");

    let adapter = manager.require_connection("docs").await.unwrap();
    let collection = format!("people_{}", uuid::Uuid::new_v4().simple());
    Some((manager, adapter, collection))
}

#[tokio::test]
async fn test_document_crud() {
    let Some((manager, adapter, people)) = setup().await else {
        return;
    };

    let ada = adapter
        .insert(&people, record(json!({"age": 36, "name": "Ada"})))
        .await
        .unwrap();
    assert!(ada["id"].is_string());
    assert!(ada["created_at"].is_string());
    adapter
        .insert(&people, record(json!({"age": 45, "name": "Grace"})))
        .await
        .unwrap();

    let by_id = record(json!({"id": ada["id"].clone()}));
    let found = adapter.find_one(&people, &by_id).await.unwrap().unwrap();
    assert_eq!(found["name"], json!("Ada"));

    let sorted = adapter
        .find(
            &people,
            &Conditions::new(),
            &FindOptions::new().order_by(OrderBy::desc("age")),
        )
        .await
        .unwrap();
    assert_eq!(sorted[0]["name"], json!("Grace"));

    let updated = adapter
        .update(&people, &by_id, record(json!({"age": 37})))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(updated["age"], json!(37));

    assert!(adapter.delete(&people, &by_id, true).await.unwrap());
    assert!(!adapter.delete(&people, &by_id, true).await.unwrap());
    assert!(adapter.find_one(&people, &by_id).await.unwrap().is_none());
    assert_eq!(adapter.count(&people, &Conditions::new()).await.unwrap(), 1);
    assert!(adapter.delete(&people, &by_id, false).await.unwrap());

    let err = adapter
        .update(&people, &Conditions::new(), record(json!({"age": 1})))
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::Validation { .. }));

    manager.close_all().await;
}

#[tokio::test]
async fn test_native_aggregate_and_insert_many() {
    let Some((manager, adapter, people)) = setup().await else {
        return;
    };

    let stored = adapter
        .insert_many(
            &people,
            vec![
                record(json!({"age": 30, "team": "a"})),
                record(json!({"age": 40, "team": "a"})),
                record(json!({"age": 25, "team": "b"})),
            ],
        )
        .await
        .unwrap();
    assert_eq!(stored.len(), 3);

    let duplicate = vec![
        record(json!({"id": "same", "team": "c"})),
        record(json!({"id": "same", "team": "c"})),
    ];
    assert!(adapter.insert_many(&people, duplicate).await.is_err());
    assert_eq!(
        adapter
            .count(&people, &record(json!({"team": "c"})))
            .await
            .unwrap(),
        0
    );

    let rows = adapter
        .aggregate(
            &people,
            &[
                json!({"$group": {"_id": "$team", "total": {"$sum": "$age"}}}),
                json!({"$sort": {"_id": 1}}),
            ],
        )
        .await
        .unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0]["id"], json!("a"));
    assert_eq!(rows[0]["total"].as_i64(), Some(70));

    manager.close_all().await;
}

#[tokio::test]
async fn test_document_transactions() {
    let Some((manager, adapter, people)) = setup().await else {
        return;
    };
    if !adapter.supports_transactions() {
        let err = adapter.begin_transaction().await.unwrap_err();
        assert!(matches!(err, DbError::UnsupportedOperation { .. }));
        manager.close_all().await;
        return;
    }

    // The collection must exist before it is written inside a transaction on older servers
    adapter
        .insert(&people, record(json!({"name": "seed"})))
        .await
        .unwrap();

    let ctx = adapter.begin_transaction().await.unwrap();
    adapter
        .execute_in_transaction(
            &ctx,
            Operation::Insert {
                entity: people.clone(),
                data: record(json!({"name": "inside"})),
            },
        )
        .await
        .unwrap();
    let err = adapter.create_savepoint(&ctx, "sp").await.unwrap_err();
    assert!(matches!(err, DbError::UnsupportedOperation { .. }));
    adapter.rollback_transaction(&ctx).await.unwrap();
    assert_eq!(adapter.count(&people, &Conditions::new()).await.unwrap(), 1);

    let ctx = adapter.begin_transaction().await.unwrap();
    adapter
        .execute_in_transaction(
            &ctx,
            Operation::Insert {
                entity: people.clone(),
                data: record(json!({"name": "committed"})),
            },
        )
        .await
        .unwrap();
    adapter.commit_transaction(&ctx).await.unwrap();
    assert_eq!(adapter.count(&people, &Conditions::new()).await.unwrap(), 2);

    manager.close_all().await;
}
