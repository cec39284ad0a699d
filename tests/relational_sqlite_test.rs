//! Integration tests for the relational adapter on SQLite files.
//!
//! Tests verify that:
//! - Inserted records come back with generated ids and timestamps
//! - Soft-deleted records disappear from reads but remain for hard deletes
//! - Updates and deletes need conditions and touch a single record
//! - insert_many is all-or-nothing
//! - Aggregation pipelines are translated to SQL
//! - Every call is recorded by the query optimizer
//! - Concurrent writers queue on the file lock instead of failing
//! - A timed-out query leaves the pool usable

use database_core::db::DatabaseAdapter;
use database_core::models::{
    Conditions, ConnectionConfig, ConnectionKind, FindOptions, OrderBy, ProviderKind, Record,
};
use database_core::{ConnectionManager, DbError};
use serde_json::{Value as JsonValue, json};
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection};
use sqlx::{ConnectOptions, Connection};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;

struct TestDb {
    // Dropped last so the file outlives the pool
    _dir: TempDir,
    manager: ConnectionManager,
    adapter: Arc<dyn DatabaseAdapter>,
}

fn record(value: JsonValue) -> Record {
    value.as_object().cloned().unwrap()
}

/// Create a SQLite file with a `users` table and register it as connection `app`.
async fn setup() -> TestDb {
    setup_with(&[], |config| config).await
}

/// Like [`setup`], running `extra_schema` after the `users` table and letting `configure`
/// adjust the connection config.
async fn setup_with(
    extra_schema: &[&str],
    configure: impl FnOnce(ConnectionConfig) -> ConnectionConfig,
) -> TestDb {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("app.db");

    let mut conn: SqliteConnection = SqliteConnectOptions::new()
        .filename(&path)
        .create_if_missing(true)
        .connect()
        .await
        .unwrap();
    sqlx::query(
        "CREATE TABLE users (id TEXT PRIMARY KEY, name TEXT NOT NULL, team TEXT, age INTEGER, \
         created_at TEXT, updated_at TEXT, deleted_at TEXT)",
    )
    .execute(&mut conn)
    .await
    .unwrap();
    for sql in extra_schema {
        sqlx::query(sql).execute(&mut conn).await.unwrap();
    }
    conn.close().await.unwrap();

    let manager = ConnectionManager::new();
    let config = ConnectionConfig::new(
        "app",
        ProviderKind::RelationalSql,
        ConnectionKind::Embedded,
        Default::default(),
    )
    .with_setting("path", path.to_str().unwrap());
    let info = manager.add_connection(configure(config)).await.unwrap();
    assert!(info.supports_transactions);

    let adapter = manager.require_connection("app").await.unwrap();
    TestDb {
        _dir: dir,
        manager,
        adapter,
    }
}

async fn seed(adapter: &Arc<dyn DatabaseAdapter>) {
    let users = vec![
        record(json!({"age": 30, "name": "Ada", "team": "a"})),
        record(json!({"age": 40, "name": "Grace", "team": "a"})),
        record(json!({"age": 25, "name": "Linus", "team": "b"})),
    ];
    adapter.insert_many("users", users).await.unwrap();
}

#[tokio::test]
async fn test_insert_and_read_back() {
    let db = setup().await;
    let adapter = &db.adapter;

    let inserted = adapter
        .insert("users", record(json!({"age": 36, "name": "Ada"})))
        .await
        .unwrap();
    let id = inserted["id"].as_str().unwrap().to_string();
    assert!(!id.is_empty());
    assert!(inserted["created_at"].is_string());
    assert_eq!(inserted["created_at"], inserted["updated_at"]);
    assert!(inserted["deleted_at"].is_null());

    let found = adapter
        .find_one("users", &record(json!({"id": id})))
        .await
        .unwrap();
    assert_eq!(found, Some(inserted));

    let missing = adapter
        .find_one("users", &record(json!({"name": "nobody"})))
        .await
        .unwrap();
    assert!(missing.is_none());
    assert!(adapter
        .find("users", &record(json!({"name": "nobody"})), &FindOptions::new())
        .await
        .unwrap()
        .is_empty());

    db.manager.close_all().await;
}

#[tokio::test]
async fn test_find_options() {
    let db = setup().await;
    seed(&db.adapter).await;

    let options = FindOptions::new()
        .order_by(OrderBy::desc("age"))
        .with_limit(2);
    let oldest = db
        .adapter
        .find("users", &Conditions::new(), &options)
        .await
        .unwrap();
    let names: Vec<&str> = oldest.iter().map(|r| r["name"].as_str().unwrap()).collect();
    assert_eq!(names, vec!["Grace", "Ada"]);

    let options = FindOptions::new()
        .order_by(OrderBy::asc("age"))
        .with_limit(1)
        .with_offset(1);
    let second = db
        .adapter
        .find("users", &Conditions::new(), &options)
        .await
        .unwrap();
    assert_eq!(second.len(), 1);
    assert_eq!(second[0]["name"], json!("Ada"));

    assert_eq!(
        db.adapter
            .count("users", &record(json!({"team": "a"})))
            .await
            .unwrap(),
        2
    );
}

#[tokio::test]
async fn test_soft_delete_hides_records() {
    let db = setup().await;
    let adapter = &db.adapter;
    let user = adapter
        .insert("users", record(json!({"name": "Ada"})))
        .await
        .unwrap();
    let by_id = record(json!({"id": user["id"].clone()}));

    assert!(adapter.delete("users", &by_id, true).await.unwrap());
    assert!(!adapter.delete("users", &by_id, true).await.unwrap());

    assert!(adapter.find_one("users", &by_id).await.unwrap().is_none());
    assert_eq!(adapter.count("users", &Conditions::new()).await.unwrap(), 0);
    let updated = adapter
        .update("users", &by_id, record(json!({"name": "Ghost"})))
        .await
        .unwrap();
    assert!(updated.is_none());

    // Still present for a hard delete
    assert!(adapter.delete("users", &by_id, false).await.unwrap());
    assert!(!adapter.delete("users", &by_id, false).await.unwrap());
}

#[tokio::test]
async fn test_update_and_delete_touch_one_record() {
    let db = setup().await;
    seed(&db.adapter).await;
    let adapter = &db.adapter;
    let team_a = record(json!({"team": "a"}));

    let updated = adapter
        .update("users", &team_a, record(json!({"team": "c"})))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(updated["team"], json!("c"));
    assert_eq!(adapter.count("users", &team_a).await.unwrap(), 1);

    assert!(adapter.delete("users", &team_a, true).await.unwrap());
    assert_eq!(adapter.count("users", &team_a).await.unwrap(), 0);
    assert_eq!(adapter.count("users", &Conditions::new()).await.unwrap(), 2);
}

#[tokio::test]
async fn test_update_validation() {
    let db = setup().await;
    seed(&db.adapter).await;
    let adapter = &db.adapter;

    let err = adapter
        .update("users", &Conditions::new(), record(json!({"name": "Everyone"})))
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::Validation { .. }));
    let renamed = adapter
        .count("users", &record(json!({"name": "Everyone"})))
        .await
        .unwrap();
    assert_eq!(renamed, 0);

    let err = adapter
        .update("users", &record(json!({"name": "Ada"})), record(json!({"id": "x"})))
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::Validation { .. }));

    let err = adapter
        .delete("users", &Conditions::new(), false)
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::Validation { .. }));
    assert_eq!(adapter.count("users", &Conditions::new()).await.unwrap(), 3);

    let none = adapter
        .update("users", &record(json!({"name": "nobody"})), record(json!({"age": 1})))
        .await
        .unwrap();
    assert!(none.is_none());
}

#[tokio::test]
async fn test_insert_many_is_all_or_nothing() {
    let db = setup().await;
    let adapter = &db.adapter;

    assert!(adapter.insert_many("users", Vec::new()).await.unwrap().is_empty());

    let batch = vec![
        record(json!({"id": "u1", "name": "Ada"})),
        record(json!({"id": "u2", "name": "Grace"})),
        record(json!({"id": "u1", "name": "Duplicate"})),
    ];
    assert!(adapter.insert_many("users", batch).await.is_err());
    assert_eq!(adapter.count("users", &Conditions::new()).await.unwrap(), 0);

    let stored = adapter
        .insert_many(
            "users",
            vec![
                record(json!({"id": "u1", "name": "Ada"})),
                record(json!({"id": "u2", "name": "Grace"})),
            ],
        )
        .await
        .unwrap();
    assert_eq!(stored.len(), 2);
    assert_eq!(stored[1]["name"], json!("Grace"));
    assert_eq!(adapter.count("users", &Conditions::new()).await.unwrap(), 2);
}

#[tokio::test]
async fn test_aggregate_group_by_team() {
    let db = setup().await;
    seed(&db.adapter).await;

    let pipeline = vec![
        json!({"$match": {"team": "a"}}),
        json!({"$group": {"_id": "$team", "members": {"$count": {}}, "total_age": {"$sum": "$age"}}}),
    ];
    let rows = db.adapter.aggregate("users", &pipeline).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["_id"], json!("a"));
    assert_eq!(rows[0]["members"].as_i64(), Some(2));
    assert_eq!(rows[0]["total_age"].as_f64(), Some(70.0));

    let pipeline = vec![
        json!({"$group": {"_id": "$team", "oldest": {"$max": "$age"}}}),
        json!({"$sort": {"oldest": -1}}),
        json!({"$limit": 1}),
    ];
    let rows = db.adapter.aggregate("users", &pipeline).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["_id"], json!("a"));

    let err = db
        .adapter
        .aggregate("users", &[json!({"$lookup": {"from": "teams"}})])
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::UnsupportedOperation { .. }));
}

#[tokio::test]
async fn test_unknown_entity() {
    let db = setup().await;
    let err = db
        .adapter
        .insert("widgets", record(json!({"name": "x"})))
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::Validation { .. }));
    assert!(err.to_string().contains("widgets"));
}

#[tokio::test]
async fn test_calls_are_recorded() {
    let db = setup().await;
    seed(&db.adapter).await;
    for _ in 0..3 {
        db.adapter
            .find("users", &record(json!({"team": "a"})), &FindOptions::new())
            .await
            .unwrap();
    }
    let _ = db.adapter.insert("widgets", Record::new()).await;

    let optimizer = db.manager.optimizer();
    let stats = optimizer.get_statistics();
    assert_eq!(stats.total_queries, 5);
    assert_eq!(stats.failed_queries, 1);
    assert!(stats.entities.contains(&"users".to_string()));

    let analysis = optimizer.analyze_entity("users");
    assert_eq!(analysis.total_queries, 4);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_updates_and_deletes() {
    let db = setup().await;

    let inserts = (0..32).map(|i| {
        let adapter = Arc::clone(&db.adapter);
        tokio::spawn(async move {
            adapter
                .insert("users", record(json!({"name": format!("user-{i}"), "age": i})))
                .await
        })
    });
    let mut ids = Vec::new();
    for handle in inserts.collect::<Vec<_>>() {
        let stored = handle.await.unwrap().unwrap();
        ids.push(stored["id"].clone());
    }
    assert_eq!(db.adapter.count("users", &Conditions::new()).await.unwrap(), 32);

    // Every write reads the target row before changing it
    let mut handles = Vec::new();
    for (i, id) in ids.into_iter().enumerate() {
        let adapter = Arc::clone(&db.adapter);
        handles.push(tokio::spawn(async move {
            let by_id = record(json!({"id": id}));
            if i % 2 == 0 {
                let updated = adapter
                    .update("users", &by_id, record(json!({"team": "busy"})))
                    .await?;
                Ok::<bool, DbError>(updated.is_some())
            } else {
                adapter.delete("users", &by_id, i % 4 == 1).await
            }
        }));
    }
    for handle in handles {
        assert!(handle.await.unwrap().unwrap());
    }

    let busy = record(json!({"team": "busy"}));
    assert_eq!(db.adapter.count("users", &busy).await.unwrap(), 16);
    assert_eq!(db.adapter.count("users", &Conditions::new()).await.unwrap(), 16);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_query_timeout_leaves_pool_usable() {
    let slow_view = "CREATE VIEW slow_counter AS \
         WITH RECURSIVE c(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM c WHERE x < 50000000) \
         SELECT x AS id, NULL AS deleted_at FROM c";
    let db = setup_with(&[slow_view], |config| config.with_timeout_secs(1)).await;
    seed(&db.adapter).await;

    let started = Instant::now();
    let err = db
        .adapter
        .count("slow_counter", &Conditions::new())
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::Timeout { .. }), "unexpected error: {err}");
    assert!(started.elapsed() < Duration::from_secs(5));

    // Reads after the timeout run on another pooled connection
    assert_eq!(db.adapter.count("users", &Conditions::new()).await.unwrap(), 3);
    let found = db
        .adapter
        .find("users", &record(json!({"team": "a"})), &FindOptions::new())
        .await
        .unwrap();
    assert_eq!(found.len(), 2);

    let stats = db.manager.optimizer().get_statistics();
    assert_eq!(stats.failed_queries, 1);
}
