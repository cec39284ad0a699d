//! Statement execution and record-level CRUD over a single SQL connection.
//!
//! # Architecture
//!
//! [`SqlConn`] borrows one backend connection (pooled or pinned by a transaction) and runs
//! built [`Statement`]s under a timeout. [`SqlExecutor`] layers the record convention on top:
//! generated ids, timestamps, soft-delete filtering and single-record update/delete.
//!
//! The executor never opens transactions itself. Callers decide whether a call runs on a
//! pooled connection, an implicit transaction, or a user transaction.

use crate::config::DEFAULT_QUERY_TIMEOUT_SECS;
use crate::db::params;
use crate::db::sql::{Dialect, SqlBuilder, Statement, validate_identifier};
use crate::error::{DbError, DbResult};
use crate::models::{
    Conditions, ConnectionConfig, FindOptions, Operation, OperationResult, Record,
};
use chrono::Utc;
use serde_json::Value as JsonValue;
use sqlx::{MySqlConnection, PgConnection, SqliteConnection};
use std::time::Duration;
use tokio::time::timeout;
use tracing::debug;

pub const ID_FIELD: &str = "id";
pub const CREATED_AT_FIELD: &str = "created_at";
pub const UPDATED_AT_FIELD: &str = "updated_at";
pub const DELETED_AT_FIELD: &str = "deleted_at";

/// A borrowed connection of any supported SQL backend.
#[derive(Debug)]
pub enum SqlConn<'c> {
    MySql(&'c mut MySqlConnection),
    Postgres(&'c mut PgConnection),
    SQLite(&'c mut SqliteConnection),
}

/// Outcome of a statement that returns no rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExecOutcome {
    pub rows_affected: u64,
    /// MySQL `LAST_INSERT_ID()` or SQLite `last_insert_rowid()`.
    pub last_insert_id: Option<i64>,
}

impl SqlConn<'_> {
    pub fn dialect(&self) -> Dialect {
        match self {
            SqlConn::MySql(_) => Dialect::MySql,
            SqlConn::Postgres(_) => Dialect::Postgres,
            SqlConn::SQLite(_) => Dialect::SQLite,
        }
    }

    /// Run a row-returning statement and decode every row into a record.
    pub async fn fetch(&mut self, stmt: &Statement, query_timeout: Duration) -> DbResult<Vec<Record>> {
        debug!(
            sql = %stmt.sql,
            params = stmt.params.len(),
            dialect = %self.dialect(),
            "Executing query"
        );
        match self {
            SqlConn::MySql(conn) => mysql::fetch(conn, stmt, query_timeout).await,
            SqlConn::Postgres(conn) => postgres::fetch(conn, stmt, query_timeout).await,
            SqlConn::SQLite(conn) => sqlite::fetch(conn, stmt, query_timeout).await,
        }
    }

    /// Run a statement for its side effects.
    pub async fn execute(&mut self, stmt: &Statement, query_timeout: Duration) -> DbResult<ExecOutcome> {
        debug!(
            sql = %stmt.sql,
            params = stmt.params.len(),
            dialect = %self.dialect(),
            "Executing statement"
        );
        match self {
            SqlConn::MySql(conn) => mysql::execute(conn, stmt, query_timeout).await,
            SqlConn::Postgres(conn) => postgres::execute(conn, stmt, query_timeout).await,
            SqlConn::SQLite(conn) => sqlite::execute(conn, stmt, query_timeout).await,
        }
    }

    /// Run parameterless SQL over the simple-query protocol.
    pub async fn execute_raw(&mut self, sql: &str) -> DbResult<u64> {
        use sqlx::Executor;

        let query_timeout = Duration::from_secs(DEFAULT_QUERY_TIMEOUT_SECS);
        let result = match self {
            SqlConn::MySql(conn) => timeout(query_timeout, (&mut **conn).execute(sql))
                .await
                .map(|r| r.map(|done| done.rows_affected())),
            SqlConn::Postgres(conn) => timeout(query_timeout, (&mut **conn).execute(sql))
                .await
                .map(|r| r.map(|done| done.rows_affected())),
            SqlConn::SQLite(conn) => timeout(query_timeout, (&mut **conn).execute(sql))
                .await
                .map(|r| r.map(|done| done.rows_affected())),
        };
        match result {
            Ok(Ok(rows)) => Ok(rows),
            Ok(Err(e)) => Err(DbError::from(e)),
            Err(_) => Err(timeout_error("statement", query_timeout)),
        }
    }
}

pub(crate) fn timeout_error(operation: &str, timeout: Duration) -> DbError {
    DbError::timeout(operation, timeout.as_secs() as u32)
}

// =============================================================================
// Database-Specific Implementations
// =============================================================================
//
// Each module below provides the same interface adapted to its database type.

mod mysql {
    use super::*;
    use crate::db::types::RowToJson;

    pub async fn fetch(
        conn: &mut MySqlConnection,
        stmt: &Statement,
        query_timeout: Duration,
    ) -> DbResult<Vec<Record>> {
        match timeout(query_timeout, params::mysql_query(stmt).fetch_all(conn)).await {
            Ok(Ok(rows)) => Ok(rows.iter().map(RowToJson::to_record).collect()),
            Ok(Err(e)) => Err(DbError::from(e)),
            Err(_) => Err(timeout_error("query execution", query_timeout)),
        }
    }

    pub async fn execute(
        conn: &mut MySqlConnection,
        stmt: &Statement,
        query_timeout: Duration,
    ) -> DbResult<ExecOutcome> {
        match timeout(query_timeout, params::mysql_query(stmt).execute(conn)).await {
            Ok(Ok(done)) => Ok(ExecOutcome {
                rows_affected: done.rows_affected(),
                last_insert_id: i64::try_from(done.last_insert_id()).ok().filter(|id| *id > 0),
            }),
            Ok(Err(e)) => Err(DbError::from(e)),
            Err(_) => Err(timeout_error("write operation", query_timeout)),
        }
    }
}

mod postgres {
    use super::*;
    use sqlx::Row;
    use sqlx::postgres::PgRow;
    use sqlx::types::Json;

    /// Rows are projected as a single `jsonb` column by the statement builder.
    fn decode_row(row: &PgRow) -> DbResult<Record> {
        let Json(value): Json<JsonValue> = row.try_get(0)?;
        match value {
            JsonValue::Object(record) => Ok(record),
            other => Err(DbError::internal(format!(
                "Expected a JSON object row, got {}",
                other
            ))),
        }
    }

    pub async fn fetch(
        conn: &mut PgConnection,
        stmt: &Statement,
        query_timeout: Duration,
    ) -> DbResult<Vec<Record>> {
        match timeout(query_timeout, params::postgres_query(stmt).fetch_all(conn)).await {
            Ok(Ok(rows)) => rows.iter().map(decode_row).collect(),
            Ok(Err(e)) => Err(DbError::from(e)),
            Err(_) => Err(timeout_error("query execution", query_timeout)),
        }
    }

    pub async fn execute(
        conn: &mut PgConnection,
        stmt: &Statement,
        query_timeout: Duration,
    ) -> DbResult<ExecOutcome> {
        match timeout(query_timeout, params::postgres_query(stmt).execute(conn)).await {
            Ok(Ok(done)) => Ok(ExecOutcome {
                rows_affected: done.rows_affected(),
                last_insert_id: None,
            }),
            Ok(Err(e)) => Err(DbError::from(e)),
            Err(_) => Err(timeout_error("write operation", query_timeout)),
        }
    }
}

mod sqlite {
    use super::*;
    use crate::db::types::RowToJson;

    pub async fn fetch(
        conn: &mut SqliteConnection,
        stmt: &Statement,
        query_timeout: Duration,
    ) -> DbResult<Vec<Record>> {
        match timeout(query_timeout, params::sqlite_query(stmt).fetch_all(conn)).await {
            Ok(Ok(rows)) => Ok(rows.iter().map(RowToJson::to_record).collect()),
            Ok(Err(e)) => Err(DbError::from(e)),
            Err(_) => Err(timeout_error("query execution", query_timeout)),
        }
    }

    pub async fn execute(
        conn: &mut SqliteConnection,
        stmt: &Statement,
        query_timeout: Duration,
    ) -> DbResult<ExecOutcome> {
        match timeout(query_timeout, params::sqlite_query(stmt).execute(conn)).await {
            Ok(Ok(done)) => Ok(ExecOutcome {
                rows_affected: done.rows_affected(),
                last_insert_id: Some(done.last_insert_rowid()),
            }),
            Ok(Err(e)) => Err(DbError::from(e)),
            Err(_) => Err(timeout_error("write operation", query_timeout)),
        }
    }
}

// =============================================================================
// Record Convention
// =============================================================================

/// Which parts of the `id` / timestamps / `deleted_at` convention a connection maintains.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordConvention {
    pub timestamps: bool,
    pub soft_delete: bool,
    pub generate_ids: bool,
}

impl Default for RecordConvention {
    fn default() -> Self {
        Self {
            timestamps: true,
            soft_delete: true,
            generate_ids: true,
        }
    }
}

impl RecordConvention {
    pub fn from_config(config: &ConnectionConfig) -> Self {
        Self {
            timestamps: config.setting_bool("timestamps", true),
            soft_delete: config.setting_bool("soft_delete", true),
            generate_ids: config.setting_bool("generate_ids", true),
        }
    }

    /// Column whose non-null value hides a row, if soft delete is enabled.
    pub fn live_column(&self) -> Option<&'static str> {
        self.soft_delete.then_some(DELETED_AT_FIELD)
    }

    /// Fill in a generated id and creation timestamps where the caller left them out.
    pub fn prepare_insert(&self, mut data: Record, now: &JsonValue) -> Record {
        if self.generate_ids && !data.contains_key(ID_FIELD) {
            data.insert(
                ID_FIELD.to_string(),
                JsonValue::String(uuid::Uuid::new_v4().to_string()),
            );
        }
        if self.timestamps {
            for field in [CREATED_AT_FIELD, UPDATED_AT_FIELD] {
                data.entry(field).or_insert_with(|| now.clone());
            }
        }
        data
    }

    pub fn prepare_update(&self, mut data: Record, now: &JsonValue) -> DbResult<Record> {
        if data.contains_key(ID_FIELD) {
            return Err(DbError::validation("The id field cannot be updated"));
        }
        if self.timestamps {
            data.insert(UPDATED_AT_FIELD.to_string(), now.clone());
        }
        Ok(data)
    }
}

// =============================================================================
// Executor
// =============================================================================

/// Record-level CRUD for one SQL connection configuration.
#[derive(Debug, Clone)]
pub struct SqlExecutor {
    builder: SqlBuilder,
    convention: RecordConvention,
    query_timeout: Duration,
    entities: Vec<String>,
}

impl SqlExecutor {
    pub fn new(dialect: Dialect, convention: RecordConvention, query_timeout: Duration) -> Self {
        Self {
            builder: SqlBuilder::new(dialect),
            convention,
            query_timeout,
            entities: Vec::new(),
        }
    }

    /// Restrict the addressable entities. An empty list allows every valid identifier.
    pub fn with_entities(mut self, entities: Vec<String>) -> Self {
        self.entities = entities;
        self
    }

    pub fn dialect(&self) -> Dialect {
        self.builder.dialect()
    }

    pub fn convention(&self) -> RecordConvention {
        self.convention
    }

    pub fn query_timeout(&self) -> Duration {
        self.query_timeout
    }

    fn check_entity(&self, entity: &str) -> DbResult<()> {
        validate_identifier(entity)?;
        if !self.entities.is_empty() && !self.entities.iter().any(|e| e == entity) {
            return Err(DbError::validation(format!(
                "Entity '{}' is not available on this connection",
                entity
            )));
        }
        Ok(())
    }

    fn now(&self) -> JsonValue {
        JsonValue::String(self.dialect().format_timestamp(Utc::now()))
    }

    fn entity_error(entity: &str, error: DbError) -> DbError {
        if error.is_undefined_entity() {
            DbError::validation(format!("Unknown entity '{}'", entity))
        } else {
            error
        }
    }

    async fn fetch(&self, conn: &mut SqlConn<'_>, entity: &str, stmt: &Statement) -> DbResult<Vec<Record>> {
        conn.fetch(stmt, self.query_timeout)
            .await
            .map_err(|e| Self::entity_error(entity, e))
    }

    async fn execute(&self, conn: &mut SqlConn<'_>, entity: &str, stmt: &Statement) -> DbResult<ExecOutcome> {
        conn.execute(stmt, self.query_timeout)
            .await
            .map_err(|e| Self::entity_error(entity, e))
    }

    fn require_conditions(operation: &str, conditions: &Conditions) -> DbResult<()> {
        if conditions.is_empty() {
            return Err(DbError::validation(format!(
                "{} requires at least one condition",
                operation
            )));
        }
        Ok(())
    }

    fn id_conditions(entity: &str, record: &Record) -> DbResult<Conditions> {
        let id = record
            .get(ID_FIELD)
            .filter(|id| !id.is_null())
            .ok_or_else(|| {
                DbError::validation(format!("Entity '{}' has no '{}' column", entity, ID_FIELD))
            })?;
        let mut conditions = Conditions::new();
        conditions.insert(ID_FIELD.to_string(), id.clone());
        Ok(conditions)
    }

    /// First matching record, optionally including soft-deleted rows.
    async fn first_match(
        &self,
        conn: &mut SqlConn<'_>,
        entity: &str,
        conditions: &Conditions,
        include_deleted: bool,
    ) -> DbResult<Option<Record>> {
        let live = if include_deleted {
            None
        } else {
            self.convention.live_column()
        };
        let options = FindOptions::new().with_limit(1);
        let stmt = self.builder.select(entity, conditions, &options, live)?;
        Ok(self.fetch(conn, entity, &stmt).await?.into_iter().next())
    }

    pub async fn find(
        &self,
        conn: &mut SqlConn<'_>,
        entity: &str,
        conditions: &Conditions,
        options: &FindOptions,
    ) -> DbResult<Vec<Record>> {
        self.check_entity(entity)?;
        let stmt = self
            .builder
            .select(entity, conditions, options, self.convention.live_column())?;
        self.fetch(conn, entity, &stmt).await
    }

    pub async fn find_one(
        &self,
        conn: &mut SqlConn<'_>,
        entity: &str,
        conditions: &Conditions,
    ) -> DbResult<Option<Record>> {
        self.check_entity(entity)?;
        self.first_match(conn, entity, conditions, false).await
    }

    pub async fn insert(&self, conn: &mut SqlConn<'_>, entity: &str, data: Record) -> DbResult<Record> {
        self.check_entity(entity)?;
        let data = self.convention.prepare_insert(data, &self.now());
        let stmt = self.builder.insert(entity, &data)?;

        if self.dialect() == Dialect::Postgres {
            return self
                .fetch(conn, entity, &stmt)
                .await?
                .into_iter()
                .next()
                .ok_or_else(|| DbError::internal("INSERT returned no row"));
        }

        let outcome = self.execute(conn, entity, &stmt).await?;
        let read_back = match (data.get(ID_FIELD), outcome.last_insert_id) {
            (Some(id), _) if !id.is_null() => {
                let conditions = Self::id_conditions(entity, &data)?;
                self.builder
                    .select(entity, &conditions, &FindOptions::new().with_limit(1), None)?
            }
            (_, Some(rowid)) if self.dialect() == Dialect::SQLite => {
                self.builder.select_by_rowid(entity, rowid)?
            }
            (_, Some(last_id)) => {
                let mut conditions = Conditions::new();
                conditions.insert(ID_FIELD.to_string(), JsonValue::from(last_id));
                self.builder
                    .select(entity, &conditions, &FindOptions::new().with_limit(1), None)?
            }
            _ => return Ok(data),
        };
        self.fetch(conn, entity, &read_back)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| DbError::internal(format!("Inserted record in '{}' could not be read back", entity)))
    }

    /// Insert every record in order. Atomicity is the caller's concern.
    pub async fn insert_each(
        &self,
        conn: &mut SqlConn<'_>,
        entity: &str,
        records: Vec<Record>,
    ) -> DbResult<Vec<Record>> {
        let mut inserted = Vec::with_capacity(records.len());
        for record in records {
            inserted.push(self.insert(conn, entity, record).await?);
        }
        Ok(inserted)
    }

    /// Insert every record inside a savepoint of an already open transaction.
    ///
    /// A failure rolls back to the savepoint, leaving the surrounding transaction usable.
    pub async fn insert_many_nested(
        &self,
        conn: &mut SqlConn<'_>,
        entity: &str,
        records: Vec<Record>,
    ) -> DbResult<Vec<Record>> {
        if records.is_empty() {
            return Ok(Vec::new());
        }
        let savepoint = format!("insert_many_{}", uuid::Uuid::new_v4().simple());
        let quoted = self.dialect().quote(&savepoint);
        conn.execute_raw(&format!("SAVEPOINT {}", quoted)).await?;

        match self.insert_each(conn, entity, records).await {
            Ok(inserted) => Ok(inserted),
            Err(e) => {
                if let Err(rollback_err) = conn
                    .execute_raw(&format!("ROLLBACK TO SAVEPOINT {}", quoted))
                    .await
                {
                    debug!(error = %rollback_err, "Failed to roll back insert_many savepoint");
                }
                Err(e)
            }
        }
    }

    /// Update the first live record matching `conditions`.
    pub async fn update(
        &self,
        conn: &mut SqlConn<'_>,
        entity: &str,
        conditions: &Conditions,
        data: Record,
    ) -> DbResult<Option<Record>> {
        self.check_entity(entity)?;
        Self::require_conditions("update", conditions)?;
        let data = self.convention.prepare_update(data, &self.now())?;

        let Some(target) = self.first_match(conn, entity, conditions, false).await? else {
            return Ok(None);
        };
        let by_id = Self::id_conditions(entity, &target)?;
        let stmt = self
            .builder
            .update(entity, &by_id, &data, self.convention.live_column())?;

        if self.dialect() == Dialect::Postgres {
            return Ok(self.fetch(conn, entity, &stmt).await?.into_iter().next());
        }
        if self.execute(conn, entity, &stmt).await?.rows_affected == 0 {
            return Ok(None);
        }
        self.first_match(conn, entity, &by_id, true).await
    }

    /// Delete the first record matching `conditions`.
    ///
    /// A soft delete only considers live records and stamps `deleted_at`. When the connection
    /// has soft delete switched off, every delete is a hard delete.
    pub async fn delete(
        &self,
        conn: &mut SqlConn<'_>,
        entity: &str,
        conditions: &Conditions,
        soft: bool,
    ) -> DbResult<bool> {
        self.check_entity(entity)?;
        Self::require_conditions("delete", conditions)?;
        let soft = soft && self.convention.soft_delete;

        let Some(target) = self.first_match(conn, entity, conditions, !soft).await? else {
            return Ok(false);
        };
        let by_id = Self::id_conditions(entity, &target)?;

        let stmt = if soft {
            let now = self.now();
            let mut data = Record::new();
            data.insert(DELETED_AT_FIELD.to_string(), now.clone());
            if self.convention.timestamps {
                data.insert(UPDATED_AT_FIELD.to_string(), now);
            }
            self.builder
                .update(entity, &by_id, &data, self.convention.live_column())?
        } else {
            self.builder.delete(entity, &by_id)?
        };
        Ok(self.execute(conn, entity, &stmt).await?.rows_affected == 1)
    }

    pub async fn count(
        &self,
        conn: &mut SqlConn<'_>,
        entity: &str,
        conditions: &Conditions,
    ) -> DbResult<u64> {
        self.check_entity(entity)?;
        let stmt = self
            .builder
            .count(entity, conditions, self.convention.live_column())?;
        let row = self.fetch(conn, entity, &stmt).await?.into_iter().next();
        row.as_ref()
            .and_then(|r| r.get("count"))
            .and_then(count_value)
            .ok_or_else(|| DbError::internal("COUNT returned no usable value"))
    }

    pub async fn aggregate(
        &self,
        conn: &mut SqlConn<'_>,
        entity: &str,
        pipeline: &[JsonValue],
    ) -> DbResult<Vec<Record>> {
        self.check_entity(entity)?;
        let stmt = self
            .builder
            .aggregate(entity, pipeline, self.convention.live_column())?;
        self.fetch(conn, entity, &stmt).await
    }

    /// Run one [`Operation`] on a connection that is already inside a transaction.
    pub async fn execute_operation(
        &self,
        conn: &mut SqlConn<'_>,
        operation: Operation,
    ) -> DbResult<OperationResult> {
        match operation {
            Operation::Find {
                entity,
                conditions,
                options,
            } => self
                .find(conn, &entity, &conditions, &options)
                .await
                .map(OperationResult::Records),
            Operation::FindOne { entity, conditions } => self
                .find_one(conn, &entity, &conditions)
                .await
                .map(OperationResult::Record),
            Operation::Insert { entity, data } => self
                .insert(conn, &entity, data)
                .await
                .map(|r| OperationResult::Record(Some(r))),
            Operation::InsertMany { entity, records } => {
                self.check_entity(&entity)?;
                self.insert_many_nested(conn, &entity, records)
                    .await
                    .map(OperationResult::Records)
            }
            Operation::Update {
                entity,
                conditions,
                data,
            } => self
                .update(conn, &entity, &conditions, data)
                .await
                .map(OperationResult::Record),
            Operation::Delete {
                entity,
                conditions,
                soft,
            } => self
                .delete(conn, &entity, &conditions, soft)
                .await
                .map(OperationResult::Deleted),
            Operation::Count { entity, conditions } => self
                .count(conn, &entity, &conditions)
                .await
                .map(OperationResult::Count),
            Operation::Aggregate { entity, pipeline } => self
                .aggregate(conn, &entity, &pipeline)
                .await
                .map(OperationResult::Records),
        }
    }
}

/// COUNT(*) arrives as an integer, or as a decimal string on some MySQL setups.
fn count_value(value: &JsonValue) -> Option<u64> {
    match value {
        JsonValue::Number(n) => n.as_u64(),
        JsonValue::String(s) => s.parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use sqlx::Connection;

    fn record(value: JsonValue) -> Record {
        value.as_object().cloned().unwrap()
    }

    async fn setup() -> SqliteConnection {
        let mut conn = SqliteConnection::connect("sqlite::memory:").await.unwrap();
        let mut sql_conn = SqlConn::SQLite(&mut conn);
        sql_conn
            .execute_raw(
                "CREATE TABLE users (id TEXT PRIMARY KEY, name TEXT, age INTEGER, \
                 created_at TEXT, updated_at TEXT, deleted_at TEXT)",
            )
            .await
            .unwrap();
        conn
    }

    fn executor() -> SqlExecutor {
        SqlExecutor::new(
            Dialect::SQLite,
            RecordConvention::default(),
            Duration::from_secs(5),
        )
    }

    #[test]
    fn test_convention_prepare_insert() {
        let convention = RecordConvention::default();
        let now = json!("2024-01-01 00:00:00");
        let data = convention.prepare_insert(record(json!({"name": "a"})), &now);
        assert!(data.get("id").and_then(|v| v.as_str()).is_some());
        assert_eq!(data.get("created_at"), Some(&now));
        assert_eq!(data.get("updated_at"), Some(&now));
        assert!(!data.contains_key("deleted_at"));

        let kept = convention.prepare_insert(record(json!({"id": "x"})), &now);
        assert_eq!(kept.get("id"), Some(&json!("x")));
    }

    #[test]
    fn test_convention_switched_off() {
        let convention = RecordConvention {
            timestamps: false,
            soft_delete: false,
            generate_ids: false,
        };
        let data = convention.prepare_insert(record(json!({"name": "a"})), &json!("now"));
        assert_eq!(data.len(), 1);
        assert_eq!(convention.live_column(), None);
    }

    #[test]
    fn test_update_rejects_id() {
        let convention = RecordConvention::default();
        let result = convention.prepare_update(record(json!({"id": "y"})), &json!("now"));
        assert!(matches!(result, Err(DbError::Validation { .. })));
    }

    #[test]
    fn test_count_value() {
        assert_eq!(count_value(&json!(3)), Some(3));
        assert_eq!(count_value(&json!("42")), Some(42));
        assert_eq!(count_value(&json!(null)), None);
    }

    #[tokio::test]
    async fn test_insert_find_update_delete() {
        let mut raw = setup().await;
        let mut conn = SqlConn::SQLite(&mut raw);
        let exec = executor();

        let inserted = exec
            .insert(&mut conn, "users", record(json!({"age": 30, "name": "Ada"})))
            .await
            .unwrap();
        let id = inserted.get("id").cloned().unwrap();
        assert_eq!(inserted.get("name"), Some(&json!("Ada")));
        assert_eq!(inserted.get("deleted_at"), Some(&JsonValue::Null));

        let by_id = record(json!({"id": id}));
        let found = exec.find_one(&mut conn, "users", &by_id).await.unwrap();
        assert_eq!(found, Some(inserted.clone()));

        let updated = exec
            .update(&mut conn, "users", &by_id, record(json!({"age": 31})))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.get("age"), Some(&json!(31)));

        assert!(exec.delete(&mut conn, "users", &by_id, true).await.unwrap());
        assert!(!exec.delete(&mut conn, "users", &by_id, true).await.unwrap());
        assert_eq!(exec.count(&mut conn, "users", &Conditions::new()).await.unwrap(), 0);

        // the soft-deleted row is still there for a hard delete
        assert!(exec.delete(&mut conn, "users", &by_id, false).await.unwrap());
        assert!(!exec.delete(&mut conn, "users", &by_id, false).await.unwrap());
    }

    #[tokio::test]
    async fn test_update_requires_conditions() {
        let mut raw = setup().await;
        let mut conn = SqlConn::SQLite(&mut raw);
        let exec = executor();
        exec.insert(&mut conn, "users", record(json!({"name": "a"})))
            .await
            .unwrap();

        let result = exec
            .update(&mut conn, "users", &Conditions::new(), record(json!({"name": "b"})))
            .await;
        assert!(matches!(result, Err(DbError::Validation { .. })));

        let names = exec
            .find(&mut conn, "users", &record(json!({"name": "a"})), &FindOptions::new())
            .await
            .unwrap();
        assert_eq!(names.len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_entity_is_validation_error() {
        let mut raw = setup().await;
        let mut conn = SqlConn::SQLite(&mut raw);
        let exec = executor();

        let missing = exec.insert(&mut conn, "ghosts", Record::new()).await;
        assert!(matches!(missing, Err(DbError::Validation { .. })));

        let invalid = exec.find(&mut conn, "users; DROP", &Conditions::new(), &FindOptions::new()).await;
        assert!(matches!(invalid, Err(DbError::Validation { .. })));

        let restricted = executor().with_entities(vec!["orders".to_string()]);
        let denied = restricted.count(&mut conn, "users", &Conditions::new()).await;
        assert!(matches!(denied, Err(DbError::Validation { .. })));
    }

    #[tokio::test]
    async fn test_insert_many_nested_rolls_back_to_savepoint() {
        let mut raw = setup().await;
        let mut tx = sqlx::Connection::begin(&mut raw).await.unwrap();
        let mut conn = SqlConn::SQLite(&mut *tx);
        let exec = executor();

        exec.insert(&mut conn, "users", record(json!({"id": "keep"})))
            .await
            .unwrap();
        let batch = vec![record(json!({"id": "n1"})), record(json!({"id": "keep"}))];
        assert!(exec.insert_many_nested(&mut conn, "users", batch).await.is_err());

        let count = exec.count(&mut conn, "users", &Conditions::new()).await.unwrap();
        assert_eq!(count, 1);
        drop(conn);
        tx.commit().await.unwrap();
    }
}
