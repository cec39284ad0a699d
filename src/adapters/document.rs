//! MongoDB document-store adapter.
//!
//! Records map onto documents with `id` stored as `_id`. Timestamps are written as BSON dates
//! and read back as RFC 3339 strings, so records look the same as on the SQL adapters.
//! Transactions run on a `ClientSession` and need a replica set; savepoints do not exist.

use crate::db::adapter::{AdapterFactory, DatabaseAdapter, health_check_timeout};
use crate::db::executor::{
    CREATED_AT_FIELD, DELETED_AT_FIELD, ID_FIELD, RecordConvention, UPDATED_AT_FIELD,
    timeout_error,
};
use crate::db::optimizer::{QueryOptimizer, RowCount, TRANSACTION_ENTITY};
use crate::db::sql::validate_identifier;
use crate::db::transaction::{NativeTransaction, TransactionContext, TransactionCoordinator};
use crate::db::types::encode_binary;
use crate::error::{DbError, DbResult};
use crate::models::record::{
    condition_descriptor, delete_descriptor, find_descriptor, insert_descriptor,
    insert_many_descriptor, pipeline_descriptor, update_descriptor,
};
use crate::models::{
    Conditions, ConnectionConfig, ConnectionKind, FindOptions, Operation, OperationResult,
    ProviderKind, Record, SortDirection,
};
use async_trait::async_trait;
use futures_util::TryStreamExt;
use mongodb::bson::{self, Bson, Document, doc, oid::ObjectId};
use mongodb::options::{ClientOptions, ReturnDocument};
use mongodb::{Client, ClientSession, Collection, Database};
use serde_json::Value as JsonValue;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const MONGO_ID: &str = "_id";
const APP_NAME: &str = "database-core";

/// Run a driver action, attaching the session when there is one.
macro_rules! with_session {
    ($action:expr, $session:expr) => {
        match $session {
            Some(session) => $action.session(&mut **session).await,
            None => $action.await,
        }
    };
}

// =============================================================================
// Record <-> Document
// =============================================================================

fn document_key(key: &str) -> &str {
    if key == ID_FIELD { MONGO_ID } else { key }
}

fn to_document(record: &Record) -> DbResult<Document> {
    let mut document = Document::new();
    for (key, value) in record {
        document.insert(document_key(key), bson::to_bson(value)?);
    }
    Ok(document)
}

/// Equality filter. String ids also match the equivalent `ObjectId`.
fn to_filter(conditions: &Conditions, live: Option<&str>) -> DbResult<Document> {
    let mut filter = Document::new();
    for (key, value) in conditions {
        let key = document_key(key);
        let mut condition = bson::to_bson(value)?;
        if key == MONGO_ID {
            if let Some(oid) = value.as_str().and_then(|s| ObjectId::parse_str(s).ok()) {
                condition = Bson::Document(doc! { "$in": [condition, oid] });
            }
        }
        filter.insert(key, condition);
    }
    if let Some(column) = live {
        filter.insert(column, Bson::Null);
    }
    Ok(filter)
}

fn bson_to_json(value: Bson) -> JsonValue {
    match value {
        Bson::ObjectId(oid) => JsonValue::String(oid.to_hex()),
        Bson::DateTime(dt) => dt
            .try_to_rfc3339_string()
            .map(JsonValue::String)
            .unwrap_or_else(|_| JsonValue::from(dt.timestamp_millis())),
        Bson::Document(document) => JsonValue::Object(
            document
                .into_iter()
                .map(|(k, v)| (k, bson_to_json(v)))
                .collect(),
        ),
        Bson::Array(items) => JsonValue::Array(items.into_iter().map(bson_to_json).collect()),
        Bson::Binary(binary) => encode_binary(&binary.bytes),
        other => other.into_relaxed_extjson(),
    }
}

fn from_document(document: Document) -> Record {
    document
        .into_iter()
        .map(|(key, value)| {
            let key = if key == MONGO_ID { ID_FIELD.to_string() } else { key };
            (key, bson_to_json(value))
        })
        .collect()
}

fn sort_document(options: &FindOptions) -> Option<Document> {
    if options.order_by.is_empty() {
        return None;
    }
    let mut sort = Document::new();
    for order in &options.order_by {
        let direction = match order.direction {
            SortDirection::Asc => 1,
            SortDirection::Desc => -1,
        };
        sort.insert(document_key(&order.field), direction);
    }
    Some(sort)
}

// =============================================================================
// Native Transaction
// =============================================================================

/// A started MongoDB transaction on its session.
pub struct MongoTransaction {
    session: ClientSession,
}

#[async_trait]
impl NativeTransaction for MongoTransaction {
    async fn savepoint(&mut self, _name: &str) -> DbResult<()> {
        Err(DbError::unsupported("create_savepoint", ProviderKind::DocumentStore))
    }

    async fn rollback_to_savepoint(&mut self, _name: &str) -> DbResult<()> {
        Err(DbError::unsupported("rollback_to_savepoint", ProviderKind::DocumentStore))
    }

    async fn commit(mut self) -> DbResult<()> {
        self.session.commit_transaction().await?;
        Ok(())
    }

    async fn rollback(mut self) -> DbResult<()> {
        self.session.abort_transaction().await?;
        Ok(())
    }
}

// =============================================================================
// Document Executor
// =============================================================================

/// `$set` update marking a record deleted at `now`.
fn soft_delete_update(convention: &RecordConvention, now: bson::DateTime) -> Document {
    let mut set = doc! { DELETED_AT_FIELD: now };
    if convention.timestamps {
        set.insert(UPDATED_AT_FIELD, now);
    }
    doc! { "$set": set }
}

/// Record-level CRUD against one MongoDB database.
struct DocumentExecutor {
    database: Database,
    convention: RecordConvention,
    query_timeout: Duration,
    entities: Vec<String>,
}

impl DocumentExecutor {
    fn collection(&self, entity: &str) -> DbResult<Collection<Document>> {
        validate_identifier(entity)?;
        if !self.entities.is_empty() && !self.entities.iter().any(|e| e == entity) {
            return Err(DbError::validation(format!(
                "Entity '{}' is not available on this connection",
                entity
            )));
        }
        Ok(self.database.collection(entity))
    }

    fn live(&self) -> Option<&'static str> {
        self.convention.live_column()
    }

    async fn bounded<T>(&self, operation: &str, future: impl Future<Output = DbResult<T>>) -> DbResult<T> {
        match tokio::time::timeout(self.query_timeout, future).await {
            Ok(result) => result,
            Err(_) => Err(timeout_error(operation, self.query_timeout)),
        }
    }

    fn prepare_insert(&self, data: &Record, now: bson::DateTime) -> DbResult<Document> {
        let mut document = to_document(data)?;
        if self.convention.generate_ids && !document.contains_key(MONGO_ID) {
            document.insert(MONGO_ID, uuid::Uuid::new_v4().to_string());
        }
        if self.convention.timestamps {
            for field in [CREATED_AT_FIELD, UPDATED_AT_FIELD] {
                if !document.contains_key(field) {
                    document.insert(field, now);
                }
            }
        }
        Ok(document)
    }

    fn prepare_update(&self, data: &Record, now: bson::DateTime) -> DbResult<Document> {
        if data.contains_key(ID_FIELD) || data.contains_key(MONGO_ID) {
            return Err(DbError::validation("The id field cannot be updated"));
        }
        let mut set = to_document(data)?;
        if self.convention.timestamps {
            set.insert(UPDATED_AT_FIELD, now);
        }
        if set.is_empty() {
            return Err(DbError::validation("update requires at least one field"));
        }
        Ok(set)
    }

    async fn find(
        &self,
        session: Option<&mut ClientSession>,
        entity: &str,
        conditions: &Conditions,
        options: &FindOptions,
    ) -> DbResult<Vec<Record>> {
        let collection = self.collection(entity)?;
        let filter = to_filter(conditions, self.live())?;
        self.bounded("find", async {
            let mut action = collection.find(filter);
            if let Some(limit) = options.limit {
                action = action.limit(i64::try_from(limit).unwrap_or(i64::MAX));
            }
            if let Some(offset) = options.offset {
                action = action.skip(offset);
            }
            if let Some(sort) = sort_document(options) {
                action = action.sort(sort);
            }
            let documents: Vec<Document> = match session {
                Some(session) => {
                    let mut cursor = action.session(&mut *session).await?;
                    cursor.stream(session).try_collect().await?
                }
                None => action.await?.try_collect().await?,
            };
            Ok(documents.into_iter().map(from_document).collect())
        })
        .await
    }

    async fn find_one(
        &self,
        mut session: Option<&mut ClientSession>,
        entity: &str,
        conditions: &Conditions,
    ) -> DbResult<Option<Record>> {
        let collection = self.collection(entity)?;
        let filter = to_filter(conditions, self.live())?;
        self.bounded("find_one", async {
            let found = with_session!(collection.find_one(filter), session.as_mut())?;
            Ok(found.map(from_document))
        })
        .await
    }

    async fn insert(
        &self,
        mut session: Option<&mut ClientSession>,
        entity: &str,
        data: Record,
    ) -> DbResult<Record> {
        let collection = self.collection(entity)?;
        let mut document = self.prepare_insert(&data, bson::DateTime::now())?;
        self.bounded("insert", async {
            let result = with_session!(collection.insert_one(&document), session.as_mut())?;
            if !document.contains_key(MONGO_ID) {
                document.insert(MONGO_ID, result.inserted_id);
            }
            Ok(from_document(document))
        })
        .await
    }

    /// Insert in order on the given session.
    async fn insert_all(
        &self,
        session: &mut ClientSession,
        entity: &str,
        records: Vec<Record>,
    ) -> DbResult<Vec<Record>> {
        let collection = self.collection(entity)?;
        let now = bson::DateTime::now();
        let documents = records
            .iter()
            .map(|record| self.prepare_insert(record, now))
            .collect::<DbResult<Vec<_>>>()?;
        self.bounded("insert_many", async {
            let result = collection.insert_many(&documents).session(&mut *session).await?;
            Ok(documents
                .into_iter()
                .enumerate()
                .map(|(index, mut document)| {
                    if !document.contains_key(MONGO_ID) {
                        if let Some(id) = result.inserted_ids.get(&index) {
                            document.insert(MONGO_ID, id.clone());
                        }
                    }
                    from_document(document)
                })
                .collect())
        })
        .await
    }

    /// Insert one by one without a transaction, deleting what was written if any insert fails.
    async fn insert_compensated(&self, entity: &str, records: Vec<Record>) -> DbResult<Vec<Record>> {
        let collection = self.collection(entity)?;
        let now = bson::DateTime::now();
        let mut written: Vec<Bson> = Vec::with_capacity(records.len());
        let mut stored = Vec::with_capacity(records.len());

        let result = self
            .bounded("insert_many", async {
                for record in &records {
                    let mut document = self.prepare_insert(record, now)?;
                    let inserted = collection.insert_one(&document).await?;
                    written.push(inserted.inserted_id.clone());
                    if !document.contains_key(MONGO_ID) {
                        document.insert(MONGO_ID, inserted.inserted_id);
                    }
                    stored.push(from_document(document));
                }
                Ok(())
            })
            .await;

        if let Err(e) = result {
            if !written.is_empty() {
                let cleanup = collection
                    .delete_many(doc! { MONGO_ID: { "$in": written } })
                    .await;
                if let Err(cleanup_err) = cleanup {
                    warn!(entity = %entity, error = %cleanup_err, "Failed to remove partially inserted documents");
                }
            }
            return Err(e);
        }
        Ok(stored)
    }

    async fn update(
        &self,
        mut session: Option<&mut ClientSession>,
        entity: &str,
        conditions: &Conditions,
        data: Record,
    ) -> DbResult<Option<Record>> {
        require_conditions("update", conditions)?;
        let collection = self.collection(entity)?;
        let filter = to_filter(conditions, self.live())?;
        let set = self.prepare_update(&data, bson::DateTime::now())?;
        self.bounded("update", async {
            let action = collection
                .find_one_and_update(filter, doc! { "$set": set })
                .return_document(ReturnDocument::After);
            let updated = with_session!(action, session.as_mut())?;
            Ok(updated.map(from_document))
        })
        .await
    }

    async fn delete(
        &self,
        mut session: Option<&mut ClientSession>,
        entity: &str,
        conditions: &Conditions,
        soft: bool,
    ) -> DbResult<bool> {
        require_conditions("delete", conditions)?;
        let collection = self.collection(entity)?;
        self.bounded("delete", async {
            if soft && self.convention.soft_delete {
                let filter = to_filter(conditions, Some(DELETED_AT_FIELD))?;
                let update = soft_delete_update(&self.convention, bson::DateTime::now());
                let marked = with_session!(
                    collection.find_one_and_update(filter, update),
                    session.as_mut()
                )?;
                Ok(marked.is_some())
            } else {
                let filter = to_filter(conditions, None)?;
                let result = with_session!(collection.delete_one(filter), session.as_mut())?;
                Ok(result.deleted_count == 1)
            }
        })
        .await
    }

    async fn count(
        &self,
        mut session: Option<&mut ClientSession>,
        entity: &str,
        conditions: &Conditions,
    ) -> DbResult<u64> {
        let collection = self.collection(entity)?;
        let filter = to_filter(conditions, self.live())?;
        self.bounded("count", async {
            Ok(with_session!(collection.count_documents(filter), session.as_mut())?)
        })
        .await
    }

    async fn aggregate(
        &self,
        session: Option<&mut ClientSession>,
        entity: &str,
        pipeline: &[JsonValue],
    ) -> DbResult<Vec<Record>> {
        let collection = self.collection(entity)?;
        let mut stages = Vec::with_capacity(pipeline.len() + 1);
        if let Some(column) = self.live() {
            stages.push(doc! { "$match": { column: Bson::Null } });
        }
        for stage in pipeline {
            match bson::to_bson(stage)? {
                Bson::Document(stage) => stages.push(stage),
                _ => return Err(DbError::validation("Each pipeline stage must be an object")),
            }
        }
        self.bounded("aggregate", async {
            let action = collection.aggregate(stages);
            let documents: Vec<Document> = match session {
                Some(session) => {
                    let mut cursor = action.session(&mut *session).await?;
                    cursor.stream(session).try_collect().await?
                }
                None => action.await?.try_collect().await?,
            };
            Ok(documents.into_iter().map(from_document).collect())
        })
        .await
    }
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

// =============================================================================
// Adapter
// =============================================================================

/// Adapter for `document-store` connections.
pub struct DocumentAdapter {
    connection_id: String,
    client: Client,
    executor: DocumentExecutor,
    transactions: TransactionCoordinator<MongoTransaction>,
    optimizer: Arc<QueryOptimizer>,
    supports_transactions: bool,
    health_timeout: Duration,
}

impl DocumentAdapter {
    /// Validate the settings and build a client. Sockets are opened on first use.
    pub async fn connect(config: &ConnectionConfig, optimizer: Arc<QueryOptimizer>) -> DbResult<Self> {
        if config.provider != ProviderKind::DocumentStore {
            return Err(DbError::config(format!(
                "Document adapter cannot serve {} connections",
                config.provider
            )));
        }
        if config.kind != ConnectionKind::External {
            return Err(DbError::config("Document store connections must be external"));
        }

        let options = client_options(config).await?;
        let database_name = config.require_str("database")?;
        if database_name.contains(['/', '\\', '.', ' ', '"', '$']) {
            return Err(DbError::config(format!(
                "Invalid database name '{}'",
                database_name
            )));
        }

        let supports_transactions = options.repl_set_name.is_some();
        let client = Client::with_options(options)
            .map_err(|e| DbError::config(format!("Invalid MongoDB client options: {}", e)))?;
        let database = client.database(database_name);

        info!(
            connection_id = %config.id,
            database = %database_name,
            pool_size = config.pool_size,
            transactions = supports_transactions,
            "MongoDB client created"
        );

        Ok(Self {
            connection_id: config.id.clone(),
            executor: DocumentExecutor {
                database,
                convention: RecordConvention::from_config(config),
                query_timeout: Duration::from_secs(config.timeout_secs),
                entities: config.entities.clone(),
            },
            client,
            transactions: TransactionCoordinator::new(&config.id, config.transaction_timeout_secs),
            optimizer,
            supports_transactions,
            health_timeout: health_check_timeout(config),
        })
    }

    pub fn database_name(&self) -> &str {
        self.executor.database.name()
    }

    async fn observe<T, F>(&self, entity: &str, operation: &str, descriptor: String, future: F) -> DbResult<T>
    where
        T: RowCount,
        F: Future<Output = DbResult<T>>,
    {
        self.optimizer
            .observe(&self.connection_id, entity, operation, descriptor, future)
            .await
    }

    fn require_transactions(&self, operation: &str) -> DbResult<()> {
        if self.supports_transactions {
            Ok(())
        } else {
            Err(DbError::unsupported(operation, ProviderKind::DocumentStore))
        }
    }

    async fn run_operation(
        &self,
        session: &mut ClientSession,
        operation: Operation,
    ) -> DbResult<OperationResult> {
        let executor = &self.executor;
        Ok(match operation {
            Operation::Find {
                entity,
                conditions,
                options,
            } => OperationResult::Records(
                executor.find(Some(session), &entity, &conditions, &options).await?,
            ),
            Operation::FindOne { entity, conditions } => {
                OperationResult::Record(executor.find_one(Some(session), &entity, &conditions).await?)
            }
            Operation::Insert { entity, data } => {
                OperationResult::Record(Some(executor.insert(Some(session), &entity, data).await?))
            }
            Operation::InsertMany { records, .. } if records.is_empty() => {
                OperationResult::Records(Vec::new())
            }
            Operation::InsertMany { entity, records } => {
                OperationResult::Records(executor.insert_all(session, &entity, records).await?)
            }
            Operation::Update {
                entity,
                conditions,
                data,
            } => OperationResult::Record(
                executor.update(Some(session), &entity, &conditions, data).await?,
            ),
            Operation::Delete {
                entity,
                conditions,
                soft,
            } => OperationResult::Deleted(
                executor.delete(Some(session), &entity, &conditions, soft).await?,
            ),
            Operation::Count { entity, conditions } => {
                OperationResult::Count(executor.count(Some(session), &entity, &conditions).await?)
            }
            Operation::Aggregate { entity, pipeline } => {
                OperationResult::Records(executor.aggregate(Some(session), &entity, &pipeline).await?)
            }
        })
    }

    async fn start_transaction(&self) -> DbResult<MongoTransaction> {
        let mut session = self.client.start_session().await?;
        session.start_transaction().await?;
        Ok(MongoTransaction { session })
    }
}

#[async_trait]
impl DatabaseAdapter for DocumentAdapter {
    fn connection_id(&self) -> &str {
        &self.connection_id
    }

    fn provider(&self) -> ProviderKind {
        ProviderKind::DocumentStore
    }

    async fn find(
        &self,
        entity: &str,
        conditions: &Conditions,
        options: &FindOptions,
    ) -> DbResult<Vec<Record>> {
        let descriptor = find_descriptor(entity, conditions, options);
        self.observe(
            entity,
            "find",
            descriptor,
            self.executor.find(None, entity, conditions, options),
        )
        .await
    }

    async fn find_one(&self, entity: &str, conditions: &Conditions) -> DbResult<Option<Record>> {
        let descriptor = condition_descriptor("find_one", entity, conditions);
        self.observe(
            entity,
            "find_one",
            descriptor,
            self.executor.find_one(None, entity, conditions),
        )
        .await
    }

    async fn insert(&self, entity: &str, data: Record) -> DbResult<Record> {
        let descriptor = insert_descriptor(entity, &data);
        self.observe(entity, "insert", descriptor, self.executor.insert(None, entity, data))
            .await
    }

    async fn insert_many(&self, entity: &str, records: Vec<Record>) -> DbResult<Vec<Record>> {
        let descriptor = insert_many_descriptor(entity, records.len());
        self.observe(entity, "insert_many", descriptor, async {
            if records.is_empty() {
                return Ok(Vec::new());
            }
            if !self.supports_transactions {
                return self.executor.insert_compensated(entity, records).await;
            }

            let mut tx = self.start_transaction().await?;
            match self.executor.insert_all(&mut tx.session, entity, records).await {
                Ok(stored) => {
                    tx.commit().await?;
                    Ok(stored)
                }
                Err(e) => {
                    if let Err(abort_err) = tx.rollback().await {
                        debug!(error = %abort_err, "Implicit transaction abort failed");
                    }
                    Err(e)
                }
            }
        })
        .await
    }

    async fn update(
        &self,
        entity: &str,
        conditions: &Conditions,
        data: Record,
    ) -> DbResult<Option<Record>> {
        let descriptor = update_descriptor(entity, conditions, &data);
        self.observe(
            entity,
            "update",
            descriptor,
            self.executor.update(None, entity, conditions, data),
        )
        .await
    }

    async fn delete(&self, entity: &str, conditions: &Conditions, soft: bool) -> DbResult<bool> {
        let descriptor = delete_descriptor(entity, conditions, soft);
        self.observe(
            entity,
            "delete",
            descriptor,
            self.executor.delete(None, entity, conditions, soft),
        )
        .await
    }

    async fn count(&self, entity: &str, conditions: &Conditions) -> DbResult<u64> {
        let descriptor = condition_descriptor("count", entity, conditions);
        self.observe(
            entity,
            "count",
            descriptor,
            self.executor.count(None, entity, conditions),
        )
        .await
    }

    async fn aggregate(&self, entity: &str, pipeline: &[JsonValue]) -> DbResult<Vec<Record>> {
        let descriptor = pipeline_descriptor(entity, pipeline);
        self.observe(
            entity,
            "aggregate",
            descriptor,
            self.executor.aggregate(None, entity, pipeline),
        )
        .await
    }

    async fn begin_transaction(&self) -> DbResult<TransactionContext> {
        self.observe(TRANSACTION_ENTITY, "begin_transaction", "begin_transaction".into(), async {
            self.require_transactions("begin_transaction")?;
            let tx = self.start_transaction().await?;
            Ok(self.transactions.register(tx).await)
        })
        .await
    }

    async fn execute_in_transaction(
        &self,
        ctx: &TransactionContext,
        operation: Operation,
    ) -> DbResult<OperationResult> {
        let entity = operation.entity().to_string();
        let name = operation.name();
        let descriptor = operation.descriptor();
        self.observe(&entity, name, descriptor, async {
            self.require_transactions("execute_in_transaction")?;
            let mut guard = self.transactions.acquire(ctx).await?;
            let tx = guard.native()?;
            self.run_operation(&mut tx.session, operation).await
        })
        .await
    }

    async fn commit_transaction(&self, ctx: &TransactionContext) -> DbResult<()> {
        self.observe(TRANSACTION_ENTITY, "commit", "commit".into(), async {
            self.require_transactions("commit_transaction")?;
            self.transactions.commit(ctx).await
        })
        .await
    }

    async fn rollback_transaction(&self, ctx: &TransactionContext) -> DbResult<()> {
        self.observe(TRANSACTION_ENTITY, "rollback", "rollback".into(), async {
            self.require_transactions("rollback_transaction")?;
            self.transactions.rollback(ctx).await
        })
        .await
    }

    async fn create_savepoint(&self, _ctx: &TransactionContext, _name: &str) -> DbResult<String> {
        self.observe(TRANSACTION_ENTITY, "create_savepoint", "create_savepoint".into(), async {
            Err(DbError::unsupported("create_savepoint", ProviderKind::DocumentStore))
        })
        .await
    }

    async fn rollback_to_savepoint(&self, _ctx: &TransactionContext, _savepoint: &str) -> DbResult<()> {
        self.observe(
            TRANSACTION_ENTITY,
            "rollback_to_savepoint",
            "rollback_to_savepoint".into(),
            async {
                Err(DbError::unsupported(
                    "rollback_to_savepoint",
                    ProviderKind::DocumentStore,
                ))
            },
        )
        .await
    }

    fn supports_transactions(&self) -> bool {
        self.supports_transactions
    }

    async fn ping(&self) -> DbResult<()> {
        let cleaned = self.transactions.cleanup_expired().await;
        if cleaned > 0 {
            debug!(connection_id = %self.connection_id, cleaned, "Expired transactions cleaned up");
        }
        self.executor
            .database
            .run_command(doc! { "ping": 1 })
            .await?;
        Ok(())
    }

    fn health_check_timeout(&self) -> Duration {
        self.health_timeout
    }

    async fn close(&self) {
        self.transactions.abort_all().await;
        self.client.clone().shutdown().immediate(true).await;
        info!(connection_id = %self.connection_id, "MongoDB client closed");
    }
}

/// Parse the URI and apply pool, timeout and replica-set settings.
async fn client_options(config: &ConnectionConfig) -> DbResult<ClientOptions> {
    let uri = config.require_str("uri")?;
    if !(uri.starts_with("mongodb://") || uri.starts_with("mongodb+srv://")) {
        return Err(DbError::config(
            "The uri must start with mongodb:// or mongodb+srv://",
        ));
    }

    let mut options = ClientOptions::parse(uri)
        .await
        .map_err(|e| DbError::config(format!("Invalid MongoDB uri: {}", e)))?;

    if let Some(replica_set) = config.setting_str("replica_set") {
        options.repl_set_name = Some(replica_set.to_string());
    }
    let timeout = Duration::from_secs(config.timeout_secs);
    options.max_pool_size = Some(config.pool_size);
    options.min_pool_size = Some(config.pool_options.min_connections_or_default());
    options.max_idle_time = Some(config.pool_options.idle_timeout_or_default());
    options.connect_timeout = Some(timeout);
    options.server_selection_timeout = Some(timeout);
    if options.app_name.is_none() {
        options.app_name = Some(APP_NAME.to_string());
    }
    Ok(options)
}

/// Builds [`DocumentAdapter`]s.
#[derive(Debug, Default, Clone, Copy)]
pub struct DocumentFactory;

#[async_trait]
impl AdapterFactory for DocumentFactory {
    async fn create(
        &self,
        config: &ConnectionConfig,
        optimizer: Arc<QueryOptimizer>,
    ) -> DbResult<Arc<dyn DatabaseAdapter>> {
        Ok(Arc::new(DocumentAdapter::connect(config, optimizer).await?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn document_store(settings: serde_json::Value) -> ConnectionConfig {
        ConnectionConfig::new(
            "docs",
            ProviderKind::DocumentStore,
            ConnectionKind::External,
            settings.as_object().cloned().unwrap(),
        )
    }

    #[tokio::test]
    async fn test_requires_uri_and_database() {
        let err = DocumentAdapter::connect(&document_store(json!({"database": "app"})), Arc::default())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, DbError::ConfigValidation { .. }));
        assert!(err.to_string().contains("uri"));

        let err = DocumentAdapter::connect(
            &document_store(json!({"uri": "mongodb://localhost:27017"})),
            Arc::default(),
        )
        .await
        .err()
        .unwrap();
        assert!(err.to_string().contains("database"));

        let err = DocumentAdapter::connect(
            &document_store(json!({"database": "app", "uri": "postgres://localhost/app"})),
            Arc::default(),
        )
        .await
        .err()
        .unwrap();
        assert!(matches!(err, DbError::ConfigValidation { .. }));
    }

    #[tokio::test]
    async fn test_embedded_rejected() {
        let mut config = document_store(json!({
            "database": "app",
            "uri": "mongodb://localhost:27017"
        }));
        config.kind = ConnectionKind::Embedded;
        assert!(DocumentAdapter::connect(&config, Arc::default()).await.is_err());
    }

    #[tokio::test]
    async fn test_transactions_need_replica_set() {
        let standalone = DocumentAdapter::connect(
            &document_store(json!({"database": "app", "uri": "mongodb://localhost:27017"})),
            Arc::default(),
        )
        .await
        .unwrap();
        assert!(!standalone.supports_transactions());
        let err = standalone.begin_transaction().await.unwrap_err();
        assert!(matches!(err, DbError::UnsupportedOperation { .. }));
        standalone.close().await;

        let from_uri = DocumentAdapter::connect(
            &document_store(json!({
                "database": "app",
                "uri": "mongodb://localhost:27017/?replicaSet=rs0"
            })),
            Arc::default(),
        )
        .await
        .unwrap();
        assert!(from_uri.supports_transactions());
        from_uri.close().await;

        let from_setting = DocumentAdapter::connect(
            &document_store(json!({
                "database": "app",
                "replica_set": "rs0",
                "uri": "mongodb://localhost:27017"
            })),
            Arc::default(),
        )
        .await
        .unwrap();
        assert!(from_setting.supports_transactions());
        assert_eq!(from_setting.database_name(), "app");
        from_setting.close().await;
    }

    #[tokio::test]
    async fn test_invalid_entity_is_validation_error() {
        let adapter = DocumentAdapter::connect(
            &document_store(json!({"database": "app", "uri": "mongodb://localhost:27017"}))
                .with_entities(["users"]),
            Arc::default(),
        )
        .await
        .unwrap();
        let err = adapter.find_one("bad name", &Conditions::new()).await.unwrap_err();
        assert!(matches!(err, DbError::Validation { .. }));
        let err = adapter.count("orders", &Conditions::new()).await.unwrap_err();
        assert!(matches!(err, DbError::Validation { .. }));
        let err = adapter
            .update("users", &Conditions::new(), Record::new())
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::Validation { .. }));
        adapter.close().await;
    }

    #[test]
    fn test_record_mapping() {
        let record = json!({"id": "u1", "name": "Ada", "tags": ["a", "b"]});
        let document = to_document(record.as_object().unwrap()).unwrap();
        assert_eq!(document.get_str("_id").unwrap(), "u1");
        assert!(!document.contains_key("id"));

        let oid = ObjectId::new();
        let stored = doc! {
            "_id": oid,
            "created_at": bson::DateTime::from_millis(0),
            "name": "Ada",
        };
        let record = from_document(stored);
        assert_eq!(record["id"], json!(oid.to_hex()));
        assert_eq!(record["created_at"], json!("1970-01-01T00:00:00Z"));
        assert_eq!(record["name"], json!("Ada"));
    }

    #[test]
    fn test_soft_delete_stamps_updated_at() {
        let now = bson::DateTime::from_millis(1_000);
        let update = soft_delete_update(&RecordConvention::default(), now);
        let set = update.get_document("$set").unwrap();
        assert_eq!(set.get_datetime(DELETED_AT_FIELD).unwrap(), &now);
        assert_eq!(set.get_datetime(UPDATED_AT_FIELD).unwrap(), &now);

        let convention = RecordConvention {
            timestamps: false,
            ..RecordConvention::default()
        };
        let update = soft_delete_update(&convention, now);
        let set = update.get_document("$set").unwrap();
        assert_eq!(set.get_datetime(DELETED_AT_FIELD).unwrap(), &now);
        assert!(!set.contains_key(UPDATED_AT_FIELD));
    }

    #[test]
    fn test_filter_matches_object_ids_and_live_rows() {
        let oid = ObjectId::new();
        let conditions = json!({"id": oid.to_hex()});
        let filter = to_filter(conditions.as_object().unwrap(), Some(DELETED_AT_FIELD)).unwrap();
        let id_filter = filter.get_document("_id").unwrap();
        assert_eq!(id_filter.get_array("$in").unwrap().len(), 2);
        assert_eq!(filter.get("deleted_at"), Some(&Bson::Null));

        let conditions = json!({"id": "plain"});
        let filter = to_filter(conditions.as_object().unwrap(), None).unwrap();
        assert_eq!(filter.get_str("_id").unwrap(), "plain");
        assert!(!filter.contains_key("deleted_at"));
    }

    #[test]
    fn test_sort_document() {
        use crate::models::OrderBy;
        assert!(sort_document(&FindOptions::new()).is_none());
        let options = FindOptions::new()
            .order_by(OrderBy::desc("id"))
            .order_by(OrderBy::asc("name"));
        let sort = sort_document(&options).unwrap();
        assert_eq!(sort, doc! { "_id": -1, "name": 1 });
    }
}
