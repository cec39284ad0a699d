//! Shared implementation behind the SQL adapters.
//!
//! [`SqlStore`] owns the pool, the record-level executor and the transaction coordinator for
//! one SQL connection. Standalone writes that touch more than one row run in an implicit
//! transaction; writes submitted through a [`TransactionContext`] run on its pinned
//! connection.

use crate::db::adapter::health_check_timeout;
use crate::db::executor::{RecordConvention, SqlExecutor};
use crate::db::optimizer::{QueryOptimizer, RowCount, TRANSACTION_ENTITY};
use crate::db::pool::{DbPool, DbTransaction};
use crate::db::transaction::{NativeTransaction, TransactionContext, TransactionCoordinator, TransactionInfo};
use crate::error::DbResult;
use crate::models::record::{
    condition_descriptor, delete_descriptor, find_descriptor, insert_descriptor,
    insert_many_descriptor, pipeline_descriptor, update_descriptor,
};
use crate::models::{
    Conditions, ConnectionConfig, FindOptions, Operation, OperationResult, ProviderKind, Record,
};
use serde_json::Value as JsonValue;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

pub struct SqlStore {
    connection_id: String,
    provider: ProviderKind,
    pool: DbPool,
    executor: SqlExecutor,
    transactions: TransactionCoordinator<DbTransaction>,
    optimizer: Arc<QueryOptimizer>,
    health_timeout: Duration,
}

impl SqlStore {
    pub fn new(config: &ConnectionConfig, pool: DbPool, optimizer: Arc<QueryOptimizer>) -> Self {
        let executor = SqlExecutor::new(
            pool.dialect(),
            RecordConvention::from_config(config),
            Duration::from_secs(config.timeout_secs),
        )
        .with_entities(config.entities.clone());

        Self {
            connection_id: config.id.clone(),
            provider: config.provider,
            executor,
            transactions: TransactionCoordinator::new(&config.id, config.transaction_timeout_secs),
            optimizer,
            health_timeout: health_check_timeout(config),
            pool,
        }
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    pub fn provider(&self) -> ProviderKind {
        self.provider
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    pub fn health_timeout(&self) -> Duration {
        self.health_timeout
    }

    pub async fn active_transactions(&self) -> Vec<TransactionInfo> {
        self.transactions.active_transactions().await
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

    /// Commit on success, roll back on failure.
    async fn finish_implicit<T>(tx: DbTransaction, result: DbResult<T>) -> DbResult<T> {
        match result {
            Ok(value) => {
                tx.commit().await?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback_err) = tx.rollback().await {
                    debug!(error = %rollback_err, "Implicit transaction rollback failed");
                }
                Err(e)
            }
        }
    }

    pub async fn find(
        &self,
        entity: &str,
        conditions: &Conditions,
        options: &FindOptions,
    ) -> DbResult<Vec<Record>> {
        let descriptor = find_descriptor(entity, conditions, options);
        self.observe(entity, "find", descriptor, async {
            let mut conn = self.pool.acquire().await?;
            self.executor
                .find(&mut conn.as_conn(), entity, conditions, options)
                .await
        })
        .await
    }

    pub async fn find_one(&self, entity: &str, conditions: &Conditions) -> DbResult<Option<Record>> {
        let descriptor = condition_descriptor("find_one", entity, conditions);
        self.observe(entity, "find_one", descriptor, async {
            let mut conn = self.pool.acquire().await?;
            self.executor
                .find_one(&mut conn.as_conn(), entity, conditions)
                .await
        })
        .await
    }

    pub async fn insert(&self, entity: &str, data: Record) -> DbResult<Record> {
        let descriptor = insert_descriptor(entity, &data);
        self.observe(entity, "insert", descriptor, async {
            let mut conn = self.pool.acquire().await?;
            self.executor.insert(&mut conn.as_conn(), entity, data).await
        })
        .await
    }

    pub async fn insert_many(&self, entity: &str, records: Vec<Record>) -> DbResult<Vec<Record>> {
        let descriptor = insert_many_descriptor(entity, records.len());
        self.observe(entity, "insert_many", descriptor, async {
            if records.is_empty() {
                return Ok(Vec::new());
            }
            let mut tx = self.pool.begin().await?;
            let result = self
                .executor
                .insert_each(&mut tx.as_conn(), entity, records)
                .await;
            Self::finish_implicit(tx, result).await
        })
        .await
    }

    pub async fn update(
        &self,
        entity: &str,
        conditions: &Conditions,
        data: Record,
    ) -> DbResult<Option<Record>> {
        let descriptor = update_descriptor(entity, conditions, &data);
        self.observe(entity, "update", descriptor, async {
            let mut tx = self.pool.begin().await?;
            let result = self
                .executor
                .update(&mut tx.as_conn(), entity, conditions, data)
                .await;
            Self::finish_implicit(tx, result).await
        })
        .await
    }

    pub async fn delete(&self, entity: &str, conditions: &Conditions, soft: bool) -> DbResult<bool> {
        let descriptor = delete_descriptor(entity, conditions, soft);
        self.observe(entity, "delete", descriptor, async {
            let mut tx = self.pool.begin().await?;
            let result = self
                .executor
                .delete(&mut tx.as_conn(), entity, conditions, soft)
                .await;
            Self::finish_implicit(tx, result).await
        })
        .await
    }

    pub async fn count(&self, entity: &str, conditions: &Conditions) -> DbResult<u64> {
        let descriptor = condition_descriptor("count", entity, conditions);
        self.observe(entity, "count", descriptor, async {
            let mut conn = self.pool.acquire().await?;
            self.executor
                .count(&mut conn.as_conn(), entity, conditions)
                .await
        })
        .await
    }

    pub async fn aggregate(&self, entity: &str, pipeline: &[JsonValue]) -> DbResult<Vec<Record>> {
        let descriptor = pipeline_descriptor(entity, pipeline);
        self.observe(entity, "aggregate", descriptor, async {
            let mut conn = self.pool.acquire().await?;
            self.executor
                .aggregate(&mut conn.as_conn(), entity, pipeline)
                .await
        })
        .await
    }

    pub async fn begin_transaction(&self) -> DbResult<TransactionContext> {
        self.observe(TRANSACTION_ENTITY, "begin_transaction", "begin_transaction".into(), async {
            let tx = self.pool.begin().await?;
            Ok(self.transactions.register(tx).await)
        })
        .await
    }

    pub async fn execute_in_transaction(
        &self,
        ctx: &TransactionContext,
        operation: Operation,
    ) -> DbResult<OperationResult> {
        let entity = operation.entity().to_string();
        let name = operation.name();
        let descriptor = operation.descriptor();
        self.observe(&entity, name, descriptor, async {
            let mut guard = self.transactions.acquire(ctx).await?;
            let tx = guard.native()?;
            self.executor
                .execute_operation(&mut tx.as_conn(), operation)
                .await
        })
        .await
    }

    pub async fn commit_transaction(&self, ctx: &TransactionContext) -> DbResult<()> {
        self.observe(TRANSACTION_ENTITY, "commit", "commit".into(), self.transactions.commit(ctx))
            .await
    }

    pub async fn rollback_transaction(&self, ctx: &TransactionContext) -> DbResult<()> {
        self.observe(
            TRANSACTION_ENTITY,
            "rollback",
            "rollback".into(),
            self.transactions.rollback(ctx),
        )
        .await
    }

    pub async fn create_savepoint(&self, ctx: &TransactionContext, name: &str) -> DbResult<String> {
        self.observe(
            TRANSACTION_ENTITY,
            "create_savepoint",
            "create_savepoint".into(),
            self.transactions.create_savepoint(ctx, name),
        )
        .await
    }

    pub async fn rollback_to_savepoint(&self, ctx: &TransactionContext, savepoint: &str) -> DbResult<()> {
        self.observe(
            TRANSACTION_ENTITY,
            "rollback_to_savepoint",
            "rollback_to_savepoint".into(),
            self.transactions.rollback_to_savepoint(ctx, savepoint),
        )
        .await
    }

    /// Sweep expired transactions, then round trip on a pooled connection.
    ///
    /// When open transactions hold every pooled connection, the backend already answered
    /// their `BEGIN`, so the connection counts as live without waiting for a free slot.
    pub async fn ping(&self) -> DbResult<()> {
        let cleaned = self.transactions.cleanup_expired().await;
        if cleaned > 0 {
            debug!(connection_id = %self.connection_id, cleaned, "Expired transactions cleaned up");
        }
        let open = self.transactions.len().await;
        if open > 0 && self.pool.is_exhausted_by(open) {
            debug!(
                connection_id = %self.connection_id,
                open_transactions = open,
                "Pool held by open transactions, skipping ping"
            );
            return Ok(());
        }
        self.pool.ping().await
    }

    pub async fn close(&self) {
        self.transactions.abort_all().await;
        self.pool.close().await;
        info!(connection_id = %self.connection_id, "SQL pool closed");
    }
}

/// Implement [`DatabaseAdapter`](crate::db::DatabaseAdapter) for a type with a `store: SqlStore`
/// field by delegating every call to it.
macro_rules! delegate_to_sql_store {
    ($adapter:ty) => {
        #[async_trait::async_trait]
        impl $crate::db::DatabaseAdapter for $adapter {
            fn connection_id(&self) -> &str {
                self.store.connection_id()
            }

            fn provider(&self) -> $crate::models::ProviderKind {
                self.store.provider()
            }

            async fn find(
                &self,
                entity: &str,
                conditions: &$crate::models::Conditions,
                options: &$crate::models::FindOptions,
            ) -> $crate::error::DbResult<Vec<$crate::models::Record>> {
                self.store.find(entity, conditions, options).await
            }

            async fn find_one(
                &self,
                entity: &str,
                conditions: &$crate::models::Conditions,
            ) -> $crate::error::DbResult<Option<$crate::models::Record>> {
                self.store.find_one(entity, conditions).await
            }

            async fn insert(
                &self,
                entity: &str,
                data: $crate::models::Record,
            ) -> $crate::error::DbResult<$crate::models::Record> {
                self.store.insert(entity, data).await
            }

            async fn insert_many(
                &self,
                entity: &str,
                records: Vec<$crate::models::Record>,
            ) -> $crate::error::DbResult<Vec<$crate::models::Record>> {
                self.store.insert_many(entity, records).await
            }

            async fn update(
                &self,
                entity: &str,
                conditions: &$crate::models::Conditions,
                data: $crate::models::Record,
            ) -> $crate::error::DbResult<Option<$crate::models::Record>> {
                self.store.update(entity, conditions, data).await
            }

            async fn delete(
                &self,
                entity: &str,
                conditions: &$crate::models::Conditions,
                soft: bool,
            ) -> $crate::error::DbResult<bool> {
                self.store.delete(entity, conditions, soft).await
            }

            async fn count(
                &self,
                entity: &str,
                conditions: &$crate::models::Conditions,
            ) -> $crate::error::DbResult<u64> {
                self.store.count(entity, conditions).await
            }

            async fn aggregate(
                &self,
                entity: &str,
                pipeline: &[serde_json::Value],
            ) -> $crate::error::DbResult<Vec<$crate::models::Record>> {
                self.store.aggregate(entity, pipeline).await
            }

            async fn begin_transaction(
                &self,
            ) -> $crate::error::DbResult<$crate::db::TransactionContext> {
                self.store.begin_transaction().await
            }

            async fn execute_in_transaction(
                &self,
                ctx: &$crate::db::TransactionContext,
                operation: $crate::models::Operation,
            ) -> $crate::error::DbResult<$crate::models::OperationResult> {
                self.store.execute_in_transaction(ctx, operation).await
            }

            async fn commit_transaction(
                &self,
                ctx: &$crate::db::TransactionContext,
            ) -> $crate::error::DbResult<()> {
                self.store.commit_transaction(ctx).await
            }

            async fn rollback_transaction(
                &self,
                ctx: &$crate::db::TransactionContext,
            ) -> $crate::error::DbResult<()> {
                self.store.rollback_transaction(ctx).await
            }

            async fn create_savepoint(
                &self,
                ctx: &$crate::db::TransactionContext,
                name: &str,
            ) -> $crate::error::DbResult<String> {
                self.store.create_savepoint(ctx, name).await
            }

            async fn rollback_to_savepoint(
                &self,
                ctx: &$crate::db::TransactionContext,
                savepoint: &str,
            ) -> $crate::error::DbResult<()> {
                self.store.rollback_to_savepoint(ctx, savepoint).await
            }

            fn supports_transactions(&self) -> bool {
                true
            }

            async fn ping(&self) -> $crate::error::DbResult<()> {
                self.store.ping().await
            }

            fn health_check_timeout(&self) -> std::time::Duration {
                self.store.health_timeout()
            }

            async fn close(&self) {
                self.store.close().await
            }
        }
    };
}

pub(crate) use delegate_to_sql_store;
