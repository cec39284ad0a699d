//! The provider-agnostic adapter contract.

use crate::config::DEFAULT_HEALTH_CHECK_TIMEOUT_SECS;
use crate::db::optimizer::QueryOptimizer;
use crate::db::transaction::TransactionContext;
use crate::error::DbResult;
use crate::models::{
    Conditions, ConnectionConfig, FindOptions, Operation, OperationResult, ProviderKind, Record,
};
use async_trait::async_trait;
use serde_json::Value as JsonValue;
use std::sync::Arc;
use std::time::Duration;

/// Data access operations every backend adapter provides.
///
/// Adapters own one pooled client each and report every data and transaction call to the
/// [`QueryOptimizer`] they were built with.
#[async_trait]
pub trait DatabaseAdapter: Send + Sync {
    fn connection_id(&self) -> &str;

    fn provider(&self) -> ProviderKind;

    /// Records matching `conditions`. No match is an empty list.
    async fn find(
        &self,
        entity: &str,
        conditions: &Conditions,
        options: &FindOptions,
    ) -> DbResult<Vec<Record>>;

    async fn find_one(&self, entity: &str, conditions: &Conditions) -> DbResult<Option<Record>>;

    /// Store one record and return it as stored, with generated fields.
    async fn insert(&self, entity: &str, data: Record) -> DbResult<Record>;

    /// Store every record or none of them.
    async fn insert_many(&self, entity: &str, records: Vec<Record>) -> DbResult<Vec<Record>>;

    /// Update the first live record matching `conditions`.
    async fn update(
        &self,
        entity: &str,
        conditions: &Conditions,
        data: Record,
    ) -> DbResult<Option<Record>>;

    /// Delete the first record matching `conditions`; `true` iff one record was affected.
    async fn delete(&self, entity: &str, conditions: &Conditions, soft: bool) -> DbResult<bool>;

    async fn count(&self, entity: &str, conditions: &Conditions) -> DbResult<u64>;

    async fn aggregate(&self, entity: &str, pipeline: &[JsonValue]) -> DbResult<Vec<Record>>;

    async fn begin_transaction(&self) -> DbResult<TransactionContext>;

    async fn execute_in_transaction(
        &self,
        ctx: &TransactionContext,
        operation: Operation,
    ) -> DbResult<OperationResult>;

    async fn commit_transaction(&self, ctx: &TransactionContext) -> DbResult<()>;

    async fn rollback_transaction(&self, ctx: &TransactionContext) -> DbResult<()>;

    async fn create_savepoint(&self, ctx: &TransactionContext, name: &str) -> DbResult<String>;

    async fn rollback_to_savepoint(&self, ctx: &TransactionContext, savepoint: &str) -> DbResult<()>;

    fn supports_transactions(&self) -> bool;

    /// One round trip to the backend.
    async fn ping(&self) -> DbResult<()>;

    /// Upper bound for [`health_check`](Self::health_check).
    fn health_check_timeout(&self) -> Duration {
        Duration::from_secs(DEFAULT_HEALTH_CHECK_TIMEOUT_SECS)
    }

    /// Bounded liveness check. Never errors.
    async fn health_check(&self) -> bool {
        matches!(
            tokio::time::timeout(self.health_check_timeout(), self.ping()).await,
            Ok(Ok(()))
        )
    }

    /// Roll back open transactions and release the pooled client.
    async fn close(&self);
}

/// Health check timeout for a connection: the default, capped by the connection timeout.
pub fn health_check_timeout(config: &ConnectionConfig) -> Duration {
    Duration::from_secs(DEFAULT_HEALTH_CHECK_TIMEOUT_SECS.min(config.timeout_secs.max(1)))
}

/// Builds adapters for one provider.
#[async_trait]
pub trait AdapterFactory: Send + Sync {
    /// Validate `config` and construct an adapter. Fails with a configuration error when a
    /// required provider setting is missing.
    async fn create(
        &self,
        config: &ConnectionConfig,
        optimizer: Arc<QueryOptimizer>,
    ) -> DbResult<Arc<dyn DatabaseAdapter>>;
}
