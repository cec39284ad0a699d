//! Transaction and savepoint coordination.
//!
//! A [`TransactionCoordinator`] is owned by one adapter. It keeps every open backend
//! transaction behind its own FIFO `tokio::sync::Mutex`, so operations submitted through one
//! [`TransactionContext`] run in order while different contexts proceed independently. The
//! registry map lock is only held to look entries up, never across backend I/O.

use crate::config::{DEFAULT_TRANSACTION_TIMEOUT_SECS, MAX_TRANSACTION_TIMEOUT_SECS};
use crate::db::sql::validate_identifier;
use crate::error::{DbError, DbResult};
use crate::models::TransactionState;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard, RwLock};
use tracing::{debug, info, warn};

/// Backend transaction primitives the coordinator drives.
#[async_trait]
pub trait NativeTransaction: Send + 'static {
    async fn savepoint(&mut self, name: &str) -> DbResult<()>;

    async fn rollback_to_savepoint(&mut self, name: &str) -> DbResult<()>;

    async fn commit(self) -> DbResult<()>;

    async fn rollback(self) -> DbResult<()>;
}

fn generate_transaction_id() -> String {
    format!("tx_{}", uuid::Uuid::new_v4().simple())
}

struct ContextState {
    state: TransactionState,
    savepoints: Vec<String>,
}

struct ContextInner {
    id: String,
    connection_id: String,
    started_at: DateTime<Utc>,
    started: Instant,
    timeout: Duration,
    state: Mutex<ContextState>,
}

/// Cloneable handle to one transaction on one connection.
///
/// Every clone observes the same state, so a context committed through one clone is terminal
/// for all of them.
#[derive(Clone)]
pub struct TransactionContext {
    inner: Arc<ContextInner>,
}

impl std::fmt::Debug for TransactionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionContext")
            .field("id", &self.inner.id)
            .field("connection_id", &self.inner.connection_id)
            .field("state", &self.state())
            .finish()
    }
}

impl TransactionContext {
    fn new(connection_id: &str, timeout: Duration) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                id: generate_transaction_id(),
                connection_id: connection_id.to_string(),
                started_at: Utc::now(),
                started: Instant::now(),
                timeout,
                state: Mutex::new(ContextState {
                    state: TransactionState::Active,
                    savepoints: Vec::new(),
                }),
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ContextState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn connection_id(&self) -> &str {
        &self.inner.connection_id
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.inner.started_at
    }

    pub fn age(&self) -> Duration {
        self.inner.started.elapsed()
    }

    pub fn state(&self) -> TransactionState {
        self.lock().state
    }

    pub fn is_active(&self) -> bool {
        self.state().is_active()
    }

    /// Open savepoints, oldest first.
    pub fn savepoints(&self) -> Vec<String> {
        self.lock().savepoints.clone()
    }

    pub fn is_expired(&self) -> bool {
        self.age() > self.inner.timeout
    }

    fn finish(&self, state: TransactionState) {
        let mut guard = self.lock();
        guard.state = state;
        guard.savepoints.clear();
    }

    fn error(&self, message: impl Into<String>) -> DbError {
        DbError::transaction_state(message, self.id())
    }
}

/// Metadata about an open transaction.
#[derive(Debug, Clone, Serialize)]
pub struct TransactionInfo {
    pub id: String,
    pub connection_id: String,
    pub started_at: DateTime<Utc>,
    pub age_secs: u64,
    pub savepoint_depth: usize,
}

type NativeSlot<T> = Arc<AsyncMutex<Option<T>>>;

struct Entry<T> {
    context: TransactionContext,
    native: NativeSlot<T>,
}

/// Exclusive access to one open backend transaction.
pub struct TransactionGuard<T> {
    slot: OwnedMutexGuard<Option<T>>,
    transaction_id: String,
}

impl<T> TransactionGuard<T> {
    pub fn native(&mut self) -> DbResult<&mut T> {
        self.slot.as_mut().ok_or_else(|| {
            DbError::transaction_state("Transaction is no longer active", &self.transaction_id)
        })
    }
}

/// Registry of open transactions for one connection.
pub struct TransactionCoordinator<T: NativeTransaction> {
    connection_id: String,
    timeout: Duration,
    transactions: RwLock<HashMap<String, Entry<T>>>,
}

impl<T: NativeTransaction> TransactionCoordinator<T> {
    /// Create a coordinator. Timeouts are clamped to the maximum and default to 60 seconds.
    pub fn new(connection_id: impl Into<String>, timeout_secs: Option<u32>) -> Self {
        let timeout_secs = timeout_secs
            .map(|t| t.min(MAX_TRANSACTION_TIMEOUT_SECS))
            .unwrap_or(DEFAULT_TRANSACTION_TIMEOUT_SECS);
        Self::with_timeout(connection_id, Duration::from_secs(timeout_secs as u64))
    }

    pub fn with_timeout(connection_id: impl Into<String>, timeout: Duration) -> Self {
        Self {
            connection_id: connection_id.into(),
            timeout,
            transactions: RwLock::new(HashMap::new()),
        }
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Track a freshly begun backend transaction.
    pub async fn register(&self, native: T) -> TransactionContext {
        let context = TransactionContext::new(&self.connection_id, self.timeout);
        let entry = Entry {
            context: context.clone(),
            native: Arc::new(AsyncMutex::new(Some(native))),
        };
        self.transactions
            .write()
            .await
            .insert(context.id().to_string(), entry);

        info!(
            transaction_id = %context.id(),
            connection_id = %self.connection_id,
            timeout_secs = self.timeout.as_secs(),
            "Transaction started"
        );
        context
    }

    fn check_owner(&self, ctx: &TransactionContext) -> DbResult<()> {
        if ctx.connection_id() != self.connection_id {
            return Err(ctx.error("Transaction belongs to a different connection"));
        }
        Ok(())
    }

    fn check_active(ctx: &TransactionContext) -> DbResult<()> {
        match ctx.state() {
            TransactionState::Active => Ok(()),
            state => Err(ctx.error(format!("Transaction is {}", state))),
        }
    }

    async fn slot(&self, ctx: &TransactionContext) -> DbResult<NativeSlot<T>> {
        self.transactions
            .read()
            .await
            .get(ctx.id())
            .filter(|entry| Arc::ptr_eq(&entry.context.inner, &ctx.inner))
            .map(|entry| entry.native.clone())
            .ok_or_else(|| ctx.error("Transaction not found"))
    }

    async fn remove(&self, ctx: &TransactionContext) {
        self.transactions.write().await.remove(ctx.id());
    }

    /// Wait for exclusive access to the transaction behind `ctx`.
    ///
    /// An expired transaction is rolled back here and reported as an error.
    pub async fn acquire(&self, ctx: &TransactionContext) -> DbResult<TransactionGuard<T>> {
        self.check_owner(ctx)?;
        Self::check_active(ctx)?;

        let mut slot = self.slot(ctx).await?.lock_owned().await;
        if slot.is_none() {
            return Err(ctx.error("Transaction is no longer active"));
        }
        Self::check_active(ctx)?;

        if ctx.is_expired() {
            let native = slot.take();
            drop(slot);
            self.remove(ctx).await;
            ctx.finish(TransactionState::TimedOut);
            warn!(
                transaction_id = %ctx.id(),
                connection_id = %self.connection_id,
                age_secs = ctx.age().as_secs(),
                "Transaction expired, rolling back"
            );
            if let Some(native) = native {
                if let Err(e) = native.rollback().await {
                    warn!(transaction_id = %ctx.id(), error = %e, "Rollback of expired transaction failed");
                }
            }
            return Err(ctx.error("Transaction has expired"));
        }

        Ok(TransactionGuard {
            slot,
            transaction_id: ctx.id().to_string(),
        })
    }

    /// Push a named savepoint and return its id.
    pub async fn create_savepoint(&self, ctx: &TransactionContext, name: &str) -> DbResult<String> {
        validate_identifier(name)?;
        let mut guard = self.acquire(ctx).await?;
        if ctx.savepoints().iter().any(|s| s == name) {
            return Err(ctx.error(format!("Savepoint '{}' already exists", name)));
        }

        guard.native()?.savepoint(name).await?;
        ctx.lock().savepoints.push(name.to_string());
        debug!(transaction_id = %ctx.id(), savepoint = %name, "Savepoint created");
        Ok(name.to_string())
    }

    /// Roll back to `name`, discarding it and every later savepoint.
    pub async fn rollback_to_savepoint(&self, ctx: &TransactionContext, name: &str) -> DbResult<()> {
        let mut guard = self.acquire(ctx).await?;
        let position = ctx
            .savepoints()
            .iter()
            .position(|s| s == name)
            .ok_or_else(|| ctx.error(format!("Unknown savepoint '{}'", name)))?;

        guard.native()?.rollback_to_savepoint(name).await?;
        ctx.lock().savepoints.truncate(position);
        debug!(transaction_id = %ctx.id(), savepoint = %name, "Rolled back to savepoint");
        Ok(())
    }

    pub async fn commit(&self, ctx: &TransactionContext) -> DbResult<()> {
        let mut guard = self.acquire(ctx).await?;
        let native = guard.slot.take();
        drop(guard);
        self.remove(ctx).await;

        let Some(native) = native else {
            return Err(ctx.error("Transaction is no longer active"));
        };
        match native.commit().await {
            Ok(()) => {
                ctx.finish(TransactionState::Committed);
                info!(
                    transaction_id = %ctx.id(),
                    connection_id = %self.connection_id,
                    "Transaction committed"
                );
                Ok(())
            }
            Err(e) => {
                ctx.finish(TransactionState::RolledBack);
                Err(e)
            }
        }
    }

    pub async fn rollback(&self, ctx: &TransactionContext) -> DbResult<()> {
        let mut guard = self.acquire(ctx).await?;
        let native = guard.slot.take();
        drop(guard);
        self.remove(ctx).await;
        ctx.finish(TransactionState::RolledBack);

        if let Some(native) = native {
            native.rollback().await?;
        }
        info!(
            transaction_id = %ctx.id(),
            connection_id = %self.connection_id,
            "Transaction rolled back"
        );
        Ok(())
    }

    /// Metadata for every open transaction, oldest first.
    pub async fn active_transactions(&self) -> Vec<TransactionInfo> {
        let txs = self.transactions.read().await;
        let mut infos: Vec<TransactionInfo> = txs
            .values()
            .map(|entry| TransactionInfo {
                id: entry.context.id().to_string(),
                connection_id: entry.context.connection_id().to_string(),
                started_at: entry.context.started_at(),
                age_secs: entry.context.age().as_secs(),
                savepoint_depth: entry.context.savepoints().len(),
            })
            .collect();
        infos.sort_by(|a, b| a.started_at.cmp(&b.started_at).then_with(|| a.id.cmp(&b.id)));
        infos
    }

    pub async fn len(&self) -> usize {
        self.transactions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.transactions.read().await.is_empty()
    }

    /// Roll back transactions that outlived the timeout and are not currently in use.
    pub async fn cleanup_expired(&self) -> usize {
        let expired: Vec<(TransactionContext, NativeSlot<T>)> = {
            let txs = self.transactions.read().await;
            txs.values()
                .filter(|entry| entry.context.is_expired())
                .map(|entry| (entry.context.clone(), entry.native.clone()))
                .collect()
        };

        let mut cleaned = 0;
        for (ctx, slot) in expired {
            let Ok(mut slot) = slot.try_lock_owned() else {
                continue;
            };
            let Some(native) = slot.take() else {
                continue;
            };
            drop(slot);
            self.remove(&ctx).await;
            ctx.finish(TransactionState::TimedOut);
            warn!(
                transaction_id = %ctx.id(),
                connection_id = %self.connection_id,
                "Cleaned up expired transaction"
            );
            if let Err(e) = native.rollback().await {
                warn!(transaction_id = %ctx.id(), error = %e, "Rollback of expired transaction failed");
            }
            cleaned += 1;
        }
        cleaned
    }

    /// Roll back every open transaction, waiting for in-flight work on each.
    pub async fn abort_all(&self) {
        let entries: Vec<Entry<T>> = self.transactions.write().await.drain().map(|(_, e)| e).collect();
        for entry in entries {
            let native = entry.native.lock().await.take();
            entry.context.finish(TransactionState::RolledBack);
            if let Some(native) = native {
                if let Err(e) = native.rollback().await {
                    warn!(transaction_id = %entry.context.id(), error = %e, "Rollback on close failed");
                } else {
                    info!(
                        transaction_id = %entry.context.id(),
                        connection_id = %self.connection_id,
                        "Transaction rolled back on close"
                    );
                }
            }
        }
    }
}
