//! Connection pool management.
//!
//! This module provides connection pooling using database-specific pools
//! (MySqlPool, PgPool, SqlitePool) to ensure full type support. Pools are created lazily:
//! no socket is opened until the first acquire, so an unreachable backend is reported by the
//! first health check rather than at construction.

use crate::db::executor::SqlConn;
use crate::db::sql::Dialect;
use crate::db::transaction::NativeTransaction;
use crate::error::{DbError, DbResult};
use crate::models::ConnectionConfig;
use async_trait::async_trait;
use sqlx::pool::{PoolConnection, PoolOptions};
use sqlx::{
    Connection, Database, MySql, MySqlPool, PgPool, Postgres, Sqlite, SqlitePool, Transaction,
    mysql::MySqlConnectOptions, postgres::PgConnectOptions, sqlite::SqliteConnectOptions,
};
use std::time::Duration;
use tracing::debug;

const SQLITE_BEGIN_WRITE: &str = "BEGIN IMMEDIATE";

/// Sizing and lifetime settings shared by every pool variant.
#[derive(Debug, Clone, PartialEq)]
pub struct PoolConfig {
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout: Duration,
    pub idle_timeout: Option<Duration>,
    pub max_lifetime: Option<Duration>,
    pub test_before_acquire: bool,
}

impl PoolConfig {
    pub fn from_connection(config: &ConnectionConfig) -> Self {
        let opts = &config.pool_options;
        Self {
            max_connections: config.pool_size,
            min_connections: opts.min_connections_or_default().min(config.pool_size),
            acquire_timeout: Duration::from_secs(config.timeout_secs),
            idle_timeout: Some(opts.idle_timeout_or_default()),
            max_lifetime: Some(Duration::from_secs(30 * 60)),
            test_before_acquire: opts.test_before_acquire_or_default(),
        }
    }

    /// One connection that is never recycled, for in-memory SQLite databases.
    pub fn single_connection(mut self) -> Self {
        self.max_connections = 1;
        self.min_connections = 0;
        self.idle_timeout = None;
        self.max_lifetime = None;
        self
    }

    fn options<DB: Database>(&self) -> PoolOptions<DB> {
        PoolOptions::<DB>::new()
            .max_connections(self.max_connections)
            .min_connections(self.min_connections)
            .acquire_timeout(self.acquire_timeout)
            .idle_timeout(self.idle_timeout)
            .max_lifetime(self.max_lifetime)
            .test_before_acquire(self.test_before_acquire)
    }
}

/// Database-specific connection pool (avoids AnyPool limitations).
#[derive(Debug, Clone)]
pub enum DbPool {
    MySql(MySqlPool),
    Postgres(PgPool),
    SQLite(SqlitePool),
}

/// Point-in-time pool occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct PoolStats {
    pub size: u32,
    pub idle: usize,
}

impl DbPool {
    pub fn mysql(options: MySqlConnectOptions, config: &PoolConfig) -> Self {
        DbPool::MySql(config.options::<MySql>().connect_lazy_with(options))
    }

    pub fn postgres(options: PgConnectOptions, config: &PoolConfig) -> Self {
        DbPool::Postgres(config.options::<Postgres>().connect_lazy_with(options))
    }

    pub fn sqlite(options: SqliteConnectOptions, config: &PoolConfig) -> Self {
        DbPool::SQLite(config.options::<Sqlite>().connect_lazy_with(options))
    }

    pub fn dialect(&self) -> Dialect {
        match self {
            DbPool::MySql(_) => Dialect::MySql,
            DbPool::Postgres(_) => Dialect::Postgres,
            DbPool::SQLite(_) => Dialect::SQLite,
        }
    }

    /// Check out a connection for a single call.
    pub async fn acquire(&self) -> DbResult<PooledConnection> {
        let conn = db_dispatch!(DbPool, self, p => p.acquire().await.map(PooledConnection::from));
        conn.map_err(|e| self.acquire_error(e))
    }

    /// Begin a transaction on a dedicated connection.
    ///
    /// SQLite transactions take the write lock up front. A deferred transaction that reads
    /// before it writes fails with SQLITE_BUSY instead of waiting when another writer holds
    /// the lock.
    pub async fn begin(&self) -> DbResult<DbTransaction> {
        let tx = match self {
            DbPool::MySql(p) => p.begin().await.map(DbTransaction::MySql),
            DbPool::Postgres(p) => p.begin().await.map(DbTransaction::Postgres),
            DbPool::SQLite(p) => p
                .begin_with(SQLITE_BEGIN_WRITE)
                .await
                .map(DbTransaction::SQLite),
        };
        tx.map_err(|e| self.acquire_error(e))
    }

    /// Round trip to the backend on a pooled connection.
    pub async fn ping(&self) -> DbResult<()> {
        let mut conn = self.acquire().await?;
        let result = match &mut conn {
            PooledConnection::MySql(c) => c.ping().await,
            PooledConnection::Postgres(c) => c.ping().await,
            PooledConnection::SQLite(c) => c.ping().await,
        };
        result.map_err(|e| {
            DbError::connection(
                format!("Ping failed: {}", e),
                connection_suggestion(self.dialect(), &e),
            )
        })
    }

    pub async fn close(&self) {
        db_dispatch!(DbPool, self, p => p.close().await)
    }

    pub fn is_closed(&self) -> bool {
        db_dispatch!(DbPool, self, p => p.is_closed())
    }

    pub fn stats(&self) -> PoolStats {
        db_dispatch!(DbPool, self, p => PoolStats { size: p.size(), idle: p.num_idle() })
    }

    pub fn max_connections(&self) -> u32 {
        db_dispatch!(DbPool, self, p => p.options().get_max_connections())
    }

    /// Whether `pinned` checked-out connections account for the whole pool.
    pub fn is_exhausted_by(&self, pinned: usize) -> bool {
        let max = self.max_connections() as usize;
        pinned >= max && self.stats().idle == 0
    }

    fn acquire_error(&self, error: sqlx::Error) -> DbError {
        match error {
            sqlx::Error::PoolTimedOut => {
                let secs = db_dispatch!(DbPool, self, p => p.options().get_acquire_timeout());
                DbError::timeout("connection pool acquire", secs.as_secs() as u32)
            }
            sqlx::Error::Io(_) | sqlx::Error::Tls(_) => {
                let suggestion = connection_suggestion(self.dialect(), &error);
                DbError::connection(format!("Failed to connect: {}", error), suggestion)
            }
            other => DbError::from(other),
        }
    }
}

/// Generate a helpful suggestion for connection errors.
pub fn connection_suggestion(dialect: Dialect, error: &sqlx::Error) -> String {
    let error_str = error.to_string().to_lowercase();

    if error_str.contains("connection refused") {
        return format!(
            "Check that the {} server is running and accessible",
            dialect
        );
    }

    if error_str.contains("authentication") || error_str.contains("password") {
        return "Verify the username and password (or service key)".to_string();
    }

    if error_str.contains("does not exist") || error_str.contains("unknown database") {
        return "Check that the database name exists".to_string();
    }

    if error_str.contains("tls") || error_str.contains("ssl") {
        return "Check the ssl_mode setting and server certificates".to_string();
    }

    match dialect {
        Dialect::Postgres => "Verify the host, port and database settings".to_string(),
        Dialect::MySql => "Verify the host, port and database settings".to_string(),
        Dialect::SQLite => "Verify the file path exists and is writable".to_string(),
    }
}

/// A connection checked out of a [`DbPool`]; returned to the pool on drop.
#[derive(Debug)]
pub enum PooledConnection {
    MySql(PoolConnection<MySql>),
    Postgres(PoolConnection<Postgres>),
    SQLite(PoolConnection<Sqlite>),
}

impl From<PoolConnection<MySql>> for PooledConnection {
    fn from(conn: PoolConnection<MySql>) -> Self {
        PooledConnection::MySql(conn)
    }
}

impl From<PoolConnection<Postgres>> for PooledConnection {
    fn from(conn: PoolConnection<Postgres>) -> Self {
        PooledConnection::Postgres(conn)
    }
}

impl From<PoolConnection<Sqlite>> for PooledConnection {
    fn from(conn: PoolConnection<Sqlite>) -> Self {
        PooledConnection::SQLite(conn)
    }
}

impl PooledConnection {
    pub fn as_conn(&mut self) -> SqlConn<'_> {
        match self {
            PooledConnection::MySql(c) => SqlConn::MySql(&mut **c),
            PooledConnection::Postgres(c) => SqlConn::Postgres(&mut **c),
            PooledConnection::SQLite(c) => SqlConn::SQLite(&mut **c),
        }
    }
}

/// Database-specific transaction wrapper.
///
/// Holds a dedicated connection until committed or rolled back. Dropping it without either
/// rolls the transaction back when the connection returns to the pool.
#[derive(Debug)]
pub enum DbTransaction {
    MySql(Transaction<'static, MySql>),
    Postgres(Transaction<'static, Postgres>),
    SQLite(Transaction<'static, Sqlite>),
}

impl DbTransaction {
    pub fn dialect(&self) -> Dialect {
        match self {
            DbTransaction::MySql(_) => Dialect::MySql,
            DbTransaction::Postgres(_) => Dialect::Postgres,
            DbTransaction::SQLite(_) => Dialect::SQLite,
        }
    }

    pub fn as_conn(&mut self) -> SqlConn<'_> {
        match self {
            DbTransaction::MySql(tx) => SqlConn::MySql(&mut **tx),
            DbTransaction::Postgres(tx) => SqlConn::Postgres(&mut **tx),
            DbTransaction::SQLite(tx) => SqlConn::SQLite(&mut **tx),
        }
    }
}

#[async_trait]
impl NativeTransaction for DbTransaction {
    async fn savepoint(&mut self, name: &str) -> DbResult<()> {
        let sql = format!("SAVEPOINT {}", self.dialect().quote(name));
        debug!(sql = %sql, "Creating savepoint");
        self.as_conn().execute_raw(&sql).await.map(|_| ())
    }

    async fn rollback_to_savepoint(&mut self, name: &str) -> DbResult<()> {
        let sql = format!("ROLLBACK TO SAVEPOINT {}", self.dialect().quote(name));
        debug!(sql = %sql, "Rolling back to savepoint");
        self.as_conn().execute_raw(&sql).await.map(|_| ())
    }

    async fn commit(self) -> DbResult<()> {
        db_dispatch!(DbTransaction, self, tx => tx.commit().await.map_err(DbError::from))
    }

    async fn rollback(self) -> DbResult<()> {
        db_dispatch!(DbTransaction, self, tx => tx.rollback().await.map_err(DbError::from))
    }
}
