//! Relational SQL adapter: MySQL or PostgreSQL servers, or embedded SQLite files.

use super::sql_store::{SqlStore, delegate_to_sql_store};
use crate::db::adapter::{AdapterFactory, DatabaseAdapter};
use crate::db::optimizer::QueryOptimizer;
use crate::db::pool::{DbPool, PoolConfig};
use crate::db::sql::Dialect;
use crate::error::{DbError, DbResult};
use crate::models::{ConnectionConfig, ConnectionKind, ProviderKind};
use async_trait::async_trait;
use sqlx::mysql::{MySqlConnectOptions, MySqlSslMode};
use sqlx::postgres::{PgConnectOptions, PgSslMode};
use sqlx::sqlite::SqliteConnectOptions;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

const MEMORY_PATH: &str = ":memory:";

/// Adapter for `relational-sql` connections.
pub struct RelationalAdapter {
    store: SqlStore,
}

impl RelationalAdapter {
    /// Validate the provider settings and build a lazy pool.
    pub fn new(config: &ConnectionConfig, optimizer: Arc<QueryOptimizer>) -> DbResult<Self> {
        if config.provider != ProviderKind::RelationalSql {
            return Err(DbError::config(format!(
                "Relational adapter cannot serve {} connections",
                config.provider
            )));
        }

        let pool_config = PoolConfig::from_connection(config);
        let pool = match config.kind {
            ConnectionKind::Embedded => sqlite_pool(config, pool_config)?,
            ConnectionKind::External => match external_dialect(config)? {
                Dialect::MySql => DbPool::mysql(mysql_options(config)?, &pool_config),
                Dialect::Postgres => DbPool::postgres(postgres_options(config)?, &pool_config),
                Dialect::SQLite => {
                    return Err(DbError::config("SQLite connections must be embedded"));
                }
            },
        };

        info!(
            connection_id = %config.id,
            dialect = %pool.dialect(),
            pool_size = config.pool_size,
            "Relational pool created"
        );

        Ok(Self {
            store: SqlStore::new(config, pool, optimizer),
        })
    }

    pub fn dialect(&self) -> Dialect {
        self.store.pool().dialect()
    }

    pub fn store(&self) -> &SqlStore {
        &self.store
    }
}

delegate_to_sql_store!(RelationalAdapter);

fn external_dialect(config: &ConnectionConfig) -> DbResult<Dialect> {
    match config.setting_str("dialect").map(str::to_ascii_lowercase).as_deref() {
        None | Some("mysql") | Some("mariadb") => Ok(Dialect::MySql),
        Some("postgres") | Some("postgresql") => Ok(Dialect::Postgres),
        Some(other) => Err(DbError::config(format!(
            "Unsupported relational dialect '{}'; expected mysql or postgres",
            other
        ))),
    }
}

/// Settings every external relational connection must carry.
struct ServerSettings<'a> {
    host: &'a str,
    port: u16,
    database: &'a str,
    username: &'a str,
    password: &'a str,
    ssl_mode: Option<&'a str>,
}

impl<'a> ServerSettings<'a> {
    fn from_config(config: &'a ConnectionConfig) -> DbResult<Self> {
        Ok(Self {
            host: config.require_str("host")?,
            port: config
                .setting_port("port")?
                .ok_or_else(|| DbError::missing_setting(config.provider, "port"))?,
            database: config.require_str("database")?,
            username: config.require_str("username")?,
            password: config.require_str("password")?,
            ssl_mode: config.setting_str("ssl_mode"),
        })
    }
}

fn mysql_options(config: &ConnectionConfig) -> DbResult<MySqlConnectOptions> {
    let settings = ServerSettings::from_config(config)?;
    let mut options = MySqlConnectOptions::new()
        .host(settings.host)
        .port(settings.port)
        .database(settings.database)
        .username(settings.username)
        .password(settings.password)
        // Ensure full Unicode support (emoji, etc.)
        .charset("utf8mb4");
    if let Some(mode) = settings.ssl_mode {
        let mode = MySqlSslMode::from_str(mode)
            .map_err(|e| DbError::config(format!("Invalid ssl_mode '{}': {}", mode, e)))?;
        options = options.ssl_mode(mode);
    }
    Ok(options)
}

fn postgres_options(config: &ConnectionConfig) -> DbResult<PgConnectOptions> {
    let settings = ServerSettings::from_config(config)?;
    let mut options = PgConnectOptions::new()
        .host(settings.host)
        .port(settings.port)
        .database(settings.database)
        .username(settings.username)
        .password(settings.password);
    if let Some(mode) = settings.ssl_mode {
        let mode = PgSslMode::from_str(mode)
            .map_err(|e| DbError::config(format!("Invalid ssl_mode '{}': {}", mode, e)))?;
        options = options.ssl_mode(mode);
    }
    Ok(options)
}

fn sqlite_pool(config: &ConnectionConfig, pool_config: PoolConfig) -> DbResult<DbPool> {
    let path = config.require_str("path")?;
    if path == MEMORY_PATH {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        // Every connection to :memory: is a separate database
        return Ok(DbPool::sqlite(options, &pool_config.single_connection()));
    }
    // Writers queue on the file lock for up to the connection timeout
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .busy_timeout(Duration::from_secs(config.timeout_secs));
    Ok(DbPool::sqlite(options, &pool_config))
}

/// Builds [`RelationalAdapter`]s.
#[derive(Debug, Default, Clone, Copy)]
pub struct RelationalFactory;

#[async_trait]
impl AdapterFactory for RelationalFactory {
    async fn create(
        &self,
        config: &ConnectionConfig,
        optimizer: Arc<QueryOptimizer>,
    ) -> DbResult<Arc<dyn DatabaseAdapter>> {
        Ok(Arc::new(RelationalAdapter::new(config, optimizer)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn external(settings: serde_json::Value) -> ConnectionConfig {
        ConnectionConfig::new(
            "server",
            ProviderKind::RelationalSql,
            ConnectionKind::External,
            settings.as_object().cloned().unwrap(),
        )
    }

    fn full_settings() -> serde_json::Value {
        json!({
            "database": "app",
            "host": "localhost",
            "password": "secret",
            "port": 3306,
            "username": "root"
        })
    }

    #[tokio::test]
    async fn test_missing_required_setting() {
        for field in ["host", "port", "database", "username", "password"] {
            let mut settings = full_settings();
            settings.as_object_mut().unwrap().remove(field);
            let err = RelationalAdapter::new(&external(settings), Arc::default())
                .err()
                .unwrap();
            assert!(matches!(err, DbError::ConfigValidation { .. }), "{field}");
            assert!(err.to_string().contains(field));
        }
    }

    #[tokio::test]
    async fn test_external_dialects() {
        let adapter = RelationalAdapter::new(&external(full_settings()), Arc::default()).unwrap();
        assert_eq!(adapter.dialect(), Dialect::MySql);

        let mut settings = full_settings();
        settings["dialect"] = json!("postgres");
        let adapter = RelationalAdapter::new(&external(settings), Arc::default()).unwrap();
        assert_eq!(adapter.dialect(), Dialect::Postgres);

        let mut settings = full_settings();
        settings["dialect"] = json!("oracle");
        assert!(RelationalAdapter::new(&external(settings), Arc::default()).is_err());
    }

    #[tokio::test]
    async fn test_embedded_requires_path() {
        let config = ConnectionConfig::new(
            "local",
            ProviderKind::RelationalSql,
            ConnectionKind::Embedded,
            Default::default(),
        );
        let err = RelationalAdapter::new(&config, Arc::default()).err().unwrap();
        assert!(err.to_string().contains("path"));

        let memory = config.with_setting("path", ":memory:");
        let adapter = RelationalAdapter::new(&memory, Arc::default()).unwrap();
        assert_eq!(adapter.dialect(), Dialect::SQLite);
        assert!(adapter.supports_transactions());
        assert!(adapter.health_check().await);
    }

    #[tokio::test]
    async fn test_invalid_ssl_mode() {
        let mut settings = full_settings();
        settings["ssl_mode"] = json!("sometimes");
        let err = RelationalAdapter::new(&external(settings), Arc::default())
            .err()
            .unwrap();
        assert!(matches!(err, DbError::ConfigValidation { .. }));
    }
}
