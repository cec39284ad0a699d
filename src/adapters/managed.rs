//! Managed PostgreSQL adapter.
//!
//! Hosted Postgres services expose a connection endpoint and a service key. The key is used
//! as the database password and the configured schema becomes the session `search_path`.

use super::sql_store::{SqlStore, delegate_to_sql_store};
use crate::db::adapter::{AdapterFactory, DatabaseAdapter};
use crate::db::optimizer::QueryOptimizer;
use crate::db::pool::{DbPool, PoolConfig};
use crate::db::sql::validate_identifier;
use crate::error::{DbError, DbResult};
use crate::models::{ConnectionConfig, ConnectionKind, ProviderKind};
use async_trait::async_trait;
use sqlx::postgres::{PgConnectOptions, PgSslMode};
use std::str::FromStr;
use std::sync::Arc;
use tracing::info;

const DEFAULT_USER: &str = "postgres";
const DEFAULT_SCHEMA: &str = "public";
const DEFAULT_SSL_MODE: &str = "require";

/// Adapter for `managed-service` connections.
pub struct ManagedPostgresAdapter {
    store: SqlStore,
    schema: String,
}

impl ManagedPostgresAdapter {
    pub fn new(config: &ConnectionConfig, optimizer: Arc<QueryOptimizer>) -> DbResult<Self> {
        if config.provider != ProviderKind::ManagedService {
            return Err(DbError::config(format!(
                "Managed adapter cannot serve {} connections",
                config.provider
            )));
        }
        if config.kind != ConnectionKind::External {
            return Err(DbError::config("Managed service connections must be external"));
        }

        let schema = config.setting_str("schema").unwrap_or(DEFAULT_SCHEMA).to_string();
        validate_identifier(&schema)
            .map_err(|_| DbError::config(format!("Invalid schema name '{}'", schema)))?;

        let options = connect_options(config, &schema)?;
        let pool = DbPool::postgres(options, &PoolConfig::from_connection(config));

        info!(
            connection_id = %config.id,
            schema = %schema,
            pool_size = config.pool_size,
            "Managed Postgres pool created"
        );

        Ok(Self {
            store: SqlStore::new(config, pool, optimizer),
            schema,
        })
    }

    pub fn schema(&self) -> &str {
        &self.schema
    }
}

delegate_to_sql_store!(ManagedPostgresAdapter);

fn connect_options(config: &ConnectionConfig, schema: &str) -> DbResult<PgConnectOptions> {
    let endpoint = config.require_str("endpoint")?;
    let service_key = config.require_str("service_key")?;

    if !(endpoint.starts_with("postgres://") || endpoint.starts_with("postgresql://")) {
        return Err(DbError::config(
            "The managed endpoint must be a postgres:// URL",
        ));
    }
    let mut options = PgConnectOptions::from_str(endpoint)
        .map_err(|e| DbError::config(format!("Invalid managed endpoint: {}", e)))?
        .password(service_key)
        .options([("search_path", schema)]);

    match config.setting_str("user") {
        Some(user) => options = options.username(user),
        None if !endpoint_has_user(endpoint) => options = options.username(DEFAULT_USER),
        None => {}
    }

    let ssl_mode = match config.setting_str("ssl_mode") {
        Some(mode) => Some(mode),
        None if !endpoint.contains("sslmode=") => Some(DEFAULT_SSL_MODE),
        None => None,
    };
    if let Some(mode) = ssl_mode {
        let mode = PgSslMode::from_str(mode)
            .map_err(|e| DbError::config(format!("Invalid ssl_mode '{}': {}", mode, e)))?;
        options = options.ssl_mode(mode);
    }
    Ok(options)
}

fn endpoint_has_user(endpoint: &str) -> bool {
    url::Url::parse(endpoint)
        .map(|u| !u.username().is_empty())
        .unwrap_or(false)
}

/// Builds [`ManagedPostgresAdapter`]s.
#[derive(Debug, Default, Clone, Copy)]
pub struct ManagedFactory;

#[async_trait]
impl AdapterFactory for ManagedFactory {
    async fn create(
        &self,
        config: &ConnectionConfig,
        optimizer: Arc<QueryOptimizer>,
    ) -> DbResult<Arc<dyn DatabaseAdapter>> {
        Ok(Arc::new(ManagedPostgresAdapter::new(config, optimizer)?))
    }
}
