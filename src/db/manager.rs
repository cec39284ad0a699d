//! Connection registry.
//!
//! The [`ConnectionManager`] owns every configured adapter and its last known health. It is
//! cheap to clone; clones share the same registry.

use crate::adapters;
use crate::db::adapter::{AdapterFactory, DatabaseAdapter};
use crate::db::optimizer::QueryOptimizer;
use crate::error::{DbError, DbResult};
use crate::models::{
    ConnectionConfig, ConnectionInfo, ConnectionStatus, HealthReport, ProviderKind,
};
use futures_util::future::join_all;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock as StdRwLock};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

struct ConnectionEntry {
    config: ConnectionConfig,
    adapter: Arc<dyn DatabaseAdapter>,
    health: Option<HealthReport>,
}

impl ConnectionEntry {
    fn info(&self) -> ConnectionInfo {
        let health = self.health.as_ref();
        ConnectionInfo {
            id: self.config.id.clone(),
            name: self.config.display_name().to_string(),
            provider: self.config.provider,
            kind: self.config.kind,
            status: health.map(|h| h.status).unwrap_or_default(),
            priority: self.config.priority,
            enabled: self.config.enabled,
            supports_transactions: self.adapter.supports_transactions(),
            last_checked: health.map(|h| h.checked_at),
            latency_ms: health.map(|h| h.latency_ms),
            last_error: health.and_then(|h| h.error.clone()),
        }
    }

    fn status(&self) -> ConnectionStatus {
        self.health.as_ref().map(|h| h.status).unwrap_or_default()
    }
}

/// Registry of adapters keyed by connection id.
#[derive(Clone)]
pub struct ConnectionManager {
    connections: Arc<RwLock<HashMap<String, ConnectionEntry>>>,
    factories: Arc<StdRwLock<HashMap<ProviderKind, Arc<dyn AdapterFactory>>>>,
    optimizer: Arc<QueryOptimizer>,
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager").finish_non_exhaustive()
    }
}

impl ConnectionManager {
    /// Create a manager with a default optimizer and the built-in adapter factories.
    pub fn new() -> Self {
        Self::with_optimizer(Arc::new(QueryOptimizer::default()))
    }

    pub fn with_optimizer(optimizer: Arc<QueryOptimizer>) -> Self {
        let factories = adapters::default_factories().into_iter().collect();
        Self {
            connections: Arc::new(RwLock::new(HashMap::new())),
            factories: Arc::new(StdRwLock::new(factories)),
            optimizer,
        }
    }

    pub fn optimizer(&self) -> &Arc<QueryOptimizer> {
        &self.optimizer
    }

    /// Replace the adapter factory used for `provider`.
    pub fn register_factory(&self, provider: ProviderKind, factory: Arc<dyn AdapterFactory>) {
        self.factories
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(provider, factory);
    }

    fn factory(&self, provider: ProviderKind) -> DbResult<Arc<dyn AdapterFactory>> {
        self.factories
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&provider)
            .cloned()
            .ok_or_else(|| DbError::config(format!("No adapter factory registered for {}", provider)))
    }

    /// Validate `config`, build its adapter, health-check it once and register it.
    ///
    /// Disabled connections are registered without a health check and stay `disconnected`.
    pub async fn add_connection(&self, config: ConnectionConfig) -> DbResult<ConnectionInfo> {
        config.validate()?;

        let connection_id = config.id.clone();
        if self.connections.read().await.contains_key(&connection_id) {
            return Err(DbError::config(format!(
                "Connection '{}' already exists",
                connection_id
            )));
        }

        info!(
            connection_id = %connection_id,
            provider = %config.provider,
            kind = ?config.kind,
            "Adding connection"
        );

        let factory = self.factory(config.provider)?;
        let adapter = factory.create(&config, Arc::clone(&self.optimizer)).await?;
        let report = if config.enabled {
            Some(measure_health(adapter.as_ref()).await)
        } else {
            debug!(connection_id = %connection_id, "Connection disabled, skipping health check");
            None
        };

        // Re-check after async work; a concurrent add may have won
        let duplicate = {
            let mut connections = self.connections.write().await;
            if connections.contains_key(&connection_id) {
                adapter
            } else {
                let entry = ConnectionEntry {
                    config,
                    adapter,
                    health: report,
                };
                let info = entry.info();
                connections.insert(connection_id.clone(), entry);
                info!(
                    connection_id = %connection_id,
                    status = %info.status,
                    latency_ms = ?info.latency_ms,
                    "Connection registered"
                );
                return Ok(info);
            }
        };

        // Close the adapter we just created outside of the lock
        duplicate.close().await;
        Err(DbError::config(format!(
            "Connection '{}' already exists",
            connection_id
        )))
    }

    /// Add every enabled config, highest priority first, and report each outcome by id.
    pub async fn add_connections(
        &self,
        configs: Vec<ConnectionConfig>,
    ) -> Vec<(String, DbResult<ConnectionInfo>)> {
        let mut enabled: Vec<ConnectionConfig> = configs
            .into_iter()
            .filter(|c| {
                if !c.enabled {
                    debug!(connection_id = %c.id, "Skipping disabled connection");
                }
                c.enabled
            })
            .collect();
        enabled.sort_by(|a, b| b.priority.cmp(&a.priority));

        let mut outcomes = Vec::with_capacity(enabled.len());
        for config in enabled {
            let id = config.id.clone();
            let outcome = self.add_connection(config).await;
            if let Err(e) = &outcome {
                warn!(connection_id = %id, error = %e, "Failed to add connection");
            }
            outcomes.push((id, outcome));
        }
        outcomes
    }

    /// Deregister and close a connection. Returns whether it was registered.
    pub async fn remove_connection(&self, connection_id: &str) -> bool {
        let removed = self.connections.write().await.remove(connection_id);
        match removed {
            Some(entry) => {
                entry.adapter.close().await;
                info!(connection_id = %connection_id, "Connection removed");
                true
            }
            None => false,
        }
    }

    pub async fn get_connection(&self, connection_id: &str) -> Option<Arc<dyn DatabaseAdapter>> {
        self.connections
            .read()
            .await
            .get(connection_id)
            .map(|entry| Arc::clone(&entry.adapter))
    }

    /// Like [`get_connection`](Self::get_connection), but unknown ids are an error.
    pub async fn require_connection(&self, connection_id: &str) -> DbResult<Arc<dyn DatabaseAdapter>> {
        self.get_connection(connection_id)
            .await
            .ok_or_else(|| DbError::connection_not_found(connection_id))
    }

    /// Every adapter keyed by connection id.
    pub async fn get_all_connections(&self) -> BTreeMap<String, Arc<dyn DatabaseAdapter>> {
        self.connections
            .read()
            .await
            .iter()
            .map(|(id, entry)| (id.clone(), Arc::clone(&entry.adapter)))
            .collect()
    }

    pub async fn get_connection_info(&self, connection_id: &str) -> Option<ConnectionInfo> {
        self.connections
            .read()
            .await
            .get(connection_id)
            .map(ConnectionEntry::info)
    }

    /// Every connection's projection, sorted by priority (descending) then id.
    pub async fn get_all_connections_info(&self) -> Vec<ConnectionInfo> {
        let connections = self.connections.read().await;
        let mut entries: Vec<&ConnectionEntry> = connections.values().collect();
        sort_entries(&mut entries);
        entries.into_iter().map(ConnectionEntry::info).collect()
    }

    /// Highest-priority enabled and connected adapter, optionally restricted to one provider.
    pub async fn preferred_connection(
        &self,
        provider: Option<ProviderKind>,
    ) -> Option<Arc<dyn DatabaseAdapter>> {
        let connections = self.connections.read().await;
        let mut candidates: Vec<&ConnectionEntry> = connections
            .values()
            .filter(|e| e.config.enabled && e.status() == ConnectionStatus::Connected)
            .filter(|e| provider.is_none_or(|p| e.config.provider == p))
            .collect();
        sort_entries(&mut candidates);
        candidates.first().map(|e| Arc::clone(&e.adapter))
    }

    pub async fn exists(&self, connection_id: &str) -> bool {
        self.connections.read().await.contains_key(connection_id)
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Health-check one connection and store the result. Unknown ids report an error status and
    /// disabled connections are reported without contacting the backend.
    pub async fn health_check(&self, connection_id: &str) -> HealthReport {
        let found = self
            .connections
            .read()
            .await
            .get(connection_id)
            .map(|entry| (Arc::clone(&entry.adapter), entry.config.enabled));
        let Some((adapter, enabled)) = found else {
            return HealthReport::error(0, "Connection not found");
        };
        if !enabled {
            return HealthReport::disabled();
        }

        let report = measure_health(adapter.as_ref()).await;
        if let Some(error) = &report.error {
            warn!(
                connection_id = %connection_id,
                latency_ms = report.latency_ms,
                error = %error,
                "Health check failed"
            );
        } else {
            debug!(connection_id = %connection_id, latency_ms = report.latency_ms, "Health check passed");
        }

        let mut connections = self.connections.write().await;
        if let Some(entry) = connections.get_mut(connection_id) {
            if Arc::ptr_eq(&entry.adapter, &adapter) {
                entry.health = Some(report.clone());
            }
        }
        report
    }

    /// Health-check every enabled connection concurrently.
    pub async fn health_check_all(&self) -> BTreeMap<String, HealthReport> {
        let ids: Vec<String> = self
            .connections
            .read()
            .await
            .values()
            .filter(|entry| entry.config.enabled)
            .map(|entry| entry.config.id.clone())
            .collect();
        let reports = join_all(ids.iter().map(|id| self.health_check(id))).await;
        ids.into_iter().zip(reports).collect()
    }

    /// Run [`health_check_all`](Self::health_check_all) every `interval` on a background task.
    pub fn start_health_monitor(&self, interval: Duration) -> JoinHandle<()> {
        let manager = self.clone();
        info!(interval_secs = interval.as_secs(), "Starting health monitor");
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let reports = manager.health_check_all().await;
                let unhealthy = reports.values().filter(|r| !r.is_connected()).count();
                debug!(
                    connections = reports.len(),
                    unhealthy = unhealthy,
                    "Health monitor pass complete"
                );
            }
        })
    }

    /// Close and deregister every connection.
    pub async fn close_all(&self) {
        let entries: Vec<(String, ConnectionEntry)> =
            self.connections.write().await.drain().collect();
        for (id, entry) in entries {
            info!(connection_id = %id, "Closing connection");
            entry.adapter.close().await;
        }
        info!("All connections closed");
    }
}

fn sort_entries(entries: &mut [&ConnectionEntry]) {
    entries.sort_by(|a, b| {
        b.config
            .priority
            .cmp(&a.config.priority)
            .then_with(|| a.config.id.cmp(&b.config.id))
    });
}

/// Bounded ping that keeps the failure reason.
async fn measure_health(adapter: &dyn DatabaseAdapter) -> HealthReport {
    let limit = adapter.health_check_timeout();
    let start = Instant::now();
    let outcome = tokio::time::timeout(limit, adapter.ping()).await;
    let latency_ms = start.elapsed().as_millis() as u64;
    match outcome {
        Ok(Ok(())) => HealthReport::connected(latency_ms),
        Ok(Err(e)) => HealthReport::error(latency_ms, e.to_string()),
        Err(_) => HealthReport::error(
            latency_ms,
            format!("Health check timed out after {}s", limit.as_secs()),
        ),
    }
}
