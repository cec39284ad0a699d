//! Connection-related data models.
//!
//! This module defines types for connection configuration, status and health reporting.

use crate::config::{
    DEFAULT_POOL_SIZE, DEFAULT_QUERY_TIMEOUT_SECS, MAX_TRANSACTION_TIMEOUT_SECS, PoolOptions,
};
use crate::error::{DbError, DbResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::str::FromStr;

/// Backend families an adapter can be built for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProviderKind {
    /// MySQL, PostgreSQL or embedded SQLite
    RelationalSql,
    /// MongoDB
    DocumentStore,
    /// Hosted PostgreSQL reached with an endpoint and a service key
    ManagedService,
}

impl ProviderKind {
    pub const ALL: [ProviderKind; 3] = [
        Self::RelationalSql,
        Self::DocumentStore,
        Self::ManagedService,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RelationalSql => "relational-sql",
            Self::DocumentStore => "document-store",
            Self::ManagedService => "managed-service",
        }
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = DbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "relational-sql" | "relational" => Ok(Self::RelationalSql),
            "document-store" | "document" => Ok(Self::DocumentStore),
            "managed-service" | "managed" => Ok(Self::ManagedService),
            other => Err(DbError::config(format!("Unknown provider: '{}'", other))),
        }
    }
}

/// Whether the backend runs in-process or behind a network endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionKind {
    Embedded,
    #[default]
    External,
}

impl std::fmt::Display for ConnectionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Embedded => f.write_str("embedded"),
            Self::External => f.write_str("external"),
        }
    }
}

/// Settings keys whose values are never shown.
const SECRET_SETTINGS: &[&str] = &["password", "service_key", "uri"];

/// Configuration for a database connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub provider: ProviderKind,
    #[serde(rename = "type", default)]
    pub kind: ConnectionKind,
    /// Provider-specific settings. Contains credentials - never log
    #[serde(rename = "config", default, skip_serializing)]
    pub settings: serde_json::Map<String, JsonValue>,
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,
    /// Bounds each query and each pool acquire
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Higher values are preferred when several connections can serve a request
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub pool_options: PoolOptions,
    /// Transactions older than this are rolled back on next use
    #[serde(default)]
    pub transaction_timeout_secs: Option<u32>,
    /// When non-empty, only these entities may be addressed
    #[serde(default)]
    pub entities: Vec<String>,
}

fn default_pool_size() -> u32 {
    DEFAULT_POOL_SIZE
}

fn default_timeout_secs() -> u64 {
    DEFAULT_QUERY_TIMEOUT_SECS
}

fn default_enabled() -> bool {
    true
}

impl ConnectionConfig {
    /// Create a configuration with default pool, timeout and priority settings.
    pub fn new(
        id: impl Into<String>,
        provider: ProviderKind,
        kind: ConnectionKind,
        settings: serde_json::Map<String, JsonValue>,
    ) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            provider,
            kind,
            settings,
            pool_size: DEFAULT_POOL_SIZE,
            timeout_secs: DEFAULT_QUERY_TIMEOUT_SECS,
            enabled: true,
            priority: 0,
            pool_options: PoolOptions::default(),
            transaction_timeout_secs: None,
            entities: Vec::new(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_pool_size(mut self, pool_size: u32) -> Self {
        self.pool_size = pool_size;
        self
    }

    pub fn with_timeout_secs(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = timeout_secs;
        self
    }

    pub fn with_entities<I, S>(mut self, entities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.entities = entities.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_setting(mut self, key: &str, value: impl Into<JsonValue>) -> Self {
        self.settings.insert(key.to_string(), value.into());
        self
    }

    /// Validate the provider-independent fields.
    ///
    /// Provider-specific settings are checked by the adapter at construction.
    pub fn validate(&self) -> DbResult<()> {
        if self.id.is_empty() {
            return Err(DbError::config("Connection ID cannot be empty"));
        }
        if !self
            .id
            .chars()
            .all(|c| c.is_alphanumeric() || c == '-' || c == '_')
        {
            return Err(DbError::config(format!(
                "Connection ID contains invalid characters: {}",
                self.id
            )));
        }
        if self.pool_size == 0 {
            return Err(DbError::config("pool_size must be greater than 0"));
        }
        if self.timeout_secs == 0 {
            return Err(DbError::config("timeout_secs must be greater than 0"));
        }
        self.pool_options.validate(self.pool_size).map_err(DbError::config)?;
        if let Some(secs) = self.transaction_timeout_secs {
            if secs == 0 || secs > MAX_TRANSACTION_TIMEOUT_SECS {
                return Err(DbError::config(format!(
                    "transaction_timeout_secs must be between 1 and {}",
                    MAX_TRANSACTION_TIMEOUT_SECS
                )));
            }
        }
        Ok(())
    }

    /// Display name, falling back to the id.
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.id
        } else {
            &self.name
        }
    }

    /// String setting, treating empty strings as missing.
    pub fn setting_str(&self, key: &str) -> Option<&str> {
        self.settings
            .get(key)
            .and_then(JsonValue::as_str)
            .filter(|s| !s.trim().is_empty())
    }

    /// Required string setting.
    pub fn require_str(&self, key: &str) -> DbResult<&str> {
        self.setting_str(key)
            .ok_or_else(|| DbError::missing_setting(self.provider, key))
    }

    /// Port setting, accepted as a number or numeric string.
    pub fn setting_port(&self, key: &str) -> DbResult<Option<u16>> {
        match self.settings.get(key) {
            None | Some(JsonValue::Null) => Ok(None),
            Some(JsonValue::Number(n)) => n
                .as_u64()
                .and_then(|p| u16::try_from(p).ok())
                .map(Some)
                .ok_or_else(|| DbError::config(format!("Invalid port: {}", n))),
            Some(JsonValue::String(s)) => s
                .parse::<u16>()
                .map(Some)
                .map_err(|_| DbError::config(format!("Invalid port: {}", s))),
            Some(other) => Err(DbError::config(format!("Invalid port: {}", other))),
        }
    }

    /// Boolean setting, accepted as a bool or "true"/"false" string.
    pub fn setting_bool(&self, key: &str, default: bool) -> bool {
        match self.settings.get(key) {
            Some(JsonValue::Bool(b)) => *b,
            Some(JsonValue::String(s)) if s.eq_ignore_ascii_case("true") => true,
            Some(JsonValue::String(s)) if s.eq_ignore_ascii_case("false") => false,
            _ => default,
        }
    }

    /// Settings with credentials replaced by `****`.
    pub fn masked_settings(&self) -> serde_json::Map<String, JsonValue> {
        self.settings
            .iter()
            .map(|(k, v)| {
                if SECRET_SETTINGS.contains(&k.as_str()) {
                    (k.clone(), JsonValue::String("****".to_string()))
                } else {
                    (k.clone(), v.clone())
                }
            })
            .collect()
    }
}

/// Live status of a registered connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Connected,
    /// Registered but not yet checked
    #[default]
    Disconnected,
    Error,
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connected => f.write_str("connected"),
            Self::Disconnected => f.write_str("disconnected"),
            Self::Error => f.write_str("error"),
        }
    }
}

/// Result of one health check.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: ConnectionStatus,
    pub latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub checked_at: DateTime<Utc>,
}

impl HealthReport {
    pub fn connected(latency_ms: u64) -> Self {
        Self {
            status: ConnectionStatus::Connected,
            latency_ms,
            error: None,
            checked_at: Utc::now(),
        }
    }

    pub fn error(latency_ms: u64, message: impl Into<String>) -> Self {
        Self {
            status: ConnectionStatus::Error,
            latency_ms,
            error: Some(message.into()),
            checked_at: Utc::now(),
        }
    }

    /// Report for a registered connection that is switched off. Nothing is checked.
    pub fn disabled() -> Self {
        Self {
            status: ConnectionStatus::Disconnected,
            latency_ms: 0,
            error: Some("Connection is disabled".to_string()),
            checked_at: Utc::now(),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.status == ConnectionStatus::Connected
    }
}

/// Read-only view of a registered connection (no secrets exposed).
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo {
    pub id: String,
    pub name: String,
    pub provider: ProviderKind,
    #[serde(rename = "type")]
    pub kind: ConnectionKind,
    pub status: ConnectionStatus,
    pub priority: i32,
    pub enabled: bool,
    pub supports_transactions: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_checked: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Transaction state for transaction contexts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionState {
    Active,
    Committed,
    RolledBack,
    /// Automatically rolled back due to timeout
    TimedOut,
}

impl TransactionState {
    /// Check if the transaction is still active.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active)
    }

    /// Check if the transaction has ended (committed, rolled back, or timed out).
    pub fn is_ended(&self) -> bool {
        !self.is_active()
    }
}

impl std::fmt::Display for TransactionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => f.write_str("active"),
            Self::Committed => f.write_str("committed"),
            Self::RolledBack => f.write_str("rolled back"),
            Self::TimedOut => f.write_str("timed out"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn settings(value: JsonValue) -> serde_json::Map<String, JsonValue> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_provider_from_str() {
        assert_eq!(
            "relational-sql".parse::<ProviderKind>().unwrap(),
            ProviderKind::RelationalSql
        );
        assert_eq!(
            "Document-Store".parse::<ProviderKind>().unwrap(),
            ProviderKind::DocumentStore
        );
        assert_eq!(
            "managed".parse::<ProviderKind>().unwrap(),
            ProviderKind::ManagedService
        );
        assert!(matches!(
            "graph".parse::<ProviderKind>(),
            Err(DbError::ConfigValidation { .. })
        ));
    }

    #[test]
    fn test_config_deserialize_shape() {
        let config: ConnectionConfig = serde_json::from_value(json!({
            "id": "primary",
            "name": "Primary DB",
            "provider": "relational-sql",
            "type": "external",
            "config": {"host": "db", "port": 3306},
            "enabled": true,
            "priority": 5
        }))
        .unwrap();

        assert_eq!(config.provider, ProviderKind::RelationalSql);
        assert_eq!(config.kind, ConnectionKind::External);
        assert_eq!(config.priority, 5);
        assert_eq!(config.pool_size, DEFAULT_POOL_SIZE);
        assert_eq!(config.setting_port("port").unwrap(), Some(3306));
    }

    #[test]
    fn test_config_unknown_provider_rejected() {
        let result: Result<ConnectionConfig, _> = serde_json::from_value(json!({
            "id": "x",
            "provider": "graph-db",
        }));
        assert!(result.is_err());
    }

    #[test]
    fn test_config_serialization_hides_settings() {
        let config = ConnectionConfig::new(
            "db",
            ProviderKind::ManagedService,
            ConnectionKind::External,
            settings(json!({"service_key": "secret"})),
        );
        let text = serde_json::to_string(&config).unwrap();
        assert!(!text.contains("secret"));
    }

    #[test]
    fn test_masked_settings() {
        let config = ConnectionConfig::new(
            "db",
            ProviderKind::RelationalSql,
            ConnectionKind::External,
            settings(json!({"host": "db", "password": "hunter2"})),
        );
        let masked = config.masked_settings();
        assert_eq!(masked["password"], "****");
        assert_eq!(masked["host"], "db");
    }

    #[test]
    fn test_validate_rejects_bad_ids() {
        let mut config = ConnectionConfig::new(
            "",
            ProviderKind::RelationalSql,
            ConnectionKind::Embedded,
            Default::default(),
        );
        assert!(config.validate().is_err());

        config.id = "has space".to_string();
        assert!(config.validate().is_err());

        config.id = "ok_id-1".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_pool() {
        let config = ConnectionConfig::new(
            "db",
            ProviderKind::RelationalSql,
            ConnectionKind::Embedded,
            Default::default(),
        )
        .with_pool_size(0);
        assert!(matches!(
            config.validate(),
            Err(DbError::ConfigValidation { .. })
        ));
    }

    #[test]
    fn test_setting_helpers() {
        let config = ConnectionConfig::new(
            "db",
            ProviderKind::RelationalSql,
            ConnectionKind::External,
            settings(json!({"host": "  ", "port": "5432", "timestamps": "false"})),
        );
        assert!(config.setting_str("host").is_none());
        assert!(config.require_str("host").is_err());
        assert_eq!(config.setting_port("port").unwrap(), Some(5432));
        assert!(!config.setting_bool("timestamps", true));
        assert!(config.setting_bool("soft_delete", true));
    }

    #[test]
    fn test_transaction_state() {
        assert!(TransactionState::Active.is_active());
        assert!(!TransactionState::Committed.is_active());
        assert!(TransactionState::Committed.is_ended());
        assert!(TransactionState::TimedOut.is_ended());
    }
}
