//! Query performance metrics models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One observed adapter call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryMetric {
    /// Connection that served the call, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<String>,
    /// Entity (table or collection) addressed by the call.
    pub entity: String,
    /// Operation kind, e.g. `find` or `commit`.
    pub operation: String,
    /// Wall-clock duration in milliseconds.
    pub duration_ms: u64,
    pub timestamp: DateTime<Utc>,
    /// Whether the result came from a cache. Adapters never serve from cache and always
    /// record `false`; a caching layer above them records its hits through
    /// [`QueryOptimizer::record_query`](crate::db::QueryOptimizer::record_query).
    #[serde(default)]
    pub cached: bool,
    /// Value-free description of the call shape.
    pub query: String,
    pub success: bool,
    /// Rows returned or affected.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub row_count: Option<u64>,
}

impl QueryMetric {
    pub fn new(entity: impl Into<String>, operation: impl Into<String>, duration_ms: u64) -> Self {
        let entity = entity.into();
        let operation = operation.into();
        Self {
            connection_id: None,
            query: format!("{} {}", operation, entity),
            entity,
            operation,
            duration_ms,
            timestamp: Utc::now(),
            cached: false,
            success: true,
            row_count: None,
        }
    }

    pub fn with_connection(mut self, connection_id: impl Into<String>) -> Self {
        self.connection_id = Some(connection_id.into());
        self
    }

    pub fn with_query(mut self, query: impl Into<String>) -> Self {
        self.query = query.into();
        self
    }

    pub fn with_row_count(mut self, row_count: u64) -> Self {
        self.row_count = Some(row_count);
        self
    }

    pub fn cached(mut self, cached: bool) -> Self {
        self.cached = cached;
        self
    }

    pub fn failed(mut self) -> Self {
        self.success = false;
        self
    }
}

/// Kind of optimization hint derived from recorded metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendationKind {
    SlowQueries,
    RepeatedQuery,
    HighAverageDuration,
    LowCacheHitRatio,
    OverFetching,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    pub kind: RecommendationKind,
    pub message: String,
}

/// Per-entity rollup of recorded metrics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EntityAnalysis {
    pub entity: String,
    pub total_queries: u64,
    pub average_duration_ms: f64,
    pub slow_queries: u64,
    pub cached_queries: u64,
    pub recommendations: Vec<Recommendation>,
}

impl EntityAnalysis {
    pub fn has_recommendation(&self, kind: RecommendationKind) -> bool {
        self.recommendations.iter().any(|r| r.kind == kind)
    }
}

/// Global rollup across all recorded metrics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryStatistics {
    pub total_queries: u64,
    pub average_duration_ms: f64,
    pub slow_queries: u64,
    pub cached_queries: u64,
    pub failed_queries: u64,
    /// Distinct entity names, sorted.
    pub entities: Vec<String>,
}
