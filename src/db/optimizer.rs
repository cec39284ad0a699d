//! Query performance observation.
//!
//! Every adapter call is timed and recorded into a bounded in-memory buffer. Analysis runs
//! over a snapshot of that buffer, so readers never hold the lock while computing.

use crate::config::{DEFAULT_METRICS_CAPACITY, DEFAULT_SLOW_QUERY_THRESHOLD_MS};
use crate::error::DbResult;
use crate::models::{
    EntityAnalysis, OperationResult, QueryMetric, QueryStatistics, Recommendation,
    RecommendationKind, Record,
};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use tracing::warn;

/// Entity name recorded for transaction control calls.
pub const TRANSACTION_ENTITY: &str = "<transaction>";

/// Operations whose row counts feed the over-fetching check.
const READ_OPERATIONS: [&str; 3] = ["find", "aggregate", "find_one"];

/// Thresholds used by [`QueryOptimizer`].
#[derive(Debug, Clone, PartialEq)]
pub struct OptimizerConfig {
    pub capacity: usize,
    pub slow_query_threshold_ms: u64,
    pub high_average_ms: f64,
    pub repetition_threshold: usize,
    pub cache_sample_minimum: u64,
    pub cache_hit_ratio_floor: f64,
    pub over_fetch_rows: f64,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_METRICS_CAPACITY,
            slow_query_threshold_ms: DEFAULT_SLOW_QUERY_THRESHOLD_MS,
            high_average_ms: 500.0,
            repetition_threshold: 10,
            cache_sample_minimum: 20,
            cache_hit_ratio_floor: 0.2,
            over_fetch_rows: 100.0,
        }
    }
}

/// Values that can report how many rows an operation returned or touched.
pub trait RowCount {
    fn row_count(&self) -> Option<u64>;
}

impl RowCount for Vec<Record> {
    fn row_count(&self) -> Option<u64> {
        Some(self.len() as u64)
    }
}

impl RowCount for Option<Record> {
    fn row_count(&self) -> Option<u64> {
        Some(u64::from(self.is_some()))
    }
}

impl RowCount for Record {
    fn row_count(&self) -> Option<u64> {
        Some(1)
    }
}

impl RowCount for bool {
    fn row_count(&self) -> Option<u64> {
        Some(u64::from(*self))
    }
}

impl RowCount for u64 {
    fn row_count(&self) -> Option<u64> {
        None
    }
}

impl RowCount for () {
    fn row_count(&self) -> Option<u64> {
        None
    }
}

impl RowCount for String {
    fn row_count(&self) -> Option<u64> {
        None
    }
}

impl RowCount for OperationResult {
    fn row_count(&self) -> Option<u64> {
        match self {
            OperationResult::Count(_) => None,
            other => Some(OperationResult::row_count(other)),
        }
    }
}

impl RowCount for crate::db::transaction::TransactionContext {
    fn row_count(&self) -> Option<u64> {
        None
    }
}

/// Records per-call metrics and derives optimization hints.
#[derive(Debug)]
pub struct QueryOptimizer {
    config: OptimizerConfig,
    metrics: Mutex<VecDeque<QueryMetric>>,
}

impl Default for QueryOptimizer {
    fn default() -> Self {
        Self::new(OptimizerConfig::default())
    }
}

impl QueryOptimizer {
    pub fn new(config: OptimizerConfig) -> Self {
        let capacity = config.capacity.max(1);
        Self {
            config: OptimizerConfig { capacity, ..config },
            metrics: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
        }
    }

    pub fn config(&self) -> &OptimizerConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<QueryMetric>> {
        self.metrics.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn snapshot(&self) -> Vec<QueryMetric> {
        self.lock().iter().cloned().collect()
    }

    fn is_slow(&self, metric: &QueryMetric) -> bool {
        metric.duration_ms > self.config.slow_query_threshold_ms
    }

    /// Append a metric, evicting the oldest one when the buffer is full.
    pub fn record_query(&self, metric: QueryMetric) {
        if self.is_slow(&metric) {
            warn!(
                connection_id = ?metric.connection_id,
                entity = %metric.entity,
                operation = %metric.operation,
                duration_ms = metric.duration_ms,
                query = %metric.query,
                "Slow query detected"
            );
        }

        let mut metrics = self.lock();
        while metrics.len() >= self.config.capacity {
            metrics.pop_front();
        }
        metrics.push_back(metric);
    }

    /// Time `future` and record its outcome, whether it succeeds or fails.
    pub async fn observe<T, F>(
        &self,
        connection_id: &str,
        entity: &str,
        operation: &str,
        descriptor: String,
        future: F,
    ) -> DbResult<T>
    where
        T: RowCount,
        F: Future<Output = DbResult<T>>,
    {
        let start = Instant::now();
        let result = future.await;
        let duration_ms = start.elapsed().as_millis() as u64;

        let mut metric = QueryMetric::new(entity, operation, duration_ms)
            .with_connection(connection_id)
            .with_query(descriptor);
        match &result {
            Ok(value) => {
                if let Some(rows) = value.row_count() {
                    metric = metric.with_row_count(rows);
                }
            }
            Err(_) => metric = metric.failed(),
        }
        self.record_query(metric);
        result
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Roll up every metric recorded for `entity`.
    pub fn analyze_entity(&self, entity: &str) -> EntityAnalysis {
        let metrics: Vec<QueryMetric> = self
            .snapshot()
            .into_iter()
            .filter(|m| m.entity == entity)
            .collect();

        let mut analysis = EntityAnalysis {
            entity: entity.to_string(),
            total_queries: metrics.len() as u64,
            ..Default::default()
        };
        if metrics.is_empty() {
            return analysis;
        }

        let total_ms: u64 = metrics.iter().map(|m| m.duration_ms).sum();
        analysis.average_duration_ms = total_ms as f64 / metrics.len() as f64;
        analysis.slow_queries = metrics.iter().filter(|m| self.is_slow(m)).count() as u64;
        analysis.cached_queries = metrics.iter().filter(|m| m.cached).count() as u64;
        analysis.recommendations = self.recommendations(entity, &metrics, &analysis);
        analysis
    }

    fn recommendations(
        &self,
        entity: &str,
        metrics: &[QueryMetric],
        analysis: &EntityAnalysis,
    ) -> Vec<Recommendation> {
        let mut out = Vec::new();

        if analysis.slow_queries > 0 {
            out.push(Recommendation {
                kind: RecommendationKind::SlowQueries,
                message: format!(
                    "{} slow queries on '{}'; consider adding an index on the filtered fields",
                    analysis.slow_queries, entity
                ),
            });
        }

        let mut repeats: HashMap<&str, usize> = HashMap::new();
        for metric in metrics {
            *repeats.entry(metric.query.as_str()).or_default() += 1;
        }
        let mut repeated: Vec<(&str, usize)> = repeats
            .into_iter()
            .filter(|(_, n)| *n > self.config.repetition_threshold)
            .collect();
        repeated.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
        for (query, n) in repeated {
            out.push(Recommendation {
                kind: RecommendationKind::RepeatedQuery,
                message: format!(
                    "Query shape '{}' ran {} times; consider caching results for repeated values",
                    query, n
                ),
            });
        }

        if analysis.average_duration_ms > self.config.high_average_ms {
            out.push(Recommendation {
                kind: RecommendationKind::HighAverageDuration,
                message: format!(
                    "Average duration on '{}' is {:.0} ms; review query shape and indexes",
                    entity, analysis.average_duration_ms
                ),
            });
        }

        if analysis.total_queries > self.config.cache_sample_minimum {
            let ratio = analysis.cached_queries as f64 / analysis.total_queries as f64;
            if ratio < self.config.cache_hit_ratio_floor {
                out.push(Recommendation {
                    kind: RecommendationKind::LowCacheHitRatio,
                    message: format!(
                        "Only {:.0}% of queries on '{}' are served from cache",
                        ratio * 100.0,
                        entity
                    ),
                });
            }
        }

        let read_rows: Vec<u64> = metrics
            .iter()
            .filter(|m| READ_OPERATIONS.contains(&m.operation.as_str()))
            .filter_map(|m| m.row_count)
            .collect();
        if !read_rows.is_empty() {
            let average = read_rows.iter().sum::<u64>() as f64 / read_rows.len() as f64;
            if average > self.config.over_fetch_rows {
                out.push(Recommendation {
                    kind: RecommendationKind::OverFetching,
                    message: format!(
                        "Reads on '{}' return {:.0} rows on average; paginate with limit and offset",
                        entity, average
                    ),
                });
            }
        }

        out
    }

    /// Slow metrics, slowest first.
    pub fn get_slow_queries(&self, limit: usize) -> Vec<QueryMetric> {
        let mut slow: Vec<QueryMetric> = self
            .snapshot()
            .into_iter()
            .filter(|m| self.is_slow(m))
            .collect();
        slow.sort_by(|a, b| b.duration_ms.cmp(&a.duration_ms));
        slow.truncate(limit);
        slow
    }

    pub fn get_statistics(&self) -> QueryStatistics {
        let metrics = self.snapshot();
        if metrics.is_empty() {
            return QueryStatistics::default();
        }

        let total_ms: u64 = metrics.iter().map(|m| m.duration_ms).sum();
        let entities: BTreeSet<&str> = metrics.iter().map(|m| m.entity.as_str()).collect();
        QueryStatistics {
            total_queries: metrics.len() as u64,
            average_duration_ms: total_ms as f64 / metrics.len() as f64,
            slow_queries: metrics.iter().filter(|m| self.is_slow(m)).count() as u64,
            cached_queries: metrics.iter().filter(|m| m.cached).count() as u64,
            failed_queries: metrics.iter().filter(|m| !m.success).count() as u64,
            entities: entities.into_iter().map(String::from).collect(),
        }
    }

    pub fn clear_statistics(&self) {
        self.lock().clear();
    }
}
