//! Data models for the database core.
//!
//! This module re-exports all model types used throughout the crate.

pub mod connection;
pub mod metrics;
pub mod record;

// Re-export commonly used types
pub use connection::{
    ConnectionConfig, ConnectionInfo, ConnectionKind, ConnectionStatus, HealthReport,
    ProviderKind, TransactionState,
};
pub use metrics::{
    EntityAnalysis, QueryMetric, QueryStatistics, Recommendation, RecommendationKind,
};
pub use record::{
    Conditions, FindOptions, Operation, OperationResult, OrderBy, QueryParam, Record,
    SortDirection,
};
