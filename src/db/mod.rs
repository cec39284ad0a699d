//! Database abstraction layer.
//!
//! This module provides the provider-agnostic runtime:
//! - The adapter contract and adapter factories
//! - Connection registry with health monitoring
//! - SQL statement building, parameter binding and row decoding
//! - Connection pools and record-level execution
//! - Transaction and savepoint coordination
//! - Query performance observation

pub mod adapter;
pub mod executor;
#[macro_use]
pub mod macros;
pub mod manager;
pub mod optimizer;
pub mod params;
pub mod pool;
pub mod sql;
pub mod transaction;
pub mod types;

pub use adapter::{AdapterFactory, DatabaseAdapter};
pub use executor::{RecordConvention, SqlConn, SqlExecutor};
pub use manager::ConnectionManager;
pub use optimizer::{OptimizerConfig, QueryOptimizer};
pub use pool::{DbPool, DbTransaction, PoolConfig, PoolStats};
pub use sql::{Dialect, SqlBuilder, Statement};
pub use transaction::{
    NativeTransaction, TransactionContext, TransactionCoordinator, TransactionInfo,
};
