//! Database core library.
//!
//! A provider-agnostic data-access runtime: the same CRUD, transaction and aggregation
//! operations run against relational databases (MySQL, PostgreSQL, SQLite), MongoDB and
//! managed PostgreSQL services. Connections are owned by a [`ConnectionManager`] that tracks
//! their health, and every call is timed by a [`QueryOptimizer`](db::QueryOptimizer).

pub mod adapters;
pub mod config;
pub mod db;
pub mod error;
pub mod models;

pub use config::Config;
pub use db::{ConnectionManager, DatabaseAdapter, TransactionContext};
pub use error::{DbError, DbResult};
