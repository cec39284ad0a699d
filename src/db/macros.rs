//! Backend dispatch macro.
//!
//! Pools, connections and transactions are enums with one variant per SQL backend.
//! `db_dispatch!` expands the three match arms so a body written once runs against
//! whichever backend the value holds.

/// Run `$body` with `$bind` bound to the inner value of a MySql/Postgres/SQLite enum.
///
/// # Example
///
/// ```ignore
/// db_dispatch!(DbPool, pool, p => p.close().await)
/// ```
#[macro_export]
macro_rules! db_dispatch {
    ($enum:ident, $value:expr, $bind:ident => $body:expr) => {
        match $value {
            $enum::MySql($bind) => $body,
            $enum::Postgres($bind) => $body,
            $enum::SQLite($bind) => $body,
        }
    };
}

pub use db_dispatch;
