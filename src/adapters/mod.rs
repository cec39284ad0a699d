//! Provider adapters.
//!
//! One adapter per provider kind:
//! - [`RelationalAdapter`]: MySQL, PostgreSQL and embedded SQLite through sqlx
//! - [`DocumentAdapter`]: MongoDB
//! - [`ManagedPostgresAdapter`]: hosted PostgreSQL reached with a service key

pub mod document;
pub mod managed;
pub mod relational;
mod sql_store;

pub use document::{DocumentAdapter, DocumentFactory, MongoTransaction};
pub use managed::{ManagedFactory, ManagedPostgresAdapter};
pub use relational::{RelationalAdapter, RelationalFactory};
pub use sql_store::SqlStore;

use crate::db::AdapterFactory;
use crate::models::ProviderKind;
use std::sync::Arc;

/// The factory registered for each provider kind by default.
pub fn default_factories() -> Vec<(ProviderKind, Arc<dyn AdapterFactory>)> {
    vec![
        (ProviderKind::RelationalSql, Arc::new(RelationalFactory)),
        (ProviderKind::DocumentStore, Arc::new(DocumentFactory)),
        (ProviderKind::ManagedService, Arc::new(ManagedFactory)),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_provider_has_a_factory() {
        let providers: Vec<ProviderKind> = default_factories().into_iter().map(|(p, _)| p).collect();
        for provider in [
            ProviderKind::RelationalSql,
            ProviderKind::DocumentStore,
            ProviderKind::ManagedService,
        ] {
            assert!(providers.contains(&provider));
        }
    }
}
