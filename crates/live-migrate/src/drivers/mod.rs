//! Store adapter implementations.
//!
//! - [`memory`]: in-process store (`memory://`)
//! - [`postgres`]: PostgreSQL via deadpool-postgres (`postgres://`, `postgresql://`)
//! - [`tls`]: rustls setup shared by PostgreSQL connections
//!
//! # Adding a store
//!
//! 1. Create a module under `drivers/` implementing [`StoreAdapter`]
//! 2. Map its URL scheme in [`connect_store`]
//! 3. Add the scheme to the accepted list in config validation

pub mod memory;
pub mod postgres;
pub mod tls;

use std::sync::Arc;

pub use memory::MemoryStore;
pub use postgres::PostgresStore;
pub use tls::SslMode;

use crate::config::StoreConfig;
use crate::core::StoreAdapter;
use crate::error::{MigrateError, Result};

/// Open the adapter matching the URL scheme of a store configuration.
pub async fn connect_store(config: &StoreConfig) -> Result<Arc<dyn StoreAdapter>> {
    match config.scheme().as_str() {
        "postgres" | "postgresql" => Ok(Arc::new(PostgresStore::connect(config).await?)),
        "memory" => Ok(Arc::new(MemoryStore::new())),
        other => Err(MigrateError::Config(format!(
            "Unknown store scheme: '{}'. Supported schemes: postgres, postgresql, memory",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(url: &str) -> StoreConfig {
        StoreConfig {
            url: url.to_string(),
            ssl_mode: "disable".to_string(),
            schema: "public".to_string(),
            max_connections: 2,
        }
    }

    #[tokio::test]
    async fn test_connect_memory_store() {
        let adapter = connect_store(&store("memory://")).await.unwrap();
        assert_eq!(adapter.store_type(), "memory");
    }

    #[tokio::test]
    async fn test_unknown_scheme_is_config_error() {
        let err = connect_store(&store("mongodb://localhost/db")).await.err().unwrap();
        assert!(matches!(err, MigrateError::Config(_)));
    }
}
