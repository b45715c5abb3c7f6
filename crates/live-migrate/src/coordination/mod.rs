//! Shared coordination channel between the engine and application instances.
//!
//! The engine never blocks writes itself. It publishes intent through a
//! key/value + pub/sub store that application instances watch:
//!
//! | Key / topic | Meaning |
//! |---|---|
//! | `db:readonly` | present while writes must be rejected (expires after a TTL) |
//! | `db:active_store` | store the application should use |
//! | `db:mode` | `{mode: readonly|normal, reason, timestamp}` |
//! | `db:cutover` | `{from, to, migrationId, timestamp}` |
//! | `db:rollback` | `{migrationId, timestamp}` |
//!
//! - [`memory`]: in-process store with a broadcast subscription
//! - [`redis`]: Redis via a `ConnectionManager`

pub mod memory;
pub mod redis;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

pub use self::memory::{MemoryCoordination, Published};
pub use self::redis::RedisCoordination;

use crate::config::CoordinationConfig;
use crate::error::{MigrateError, Result};

pub const READ_ONLY_KEY: &str = "db:readonly";
pub const ACTIVE_STORE_KEY: &str = "db:active_store";
pub const MODE_TOPIC: &str = "db:mode";
pub const CUTOVER_TOPIC: &str = "db:cutover";
pub const ROLLBACK_TOPIC: &str = "db:rollback";

/// Key/value + pub/sub backend.
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Set a key, optionally expiring after `ttl`.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()>;

    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn delete(&self, key: &str) -> Result<()>;

    /// Publish a message to a topic.
    async fn publish(&self, topic: &str, payload: &str) -> Result<()>;

    /// Backend identifier ("memory", "redis").
    fn backend(&self) -> &str;
}

/// Open the coordination backend matching the configured URL scheme.
pub async fn connect_coordination(config: &CoordinationConfig) -> Result<Arc<dyn CoordinationStore>> {
    match config.scheme().as_str() {
        "redis" | "rediss" => Ok(Arc::new(RedisCoordination::connect(&config.url).await?)),
        "memory" => Ok(Arc::new(MemoryCoordination::new())),
        other => Err(MigrateError::Config(format!(
            "Unknown coordination scheme: '{}'. Supported schemes: redis, rediss, memory",
            other
        ))),
    }
}

/// Write mode announced on `db:mode`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteMode {
    ReadOnly,
    Normal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModeMessage {
    pub mode: WriteMode,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CutoverMessage {
    pub from: String,
    pub to: String,
    pub migration_id: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RollbackMessage {
    pub migration_id: String,
    pub timestamp: DateTime<Utc>,
}

/// Typed operations of one migration on the coordination channel.
#[derive(Clone)]
pub struct Coordinator {
    store: Arc<dyn CoordinationStore>,
    migration_id: String,
    read_only_ttl: Duration,
}

impl Coordinator {
    pub fn new(store: Arc<dyn CoordinationStore>, migration_id: impl Into<String>, read_only_ttl: Duration) -> Self {
        Self {
            store,
            migration_id: migration_id.into(),
            read_only_ttl,
        }
    }

    pub fn migration_id(&self) -> &str {
        &self.migration_id
    }

    async fn publish<T: Serialize>(&self, topic: &str, message: &T) -> Result<()> {
        let payload = serde_json::to_string(message)?;
        self.store.publish(topic, &payload).await
    }

    async fn announce_mode(&self, mode: WriteMode, reason: &str) -> Result<()> {
        self.publish(
            MODE_TOPIC,
            &ModeMessage {
                mode,
                reason: reason.to_string(),
                timestamp: Utc::now(),
            },
        )
        .await
    }

    /// Raise the read-only flag and announce it.
    pub async fn enter_read_only(&self, reason: &str) -> Result<()> {
        self.store
            .set(READ_ONLY_KEY, "true", Some(self.read_only_ttl))
            .await?;
        self.announce_mode(WriteMode::ReadOnly, reason).await?;
        info!("Read-only mode enabled ({})", reason);
        Ok(())
    }

    /// Clear the read-only flag and announce normal mode.
    pub async fn exit_read_only(&self, reason: &str) -> Result<()> {
        self.store.delete(READ_ONLY_KEY).await?;
        self.announce_mode(WriteMode::Normal, reason).await?;
        info!("Read-only mode disabled ({})", reason);
        Ok(())
    }

    pub async fn is_read_only(&self) -> Result<bool> {
        Ok(self.store.get(READ_ONLY_KEY).await?.is_some())
    }

    pub async fn set_active_store(&self, store: &str) -> Result<()> {
        self.store.set(ACTIVE_STORE_KEY, store, None).await
    }

    pub async fn active_store(&self) -> Result<Option<String>> {
        self.store.get(ACTIVE_STORE_KEY).await
    }

    pub async fn announce_cutover(&self, from: &str, to: &str) -> Result<()> {
        self.publish(
            CUTOVER_TOPIC,
            &CutoverMessage {
                from: from.to_string(),
                to: to.to_string(),
                migration_id: self.migration_id.clone(),
                timestamp: Utc::now(),
            },
        )
        .await
    }

    pub async fn announce_rollback(&self) -> Result<()> {
        self.publish(
            ROLLBACK_TOPIC,
            &RollbackMessage {
                migration_id: self.migration_id.clone(),
                timestamp: Utc::now(),
            },
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_read_only_round_trip() {
        let store = Arc::new(MemoryCoordination::new());
        let coordinator = Coordinator::new(store.clone(), "m-1", Duration::from_secs(60));

        coordinator.enter_read_only("cutover").await.unwrap();
        assert!(coordinator.is_read_only().await.unwrap());
        coordinator.exit_read_only("done").await.unwrap();
        assert!(!coordinator.is_read_only().await.unwrap());

        let modes: Vec<ModeMessage> = store
            .published_on(MODE_TOPIC)
            .iter()
            .map(|p| serde_json::from_str(p).unwrap())
            .collect();
        assert_eq!(modes.len(), 2);
        assert_eq!(modes[0].mode, WriteMode::ReadOnly);
        assert_eq!(modes[1].mode, WriteMode::Normal);
    }

    #[tokio::test]
    async fn test_cutover_message_uses_camel_case() {
        let store = Arc::new(MemoryCoordination::new());
        let coordinator = Coordinator::new(store.clone(), "m-7", Duration::from_secs(60));
        coordinator.announce_cutover("old", "new").await.unwrap();

        let payload = &store.published_on(CUTOVER_TOPIC)[0];
        let json: serde_json::Value = serde_json::from_str(payload).unwrap();
        assert_eq!(json["migrationId"], "m-7");
        assert_eq!(json["to"], "new");
    }

    #[test]
    fn test_mode_serialization() {
        assert_eq!(
            serde_json::to_string(&WriteMode::ReadOnly).unwrap(),
            "\"readonly\""
        );
    }

    #[tokio::test]
    async fn test_unknown_scheme() {
        let config = CoordinationConfig {
            url: "nats://x".into(),
            read_only_ttl_secs: 1,
        };
        assert!(connect_coordination(&config).await.is_err());
    }
}
