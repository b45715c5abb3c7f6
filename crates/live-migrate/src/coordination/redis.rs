//! Redis coordination store.

use std::time::Duration;

use ::redis::aio::ConnectionManager;
use ::redis::{AsyncCommands, Client};
use async_trait::async_trait;
use tracing::info;

use super::CoordinationStore;
use crate::config::redact_url;
use crate::error::{MigrateError, Result};

/// Coordination through a shared Redis instance.
///
/// `ConnectionManager` reconnects on its own; each call clones the handle,
/// which is cheap and shares the underlying multiplexed connection.
pub struct RedisCoordination {
    conn: ConnectionManager,
}

impl RedisCoordination {
    pub async fn connect(url: &str) -> Result<Self> {
        let label = redact_url(url);
        let client = Client::open(url)
            .map_err(|e| MigrateError::Config(format!("invalid redis url {}: {}", label, e)))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| MigrateError::connectivity(label.clone(), e.to_string()))?;
        info!("Connected to coordination store {}", label);
        Ok(Self { conn })
    }
}

#[async_trait]
impl CoordinationStore for RedisCoordination {
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let mut conn = self.conn.clone();
        match ttl {
            Some(ttl) => {
                conn.set_ex::<_, _, ()>(key, value, ttl.as_secs().max(1))
                    .await?
            }
            None => conn.set::<_, _, ()>(key, value).await?,
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        Ok(conn.get::<_, Option<String>>(key).await?)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(key).await?;
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let receivers: i64 = conn.publish(topic, payload).await?;
        tracing::debug!("published on {} to {} subscribers", topic, receivers);
        Ok(())
    }

    fn backend(&self) -> &str {
        "redis"
    }
}
