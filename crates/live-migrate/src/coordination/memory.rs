//! In-process coordination store.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio::time::Instant;

use super::CoordinationStore;
use crate::error::Result;

/// A message published on a topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Published {
    pub topic: String,
    pub payload: String,
}

#[derive(Default)]
struct Inner {
    values: HashMap<String, (String, Option<Instant>)>,
    log: Vec<Published>,
}

/// Coordination store living in the engine process.
///
/// Keeps every published message so observers can also inspect the history
/// after the fact, and fans messages out to live subscribers.
pub struct MemoryCoordination {
    inner: Mutex<Inner>,
    events: broadcast::Sender<Published>,
}

impl Default for MemoryCoordination {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCoordination {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            inner: Mutex::new(Inner::default()),
            events,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Published> {
        self.events.subscribe()
    }

    /// Every message published so far.
    pub fn published(&self) -> Vec<Published> {
        self.lock().log.clone()
    }

    /// Payloads published on one topic, oldest first.
    pub fn published_on(&self, topic: &str) -> Vec<String> {
        self.lock()
            .log
            .iter()
            .filter(|p| p.topic == topic)
            .map(|p| p.payload.clone())
            .collect()
    }
}

#[async_trait]
impl CoordinationStore for MemoryCoordination {
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let expires = ttl.map(|ttl| Instant::now() + ttl);
        self.lock()
            .values
            .insert(key.to_string(), (value.to_string(), expires));
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut inner = self.lock();
        let expired = matches!(
            inner.values.get(key),
            Some((_, Some(expires))) if *expires <= Instant::now()
        );
        if expired {
            inner.values.remove(key);
            return Ok(None);
        }
        Ok(inner.values.get(key).map(|(v, _)| v.clone()))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.lock().values.remove(key);
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: &str) -> Result<()> {
        let message = Published {
            topic: topic.to_string(),
            payload: payload.to_string(),
        };
        self.lock().log.push(message.clone());
        // no subscribers is fine
        let _ = self.events.send(message);
        Ok(())
    }

    fn backend(&self) -> &str {
        "memory"
    }
}
