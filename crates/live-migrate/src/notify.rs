//! Operator notifications.
//!
//! The engine only produces plain-text messages; delivering them to chat or
//! paging systems is up to the [`NotificationSink`] the caller injects.

use std::sync::Mutex;

use async_trait::async_trait;
use tracing::info;

/// Receives operator-facing alerts. Delivery failures must not affect the migration.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, message: &str);
}

/// Emits notifications as log events.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogSink;

#[async_trait]
impl NotificationSink for LogSink {
    async fn notify(&self, message: &str) {
        info!(target: "live_migrate::notify", "{}", message);
    }
}

/// Collects notifications in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    messages: Mutex<Vec<String>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> Vec<String> {
        self.messages
            .lock()
            .map(|m| m.clone())
            .unwrap_or_else(|e| e.into_inner().clone())
    }
}

#[async_trait]
impl NotificationSink for MemorySink {
    async fn notify(&self, message: &str) {
        self.messages
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(message.to_string());
    }
}

pub(crate) fn started(migration_id: &str, collections: usize) -> String {
    format!(
        "Migration {} started ({} collections)",
        migration_id, collections
    )
}

pub(crate) fn succeeded(migration_id: &str, summary: &str) -> String {
    format!(
        "Migration {} completed successfully. {}",
        migration_id, summary
    )
}

pub(crate) fn failed(migration_id: &str, status: &str, error: &str) -> String {
    format!("Migration {} {}: {}", migration_id, status, error)
}

pub(crate) fn high_lag(collection: &str, lag_ms: i64) -> String {
    format!(
        "High replication lag detected on {}: {}ms",
        collection, lag_ms
    )
}
