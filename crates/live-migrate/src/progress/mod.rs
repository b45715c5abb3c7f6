//! Per-collection progress ledger.
//!
//! Shared by the bulk migrator (writer) and the orchestrator, state file and
//! notifications (readers). Counters only ever grow; updates happen once per
//! batch.

use std::sync::{Mutex, MutexGuard};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle of one collection's bulk copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollectionStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl std::fmt::Display for CollectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CollectionStatus::Pending => "pending",
            CollectionStatus::InProgress => "in_progress",
            CollectionStatus::Completed => "completed",
            CollectionStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Progress of one collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionProgress {
    pub collection: String,
    pub total: u64,
    pub migrated: u64,
    pub skipped: u64,
    pub batches_total: usize,
    pub batches_done: usize,
    pub status: CollectionStatus,
    pub duration_ms: u64,
    pub records_per_second: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub last_update: DateTime<Utc>,
}

impl CollectionProgress {
    fn new(collection: &str) -> Self {
        Self {
            collection: collection.to_string(),
            total: 0,
            migrated: 0,
            skipped: 0,
            batches_total: 0,
            batches_done: 0,
            status: CollectionStatus::Pending,
            duration_ms: 0,
            records_per_second: 0.0,
            error: None,
            last_update: Utc::now(),
        }
    }

    /// Share of `total` processed (migrated or skipped), 0-100.
    pub fn percent(&self) -> f64 {
        if self.total == 0 {
            return if self.status == CollectionStatus::Completed { 100.0 } else { 0.0 };
        }
        ((self.migrated + self.skipped) as f64 / self.total as f64 * 100.0).min(100.0)
    }
}

struct Entry {
    progress: CollectionProgress,
    started: Option<Instant>,
}

impl Entry {
    fn touch(&mut self) {
        let p = &mut self.progress;
        p.last_update = Utc::now();
        if let Some(started) = self.started {
            let elapsed = started.elapsed();
            p.duration_ms = elapsed.as_millis() as u64;
            let secs = elapsed.as_secs_f64();
            if secs > 0.0 {
                p.records_per_second = p.migrated as f64 / secs;
            }
        }
    }
}

/// Thread-safe ledger keyed by collection, in registration order.
#[derive(Default)]
pub struct ProgressTracker {
    entries: Mutex<Vec<Entry>>,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tracker with every collection registered as pending.
    pub fn with_collections<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let tracker = Self::new();
        for name in names {
            tracker.register(name.as_ref());
        }
        tracker
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Entry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn update<F: FnOnce(&mut Entry)>(&self, collection: &str, f: F) {
        let mut entries = self.lock();
        let idx = match entries.iter().position(|e| e.progress.collection == collection) {
            Some(idx) => idx,
            None => {
                entries.push(Entry {
                    progress: CollectionProgress::new(collection),
                    started: None,
                });
                entries.len() - 1
            }
        };
        let entry = &mut entries[idx];
        f(entry);
        entry.touch();
    }

    /// Register a collection as pending (no-op when already known).
    pub fn register(&self, collection: &str) {
        self.update(collection, |_| {});
    }

    /// Mark a collection in progress with its planned size.
    pub fn start(&self, collection: &str, total: u64, batches_total: usize) {
        self.update(collection, |e| {
            e.started = Some(Instant::now());
            e.progress.status = CollectionStatus::InProgress;
            e.progress.total = total;
            e.progress.batches_total = batches_total;
        });
    }

    /// Record one finished batch.
    pub fn record_batch(&self, collection: &str, migrated: u64, skipped: u64) {
        self.update(collection, |e| {
            e.progress.migrated += migrated;
            e.progress.skipped += skipped;
            e.progress.batches_done += 1;
        });
    }

    pub fn complete(&self, collection: &str) {
        self.update(collection, |e| e.progress.status = CollectionStatus::Completed);
        // stop the clock at completion
        if let Some(entry) = self
            .lock()
            .iter_mut()
            .find(|e| e.progress.collection == collection)
        {
            entry.started = None;
        }
    }

    pub fn fail(&self, collection: &str, error: impl Into<String>) {
        let error = error.into();
        self.update(collection, |e| {
            e.progress.status = CollectionStatus::Failed;
            e.progress.error = Some(error);
        });
    }

    pub fn get(&self, collection: &str) -> Option<CollectionProgress> {
        self.lock()
            .iter()
            .find(|e| e.progress.collection == collection)
            .map(|e| e.progress.clone())
    }

    /// Copy of every collection's progress in registration order.
    pub fn snapshot(&self) -> Vec<CollectionProgress> {
        self.lock().iter().map(|e| e.progress.clone()).collect()
    }

    /// Whether every registered collection has completed.
    pub fn all_completed(&self) -> bool {
        let entries = self.lock();
        !entries.is_empty()
            && entries
                .iter()
                .all(|e| e.progress.status == CollectionStatus::Completed)
    }

    /// Total records migrated across collections.
    pub fn total_migrated(&self) -> u64 {
        self.lock().iter().map(|e| e.progress.migrated).sum()
    }

    /// Total records skipped across collections.
    pub fn total_skipped(&self) -> u64 {
        self.lock().iter().map(|e| e.progress.skipped).sum()
    }

    /// One-line summary for logs and notifications.
    pub fn summary(&self) -> String {
        let snapshot = self.snapshot();
        let completed = snapshot
            .iter()
            .filter(|p| p.status == CollectionStatus::Completed)
            .count();
        format!(
            "{}/{} collections completed, {} records migrated, {} skipped",
            completed,
            snapshot.len(),
            snapshot.iter().map(|p| p.migrated).sum::<u64>(),
            snapshot.iter().map(|p| p.skipped).sum::<u64>(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle() {
        let tracker = ProgressTracker::with_collections(["users", "orders"]);
        assert_eq!(tracker.get("users").unwrap().status, CollectionStatus::Pending);
        assert!(!tracker.all_completed());

        tracker.start("users", 2500, 3);
        tracker.record_batch("users", 1000, 0);
        tracker.record_batch("users", 998, 2);
        tracker.record_batch("users", 500, 0);
        tracker.complete("users");

        let users = tracker.get("users").unwrap();
        assert_eq!(users.status, CollectionStatus::Completed);
        assert_eq!(users.migrated, 2498);
        assert_eq!(users.skipped, 2);
        assert_eq!(users.batches_done, 3);
        assert_eq!(users.percent(), 100.0);

        tracker.start("orders", 0, 0);
        tracker.complete("orders");
        assert!(tracker.all_completed());
        assert_eq!(tracker.total_migrated(), 2498);
    }

    #[test]
    fn test_fail_records_error() {
        let tracker = ProgressTracker::new();
        tracker.start("orders", 10, 1);
        tracker.fail("orders", "batch 0 failed");

        let orders = tracker.get("orders").unwrap();
        assert_eq!(orders.status, CollectionStatus::Failed);
        assert_eq!(orders.error.as_deref(), Some("batch 0 failed"));
        assert!(!tracker.all_completed());
    }

    #[test]
    fn test_snapshot_keeps_registration_order() {
        let tracker = ProgressTracker::with_collections(["b", "a", "c"]);
        tracker.record_batch("a", 1, 0);
        let names: Vec<_> = tracker.snapshot().into_iter().map(|p| p.collection).collect();
        assert_eq!(names, vec!["b", "a", "c"]);
    }

    #[test]
    fn test_status_serializes_snake_case() {
        let json = serde_json::to_string(&CollectionStatus::InProgress).unwrap();
        assert_eq!(json, "\"in_progress\"");
    }
}
