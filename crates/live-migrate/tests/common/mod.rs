//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use live_migrate::core::{CountFilter, KeyRange};
use live_migrate::{Collection, Config, MemoryStore, MigrateError, Record, RecordKey, Result, StoreAdapter};

/// Configuration with in-memory stores and short timings.
pub fn memory_config(collections: &str) -> Config {
    Config::from_yaml(&format!(
        r#"
source: {{ url: "memory://source" }}
target: {{ url: "memory://target" }}
coordination: {{ url: "memory://" }}
migration:
  batch_size: 100
  parallel_workers: 2
  sync_interval_ms: 20
  read_only_timeout_ms: 2000
  retry_base_delay_ms: 1
  lag_check_interval_ms: 50
  cutover_grace_ms: 0
  sync_warmup_timeout_ms: 5000
{}
"#,
        collections
    ))
    .unwrap()
}

/// Insert `n` records with keys `1..=n`, all last modified an hour ago.
pub fn seed(store: &MemoryStore, collection: &str, n: i64) {
    let base = Utc::now() - Duration::hours(1);
    for i in 1..=n {
        let ts = base + Duration::milliseconds(i);
        store.insert(
            collection,
            Record::new(i, ts, ts)
                .with_field("name", format!("{}-{}", collection, i))
                .with_field("status", "NEW"),
        );
    }
}

/// Poll `check` until it holds or `timeout_ms` passes.
pub async fn eventually<F: FnMut() -> bool>(timeout_ms: u64, mut check: F) -> bool {
    let deadline = tokio::time::Instant::now() + std::time::Duration::from_millis(timeout_ms);
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    check()
}

/// Memory store with injectable faults.
pub struct FaultyStore {
    pub inner: Arc<MemoryStore>,
    failing_writes: AtomicU32,
    writes_attempted: AtomicU32,
    stuck_changes: AtomicBool,
}

impl FaultyStore {
    pub fn new(inner: Arc<MemoryStore>) -> Self {
        Self {
            inner,
            failing_writes: AtomicU32::new(0),
            writes_attempted: AtomicU32::new(0),
            stuck_changes: AtomicBool::new(false),
        }
    }

    /// Fail the next `n` batch writes with a connectivity error.
    pub fn fail_next_writes(&self, n: u32) {
        self.failing_writes.store(n, Ordering::SeqCst);
    }

    pub fn writes_attempted(&self) -> u32 {
        self.writes_attempted.load(Ordering::SeqCst)
    }

    /// Always report at least one change past any cursor.
    pub fn keep_changing(&self) {
        self.stuck_changes.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl StoreAdapter for FaultyStore {
    async fn count(&self, collection: &Collection, filter: CountFilter) -> Result<u64> {
        let n = self.inner.count(collection, filter).await?;
        match filter {
            CountFilter::ChangedSince(_) if self.stuck_changes.load(Ordering::SeqCst) => Ok(n.max(1)),
            _ => Ok(n),
        }
    }

    async fn batch_boundaries(&self, collection: &Collection, batch_size: usize) -> Result<Vec<KeyRange>> {
        self.inner.batch_boundaries(collection, batch_size).await
    }

    async fn fetch_page(
        &self,
        collection: &Collection,
        after_key: Option<RecordKey>,
        limit: usize,
    ) -> Result<Vec<Record>> {
        self.inner.fetch_page(collection, after_key, limit).await
    }

    async fn fetch_changed_since(&self, collection: &Collection, since: DateTime<Utc>) -> Result<Vec<Record>> {
        self.inner.fetch_changed_since(collection, since).await
    }

    async fn fetch_recent(&self, collection: &Collection, limit: usize) -> Result<Vec<Record>> {
        self.inner.fetch_recent(collection, limit).await
    }

    async fn fetch_by_keys(&self, collection: &Collection, keys: &[RecordKey]) -> Result<Vec<Record>> {
        self.inner.fetch_by_keys(collection, keys).await
    }

    async fn latest_change(&self, collection: &Collection) -> Result<Option<DateTime<Utc>>> {
        self.inner.latest_change(collection).await
    }

    async fn upsert(&self, collection: &Collection, record: &Record) -> Result<()> {
        self.inner.upsert(collection, record).await
    }

    async fn upsert_many(&self, collection: &Collection, records: &[Record]) -> Result<()> {
        self.writes_attempted.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failing_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(MigrateError::connectivity("target", "connection reset"));
        }
        self.inner.upsert_many(collection, records).await
    }

    fn store_type(&self) -> &str {
        "faulty-memory"
    }
}
