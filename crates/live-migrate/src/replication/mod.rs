//! Timestamp-based change replication (CDC).
//!
//! Each collection gets its own periodic task, started once its bulk copy
//! has finished. A pass captures the wall clock *before* querying the source,
//! fetches everything changed after the collection's cursor, applies it to the
//! target and only then advances the cursor to the captured time. Records
//! written while a pass is running are therefore picked up again by the next
//! pass; upserts are idempotent so the overlap is harmless.
//!
//! Hard deletes leave no timestamp behind and are not replicated.

use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bulk::transform_all;
use crate::core::{Collection, CountFilter, RecordTransformer, RetryPolicy, StoreAdapter};
use crate::error::{MigrateError, Result};
use crate::notify::{self, NotificationSink};

/// Timing for the change replicator and its lag monitor.
#[derive(Debug, Clone, Copy)]
pub struct ReplicationSettings {
    pub sync_interval: Duration,
    pub retry: RetryPolicy,
    pub lag_check_interval: Duration,
    pub lag_alert_threshold: Duration,
}

impl Default for ReplicationSettings {
    fn default() -> Self {
        Self {
            sync_interval: Duration::from_secs(5),
            retry: RetryPolicy::default(),
            lag_check_interval: Duration::from_secs(30),
            lag_alert_threshold: Duration::from_secs(60),
        }
    }
}

/// Boundary of confirmed-propagated source changes for one collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCursor {
    pub collection: String,
    pub last_synced_at: DateTime<Utc>,
}

/// Counters for one collection's replication.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStats {
    /// Successful passes.
    pub cycles: u64,
    /// Records upserted into the target.
    pub applied: u64,
    /// Records the transformer rejected.
    pub skipped: u64,
    /// Passes that failed after retries.
    pub failures: u64,
}

/// Outcome of one or more passes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncPass {
    pub applied: u64,
    pub skipped: u64,
}

/// Replication state of one collection.
struct Lane {
    collection: Collection,
    cursor: Mutex<DateTime<Utc>>,
    stats: Mutex<SyncStats>,
    /// Serialises periodic ticks and forced passes.
    pass: tokio::sync::Mutex<()>,
    first_cycle: watch::Sender<bool>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl Lane {
    fn new(collection: Collection, initial_cursor: DateTime<Utc>) -> Self {
        let (first_cycle, _) = watch::channel(false);
        Self {
            collection,
            cursor: Mutex::new(initial_cursor),
            stats: Mutex::new(SyncStats::default()),
            pass: tokio::sync::Mutex::new(()),
            first_cycle,
        }
    }

    fn cursor(&self) -> DateTime<Utc> {
        *lock(&self.cursor)
    }

    /// Move the cursor forward; never backwards.
    fn advance(&self, to: DateTime<Utc>) {
        let mut cursor = lock(&self.cursor);
        if to > *cursor {
            *cursor = to;
        }
    }
}

/// What the per-collection tasks share with the replicator.
struct Shared {
    source: Arc<dyn StoreAdapter>,
    target: Arc<dyn StoreAdapter>,
    transformer: Arc<dyn RecordTransformer>,
    retry: RetryPolicy,
    cancel: CancellationToken,
}

impl Shared {
    async fn sync_lane(&self, lane: &Lane) -> Result<SyncPass> {
        let _pass = lane.pass.lock().await;
        if self.cancel.is_cancelled() {
            return Err(MigrateError::Cancelled);
        }

        let collection = &lane.collection;
        let query_start = Utc::now();
        let since = lane.cursor();

        let changes = self
            .retry
            .retry(&format!("{}: fetch changes", collection), || {
                self.source.fetch_changed_since(collection, since)
            })
            .await?;
        let (records, skipped) = transform_all(self.transformer.as_ref(), collection, &changes);
        if !records.is_empty() {
            self.retry
                .retry(&format!("{}: apply changes", collection), || {
                    self.target.upsert_many(collection, &records)
                })
                .await?;
        }

        lane.advance(query_start);
        let pass = SyncPass {
            applied: records.len() as u64,
            skipped,
        };
        {
            let mut stats = lock(&lane.stats);
            stats.cycles += 1;
            stats.applied += pass.applied;
            stats.skipped += pass.skipped;
        }
        lane.first_cycle.send_replace(true);

        if pass.applied > 0 || pass.skipped > 0 {
            info!(
                "Real-time sync: {} - {} records ({} skipped)",
                collection, pass.applied, pass.skipped
            );
        }
        Ok(pass)
    }
}

/// Drives one CDC task per collection plus the lag monitor.
pub struct ChangeReplicator {
    shared: Arc<Shared>,
    notifier: Arc<dyn NotificationSink>,
    settings: ReplicationSettings,
    lanes: RwLock<Vec<Arc<Lane>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ChangeReplicator {
    pub fn new(
        source: Arc<dyn StoreAdapter>,
        target: Arc<dyn StoreAdapter>,
        transformer: Arc<dyn RecordTransformer>,
        notifier: Arc<dyn NotificationSink>,
        settings: ReplicationSettings,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                source,
                target,
                transformer,
                retry: settings.retry,
                cancel: CancellationToken::new(),
            }),
            notifier,
            settings,
            lanes: RwLock::new(Vec::new()),
            tasks: Mutex::new(Vec::new()),
        }
    }

    fn lanes(&self) -> Vec<Arc<Lane>> {
        self.lanes
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn lane(&self, collection: &str) -> Result<Arc<Lane>> {
        self.lanes()
            .into_iter()
            .find(|l| l.collection.name == collection)
            .ok_or_else(|| {
                MigrateError::State(format!("collection {} is not being replicated", collection))
            })
    }

    /// Register a collection and start its periodic task. The cursor starts at
    /// `initial_cursor`, normally the moment its bulk copy began.
    pub fn start_collection(
        &self,
        collection: Collection,
        initial_cursor: DateTime<Utc>,
    ) -> Result<()> {
        if self.shared.cancel.is_cancelled() {
            return Err(MigrateError::Cancelled);
        }
        let lane = {
            let mut lanes = self.lanes.write().unwrap_or_else(|e| e.into_inner());
            if lanes.iter().any(|l| l.collection == collection) {
                warn!("{}: change replication already running", collection);
                return Ok(());
            }
            let lane = Arc::new(Lane::new(collection, initial_cursor));
            lanes.push(lane.clone());
            lane
        };

        info!(
            "{}: starting change replication from {} (every {:?})",
            lane.collection,
            initial_cursor.to_rfc3339(),
            self.settings.sync_interval
        );

        let shared = self.shared.clone();
        let interval = self.settings.sync_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shared.cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                tokio::select! {
                    _ = shared.cancel.cancelled() => break,
                    result = shared.sync_lane(&lane) => {
                        if let Err(e) = result {
                            if matches!(e, MigrateError::Cancelled) {
                                break;
                            }
                            lock(&lane.stats).failures += 1;
                            warn!("{}: sync pass failed, retrying next tick: {}", lane.collection, e);
                        }
                    }
                }
            }
            debug!("{}: change replication stopped", lane.collection);
        });
        lock(&self.tasks).push(handle);
        Ok(())
    }

    /// Run one pass for a collection now, serialised with its periodic task.
    pub async fn sync_once(&self, collection: &str) -> Result<SyncPass> {
        let lane = self.lane(collection)?;
        self.shared.sync_lane(&lane).await
    }

    /// Run one pass for every collection, in registration order.
    pub async fn sync_all(&self) -> Result<SyncPass> {
        let mut total = SyncPass::default();
        for lane in self.lanes() {
            let pass = self.shared.sync_lane(&lane).await?;
            total.applied += pass.applied;
            total.skipped += pass.skipped;
        }
        Ok(total)
    }

    /// Source changes not yet covered by a collection's cursor.
    pub async fn residual_lag(&self, collection: &str) -> Result<u64> {
        let lane = self.lane(collection)?;
        self.lane_residual(&lane).await
    }

    async fn lane_residual(&self, lane: &Lane) -> Result<u64> {
        self.shared
            .source
            .count(&lane.collection, CountFilter::ChangedSince(lane.cursor()))
            .await
    }

    /// Sum of [`residual_lag`](Self::residual_lag) over all collections.
    pub async fn total_residual_lag(&self) -> Result<u64> {
        let mut total = 0;
        for lane in self.lanes() {
            total += self.lane_residual(&lane).await?;
        }
        Ok(total)
    }

    pub fn cursor(&self, collection: &str) -> Option<SyncCursor> {
        self.lane(collection).ok().map(|l| SyncCursor {
            collection: l.collection.name.clone(),
            last_synced_at: l.cursor(),
        })
    }

    pub fn cursors(&self) -> Vec<SyncCursor> {
        self.lanes()
            .iter()
            .map(|l| SyncCursor {
                collection: l.collection.name.clone(),
                last_synced_at: l.cursor(),
            })
            .collect()
    }

    pub fn stats(&self, collection: &str) -> Option<SyncStats> {
        self.lane(collection).ok().map(|l| lock(&l.stats).clone())
    }

    /// Names of the replicated collections.
    pub fn collections(&self) -> Vec<String> {
        self.lanes()
            .iter()
            .map(|l| l.collection.name.clone())
            .collect()
    }

    /// Wait until every registered collection has completed a pass.
    pub async fn wait_until_synced(&self, timeout: Duration) -> Result<()> {
        let receivers: Vec<_> = self
            .lanes()
            .iter()
            .map(|l| (l.collection.name.clone(), l.first_cycle.subscribe()))
            .collect();

        let wait = async {
            for (name, mut rx) in receivers {
                rx.wait_for(|done| *done).await.map_err(|_| {
                    MigrateError::State(format!("replication of {} went away", name))
                })?;
            }
            Ok::<_, MigrateError>(())
        };

        tokio::time::timeout(timeout, wait).await.map_err(|_| {
            MigrateError::connectivity(
                "source",
                format!("change replication did not complete a pass within {:?}", timeout),
            )
        })?
    }

    /// Replication lag of one collection in milliseconds: newest source change
    /// minus newest target change (0 when either side is empty).
    pub async fn measure_lag(&self, collection: &str) -> Result<i64> {
        let lane = self.lane(collection)?;
        let source = self.shared.source.latest_change(&lane.collection).await?;
        let target = self.shared.target.latest_change(&lane.collection).await?;
        Ok(match (source, target) {
            (Some(s), Some(t)) => (s - t).num_milliseconds(),
            _ => 0,
        })
    }

    /// Measure every collection and alert on the ones above the threshold.
    /// Returns the offending `(collection, lag_ms)` pairs. Never fails.
    pub async fn check_lag(&self) -> Vec<(String, i64)> {
        let threshold_ms = self.settings.lag_alert_threshold.as_millis() as u64;
        let mut alerts = Vec::new();
        for name in self.collections() {
            match self.measure_lag(&name).await {
                Ok(lag_ms) if lag_ms > threshold_ms as i64 => {
                    let err = MigrateError::SyncLagExceeded {
                        collection: name.clone(),
                        lag_ms,
                        threshold_ms,
                    };
                    warn!("{}", err);
                    self.notifier.notify(&notify::high_lag(&name, lag_ms)).await;
                    alerts.push((name, lag_ms));
                }
                Ok(lag_ms) => debug!("{}: replication lag {}ms", name, lag_ms),
                Err(e) => warn!("{}: could not measure replication lag: {}", name, e),
            }
        }
        alerts
    }

    /// Check lag every `lag_check_interval` until the replicator stops.
    pub fn start_lag_monitor(self: &Arc<Self>) {
        let replicator = self.clone();
        let period = self.settings.lag_check_interval;
        let handle = tokio::spawn(async move {
            let cancel = replicator.shared.cancel.clone();
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        replicator.check_lag().await;
                    }
                }
            }
        });
        lock(&self.tasks).push(handle);
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.cancel.is_cancelled()
    }

    /// Stop every task and wait for in-flight passes to finish. Idempotent.
    pub async fn stop(&self) {
        self.shared.cancel.cancel();
        let handles = std::mem::take(&mut *lock(&self.tasks));
        for joined in join_all(handles).await {
            if let Err(e) = joined {
                warn!("replication task ended abnormally: {}", e);
            }
        }
        // a forced pass may still hold a lane; wait it out
        for lane in self.lanes() {
            drop(lane.pass.lock().await);
        }
        info!("Change replication stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Record, RecordKey};
    use crate::drivers::MemoryStore;
    use crate::notify::MemorySink;
    use crate::transform::IdentityTransformer;
    use chrono::Duration as ChronoDuration;

    struct Fixture {
        source: Arc<MemoryStore>,
        target: Arc<MemoryStore>,
        sink: Arc<MemorySink>,
        replicator: Arc<ChangeReplicator>,
    }

    fn fixture(settings: ReplicationSettings) -> Fixture {
        let source = Arc::new(MemoryStore::new());
        let target = Arc::new(MemoryStore::new());
        let sink = Arc::new(MemorySink::new());
        let replicator = Arc::new(ChangeReplicator::new(
            source.clone(),
            target.clone(),
            Arc::new(IdentityTransformer),
            sink.clone(),
            settings,
        ));
        Fixture {
            source,
            target,
            sink,
            replicator,
        }
    }

    fn slow_ticks() -> ReplicationSettings {
        ReplicationSettings {
            sync_interval: Duration::from_secs(3600),
            retry: RetryPolicy::none(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_sync_once_applies_changes_and_advances_cursor() {
        let f = fixture(slow_ticks());
        let start = Utc::now() - ChronoDuration::seconds(10);
        f.replicator
            .start_collection(Collection::new("users"), start)
            .unwrap();
        f.replicator.sync_once("users").await.unwrap();

        let before = f.replicator.cursor("users").unwrap().last_synced_at;
        let written = before + ChronoDuration::milliseconds(1);
        f.source.insert("users", Record::new(1, written, written).with_field("name", "new"));
        tokio::time::sleep(Duration::from_millis(5)).await;

        let pass = f.replicator.sync_once("users").await.unwrap();
        assert_eq!(pass.applied, 1);
        assert_eq!(f.target.get("users", RecordKey(1)), f.source.get("users", RecordKey(1)));

        let after = f.replicator.cursor("users").unwrap().last_synced_at;
        assert!(after >= before);
        assert_eq!(f.replicator.residual_lag("users").await.unwrap(), 0);

        f.replicator.stop().await;
    }

    /// Source that commits a new record while a change query is in flight,
    /// after the query has taken its snapshot.
    struct WritesDuringQuery {
        inner: Arc<MemoryStore>,
        written_at: Mutex<Option<DateTime<Utc>>>,
    }

    #[async_trait::async_trait]
    impl StoreAdapter for WritesDuringQuery {
        async fn count(&self, collection: &Collection, filter: CountFilter) -> Result<u64> {
            self.inner.count(collection, filter).await
        }

        async fn batch_boundaries(
            &self,
            collection: &Collection,
            batch_size: usize,
        ) -> Result<Vec<crate::core::KeyRange>> {
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

        async fn fetch_changed_since(
            &self,
            collection: &Collection,
            since: DateTime<Utc>,
        ) -> Result<Vec<Record>> {
            let snapshot = self.inner.fetch_changed_since(collection, since).await?;
            if lock(&self.written_at).is_none() {
                tokio::time::sleep(Duration::from_millis(5)).await;
                let now = Utc::now();
                self.inner
                    .insert(&collection.name, Record::new(500, now, now).with_field("name", "late"));
                *lock(&self.written_at) = Some(now);
            }
            Ok(snapshot)
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

        fn store_type(&self) -> &str {
            "memory"
        }
    }

    #[tokio::test]
    async fn test_cursor_stops_at_query_start_so_concurrent_writes_are_caught() {
        let inner = Arc::new(MemoryStore::new());
        let source = Arc::new(WritesDuringQuery {
            inner: inner.clone(),
            written_at: Mutex::new(None),
        });
        let target = Arc::new(MemoryStore::new());
        let replicator = ChangeReplicator::new(
            source.clone(),
            target.clone(),
            Arc::new(IdentityTransformer),
            Arc::new(MemorySink::new()),
            slow_ticks(),
        );
        replicator
            .start_collection(Collection::new("users"), Utc::now() - ChronoDuration::seconds(10))
            .unwrap();

        let first = replicator.sync_once("users").await.unwrap();
        let returned_at = Utc::now();
        assert_eq!(first.applied, 0);
        assert!(target.get("users", RecordKey(500)).is_none());

        let written_at = (*lock(&source.written_at)).expect("record written during the first query");
        let cursor = replicator.cursor("users").unwrap().last_synced_at;
        assert!(cursor < written_at, "cursor {cursor} passed a write made during the query");
        assert!(cursor <= returned_at);
        assert_eq!(replicator.residual_lag("users").await.unwrap(), 1);

        let second = replicator.sync_once("users").await.unwrap();
        assert_eq!(second.applied, 1);
        assert_eq!(target.get("users", RecordKey(500)), inner.get("users", RecordKey(500)));

        replicator.stop().await;
    }

    #[tokio::test]
    async fn test_updates_are_replayed() {
        let f = fixture(slow_ticks());
        let t0 = Utc::now() - ChronoDuration::minutes(5);
        f.source.insert("users", Record::new(1, t0, t0).with_field("status", "old"));
        f.target.insert("users", Record::new(1, t0, t0).with_field("status", "old"));
        f.replicator
            .start_collection(Collection::new("users"), Utc::now())
            .unwrap();

        let t1 = Utc::now() + ChronoDuration::seconds(1);
        f.source.insert("users", Record::new(1, t0, t1).with_field("status", "new"));
        assert_eq!(f.replicator.residual_lag("users").await.unwrap(), 1);

        f.replicator.sync_once("users").await.unwrap();
        assert_eq!(
            f.target.get("users", RecordKey(1)).unwrap().field("status"),
            Some(&serde_json::Value::from("new"))
        );
        f.replicator.stop().await;
    }

    #[tokio::test]
    async fn test_periodic_task_completes_first_cycle() {
        let f = fixture(ReplicationSettings {
            sync_interval: Duration::from_millis(20),
            retry: RetryPolicy::none(),
            ..Default::default()
        });
        f.replicator
            .start_collection(Collection::new("users"), Utc::now())
            .unwrap();

        f.replicator
            .wait_until_synced(Duration::from_secs(5))
            .await
            .unwrap();
        assert!(f.replicator.stats("users").unwrap().cycles >= 1);

        f.replicator.stop().await;
        f.replicator.stop().await;
        assert!(f.replicator.is_stopped());
        assert!(matches!(
            f.replicator.sync_once("users").await,
            Err(MigrateError::Cancelled)
        ));
    }

    #[test]
    fn test_cursor_never_moves_backwards() {
        let lane = Lane::new(Collection::new("users"), Utc::now());
        let later = lane.cursor();
        lane.advance(later - ChronoDuration::hours(1));
        assert_eq!(lane.cursor(), later);
        lane.advance(later + ChronoDuration::seconds(1));
        assert!(lane.cursor() > later);
    }

    #[tokio::test]
    async fn test_high_lag_alerts() {
        let f = fixture(ReplicationSettings {
            lag_alert_threshold: Duration::from_secs(60),
            ..slow_ticks()
        });
        let now = Utc::now();
        f.source.insert("users", Record::new(1, now, now));
        f.target.insert(
            "users",
            Record::new(1, now, now - ChronoDuration::minutes(5)),
        );
        f.replicator
            .start_collection(Collection::new("users"), now)
            .unwrap();

        let alerts = f.replicator.check_lag().await;
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].0, "users");
        assert!(alerts[0].1 >= 300_000);
        assert_eq!(f.sink.messages().len(), 1);

        f.replicator.stop().await;
    }

    #[tokio::test]
    async fn test_unknown_collection() {
        let f = fixture(slow_ticks());
        assert!(f.replicator.sync_once("ghost").await.is_err());
        assert!(f.replicator.cursor("ghost").is_none());
    }
}
