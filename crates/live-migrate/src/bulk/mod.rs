//! Bulk copy of existing data.
//!
//! Collections are copied one at a time in dependency order. Inside a
//! collection, key ranges planned by the source are copied by up to
//! `parallel_workers` concurrent batch tasks. The first batch that exhausts
//! its retries aborts every other batch of the job.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::core::{
    Collection, CountFilter, KeyRange, Record, RecordTransformer, RetryPolicy, StoreAdapter,
};
use crate::error::{MigrateError, Result};
use crate::progress::ProgressTracker;

/// Tuning for the bulk copy.
#[derive(Debug, Clone, Copy)]
pub struct BulkSettings {
    pub batch_size: usize,
    pub parallel_workers: usize,
    pub retry: RetryPolicy,
}

impl Default for BulkSettings {
    fn default() -> Self {
        Self {
            batch_size: 1000,
            parallel_workers: 4,
            retry: RetryPolicy::default(),
        }
    }
}

/// Result of copying one collection.
#[derive(Debug, Clone)]
pub struct CollectionCopy {
    pub collection: Collection,
    /// Wall-clock time captured right before the copy began; the initial CDC cursor.
    pub started_at: DateTime<Utc>,
    pub migrated: u64,
    pub skipped: u64,
}

#[derive(Debug, Clone, Copy, Default)]
struct BatchStats {
    migrated: u64,
    skipped: u64,
}

/// Dependency-ordered, batched, parallel copier.
pub struct BulkMigrator {
    source: Arc<dyn StoreAdapter>,
    target: Arc<dyn StoreAdapter>,
    transformer: Arc<dyn RecordTransformer>,
    progress: Arc<ProgressTracker>,
    settings: BulkSettings,
}

impl BulkMigrator {
    pub fn new(
        source: Arc<dyn StoreAdapter>,
        target: Arc<dyn StoreAdapter>,
        transformer: Arc<dyn RecordTransformer>,
        progress: Arc<ProgressTracker>,
        settings: BulkSettings,
    ) -> Self {
        Self {
            source,
            target,
            transformer,
            progress,
            settings,
        }
    }

    /// Copy every collection in order, calling `on_completed` as soon as each
    /// one finishes so change replication can start while later collections
    /// are still being copied.
    pub async fn migrate_all<F>(
        &self,
        collections: &[Collection],
        cancel: &CancellationToken,
        mut on_completed: F,
    ) -> Result<Vec<CollectionCopy>>
    where
        F: FnMut(&CollectionCopy),
    {
        let mut copies = Vec::with_capacity(collections.len());
        for collection in collections {
            if cancel.is_cancelled() {
                return Err(MigrateError::Cancelled);
            }
            let copy = self.migrate_collection(collection, cancel).await?;
            on_completed(&copy);
            copies.push(copy);
        }
        Ok(copies)
    }

    /// Copy one collection. Fails when any batch fails after its retries.
    pub async fn migrate_collection(
        &self,
        collection: &Collection,
        cancel: &CancellationToken,
    ) -> Result<CollectionCopy> {
        let started_at = Utc::now();
        let name = collection.name.as_str();

        let planned = async {
            let total = self.settings.retry.retry(&format!("{}: count", name), || {
                self.source.count(collection, CountFilter::All)
            })
            .await?;
            let ranges = self
                .settings
                .retry
                .retry(&format!("{}: plan batches", name), || {
                    self.source.batch_boundaries(collection, self.settings.batch_size)
                })
                .await?;
            Ok::<_, MigrateError>((total, ranges))
        }
        .await;
        let (total, ranges) = match planned {
            Ok(plan) => plan,
            Err(e) => {
                self.progress.fail(name, e.to_string());
                return Err(e);
            }
        };

        info!(
            "{}: copying {} records in {} batches ({} workers)",
            name,
            total,
            ranges.len(),
            self.settings.parallel_workers
        );
        self.progress.start(name, total, ranges.len());

        match self.run_batches(collection, ranges, cancel).await {
            Ok(stats) => {
                self.progress.complete(name);
                info!(
                    "{}: bulk copy completed ({} migrated, {} skipped)",
                    name, stats.migrated, stats.skipped
                );
                Ok(CollectionCopy {
                    collection: collection.clone(),
                    started_at,
                    migrated: stats.migrated,
                    skipped: stats.skipped,
                })
            }
            Err(e) => {
                error!("{}: bulk copy failed: {}", name, e);
                self.progress.fail(name, e.to_string());
                Err(e)
            }
        }
    }

    async fn run_batches(
        &self,
        collection: &Collection,
        ranges: Vec<KeyRange>,
        cancel: &CancellationToken,
    ) -> Result<BatchStats> {
        let semaphore = Arc::new(Semaphore::new(self.settings.parallel_workers.max(1)));
        let mut tasks = JoinSet::new();

        for range in ranges {
            let semaphore = semaphore.clone();
            let worker = BatchWorker {
                source: self.source.clone(),
                target: self.target.clone(),
                transformer: self.transformer.clone(),
                collection: collection.clone(),
                batch_size: self.settings.batch_size,
            };
            let retry = self.settings.retry;
            let progress = self.progress.clone();

            tasks.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|_| MigrateError::Cancelled)?;
                let what = format!("{}: batch {}", worker.collection, range.batch_id);
                let stats = retry
                    .run(&what, || worker.copy(range))
                    .await
                    .map_err(|(e, attempts)| MigrateError::Batch {
                        collection: worker.collection.name.clone(),
                        batch: range.batch_id,
                        attempts,
                        message: e.to_string(),
                    })?;
                progress.record_batch(&worker.collection.name, stats.migrated, stats.skipped);
                Ok::<_, MigrateError>(stats)
            });
        }

        let mut totals = BatchStats::default();
        loop {
            let joined = tokio::select! {
                _ = cancel.cancelled() => {
                    tasks.abort_all();
                    return Err(MigrateError::Cancelled);
                }
                joined = tasks.join_next() => joined,
            };
            let Some(joined) = joined else {
                break;
            };
            let outcome = joined.unwrap_or_else(|e| {
                Err(MigrateError::State(format!("batch task panicked: {}", e)))
            });
            match outcome {
                Ok(stats) => {
                    totals.migrated += stats.migrated;
                    totals.skipped += stats.skipped;
                }
                Err(e) => {
                    // fail fast: nothing else of this job may keep writing
                    tasks.abort_all();
                    while tasks.join_next().await.is_some() {}
                    return Err(e);
                }
            }
        }

        Ok(totals)
    }
}

/// Everything one batch task needs, owned so it can move into the task.
struct BatchWorker {
    source: Arc<dyn StoreAdapter>,
    target: Arc<dyn StoreAdapter>,
    transformer: Arc<dyn RecordTransformer>,
    collection: Collection,
    batch_size: usize,
}

impl BatchWorker {
    /// Fetch the range, transform, and upsert it. Safe to repeat.
    async fn copy(&self, range: KeyRange) -> Result<BatchStats> {
        let records = self.fetch_range(range).await?;
        let (records, skipped) = transform_all(self.transformer.as_ref(), &self.collection, &records);
        self.target.upsert_many(&self.collection, &records).await?;
        debug!(
            "{}: batch {} upserted {} records",
            self.collection,
            range.batch_id,
            records.len()
        );
        Ok(BatchStats {
            migrated: records.len() as u64,
            skipped,
        })
    }

    async fn fetch_range(&self, range: KeyRange) -> Result<Vec<Record>> {
        let limit = range.len.max(1).min(self.batch_size.max(1));
        let mut after = range.after;
        let mut records = Vec::with_capacity(range.len);

        loop {
            let page = self.source.fetch_page(&self.collection, after, limit).await?;
            let full = page.len() == limit;
            let mut past_range = false;
            for record in page {
                if record.key > range.last {
                    past_range = true;
                    break;
                }
                after = Some(record.key);
                records.push(record);
            }
            if past_range || !full || after == Some(range.last) {
                break;
            }
        }

        Ok(records)
    }
}

/// Transform a slice of records, skipping (and counting) the ones that fail.
pub(crate) fn transform_all(
    transformer: &dyn RecordTransformer,
    collection: &Collection,
    records: &[Record],
) -> (Vec<Record>, u64) {
    let mut out = Vec::with_capacity(records.len());
    let mut skipped = 0;
    for record in records {
        match transformer.transform(collection, record) {
            Ok(mut transformed) => {
                transformed.key = record.key;
                out.push(transformed);
            }
            Err(e) => {
                warn!("{}: skipping record {}: {}", collection, record.key, e);
                skipped += 1;
            }
        }
    }
    (out, skipped)
}
