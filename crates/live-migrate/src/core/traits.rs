//! Core traits for store-agnostic migration.
//!
//! - [`StoreAdapter`]: uniform interface over a source or target data store
//! - [`RecordTransformer`]: pure mapping from source record shape to target shape
//!
//! Both are used behind `Arc<dyn ...>` so the engine never knows which
//! technology sits on either side of the migration.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;

use super::record::{Collection, CountFilter, KeyRange, Record, RecordKey};

/// Uniform interface over a data store.
///
/// # Contract
///
/// - Pagination is keyset-based on the immutable, monotonic record key, never
///   offset-based, so pages stay stable while the store takes inserts.
/// - [`upsert`](StoreAdapter::upsert) creates the record when its key is absent
///   and fully replaces it otherwise. Applying the same record twice must leave
///   the store in the same state as applying it once.
/// - Unreachable stores surface as retryable errors (see
///   [`MigrateError::is_retryable`](crate::MigrateError::is_retryable)).
#[async_trait]
pub trait StoreAdapter: Send + Sync {
    /// Count records matching a filter.
    async fn count(&self, collection: &Collection, filter: CountFilter) -> Result<u64>;

    /// Plan disjoint key ranges of `batch_size` records each, in key order.
    async fn batch_boundaries(
        &self,
        collection: &Collection,
        batch_size: usize,
    ) -> Result<Vec<KeyRange>>;

    /// Fetch up to `limit` records with `key > after_key`, ordered by key.
    async fn fetch_page(
        &self,
        collection: &Collection,
        after_key: Option<RecordKey>,
        limit: usize,
    ) -> Result<Vec<Record>>;

    /// Fetch records with `updated_at > since OR created_at > since`,
    /// ordered by `(updated_at, key)`.
    async fn fetch_changed_since(
        &self,
        collection: &Collection,
        since: DateTime<Utc>,
    ) -> Result<Vec<Record>>;

    /// Fetch the `limit` most recently modified records.
    async fn fetch_recent(&self, collection: &Collection, limit: usize) -> Result<Vec<Record>>;

    /// Point lookups by primary key. Missing keys are simply absent from the result.
    async fn fetch_by_keys(&self, collection: &Collection, keys: &[RecordKey])
        -> Result<Vec<Record>>;

    /// Latest `updated_at` in the collection, if any.
    async fn latest_change(&self, collection: &Collection) -> Result<Option<DateTime<Utc>>>;

    /// Idempotent create-or-replace by primary key.
    async fn upsert(&self, collection: &Collection, record: &Record) -> Result<()>;

    /// Upsert a batch of records.
    ///
    /// The default implementation applies them one by one in order.
    async fn upsert_many(&self, collection: &Collection, records: &[Record]) -> Result<()> {
        for record in records {
            self.upsert(collection, record).await?;
        }
        Ok(())
    }

    /// Store technology identifier (e.g., "postgres", "memory").
    fn store_type(&self) -> &str;

    /// Release pooled connections.
    async fn close(&self) {}
}

/// Pure mapping from a source record to the shape the target expects.
///
/// Implementations must not perform I/O. A record that cannot be mapped
/// returns [`MigrateError::Schema`](crate::MigrateError::Schema); callers skip
/// it and keep going.
pub trait RecordTransformer: Send + Sync {
    /// Transform a single record. The key must be preserved.
    fn transform(&self, collection: &Collection, record: &Record) -> Result<Record>;
}
