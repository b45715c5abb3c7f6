//! In-process store backed by ordered maps.
//!
//! Used for `memory://` URLs (dry runs) and as the source/target of the
//! engine's own tests. Collections are created on first write; reading an
//! unknown collection behaves like reading an empty one.

use std::collections::{BTreeMap, HashMap};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::core::{
    plan_ranges, Collection, CountFilter, KeyRange, Record, RecordKey, StoreAdapter,
};
use crate::error::Result;

type Tables = HashMap<String, BTreeMap<RecordKey, Record>>;

/// Thread-safe in-memory store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Write a record directly, as an application would.
    pub fn insert(&self, collection: &str, record: Record) {
        self.write()
            .entry(collection.to_string())
            .or_default()
            .insert(record.key, record);
    }

    /// Hard-delete a record. Returns whether it existed.
    pub fn delete(&self, collection: &str, key: RecordKey) -> bool {
        self.write()
            .get_mut(collection)
            .map(|table| table.remove(&key).is_some())
            .unwrap_or(false)
    }

    pub fn get(&self, collection: &str, key: RecordKey) -> Option<Record> {
        self.read().get(collection).and_then(|t| t.get(&key).cloned())
    }

    pub fn len(&self, collection: &str) -> usize {
        self.read().get(collection).map_or(0, BTreeMap::len)
    }

    pub fn is_empty(&self, collection: &str) -> bool {
        self.len(collection) == 0
    }

    /// Every record of a collection in key order.
    pub fn records(&self, collection: &str) -> Vec<Record> {
        self.read()
            .get(collection)
            .map(|t| t.values().cloned().collect())
            .unwrap_or_default()
    }

    // A panic while holding the lock cannot leave a half-written map behind,
    // so poisoning is ignored.
    fn read(&self) -> RwLockReadGuard<'_, Tables> {
        self.tables.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Tables> {
        self.tables.write().unwrap_or_else(|e| e.into_inner())
    }

    fn select<F>(&self, collection: &Collection, mut keep: F) -> Vec<Record>
    where
        F: FnMut(&Record) -> bool,
    {
        self.read()
            .get(&collection.name)
            .map(|t| t.values().filter(|r| keep(r)).cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl StoreAdapter for MemoryStore {
    async fn count(&self, collection: &Collection, filter: CountFilter) -> Result<u64> {
        let count = match filter {
            CountFilter::All => self.len(&collection.name),
            CountFilter::ChangedSince(ts) => self.select(collection, |r| r.changed_since(ts)).len(),
        };
        Ok(count as u64)
    }

    async fn batch_boundaries(
        &self,
        collection: &Collection,
        batch_size: usize,
    ) -> Result<Vec<KeyRange>> {
        let keys: Vec<RecordKey> = self
            .read()
            .get(&collection.name)
            .map(|t| t.keys().copied().collect())
            .unwrap_or_default();
        Ok(plan_ranges(&keys, batch_size))
    }

    async fn fetch_page(
        &self,
        collection: &Collection,
        after_key: Option<RecordKey>,
        limit: usize,
    ) -> Result<Vec<Record>> {
        let tables = self.read();
        let Some(table) = tables.get(&collection.name) else {
            return Ok(Vec::new());
        };
        let page = match after_key {
            Some(after) => table
                .range((std::ops::Bound::Excluded(after), std::ops::Bound::Unbounded))
                .take(limit)
                .map(|(_, r)| r.clone())
                .collect(),
            None => table.values().take(limit).cloned().collect(),
        };
        Ok(page)
    }

    async fn fetch_changed_since(
        &self,
        collection: &Collection,
        since: DateTime<Utc>,
    ) -> Result<Vec<Record>> {
        let mut changed = self.select(collection, |r| r.changed_since(since));
        changed.sort_by_key(|r| (r.updated_at, r.key));
        Ok(changed)
    }

    async fn fetch_recent(&self, collection: &Collection, limit: usize) -> Result<Vec<Record>> {
        let mut all = self.select(collection, |_| true);
        all.sort_by(|a, b| (b.updated_at, b.key).cmp(&(a.updated_at, a.key)));
        all.truncate(limit);
        Ok(all)
    }

    async fn fetch_by_keys(
        &self,
        collection: &Collection,
        keys: &[RecordKey],
    ) -> Result<Vec<Record>> {
        let tables = self.read();
        let Some(table) = tables.get(&collection.name) else {
            return Ok(Vec::new());
        };
        Ok(keys.iter().filter_map(|k| table.get(k).cloned()).collect())
    }

    async fn latest_change(&self, collection: &Collection) -> Result<Option<DateTime<Utc>>> {
        Ok(self
            .read()
            .get(&collection.name)
            .and_then(|t| t.values().map(|r| r.updated_at).max()))
    }

    async fn upsert(&self, collection: &Collection, record: &Record) -> Result<()> {
        self.insert(&collection.name, record.clone());
        Ok(())
    }

    async fn upsert_many(&self, collection: &Collection, records: &[Record]) -> Result<()> {
        let mut tables = self.write();
        let table = tables.entry(collection.name.clone()).or_default();
        for record in records {
            table.insert(record.key, record.clone());
        }
        Ok(())
    }

    fn store_type(&self) -> &str {
        "memory"
    }
}
