//! Record and collection metadata types shared by every store adapter.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Immutable, monotonically assigned primary key of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordKey(pub i64);

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for RecordKey {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

/// A single structured record.
///
/// `fields` holds the full document as stored, including the key and
/// timestamp columns. `key`, `created_at` and `updated_at` are the typed
/// copies the engine uses for pagination and change tracking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub key: RecordKey,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub fields: Map<String, Value>,
}

impl Record {
    /// Create a record with an empty document.
    pub fn new(key: impl Into<RecordKey>, created_at: DateTime<Utc>, updated_at: DateTime<Utc>) -> Self {
        Self {
            key: key.into(),
            created_at,
            updated_at,
            fields: Map::new(),
        }
    }

    /// Builder-style field setter.
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    /// Get a field value.
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    /// Most recent change timestamp (insert or update).
    pub fn changed_at(&self) -> DateTime<Utc> {
        self.updated_at.max(self.created_at)
    }

    /// Whether this record qualifies as changed after `since`.
    pub fn changed_since(&self, since: DateTime<Utc>) -> bool {
        self.updated_at > since || self.created_at > since
    }

    /// Render the document a target store should persist, with the key and
    /// timestamp columns forced to the typed values.
    pub fn to_document(&self, collection: &Collection) -> Value {
        let mut doc = self.fields.clone();
        doc.insert(collection.key_column.clone(), Value::from(self.key.0));
        doc.insert(
            collection.created_at_column.clone(),
            Value::from(self.created_at.to_rfc3339()),
        );
        doc.insert(
            collection.updated_at_column.clone(),
            Value::from(self.updated_at.to_rfc3339()),
        );
        Value::Object(doc)
    }
}

/// How a collection is laid out in a store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Collection {
    /// Collection (table) name.
    pub name: String,
    /// Primary key column.
    pub key_column: String,
    /// Insert timestamp column.
    pub created_at_column: String,
    /// Update timestamp column.
    pub updated_at_column: String,
}

impl Collection {
    /// Collection with the conventional `id` / `created_at` / `updated_at` layout.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            key_column: "id".to_string(),
            created_at_column: "created_at".to_string(),
            updated_at_column: "updated_at".to_string(),
        }
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Filter for [`StoreAdapter::count`](crate::core::StoreAdapter::count).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CountFilter {
    /// Every record in the collection.
    All,
    /// Records with `updated_at > ts OR created_at > ts`.
    ChangedSince(DateTime<Utc>),
}

/// A half-open key range `(after, last]` covering one bulk batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRange {
    /// Batch index within the collection.
    pub batch_id: usize,
    /// Exclusive lower bound (`None` = from the first record).
    pub after: Option<RecordKey>,
    /// Inclusive upper bound.
    pub last: RecordKey,
    /// Records expected in the range when it was planned.
    pub len: usize,
}

impl KeyRange {
    /// Whether a key falls inside this range.
    pub fn contains(&self, key: RecordKey) -> bool {
        self.after.map_or(true, |after| key > after) && key <= self.last
    }
}

/// Split an ordered key list into batch ranges of `batch_size`.
///
/// Shared by adapters that can enumerate keys cheaply.
pub fn plan_ranges(keys: &[RecordKey], batch_size: usize) -> Vec<KeyRange> {
    let batch_size = batch_size.max(1);
    let mut ranges = Vec::with_capacity(keys.len().div_ceil(batch_size));
    let mut after = None;

    for (batch_id, chunk) in keys.chunks(batch_size).enumerate() {
        // chunks() never yields an empty slice
        let last = chunk[chunk.len() - 1];
        ranges.push(KeyRange {
            batch_id,
            after,
            last,
            len: chunk.len(),
        });
        after = Some(last);
    }

    ranges
}
