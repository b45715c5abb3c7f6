//! Two-tier validation of the target against the source.
//!
//! - **Tier 1 (Counts)**: total record counts must match per collection
//! - **Tier 2 (Sample)**: the most recently modified source records are
//!   looked up on the target and their critical fields compared raw
//!
//! Recent records are sampled because they are the ones most likely to still
//! be in flight through change replication.

pub mod types;

pub use types::{
    CollectionValidation, DiscrepancyKind, ValidationDiscrepancy, ValidationReport,
};

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tracing::{info, warn};

use crate::config::CollectionConfig;
use crate::core::{Collection, CountFilter, RecordKey, StoreAdapter};
use crate::error::{MigrateError, Result};
use crate::progress::ProgressTracker;
use crate::replication::ChangeReplicator;

/// Compares source and target stores.
pub struct Validator {
    source: Arc<dyn StoreAdapter>,
    target: Arc<dyn StoreAdapter>,
    sample_fraction: f64,
}

/// Records to sample out of `total`: `ceil(fraction * total)`, at most `total`.
pub fn sample_size(total: u64, fraction: f64) -> usize {
    let n = (total as f64 * fraction).ceil();
    (n.max(0.0) as u64).min(total) as usize
}

impl Validator {
    pub fn new(source: Arc<dyn StoreAdapter>, target: Arc<dyn StoreAdapter>, sample_fraction: f64) -> Self {
        Self {
            source,
            target,
            sample_fraction,
        }
    }

    /// Validation is only meaningful once every bulk copy has completed and
    /// every collection has had a successful change-replication pass.
    pub fn ensure_ready(progress: &ProgressTracker, replicator: &ChangeReplicator) -> Result<()> {
        if !progress.all_completed() {
            return Err(MigrateError::State(
                "cannot validate before every collection has been copied".into(),
            ));
        }
        for p in progress.snapshot() {
            let cycles = replicator.stats(&p.collection).map_or(0, |s| s.cycles);
            if cycles == 0 {
                return Err(MigrateError::State(format!(
                    "cannot validate {} before its first change-replication pass",
                    p.collection
                )));
            }
        }
        Ok(())
    }

    /// Validate every collection and build the report.
    pub async fn validate(&self, collections: &[CollectionConfig]) -> Result<ValidationReport> {
        let mut discrepancies = Vec::new();
        let mut summaries = Vec::with_capacity(collections.len());

        for config in collections {
            let before = discrepancies.len();
            let summary = self
                .validate_collection(&config.layout(), &config.critical_fields, &mut discrepancies)
                .await?;
            let found = discrepancies.len() - before;
            if found > 0 {
                warn!("{}: {} discrepancies", config.name, found);
            }
            summaries.push(CollectionValidation {
                discrepancies: found,
                ..summary
            });
        }

        let report = ValidationReport::new(discrepancies, summaries);
        info!("{}", report.summary());
        Ok(report)
    }

    async fn validate_collection(
        &self,
        collection: &Collection,
        critical_fields: &[String],
        out: &mut Vec<ValidationDiscrepancy>,
    ) -> Result<CollectionValidation> {
        // Tier 1: counts
        let source_count = self.source.count(collection, CountFilter::All).await?;
        let target_count = self.target.count(collection, CountFilter::All).await?;
        if source_count != target_count {
            out.push(ValidationDiscrepancy {
                kind: DiscrepancyKind::CountMismatch,
                collection: collection.name.clone(),
                record_id: None,
                field: None,
                expected: Value::from(source_count),
                actual: Value::from(target_count),
            });
        }

        // Tier 2: sampled records
        let limit = sample_size(source_count, self.sample_fraction);
        let sample = if limit > 0 {
            self.source.fetch_recent(collection, limit).await?
        } else {
            Vec::new()
        };
        let keys: Vec<RecordKey> = sample.iter().map(|r| r.key).collect();
        let found: HashMap<RecordKey, _> = self
            .target
            .fetch_by_keys(collection, &keys)
            .await?
            .into_iter()
            .map(|r| (r.key, r))
            .collect();

        for record in &sample {
            let Some(copy) = found.get(&record.key) else {
                out.push(ValidationDiscrepancy {
                    kind: DiscrepancyKind::MissingRecord,
                    collection: collection.name.clone(),
                    record_id: Some(record.key.0),
                    field: None,
                    expected: Value::from(record.key.0),
                    actual: Value::Null,
                });
                continue;
            };
            for field in critical_fields {
                let expected = record.field(field).cloned().unwrap_or(Value::Null);
                let actual = copy.field(field).cloned().unwrap_or(Value::Null);
                if expected != actual {
                    out.push(ValidationDiscrepancy {
                        kind: DiscrepancyKind::FieldMismatch,
                        collection: collection.name.clone(),
                        record_id: Some(record.key.0),
                        field: Some(field.clone()),
                        expected,
                        actual,
                    });
                }
            }
        }

        Ok(CollectionValidation {
            collection: collection.name.clone(),
            source_count,
            target_count,
            sampled: sample.len(),
            discrepancies: 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Record;
    use crate::drivers::MemoryStore;
    use chrono::{Duration, Utc};

    fn products(critical: &[&str]) -> CollectionConfig {
        let mut c = CollectionConfig::new("products");
        c.critical_fields = critical.iter().map(|s| s.to_string()).collect();
        c
    }

    fn mirrored(n: i64) -> (Arc<MemoryStore>, Arc<MemoryStore>) {
        let source = Arc::new(MemoryStore::new());
        let target = Arc::new(MemoryStore::new());
        let t0 = Utc::now() - Duration::hours(1);
        for i in 1..=n {
            let ts = t0 + Duration::seconds(i);
            let r = Record::new(i, ts, ts)
                .with_field("name", format!("p{}", i))
                .with_field("sku", format!("SKU-{}", i));
            source.insert("products", r.clone());
            target.insert("products", r);
        }
        (source, target)
    }

    #[test]
    fn test_sample_size_rounds_up() {
        assert_eq!(sample_size(1000, 0.1), 100);
        assert_eq!(sample_size(5, 0.1), 1);
        assert_eq!(sample_size(0, 0.1), 0);
        assert_eq!(sample_size(3, 1.0), 3);
    }

    #[tokio::test]
    async fn test_identical_stores_are_valid() {
        let (source, target) = mirrored(50);
        let report = Validator::new(source, target, 0.1)
            .validate(&[products(&["name", "sku"])])
            .await
            .unwrap();
        assert!(report.is_valid);
        assert_eq!(report.collections[0].sampled, 5);
    }

    #[tokio::test]
    async fn test_count_mismatch() {
        let (source, target) = mirrored(10);
        target.delete("products", RecordKey(1));

        let report = Validator::new(source, target, 0.1)
            .validate(&[products(&[])])
            .await
            .unwrap();
        assert!(!report.is_valid);
        assert_eq!(report.count(DiscrepancyKind::CountMismatch), 1);
        assert_eq!(report.discrepancies[0].expected, Value::from(10));
        assert_eq!(report.discrepancies[0].actual, Value::from(9));
    }

    #[tokio::test]
    async fn test_missing_recent_record() {
        let (source, target) = mirrored(10);
        target.delete("products", RecordKey(10));
        target.insert(
            "products",
            Record::new(99, Utc::now() - Duration::days(1), Utc::now() - Duration::days(1)),
        );

        let report = Validator::new(source, target, 0.1)
            .validate(&[products(&[])])
            .await
            .unwrap();
        assert_eq!(report.count(DiscrepancyKind::CountMismatch), 0);
        assert_eq!(report.count(DiscrepancyKind::MissingRecord), 1);
        assert_eq!(report.discrepancies[0].record_id, Some(10));
    }

    #[tokio::test]
    async fn test_field_mismatch_on_critical_field_only() {
        let (source, target) = mirrored(10);
        let mut changed = target.get("products", RecordKey(10)).unwrap();
        changed.fields.insert("sku".into(), Value::from("WRONG"));
        changed.fields.insert("color".into(), Value::from("red"));
        target.insert("products", changed);

        let report = Validator::new(source, target, 0.1)
            .validate(&[products(&["name", "sku"])])
            .await
            .unwrap();
        assert_eq!(report.discrepancies.len(), 1);
        let d = &report.discrepancies[0];
        assert_eq!(d.kind, DiscrepancyKind::FieldMismatch);
        assert_eq!(d.field.as_deref(), Some("sku"));
        assert_eq!(d.expected, Value::from("SKU-10"));
        assert_eq!(d.actual, Value::from("WRONG"));
    }
}
