//! Types produced by validation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// What kind of difference was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscrepancyKind {
    /// Source and target hold a different number of records.
    CountMismatch,
    /// A sampled source record does not exist on the target.
    MissingRecord,
    /// A critical field differs between source and target.
    FieldMismatch,
}

impl std::fmt::Display for DiscrepancyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            DiscrepancyKind::CountMismatch => "count_mismatch",
            DiscrepancyKind::MissingRecord => "missing_record",
            DiscrepancyKind::FieldMismatch => "field_mismatch",
        })
    }
}

/// A single source/target difference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationDiscrepancy {
    pub kind: DiscrepancyKind,
    pub collection: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    /// Source-side value.
    pub expected: Value,
    /// Target-side value.
    pub actual: Value,
}

impl std::fmt::Display for ValidationDiscrepancy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} in {}", self.kind, self.collection)?;
        if let Some(id) = self.record_id {
            write!(f, " record {}", id)?;
        }
        if let Some(field) = &self.field {
            write!(f, " field {}", field)?;
        }
        write!(f, ": expected {}, got {}", self.expected, self.actual)
    }
}

/// Per-collection validation summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionValidation {
    pub collection: String,
    pub source_count: u64,
    pub target_count: u64,
    /// Records checked in the field sample.
    pub sampled: usize,
    /// Discrepancies found in this collection.
    pub discrepancies: usize,
}

/// Outcome of a validation run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    /// True exactly when `discrepancies` is empty.
    pub is_valid: bool,
    pub discrepancies: Vec<ValidationDiscrepancy>,
    pub collections: Vec<CollectionValidation>,
    pub validated_at: DateTime<Utc>,
}

impl ValidationReport {
    /// Build a report; validity is derived from the discrepancy list.
    pub fn new(
        discrepancies: Vec<ValidationDiscrepancy>,
        collections: Vec<CollectionValidation>,
    ) -> Self {
        Self {
            is_valid: discrepancies.is_empty(),
            discrepancies,
            collections,
            validated_at: Utc::now(),
        }
    }

    pub fn count(&self, kind: DiscrepancyKind) -> usize {
        self.discrepancies.iter().filter(|d| d.kind == kind).count()
    }

    pub fn summary(&self) -> String {
        if self.is_valid {
            return format!(
                "Validation passed for {} collections",
                self.collections.len()
            );
        }
        format!(
            "Validation failed: {} discrepancies ({} count, {} missing, {} field)",
            self.discrepancies.len(),
            self.count(DiscrepancyKind::CountMismatch),
            self.count(DiscrepancyKind::MissingRecord),
            self.count(DiscrepancyKind::FieldMismatch),
        )
    }
}
