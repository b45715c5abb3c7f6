//! Signed JSON snapshot of a migration run.
//!
//! The orchestrator checkpoints after every phase; `live-migrate report`
//! reads the last snapshot back. Files are written atomically (temp file +
//! rename) and signed with HMAC-SHA256 keyed by the configuration hash so a
//! hand-edited file is rejected on load.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::Path;

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::cutover::Phase;
use crate::error::{MigrateError, Result};
use crate::progress::CollectionProgress;
use crate::replication::{SyncCursor, SyncStats};
use crate::verify::ValidationReport;

type HmacSha256 = Hmac<Sha256>;

/// Discrepancies listed individually in the text report.
const REPORT_DISCREPANCY_LIMIT: usize = 20;

/// Overall run status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Complete,
    RolledBack,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Complete => "complete",
            RunStatus::RolledBack => "rolled_back",
            RunStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of one migration run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationState {
    pub migration_id: String,

    /// SHA256 hash of the configuration; also the HMAC key.
    pub config_hash: String,

    pub phase: Phase,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,

    /// Bulk-copy progress in migration order.
    #[serde(default)]
    pub collections: Vec<CollectionProgress>,

    #[serde(default)]
    pub cursors: Vec<SyncCursor>,

    #[serde(default)]
    pub sync_stats: BTreeMap<String, SyncStats>,

    #[serde(default)]
    pub validation: Option<ValidationReport>,

    #[serde(default)]
    pub error: Option<String>,

    pub updated_at: DateTime<Utc>,

    /// HMAC-SHA256 over the serialized state without this field.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hmac: Option<String>,
}

impl MigrationState {
    pub fn new(migration_id: impl Into<String>, config_hash: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            migration_id: migration_id.into(),
            config_hash: config_hash.into(),
            phase: Phase::BulkCopy,
            status: RunStatus::Running,
            started_at: now,
            ended_at: None,
            collections: Vec::new(),
            cursors: Vec::new(),
            sync_stats: BTreeMap::new(),
            validation: None,
            error: None,
            updated_at: now,
            hmac: None,
        }
    }

    fn compute_hmac(&self) -> Result<String> {
        let mut unsigned = self.clone();
        unsigned.hmac = None;
        let content = serde_json::to_string(&unsigned)?;

        let mut mac = HmacSha256::new_from_slice(self.config_hash.as_bytes())
            .map_err(|e| MigrateError::State(format!("Failed to create HMAC: {}", e)))?;
        mac.update(content.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    /// Load a state file, rejecting unsigned or tampered content.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let state: Self = serde_json::from_str(&content)?;

        let Some(stored) = &state.hmac else {
            return Err(MigrateError::State(
                "State file has no HMAC signature".to_string(),
            ));
        };
        if *stored != state.compute_hmac()? {
            return Err(MigrateError::State(
                "State file integrity check failed: HMAC mismatch (possible tampering)".to_string(),
            ));
        }
        Ok(state)
    }

    /// Sign and write atomically.
    pub fn save<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let path = path.as_ref();
        self.updated_at = Utc::now();
        self.hmac = Some(self.compute_hmac()?);

        let content = serde_json::to_string_pretty(self)?;
        let temp_path = path.with_extension("tmp");
        std::fs::write(&temp_path, &content)?;
        std::fs::rename(&temp_path, path)?;
        Ok(())
    }

    /// Mark the run finished.
    pub fn finish(&mut self, phase: Phase, status: RunStatus, error: Option<String>) {
        self.phase = phase;
        self.status = status;
        self.error = error;
        self.ended_at = Some(Utc::now());
    }

    pub fn duration_seconds(&self) -> f64 {
        let end = self.ended_at.unwrap_or(self.updated_at);
        (end - self.started_at).num_milliseconds() as f64 / 1000.0
    }

    /// Human-readable summary printed by `live-migrate report`.
    pub fn render_report(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "Migration {}", self.migration_id);
        let _ = writeln!(out, "  Status:   {} (phase {})", self.status, self.phase);
        let _ = writeln!(out, "  Started:  {}", self.started_at.to_rfc3339());
        match self.ended_at {
            Some(ended) => {
                let _ = writeln!(out, "  Ended:    {}", ended.to_rfc3339());
            }
            None => {
                let _ = writeln!(out, "  Updated:  {}", self.updated_at.to_rfc3339());
            }
        }
        let _ = writeln!(out, "  Duration: {:.1}s", self.duration_seconds());
        if let Some(error) = &self.error {
            let _ = writeln!(out, "  Error:    {}", error);
        }

        if !self.collections.is_empty() {
            let width = self
                .collections
                .iter()
                .map(|p| p.collection.len())
                .max()
                .unwrap_or(0);
            let _ = writeln!(out, "\nBulk copy:");
            for p in &self.collections {
                let _ = write!(
                    out,
                    "  {:<width$}  {:>10}/{:<10} {:>5.1}%  skipped {:<6} {:<11} {:.0} rec/s",
                    p.collection,
                    p.migrated,
                    p.total,
                    p.percent(),
                    p.skipped,
                    p.status.to_string(),
                    p.records_per_second,
                    width = width,
                );
                if let Some(error) = &p.error {
                    let _ = write!(out, "  ({})", error);
                }
                out.push('\n');
            }
        }

        if !self.cursors.is_empty() {
            let _ = writeln!(out, "\nChange replication:");
            for cursor in &self.cursors {
                let stats = self
                    .sync_stats
                    .get(&cursor.collection)
                    .cloned()
                    .unwrap_or_default();
                let _ = writeln!(
                    out,
                    "  {}: synced to {}, {} passes, {} applied, {} skipped, {} failed passes",
                    cursor.collection,
                    cursor.last_synced_at.to_rfc3339(),
                    stats.cycles,
                    stats.applied,
                    stats.skipped,
                    stats.failures,
                );
            }
        }

        match &self.validation {
            Some(report) => {
                let _ = writeln!(out, "\n{}", report.summary());
                for d in report.discrepancies.iter().take(REPORT_DISCREPANCY_LIMIT) {
                    let _ = writeln!(out, "  - {}", d);
                }
                if report.discrepancies.len() > REPORT_DISCREPANCY_LIMIT {
                    let _ = writeln!(
                        out,
                        "  ... and {} more",
                        report.discrepancies.len() - REPORT_DISCREPANCY_LIMIT
                    );
                }
            }
            None => {
                let _ = writeln!(out, "\nValidation: not run");
            }
        }
        out
    }
}
