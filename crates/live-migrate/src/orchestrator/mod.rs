//! Migration orchestrator - drives a job through its phases.
//!
//! 1. Bulk copy, starting change replication for each collection as soon
//!    as its copy finishes
//! 2. Realtime sync until every collection has completed a pass
//! 3. Validation
//! 4. Cutover (read-only freeze, final sync, active-store switch)
//!
//! Any error or cancellation rolls the job back. The outcome is reported in
//! the returned [`MigrationResult`] rather than as an error.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::bulk::{BulkMigrator, BulkSettings};
use crate::config::{CollectionConfig, Config};
use crate::coordination::{connect_coordination, CoordinationStore, Coordinator};
use crate::core::{Collection, RecordTransformer, StoreAdapter};
use crate::cutover::{CutoverCoordinator, CutoverSettings, Phase};
use crate::drivers::connect_store;
use crate::error::{MigrateError, Result};
use crate::notify::{self, LogSink, NotificationSink};
use crate::progress::ProgressTracker;
use crate::replication::{ChangeReplicator, ReplicationSettings};
use crate::state::{MigrationState, RunStatus};
use crate::transform::RuleTransformer;
use crate::verify::{ValidationReport, Validator};

/// Migration orchestrator.
pub struct Orchestrator {
    config: Config,
    collections: Vec<CollectionConfig>,
    source: Arc<dyn StoreAdapter>,
    target: Arc<dyn StoreAdapter>,
    coordination: Arc<dyn CoordinationStore>,
    transformer: Arc<dyn RecordTransformer>,
    notifier: Arc<dyn NotificationSink>,
    state_file: Option<PathBuf>,
}

/// Identity and lifecycle of one migration run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationJob {
    pub id: String,
    pub phase: Phase,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub status: RunStatus,
}

/// Result of a migration run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationResult {
    #[serde(flatten)]
    pub job: MigrationJob,

    /// Total duration in seconds.
    pub duration_seconds: f64,

    pub collections_total: usize,

    /// Collections whose bulk copy completed.
    pub collections_copied: usize,

    /// Records written by the bulk copy.
    pub records_migrated: u64,

    /// Records the transformer rejected during the bulk copy.
    pub records_skipped: u64,

    /// Discrepancies found by validation, if it ran.
    pub discrepancies: Option<usize>,

    /// Error that ended the run, if any.
    pub error: Option<String>,
}

impl MigrationResult {
    pub fn is_complete(&self) -> bool {
        self.job.status == RunStatus::Complete
    }

    /// Convert result to JSON string.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Everything one run shares between its phases.
struct RunContext {
    id: String,
    progress: Arc<ProgressTracker>,
    replicator: Arc<ChangeReplicator>,
    cutover: Arc<CutoverCoordinator>,
}

impl Orchestrator {
    /// Validate the configuration and connect to the configured stores and
    /// coordination channel.
    pub async fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let source = connect_store(&config.source).await?;
        let target = connect_store(&config.target).await?;
        let coordination = connect_coordination(&config.coordination).await?;
        Self::with_components(config, source, target, coordination)
    }

    /// Build an orchestrator around already-connected components.
    pub fn with_components(
        config: Config,
        source: Arc<dyn StoreAdapter>,
        target: Arc<dyn StoreAdapter>,
        coordination: Arc<dyn CoordinationStore>,
    ) -> Result<Self> {
        config.validate()?;
        let collections = config
            .migration_order()?
            .iter()
            .map(|name| {
                config
                    .collection(name)
                    .cloned()
                    .ok_or_else(|| MigrateError::Config(format!("Unknown collection in order: {}", name)))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            transformer: Arc::new(RuleTransformer::from_collections(&config.collections)),
            notifier: Arc::new(LogSink),
            state_file: Some(config.state_file.clone()),
            collections,
            source,
            target,
            coordination,
            config,
        })
    }

    /// Replace the configured record transformer.
    pub fn with_transformer(mut self, transformer: Arc<dyn RecordTransformer>) -> Self {
        self.transformer = transformer;
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn NotificationSink>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Override the state file path from the configuration.
    pub fn with_state_file(mut self, path: PathBuf) -> Self {
        self.state_file = Some(path);
        self
    }

    /// Run without writing a state file.
    pub fn without_state_file(mut self) -> Self {
        self.state_file = None;
        self
    }

    /// Collections in migration order.
    pub fn collections(&self) -> &[CollectionConfig] {
        &self.collections
    }

    /// Run the migration until it completes, fails or `cancel` fires.
    pub async fn run(self, cancel: CancellationToken) -> Result<MigrationResult> {
        let migration = &self.config.migration;
        let id = uuid::Uuid::new_v4().to_string();
        let started_at = Utc::now();

        let progress = Arc::new(ProgressTracker::with_collections(
            self.collections.iter().map(|c| c.name.as_str()),
        ));
        let replicator = Arc::new(ChangeReplicator::new(
            self.source.clone(),
            self.target.clone(),
            self.transformer.clone(),
            self.notifier.clone(),
            ReplicationSettings {
                sync_interval: migration.sync_interval(),
                retry: migration.retry_policy(),
                lag_check_interval: migration.lag_check_interval(),
                lag_alert_threshold: std::time::Duration::from_millis(migration.lag_alert_threshold_ms),
            },
        ));
        let coordinator = Coordinator::new(
            self.coordination.clone(),
            id.clone(),
            self.config.coordination.read_only_ttl(),
        );
        let cutover = Arc::new(CutoverCoordinator::new(
            coordinator,
            replicator.clone(),
            self.config.source.redacted_url(),
            self.config.target.redacted_url(),
            CutoverSettings {
                read_only_timeout: migration.read_only_timeout(),
                cutover_grace: migration.cutover_grace(),
            },
        ));
        let ctx = RunContext {
            id: id.clone(),
            progress,
            replicator,
            cutover,
        };

        let mut state = MigrationState::new(id.clone(), self.config.hash());
        state.started_at = started_at;

        info!(
            "Starting migration {}: {} -> {} ({} collections)",
            id,
            self.config.source.redacted_url(),
            self.config.target.redacted_url(),
            self.collections.len()
        );
        self.notifier
            .notify(&notify::started(&id, self.collections.len()))
            .await;
        self.checkpoint(&ctx, &mut state, None);

        let outcome = tokio::select! {
            result = self.execute(&ctx, &mut state, &cancel) => result,
            _ = cancel.cancelled() => Err(MigrateError::Cancelled),
        };

        let (status, error) = match outcome {
            Ok(()) => (RunStatus::Complete, None),
            Err(e) => {
                error!("Migration {} failed in {}: {}", id, ctx.cutover.phase(), e);
                let status = match ctx.cutover.rollback().await {
                    Ok(()) => RunStatus::RolledBack,
                    Err(rollback_err) => {
                        error!("Rollback failed: {}", rollback_err);
                        RunStatus::Failed
                    }
                };
                (status, Some(e.to_string()))
            }
        };
        ctx.replicator.stop().await;

        let phase = ctx.cutover.phase();
        self.checkpoint(&ctx, &mut state, None);
        state.finish(phase, status, error.clone());
        self.save_state(&mut state);

        let ended_at = state.ended_at.unwrap_or_else(Utc::now);
        let result = MigrationResult {
            job: MigrationJob {
                id: id.clone(),
                phase,
                started_at,
                ended_at: Some(ended_at),
                status,
            },
            duration_seconds: (ended_at - started_at).num_milliseconds() as f64 / 1000.0,
            collections_total: self.collections.len(),
            collections_copied: state
                .collections
                .iter()
                .filter(|p| p.status == crate::progress::CollectionStatus::Completed)
                .count(),
            records_migrated: ctx.progress.total_migrated(),
            records_skipped: ctx.progress.total_skipped(),
            discrepancies: state.validation.as_ref().map(|r| r.discrepancies.len()),
            error,
        };

        match &result.error {
            None => {
                info!(
                    "Migration {} complete: {} records in {:.1}s",
                    id, result.records_migrated, result.duration_seconds
                );
                self.notifier
                    .notify(&notify::succeeded(&id, &ctx.progress.summary()))
                    .await;
            }
            Some(e) => {
                warn!("Migration {} ended {} in phase {}", id, status, phase);
                self.notifier
                    .notify(&notify::failed(&id, status.as_str(), e))
                    .await;
            }
        }
        Ok(result)
    }

    async fn execute(
        &self,
        ctx: &RunContext,
        state: &mut MigrationState,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let migration = &self.config.migration;

        // Phase 1: bulk copy
        info!("Phase 1: Bulk copy of {} collections", self.collections.len());
        let migrator = BulkMigrator::new(
            self.source.clone(),
            self.target.clone(),
            self.transformer.clone(),
            ctx.progress.clone(),
            BulkSettings {
                batch_size: migration.batch_size,
                parallel_workers: migration.parallel_workers,
                retry: migration.retry_policy(),
            },
        );
        let layouts: Vec<Collection> = self.collections.iter().map(|c| c.layout()).collect();
        let mut start_failure = None;
        migrator
            .migrate_all(&layouts, cancel, |copy| {
                if let Err(e) = ctx
                    .replicator
                    .start_collection(copy.collection.clone(), copy.started_at)
                {
                    start_failure.get_or_insert(e);
                }
            })
            .await?;
        if let Some(e) = start_failure {
            return Err(e);
        }
        info!("Bulk copy finished: {}", ctx.progress.summary());

        // Phase 2: realtime sync
        ctx.cutover.transition(Phase::RealtimeSync)?;
        self.checkpoint(ctx, state, None);
        info!("Phase 2: Waiting for change replication to catch up");
        ctx.replicator.start_lag_monitor();
        ctx.replicator
            .wait_until_synced(migration.sync_warmup_timeout())
            .await?;

        // Phase 3: validation
        ctx.cutover.transition(Phase::Validating)?;
        self.checkpoint(ctx, state, None);
        info!("Phase 3: Validating target against source");
        Validator::ensure_ready(&ctx.progress, &ctx.replicator)?;
        let report = Validator::new(
            self.source.clone(),
            self.target.clone(),
            migration.validation_sample_fraction,
        )
        .validate(&self.collections)
        .await?;
        self.checkpoint(ctx, state, Some(&report));

        // Phase 4: cutover
        info!("Phase 4: Cutover (migration {})", ctx.id);
        ctx.cutover.cutover(&report).await?;
        self.checkpoint(ctx, state, None);
        Ok(())
    }

    /// Copy the live run state into the snapshot and persist it.
    fn checkpoint(
        &self,
        ctx: &RunContext,
        state: &mut MigrationState,
        report: Option<&ValidationReport>,
    ) {
        state.phase = ctx.cutover.phase();
        state.collections = ctx.progress.snapshot();
        state.cursors = ctx.replicator.cursors();
        state.sync_stats = ctx
            .replicator
            .collections()
            .into_iter()
            .filter_map(|name| ctx.replicator.stats(&name).map(|s| (name, s)))
            .collect();
        if let Some(report) = report {
            state.validation = Some(report.clone());
        }
        self.save_state(state);
    }

    /// The state file is a report artifact; failing to write it never fails the run.
    fn save_state(&self, state: &mut MigrationState) {
        if let Some(ref path) = self.state_file {
            if let Err(e) = state.save(path) {
                warn!("Could not write state file {}: {}", path.display(), e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::MemoryCoordination;
    use crate::drivers::MemoryStore;

    fn config() -> Config {
        Config::from_yaml(
            r#"
source: { url: "memory://source" }
target: { url: "memory://target" }
coordination: { url: "memory://" }
collections:
  - name: orders
    depends_on: [users]
  - name: users
"#,
        )
        .unwrap()
    }

    fn orchestrator(config: Config) -> Result<Orchestrator> {
        Orchestrator::with_components(
            config,
            Arc::new(MemoryStore::new()),
            Arc::new(MemoryStore::new()),
            Arc::new(MemoryCoordination::new()),
        )
    }

    #[test]
    fn test_collections_follow_dependency_order() {
        let orchestrator = orchestrator(config()).unwrap();
        let names: Vec<_> = orchestrator
            .collections()
            .iter()
            .map(|c| c.name.as_str())
            .collect();
        assert_eq!(names, vec!["users", "orders"]);
    }

    #[test]
    fn test_cycle_is_rejected_before_any_phase() {
        let mut config = config();
        config.collections[1].depends_on = vec!["orders".into()];
        assert!(matches!(
            orchestrator(config),
            Err(MigrateError::Config(_))
        ));
    }

    #[test]
    fn test_split_critical_field_is_rejected_before_any_phase() {
        let mut config = config();
        config.collections[0].critical_fields = vec!["claims".into()];
        config.collections[0].transform.split_fields = vec!["claims".into()];
        assert!(matches!(
            orchestrator(config),
            Err(MigrateError::Config(_))
        ));
    }

    #[test]
    fn test_result_json_is_flat() {
        let now = Utc::now();
        let result = MigrationResult {
            job: MigrationJob {
                id: "m-1".into(),
                phase: Phase::Complete,
                started_at: now,
                ended_at: Some(now),
                status: RunStatus::Complete,
            },
            duration_seconds: 1.5,
            collections_total: 2,
            collections_copied: 2,
            records_migrated: 10,
            records_skipped: 0,
            discrepancies: Some(0),
            error: None,
        };
        let json: serde_json::Value = serde_json::from_str(&result.to_json().unwrap()).unwrap();
        assert_eq!(json["id"], "m-1");
        assert_eq!(json["phase"], "COMPLETE");
        assert_eq!(json["status"], "complete");
        assert!(result.is_complete());
    }
}
