//! Cutover state machine.
//!
//! ```text
//! BULK_COPY -> REALTIME_SYNC -> VALIDATING -> READ_ONLY -> FINAL_SYNC -> CUTOVER -> COMPLETE
//!      \____________\_______________\____________\_____________\____________\--> ROLLED_BACK
//! ```
//!
//! Any non-terminal phase may roll back; COMPLETE is irreversible. When a
//! rollback itself fails the job ends FAILED. Rollback may be requested from
//! another task while the final sync is running: it cancels the sync first and
//! only touches the coordination store once the cutover sequence has let go.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::coordination::Coordinator;
use crate::error::{MigrateError, Result};
use crate::replication::ChangeReplicator;
use crate::verify::ValidationReport;

/// Pause between final-sync passes that still left residual lag.
const FINAL_SYNC_PAUSE: Duration = Duration::from_millis(50);

/// Migration phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    BulkCopy,
    RealtimeSync,
    Validating,
    ReadOnly,
    FinalSync,
    Cutover,
    Complete,
    RolledBack,
    Failed,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::BulkCopy => "BULK_COPY",
            Phase::RealtimeSync => "REALTIME_SYNC",
            Phase::Validating => "VALIDATING",
            Phase::ReadOnly => "READ_ONLY",
            Phase::FinalSync => "FINAL_SYNC",
            Phase::Cutover => "CUTOVER",
            Phase::Complete => "COMPLETE",
            Phase::RolledBack => "ROLLED_BACK",
            Phase::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Complete | Phase::RolledBack | Phase::Failed)
    }

    /// The phase that follows on the success path, if any.
    pub fn next(&self) -> Option<Phase> {
        match self {
            Phase::BulkCopy => Some(Phase::RealtimeSync),
            Phase::RealtimeSync => Some(Phase::Validating),
            Phase::Validating => Some(Phase::ReadOnly),
            Phase::ReadOnly => Some(Phase::FinalSync),
            Phase::FinalSync => Some(Phase::Cutover),
            Phase::Cutover => Some(Phase::Complete),
            Phase::Complete | Phase::RolledBack | Phase::Failed => None,
        }
    }

    pub fn can_transition_to(&self, to: Phase) -> bool {
        match to {
            Phase::RolledBack | Phase::Failed => !self.is_terminal(),
            _ => self.next() == Some(to),
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Timing of the cutover window.
#[derive(Debug, Clone, Copy)]
pub struct CutoverSettings {
    /// Upper bound for the final sync while writes are frozen.
    pub read_only_timeout: Duration,
    /// Pause after announcing the new store before writes are re-enabled.
    pub cutover_grace: Duration,
}

impl Default for CutoverSettings {
    fn default() -> Self {
        Self {
            read_only_timeout: Duration::from_secs(30),
            cutover_grace: Duration::from_secs(30),
        }
    }
}

/// Owns the migration phase and performs cutover and rollback.
pub struct CutoverCoordinator {
    coordinator: Coordinator,
    replicator: Arc<ChangeReplicator>,
    source_store: String,
    target_store: String,
    settings: CutoverSettings,
    phase: Mutex<Phase>,
    /// Held for the whole cutover sequence and for rollback.
    steps: tokio::sync::Mutex<()>,
    abort: CancellationToken,
}

impl CutoverCoordinator {
    /// `source_store` / `target_store` are the values written to `db:active_store`.
    pub fn new(
        coordinator: Coordinator,
        replicator: Arc<ChangeReplicator>,
        source_store: impl Into<String>,
        target_store: impl Into<String>,
        settings: CutoverSettings,
    ) -> Self {
        Self {
            coordinator,
            replicator,
            source_store: source_store.into(),
            target_store: target_store.into(),
            settings,
            phase: Mutex::new(Phase::BulkCopy),
            steps: tokio::sync::Mutex::new(()),
            abort: CancellationToken::new(),
        }
    }

    pub fn phase(&self) -> Phase {
        *self.phase.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Move to `to`, rejecting transitions the state machine does not allow.
    pub fn transition(&self, to: Phase) -> Result<()> {
        let mut phase = self.phase.lock().unwrap_or_else(|e| e.into_inner());
        if !phase.can_transition_to(to) {
            return Err(MigrateError::InvalidTransition {
                from: phase.to_string(),
                to: to.to_string(),
            });
        }
        info!("Phase: {} -> {}", *phase, to);
        *phase = to;
        Ok(())
    }

    /// Freeze writes, drain remaining changes, switch the active store and
    /// re-enable writes.
    ///
    /// Refuses (staying in VALIDATING) unless `report` is valid. A final sync
    /// that does not converge within the read-only window rolls back and
    /// returns [`MigrateError::CutoverTimeout`]. When a concurrent
    /// [`rollback`](Self::rollback) interrupts the sequence this returns
    /// [`MigrateError::Cancelled`] and leaves the rollback to that caller.
    pub async fn cutover(&self, report: &ValidationReport) -> Result<()> {
        let _steps = self.steps.lock().await;
        if self.abort.is_cancelled() {
            return Err(MigrateError::Cancelled);
        }
        if self.phase() != Phase::Validating {
            return Err(MigrateError::InvalidTransition {
                from: self.phase().to_string(),
                to: Phase::ReadOnly.to_string(),
            });
        }
        if !report.is_valid {
            warn!("Cutover refused: {}", report.summary());
            return Err(MigrateError::ValidationFailed(report.discrepancies.len()));
        }

        match self.run_cutover().await {
            Ok(()) => Ok(()),
            Err(MigrateError::Cancelled) => Err(MigrateError::Cancelled),
            Err(e) => {
                error!("Cutover failed: {}", e);
                if let Err(rollback_err) = self.rollback_locked().await {
                    error!("Rollback after failed cutover also failed: {}", rollback_err);
                }
                Err(e)
            }
        }
    }

    async fn run_cutover(&self) -> Result<()> {
        self.transition(Phase::ReadOnly)?;
        self.coordinator.enter_read_only("migration cutover").await?;

        self.transition(Phase::FinalSync)?;
        self.final_sync().await?;
        self.replicator.stop().await;

        self.transition(Phase::Cutover)?;
        self.coordinator.set_active_store(&self.target_store).await?;
        self.coordinator
            .announce_cutover(&self.source_store, &self.target_store)
            .await?;
        info!(
            "Active store switched to {}; waiting {:?} for instances to follow",
            self.target_store, self.settings.cutover_grace
        );
        tokio::select! {
            _ = self.abort.cancelled() => return Err(MigrateError::Cancelled),
            _ = tokio::time::sleep(self.settings.cutover_grace) => {}
        }
        self.coordinator.exit_read_only("migration complete").await?;

        self.transition(Phase::Complete)?;
        info!("Cutover complete");
        Ok(())
    }

    /// Repeat forced sync passes until no source change is left behind.
    async fn final_sync(&self) -> Result<()> {
        let timeout = self.settings.read_only_timeout;
        let drain = async {
            let mut passes = 0u32;
            loop {
                passes += 1;
                let pass = self.replicator.sync_all().await?;
                let residual = self.replicator.total_residual_lag().await?;
                debug!(
                    "Final sync pass {}: {} applied, residual lag {}",
                    passes, pass.applied, residual
                );
                if residual == 0 {
                    info!("Final sync converged after {} passes", passes);
                    return Ok(());
                }
                tokio::time::sleep(FINAL_SYNC_PAUSE).await;
            }
        };

        tokio::select! {
            _ = self.abort.cancelled() => Err(MigrateError::Cancelled),
            outcome = tokio::time::timeout(timeout, drain) => match outcome {
                Ok(result) => result,
                Err(_) => {
                    let residual_lag = self.replicator.total_residual_lag().await.unwrap_or(u64::MAX);
                    Err(MigrateError::CutoverTimeout {
                        timeout_ms: timeout.as_millis() as u64,
                        residual_lag,
                    })
                }
            },
        }
    }

    /// Undo everything the migration announced and end in ROLLED_BACK.
    ///
    /// Safe to call from another task at any phase before COMPLETE; repeated
    /// calls after a successful rollback are no-ops.
    pub async fn rollback(&self) -> Result<()> {
        self.abort.cancel();
        let _steps = self.steps.lock().await;
        self.rollback_locked().await
    }

    async fn rollback_locked(&self) -> Result<()> {
        match self.phase() {
            Phase::RolledBack => return Ok(()),
            phase @ (Phase::Complete | Phase::Failed) => {
                return Err(MigrateError::InvalidTransition {
                    from: phase.to_string(),
                    to: Phase::RolledBack.to_string(),
                })
            }
            phase => warn!("Rolling back migration from {}", phase),
        }
        self.abort.cancel();
        self.replicator.stop().await;

        // every step is attempted; the first failure is reported
        let mut failure = None;
        if let Err(e) = self.coordinator.exit_read_only("migration rolled back").await {
            error!("Rollback: could not clear read-only flag: {}", e);
            failure.get_or_insert(e);
        }
        if let Err(e) = self.coordinator.set_active_store(&self.source_store).await {
            error!("Rollback: could not restore active store: {}", e);
            failure.get_or_insert(e);
        }
        if let Err(e) = self.coordinator.announce_rollback().await {
            error!("Rollback: could not publish rollback event: {}", e);
            failure.get_or_insert(e);
        }

        match failure {
            None => {
                self.transition(Phase::RolledBack)?;
                info!("Rollback complete; {} is active", self.source_store);
                Ok(())
            }
            Some(e) => {
                self.transition(Phase::Failed)?;
                Err(e)
            }
        }
    }
}
