//! # live-migrate
//!
//! Zero-downtime migration of a live, continuously-written data store.
//!
//! The engine copies existing records in bulk, replays writes that land in
//! the meantime through timestamp-based change replication, validates the
//! target against the source and then performs a reversible cutover:
//!
//! - **Bulk copy** in dependency order with parallel, retried batches
//! - **Change replication** per collection with a monotonic cursor
//! - **Two-tier validation** (counts, then sampled critical fields)
//! - **Cutover** through a shared coordination store (read-only flag,
//!   active-store pointer, pub/sub announcements) with rollback
//! - **State file** with an HMAC-signed snapshot of the last run
//!
//! ## Example
//!
//! ```rust,no_run
//! use live_migrate::{Config, Orchestrator};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> live_migrate::Result<()> {
//!     let config = Config::load("config.yaml")?;
//!     let orchestrator = Orchestrator::new(config).await?;
//!     let result = orchestrator.run(CancellationToken::new()).await?;
//!     println!("Migration {} ended {}", result.job.id, result.job.status);
//!     Ok(())
//! }
//! ```

pub mod bulk;
pub mod config;
pub mod coordination;
pub mod core;
pub mod cutover;
pub mod drivers;
pub mod error;
pub mod notify;
pub mod orchestrator;
pub mod progress;
pub mod replication;
pub mod state;
pub mod transform;
pub mod verify;

// Re-exports for convenient access
pub use bulk::{BulkMigrator, BulkSettings};
pub use config::{CollectionConfig, Config, CoordinationConfig, MigrationConfig, StoreConfig};
pub use coordination::{CoordinationStore, Coordinator, MemoryCoordination, RedisCoordination};
pub use core::{Collection, Record, RecordKey, RecordTransformer, RetryPolicy, StoreAdapter};
pub use cutover::{CutoverCoordinator, CutoverSettings, Phase};
pub use drivers::{MemoryStore, PostgresStore};
pub use error::{MigrateError, Result};
pub use notify::{LogSink, MemorySink, NotificationSink};
pub use orchestrator::{MigrationJob, MigrationResult, Orchestrator};
pub use progress::{CollectionProgress, CollectionStatus, ProgressTracker};
pub use replication::{ChangeReplicator, ReplicationSettings, SyncCursor};
pub use state::{MigrationState, RunStatus};
pub use transform::{IdentityTransformer, RuleTransformer};
pub use verify::{ValidationReport, Validator};
