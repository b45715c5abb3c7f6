//! Core abstractions for store-agnostic migration.
//!
//! - [`record`]: records, keys, collection layouts and batch key ranges
//! - [`traits`]: [`StoreAdapter`] and [`RecordTransformer`]
//! - [`graph`]: collection dependency graph and ordering
//! - [`retry`]: retry policy with exponential backoff
//! - [`identifier`]: SQL identifier validation and quoting
//!
//! Everything here is independent of a concrete store technology; drivers in
//! `drivers/` implement the traits.

pub mod graph;
pub mod identifier;
pub mod record;
pub mod retry;
pub mod traits;

pub use graph::DependencyGraph;
pub use record::{plan_ranges, Collection, CountFilter, KeyRange, Record, RecordKey};
pub use retry::RetryPolicy;
pub use traits::{RecordTransformer, StoreAdapter};
