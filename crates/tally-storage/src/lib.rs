//! # Tally Storage
//!
//! Storage seams for the pipeline. Each store is an `async_trait` so the
//! in-memory implementations here can be swapped for a database without
//! touching the pipeline.
//!
//! - [`EventStore`]: deduplicating event log plus the ingestion batch ledger
//! - [`RollupStore`]: revision-checked rollup rows and per-granularity watermarks
//! - [`FreshnessStore`]: latest freshness evaluation per organization
//! - [`ExportJobStore`]: export jobs with atomic in-flight uniqueness

pub mod event_store;
pub mod export_store;
pub mod freshness_store;
pub mod rollup_store;

pub use event_store::{scan_events, EventQuery, EventStore, InMemoryEventStore};
pub use export_store::{ExportJobStore, InMemoryExportJobStore};
pub use freshness_store::{FreshnessStore, InMemoryFreshnessStore};
pub use rollup_store::{InMemoryRollupStore, RollupQuery, RollupStore};

/// Default page size for event scans
pub const DEFAULT_SCAN_PAGE_SIZE: usize = 1_000;
