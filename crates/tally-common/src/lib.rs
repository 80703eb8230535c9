//! # Tally Common
//!
//! Shared types and errors for the Tally usage aggregation pipeline.
//!
//! ## Core Types
//!
//! - [`UsageEvent`]: immutable per-request usage fact, keyed by `event_id`
//! - [`IngestionBatch`]: events delivered together, with lateness tracking
//! - [`BucketKey`]/[`RollupBucket`]: `(granularity, bucket_start, organization_id, model_id)` rollup rows
//! - [`FreshnessStatus`]: derived ingestion lag per organization
//! - [`ExportJob`]: on-demand export state machine
//!
//! ## Time
//!
//! - [`clock::Clock`]: injected time source ([`SystemClock`], [`ManualClock`])

pub mod clock;
pub mod error;
pub mod types;

// Re-export commonly used types at crate root
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use error::{Result, TallyError};
pub use types::{
    batch::{BatchCloseReport, IngestionBatch},
    bucket::{BucketAggregate, BucketKey, Granularity, RollupBucket, TimeRange},
    event::{AdmitOutcome, EventPosition, EventStatus, SeriesKey, UsageEvent},
    export::{
        DeliveredArtifact, ExportJob, ExportKey, ExportRequest, ExportSource, ExportStatus,
        CANCELLED_DETAIL,
    },
    freshness::{FreshnessState, FreshnessStatus, FreshnessThresholds},
};

/// Tally version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default inactivity timeout before an open batch is closed (seconds)
pub const DEFAULT_BATCH_INACTIVITY_SECS: u64 = 300;

/// Default delay after a window ends before it may be finalized (seconds)
pub const DEFAULT_SETTLE_DELAY_SECS: u64 = 60;

/// Default maximum export attempts
pub const DEFAULT_EXPORT_MAX_ATTEMPTS: u32 = 3;

/// Largest `tokens_consumed` a single event may report
pub const MAX_EVENT_TOKENS: u64 = 1 << 40;

/// Largest `cost_usd` a single event may report
pub const MAX_EVENT_COST_USD: u64 = 1_000_000_000;

/// Default raw event retention (seconds, 30 days)
pub const DEFAULT_RAW_RETENTION_SECS: u64 = 30 * 24 * 3600;
