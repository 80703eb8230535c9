//! Core types for Tally

pub mod batch;
pub mod bucket;
pub mod event;
pub mod export;
pub mod freshness;

pub use batch::{BatchCloseReport, IngestionBatch};
pub use bucket::{BucketAggregate, BucketKey, Granularity, RollupBucket, TimeRange};
pub use event::{AdmitOutcome, EventPosition, EventStatus, SeriesKey, UsageEvent};
pub use export::{
    DeliveredArtifact, ExportJob, ExportKey, ExportRequest, ExportSource, ExportStatus,
    CANCELLED_DETAIL,
};
pub use freshness::{FreshnessState, FreshnessStatus, FreshnessThresholds};
