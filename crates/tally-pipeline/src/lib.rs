//! # Tally Pipeline
//!
//! Ingestion-to-rollup processing.
//!
//! ## Components
//!
//! - **Batch Tracker**: closes batches and detects late ones
//! - **Recompute Queue**: typed recompute-needed messages from the tracker
//! - **Rollup Aggregator**: idempotent bucket recompute and watermark advancement
//! - **Freshness Monitor**: ingestion lag per organization
//! - **Retention Sweeper**: purges raw events behind every settled window
//!
//! ## Data Flow
//!
//! ```text
//! events ─► EventStore (dedup) ─► BatchTracker ──► RecomputeQueue
//!                 │                                     │
//!                 └──────────► RollupAggregator ◄───────┘
//!                                    │
//!                              RollupStore ─► exports, dashboards
//! ```

pub mod aggregator;
pub mod batch_tracker;
pub mod freshness;
pub mod metrics;
pub mod recompute_queue;
pub mod retention;

pub use aggregator::{AggregatorConfig, RollupAggregator, WatermarkReport};
pub use batch_tracker::{BatchTracker, BatchTrackerConfig};
pub use freshness::FreshnessMonitor;
pub use metrics::PipelineMetrics;
pub use recompute_queue::{recompute_queue, RecomputeQueue, RecomputeReason, RecomputeReceiver, RecomputeRequest};
pub use retention::{RetentionConfig, RetentionSweeper};
