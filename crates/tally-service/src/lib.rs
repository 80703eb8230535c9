//! # Tally Service
//!
//! Wires the storage backends, pipeline components, and export manager into
//! one process and exposes them over REST.
//!
//! ```text
//! POST /v1/events ──▶ EventStore ──▶ BatchTracker ──▶ recompute queue
//!                                          │                  │
//!                                          ▼                  ▼
//!                                    RollupStore ◀──── RollupAggregator ◀── watermark scheduler
//!                                          │
//!                     GET /v1/rollups ◀────┴────▶ ExportJobManager ◀── export workers
//! ```

pub mod api;
pub mod config;

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use chrono::{DateTime, Utc};
use tally_common::{AdmitOutcome, Result, SharedClock, TallyError, UsageEvent};
use tally_export::{ArtifactSink, ExportJobManager, ExportRunner, FilesystemSink};
use tally_pipeline::{
    recompute_queue, BatchTracker, FreshnessMonitor, PipelineMetrics, RecomputeReceiver, RetentionSweeper,
    RollupAggregator,
};
use tally_storage::{
    EventStore, InMemoryEventStore, InMemoryExportJobStore, InMemoryFreshnessStore, InMemoryRollupStore,
};

pub use config::TallyConfig;

/// Every component of a running Tally instance
pub struct Tally {
    pub config: TallyConfig,
    pub clock: SharedClock,
    pub events: Arc<InMemoryEventStore>,
    pub rollups: Arc<InMemoryRollupStore>,
    pub metrics: Arc<PipelineMetrics>,
    pub tracker: Arc<BatchTracker>,
    pub aggregator: Arc<RollupAggregator>,
    pub freshness: Arc<FreshnessMonitor>,
    pub retention: Arc<RetentionSweeper>,
    pub exports: Arc<ExportJobManager>,
    /// Taken by the recompute worker on start
    requests: Mutex<Option<RecomputeReceiver>>,
}

impl Tally {
    /// Build with a filesystem sink rooted at `export.output_dir`
    pub fn new(config: TallyConfig, clock: SharedClock) -> Result<Self> {
        let sink = Arc::new(FilesystemSink::new(config.export.output_dir.clone()));
        Self::with_sink(config, clock, sink)
    }

    pub fn with_sink(config: TallyConfig, clock: SharedClock, sink: Arc<dyn ArtifactSink>) -> Result<Self> {
        config.validate()?;

        let metrics = Arc::new(PipelineMetrics::new()?);
        let events = Arc::new(InMemoryEventStore::new(clock.clone()));
        let rollups = Arc::new(InMemoryRollupStore::new());
        let (queue, requests) = recompute_queue();

        let tracker = Arc::new(
            BatchTracker::new(
                events.clone(),
                rollups.clone(),
                queue,
                clock.clone(),
                config.batch_tracker()?,
            )
            .with_metrics(metrics.clone()),
        );
        let aggregator = Arc::new(
            RollupAggregator::new(events.clone(), rollups.clone(), clock.clone(), config.aggregator()?)
                .with_metrics(metrics.clone()),
        );
        let freshness = Arc::new(
            FreshnessMonitor::new(
                events.clone(),
                Arc::new(InMemoryFreshnessStore::new()),
                clock.clone(),
                config.freshness_thresholds()?,
            )?
            .with_metrics(metrics.clone()),
        );
        let retention = Arc::new(
            RetentionSweeper::new(events.clone(), rollups.clone(), clock.clone(), config.retention()?)
                .with_metrics(metrics.clone()),
        );
        let exports = Arc::new(
            ExportJobManager::new(
                Arc::new(InMemoryExportJobStore::new()),
                aggregator.clone(),
                events.clone(),
                rollups.clone(),
                sink,
                clock.clone(),
                config.export()?,
            )
            .with_metrics(metrics.clone()),
        );

        Ok(Self {
            config,
            clock,
            events,
            rollups,
            metrics,
            tracker,
            aggregator,
            freshness,
            retention,
            exports,
            requests: Mutex::new(Some(requests)),
        })
    }

    /// Admit one event and count the outcome
    pub async fn admit(&self, event: UsageEvent) -> Result<AdmitOutcome> {
        let outcome = self.events.admit(event).await?;
        self.metrics.record_admission(outcome);
        Ok(outcome)
    }

    /// Record an organization before its first event so freshness can
    /// report on it; `created_at` defaults to now
    pub async fn register_organization(
        &self,
        organization_id: &str,
        created_at: Option<DateTime<Utc>>,
    ) -> Result<DateTime<Utc>> {
        if organization_id.trim().is_empty() {
            return Err(TallyError::Validation("organization_id is required".into()));
        }
        let created_at = created_at.unwrap_or_else(|| self.clock.now());
        self.events.register_organization(organization_id, created_at).await?;
        info!(organization_id, %created_at, "Organization registered");
        Ok(created_at)
    }

    /// Start every background task; they stop when `shutdown` fires
    pub fn spawn_workers(&self, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
        let secs = Duration::from_secs;
        let mut handles = vec![
            self.tracker
                .clone()
                .start_sweeper(secs(self.config.batches.sweep_interval_secs), shutdown.clone()),
            self.aggregator
                .clone()
                .start_watermark_scheduler(secs(self.config.rollup.watermark_interval_secs), shutdown.clone()),
            self.freshness
                .clone()
                .start(secs(self.config.freshness.evaluate_interval_secs), shutdown.clone()),
            self.retention
                .clone()
                .start(secs(self.config.retention.sweep_interval_secs), shutdown.clone()),
        ];

        match self.requests.lock().take() {
            Some(requests) => handles.push(
                self.aggregator
                    .clone()
                    .start_recompute_worker(requests, shutdown.clone()),
            ),
            None => warn!("Recompute worker already started"),
        }

        handles.extend(ExportRunner::new(self.exports.clone(), self.config.runner()).start(shutdown));
        info!(tasks = handles.len(), "Background workers started");
        handles
    }
}
