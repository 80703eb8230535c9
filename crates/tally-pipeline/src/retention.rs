//! Raw event retention
//!
//! Events are purged only once every rollup covering them is settled and
//! cannot be re-opened: the cutoff never passes a watermark, a bucket with
//! an outstanding late recompute, or the start of an open batch.

use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument};

use tally_common::{Granularity, Result, SharedClock, TallyError, DEFAULT_RAW_RETENTION_SECS};
use tally_storage::{EventStore, RollupStore};

use crate::metrics::PipelineMetrics;

#[derive(Debug, Clone)]
pub struct RetentionConfig {
    /// Minimum age of a purged event
    pub raw_retention: Duration,
    /// Granularities whose windows must be settled first
    pub granularities: Vec<Granularity>,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            raw_retention: Duration::seconds(DEFAULT_RAW_RETENTION_SECS as i64),
            granularities: Granularity::ALL.to_vec(),
        }
    }
}

impl RetentionConfig {
    pub fn validate(&self) -> Result<()> {
        if self.raw_retention <= Duration::zero() {
            return Err(TallyError::Config("raw retention must be positive".into()));
        }
        if self.granularities.is_empty() {
            return Err(TallyError::Config("at least one rollup granularity is required".into()));
        }
        Ok(())
    }
}

pub struct RetentionSweeper {
    events: Arc<dyn EventStore>,
    rollups: Arc<dyn RollupStore>,
    clock: SharedClock,
    config: RetentionConfig,
    metrics: Option<Arc<PipelineMetrics>>,
}

impl RetentionSweeper {
    pub fn new(
        events: Arc<dyn EventStore>,
        rollups: Arc<dyn RollupStore>,
        clock: SharedClock,
        config: RetentionConfig,
    ) -> Self {
        Self {
            events,
            rollups,
            clock,
            config,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<PipelineMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Time before which events may be purged, if any
    pub async fn cutoff(&self) -> Result<Option<DateTime<Utc>>> {
        let mut cutoff = self.clock.now() - self.config.raw_retention;

        for granularity in &self.config.granularities {
            match self.rollups.watermark(*granularity).await? {
                Some(watermark) => cutoff = cutoff.min(watermark),
                None => return Ok(None),
            }
        }
        for key in self.rollups.late_pending().await? {
            cutoff = cutoff.min(key.bucket_start);
        }
        for batch in self.events.open_batches().await? {
            if let Some(min) = batch.min_occurred_at {
                cutoff = cutoff.min(min);
            }
        }

        // Never split a window of the coarsest granularity
        let coarsest = self
            .config
            .granularities
            .iter()
            .copied()
            .max_by_key(|g| g.seconds())
            .unwrap_or(Granularity::Daily);
        Ok(Some(coarsest.truncate(cutoff)))
    }

    #[instrument(skip(self))]
    pub async fn sweep(&self) -> Result<u64> {
        let Some(cutoff) = self.cutoff().await? else {
            return Ok(0);
        };
        let removed = self.events.purge_before(cutoff).await?;
        if let Some(metrics) = &self.metrics {
            metrics.purged_events_total.inc_by(removed);
        }
        Ok(removed)
    }

    pub fn start(self: Arc<Self>, interval: std::time::Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = self.sweep().await {
                            error!(error = %e, "Retention sweep failed");
                        }
                    }
                    _ = shutdown.cancelled() => {
                        info!("Retention sweeper stopped");
                        break;
                    }
                }
            }
        })
    }
}
