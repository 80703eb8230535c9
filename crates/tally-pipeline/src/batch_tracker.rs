//! Batch completeness and lateness tracking
//!
//! When a batch closes, every bucket key spanned by its
//! `[min_occurred_at, max_occurred_at]` is checked against the rollup
//! store. A bucket last written before the batch closed may be missing the
//! batch's events: it is flagged and a recompute is queued. A batch that
//! never closes never triggers anything.

use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};

use tally_common::{
    BatchCloseReport, BucketKey, Granularity, IngestionBatch, Result, SharedClock, TallyError,
    DEFAULT_BATCH_INACTIVITY_SECS,
};
use tally_storage::{EventQuery, EventStore, RollupStore};

use crate::metrics::PipelineMetrics;
use crate::recompute_queue::{RecomputeQueue, RecomputeReason, RecomputeRequest};

#[derive(Debug, Clone)]
pub struct BatchTrackerConfig {
    /// Close an open batch after this long without admissions
    pub inactivity_timeout: Duration,
    /// Granularities checked for lateness
    pub granularities: Vec<Granularity>,
}

impl Default for BatchTrackerConfig {
    fn default() -> Self {
        Self {
            inactivity_timeout: Duration::seconds(DEFAULT_BATCH_INACTIVITY_SECS as i64),
            granularities: Granularity::ALL.to_vec(),
        }
    }
}

impl BatchTrackerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.inactivity_timeout <= Duration::zero() {
            return Err(TallyError::Config("batch inactivity timeout must be positive".into()));
        }
        if self.granularities.is_empty() {
            return Err(TallyError::Config("at least one rollup granularity is required".into()));
        }
        Ok(())
    }
}

pub struct BatchTracker {
    events: Arc<dyn EventStore>,
    rollups: Arc<dyn RollupStore>,
    queue: RecomputeQueue,
    clock: SharedClock,
    config: BatchTrackerConfig,
    metrics: Option<Arc<PipelineMetrics>>,
}

impl BatchTracker {
    pub fn new(
        events: Arc<dyn EventStore>,
        rollups: Arc<dyn RollupStore>,
        queue: RecomputeQueue,
        clock: SharedClock,
        config: BatchTrackerConfig,
    ) -> Self {
        Self {
            events,
            rollups,
            queue,
            clock,
            config,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<PipelineMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Explicit batch-close signal
    ///
    /// Returns `None` if the batch is already closed.
    #[instrument(skip(self))]
    pub async fn close_batch(&self, batch_id: &str) -> Result<Option<BatchCloseReport>> {
        if self.events.get_batch(batch_id).await?.is_none() {
            return Err(TallyError::NotFound(format!("batch {batch_id}")));
        }
        match self.events.close_batch(batch_id, self.clock.now()).await? {
            Some(batch) => Ok(Some(self.evaluate(batch).await?)),
            None => Ok(None),
        }
    }

    /// Close every batch idle for longer than the inactivity timeout
    #[instrument(skip(self))]
    pub async fn sweep_idle(&self) -> Result<Vec<BatchCloseReport>> {
        let now = self.clock.now();
        let open = self.events.open_batches().await?;
        let mut reports = Vec::new();

        for batch in open.iter().filter(|b| b.is_idle(now, self.config.inactivity_timeout)) {
            if let Some(closed) = self.events.close_batch(&batch.batch_id, now).await? {
                debug!(batch_id = %batch.batch_id, "Closing idle batch");
                reports.push(self.evaluate(closed).await?);
            }
        }

        if let Some(metrics) = &self.metrics {
            metrics.open_batches.set((open.len() - reports.len()) as i64);
        }
        Ok(reports)
    }

    /// Batches still streaming in
    pub async fn open_batches(&self) -> Result<Vec<IngestionBatch>> {
        self.events.open_batches().await
    }

    async fn is_late(&self, key: &BucketKey, completed_at: DateTime<Utc>, horizon: Option<DateTime<Utc>>) -> Result<bool> {
        match self.rollups.get(key).await? {
            Some(row) => Ok(row.updated_at < completed_at),
            // No row yet, but the window is settled or being finalized right now
            None => {
                if !horizon.map_or(false, |h| key.bucket_end() <= h) {
                    return Ok(false);
                }
                let page = self.events.query_page(&EventQuery::for_bucket(key), None, 1).await?;
                Ok(!page.is_empty())
            }
        }
    }

    async fn evaluate(&self, mut batch: IngestionBatch) -> Result<BatchCloseReport> {
        if let Some(metrics) = &self.metrics {
            metrics.batches_closed_total.inc();
        }
        let (Some(completed_at), Some(min), Some(max)) =
            (batch.completed_at, batch.min_occurred_at, batch.max_occurred_at)
        else {
            return Ok(BatchCloseReport {
                batch,
                flagged: Vec::new(),
            });
        };

        let mut flagged = Vec::new();
        for granularity in &self.config.granularities {
            let horizon = self.rollups.settling_horizon(*granularity).await?;
            for start in granularity.starts_spanning(min, max) {
                for series in &batch.series {
                    let key = BucketKey::for_series(*granularity, start, series);
                    if !self.is_late(&key, completed_at, horizon).await? {
                        continue;
                    }
                    self.rollups.flag_late(&key).await?;
                    self.queue.enqueue(RecomputeRequest {
                        key: key.clone(),
                        reason: RecomputeReason::LateBatch {
                            batch_id: batch.batch_id.clone(),
                        },
                    });
                    flagged.push(key);
                }
            }
        }

        if !flagged.is_empty() {
            batch.is_late = self.events.mark_batch_late(&batch.batch_id, completed_at).await?;
            if let Some(metrics) = &self.metrics {
                metrics.late_batches_total.inc();
            }
            info!(
                batch_id = %batch.batch_id,
                flagged = flagged.len(),
                "Late batch, buckets queued for recompute"
            );
        }

        Ok(BatchCloseReport { batch, flagged })
    }

    /// Periodically close idle batches
    pub fn start_sweeper(self: Arc<Self>, interval: std::time::Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = self.sweep_idle().await {
                            error!(error = %e, "Batch sweep failed");
                        }
                    }
                    _ = shutdown.cancelled() => {
                        info!("Batch sweeper stopped");
                        break;
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recompute_queue::recompute_queue;
    use chrono::TimeZone;
    use tally_common::{BucketAggregate, ManualClock, RollupBucket, UsageEvent};
    use tally_storage::{InMemoryEventStore, InMemoryRollupStore};

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, h, m, 0).unwrap()
    }

    fn tracker(clock: Arc<ManualClock>) -> (BatchTracker, Arc<InMemoryEventStore>, Arc<InMemoryRollupStore>, crate::recompute_queue::RecomputeReceiver) {
        let events = Arc::new(InMemoryEventStore::new(clock.clone()));
        let rollups = Arc::new(InMemoryRollupStore::new());
        let (queue, rx) = recompute_queue();
        let tracker = BatchTracker::new(
            events.clone(),
            rollups.clone(),
            queue,
            clock,
            BatchTrackerConfig {
                inactivity_timeout: Duration::minutes(5),
                granularities: vec![Granularity::Hourly],
            },
        );
        (tracker, events, rollups, rx)
    }

    #[tokio::test]
    async fn test_batch_touching_rolled_up_window_is_late() {
        let clock = Arc::new(ManualClock::new(at(12, 0)));
        let (tracker, events, rollups, mut rx) = tracker(clock.clone());

        let key = BucketKey::new(Granularity::Hourly, at(9, 0), "org-a", "m");
        rollups
            .upsert(RollupBucket::from_aggregate(key.clone(), BucketAggregate::default(), at(11, 0)), 0)
            .await
            .unwrap();

        events
            .admit(UsageEvent::new("e1", "org-a", "m", at(9, 30), "late"))
            .await
            .unwrap();
        let report = tracker.close_batch("late").await.unwrap().unwrap();

        assert!(report.is_late());
        assert_eq!(report.flagged, vec![key.clone()]);
        assert!(rollups.get(&key).await.unwrap().unwrap().late_pending);
        assert_eq!(rx.recv().await.unwrap().key, key);
        assert!(events.get_batch("late").await.unwrap().unwrap().is_late);
    }

    #[tokio::test]
    async fn test_batch_with_no_rolled_up_windows_is_on_time() {
        let clock = Arc::new(ManualClock::new(at(12, 0)));
        let (tracker, events, _rollups, mut rx) = tracker(clock);

        events
            .admit(UsageEvent::new("e1", "org-a", "m", at(11, 30), "b1"))
            .await
            .unwrap();
        let report = tracker.close_batch("b1").await.unwrap().unwrap();
        assert!(!report.is_late());
        assert!(rx.try_recv().is_none());

        // Second close is a no-op
        assert!(tracker.close_batch("b1").await.unwrap().is_none());
        assert!(matches!(
            tracker.close_batch("missing").await,
            Err(TallyError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_row_behind_watermark_is_late() {
        let clock = Arc::new(ManualClock::new(at(12, 0)));
        let (tracker, events, rollups, _rx) = tracker(clock);
        rollups.advance_watermark(Granularity::Hourly, at(11, 0)).await.unwrap();

        events
            .admit(UsageEvent::new("e1", "org-a", "m", at(9, 30), "b1"))
            .await
            .unwrap();
        let report = tracker.close_batch("b1").await.unwrap().unwrap();
        assert_eq!(report.flagged.len(), 1);
    }

    #[tokio::test]
    async fn test_missing_row_in_window_being_finalized_is_late() {
        let clock = Arc::new(ManualClock::new(at(12, 0)));
        let (tracker, events, rollups, mut rx) = tracker(clock);
        rollups.begin_finalizing(Granularity::Hourly, at(10, 0)).await.unwrap();

        events
            .admit(UsageEvent::new("e1", "org-a", "m", at(9, 30), "b1"))
            .await
            .unwrap();
        let report = tracker.close_batch("b1").await.unwrap().unwrap();
        let key = BucketKey::new(Granularity::Hourly, at(9, 0), "org-a", "m");
        assert_eq!(report.flagged, vec![key.clone()]);
        assert_eq!(rx.recv().await.unwrap().key, key);
    }

    #[tokio::test]
    async fn test_sweep_closes_only_idle_batches() {
        let clock = Arc::new(ManualClock::new(at(12, 0)));
        let (tracker, events, _rollups, _rx) = tracker(clock.clone());

        events
            .admit(UsageEvent::new("e1", "org-a", "m", at(11, 0), "idle"))
            .await
            .unwrap();
        clock.advance(Duration::minutes(4));
        events
            .admit(UsageEvent::new("e2", "org-a", "m", at(11, 1), "active"))
            .await
            .unwrap();
        clock.advance(Duration::minutes(1));

        let reports = tracker.sweep_idle().await.unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].batch.batch_id, "idle");

        let open = tracker.open_batches().await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].batch_id, "active");
    }
}
