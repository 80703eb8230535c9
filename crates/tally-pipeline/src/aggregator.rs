//! Rollup aggregation
//!
//! Every bucket is re-derived in full from the event store and written with
//! a revision-checked upsert, so recomputing is idempotent and a recompute
//! can never double-apply an event. Same-key recomputes are serialized by a
//! per-key mutex; different keys never share a lock.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use futures::future::try_join_all;
use futures::TryStreamExt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use tally_common::{
    BucketAggregate, BucketKey, Granularity, Result, RollupBucket, SharedClock, TallyError,
    TimeRange, DEFAULT_SETTLE_DELAY_SECS,
};
use tally_storage::{scan_events, EventQuery, EventStore, RollupQuery, RollupStore, DEFAULT_SCAN_PAGE_SIZE};

use crate::metrics::PipelineMetrics;
use crate::recompute_queue::{RecomputeReason, RecomputeReceiver, RecomputeRequest};

/// Aggregator configuration
#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    /// Granularities the watermark scheduler advances
    pub granularities: Vec<Granularity>,
    /// How long after a window ends before it may be settled
    pub settle_delay: Duration,
    /// Conditional-write retries before a recompute gives up
    pub max_conflict_retries: u32,
    /// Backoff before the first conflict retry; doubles per retry
    pub conflict_backoff: std::time::Duration,
    /// Event scan page size
    pub page_size: usize,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            granularities: Granularity::ALL.to_vec(),
            settle_delay: Duration::seconds(DEFAULT_SETTLE_DELAY_SECS as i64),
            max_conflict_retries: 5,
            conflict_backoff: std::time::Duration::from_millis(10),
            page_size: DEFAULT_SCAN_PAGE_SIZE,
        }
    }
}

impl AggregatorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.granularities.is_empty() {
            return Err(TallyError::Config("at least one rollup granularity is required".into()));
        }
        if self.settle_delay < Duration::zero() {
            return Err(TallyError::Config("settle delay must not be negative".into()));
        }
        if self.page_size == 0 {
            return Err(TallyError::Config("event scan page size must be positive".into()));
        }
        Ok(())
    }
}

/// Outcome of one watermark advancement
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatermarkReport {
    pub granularity: Granularity,
    pub previous: Option<DateTime<Utc>>,
    pub watermark: DateTime<Utc>,
    /// Buckets recomputed and finalized in this pass
    pub finalized: usize,
    /// Open batch holding back the next window, if any
    pub blocked_by: Option<String>,
}

/// Holds a per-key lock entry and removes it from the map when dropped,
/// including when the recompute future is cancelled mid-flight
struct KeyLock<'a> {
    locks: &'a DashMap<BucketKey, Arc<Mutex<()>>>,
    key: &'a BucketKey,
    lock: Arc<Mutex<()>>,
}

impl Drop for KeyLock<'_> {
    fn drop(&mut self) {
        // The map's reference plus ours
        self.locks.remove_if(self.key, |_, l| Arc::strong_count(l) <= 2);
    }
}

/// Rollup aggregator
pub struct RollupAggregator {
    events: Arc<dyn EventStore>,
    rollups: Arc<dyn RollupStore>,
    clock: SharedClock,
    config: AggregatorConfig,
    /// Per-key exclusive sections
    locks: DashMap<BucketKey, Arc<Mutex<()>>>,
    metrics: Option<Arc<PipelineMetrics>>,
}

impl RollupAggregator {
    pub fn new(
        events: Arc<dyn EventStore>,
        rollups: Arc<dyn RollupStore>,
        clock: SharedClock,
        config: AggregatorConfig,
    ) -> Self {
        Self {
            events,
            rollups,
            clock,
            config,
            locks: DashMap::new(),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<PipelineMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn config(&self) -> &AggregatorConfig {
        &self.config
    }

    fn lock_for<'a>(&'a self, key: &'a BucketKey) -> KeyLock<'a> {
        KeyLock {
            locks: &self.locks,
            key,
            lock: self.locks.entry(key.clone()).or_default().clone(),
        }
    }

    /// Aggregate over exactly the events in the bucket's window
    async fn aggregate(&self, key: &BucketKey) -> Result<BucketAggregate> {
        scan_events(
            self.events.clone(),
            EventQuery::for_bucket(key),
            None,
            self.config.page_size,
        )
        .try_fold(BucketAggregate::default(), |mut aggregate, event| async move {
            aggregate.add_event(&event)?;
            Ok(aggregate)
        })
        .await
    }

    /// Re-derive one bucket from the event store and upsert it
    ///
    /// Always writes, even an empty aggregate, so `updated_at` records the
    /// recompute. Conflicting writes are retried with exponential backoff.
    #[instrument(skip(self), fields(key = %key))]
    pub async fn recompute(&self, key: &BucketKey) -> Result<RollupBucket> {
        let entry = self.lock_for(key);
        let _guard = entry.lock.lock().await;
        self.recompute_locked(key).await
    }

    async fn recompute_locked(&self, key: &BucketKey) -> Result<RollupBucket> {
        let mut retries = 0u32;
        loop {
            let expected = self.rollups.get(key).await?.map_or(0, |row| row.revision);
            let aggregate = self.aggregate(key).await?;
            let bucket = RollupBucket::from_aggregate(key.clone(), aggregate, self.clock.now());

            match self.rollups.upsert(bucket, expected).await {
                Ok(stored) => {
                    if let Some(metrics) = &self.metrics {
                        metrics.recomputes_total.inc();
                    }
                    debug!(
                        request_count = stored.request_count,
                        revision = stored.revision,
                        "Bucket recomputed"
                    );
                    return Ok(stored);
                }
                Err(TallyError::AggregationConflict { .. }) if retries < self.config.max_conflict_retries => {
                    retries += 1;
                    if let Some(metrics) = &self.metrics {
                        metrics.aggregation_conflicts_total.inc();
                    }
                    let backoff = self.config.conflict_backoff * 2u32.saturating_pow(retries - 1);
                    debug!(retries, ?backoff, "Rollup write conflict, retrying");
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Handle a queued recompute request
    ///
    /// Bypasses the watermark check. A bucket behind the watermark, or in a
    /// window being finalized, is stamped finalized after recomputing so
    /// exports treat it as settled.
    #[instrument(skip(self, request), fields(key = %request.key))]
    pub async fn handle_request(&self, request: &RecomputeRequest) -> Result<RollupBucket> {
        let stored = self.recompute(&request.key).await?;
        let settled = self
            .rollups
            .settling_horizon(request.key.granularity)
            .await?
            .map_or(false, |wm| request.key.bucket_end() <= wm);
        if settled && !stored.is_finalized() {
            self.rollups.mark_finalized(&request.key, self.clock.now()).await?;
        }
        Ok(stored)
    }

    /// Close newly elapsed, settled windows at `granularity`
    ///
    /// Windows are processed in order. A window is settled once its end is
    /// at least `settle_delay` in the past and no open batch that has
    /// touched one of its organizations started before the window end.
    /// Advancement stops at the first unsettled window.
    #[instrument(skip(self))]
    pub async fn advance_watermark(&self, granularity: Granularity) -> Result<WatermarkReport> {
        let now = self.clock.now();
        let candidate = granularity.truncate(now - self.config.settle_delay);
        let previous = self.rollups.watermark(granularity).await?;

        let start = match previous {
            Some(watermark) => watermark,
            None => match self.events.earliest_occurred_at().await? {
                Some(earliest) => granularity.truncate(earliest).min(candidate),
                None => candidate,
            },
        };

        let mut report = WatermarkReport {
            granularity,
            previous,
            watermark: start,
            finalized: 0,
            blocked_by: None,
        };

        if start < candidate {
            let keys = self
                .events
                .bucket_keys(granularity, TimeRange::new(start, candidate)?)
                .await?;
            let open = self.events.open_batches().await?;

            let mut windows: BTreeMap<DateTime<Utc>, Vec<BucketKey>> = BTreeMap::new();
            for key in keys {
                windows.entry(key.bucket_start).or_default().push(key);
            }

            let mut reached = candidate;
            for (window_start, keys) in windows {
                let window_end = window_start + granularity.duration();
                let blocker = open.iter().find(|batch| {
                    keys.iter()
                        .any(|k| batch.may_land_before(&k.organization_id, window_end))
                });
                if let Some(batch) = blocker {
                    debug!(
                        batch_id = %batch.batch_id,
                        window_start = %window_start,
                        "Window held open by batch"
                    );
                    report.blocked_by = Some(batch.batch_id.clone());
                    reached = window_start;
                    break;
                }

                self.rollups.begin_finalizing(granularity, window_end).await?;
                if let Err(e) = self.finalize_window(&keys, now).await {
                    self.rollups.advance_watermark(granularity, window_start).await?;
                    return Err(e);
                }
                report.finalized += keys.len();
            }
            report.watermark = reached;
        }

        report.watermark = self.rollups.advance_watermark(granularity, report.watermark).await?;
        if let Some(metrics) = &self.metrics {
            metrics
                .watermark_seconds
                .with_label_values(&[&granularity.to_string()])
                .set(report.watermark.timestamp() as f64);
        }
        if report.finalized > 0 {
            info!(
                granularity = %granularity,
                watermark = %report.watermark,
                finalized = report.finalized,
                "Watermark advanced"
            );
        }
        Ok(report)
    }

    async fn finalize_window(&self, keys: &[BucketKey], now: DateTime<Utc>) -> Result<()> {
        try_join_all(keys.iter().map(|key| async move {
            self.recompute(key).await?;
            self.rollups.mark_finalized(key, now).await
        }))
        .await?;
        Ok(())
    }

    /// Recompute every row still flagged late
    ///
    /// Picks up flags whose queued recompute failed. Returns how many rows
    /// were brought up to date.
    #[instrument(skip(self))]
    pub async fn retry_late_pending(&self) -> Result<usize> {
        let mut refreshed = 0;
        for key in self.rollups.late_pending().await? {
            let request = RecomputeRequest {
                key,
                reason: RecomputeReason::LatePending,
            };
            match self.handle_request(&request).await {
                Ok(_) => refreshed += 1,
                Err(e) => warn!(key = %request.key, error = %e, "Late bucket recompute failed again"),
            }
        }
        if refreshed > 0 {
            info!(refreshed, "Late buckets recomputed");
        }
        Ok(refreshed)
    }

    /// Retry outstanding late flags, then advance every configured granularity
    pub async fn advance_all(&self) -> Result<Vec<WatermarkReport>> {
        if let Err(e) = self.retry_late_pending().await {
            warn!(error = %e, "Could not list late buckets");
        }
        let mut reports = Vec::with_capacity(self.config.granularities.len());
        for granularity in &self.config.granularities {
            reports.push(self.advance_watermark(*granularity).await?);
        }
        Ok(reports)
    }

    /// Rollup read interface
    pub async fn query(&self, query: &RollupQuery) -> Result<Vec<RollupBucket>> {
        query.range.validate()?;
        self.rollups.query(query).await
    }

    pub async fn watermark(&self, granularity: Granularity) -> Result<Option<DateTime<Utc>>> {
        self.rollups.watermark(granularity).await
    }

    /// Periodically advance all watermarks
    pub fn start_watermark_scheduler(
        self: Arc<Self>,
        interval: std::time::Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = self.advance_all().await {
                            error!(error = %e, "Watermark advancement failed");
                        }
                    }
                    _ = shutdown.cancelled() => {
                        info!("Watermark scheduler stopped");
                        break;
                    }
                }
            }
        })
    }

    /// Consume recompute requests; each runs on its own task
    pub fn start_recompute_worker(
        self: Arc<Self>,
        mut requests: RecomputeReceiver,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    request = requests.recv() => {
                        let Some(request) = request else {
                            info!("Recompute queue closed");
                            break;
                        };
                        let aggregator = self.clone();
                        tokio::spawn(async move {
                            if let Err(e) = aggregator.handle_request(&request).await {
                                warn!(
                                    key = %request.key,
                                    error = %e,
                                    "Requested recompute failed, retried on the next watermark tick"
                                );
                            }
                        });
                    }
                    _ = shutdown.cancelled() => {
                        info!("Recompute worker stopped");
                        break;
                    }
                }
            }
        })
    }
}
