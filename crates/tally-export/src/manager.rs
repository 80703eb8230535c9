//! Export job manager
//!
//! Drives `pending -> running -> {completed | failed}`. A run recomputes
//! every covered bucket that is not settled (or is flagged late) before
//! reading it, renders the artifact, and hands it to the sink. Failures
//! with a transient cause are retried with exponential backoff until the
//! attempt limit; everything else is terminal.

use dashmap::DashMap;
use futures::future::try_join_all;
use futures::{StreamExt, TryStreamExt};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use tally_common::{
    BucketKey, DeliveredArtifact, ExportJob, ExportRequest, ExportSource, ExportStatus, Result,
    RollupBucket, SharedClock, TallyError, CANCELLED_DETAIL, DEFAULT_EXPORT_MAX_ATTEMPTS,
};
use tally_pipeline::{PipelineMetrics, RollupAggregator};
use tally_storage::{
    scan_events, EventQuery, EventStore, ExportJobStore, RollupQuery, RollupStore, DEFAULT_SCAN_PAGE_SIZE,
};

use crate::artifact::{render_events, render_rollups, Artifact};
use crate::sink::ArtifactSink;

/// Default cap on raw event exports
pub const DEFAULT_MAX_RAW_ROWS: usize = 10_000;

#[derive(Debug, Clone)]
pub struct ExportConfig {
    /// Attempts before a transient failure becomes terminal
    pub max_attempts: u32,
    /// Delay before the first retry
    pub backoff_base: Duration,
    /// Upper bound on the retry delay
    pub backoff_max: Duration,
    /// Overall limit on one run
    pub run_timeout: Duration,
    /// Row cap for raw event exports
    pub max_raw_rows: usize,
    pub page_size: usize,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_EXPORT_MAX_ATTEMPTS,
            backoff_base: Duration::from_secs(30),
            backoff_max: Duration::from_secs(15 * 60),
            run_timeout: Duration::from_secs(10 * 60),
            max_raw_rows: DEFAULT_MAX_RAW_ROWS,
            page_size: DEFAULT_SCAN_PAGE_SIZE,
        }
    }
}

impl ExportConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(TallyError::Config("export max_attempts must be at least 1".into()));
        }
        if self.backoff_base > self.backoff_max {
            return Err(TallyError::Config(
                "export backoff base must not exceed backoff max".into(),
            ));
        }
        if self.run_timeout.is_zero() {
            return Err(TallyError::Config("export run timeout must be positive".into()));
        }
        if self.max_raw_rows == 0 || self.page_size == 0 {
            return Err(TallyError::Config("export row limits must be positive".into()));
        }
        Ok(())
    }

    /// `min(base * 2^(attempt - 1), max)`
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.backoff_base.saturating_mul(factor).min(self.backoff_max)
    }
}

/// Why a run stopped short
enum RunFailure {
    Cancelled,
    Error(TallyError),
}

pub struct ExportJobManager {
    jobs: Arc<dyn ExportJobStore>,
    aggregator: Arc<RollupAggregator>,
    events: Arc<dyn EventStore>,
    rollups: Arc<dyn RollupStore>,
    sink: Arc<dyn ArtifactSink>,
    clock: SharedClock,
    config: ExportConfig,
    /// Cancellation signals of running jobs
    cancellations: DashMap<Uuid, CancellationToken>,
    metrics: Option<Arc<PipelineMetrics>>,
}

impl ExportJobManager {
    pub fn new(
        jobs: Arc<dyn ExportJobStore>,
        aggregator: Arc<RollupAggregator>,
        events: Arc<dyn EventStore>,
        rollups: Arc<dyn RollupStore>,
        sink: Arc<dyn ArtifactSink>,
        clock: SharedClock,
        config: ExportConfig,
    ) -> Self {
        Self {
            jobs,
            aggregator,
            events,
            rollups,
            sink,
            clock,
            config,
            cancellations: DashMap::new(),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<PipelineMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn config(&self) -> &ExportConfig {
        &self.config
    }

    fn record(&self, outcome: &str) {
        if let Some(metrics) = &self.metrics {
            metrics.record_export(outcome);
        }
    }

    /// Create a pending job
    ///
    /// Rejected with `ExportInFlight` while an identical request is pending
    /// or running.
    #[instrument(skip(self, request), fields(organization_id = %request.organization_id))]
    pub async fn submit(&self, request: ExportRequest) -> Result<ExportJob> {
        request.validate()?;
        let job = ExportJob::new(request, self.config.max_attempts, self.clock.now());
        let job = self.jobs.insert(job).await?;
        info!(job_id = %job.job_id, granularity = %job.granularity, "Export job submitted");
        Ok(job)
    }

    pub async fn get_status(&self, job_id: Uuid) -> Result<ExportJob> {
        self.jobs
            .get(job_id)
            .await?
            .ok_or_else(|| TallyError::NotFound(format!("export job {job_id}")))
    }

    pub async fn list(&self, organization_id: &str, status: Option<ExportStatus>) -> Result<Vec<ExportJob>> {
        self.jobs.list(organization_id, status).await
    }

    /// Cancel a job
    ///
    /// A pending or retry-waiting job fails immediately. A running job is
    /// signalled and fails once its run observes the signal; the returned
    /// snapshot may still read `running`.
    #[instrument(skip(self))]
    pub async fn cancel(&self, job_id: Uuid) -> Result<ExportJob> {
        // A job may move between the read and the write; retry on a lost race
        for _ in 0..3 {
            let job = self.get_status(job_id).await?;
            let expected = job.status;
            let mut next = job.clone();

            match expected {
                ExportStatus::Pending => {
                    next.fail(CANCELLED_DETAIL, false, None, self.clock.now())?;
                }
                ExportStatus::Running => {
                    if let Some(token) = self.cancellations.get(&job_id) {
                        token.cancel();
                        info!("Cancellation signalled to running export");
                        return Ok(job);
                    }
                    // Claimed but not yet executing here
                    next.fail(CANCELLED_DETAIL, false, None, self.clock.now())?;
                }
                ExportStatus::Failed if job.retry_eligible => {
                    next.retry_eligible = false;
                    next.next_attempt_at = None;
                    next.error_detail = Some(CANCELLED_DETAIL.to_string());
                }
                ExportStatus::Completed | ExportStatus::Failed => {
                    return Err(TallyError::InvalidTransition {
                        from: expected,
                        to: ExportStatus::Failed,
                    });
                }
            }

            match self.jobs.update(next, expected).await {
                Ok(job) => {
                    self.record("cancelled");
                    info!("Export cancelled");
                    return Ok(job);
                }
                Err(TallyError::InvalidTransition { .. }) => continue,
                Err(e) => return Err(e),
            }
        }
        self.get_status(job_id).await
    }

    /// Run a job by id
    ///
    /// Re-running a completed job is a no-op. Only pending jobs start.
    #[instrument(skip(self))]
    pub async fn run(&self, job_id: Uuid) -> Result<ExportJob> {
        let job = self.get_status(job_id).await?;
        if job.status == ExportStatus::Completed {
            debug!("Export already completed");
            return Ok(job);
        }
        let mut running = job.clone();
        running.start(self.clock.now())?;
        let running = self.jobs.update(running, ExportStatus::Pending).await?;
        self.execute(running).await
    }

    /// Take the oldest pending job and mark it running
    pub async fn claim_next(&self) -> Result<Option<ExportJob>> {
        self.jobs.claim_next(self.clock.now()).await
    }

    /// Execute a job already marked running
    ///
    /// The run is bounded by the configured timeout and races the job's
    /// cancellation signal. Returns the job in its final state.
    #[instrument(skip(self, job), fields(job_id = %job.job_id, attempt = job.attempt_count))]
    pub async fn execute(&self, job: ExportJob) -> Result<ExportJob> {
        if job.status != ExportStatus::Running {
            return Err(TallyError::InvalidTransition {
                from: job.status,
                to: ExportStatus::Running,
            });
        }

        let token = CancellationToken::new();
        self.cancellations.insert(job.job_id, token.clone());

        // Cancelled between claim and registration
        let current = self.get_status(job.job_id).await?;
        if current.status != ExportStatus::Running {
            self.cancellations.remove(&job.job_id);
            return Ok(current);
        }

        let outcome = tokio::select! {
            biased;
            _ = token.cancelled() => Err(RunFailure::Cancelled),
            result = tokio::time::timeout(self.config.run_timeout, self.produce(&job)) => match result {
                Ok(Ok(artifact)) => Ok(artifact),
                Ok(Err(e)) => Err(RunFailure::Error(e)),
                Err(_) => Err(RunFailure::Error(TallyError::Timeout(format!(
                    "export exceeded {}s",
                    self.config.run_timeout.as_secs()
                )))),
            },
        };

        self.cancellations.remove(&job.job_id);
        self.finish(job, outcome).await
    }

    async fn finish(
        &self,
        mut job: ExportJob,
        outcome: std::result::Result<DeliveredArtifact, RunFailure>,
    ) -> Result<ExportJob> {
        let now = self.clock.now();
        let job_id = job.job_id;

        let label = match outcome {
            Ok(artifact) => {
                info!(
                    row_count = artifact.row_count,
                    location = %artifact.output_location,
                    "Export completed"
                );
                job.complete(artifact, now)?;
                "completed"
            }
            Err(RunFailure::Cancelled) => {
                info!("Export cancelled while running");
                job.fail(CANCELLED_DETAIL, false, None, now)?;
                "cancelled"
            }
            Err(RunFailure::Error(e)) => {
                let transient = e.is_transient();
                let delay = self.config.retry_delay(job.attempt_count);
                let next_attempt_at = chrono::Duration::from_std(delay).ok().map(|d| now + d);
                job.fail(e.to_string(), transient, next_attempt_at, now)?;
                if job.retry_eligible {
                    warn!(error = %e, next_attempt_at = ?job.next_attempt_at, "Export failed, will retry");
                    "retrying"
                } else {
                    warn!(error = %e, "Export failed");
                    "failed"
                }
            }
        };

        match self.jobs.update(job, ExportStatus::Running).await {
            Ok(job) => {
                self.record(label);
                Ok(job)
            }
            // Settled elsewhere (cancelled before the run registered)
            Err(TallyError::InvalidTransition { .. }) => self.get_status(job_id).await,
            Err(e) => Err(e),
        }
    }

    async fn produce(&self, job: &ExportJob) -> Result<DeliveredArtifact> {
        let artifact = match job.source {
            ExportSource::Rollups => render_rollups(&self.settled_rows(job).await?)?,
            ExportSource::RawEvents => self.raw_artifact(job).await?,
        };
        let output_location = self.sink.deliver(job, &artifact).await?;
        Ok(DeliveredArtifact {
            output_location,
            checksum: artifact.checksum,
            row_count: artifact.row_count,
            truncated: artifact.truncated,
        })
    }

    /// Current values of every bucket covered by the job
    ///
    /// Buckets that are unsettled, flagged late, or missing are recomputed
    /// first so the export reflects the event store as of now.
    async fn settled_rows(&self, job: &ExportJob) -> Result<Vec<RollupBucket>> {
        let granularity = job.granularity;
        let covered = job.requested_range.aligned(granularity);

        let existing: BTreeMap<BucketKey, RollupBucket> = self
            .rollups
            .query(&RollupQuery::new(granularity, job.organization_id.clone(), covered))
            .await?
            .into_iter()
            .map(|row| (row.key.clone(), row))
            .collect();

        let mut keys: BTreeSet<BucketKey> = self
            .events
            .bucket_keys(granularity, covered)
            .await?
            .into_iter()
            .filter(|key| key.organization_id == job.organization_id)
            .collect();
        keys.extend(existing.keys().cloned());

        let rows = try_join_all(keys.into_iter().map(|key| {
            let current = existing.get(&key).cloned();
            async move {
                match current {
                    Some(row) if !row.needs_refresh() => Ok(row),
                    _ => self.aggregator.recompute(&key).await,
                }
            }
        }))
        .await?;

        let mut rows: Vec<RollupBucket> = rows.into_iter().filter(|row| !row.aggregate().is_empty()).collect();
        rows.sort_by(|a, b| {
            a.key
                .bucket_start
                .cmp(&b.key.bucket_start)
                .then_with(|| a.key.model_id.cmp(&b.key.model_id))
        });
        Ok(rows)
    }

    async fn raw_artifact(&self, job: &ExportJob) -> Result<Artifact> {
        let cap = self.config.max_raw_rows;
        let mut events: Vec<_> = scan_events(
            self.events.clone(),
            EventQuery::new(job.organization_id.clone(), job.requested_range),
            None,
            self.config.page_size.min(cap + 1),
        )
        .take(cap + 1)
        .try_collect()
        .await?;

        let truncated = events.len() > cap;
        if truncated {
            events.truncate(cap);
            info!(cap, "Raw export truncated");
        }
        render_events(&events, truncated)
    }

    /// Move failed jobs whose backoff has elapsed back to pending
    ///
    /// If an identical job took the in-flight slot meanwhile, the retry is
    /// abandoned and the job becomes terminally failed.
    #[instrument(skip(self))]
    pub async fn requeue_due(&self) -> Result<Vec<ExportJob>> {
        let now = self.clock.now();
        let mut requeued = Vec::new();

        for job in self.jobs.retry_due(now).await? {
            let mut pending = job.clone();
            pending.requeue()?;
            match self.jobs.update(pending, ExportStatus::Failed).await {
                Ok(job) => {
                    debug!(job_id = %job.job_id, attempt = job.attempt_count, "Export requeued");
                    requeued.push(job);
                }
                Err(TallyError::ExportInFlight { job_id: holder }) => {
                    let mut superseded = job;
                    superseded.retry_eligible = false;
                    superseded.next_attempt_at = None;
                    superseded.error_detail = Some(format!("superseded by export job {holder}"));
                    if let Err(e) = self.jobs.update(superseded, ExportStatus::Failed).await {
                        warn!(error = %e, "Could not retire superseded export");
                    }
                }
                // Cancelled meanwhile
                Err(TallyError::InvalidTransition { .. }) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(requeued)
    }
}
