//! Freshness monitor
//!
//! Derives ingestion lag per organization from the event store and keeps
//! the latest evaluation in the freshness store. Never blocks ingestion or
//! rollup: it only reads.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};

use tally_common::{FreshnessStatus, FreshnessThresholds, Result, SharedClock, TallyError};
use tally_storage::{EventStore, FreshnessStore};

use crate::metrics::PipelineMetrics;

/// Label used for the global lag gauge
const GLOBAL_LABEL: &str = "_global";

pub struct FreshnessMonitor {
    events: Arc<dyn EventStore>,
    store: Arc<dyn FreshnessStore>,
    clock: SharedClock,
    thresholds: FreshnessThresholds,
    metrics: Option<Arc<PipelineMetrics>>,
}

impl FreshnessMonitor {
    pub fn new(
        events: Arc<dyn EventStore>,
        store: Arc<dyn FreshnessStore>,
        clock: SharedClock,
        thresholds: FreshnessThresholds,
    ) -> Result<Self> {
        thresholds.validate()?;
        Ok(Self {
            events,
            store,
            clock,
            thresholds,
            metrics: None,
        })
    }

    pub fn with_metrics(mut self, metrics: Arc<PipelineMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn thresholds(&self) -> &FreshnessThresholds {
        &self.thresholds
    }

    async fn record(&self, status: FreshnessStatus) -> Result<FreshnessStatus> {
        if let Some(metrics) = &self.metrics {
            let label = status.organization_id.as_deref().unwrap_or(GLOBAL_LABEL);
            metrics
                .freshness_lag_seconds
                .with_label_values(&[label])
                .set(status.lag_seconds as f64);
        }
        self.store.put(status.clone()).await?;
        Ok(status)
    }

    /// Evaluate one organization
    ///
    /// With no events left the organization's first-seen time stands in for
    /// the last event.
    #[instrument(skip(self))]
    pub async fn evaluate(&self, organization_id: &str) -> Result<FreshnessStatus> {
        let last_event_at = match self.events.last_event_at(Some(organization_id)).await? {
            Some(ts) => ts,
            None => self
                .events
                .first_seen(organization_id)
                .await?
                .ok_or_else(|| TallyError::NotFound(format!("organization {organization_id}")))?,
        };
        let status = FreshnessStatus::derive(
            Some(organization_id.to_string()),
            last_event_at,
            self.clock.now(),
            &self.thresholds,
        );
        debug!(status = %status.status, lag_seconds = status.lag_seconds, "Freshness evaluated");
        self.record(status).await
    }

    /// Evaluate across all organizations
    #[instrument(skip(self))]
    pub async fn evaluate_global(&self) -> Result<FreshnessStatus> {
        let last_event_at = match self.events.last_event_at(None).await? {
            Some(ts) => ts,
            None => {
                let mut earliest: Option<DateTime<Utc>> = None;
                for organization_id in self.events.organizations().await? {
                    if let Some(seen) = self.events.first_seen(&organization_id).await? {
                        earliest = Some(earliest.map_or(seen, |e| e.min(seen)));
                    }
                }
                earliest.ok_or_else(|| TallyError::NotFound("no organizations known".into()))?
            }
        };
        let status = FreshnessStatus::derive(None, last_event_at, self.clock.now(), &self.thresholds);
        self.record(status).await
    }

    /// Evaluate every known organization, then the global status
    pub async fn evaluate_all(&self) -> Result<Vec<FreshnessStatus>> {
        let organizations = self.events.organizations().await?;
        let mut statuses = Vec::with_capacity(organizations.len() + 1);
        for organization_id in &organizations {
            statuses.push(self.evaluate(organization_id).await?);
        }
        if !organizations.is_empty() {
            statuses.push(self.evaluate_global().await?);
        }
        Ok(statuses)
    }

    /// Latest stored evaluation, evaluating on first read
    pub async fn status(&self, organization_id: &str) -> Result<FreshnessStatus> {
        match self.store.get(Some(organization_id)).await? {
            Some(status) => Ok(status),
            None => self.evaluate(organization_id).await,
        }
    }

    /// Evaluate on a fixed schedule
    pub fn start(self: Arc<Self>, interval: std::time::Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = self.evaluate_all().await {
                            error!(error = %e, "Freshness evaluation failed");
                        }
                    }
                    _ = shutdown.cancelled() => {
                        info!("Freshness monitor stopped");
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
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use tally_common::{FreshnessState, ManualClock, UsageEvent};
    use tally_storage::{InMemoryEventStore, InMemoryFreshnessStore};

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, h, m, 0).unwrap()
    }

    fn monitor(clock: Arc<ManualClock>) -> (FreshnessMonitor, Arc<InMemoryEventStore>) {
        let events = Arc::new(InMemoryEventStore::new(clock.clone()));
        let monitor = FreshnessMonitor::new(
            events.clone(),
            Arc::new(InMemoryFreshnessStore::new()),
            clock,
            FreshnessThresholds::new(Duration::minutes(10), Duration::minutes(60)).unwrap(),
        )
        .unwrap();
        (monitor, events)
    }

    #[tokio::test]
    async fn test_lag_from_latest_event() {
        let clock = Arc::new(ManualClock::new(at(12, 0)));
        let (monitor, events) = monitor(clock.clone());
        events
            .admit(UsageEvent::new("e1", "org-a", "m", at(11, 40), "b1"))
            .await
            .unwrap();

        let status = monitor.evaluate("org-a").await.unwrap();
        assert_eq!(status.status, FreshnessState::Degraded);
        assert_eq!(status.lag_seconds, 20 * 60);

        clock.advance(Duration::hours(1));
        assert_eq!(monitor.evaluate("org-a").await.unwrap().status, FreshnessState::Stale);
    }

    #[tokio::test]
    async fn test_first_seen_fallback() {
        let clock = Arc::new(ManualClock::new(at(12, 0)));
        let (monitor, events) = monitor(clock);
        events.register_organization("org-new", at(11, 55)).await.unwrap();

        let status = monitor.evaluate("org-new").await.unwrap();
        assert_eq!(status.status, FreshnessState::Fresh);
        assert_eq!(status.last_event_at, at(11, 55));

        assert!(matches!(
            monitor.evaluate("org-unknown").await,
            Err(TallyError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_evaluate_all_includes_global() {
        let clock = Arc::new(ManualClock::new(at(12, 0)));
        let (monitor, events) = monitor(clock);
        events
            .admit(UsageEvent::new("e1", "org-a", "m", at(11, 58), "b1"))
            .await
            .unwrap();
        events
            .admit(UsageEvent::new("e2", "org-b", "m", at(10, 0), "b1"))
            .await
            .unwrap();

        let statuses = monitor.evaluate_all().await.unwrap();
        assert_eq!(statuses.len(), 3);
        let global = statuses.last().unwrap();
        assert!(global.organization_id.is_none());
        assert_eq!(global.status, FreshnessState::Fresh);

        assert_eq!(monitor.status("org-b").await.unwrap().status, FreshnessState::Stale);
    }
}
