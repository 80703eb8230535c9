//! Export job store
//!
//! Jobs and the in-flight index live under one lock so that "at most one
//! pending or running job per `(organization, granularity, range)`" is
//! enforced atomically on insert and on every status change.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use uuid::Uuid;

use tally_common::{ExportJob, ExportKey, ExportStatus, Result, TallyError};

#[async_trait]
pub trait ExportJobStore: Send + Sync {
    /// Insert a new pending job; fails with `ExportInFlight` if an identical
    /// job is already pending or running
    async fn insert(&self, job: ExportJob) -> Result<ExportJob>;

    async fn get(&self, job_id: Uuid) -> Result<Option<ExportJob>>;

    /// Replace a job if its stored status is still `expected`
    async fn update(&self, job: ExportJob, expected: ExportStatus) -> Result<ExportJob>;

    /// Atomically move the oldest pending job to running
    async fn claim_next(&self, now: DateTime<Utc>) -> Result<Option<ExportJob>>;

    /// Jobs of an organization, newest first
    async fn list(&self, organization_id: &str, status: Option<ExportStatus>) -> Result<Vec<ExportJob>>;

    /// Failed jobs whose retry backoff has elapsed
    async fn retry_due(&self, now: DateTime<Utc>) -> Result<Vec<ExportJob>>;
}

#[derive(Default)]
struct JobTable {
    jobs: HashMap<Uuid, ExportJob>,
    in_flight: HashMap<ExportKey, Uuid>,
}

impl JobTable {
    fn holder(&self, key: &ExportKey, job_id: Uuid) -> Option<Uuid> {
        self.in_flight.get(key).copied().filter(|id| *id != job_id)
    }
}

/// In-memory export job store
#[derive(Default)]
pub struct InMemoryExportJobStore {
    table: RwLock<JobTable>,
}

impl InMemoryExportJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ExportJobStore for InMemoryExportJobStore {
    async fn insert(&self, job: ExportJob) -> Result<ExportJob> {
        let mut table = self.table.write();
        let key = job.key();
        if let Some(job_id) = table.holder(&key, job.job_id) {
            return Err(TallyError::ExportInFlight { job_id });
        }
        if job.status.is_in_flight() {
            table.in_flight.insert(key, job.job_id);
        }
        table.jobs.insert(job.job_id, job.clone());
        Ok(job)
    }

    async fn get(&self, job_id: Uuid) -> Result<Option<ExportJob>> {
        Ok(self.table.read().jobs.get(&job_id).cloned())
    }

    async fn update(&self, job: ExportJob, expected: ExportStatus) -> Result<ExportJob> {
        let mut table = self.table.write();
        let current = table
            .jobs
            .get(&job.job_id)
            .ok_or_else(|| TallyError::NotFound(format!("export job {}", job.job_id)))?;

        if current.is_terminal() {
            return Err(TallyError::InvalidTransition {
                from: current.status,
                to: job.status,
            });
        }
        if current.status != expected {
            return Err(TallyError::InvalidTransition {
                from: current.status,
                to: job.status,
            });
        }

        let key = job.key();
        if job.status.is_in_flight() {
            if let Some(job_id) = table.holder(&key, job.job_id) {
                return Err(TallyError::ExportInFlight { job_id });
            }
            table.in_flight.insert(key, job.job_id);
        } else if table.in_flight.get(&key) == Some(&job.job_id) {
            table.in_flight.remove(&key);
        }

        table.jobs.insert(job.job_id, job.clone());
        Ok(job)
    }

    async fn claim_next(&self, now: DateTime<Utc>) -> Result<Option<ExportJob>> {
        let mut table = self.table.write();
        let next = table
            .jobs
            .values()
            .filter(|j| j.status == ExportStatus::Pending)
            .min_by_key(|j| (j.initiated_at, j.job_id))
            .map(|j| j.job_id);

        let Some(job_id) = next else {
            return Ok(None);
        };
        let Some(job) = table.jobs.get_mut(&job_id) else {
            return Ok(None);
        };
        job.start(now)?;
        Ok(Some(job.clone()))
    }

    async fn list(&self, organization_id: &str, status: Option<ExportStatus>) -> Result<Vec<ExportJob>> {
        let table = self.table.read();
        let mut jobs: Vec<ExportJob> = table
            .jobs
            .values()
            .filter(|j| j.organization_id == organization_id)
            .filter(|j| status.map_or(true, |s| j.status == s))
            .cloned()
            .collect();
        jobs.sort_by(|a, b| b.initiated_at.cmp(&a.initiated_at).then(b.job_id.cmp(&a.job_id)));
        Ok(jobs)
    }

    async fn retry_due(&self, now: DateTime<Utc>) -> Result<Vec<ExportJob>> {
        let table = self.table.read();
        let mut due: Vec<ExportJob> = table
            .jobs
            .values()
            .filter(|j| j.is_retry_due(now))
            .cloned()
            .collect();
        due.sort_by_key(|j| j.next_attempt_at);
        Ok(due)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::Arc;
    use tally_common::{ExportRequest, Granularity, TimeRange};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 8, 0, 0).unwrap()
    }

    fn request(org: &str) -> ExportRequest {
        let range = TimeRange::new(
            Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2026, 3, 2, 0, 0, 0).unwrap(),
        )
        .unwrap();
        ExportRequest::new(org, Granularity::Daily, range, "ops")
    }

    #[tokio::test]
    async fn test_second_identical_job_is_rejected() {
        let store = InMemoryExportJobStore::new();
        let first = store.insert(ExportJob::new(request("org-a"), 3, now())).await.unwrap();

        let err = store
            .insert(ExportJob::new(request("org-a"), 3, now()))
            .await
            .unwrap_err();
        assert!(matches!(err, TallyError::ExportInFlight { job_id } if job_id == first.job_id));

        // Different organization is independent
        assert!(store.insert(ExportJob::new(request("org-b"), 3, now())).await.is_ok());
    }

    #[tokio::test]
    async fn test_concurrent_inserts_admit_exactly_one() {
        let store = Arc::new(InMemoryExportJobStore::new());
        let mut handles = Vec::new();
        for _ in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.insert(ExportJob::new(request("org-a"), 3, now())).await
            }));
        }

        let mut admitted = 0;
        for handle in handles {
            if handle.await.unwrap().is_ok() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 1);
    }

    #[tokio::test]
    async fn test_slot_released_on_completion() {
        let store = InMemoryExportJobStore::new();
        store.insert(ExportJob::new(request("org-a"), 3, now())).await.unwrap();

        let mut running = store.claim_next(now()).await.unwrap().unwrap();
        assert_eq!(running.status, ExportStatus::Running);
        assert!(store.claim_next(now()).await.unwrap().is_none());

        running
            .fail("permanent", false, None, now())
            .unwrap();
        store.update(running.clone(), ExportStatus::Running).await.unwrap();

        assert!(store.insert(ExportJob::new(request("org-a"), 3, now())).await.is_ok());
        // Terminal jobs are immutable
        assert!(store.update(running, ExportStatus::Failed).await.is_err());
    }

    #[tokio::test]
    async fn test_stale_update_is_rejected() {
        let store = InMemoryExportJobStore::new();
        let job = store.insert(ExportJob::new(request("org-a"), 3, now())).await.unwrap();
        store.claim_next(now()).await.unwrap();

        let mut stale = job.clone();
        stale.fail("cancelled", false, None, now()).unwrap();
        assert!(matches!(
            store.update(stale, ExportStatus::Pending).await,
            Err(TallyError::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn test_retry_due_and_listing() {
        let store = InMemoryExportJobStore::new();
        store.insert(ExportJob::new(request("org-a"), 3, now())).await.unwrap();
        let mut running = store.claim_next(now()).await.unwrap().unwrap();
        running
            .fail("sink unavailable", true, Some(now() + chrono::Duration::seconds(30)), now())
            .unwrap();
        store.update(running, ExportStatus::Running).await.unwrap();

        assert!(store.retry_due(now()).await.unwrap().is_empty());
        assert_eq!(store.retry_due(now() + chrono::Duration::seconds(30)).await.unwrap().len(), 1);

        assert_eq!(store.list("org-a", None).await.unwrap().len(), 1);
        assert_eq!(store.list("org-a", Some(ExportStatus::Failed)).await.unwrap().len(), 1);
        assert!(store.list("org-a", Some(ExportStatus::Pending)).await.unwrap().is_empty());
    }
}
