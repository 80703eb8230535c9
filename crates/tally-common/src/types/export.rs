//! Export jobs
//!
//! State machine: `pending -> running -> {completed | failed}`. A failed job
//! with attempts left and a transient cause may return to `pending`; once
//! that is no longer possible the job is terminal and immutable.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::bucket::{Granularity, TimeRange};
use crate::error::{Result, TallyError};

/// `error_detail` recorded when a job is cancelled
pub const CANCELLED_DETAIL: &str = "cancelled";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl ExportStatus {
    /// Statuses that hold the in-flight slot for an identical request
    pub const fn is_in_flight(self) -> bool {
        matches!(self, ExportStatus::Pending | ExportStatus::Running)
    }
}

impl fmt::Display for ExportStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExportStatus::Pending => write!(f, "pending"),
            ExportStatus::Running => write!(f, "running"),
            ExportStatus::Completed => write!(f, "completed"),
            ExportStatus::Failed => write!(f, "failed"),
        }
    }
}

impl FromStr for ExportStatus {
    type Err = TallyError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(ExportStatus::Pending),
            "running" => Ok(ExportStatus::Running),
            "completed" => Ok(ExportStatus::Completed),
            "failed" => Ok(ExportStatus::Failed),
            other => Err(TallyError::Validation(format!("unknown export status: {other}"))),
        }
    }
}

/// What an export reads
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportSource {
    /// Settled rollup buckets
    #[default]
    Rollups,
    /// Raw event detail
    RawEvents,
}

/// Client request for an export
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportRequest {
    pub organization_id: String,
    pub granularity: Granularity,
    pub range: TimeRange,
    pub initiated_by: String,
    #[serde(default)]
    pub source: ExportSource,
}

impl ExportRequest {
    pub fn new(
        organization_id: impl Into<String>,
        granularity: Granularity,
        range: TimeRange,
        initiated_by: impl Into<String>,
    ) -> Self {
        Self {
            organization_id: organization_id.into(),
            granularity,
            range,
            initiated_by: initiated_by.into(),
            source: ExportSource::Rollups,
        }
    }

    pub fn with_source(mut self, source: ExportSource) -> Self {
        self.source = source;
        self
    }

    pub fn key(&self) -> ExportKey {
        ExportKey {
            organization_id: self.organization_id.clone(),
            granularity: self.granularity,
            range: self.range,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.organization_id.is_empty() {
            return Err(TallyError::Validation("organization_id is required".into()));
        }
        if self.initiated_by.is_empty() {
            return Err(TallyError::Validation("initiated_by is required".into()));
        }
        self.range.validate()
    }
}

/// At most one pending or running job may exist per key
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExportKey {
    pub organization_id: String,
    pub granularity: Granularity,
    pub range: TimeRange,
}

/// A delivered export artifact
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveredArtifact {
    pub output_location: String,
    pub checksum: String,
    pub row_count: u64,
    pub truncated: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportJob {
    pub job_id: Uuid,
    pub organization_id: String,
    pub granularity: Granularity,
    pub requested_range: TimeRange,
    pub source: ExportSource,
    pub status: ExportStatus,
    pub initiated_by: String,
    pub initiated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub output_location: Option<String>,
    pub checksum: Option<String>,
    pub row_count: Option<u64>,
    /// Raw exports stop at a row cap
    pub truncated: bool,
    pub error_detail: Option<String>,
    pub attempt_count: u32,
    pub max_attempts: u32,
    /// Failed with a transient cause and attempts left
    pub retry_eligible: bool,
    pub next_attempt_at: Option<DateTime<Utc>>,
}

impl ExportJob {
    /// Create a pending job for a request
    pub fn new(request: ExportRequest, max_attempts: u32, now: DateTime<Utc>) -> Self {
        Self {
            job_id: Uuid::now_v7(),
            organization_id: request.organization_id,
            granularity: request.granularity,
            requested_range: request.range,
            source: request.source,
            status: ExportStatus::Pending,
            initiated_by: request.initiated_by,
            initiated_at: now,
            started_at: None,
            completed_at: None,
            output_location: None,
            checksum: None,
            row_count: None,
            truncated: false,
            error_detail: None,
            attempt_count: 0,
            max_attempts,
            retry_eligible: false,
            next_attempt_at: None,
        }
    }

    pub fn key(&self) -> ExportKey {
        ExportKey {
            organization_id: self.organization_id.clone(),
            granularity: self.granularity,
            range: self.requested_range,
        }
    }

    /// Completed, or failed with no way back to pending
    pub fn is_terminal(&self) -> bool {
        match self.status {
            ExportStatus::Completed => true,
            ExportStatus::Failed => !self.retry_eligible,
            ExportStatus::Pending | ExportStatus::Running => false,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.status == ExportStatus::Failed && self.error_detail.as_deref() == Some(CANCELLED_DETAIL)
    }

    fn transition_error(&self, to: ExportStatus) -> TallyError {
        TallyError::InvalidTransition {
            from: self.status,
            to,
        }
    }

    /// `pending -> running`, consuming one attempt
    pub fn start(&mut self, now: DateTime<Utc>) -> Result<()> {
        if self.status != ExportStatus::Pending {
            return Err(self.transition_error(ExportStatus::Running));
        }
        self.status = ExportStatus::Running;
        self.attempt_count += 1;
        self.started_at = Some(now);
        self.error_detail = None;
        self.retry_eligible = false;
        self.next_attempt_at = None;
        Ok(())
    }

    /// `running -> completed`
    pub fn complete(&mut self, artifact: DeliveredArtifact, now: DateTime<Utc>) -> Result<()> {
        if self.status != ExportStatus::Running {
            return Err(self.transition_error(ExportStatus::Completed));
        }
        self.status = ExportStatus::Completed;
        self.completed_at = Some(now);
        self.output_location = Some(artifact.output_location);
        self.checksum = Some(artifact.checksum);
        self.row_count = Some(artifact.row_count);
        self.truncated = artifact.truncated;
        self.error_detail = None;
        Ok(())
    }

    /// `{pending | running} -> failed`
    ///
    /// The job stays retryable only for transient causes with attempts left;
    /// `next_attempt_at` is only kept in that case.
    pub fn fail(
        &mut self,
        detail: impl Into<String>,
        transient: bool,
        next_attempt_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if !self.status.is_in_flight() {
            return Err(self.transition_error(ExportStatus::Failed));
        }
        self.status = ExportStatus::Failed;
        self.completed_at = Some(now);
        self.error_detail = Some(detail.into());
        self.retry_eligible = transient && self.attempt_count < self.max_attempts;
        self.next_attempt_at = if self.retry_eligible { next_attempt_at } else { None };
        Ok(())
    }

    /// `failed -> pending` for a retryable job
    pub fn requeue(&mut self) -> Result<()> {
        if self.status != ExportStatus::Failed || !self.retry_eligible {
            return Err(self.transition_error(ExportStatus::Pending));
        }
        self.status = ExportStatus::Pending;
        self.completed_at = None;
        self.retry_eligible = false;
        self.next_attempt_at = None;
        Ok(())
    }

    /// Retryable and its backoff has elapsed
    pub fn is_retry_due(&self, now: DateTime<Utc>) -> bool {
        self.status == ExportStatus::Failed
            && self.retry_eligible
            && self.next_attempt_at.map_or(true, |at| at <= now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 8, 0, 0).unwrap()
    }

    fn job(max_attempts: u32) -> ExportJob {
        let range = TimeRange::new(
            Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2026, 3, 2, 0, 0, 0).unwrap(),
        )
        .unwrap();
        ExportJob::new(
            ExportRequest::new("org-a", Granularity::Hourly, range, "ops@example.com"),
            max_attempts,
            now(),
        )
    }

    #[test]
    fn test_happy_path() {
        let mut job = job(3);
        job.start(now()).unwrap();
        assert_eq!(job.attempt_count, 1);
        job.complete(
            DeliveredArtifact {
                output_location: "file:///exports/a.csv".into(),
                checksum: "abc".into(),
                row_count: 4,
                truncated: false,
            },
            now(),
        )
        .unwrap();
        assert!(job.is_terminal());
        assert!(job.start(now()).is_err());
    }

    #[test]
    fn test_transient_failure_is_retryable_until_attempts_exhausted() {
        let mut job = job(2);
        job.start(now()).unwrap();
        job.fail("sink unavailable", true, Some(now()), now()).unwrap();
        assert!(!job.is_terminal());
        assert!(job.is_retry_due(now()));

        job.requeue().unwrap();
        job.start(now()).unwrap();
        job.fail("sink unavailable", true, Some(now()), now()).unwrap();
        assert_eq!(job.attempt_count, 2);
        assert!(job.is_terminal());
        assert!(job.requeue().is_err());
    }

    #[test]
    fn test_permanent_failure_is_terminal() {
        let mut job = job(5);
        job.start(now()).unwrap();
        job.fail("unsupported range", false, None, now()).unwrap();
        assert!(job.is_terminal());
        assert!(job.next_attempt_at.is_none());
    }

    #[test]
    fn test_cancelled_detection() {
        let mut job = job(5);
        job.fail(CANCELLED_DETAIL, false, None, now()).unwrap();
        assert!(job.is_cancelled());
        assert!(job.is_terminal());
    }
}
