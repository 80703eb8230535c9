//! Artifact delivery
//!
//! A sink stores a rendered artifact and returns where it lives. Delivery
//! is all-or-nothing: a failed or interrupted delivery leaves no artifact
//! visible at the returned location.

use async_trait::async_trait;
use dashmap::DashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

use tally_common::{ExportJob, Result, TallyError};

use crate::artifact::Artifact;

#[async_trait]
pub trait ArtifactSink: Send + Sync {
    /// Store the artifact for `job`; returns its location
    async fn deliver(&self, job: &ExportJob, artifact: &Artifact) -> Result<String>;
}

fn check_segment(segment: &str) -> Result<()> {
    if segment.is_empty() || segment.contains(['/', '\\']) || segment == "." || segment == ".." {
        return Err(TallyError::ExportPermanent(format!(
            "organization id is not usable as a path segment: {segment:?}"
        )));
    }
    Ok(())
}

/// Staging file removed on drop unless the write was committed
struct Staging {
    path: PathBuf,
    committed: bool,
}

impl Drop for Staging {
    fn drop(&mut self) {
        if !self.committed {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

/// Write `body` to a staging file next to `target`, then rename it into place
fn write_atomically(staging: PathBuf, target: &Path, body: &[u8]) -> Result<()> {
    let mut staging = Staging {
        path: staging,
        committed: false,
    };
    std::fs::write(&staging.path, body)?;
    std::fs::rename(&staging.path, target)?;
    staging.committed = true;
    Ok(())
}

/// Writes `<root>/<organization_id>/<job_id>.csv`
pub struct FilesystemSink {
    root: PathBuf,
}

impl FilesystemSink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, organization_id: &str, job_id: Uuid) -> PathBuf {
        self.root.join(organization_id).join(format!("{job_id}.csv"))
    }
}

#[async_trait]
impl ArtifactSink for FilesystemSink {
    async fn deliver(&self, job: &ExportJob, artifact: &Artifact) -> Result<String> {
        check_segment(&job.organization_id)?;
        let dir = self.root.join(&job.organization_id);
        tokio::fs::create_dir_all(&dir).await?;

        let target = self.path_for(&job.organization_id, job.job_id);
        let staging = dir.join(format!(".{}.csv.partial", job.job_id));
        // Runs to completion even if this future is dropped, so an
        // interrupted delivery never strands the staging file
        let body = artifact.body.clone();
        let written = target.clone();
        tokio::task::spawn_blocking(move || write_atomically(staging, &written, &body))
            .await
            .map_err(|e| TallyError::Internal(format!("artifact write task failed: {e}")))??;

        debug!(path = %target.display(), bytes = artifact.body.len(), "Artifact written");
        Ok(format!("file://{}", target.display()))
    }
}

/// Keeps artifacts in memory; can be told to fail or stall
#[derive(Default)]
pub struct InMemorySink {
    artifacts: DashMap<String, Artifact>,
    failures: AtomicU32,
    delay: Option<Duration>,
}

impl InMemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stall every delivery by `delay`
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Fail the next `n` deliveries with a transient error
    pub fn fail_next(&self, n: u32) {
        self.failures.store(n, Ordering::SeqCst);
    }

    pub fn get(&self, location: &str) -> Option<Artifact> {
        self.artifacts.get(location).map(|a| a.clone())
    }

    pub fn len(&self) -> usize {
        self.artifacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.artifacts.is_empty()
    }
}

#[async_trait]
impl ArtifactSink for InMemorySink {
    async fn deliver(&self, job: &ExportJob, artifact: &Artifact) -> Result<String> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let failed = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(TallyError::ExportTransient("sink unavailable".into()));
        }
        let location = format!("memory://{}/{}.csv", job.organization_id, job.job_id);
        self.artifacts.insert(location.clone(), artifact.clone());
        Ok(location)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::render_events;
    use chrono::{TimeZone, Utc};
    use tally_common::{ExportRequest, Granularity, TimeRange};

    fn job(org: &str) -> ExportJob {
        let range = TimeRange::new(
            Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2026, 3, 2, 0, 0, 0).unwrap(),
        )
        .unwrap();
        ExportJob::new(
            ExportRequest::new(org, Granularity::Daily, range, "ops"),
            3,
            Utc.with_ymd_and_hms(2026, 3, 2, 1, 0, 0).unwrap(),
        )
    }

    #[tokio::test]
    async fn test_filesystem_sink_writes_final_path_only() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FilesystemSink::new(dir.path());
        let job = job("org-a");
        let artifact = render_events(&[], false).unwrap();

        let location = sink.deliver(&job, &artifact).await.unwrap();
        let path = sink.path_for("org-a", job.job_id);
        assert_eq!(location, format!("file://{}", path.display()));
        assert_eq!(std::fs::read(&path).unwrap(), artifact.body);

        let entries: Vec<_> = std::fs::read_dir(dir.path().join("org-a"))
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(entries.len(), 1);
    }

    #[tokio::test]
    async fn test_filesystem_sink_failed_delivery_leaves_no_staging_file() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FilesystemSink::new(dir.path());
        let job = job("org-a");
        let artifact = render_events(&[], false).unwrap();

        // A directory squatting on the target path makes the rename fail
        std::fs::create_dir_all(sink.path_for("org-a", job.job_id)).unwrap();
        assert!(matches!(
            sink.deliver(&job, &artifact).await,
            Err(TallyError::Storage(_))
        ));

        let entries: Vec<_> = std::fs::read_dir(dir.path().join("org-a"))
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(entries, vec![format!("{}.csv", job.job_id)]);
    }

    #[tokio::test]
    async fn test_filesystem_sink_rejects_path_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FilesystemSink::new(dir.path());
        let artifact = render_events(&[], false).unwrap();
        assert!(matches!(
            sink.deliver(&job(".."), &artifact).await,
            Err(TallyError::ExportPermanent(_))
        ));
    }

    #[tokio::test]
    async fn test_memory_sink_injected_failures() {
        let sink = InMemorySink::new();
        sink.fail_next(1);
        let artifact = render_events(&[], false).unwrap();

        assert!(sink.deliver(&job("org-a"), &artifact).await.unwrap_err().is_transient());
        let location = sink.deliver(&job("org-a"), &artifact).await.unwrap();
        assert_eq!(sink.get(&location), Some(artifact));
    }
}
