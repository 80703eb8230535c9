//! Export worker pool
//!
//! Each worker polls for the oldest pending job and runs it to completion.
//! A separate ticker returns failed jobs to pending once their backoff has
//! elapsed.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::manager::ExportJobManager;

#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub workers: usize,
    pub poll_interval: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            poll_interval: Duration::from_millis(500),
        }
    }
}

pub struct ExportRunner {
    manager: Arc<ExportJobManager>,
    config: RunnerConfig,
}

impl ExportRunner {
    pub fn new(manager: Arc<ExportJobManager>, config: RunnerConfig) -> Self {
        Self { manager, config }
    }

    /// Spawn the workers and the retry ticker
    pub fn start(&self, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
        info!(workers = self.config.workers, "Starting export runner");
        let mut handles: Vec<JoinHandle<()>> = (0..self.config.workers.max(1))
            .map(|worker_id| {
                tokio::spawn(Self::worker(
                    worker_id,
                    self.manager.clone(),
                    self.config.poll_interval,
                    shutdown.clone(),
                ))
            })
            .collect();
        handles.push(tokio::spawn(Self::retry_ticker(
            self.manager.clone(),
            self.config.poll_interval,
            shutdown,
        )));
        handles
    }

    /// Drain every claimable job; returns how many ran
    pub async fn drain(manager: &ExportJobManager) -> usize {
        let mut ran = 0;
        loop {
            match manager.claim_next().await {
                Ok(Some(job)) => {
                    let job_id = job.job_id;
                    if let Err(e) = manager.execute(job).await {
                        error!(job_id = %job_id, error = %e, "Export run failed");
                    }
                    ran += 1;
                }
                Ok(None) => return ran,
                Err(e) => {
                    error!(error = %e, "Failed to claim export job");
                    return ran;
                }
            }
        }
    }

    async fn worker(
        worker_id: usize,
        manager: Arc<ExportJobManager>,
        poll_interval: Duration,
        shutdown: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(poll_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let ran = Self::drain(&manager).await;
                    if ran > 0 {
                        debug!(worker_id, ran, "Export worker drained queue");
                    }
                }
                _ = shutdown.cancelled() => {
                    info!(worker_id, "Export worker stopping");
                    break;
                }
            }
        }
    }

    async fn retry_ticker(manager: Arc<ExportJobManager>, poll_interval: Duration, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(poll_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = manager.requeue_due().await {
                        error!(error = %e, "Export requeue failed");
                    }
                }
                _ = shutdown.cancelled() => break,
            }
        }
    }
}
