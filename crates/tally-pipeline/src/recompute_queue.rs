//! Recompute-needed messages
//!
//! The batch tracker emits a typed request per late bucket key; the rollup
//! aggregator consumes them. A key already waiting in the queue is not
//! enqueued a second time. It becomes enqueueable again as soon as the
//! consumer takes it, so a flag raised mid-recompute is never lost.

use dashmap::DashSet;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;

use tally_common::BucketKey;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RecomputeReason {
    /// A batch closed after the bucket was rolled up
    LateBatch { batch_id: String },
    /// Operator request
    Manual,
    /// A late flag still outstanding after its queued recompute failed
    LatePending,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecomputeRequest {
    pub key: BucketKey,
    pub reason: RecomputeReason,
}

/// Producer half
#[derive(Clone)]
pub struct RecomputeQueue {
    tx: mpsc::UnboundedSender<RecomputeRequest>,
    pending: Arc<DashSet<BucketKey>>,
}

/// Consumer half
pub struct RecomputeReceiver {
    rx: mpsc::UnboundedReceiver<RecomputeRequest>,
    pending: Arc<DashSet<BucketKey>>,
}

/// Create a connected queue
pub fn recompute_queue() -> (RecomputeQueue, RecomputeReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    let pending = Arc::new(DashSet::new());
    (
        RecomputeQueue {
            tx,
            pending: pending.clone(),
        },
        RecomputeReceiver { rx, pending },
    )
}

impl RecomputeQueue {
    /// Enqueue a request; returns `false` if the key is already waiting or
    /// the consumer is gone
    pub fn enqueue(&self, request: RecomputeRequest) -> bool {
        if !self.pending.insert(request.key.clone()) {
            return false;
        }
        let key = request.key.clone();
        if self.tx.send(request).is_err() {
            self.pending.remove(&key);
            return false;
        }
        true
    }

    /// Keys waiting to be consumed
    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

impl RecomputeReceiver {
    pub async fn recv(&mut self) -> Option<RecomputeRequest> {
        let request = self.rx.recv().await?;
        self.pending.remove(&request.key);
        Some(request)
    }

    /// Non-blocking receive, used to drain the queue
    pub fn try_recv(&mut self) -> Option<RecomputeRequest> {
        let request = self.rx.try_recv().ok()?;
        self.pending.remove(&request.key);
        Some(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use tally_common::Granularity;

    fn request(model: &str) -> RecomputeRequest {
        RecomputeRequest {
            key: BucketKey::new(
                Granularity::Hourly,
                Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap(),
                "org-a",
                model,
            ),
            reason: RecomputeReason::LateBatch {
                batch_id: "b1".into(),
            },
        }
    }

    #[tokio::test]
    async fn test_pending_keys_are_coalesced() {
        let (queue, mut rx) = recompute_queue();
        assert!(queue.enqueue(request("m")));
        assert!(!queue.enqueue(request("m")));
        assert!(queue.enqueue(request("other")));
        assert_eq!(queue.pending(), 2);

        let first = rx.recv().await.unwrap();
        assert_eq!(first.key.model_id, "m");
        // Once taken, the key may be queued again
        assert!(queue.enqueue(request("m")));
    }

    #[tokio::test]
    async fn test_enqueue_after_consumer_dropped() {
        let (queue, rx) = recompute_queue();
        drop(rx);
        assert!(!queue.enqueue(request("m")));
        assert_eq!(queue.pending(), 0);
    }
}
