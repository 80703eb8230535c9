//! Ingestion batches
//!
//! A batch groups the events delivered together by the ingestion boundary.
//! It is open while events stream in and closes on an explicit signal or
//! after an inactivity timeout.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use super::event::{SeriesKey, UsageEvent};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestionBatch {
    pub batch_id: String,
    /// First admission for this batch
    pub received_at: DateTime<Utc>,
    /// Most recent admission (drives the inactivity timeout)
    pub last_activity_at: DateTime<Utc>,
    /// Events inserted under this batch
    pub event_count: u64,
    /// Re-deliveries absorbed as duplicates
    pub duplicate_count: u64,
    pub min_occurred_at: Option<DateTime<Utc>>,
    pub max_occurred_at: Option<DateTime<Utc>>,
    /// Null while events are still streaming in
    pub completed_at: Option<DateTime<Utc>>,
    /// Set when the batch closed after a window it touches was already rolled up
    pub is_late: bool,
    /// Series that received events from this batch
    pub series: BTreeSet<SeriesKey>,
}

impl IngestionBatch {
    pub fn new(batch_id: impl Into<String>, received_at: DateTime<Utc>) -> Self {
        Self {
            batch_id: batch_id.into(),
            received_at,
            last_activity_at: received_at,
            event_count: 0,
            duplicate_count: 0,
            min_occurred_at: None,
            max_occurred_at: None,
            completed_at: None,
            is_late: false,
            series: BTreeSet::new(),
        }
    }

    /// Count an inserted event
    ///
    /// An event for a closed batch re-opens it so that it is evaluated again
    /// on its next close.
    pub fn record_event(&mut self, event: &UsageEvent, now: DateTime<Utc>) {
        self.event_count += 1;
        self.last_activity_at = now;
        self.min_occurred_at = Some(match self.min_occurred_at {
            Some(min) => min.min(event.occurred_at),
            None => event.occurred_at,
        });
        self.max_occurred_at = Some(match self.max_occurred_at {
            Some(max) => max.max(event.occurred_at),
            None => event.occurred_at,
        });
        self.series.insert(event.series());
        if self.completed_at.is_some() {
            self.completed_at = None;
            self.is_late = false;
        }
    }

    /// Count a duplicate re-delivery
    pub fn record_duplicate(&mut self, now: DateTime<Utc>) {
        self.duplicate_count += 1;
        self.last_activity_at = now;
    }

    #[inline]
    pub fn is_open(&self) -> bool {
        self.completed_at.is_none()
    }

    /// Open and without admissions for at least `timeout`
    pub fn is_idle(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        self.is_open() && now - self.last_activity_at >= timeout
    }

    /// Whether this batch still might deliver events for `organization_id`
    /// that land before `window_end`
    pub fn may_land_before(&self, organization_id: &str, window_end: DateTime<Utc>) -> bool {
        self.is_open()
            && self.series.iter().any(|s| s.organization_id == organization_id)
            && self.min_occurred_at.map_or(false, |min| min < window_end)
    }

    pub fn organizations(&self) -> BTreeSet<String> {
        self.series.iter().map(|s| s.organization_id.clone()).collect()
    }
}

/// Snapshot of a batch close evaluation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchCloseReport {
    pub batch: IngestionBatch,
    /// Bucket keys queued for forced recomputation
    pub flagged: Vec<super::bucket::BucketKey>,
}

impl BatchCloseReport {
    pub fn is_late(&self) -> bool {
        self.batch.is_late
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, h, m, 0).unwrap()
    }

    #[test]
    fn test_record_event_tracks_bounds() {
        let mut batch = IngestionBatch::new("b1", at(12, 0));
        batch.record_event(&UsageEvent::new("e1", "org-a", "m", at(10, 30), "b1"), at(12, 0));
        batch.record_event(&UsageEvent::new("e2", "org-a", "m", at(9, 15), "b1"), at(12, 1));

        assert_eq!(batch.event_count, 2);
        assert_eq!(batch.min_occurred_at, Some(at(9, 15)));
        assert_eq!(batch.max_occurred_at, Some(at(10, 30)));
        assert_eq!(batch.last_activity_at, at(12, 1));
        assert!(batch.is_open());
    }

    #[test]
    fn test_idle_detection() {
        let mut batch = IngestionBatch::new("b1", at(12, 0));
        assert!(!batch.is_idle(at(12, 4), Duration::minutes(5)));
        assert!(batch.is_idle(at(12, 5), Duration::minutes(5)));

        batch.completed_at = Some(at(12, 6));
        assert!(!batch.is_idle(at(13, 0), Duration::minutes(5)));
    }

    #[test]
    fn test_event_reopens_closed_batch() {
        let mut batch = IngestionBatch::new("b1", at(12, 0));
        batch.completed_at = Some(at(12, 5));
        batch.is_late = true;

        batch.record_event(&UsageEvent::new("e1", "org-a", "m", at(11, 0), "b1"), at(12, 10));
        assert!(batch.is_open());
        assert!(!batch.is_late);
    }

    #[test]
    fn test_may_land_before_is_scoped_to_organization() {
        let mut batch = IngestionBatch::new("b1", at(12, 0));
        batch.record_event(&UsageEvent::new("e1", "org-a", "m", at(10, 30), "b1"), at(12, 0));

        assert!(batch.may_land_before("org-a", at(11, 0)));
        assert!(!batch.may_land_before("org-a", at(10, 0)));
        assert!(!batch.may_land_before("org-b", at(11, 0)));
    }
}
