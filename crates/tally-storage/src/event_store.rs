//! Event store
//!
//! Durable, append-mostly record of admitted usage events. `admit` is the
//! only place idempotency is enforced: a second admission of an `event_id`
//! is a no-op reported as `AdmitOutcome::Duplicate`. The store also keeps
//! the per-batch ledger the batch tracker reads.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound;
use std::sync::Arc;
use tracing::{debug, info};

use tally_common::{
    AdmitOutcome, BucketKey, EventPosition, Granularity, IngestionBatch, Result, SeriesKey,
    SharedClock, TallyError, TimeRange, UsageEvent,
};

/// Time-bounded event query
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventQuery {
    pub organization_id: String,
    /// `None` matches every model of the organization
    pub model_id: Option<String>,
    pub range: TimeRange,
}

impl EventQuery {
    pub fn new(organization_id: impl Into<String>, range: TimeRange) -> Self {
        Self {
            organization_id: organization_id.into(),
            model_id: None,
            range,
        }
    }

    pub fn with_model(mut self, model_id: impl Into<String>) -> Self {
        self.model_id = Some(model_id.into());
        self
    }

    /// Query covering exactly one bucket's window
    pub fn for_bucket(key: &BucketKey) -> Self {
        Self {
            organization_id: key.organization_id.clone(),
            model_id: Some(key.model_id.clone()),
            range: key.window(),
        }
    }

    fn matches(&self, series: &SeriesKey) -> bool {
        series.organization_id == self.organization_id
            && self.model_id.as_ref().map_or(true, |m| *m == series.model_id)
    }
}

/// Trait for event storage backends
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Admit an event; duplicates are absorbed, never errors
    async fn admit(&self, event: UsageEvent) -> Result<AdmitOutcome>;

    /// Get an event by id
    async fn get(&self, event_id: &str) -> Result<Option<UsageEvent>>;

    /// Up to `limit` events matching `query`, in time order, strictly after `after`
    async fn query_page(
        &self,
        query: &EventQuery,
        after: Option<&EventPosition>,
        limit: usize,
    ) -> Result<Vec<UsageEvent>>;

    /// Distinct bucket keys with at least one event in `range`
    async fn bucket_keys(&self, granularity: Granularity, range: TimeRange) -> Result<Vec<BucketKey>>;

    /// Earliest retained event time
    async fn earliest_occurred_at(&self) -> Result<Option<DateTime<Utc>>>;

    /// Latest event time for an organization, or across all when `None`
    async fn last_event_at(&self, organization_id: Option<&str>) -> Result<Option<DateTime<Utc>>>;

    /// Record an organization's creation time (kept if already known)
    async fn register_organization(&self, organization_id: &str, created_at: DateTime<Utc>) -> Result<()>;

    /// Creation or first-seen time of an organization
    async fn first_seen(&self, organization_id: &str) -> Result<Option<DateTime<Utc>>>;

    /// Every known organization
    async fn organizations(&self) -> Result<Vec<String>>;

    /// Physically delete events before `cutoff`; returns the number removed
    async fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<u64>;

    /// Events before this time have been purged and are no longer admitted
    async fn retention_horizon(&self) -> Result<Option<DateTime<Utc>>>;

    // Batch ledger

    async fn get_batch(&self, batch_id: &str) -> Result<Option<IngestionBatch>>;

    async fn open_batches(&self) -> Result<Vec<IngestionBatch>>;

    /// Close an open batch; returns the closed snapshot, or `None` when the
    /// batch is unknown or already closed
    async fn close_batch(&self, batch_id: &str, at: DateTime<Utc>) -> Result<Option<IngestionBatch>>;

    /// Mark a batch late if it is still closed at `completed_at`
    async fn mark_batch_late(&self, batch_id: &str, completed_at: DateTime<Utc>) -> Result<bool>;
}

/// Cursor carried between pages of a scan
struct ScanCursor {
    store: Arc<dyn EventStore>,
    query: EventQuery,
    after: Option<EventPosition>,
    exhausted: bool,
}

async fn next_page(cursor: ScanCursor, page_size: usize) -> Result<Option<(Vec<UsageEvent>, ScanCursor)>> {
    if cursor.exhausted {
        return Ok(None);
    }
    let page = cursor
        .store
        .query_page(&cursor.query, cursor.after.as_ref(), page_size)
        .await?;
    if page.is_empty() {
        return Ok(None);
    }
    let next = ScanCursor {
        after: page.last().map(UsageEvent::position),
        exhausted: page.len() < page_size,
        ..cursor
    };
    Ok(Some((page, next)))
}

/// Lazy, restartable, time-ordered scan over an event query
///
/// Pages of `page_size` events are fetched on demand. To restart after an
/// interruption pass the position of the last event consumed as `resume`.
pub fn scan_events(
    store: Arc<dyn EventStore>,
    query: EventQuery,
    resume: Option<EventPosition>,
    page_size: usize,
) -> BoxStream<'static, Result<UsageEvent>> {
    let page_size = page_size.max(1);
    let cursor = ScanCursor {
        store,
        query,
        after: resume,
        exhausted: false,
    };
    stream::try_unfold(cursor, move |cursor| next_page(cursor, page_size))
        .map_ok(|page| stream::iter(page.into_iter().map(Ok::<_, TallyError>)))
        .try_flatten()
        .boxed()
}

/// In-memory event store
///
/// Events are indexed per series in time order. Event ids are kept after
/// purging so that re-deliveries of purged events stay duplicates.
pub struct InMemoryEventStore {
    clock: SharedClock,
    /// Dedup index: event_id -> series
    ids: DashMap<String, SeriesKey>,
    /// Events by series, ordered by position
    series: DashMap<SeriesKey, BTreeMap<EventPosition, UsageEvent>>,
    /// Batch ledger
    batches: DashMap<String, IngestionBatch>,
    /// Organization creation / first-seen times
    first_seen: DashMap<String, DateTime<Utc>>,
    /// Purge horizon
    horizon: RwLock<Option<DateTime<Utc>>>,
}

impl InMemoryEventStore {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            clock,
            ids: DashMap::new(),
            series: DashMap::new(),
            batches: DashMap::new(),
            first_seen: DashMap::new(),
            horizon: RwLock::new(None),
        }
    }

    /// Number of retained events
    pub fn len(&self) -> usize {
        self.series.iter().map(|s| s.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lower_bound(query: &EventQuery, after: Option<&EventPosition>) -> Bound<EventPosition> {
        let from = EventPosition {
            occurred_at: query.range.start,
            event_id: String::new(),
        };
        match after {
            Some(position) if *position >= from => Bound::Excluded(position.clone()),
            _ => Bound::Included(from),
        }
    }

    fn upper_bound(range: &TimeRange) -> Bound<EventPosition> {
        Bound::Excluded(EventPosition {
            occurred_at: range.end,
            event_id: String::new(),
        })
    }

    fn range_bounds(range: &TimeRange) -> (Bound<EventPosition>, Bound<EventPosition>) {
        (
            Bound::Included(EventPosition {
                occurred_at: range.start,
                event_id: String::new(),
            }),
            Self::upper_bound(range),
        )
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn admit(&self, event: UsageEvent) -> Result<AdmitOutcome> {
        event.validate()?;
        let now = self.clock.now();
        let horizon = *self.horizon.read();

        let outcome = match self.ids.entry(event.event_id.clone()) {
            Entry::Occupied(_) => AdmitOutcome::Duplicate,
            Entry::Vacant(slot) => {
                if horizon.map_or(false, |h| event.occurred_at < h) {
                    AdmitOutcome::Expired
                } else {
                    let series = event.series();
                    // Insert under the id slot so a concurrent duplicate
                    // never observes the id without the event
                    self.series
                        .entry(series.clone())
                        .or_default()
                        .insert(event.position(), event.clone());
                    slot.insert(series);
                    AdmitOutcome::Inserted
                }
            }
        };

        match outcome {
            AdmitOutcome::Inserted => {
                self.first_seen
                    .entry(event.organization_id.clone())
                    .or_insert(now);
                self.batches
                    .entry(event.batch_id.clone())
                    .or_insert_with(|| IngestionBatch::new(event.batch_id.clone(), now))
                    .record_event(&event, now);
            }
            AdmitOutcome::Duplicate => {
                self.batches
                    .entry(event.batch_id.clone())
                    .or_insert_with(|| IngestionBatch::new(event.batch_id.clone(), now))
                    .record_duplicate(now);
                debug!(event_id = %event.event_id, "Duplicate event ignored");
            }
            AdmitOutcome::Expired => {
                debug!(
                    event_id = %event.event_id,
                    occurred_at = %event.occurred_at,
                    "Event precedes retention horizon"
                );
            }
        }

        Ok(outcome)
    }

    async fn get(&self, event_id: &str) -> Result<Option<UsageEvent>> {
        let Some(series) = self.ids.get(event_id).map(|s| s.clone()) else {
            return Ok(None);
        };
        Ok(self.series.get(&series).and_then(|events| {
            events
                .values()
                .find(|e| e.event_id == event_id)
                .cloned()
        }))
    }

    async fn query_page(
        &self,
        query: &EventQuery,
        after: Option<&EventPosition>,
        limit: usize,
    ) -> Result<Vec<UsageEvent>> {
        let lower = Self::lower_bound(query, after);
        let upper = Self::upper_bound(&query.range);

        let mut page: Vec<UsageEvent> = Vec::new();
        for entry in self.series.iter().filter(|e| query.matches(e.key())) {
            page.extend(
                entry
                    .value()
                    .range((lower.clone(), upper.clone()))
                    .take(limit)
                    .map(|(_, e)| e.clone()),
            );
        }

        page.sort_by(|a, b| a.position().cmp(&b.position()));
        page.truncate(limit);
        Ok(page)
    }

    async fn bucket_keys(&self, granularity: Granularity, range: TimeRange) -> Result<Vec<BucketKey>> {
        let bounds = Self::range_bounds(&range);
        let mut keys = BTreeSet::new();
        for entry in self.series.iter() {
            let mut last_start = None;
            for position in entry.value().range(bounds.clone()).map(|(p, _)| p) {
                let start = granularity.truncate(position.occurred_at);
                if last_start != Some(start) {
                    keys.insert(BucketKey::for_series(granularity, start, entry.key()));
                    last_start = Some(start);
                }
            }
        }
        Ok(keys.into_iter().collect())
    }

    async fn earliest_occurred_at(&self) -> Result<Option<DateTime<Utc>>> {
        Ok(self
            .series
            .iter()
            .filter_map(|e| e.value().keys().next().map(|p| p.occurred_at))
            .min())
    }

    async fn last_event_at(&self, organization_id: Option<&str>) -> Result<Option<DateTime<Utc>>> {
        Ok(self
            .series
            .iter()
            .filter(|e| organization_id.map_or(true, |org| e.key().organization_id == org))
            .filter_map(|e| e.value().keys().next_back().map(|p| p.occurred_at))
            .max())
    }

    async fn register_organization(&self, organization_id: &str, created_at: DateTime<Utc>) -> Result<()> {
        self.first_seen
            .entry(organization_id.to_string())
            .and_modify(|seen| *seen = (*seen).min(created_at))
            .or_insert(created_at);
        Ok(())
    }

    async fn first_seen(&self, organization_id: &str) -> Result<Option<DateTime<Utc>>> {
        Ok(self.first_seen.get(organization_id).map(|t| *t))
    }

    async fn organizations(&self) -> Result<Vec<String>> {
        let mut orgs: Vec<String> = self.first_seen.iter().map(|e| e.key().clone()).collect();
        orgs.sort();
        Ok(orgs)
    }

    async fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        {
            let mut horizon = self.horizon.write();
            *horizon = Some(horizon.map_or(cutoff, |h| h.max(cutoff)));
        }

        let split = EventPosition {
            occurred_at: cutoff,
            event_id: String::new(),
        };
        let mut removed = 0u64;
        for mut entry in self.series.iter_mut() {
            let keep = entry.value_mut().split_off(&split);
            let dropped = std::mem::replace(entry.value_mut(), keep);
            removed += dropped.len() as u64;
        }
        self.series.retain(|_, events| !events.is_empty());

        if removed > 0 {
            info!(removed, cutoff = %cutoff, "Purged raw events");
        }
        Ok(removed)
    }

    async fn retention_horizon(&self) -> Result<Option<DateTime<Utc>>> {
        Ok(*self.horizon.read())
    }

    async fn get_batch(&self, batch_id: &str) -> Result<Option<IngestionBatch>> {
        Ok(self.batches.get(batch_id).map(|b| b.clone()))
    }

    async fn open_batches(&self) -> Result<Vec<IngestionBatch>> {
        let mut open: Vec<IngestionBatch> = self
            .batches
            .iter()
            .filter(|b| b.is_open())
            .map(|b| b.clone())
            .collect();
        open.sort_by(|a, b| a.received_at.cmp(&b.received_at));
        Ok(open)
    }

    async fn close_batch(&self, batch_id: &str, at: DateTime<Utc>) -> Result<Option<IngestionBatch>> {
        let Some(mut batch) = self.batches.get_mut(batch_id) else {
            return Ok(None);
        };
        if !batch.is_open() {
            return Ok(None);
        }
        batch.completed_at = Some(at);
        Ok(Some(batch.clone()))
    }

    async fn mark_batch_late(&self, batch_id: &str, completed_at: DateTime<Utc>) -> Result<bool> {
        let Some(mut batch) = self.batches.get_mut(batch_id) else {
            return Ok(false);
        };
        if batch.completed_at != Some(completed_at) {
            return Ok(false);
        }
        batch.is_late = true;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;
    use tally_common::ManualClock;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, h, m, 0).unwrap()
    }

    fn store() -> InMemoryEventStore {
        InMemoryEventStore::new(Arc::new(ManualClock::new(at(12, 0))))
    }

    fn event(id: &str, model: &str, ts: DateTime<Utc>) -> UsageEvent {
        UsageEvent::new(id, "org-a", model, ts, "batch-1")
            .with_tokens(10)
            .with_cost(dec!(0.01))
    }

    #[tokio::test]
    async fn test_admit_is_idempotent() {
        let store = store();
        let e = event("e1", "m", at(10, 15));

        assert_eq!(store.admit(e.clone()).await.unwrap(), AdmitOutcome::Inserted);
        assert_eq!(store.admit(e.clone()).await.unwrap(), AdmitOutcome::Duplicate);
        assert_eq!(store.len(), 1);

        let batch = store.get_batch("batch-1").await.unwrap().unwrap();
        assert_eq!(batch.event_count, 1);
        assert_eq!(batch.duplicate_count, 1);
        assert_eq!(store.get("e1").await.unwrap(), Some(e));
    }

    #[tokio::test]
    async fn test_admit_rejects_invalid_event() {
        let store = store();
        let e = event("e1", "m", at(10, 15)).with_cost(dec!(-0.5));
        assert!(store.admit(e).await.is_err());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_query_is_time_ordered_and_half_open() {
        let store = store();
        store.admit(event("e3", "m1", at(10, 45))).await.unwrap();
        store.admit(event("e1", "m2", at(10, 0))).await.unwrap();
        store.admit(event("e2", "m1", at(10, 15))).await.unwrap();
        store.admit(event("e4", "m1", at(11, 0))).await.unwrap();

        let range = TimeRange::new(at(10, 0), at(11, 0)).unwrap();
        let page = store
            .query_page(&EventQuery::new("org-a", range), None, 100)
            .await
            .unwrap();
        let ids: Vec<_> = page.iter().map(|e| e.event_id.as_str()).collect();
        assert_eq!(ids, vec!["e1", "e2", "e3"]);

        let page = store
            .query_page(&EventQuery::new("org-a", range).with_model("m1"), None, 100)
            .await
            .unwrap();
        assert_eq!(page.len(), 2);
    }

    #[tokio::test]
    async fn test_scan_pages_and_resumes() {
        let store: Arc<dyn EventStore> = Arc::new(store());
        for i in 0..7 {
            store
                .admit(event(&format!("e{i}"), "m", at(10, i * 5)))
                .await
                .unwrap();
        }
        let range = TimeRange::new(at(10, 0), at(11, 0)).unwrap();
        let query = EventQuery::new("org-a", range);

        let all: Vec<UsageEvent> = scan_events(store.clone(), query.clone(), None, 3)
            .try_collect()
            .await
            .unwrap();
        assert_eq!(all.len(), 7);

        let resumed: Vec<UsageEvent> =
            scan_events(store.clone(), query, Some(all[3].position()), 3)
                .try_collect()
                .await
                .unwrap();
        assert_eq!(resumed, all[4..].to_vec());
    }

    #[tokio::test]
    async fn test_bucket_keys_are_distinct() {
        let store = store();
        store.admit(event("e1", "m", at(9, 10))).await.unwrap();
        store.admit(event("e2", "m", at(9, 50))).await.unwrap();
        store.admit(event("e3", "m", at(10, 5))).await.unwrap();

        let keys = store
            .bucket_keys(Granularity::Hourly, TimeRange::new(at(0, 0), at(12, 0)).unwrap())
            .await
            .unwrap();
        let starts: Vec<_> = keys.iter().map(|k| k.bucket_start).collect();
        assert_eq!(starts, vec![at(9, 0), at(10, 0)]);
    }

    #[tokio::test]
    async fn test_purge_keeps_tombstones_and_sets_horizon() {
        let store = store();
        store.admit(event("old", "m", at(8, 0))).await.unwrap();
        store.admit(event("new", "m", at(11, 0))).await.unwrap();

        assert_eq!(store.purge_before(at(10, 0)).await.unwrap(), 1);
        assert_eq!(store.len(), 1);
        assert_eq!(store.retention_horizon().await.unwrap(), Some(at(10, 0)));

        // Re-delivery of a purged event is still a duplicate
        assert_eq!(
            store.admit(event("old", "m", at(8, 0))).await.unwrap(),
            AdmitOutcome::Duplicate
        );
        // A new event before the horizon cannot be rolled up faithfully any more
        assert_eq!(
            store.admit(event("older", "m", at(9, 0))).await.unwrap(),
            AdmitOutcome::Expired
        );
    }

    #[tokio::test]
    async fn test_close_batch_once() {
        let store = store();
        store.admit(event("e1", "m", at(10, 0))).await.unwrap();

        let closed = store.close_batch("batch-1", at(12, 5)).await.unwrap();
        assert!(closed.is_some());
        assert!(store.close_batch("batch-1", at(12, 6)).await.unwrap().is_none());
        assert!(store.open_batches().await.unwrap().is_empty());

        assert!(store.mark_batch_late("batch-1", at(12, 5)).await.unwrap());
        assert!(!store.mark_batch_late("batch-1", at(12, 6)).await.unwrap());
    }

    #[tokio::test]
    async fn test_freshness_inputs() {
        let store = store();
        store
            .register_organization("org-b", at(1, 0))
            .await
            .unwrap();
        store.admit(event("e1", "m", at(10, 0))).await.unwrap();
        store.admit(event("e2", "m", at(11, 30))).await.unwrap();

        assert_eq!(store.last_event_at(Some("org-a")).await.unwrap(), Some(at(11, 30)));
        assert_eq!(store.last_event_at(Some("org-b")).await.unwrap(), None);
        assert_eq!(store.first_seen("org-b").await.unwrap(), Some(at(1, 0)));
        assert_eq!(store.organizations().await.unwrap(), vec!["org-a", "org-b"]);
    }
}
