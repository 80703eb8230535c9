//! Rollup store
//!
//! One row per `(granularity, bucket_start, organization_id, model_id)`.
//! Writes are conditional on the row revision the writer read, so a
//! recompute that raced with a late-data flag or another writer fails with
//! `AggregationConflict` instead of overwriting newer state.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use tally_common::{BucketKey, Granularity, Result, RollupBucket, TallyError, TimeRange};

/// Rollup read query
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollupQuery {
    pub granularity: Granularity,
    pub organization_id: String,
    #[serde(default)]
    pub model_id: Option<String>,
    pub range: TimeRange,
    /// Only return windows the watermark has settled
    #[serde(default)]
    pub finalized_only: bool,
}

impl RollupQuery {
    pub fn new(granularity: Granularity, organization_id: impl Into<String>, range: TimeRange) -> Self {
        Self {
            granularity,
            organization_id: organization_id.into(),
            model_id: None,
            range,
            finalized_only: false,
        }
    }

    fn matches(&self, bucket: &RollupBucket) -> bool {
        let key = &bucket.key;
        key.granularity == self.granularity
            && key.organization_id == self.organization_id
            && self.model_id.as_ref().map_or(true, |m| *m == key.model_id)
            && self.range.contains(key.bucket_start)
            && (!self.finalized_only || bucket.is_finalized())
    }
}

/// Trait for rollup storage backends
#[async_trait]
pub trait RollupStore: Send + Sync {
    async fn get(&self, key: &BucketKey) -> Result<Option<RollupBucket>>;

    /// Replace a row's aggregate if its revision is still `expected_revision`
    /// (0 meaning the row must not exist yet)
    ///
    /// `finalized_at` of an existing row is kept and `late_pending` cleared.
    /// Returns the stored row.
    async fn upsert(&self, bucket: RollupBucket, expected_revision: u64) -> Result<RollupBucket>;

    /// Stamp a row as settled; no-op if already finalized
    async fn mark_finalized(&self, key: &BucketKey, at: DateTime<Utc>) -> Result<bool>;

    /// Flag a row for forced recomputation
    ///
    /// Bumps the revision so any in-flight recompute that read the row
    /// before the flag conflicts.
    async fn flag_late(&self, key: &BucketKey) -> Result<bool>;

    /// Rows with an outstanding late-data recompute
    async fn late_pending(&self) -> Result<Vec<BucketKey>>;

    /// Rows matching `query`, ordered by `(bucket_start, model_id)`
    async fn query(&self, query: &RollupQuery) -> Result<Vec<RollupBucket>>;

    /// Exclusive end of the settled prefix at `granularity`
    async fn watermark(&self, granularity: Granularity) -> Result<Option<DateTime<Utc>>>;

    /// Move the watermark forward; never moves it back
    async fn advance_watermark(&self, granularity: Granularity, to: DateTime<Utc>) -> Result<DateTime<Utc>>;

    /// Record that windows ending at or before `up_to` are being finalized
    ///
    /// Written before the watermark moves, so a batch closing mid-pass sees
    /// the window as already rolled up. Never moves back.
    async fn begin_finalizing(&self, granularity: Granularity, up_to: DateTime<Utc>) -> Result<DateTime<Utc>>;

    /// End of the windows the watermark has settled or is settling
    async fn settling_horizon(&self, granularity: Granularity) -> Result<Option<DateTime<Utc>>>;
}

/// In-memory rollup store
#[derive(Default)]
pub struct InMemoryRollupStore {
    rows: DashMap<BucketKey, RollupBucket>,
    watermarks: DashMap<Granularity, DateTime<Utc>>,
    finalizing: DashMap<Granularity, DateTime<Utc>>,
}

impl InMemoryRollupStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

#[async_trait]
impl RollupStore for InMemoryRollupStore {
    async fn get(&self, key: &BucketKey) -> Result<Option<RollupBucket>> {
        Ok(self.rows.get(key).map(|r| r.clone()))
    }

    async fn upsert(&self, mut bucket: RollupBucket, expected_revision: u64) -> Result<RollupBucket> {
        match self.rows.entry(bucket.key.clone()) {
            Entry::Vacant(slot) => {
                if expected_revision != 0 {
                    return Err(TallyError::AggregationConflict { key: bucket.key });
                }
                bucket.revision = 1;
                bucket.late_pending = false;
                slot.insert(bucket.clone());
            }
            Entry::Occupied(mut slot) => {
                let current = slot.get();
                if current.revision != expected_revision {
                    debug!(
                        key = %bucket.key,
                        expected = expected_revision,
                        actual = current.revision,
                        "Rollup revision mismatch"
                    );
                    return Err(TallyError::AggregationConflict { key: bucket.key });
                }
                bucket.finalized_at = current.finalized_at.or(bucket.finalized_at);
                bucket.late_pending = false;
                bucket.revision = expected_revision + 1;
                slot.insert(bucket.clone());
            }
        }
        Ok(bucket)
    }

    async fn mark_finalized(&self, key: &BucketKey, at: DateTime<Utc>) -> Result<bool> {
        let Some(mut row) = self.rows.get_mut(key) else {
            return Ok(false);
        };
        if row.finalized_at.is_some() {
            return Ok(false);
        }
        row.finalized_at = Some(at);
        row.revision += 1;
        Ok(true)
    }

    async fn flag_late(&self, key: &BucketKey) -> Result<bool> {
        let Some(mut row) = self.rows.get_mut(key) else {
            return Ok(false);
        };
        row.late_pending = true;
        row.revision += 1;
        Ok(true)
    }

    async fn late_pending(&self) -> Result<Vec<BucketKey>> {
        let mut keys: Vec<BucketKey> = self
            .rows
            .iter()
            .filter(|r| r.late_pending)
            .map(|r| r.key().clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn query(&self, query: &RollupQuery) -> Result<Vec<RollupBucket>> {
        let mut rows: Vec<RollupBucket> = self
            .rows
            .iter()
            .filter(|r| query.matches(r.value()))
            .map(|r| r.value().clone())
            .collect();
        rows.sort_by(|a, b| {
            a.key
                .bucket_start
                .cmp(&b.key.bucket_start)
                .then_with(|| a.key.model_id.cmp(&b.key.model_id))
        });
        Ok(rows)
    }

    async fn watermark(&self, granularity: Granularity) -> Result<Option<DateTime<Utc>>> {
        Ok(self.watermarks.get(&granularity).map(|w| *w))
    }

    async fn advance_watermark(&self, granularity: Granularity, to: DateTime<Utc>) -> Result<DateTime<Utc>> {
        let mut watermark = self.watermarks.entry(granularity).or_insert(to);
        if to > *watermark {
            *watermark = to;
        }
        Ok(*watermark)
    }

    async fn begin_finalizing(&self, granularity: Granularity, up_to: DateTime<Utc>) -> Result<DateTime<Utc>> {
        let mut horizon = self.finalizing.entry(granularity).or_insert(up_to);
        if up_to > *horizon {
            *horizon = up_to;
        }
        Ok(*horizon)
    }

    async fn settling_horizon(&self, granularity: Granularity) -> Result<Option<DateTime<Utc>>> {
        let watermark = self.watermarks.get(&granularity).map(|w| *w);
        let finalizing = self.finalizing.get(&granularity).map(|f| *f);
        Ok(watermark.max(finalizing))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;
    use tally_common::BucketAggregate;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, h, m, 0).unwrap()
    }

    fn bucket(model: &str, hour: u32, requests: u64) -> RollupBucket {
        let key = BucketKey::new(Granularity::Hourly, at(hour, 0), "org-a", model);
        let aggregate = BucketAggregate {
            request_count: requests,
            tokens_total: requests * 10,
            error_count: 0,
            cost_total: dec!(0.01) * rust_decimal::Decimal::from(requests),
        };
        RollupBucket::from_aggregate(key, aggregate, at(12, 0))
    }

    #[tokio::test]
    async fn test_conditional_upsert() {
        let store = InMemoryRollupStore::new();

        let row = store.upsert(bucket("m", 10, 5), 0).await.unwrap();
        assert_eq!(row.revision, 1);

        // Stale writer
        let err = store.upsert(bucket("m", 10, 4), 0).await.unwrap_err();
        assert!(matches!(err, TallyError::AggregationConflict { .. }));

        let row = store.upsert(bucket("m", 10, 6), 1).await.unwrap();
        assert_eq!(row.revision, 2);
        assert_eq!(row.request_count, 6);
    }

    #[tokio::test]
    async fn test_flag_late_invalidates_in_flight_writers() {
        let store = InMemoryRollupStore::new();
        let row = store.upsert(bucket("m", 10, 5), 0).await.unwrap();

        assert!(store.flag_late(&row.key).await.unwrap());
        assert_eq!(store.late_pending().await.unwrap(), vec![row.key.clone()]);
        assert!(store.upsert(bucket("m", 10, 5), row.revision).await.is_err());

        let current = store.get(&row.key).await.unwrap().unwrap();
        let refreshed = store.upsert(bucket("m", 10, 6), current.revision).await.unwrap();
        assert!(!refreshed.late_pending);
        assert!(store.late_pending().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_upsert_keeps_finalized_at() {
        let store = InMemoryRollupStore::new();
        let row = store.upsert(bucket("m", 10, 5), 0).await.unwrap();
        assert!(store.mark_finalized(&row.key, at(11, 2)).await.unwrap());
        assert!(!store.mark_finalized(&row.key, at(11, 3)).await.unwrap());

        let current = store.get(&row.key).await.unwrap().unwrap();
        let row = store.upsert(bucket("m", 10, 6), current.revision).await.unwrap();
        assert_eq!(row.finalized_at, Some(at(11, 2)));
    }

    #[tokio::test]
    async fn test_query_orders_and_filters() {
        let store = InMemoryRollupStore::new();
        store.upsert(bucket("m2", 10, 1), 0).await.unwrap();
        store.upsert(bucket("m1", 10, 1), 0).await.unwrap();
        store.upsert(bucket("m1", 9, 1), 0).await.unwrap();
        store.upsert(bucket("m1", 11, 1), 0).await.unwrap();

        let query = RollupQuery::new(
            Granularity::Hourly,
            "org-a",
            TimeRange::new(at(9, 0), at(11, 0)).unwrap(),
        );
        let rows = store.query(&query).await.unwrap();
        let order: Vec<_> = rows
            .iter()
            .map(|r| (r.key.bucket_start, r.key.model_id.as_str()))
            .collect();
        assert_eq!(order, vec![(at(9, 0), "m1"), (at(10, 0), "m1"), (at(10, 0), "m2")]);

        let settled = RollupQuery {
            finalized_only: true,
            ..query
        };
        assert!(store.query(&settled).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_watermark_is_monotonic() {
        let store = InMemoryRollupStore::new();
        assert_eq!(store.watermark(Granularity::Hourly).await.unwrap(), None);

        store.advance_watermark(Granularity::Hourly, at(11, 0)).await.unwrap();
        let wm = store.advance_watermark(Granularity::Hourly, at(10, 0)).await.unwrap();
        assert_eq!(wm, at(11, 0));
        assert_eq!(store.watermark(Granularity::Daily).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_settling_horizon_covers_windows_being_finalized() {
        let store = InMemoryRollupStore::new();
        assert_eq!(store.settling_horizon(Granularity::Hourly).await.unwrap(), None);

        store.advance_watermark(Granularity::Hourly, at(10, 0)).await.unwrap();
        store.begin_finalizing(Granularity::Hourly, at(11, 0)).await.unwrap();
        assert_eq!(store.watermark(Granularity::Hourly).await.unwrap(), Some(at(10, 0)));
        assert_eq!(store.settling_horizon(Granularity::Hourly).await.unwrap(), Some(at(11, 0)));

        store.advance_watermark(Granularity::Hourly, at(12, 0)).await.unwrap();
        assert_eq!(store.settling_horizon(Granularity::Hourly).await.unwrap(), Some(at(12, 0)));
    }
}
