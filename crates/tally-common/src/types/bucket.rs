//! Rollup buckets
//!
//! A bucket is identified by `(granularity, bucket_start, organization_id,
//! model_id)` and holds the aggregate over exactly the events whose
//! `occurred_at` falls in `[bucket_start, bucket_start + granularity)`.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::event::{SeriesKey, UsageEvent};
use crate::error::{Result, TallyError};

/// Rollup window size
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    Hourly,
    Daily,
}

impl Granularity {
    /// Every supported granularity, finest first
    pub const ALL: [Granularity; 2] = [Granularity::Hourly, Granularity::Daily];

    /// Window length in seconds
    pub const fn seconds(self) -> i64 {
        match self {
            Granularity::Hourly => 3_600,
            Granularity::Daily => 86_400,
        }
    }

    /// Window length
    pub fn duration(self) -> Duration {
        Duration::seconds(self.seconds())
    }

    /// Start of the window containing `ts`
    pub fn truncate(self, ts: DateTime<Utc>) -> DateTime<Utc> {
        let rem = ts.timestamp().rem_euclid(self.seconds());
        ts - Duration::seconds(rem) - Duration::nanoseconds(i64::from(ts.timestamp_subsec_nanos()))
    }

    /// Start of the first window that begins at or after `ts`
    pub fn ceil(self, ts: DateTime<Utc>) -> DateTime<Utc> {
        let start = self.truncate(ts);
        if start == ts {
            start
        } else {
            start + self.duration()
        }
    }

    /// Window starts whose windows intersect `[from, to]` (inclusive of `to`)
    pub fn starts_spanning(self, from: DateTime<Utc>, to: DateTime<Utc>) -> Vec<DateTime<Utc>> {
        let mut starts = Vec::new();
        let mut cursor = self.truncate(from);
        let last = self.truncate(to);
        while cursor <= last {
            starts.push(cursor);
            cursor += self.duration();
        }
        starts
    }
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Granularity::Hourly => write!(f, "hourly"),
            Granularity::Daily => write!(f, "daily"),
        }
    }
}

impl FromStr for Granularity {
    type Err = TallyError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "hourly" | "hour" => Ok(Granularity::Hourly),
            "daily" | "day" => Ok(Granularity::Daily),
            other => Err(TallyError::Validation(format!("unsupported granularity: {other}"))),
        }
    }
}

/// Half-open time range `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self> {
        let range = Self { start, end };
        range.validate()?;
        Ok(range)
    }

    pub fn validate(&self) -> Result<()> {
        if self.start >= self.end {
            return Err(TallyError::Validation(format!(
                "range start {} must precede end {}",
                self.start, self.end
            )));
        }
        Ok(())
    }

    #[inline]
    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        ts >= self.start && ts < self.end
    }

    /// Window starts covered by this range at `granularity`
    ///
    /// The first window is the one containing `start`; the last one begins
    /// strictly before `end`.
    pub fn bucket_starts(&self, granularity: Granularity) -> Vec<DateTime<Utc>> {
        let mut starts = Vec::new();
        let mut cursor = granularity.truncate(self.start);
        while cursor < self.end {
            starts.push(cursor);
            cursor += granularity.duration();
        }
        starts
    }

    /// Range widened to whole windows at `granularity`
    pub fn aligned(&self, granularity: Granularity) -> TimeRange {
        TimeRange {
            start: granularity.truncate(self.start),
            end: granularity.ceil(self.end),
        }
    }
}

/// Identity of one rollup row
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BucketKey {
    pub granularity: Granularity,
    pub bucket_start: DateTime<Utc>,
    pub organization_id: String,
    pub model_id: String,
}

impl BucketKey {
    /// Key for the window at `granularity` containing `ts`
    pub fn new(
        granularity: Granularity,
        ts: DateTime<Utc>,
        organization_id: impl Into<String>,
        model_id: impl Into<String>,
    ) -> Self {
        Self {
            granularity,
            bucket_start: granularity.truncate(ts),
            organization_id: organization_id.into(),
            model_id: model_id.into(),
        }
    }

    /// Key for a series at a given window start
    pub fn for_series(granularity: Granularity, bucket_start: DateTime<Utc>, series: &SeriesKey) -> Self {
        Self::new(
            granularity,
            bucket_start,
            series.organization_id.clone(),
            series.model_id.clone(),
        )
    }

    /// Exclusive end of the window
    pub fn bucket_end(&self) -> DateTime<Utc> {
        self.bucket_start + self.granularity.duration()
    }

    /// The window as a half-open range
    pub fn window(&self) -> TimeRange {
        TimeRange {
            start: self.bucket_start,
            end: self.bucket_end(),
        }
    }

    pub fn series(&self) -> SeriesKey {
        SeriesKey::new(self.organization_id.clone(), self.model_id.clone())
    }
}

impl fmt::Display for BucketKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.granularity,
            self.bucket_start.to_rfc3339(),
            self.organization_id,
            self.model_id
        )
    }
}

/// Aggregate values of a bucket, accumulated from scratch on every recompute
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketAggregate {
    pub request_count: u64,
    pub tokens_total: u64,
    pub error_count: u64,
    pub cost_total: Decimal,
}

impl BucketAggregate {
    /// Fold one event in; fails instead of wrapping when a total overflows
    pub fn add_event(&mut self, event: &UsageEvent) -> Result<()> {
        let overflow = |field: &str| TallyError::Internal(format!("{field} overflowed while aggregating"));
        self.request_count = self.request_count.checked_add(1).ok_or_else(|| overflow("request_count"))?;
        self.tokens_total = self
            .tokens_total
            .checked_add(event.tokens_consumed)
            .ok_or_else(|| overflow("tokens_total"))?;
        if event.is_error() {
            self.error_count = self.error_count.checked_add(1).ok_or_else(|| overflow("error_count"))?;
        }
        self.cost_total = self
            .cost_total
            .checked_add(event.cost_usd)
            .ok_or_else(|| overflow("cost_total"))?;
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.request_count == 0
    }

    pub fn from_events<'a>(events: impl IntoIterator<Item = &'a UsageEvent>) -> Result<Self> {
        let mut aggregate = BucketAggregate::default();
        for event in events {
            aggregate.add_event(event)?;
        }
        Ok(aggregate)
    }
}

/// Stored rollup row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollupBucket {
    pub key: BucketKey,
    pub request_count: u64,
    pub tokens_total: u64,
    pub error_count: u64,
    pub cost_total: Decimal,
    /// Time of the last completed recompute
    pub updated_at: DateTime<Utc>,
    /// Set once the watermark has settled this window
    pub finalized_at: Option<DateTime<Utc>>,
    /// A late batch touched this window and a recompute is outstanding
    pub late_pending: bool,
    /// Write counter for conditional upserts
    pub revision: u64,
}

impl RollupBucket {
    /// Build a fresh row from an aggregate
    pub fn from_aggregate(key: BucketKey, aggregate: BucketAggregate, updated_at: DateTime<Utc>) -> Self {
        Self {
            key,
            request_count: aggregate.request_count,
            tokens_total: aggregate.tokens_total,
            error_count: aggregate.error_count,
            cost_total: aggregate.cost_total,
            updated_at,
            finalized_at: None,
            late_pending: false,
            revision: 1,
        }
    }

    /// Aggregate values of this row
    pub fn aggregate(&self) -> BucketAggregate {
        BucketAggregate {
            request_count: self.request_count,
            tokens_total: self.tokens_total,
            error_count: self.error_count,
            cost_total: self.cost_total,
        }
    }

    #[inline]
    pub fn is_finalized(&self) -> bool {
        self.finalized_at.is_some()
    }

    /// Whether an export must recompute this row before reading it
    pub fn needs_refresh(&self) -> bool {
        !self.is_finalized() || self.late_pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn at(d: u32, h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, d, h, m, 0).unwrap()
    }

    #[test]
    fn test_truncate_hourly_and_daily() {
        let ts = at(1, 10, 45) + Duration::milliseconds(250);
        assert_eq!(Granularity::Hourly.truncate(ts), at(1, 10, 0));
        assert_eq!(Granularity::Daily.truncate(ts), at(1, 0, 0));
        assert_eq!(Granularity::Hourly.truncate(at(1, 10, 0)), at(1, 10, 0));
    }

    #[test]
    fn test_ceil() {
        assert_eq!(Granularity::Hourly.ceil(at(1, 10, 0)), at(1, 10, 0));
        assert_eq!(Granularity::Hourly.ceil(at(1, 10, 1)), at(1, 11, 0));
    }

    #[test]
    fn test_starts_spanning_includes_both_ends() {
        let starts = Granularity::Hourly.starts_spanning(at(1, 9, 30), at(1, 11, 10));
        assert_eq!(starts, vec![at(1, 9, 0), at(1, 10, 0), at(1, 11, 0)]);
    }

    #[test]
    fn test_range_bucket_starts() {
        let range = TimeRange::new(at(1, 9, 30), at(1, 12, 0)).unwrap();
        assert_eq!(
            range.bucket_starts(Granularity::Hourly),
            vec![at(1, 9, 0), at(1, 10, 0), at(1, 11, 0)]
        );
        assert_eq!(range.bucket_starts(Granularity::Daily), vec![at(1, 0, 0)]);
        assert!(TimeRange::new(at(1, 12, 0), at(1, 12, 0)).is_err());
    }

    #[test]
    fn test_bucket_key_window() {
        let key = BucketKey::new(Granularity::Hourly, at(1, 10, 15), "org-a", "model-m");
        assert_eq!(key.bucket_start, at(1, 10, 0));
        assert_eq!(key.bucket_end(), at(1, 11, 0));
        assert!(key.window().contains(at(1, 10, 59)));
        assert!(!key.window().contains(at(1, 11, 0)));
    }

    #[test]
    fn test_aggregate_counts_errors_and_cost() {
        use crate::types::event::EventStatus;

        let events = vec![
            UsageEvent::new("e1", "a", "m", at(1, 10, 15), "b")
                .with_tokens(100)
                .with_cost(dec!(0.02)),
            UsageEvent::new("e2", "a", "m", at(1, 10, 45), "b")
                .with_tokens(50)
                .with_cost(dec!(0.01))
                .with_status(EventStatus::Error),
        ];

        let aggregate = BucketAggregate::from_events(&events).unwrap();
        assert_eq!(aggregate.request_count, 2);
        assert_eq!(aggregate.tokens_total, 150);
        assert_eq!(aggregate.error_count, 1);
        assert_eq!(aggregate.cost_total, dec!(0.03));
    }

    #[test]
    fn test_aggregate_overflow_is_an_error() {
        let mut aggregate = BucketAggregate {
            tokens_total: u64::MAX,
            ..Default::default()
        };
        let event = UsageEvent::new("e1", "a", "m", at(1, 10, 15), "b").with_tokens(1);
        assert!(matches!(aggregate.add_event(&event), Err(TallyError::Internal(_))));

        let mut aggregate = BucketAggregate {
            cost_total: Decimal::MAX,
            ..Default::default()
        };
        let event = UsageEvent::new("e2", "a", "m", at(1, 10, 15), "b").with_cost(Decimal::MAX);
        assert!(aggregate.add_event(&event).is_err());
    }

    #[test]
    fn test_granularity_parse() {
        assert_eq!("Hourly".parse::<Granularity>().unwrap(), Granularity::Hourly);
        assert_eq!("daily".parse::<Granularity>().unwrap(), Granularity::Daily);
        assert!("weekly".parse::<Granularity>().is_err());
    }
}
