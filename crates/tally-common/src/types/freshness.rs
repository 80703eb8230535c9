//! Freshness status
//!
//! Fully derived from the event store; holds no independent source of truth.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{Result, TallyError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FreshnessState {
    Fresh,
    Degraded,
    Stale,
}

impl fmt::Display for FreshnessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FreshnessState::Fresh => write!(f, "fresh"),
            FreshnessState::Degraded => write!(f, "degraded"),
            FreshnessState::Stale => write!(f, "stale"),
        }
    }
}

/// Lag classification thresholds
///
/// `fresh` if lag < `degraded_after`, `degraded` if lag < `stale_after`,
/// otherwise `stale`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreshnessThresholds {
    pub degraded_after: Duration,
    pub stale_after: Duration,
}

impl FreshnessThresholds {
    pub fn new(degraded_after: Duration, stale_after: Duration) -> Result<Self> {
        let thresholds = Self {
            degraded_after,
            stale_after,
        };
        thresholds.validate()?;
        Ok(thresholds)
    }

    pub fn validate(&self) -> Result<()> {
        if self.degraded_after <= Duration::zero() {
            return Err(TallyError::Config(
                "freshness degraded threshold must be positive".into(),
            ));
        }
        if self.stale_after <= self.degraded_after {
            return Err(TallyError::Config(format!(
                "freshness stale threshold ({}s) must exceed degraded threshold ({}s)",
                self.stale_after.num_seconds(),
                self.degraded_after.num_seconds()
            )));
        }
        Ok(())
    }

    pub fn classify(&self, lag: Duration) -> FreshnessState {
        if lag < self.degraded_after {
            FreshnessState::Fresh
        } else if lag < self.stale_after {
            FreshnessState::Degraded
        } else {
            FreshnessState::Stale
        }
    }
}

impl Default for FreshnessThresholds {
    fn default() -> Self {
        Self {
            degraded_after: Duration::minutes(5),
            stale_after: Duration::minutes(10),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FreshnessStatus {
    /// `None` for the global status
    pub organization_id: Option<String>,
    pub status: FreshnessState,
    /// Latest event time, or first-seen time when no events remain
    pub last_event_at: DateTime<Utc>,
    pub lag_seconds: i64,
    pub checked_at: DateTime<Utc>,
}

impl FreshnessStatus {
    pub fn derive(
        organization_id: Option<String>,
        last_event_at: DateTime<Utc>,
        checked_at: DateTime<Utc>,
        thresholds: &FreshnessThresholds,
    ) -> Self {
        // Events stamped in the future count as zero lag
        let lag = (checked_at - last_event_at).max(Duration::zero());
        Self {
            organization_id,
            status: thresholds.classify(lag),
            last_event_at,
            lag_seconds: lag.num_seconds(),
            checked_at,
        }
    }
}
