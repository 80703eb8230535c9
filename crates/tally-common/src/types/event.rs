//! Usage events
//!
//! A `UsageEvent` is an immutable fact produced by the ingestion boundary
//! for a single API call to a hosted model. `event_id` is the global
//! idempotency key.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{Result, TallyError};
use crate::{MAX_EVENT_COST_USD, MAX_EVENT_TOKENS};

/// Outcome of the call a usage event describes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventStatus {
    Success,
    Error,
}

impl fmt::Display for EventStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventStatus::Success => write!(f, "success"),
            EventStatus::Error => write!(f, "error"),
        }
    }
}

/// Usage event for one request against a hosted model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageEvent {
    /// Caller-assigned, globally unique idempotency key
    pub event_id: String,
    /// Organization that made the request
    pub organization_id: String,
    /// Model that served the request
    pub model_id: String,
    /// Event time (not ingestion time)
    pub occurred_at: DateTime<Utc>,
    /// Tokens consumed by the request
    pub tokens_consumed: u64,
    /// Cost in USD
    pub cost_usd: Decimal,
    /// Request outcome
    pub status: EventStatus,
    /// Ingestion batch that delivered the event
    pub batch_id: String,
}

impl UsageEvent {
    /// Create a successful, zero-cost event
    pub fn new(
        event_id: impl Into<String>,
        organization_id: impl Into<String>,
        model_id: impl Into<String>,
        occurred_at: DateTime<Utc>,
        batch_id: impl Into<String>,
    ) -> Self {
        Self {
            event_id: event_id.into(),
            organization_id: organization_id.into(),
            model_id: model_id.into(),
            occurred_at,
            tokens_consumed: 0,
            cost_usd: Decimal::ZERO,
            status: EventStatus::Success,
            batch_id: batch_id.into(),
        }
    }

    /// Set consumed tokens
    pub fn with_tokens(mut self, tokens_consumed: u64) -> Self {
        self.tokens_consumed = tokens_consumed;
        self
    }

    /// Set cost
    pub fn with_cost(mut self, cost_usd: Decimal) -> Self {
        self.cost_usd = cost_usd;
        self
    }

    /// Set outcome
    pub fn with_status(mut self, status: EventStatus) -> Self {
        self.status = status;
        self
    }

    /// Whether the request failed
    #[inline]
    pub fn is_error(&self) -> bool {
        self.status == EventStatus::Error
    }

    /// Series this event belongs to
    pub fn series(&self) -> SeriesKey {
        SeriesKey::new(self.organization_id.clone(), self.model_id.clone())
    }

    /// Position of this event in time order
    pub fn position(&self) -> EventPosition {
        EventPosition {
            occurred_at: self.occurred_at,
            event_id: self.event_id.clone(),
        }
    }

    /// Validate the event
    pub fn validate(&self) -> Result<()> {
        if self.event_id.is_empty() {
            return Err(TallyError::Validation("event_id is required".into()));
        }
        if self.organization_id.is_empty() {
            return Err(TallyError::Validation("organization_id is required".into()));
        }
        if self.model_id.is_empty() {
            return Err(TallyError::Validation("model_id is required".into()));
        }
        if self.batch_id.is_empty() {
            return Err(TallyError::Validation("batch_id is required".into()));
        }
        if self.cost_usd < Decimal::ZERO {
            return Err(TallyError::Validation("cost_usd cannot be negative".into()));
        }
        if self.cost_usd > Decimal::from(MAX_EVENT_COST_USD) {
            return Err(TallyError::Validation(format!(
                "cost_usd exceeds {MAX_EVENT_COST_USD}"
            )));
        }
        if self.tokens_consumed > MAX_EVENT_TOKENS {
            return Err(TallyError::Validation(format!(
                "tokens_consumed exceeds {MAX_EVENT_TOKENS}"
            )));
        }
        Ok(())
    }
}

/// (organization, model) pair that rollups are grouped by
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SeriesKey {
    pub organization_id: String,
    pub model_id: String,
}

impl SeriesKey {
    pub fn new(organization_id: impl Into<String>, model_id: impl Into<String>) -> Self {
        Self {
            organization_id: organization_id.into(),
            model_id: model_id.into(),
        }
    }
}

/// Time-ordered position of an event, used to resume a query
///
/// Ties on `occurred_at` are broken by `event_id`, so positions are total.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventPosition {
    pub occurred_at: DateTime<Utc>,
    pub event_id: String,
}

/// Result of admitting an event into the event store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdmitOutcome {
    /// First admission of this event_id
    Inserted,
    /// event_id already admitted; no effect
    Duplicate,
    /// Event precedes the retention horizon; its window is closed for good
    Expired,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, h, m, 0).unwrap()
    }

    #[test]
    fn test_usage_event_creation() {
        let event = UsageEvent::new("evt-1", "org-a", "model-m", at(10, 15), "batch-1")
            .with_tokens(100)
            .with_cost(dec!(0.02));

        assert_eq!(event.tokens_consumed, 100);
        assert_eq!(event.cost_usd, dec!(0.02));
        assert!(!event.is_error());
        assert!(event.validate().is_ok());
    }

    #[test]
    fn test_usage_event_validation() {
        let event = UsageEvent::new("", "org-a", "model-m", at(10, 15), "batch-1");
        assert!(event.validate().is_err());

        let event = UsageEvent::new("evt-1", "org-a", "model-m", at(10, 15), "batch-1")
            .with_cost(dec!(-1));
        assert!(event.validate().is_err());

        let event = UsageEvent::new("evt-1", "org-a", "model-m", at(10, 15), "batch-1")
            .with_tokens(u64::MAX);
        assert!(event.validate().is_err());

        let event = UsageEvent::new("evt-1", "org-a", "model-m", at(10, 15), "batch-1")
            .with_cost(Decimal::MAX);
        assert!(event.validate().is_err());
    }

    #[test]
    fn test_position_ordering_breaks_ties_by_id() {
        let a = UsageEvent::new("a", "o", "m", at(9, 0), "b").position();
        let b = UsageEvent::new("b", "o", "m", at(9, 0), "b").position();
        let c = UsageEvent::new("0", "o", "m", at(9, 1), "b").position();
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn test_status_serde() {
        let json = serde_json::to_string(&EventStatus::Error).unwrap();
        assert_eq!(json, "\"error\"");
    }
}
