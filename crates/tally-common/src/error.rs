//! Error types for Tally
//!
//! Provides a unified error type. Duplicate admissions and late data are
//! outcomes, not errors, and never appear here.

use thiserror::Error;
use uuid::Uuid;

use crate::types::bucket::BucketKey;
use crate::types::export::ExportStatus;

/// Result type alias using TallyError
pub type Result<T> = std::result::Result<T, TallyError>;

/// Unified error type for Tally operations
#[derive(Debug, Error)]
pub enum TallyError {
    // Input validation errors
    #[error("Validation error: {0}")]
    Validation(String),

    // Configuration errors (fail fast at startup)
    #[error("Configuration error: {0}")]
    Config(String),

    // Concurrent write contention on a rollup bucket
    #[error("Aggregation conflict on bucket {key}")]
    AggregationConflict { key: BucketKey },

    // Export errors
    #[error("Export failed (transient): {0}")]
    ExportTransient(String),

    #[error("Export failed: {0}")]
    ExportPermanent(String),

    #[error("An identical export is already in flight: {job_id}")]
    ExportInFlight { job_id: Uuid },

    #[error("Invalid export transition: {from} -> {to}")]
    InvalidTransition { from: ExportStatus, to: ExportStatus },

    // Lookup errors
    #[error("Not found: {0}")]
    NotFound(String),

    // Storage errors
    #[error("Storage error: {0}")]
    Storage(String),

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    // Timeout error
    #[error("Operation timed out: {0}")]
    Timeout(String),

    // Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl TallyError {
    /// Whether an export failing with this error may be retried.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TallyError::ExportTransient(_)
                | TallyError::AggregationConflict { .. }
                | TallyError::Storage(_)
                | TallyError::Timeout(_)
                | TallyError::Internal(_)
        )
    }
}

impl From<serde_json::Error> for TallyError {
    fn from(err: serde_json::Error) -> Self {
        TallyError::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for TallyError {
    fn from(err: std::io::Error) -> Self {
        TallyError::Storage(err.to_string())
    }
}

impl From<anyhow::Error> for TallyError {
    fn from(err: anyhow::Error) -> Self {
        TallyError::Internal(err.to_string())
    }
}
