//! Export artifacts
//!
//! Artifacts are rendered fully in memory as CSV, then checksummed with
//! blake3 before delivery.

use std::borrow::Cow;
use std::fmt::Write;

use tally_common::{Result, RollupBucket, TallyError, UsageEvent};

/// CSV header for rollup exports
pub const ROLLUP_CSV_HEADER: &str =
    "bucket_start,organization_id,model_id,request_count,tokens_total,error_count,cost_total";

/// CSV header for raw event exports
pub const RAW_EVENT_CSV_HEADER: &str =
    "event_id,occurred_at,organization_id,model_id,tokens_consumed,cost_usd,status,batch_id";

/// A rendered export, ready for delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub body: Vec<u8>,
    /// Data rows, excluding the header
    pub row_count: u64,
    /// Hex blake3 digest of `body`
    pub checksum: String,
    /// Rows beyond a cap were left out
    pub truncated: bool,
}

impl Artifact {
    fn seal(body: String, row_count: u64, truncated: bool) -> Self {
        let checksum = blake3::hash(body.as_bytes()).to_hex().to_string();
        Self {
            body: body.into_bytes(),
            row_count,
            checksum,
            truncated,
        }
    }
}

/// Quote a field if it contains a delimiter, quote, or line break
fn field(value: &str) -> Cow<'_, str> {
    if value.contains([',', '"', '\n', '\r']) {
        Cow::Owned(format!("\"{}\"", value.replace('"', "\"\"")))
    } else {
        Cow::Borrowed(value)
    }
}

fn write_error(err: std::fmt::Error) -> TallyError {
    TallyError::ExportPermanent(format!("render artifact: {err}"))
}

/// Render rollup rows in the order given
pub fn render_rollups(rows: &[RollupBucket]) -> Result<Artifact> {
    let mut body = String::with_capacity(64 * (rows.len() + 1));
    writeln!(body, "{ROLLUP_CSV_HEADER}").map_err(write_error)?;
    for row in rows {
        writeln!(
            body,
            "{},{},{},{},{},{},{}",
            row.key.bucket_start.to_rfc3339(),
            field(&row.key.organization_id),
            field(&row.key.model_id),
            row.request_count,
            row.tokens_total,
            row.error_count,
            row.cost_total
        )
        .map_err(write_error)?;
    }
    Ok(Artifact::seal(body, rows.len() as u64, false))
}

/// Render raw events in the order given
pub fn render_events(events: &[UsageEvent], truncated: bool) -> Result<Artifact> {
    let mut body = String::with_capacity(96 * (events.len() + 1));
    writeln!(body, "{RAW_EVENT_CSV_HEADER}").map_err(write_error)?;
    for event in events {
        writeln!(
            body,
            "{},{},{},{},{},{},{},{}",
            field(&event.event_id),
            event.occurred_at.to_rfc3339(),
            field(&event.organization_id),
            field(&event.model_id),
            event.tokens_consumed,
            event.cost_usd,
            event.status,
            field(&event.batch_id)
        )
        .map_err(write_error)?;
    }
    Ok(Artifact::seal(body, events.len() as u64, truncated))
}
