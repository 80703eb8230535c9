//! Prometheus metrics for the pipeline

use prometheus::{Encoder, GaugeVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

use tally_common::{AdmitOutcome, Result, TallyError};

fn metric_error(err: prometheus::Error) -> TallyError {
    TallyError::Internal(format!("metrics: {err}"))
}

/// Pipeline counters and gauges, owned by one registry
pub struct PipelineMetrics {
    registry: Registry,
    pub events_total: IntCounterVec,
    pub recomputes_total: IntCounter,
    pub aggregation_conflicts_total: IntCounter,
    pub batches_closed_total: IntCounter,
    pub late_batches_total: IntCounter,
    pub open_batches: IntGauge,
    pub watermark_seconds: GaugeVec,
    pub freshness_lag_seconds: GaugeVec,
    pub exports_total: IntCounterVec,
    pub purged_events_total: IntCounter,
}

impl PipelineMetrics {
    pub fn new() -> Result<Self> {
        let metrics = Self {
            registry: Registry::new(),
            events_total: IntCounterVec::new(
                Opts::new("tally_events_total", "Event admissions by outcome"),
                &["outcome"],
            )
            .map_err(metric_error)?,
            recomputes_total: IntCounter::new("tally_recomputes_total", "Completed bucket recomputes")
                .map_err(metric_error)?,
            aggregation_conflicts_total: IntCounter::new(
                "tally_aggregation_conflicts_total",
                "Conditional rollup writes rejected by a concurrent writer",
            )
            .map_err(metric_error)?,
            batches_closed_total: IntCounter::new("tally_batches_closed_total", "Ingestion batches closed")
                .map_err(metric_error)?,
            late_batches_total: IntCounter::new(
                "tally_late_batches_total",
                "Closed batches that touched already rolled-up windows",
            )
            .map_err(metric_error)?,
            open_batches: IntGauge::new("tally_open_batches", "Ingestion batches still streaming")
                .map_err(metric_error)?,
            watermark_seconds: GaugeVec::new(
                Opts::new("tally_watermark_seconds", "Settled watermark as a unix timestamp"),
                &["granularity"],
            )
            .map_err(metric_error)?,
            freshness_lag_seconds: GaugeVec::new(
                Opts::new("tally_freshness_lag_seconds", "Ingestion lag per organization"),
                &["organization"],
            )
            .map_err(metric_error)?,
            exports_total: IntCounterVec::new(
                Opts::new("tally_exports_total", "Export attempts by outcome"),
                &["outcome"],
            )
            .map_err(metric_error)?,
            purged_events_total: IntCounter::new("tally_purged_events_total", "Raw events purged by retention")
                .map_err(metric_error)?,
        };
        metrics.register()?;
        Ok(metrics)
    }

    fn register(&self) -> Result<()> {
        let r = &self.registry;
        r.register(Box::new(self.events_total.clone())).map_err(metric_error)?;
        r.register(Box::new(self.recomputes_total.clone())).map_err(metric_error)?;
        r.register(Box::new(self.aggregation_conflicts_total.clone()))
            .map_err(metric_error)?;
        r.register(Box::new(self.batches_closed_total.clone())).map_err(metric_error)?;
        r.register(Box::new(self.late_batches_total.clone())).map_err(metric_error)?;
        r.register(Box::new(self.open_batches.clone())).map_err(metric_error)?;
        r.register(Box::new(self.watermark_seconds.clone())).map_err(metric_error)?;
        r.register(Box::new(self.freshness_lag_seconds.clone())).map_err(metric_error)?;
        r.register(Box::new(self.exports_total.clone())).map_err(metric_error)?;
        r.register(Box::new(self.purged_events_total.clone())).map_err(metric_error)?;
        Ok(())
    }

    pub fn record_admission(&self, outcome: AdmitOutcome) {
        let label = match outcome {
            AdmitOutcome::Inserted => "inserted",
            AdmitOutcome::Duplicate => "duplicate",
            AdmitOutcome::Expired => "expired",
        };
        self.events_total.with_label_values(&[label]).inc();
    }

    pub fn record_export(&self, outcome: &str) {
        self.exports_total.with_label_values(&[outcome]).inc();
    }

    /// Text exposition of every registered metric
    pub fn render(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(metric_error)?;
        String::from_utf8(buffer).map_err(|e| TallyError::Internal(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_includes_counters() {
        let metrics = PipelineMetrics::new().unwrap();
        metrics.record_admission(AdmitOutcome::Inserted);
        metrics.record_admission(AdmitOutcome::Duplicate);
        metrics.record_export("completed");

        let text = metrics.render().unwrap();
        assert!(text.contains("tally_events_total{outcome=\"duplicate\"} 1"));
        assert!(text.contains("tally_exports_total{outcome=\"completed\"} 1"));
    }

    #[test]
    fn test_instances_do_not_share_registries() {
        let a = PipelineMetrics::new().unwrap();
        let b = PipelineMetrics::new().unwrap();
        a.recomputes_total.inc();
        assert_eq!(b.recomputes_total.get(), 0);
    }
}
