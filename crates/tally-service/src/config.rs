//! Service configuration
//!
//! Layered with the `config` crate: built-in defaults, then an optional
//! file named by `TALLY_CONFIG`, then `TALLY__`-prefixed environment
//! variables using `__` as the section separator
//! (e.g. `TALLY__EXPORT__MAX_ATTEMPTS=5`).

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use tally_common::{
    FreshnessThresholds, Granularity, Result, TallyError, DEFAULT_BATCH_INACTIVITY_SECS,
    DEFAULT_EXPORT_MAX_ATTEMPTS, DEFAULT_RAW_RETENTION_SECS, DEFAULT_SETTLE_DELAY_SECS,
};
use tally_export::{ExportConfig, RunnerConfig, DEFAULT_MAX_RAW_ROWS};
use tally_pipeline::{AggregatorConfig, BatchTrackerConfig, RetentionConfig};
use tally_storage::DEFAULT_SCAN_PAGE_SIZE;

/// Environment variable naming an optional config file
pub const CONFIG_PATH_ENV: &str = "TALLY_CONFIG";

/// Tally service configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TallyConfig {
    pub server: ServerSettings,
    pub batches: BatchSettings,
    pub rollup: RollupSettings,
    pub freshness: FreshnessSettings,
    pub retention: RetentionSettings,
    pub export: ExportSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8090,
        }
    }
}

/// Batch lifecycle settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchSettings {
    /// Idle time after which an open batch is closed
    pub inactivity_timeout_secs: u64,
    pub sweep_interval_secs: u64,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            inactivity_timeout_secs: DEFAULT_BATCH_INACTIVITY_SECS,
            sweep_interval_secs: 30,
        }
    }
}

/// Rollup aggregation settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RollupSettings {
    pub granularities: Vec<Granularity>,
    /// Delay after a window ends before the watermark may pass it
    pub settle_delay_secs: u64,
    pub watermark_interval_secs: u64,
    pub max_conflict_retries: u32,
    pub conflict_backoff_ms: u64,
    pub query_page_size: usize,
}

impl Default for RollupSettings {
    fn default() -> Self {
        Self {
            granularities: Granularity::ALL.to_vec(),
            settle_delay_secs: DEFAULT_SETTLE_DELAY_SECS,
            watermark_interval_secs: 30,
            max_conflict_retries: 5,
            conflict_backoff_ms: 10,
            query_page_size: DEFAULT_SCAN_PAGE_SIZE,
        }
    }
}

/// Freshness SLA thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FreshnessSettings {
    /// Lag at which an organization turns `degraded`
    pub degraded_after_secs: u64,
    /// Lag at which an organization turns `stale`
    pub stale_after_secs: u64,
    pub evaluate_interval_secs: u64,
}

impl Default for FreshnessSettings {
    fn default() -> Self {
        Self {
            degraded_after_secs: 5 * 60,
            stale_after_secs: 10 * 60,
            evaluate_interval_secs: 15,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionSettings {
    pub raw_retention_secs: u64,
    pub sweep_interval_secs: u64,
}

impl Default for RetentionSettings {
    fn default() -> Self {
        Self {
            raw_retention_secs: DEFAULT_RAW_RETENTION_SECS,
            sweep_interval_secs: 3600,
        }
    }
}

/// Export job settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportSettings {
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub run_timeout_secs: u64,
    pub workers: usize,
    pub poll_interval_ms: u64,
    pub max_raw_rows: usize,
    /// Root directory for delivered artifacts
    pub output_dir: PathBuf,
}

impl Default for ExportSettings {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_EXPORT_MAX_ATTEMPTS,
            backoff_base_ms: 30_000,
            backoff_max_ms: 15 * 60 * 1000,
            run_timeout_secs: 10 * 60,
            workers: 2,
            poll_interval_ms: 500,
            max_raw_rows: DEFAULT_MAX_RAW_ROWS,
            output_dir: PathBuf::from("exports"),
        }
    }
}

fn config_error(err: config::ConfigError) -> TallyError {
    TallyError::Config(err.to_string())
}

fn chrono_secs(name: &str, secs: u64) -> Result<chrono::Duration> {
    chrono::Duration::from_std(Duration::from_secs(secs))
        .map_err(|_| TallyError::Config(format!("{name} is out of range: {secs}s")))
}

fn positive(name: &str, value: u64) -> Result<()> {
    if value == 0 {
        return Err(TallyError::Config(format!("{name} must be positive")));
    }
    Ok(())
}

impl TallyConfig {
    /// Load from `.env`, the optional `TALLY_CONFIG` file, and the environment
    pub fn load() -> Result<Self> {
        let _ = dotenvy::dotenv();
        let path = std::env::var(CONFIG_PATH_ENV).ok().map(PathBuf::from);
        Self::load_from(path.as_deref())
    }

    /// Load with an explicit config file; fails fast on invalid values
    pub fn load_from(file: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder().add_source(Config::try_from(&Self::default()).map_err(config_error)?);
        if let Some(path) = file {
            builder = builder.add_source(File::from(path).required(true));
        }
        let config: Self = builder
            .add_source(
                Environment::with_prefix("TALLY")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("rollup.granularities"),
            )
            .build()
            .map_err(config_error)?
            .try_deserialize()
            .map_err(config_error)?;

        config.validate()?;
        Ok(config)
    }

    /// Check every section
    pub fn validate(&self) -> Result<()> {
        if self.server.host.is_empty() {
            return Err(TallyError::Config("server host is required".into()));
        }
        positive("batches.sweep_interval_secs", self.batches.sweep_interval_secs)?;
        positive("rollup.watermark_interval_secs", self.rollup.watermark_interval_secs)?;
        positive("freshness.evaluate_interval_secs", self.freshness.evaluate_interval_secs)?;
        positive("retention.sweep_interval_secs", self.retention.sweep_interval_secs)?;
        positive("export.poll_interval_ms", self.export.poll_interval_ms)?;
        if self.export.workers == 0 {
            return Err(TallyError::Config("export.workers must be at least 1".into()));
        }

        self.batch_tracker()?.validate()?;
        self.aggregator()?.validate()?;
        self.freshness_thresholds()?.validate()?;
        self.retention()?.validate()?;
        self.export()?.validate()
    }

    pub fn batch_tracker(&self) -> Result<BatchTrackerConfig> {
        Ok(BatchTrackerConfig {
            inactivity_timeout: chrono_secs(
                "batches.inactivity_timeout_secs",
                self.batches.inactivity_timeout_secs,
            )?,
            granularities: self.rollup.granularities.clone(),
        })
    }

    pub fn aggregator(&self) -> Result<AggregatorConfig> {
        Ok(AggregatorConfig {
            granularities: self.rollup.granularities.clone(),
            settle_delay: chrono_secs("rollup.settle_delay_secs", self.rollup.settle_delay_secs)?,
            max_conflict_retries: self.rollup.max_conflict_retries,
            conflict_backoff: Duration::from_millis(self.rollup.conflict_backoff_ms),
            page_size: self.rollup.query_page_size,
        })
    }

    /// Thresholds are checked here; an inverted pair never reaches the monitor
    pub fn freshness_thresholds(&self) -> Result<FreshnessThresholds> {
        FreshnessThresholds::new(
            chrono_secs("freshness.degraded_after_secs", self.freshness.degraded_after_secs)?,
            chrono_secs("freshness.stale_after_secs", self.freshness.stale_after_secs)?,
        )
    }

    pub fn retention(&self) -> Result<RetentionConfig> {
        Ok(RetentionConfig {
            raw_retention: chrono_secs("retention.raw_retention_secs", self.retention.raw_retention_secs)?,
            granularities: self.rollup.granularities.clone(),
        })
    }

    pub fn export(&self) -> Result<ExportConfig> {
        Ok(ExportConfig {
            max_attempts: self.export.max_attempts,
            backoff_base: Duration::from_millis(self.export.backoff_base_ms),
            backoff_max: Duration::from_millis(self.export.backoff_max_ms),
            run_timeout: Duration::from_secs(self.export.run_timeout_secs),
            max_raw_rows: self.export.max_raw_rows,
            page_size: self.rollup.query_page_size,
        })
    }

    pub fn runner(&self) -> RunnerConfig {
        RunnerConfig {
            workers: self.export.workers,
            poll_interval: Duration::from_millis(self.export.poll_interval_ms),
        }
    }
}
