//! # Tally Export
//!
//! On-demand exports of rollups or raw events.
//!
//! - [`ExportJobManager`]: submit, run, cancel, and retry export jobs
//! - [`artifact`]: CSV rendering with a blake3 checksum
//! - [`ArtifactSink`]: delivery targets ([`FilesystemSink`], [`InMemorySink`])
//! - [`ExportRunner`]: worker pool polling for pending jobs

pub mod artifact;
pub mod manager;
pub mod runner;
pub mod sink;

pub use artifact::{Artifact, RAW_EVENT_CSV_HEADER, ROLLUP_CSV_HEADER};
pub use manager::{ExportConfig, ExportJobManager, DEFAULT_MAX_RAW_ROWS};
pub use runner::{ExportRunner, RunnerConfig};
pub use sink::{ArtifactSink, FilesystemSink, InMemorySink};
