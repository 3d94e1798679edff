//! Reporting configuration record.
//!
//! Read once at startup from a JSON file (or defaults) and shared
//! read-only afterwards.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{ReportingError, Result};

/// Directory holding the per-plugin archive directories.
pub const DEFAULT_ARCHIVE_ROOT: &str = "/var/db/collectd/rrd/localhost";

/// Socket of the caching daemon the archive tool flushes through.
pub const DEFAULT_RRDCACHED_SOCKET: &str = "unix:/var/run/rrdcached.sock";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "api", derive(utoipa::ToSchema))]
#[serde(default)]
pub struct ReportingConfig {
    /// RAM disk size in bytes, used when archives are not kept on the dataset.
    pub ramdisk_size: u64,
    /// Archive timespans in seconds (collectd `RRATimespan`).
    pub graph_timespans: Vec<u64>,
    /// Rows per archive (collectd `RRARows`).
    pub graph_rows: u32,
    /// Keep archives on the system dataset instead of the RAM disk.
    pub use_dataset: bool,
    /// CPU archives hold percentages instead of jiffies.
    pub cpu_in_percentage: bool,
    /// Native sampling interval of every archive, in seconds.
    pub step: u64,
    #[cfg_attr(feature = "api", schema(value_type = String))]
    pub archive_root: PathBuf,
    /// Archive tool binary.
    #[cfg_attr(feature = "api", schema(value_type = String))]
    pub rrdtool: PathBuf,
    pub rrdcached_socket: Option<String>,
    /// Upper bound on concurrent archive tool invocations from live subscriptions.
    pub max_concurrent_queries: usize,
}

impl Default for ReportingConfig {
    fn default() -> Self {
        Self {
            ramdisk_size: 1024 * 1024 * 1024,
            graph_timespans: vec![3600, 86400, 604800, 2678400, 31622400],
            graph_rows: 1200,
            use_dataset: true,
            cpu_in_percentage: false,
            step: 10,
            archive_root: PathBuf::from(DEFAULT_ARCHIVE_ROOT),
            rrdtool: PathBuf::from("rrdtool"),
            rrdcached_socket: Some(DEFAULT_RRDCACHED_SOCKET.to_string()),
            max_concurrent_queries: 4,
        }
    }
}

impl ReportingConfig {
    /// Loads and validates a config record from a JSON file.
    ///
    /// Missing keys take their default values.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: ReportingConfig = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.ramdisk_size < 1 {
            return Err(ReportingError::Validation(
                "ramdisk_size must be at least 1".into(),
            ));
        }
        if self.graph_timespans.is_empty() {
            return Err(ReportingError::Validation(
                "graph_timespans must not be empty".into(),
            ));
        }
        if self.graph_timespans.contains(&0) {
            return Err(ReportingError::Validation(
                "graph_timespans entries must be at least 1".into(),
            ));
        }
        let mut spans = self.graph_timespans.clone();
        spans.sort_unstable();
        spans.dedup();
        if spans.len() != self.graph_timespans.len() {
            return Err(ReportingError::Validation(
                "graph_timespans entries must be unique".into(),
            ));
        }
        if self.graph_rows < 1 {
            return Err(ReportingError::Validation(
                "graph_rows must be at least 1".into(),
            ));
        }
        if self.step < 1 {
            return Err(ReportingError::Validation("step must be at least 1".into()));
        }
        if self.max_concurrent_queries < 1 {
            return Err(ReportingError::Validation(
                "max_concurrent_queries must be at least 1".into(),
            ));
        }
        Ok(())
    }

    pub fn archive_root(&self) -> &Path {
        &self.archive_root
    }

    /// Step as a signed timestamp delta.
    pub fn step_secs(&self) -> i64 {
        self.step as i64
    }
}
