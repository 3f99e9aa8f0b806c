//! Queue configuration.
//!
//! Options are read once when the registry opens. Every field has a default,
//! so a config file only needs the values it changes.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::QueueOptions;

const QUEUE_STORE_DIR: &str = "queue";
const DEDUP_STORE_DIR: &str = "checksame";
const METADATA_FILE: &str = "topics.json";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(&'static str),
}

/// Configuration for a queue registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Root directory for the stores and the topics file.
    /// Default: ./data
    pub data_dir: PathBuf,

    /// Time a popped entry stays invisible before redelivery.
    /// Default: 60 s
    pub visibility_timeout_ms: u64,

    /// Interval between sampling passes of the expiry scanner.
    /// Default: 100 ms
    pub scan_interval_ms: u64,

    /// Interval between topic list refreshes and pool resizes.
    /// Default: 5 s
    pub scan_refresh_interval_ms: u64,

    /// Topics sampled per pass.
    /// Default: 20
    pub scan_selection_count: usize,

    /// Fraction of dirty topics in a pass above which the scanner samples
    /// again immediately instead of waiting for the next tick.
    /// Default: 0.25
    pub scan_dirty_percent: f64,

    /// Scan worker pool bounds.
    /// Default: 1..=4
    pub scan_pool_min: usize,
    pub scan_pool_max: usize,

    /// Flush the store before a push/pop/ack returns.
    /// Default: true
    pub sync_writes: bool,

    /// Suppress pushes whose payload matches an entry still ready or in flight.
    /// Default: false
    pub dedup: bool,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            visibility_timeout_ms: 60_000,
            scan_interval_ms: 100,
            scan_refresh_interval_ms: 5_000,
            scan_selection_count: 20,
            scan_dirty_percent: 0.25,
            scan_pool_min: 1,
            scan_pool_max: 4,
            sync_writes: true,
            dedup: false,
        }
    }
}

impl QueueConfig {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }

    /// Loads a JSON config file. Missing fields take their defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let data = std::fs::read(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_slice(&data).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.visibility_timeout_ms == 0 {
            return Err(ConfigError::Invalid("visibility_timeout_ms must be > 0"));
        }
        if self.scan_interval_ms == 0 || self.scan_refresh_interval_ms == 0 {
            return Err(ConfigError::Invalid("scan intervals must be > 0"));
        }
        if self.scan_selection_count == 0 {
            return Err(ConfigError::Invalid("scan_selection_count must be > 0"));
        }
        if !(0.0..=1.0).contains(&self.scan_dirty_percent) {
            return Err(ConfigError::Invalid("scan_dirty_percent must be within [0, 1]"));
        }
        if self.scan_pool_max == 0 || self.scan_pool_min > self.scan_pool_max {
            return Err(ConfigError::Invalid("scan pool bounds must satisfy 0 < min <= max"));
        }
        Ok(())
    }

    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_millis(self.visibility_timeout_ms)
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::from_millis(self.scan_interval_ms)
    }

    pub fn scan_refresh_interval(&self) -> Duration {
        Duration::from_millis(self.scan_refresh_interval_ms)
    }

    pub fn queue_store_path(&self) -> PathBuf {
        self.data_dir.join(QUEUE_STORE_DIR)
    }

    pub fn dedup_store_path(&self) -> PathBuf {
        self.data_dir.join(DEDUP_STORE_DIR)
    }

    pub fn metadata_path(&self) -> PathBuf {
        self.data_dir.join(METADATA_FILE)
    }

    pub fn queue_options(&self) -> QueueOptions {
        QueueOptions {
            visibility_timeout: self.visibility_timeout(),
            sync_writes: self.sync_writes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_config_default() {
        let config = QueueConfig::default();
        assert_eq!(config.visibility_timeout(), Duration::from_secs(60));
        assert_eq!(config.scan_interval(), Duration::from_millis(100));
        assert_eq!(config.scan_refresh_interval(), Duration::from_secs(5));
        assert_eq!(config.scan_selection_count, 20);
        assert_eq!(config.scan_pool_min, 1);
        assert_eq!(config.scan_pool_max, 4);
        assert!(config.sync_writes);
        assert!(!config.dedup);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_file_takes_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ackq.json");
        std::fs::write(&path, r#"{"data_dir": "/var/lib/ackq", "scan_pool_max": 8}"#).unwrap();

        let config = QueueConfig::load(&path).unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/var/lib/ackq"));
        assert_eq!(config.scan_pool_max, 8);
        assert_eq!(config.visibility_timeout_ms, 60_000);
        assert_eq!(config.metadata_path(), PathBuf::from("/var/lib/ackq/topics.json"));
    }

    #[test]
    fn test_invalid_values_rejected() {
        let mut config = QueueConfig::default();
        config.scan_pool_min = 5;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = QueueConfig::default();
        config.scan_dirty_percent = 1.5;
        assert!(config.validate().is_err());

        let mut config = QueueConfig::default();
        config.scan_interval_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_errors_carry_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.json");
        let err = QueueConfig::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
        assert!(err.to_string().contains("missing.json"));

        std::fs::write(&path, b"[1, 2").unwrap();
        assert!(matches!(
            QueueConfig::load(&path),
            Err(ConfigError::Parse { .. })
        ));
    }
}
