//! Chain configuration

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;
use crate::constants::{
    DEFAULT_LOCATOR_DENSE_SAMPLES, DEFAULT_MAX_DISCARDED_HASHES, DEFAULT_MAX_ORPHAN_RECORDS, DEFAULT_PETRIFY_ALARM_THRESHOLD,
    DEFAULT_PETRIFY_MARGIN, DEFAULT_PETRIFY_MIN_BATCH, DEFAULT_VIEW_THIN_THRESHOLD,
};

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("cannot parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Tunables for a `Blockchain`. Missing JSON fields take their defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChainConfig {
    /// Canonical blocks kept unsettled above the archive
    pub petrify_margin: u64,
    /// Smallest batch worth petrifying
    pub petrify_min_batch: u64,
    /// Orphan records held before the oldest groups are evicted
    pub max_orphan_records: usize,
    /// Discarded hashes remembered so their descendants are refused
    pub max_discarded_hashes: usize,
    /// Locator entries per step size
    pub locator_dense_samples: u32,
    /// View samples held before thinning
    pub view_thin_threshold: usize,
    /// Consecutive failed petrify attempts before raising an alarm
    pub petrify_alarm_threshold: u32,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            petrify_margin: DEFAULT_PETRIFY_MARGIN,
            petrify_min_batch: DEFAULT_PETRIFY_MIN_BATCH,
            max_orphan_records: DEFAULT_MAX_ORPHAN_RECORDS,
            max_discarded_hashes: DEFAULT_MAX_DISCARDED_HASHES,
            locator_dense_samples: DEFAULT_LOCATOR_DENSE_SAMPLES,
            view_thin_threshold: DEFAULT_VIEW_THIN_THRESHOLD,
            petrify_alarm_threshold: DEFAULT_PETRIFY_ALARM_THRESHOLD,
        }
    }
}

impl ChainConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.locator_dense_samples == 0 {
            return Err(ConfigError::Invalid(
                "locator_dense_samples must be at least 1".to_string(),
            ));
        }
        if self.petrify_alarm_threshold == 0 {
            return Err(ConfigError::Invalid(
                "petrify_alarm_threshold must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
