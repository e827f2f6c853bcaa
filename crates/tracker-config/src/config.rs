//! Configuration management for the delivery tracker.

use crate::{ConfigError, ConfigResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default log level.
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Default upper bound on in-memory cached message bodies.
pub const DEFAULT_MAX_CACHE_SIZE_MEGABYTES: u64 = 100;

/// Default distance, in source offsets, a cached body may lag before it is spilled.
pub const DEFAULT_MAX_CACHE_OFFSET_AGE: i64 = 50_000;

/// Default period of the partition state persister.
pub const DEFAULT_STATE_PERSISTENCE_PERIOD_SECONDS: u64 = 1;

/// Default time a batch may wait for its publications to be acknowledged.
pub const DEFAULT_OUTBOUND_BATCH_TIMEOUT_SECONDS: u64 = 30;

/// Default number of consecutive failed persistence cycles tolerated.
pub const DEFAULT_MAX_PERSISTENCE_RETRIES: u32 = 3;

/// Tunables of the delivery tracker.
///
/// A snapshot is immutable; changes replace the whole value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeliveryTrackerConfig {
    /// Upper bound on the in-memory footprint of cached message bodies.
    pub max_cache_size_megabytes: u64,
    /// How far (in offsets) a cached body may fall behind the newest offset of
    /// its partition before it is written durably and evicted from memory.
    pub max_cache_offset_age: i64,
    /// Period of the partition state persister.
    pub state_persistence_period_seconds: u64,
    /// How long a send batch may wait for its publications.
    pub outbound_batch_processing_timeout_seconds: u64,
    /// Consecutive failed persistence cycles tolerated before escalation.
    pub max_number_of_persistence_retries: u32,
}

impl Default for DeliveryTrackerConfig {
    fn default() -> Self {
        Self {
            max_cache_size_megabytes: DEFAULT_MAX_CACHE_SIZE_MEGABYTES,
            max_cache_offset_age: DEFAULT_MAX_CACHE_OFFSET_AGE,
            state_persistence_period_seconds: DEFAULT_STATE_PERSISTENCE_PERIOD_SECONDS,
            outbound_batch_processing_timeout_seconds: DEFAULT_OUTBOUND_BATCH_TIMEOUT_SECONDS,
            max_number_of_persistence_retries: DEFAULT_MAX_PERSISTENCE_RETRIES,
        }
    }
}

impl DeliveryTrackerConfig {
    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.max_cache_offset_age <= 0 {
            return Err(ConfigError::Invalid(format!(
                "maxCacheOffsetAge must be positive, got {}",
                self.max_cache_offset_age
            )));
        }
        if self.state_persistence_period_seconds == 0 {
            return Err(ConfigError::Invalid(
                "statePersistencePeriodSeconds must be at least 1".to_string(),
            ));
        }
        if self.outbound_batch_processing_timeout_seconds == 0 {
            return Err(ConfigError::Invalid(
                "outboundBatchProcessingTimeoutSeconds must be at least 1".to_string(),
            ));
        }
        if self.max_number_of_persistence_retries == 0 {
            return Err(ConfigError::Invalid(
                "maxNumberOfPersistenceRetries must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Cache size bound in bytes.
    pub fn max_cache_size_bytes(&self) -> usize {
        (self.max_cache_size_megabytes as usize).saturating_mul(1024 * 1024)
    }
}

/// Process-level settings: logging, where state lives, and the tracker tunables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackerSettings {
    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// SQLite file backing the state store, if any.
    #[serde(default)]
    pub state_db_path: Option<PathBuf>,
    /// Delivery tracker tunables.
    #[serde(default)]
    pub delivery_tracker: DeliveryTrackerConfig,
}

fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

impl Default for TrackerSettings {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            state_db_path: None,
            delivery_tracker: DeliveryTrackerConfig::default(),
        }
    }
}

impl TrackerSettings {
    /// Load settings from `path` when it exists, otherwise use defaults.
    /// Environment variables are applied on top and the result is validated.
    pub fn load(path: &Path) -> ConfigResult<Self> {
        let mut settings = if path.exists() {
            Self::load_from_file(path)?
        } else {
            Self::default()
        };
        settings.load_from_env();
        settings.delivery_tracker.validate()?;
        Ok(settings)
    }

    /// Load settings from a specific file.
    pub fn load_from_file(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let settings: TrackerSettings = serde_json::from_str(&content)?;
        Ok(settings)
    }

    /// Save settings to a file as pretty JSON.
    pub fn save(&self, path: &Path) -> ConfigResult<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    fn load_from_env(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    /// Apply `TRACKER_*` overrides resolved through `lookup`.
    ///
    /// Values that fail to parse are ignored.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(level) = lookup("TRACKER_LOG_LEVEL") {
            self.log_level = level;
        }
        if let Some(megabytes) =
            lookup("TRACKER_MAX_CACHE_SIZE_MEGABYTES").and_then(|v| v.parse().ok())
        {
            self.delivery_tracker.max_cache_size_megabytes = megabytes;
        }
        if let Some(age) = lookup("TRACKER_MAX_CACHE_OFFSET_AGE").and_then(|v| v.parse().ok()) {
            self.delivery_tracker.max_cache_offset_age = age;
        }
        if let Some(period) =
            lookup("TRACKER_STATE_PERSISTENCE_PERIOD_SECONDS").and_then(|v| v.parse().ok())
        {
            self.delivery_tracker.state_persistence_period_seconds = period;
        }
        if let Some(timeout) =
            lookup("TRACKER_OUTBOUND_BATCH_TIMEOUT_SECONDS").and_then(|v| v.parse().ok())
        {
            self.delivery_tracker.outbound_batch_processing_timeout_seconds = timeout;
        }
        if let Some(retries) =
            lookup("TRACKER_MAX_PERSISTENCE_RETRIES").and_then(|v| v.parse().ok())
        {
            self.delivery_tracker.max_number_of_persistence_retries = retries;
        }
    }
}
