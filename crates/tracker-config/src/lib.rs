//! Configuration types and logging setup for the delivery tracker.

mod config;
mod error;
mod logging;

pub use config::{
    DeliveryTrackerConfig, TrackerSettings, DEFAULT_LOG_LEVEL, DEFAULT_MAX_CACHE_OFFSET_AGE,
    DEFAULT_MAX_CACHE_SIZE_MEGABYTES, DEFAULT_MAX_PERSISTENCE_RETRIES,
    DEFAULT_OUTBOUND_BATCH_TIMEOUT_SECONDS, DEFAULT_STATE_PERSISTENCE_PERIOD_SECONDS,
};
pub use error::{ConfigError, ConfigResult};
pub use logging::{init_logging, parse_level};
