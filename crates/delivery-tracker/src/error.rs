//! Tracker error types.

use crate::store::StoreError;
use thiserror::Error;

/// Delivery tracker error type.
#[derive(Error, Debug)]
pub enum TrackerError {
    /// Durable store error
    #[error("State store error: {0}")]
    Store(#[from] StoreError),

    /// A persisted partition snapshot could not be parsed
    #[error("Corrupt snapshot for partition {partition}: {source}")]
    CorruptSnapshot {
        partition: u32,
        #[source]
        source: serde_json::Error,
    },

    /// Durable writes were rejected because another writer holds newer versions
    #[error("Version conflict on keys: {}", .0.join(", "))]
    VersionConflict(Vec<String>),

    /// Persistence kept failing past the retry budget
    #[error("Persistence failed {attempts} consecutive times: {source}")]
    PersistenceExhausted {
        attempts: u32,
        #[source]
        source: Box<TrackerError>,
    },

    /// A publication was rejected
    #[error("Publish failed: {0}")]
    Publish(String),

    /// Publications were not acknowledged in time
    #[error("Timed out after {0} seconds waiting for publications")]
    PublishTimeout(u64),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias using TrackerError.
pub type TrackerResult<T> = Result<T, TrackerError>;
