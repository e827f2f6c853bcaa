//! Seams to the outbound business pipeline and the bus publisher.

use crate::error::{TrackerError, TrackerResult};
use crate::types::{AuthenticatedMessage, EventLogRecord, Record};
use futures_util::future::{join_all, BoxFuture};
use std::time::Duration;
use tracing::warn;

/// Completion of a single publication.
pub type PublishFuture = BoxFuture<'static, Result<(), String>>;

/// Turns source-log batches into wire-ready records.
pub trait OutboundPipeline: Send + Sync {
    /// Process a batch as it was read from the source log.
    fn process(&self, records: &[EventLogRecord]) -> Vec<Record>;

    /// Regenerate the wire records of a single message for replay.
    fn replay(&self, message: &AuthenticatedMessage, key: &str) -> Vec<Record>;
}

/// Publishes records to the bus.
pub trait Publisher: Send + Sync {
    /// Hand `records` to the bus. Each returned future resolves once the
    /// corresponding publication is acknowledged.
    fn publish(&self, records: Vec<Record>) -> Vec<PublishFuture>;
}

/// Publish `records` and wait for every publication, up to `timeout_seconds`.
pub(crate) async fn publish_and_wait(
    publisher: &dyn Publisher,
    records: Vec<Record>,
    timeout_seconds: u64,
) -> TrackerResult<()> {
    if records.is_empty() {
        return Ok(());
    }

    let count = records.len();
    let futures = publisher.publish(records);
    let results = tokio::time::timeout(Duration::from_secs(timeout_seconds), join_all(futures))
        .await
        .map_err(|_| {
            warn!(records = count, timeout_seconds, "publication timed out");
            TrackerError::PublishTimeout(timeout_seconds)
        })?;

    let failures: Vec<String> = results.into_iter().filter_map(Result::err).collect();
    if failures.is_empty() {
        Ok(())
    } else {
        Err(TrackerError::Publish(failures.join("; ")))
    }
}
