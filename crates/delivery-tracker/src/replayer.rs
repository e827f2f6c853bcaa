//! Replays cached messages on behalf of the replay scheduler.

use crate::cache::DataMessageCache;
use crate::error::TrackerResult;
use crate::pipeline::{publish_and_wait, OutboundPipeline, Publisher};
use crate::types::MessageId;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;
use tracker_config::DeliveryTrackerConfig;

/// Re-publishes a message whose acknowledgement is overdue.
pub struct MessageReplayer {
    cache: Arc<DataMessageCache>,
    pipeline: Arc<dyn OutboundPipeline>,
    publisher: Arc<dyn Publisher>,
    config: watch::Receiver<DeliveryTrackerConfig>,
}

impl MessageReplayer {
    pub fn new(
        cache: Arc<DataMessageCache>,
        pipeline: Arc<dyn OutboundPipeline>,
        publisher: Arc<dyn Publisher>,
        config: watch::Receiver<DeliveryTrackerConfig>,
    ) -> Self {
        Self {
            cache,
            pipeline,
            publisher,
            config,
        }
    }

    /// Replay `message_id` and wait until the bus has taken the publications.
    ///
    /// Returns false when the body is no longer cached; the replay is then
    /// skipped.
    pub async fn replay_message(&self, message_id: &MessageId) -> TrackerResult<bool> {
        let Some(record) = self.cache.get(message_id) else {
            debug!(message_id = %message_id, "nothing cached to replay");
            return Ok(false);
        };

        let records = self.pipeline.replay(&record.message, message_id.as_str());
        let timeout = self.config.borrow().outbound_batch_processing_timeout_seconds;
        debug!(message_id = %message_id, records = records.len(), "replaying message");
        publish_and_wait(self.publisher.as_ref(), records, timeout).await?;
        Ok(true)
    }
}
