//! Tracking around the outbound send pipeline.

use crate::cache::DataMessageCache;
use crate::error::TrackerResult;
use crate::partitions_states::PartitionsStates;
use crate::pipeline::{publish_and_wait, OutboundPipeline, Publisher};
use crate::types::{EventLogRecord, MessageRecord};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;
use tracker_config::DeliveryTrackerConfig;

/// Wraps the outbound pipeline so every batch is tracked, cached and published
/// before the next one is taken.
pub struct DeliveryTrackerProcessor {
    states: Arc<PartitionsStates>,
    cache: Arc<DataMessageCache>,
    pipeline: Arc<dyn OutboundPipeline>,
    publisher: Arc<dyn Publisher>,
    config: watch::Receiver<DeliveryTrackerConfig>,
}

impl DeliveryTrackerProcessor {
    pub fn new(
        states: Arc<PartitionsStates>,
        cache: Arc<DataMessageCache>,
        pipeline: Arc<dyn OutboundPipeline>,
        publisher: Arc<dyn Publisher>,
        config: watch::Receiver<DeliveryTrackerConfig>,
    ) -> Self {
        Self {
            states,
            cache,
            pipeline,
            publisher,
            config,
        }
    }

    /// Track and cache the batch, run it through the pipeline, advance the read
    /// cursor and wait for every publication.
    ///
    /// The read cursor stops at the oldest body still held only in memory.
    pub async fn process_batch(&self, records: &[EventLogRecord]) -> TrackerResult<()> {
        let trackable: Vec<MessageRecord> = records
            .iter()
            .filter_map(EventLogRecord::to_message_record)
            .collect();
        let tracked = self.states.read(&trackable);
        self.cache.put(&trackable);

        let outgoing = self.pipeline.process(records);
        self.states
            .sent_retaining(records, &self.cache.lowest_cached_offsets());

        debug!(
            records = records.len(),
            newly_tracked = tracked.len(),
            outgoing = outgoing.len(),
            "processed outbound batch"
        );
        let timeout = self.config.borrow().outbound_batch_processing_timeout_seconds;
        publish_and_wait(self.publisher.as_ref(), outgoing, timeout).await
    }
}
