//! Entry point for batches consumed from the outbound source log.

use crate::error::TrackerResult;
use crate::partitions_states::PartitionsStates;
use crate::processor::DeliveryTrackerProcessor;
use crate::types::EventLogRecord;
use std::sync::Arc;

/// Feeds trackable records to the processor and keeps the processed cursor in
/// step with everything consumed.
pub struct MessagesHandler {
    processor: Arc<DeliveryTrackerProcessor>,
    states: Arc<PartitionsStates>,
}

impl MessagesHandler {
    pub fn new(processor: Arc<DeliveryTrackerProcessor>, states: Arc<PartitionsStates>) -> Self {
        Self { processor, states }
    }

    /// Handle one consumed batch.
    ///
    /// Only authenticated messages are processed, but the processed cursor
    /// moves for every record, including tombstones and unauthenticated ones.
    pub async fn on_next(&self, records: &[EventLogRecord]) -> TrackerResult<()> {
        let trackable: Vec<EventLogRecord> = records
            .iter()
            .filter(|record| {
                record
                    .value
                    .as_ref()
                    .is_some_and(|value| value.as_authenticated().is_some())
            })
            .cloned()
            .collect();

        if !trackable.is_empty() {
            self.processor.process_batch(&trackable).await?;
        }
        self.states.handled(records);
        Ok(())
    }
}
