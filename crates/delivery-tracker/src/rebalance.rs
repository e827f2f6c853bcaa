//! Bridge to the bus's partition assignment protocol.

use crate::error::TrackerResult;
use crate::partitions_states::PartitionsStates;
use crate::types::NO_OFFSET;
use std::collections::HashMap;
use std::sync::Arc;

/// Tells the bus where to start consuming newly assigned partitions.
pub trait StartingOffsetsProvider: Send + Sync {
    /// Offsets to resume from. Partitions left out use the bus default.
    fn starting_offsets(&self, partitions: &[u32]) -> TrackerResult<HashMap<u32, i64>>;
}

/// Reacts to partitions moving to or away from this process.
pub trait PartitionAssignmentListener: Send + Sync {
    fn on_partitions_assigned(&self, partitions: &[u32]) -> TrackerResult<()>;

    fn on_partitions_unassigned(&self, partitions: &[u32]);
}

/// Both rebalance hooks, backed by [`PartitionsStates`].
pub struct TrackerRebalanceListener {
    states: Arc<PartitionsStates>,
}

impl TrackerRebalanceListener {
    pub fn new(states: Arc<PartitionsStates>) -> Self {
        Self { states }
    }
}

impl StartingOffsetsProvider for TrackerRebalanceListener {
    fn starting_offsets(&self, partitions: &[u32]) -> TrackerResult<HashMap<u32, i64>> {
        let loaded = self.states.load_partitions(partitions)?;
        Ok(loaded
            .into_iter()
            .filter_map(|(partition, handle)| {
                let offset = handle.lock().read_records_from_offset();
                (offset != NO_OFFSET).then_some((partition, offset))
            })
            .collect())
    }
}

impl PartitionAssignmentListener for TrackerRebalanceListener {
    fn on_partitions_assigned(&self, partitions: &[u32]) -> TrackerResult<()> {
        self.states.load_partitions(partitions)?;
        Ok(())
    }

    fn on_partitions_unassigned(&self, partitions: &[u32]) {
        self.states.forget_partitions(partitions);
    }
}
