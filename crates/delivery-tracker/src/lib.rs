//! # Delivery Tracker
//!
//! At-least-once delivery for point-to-point messages sent over a partitioned
//! bus. The tracker remembers which sent messages are still unacknowledged,
//! persists that ledger so it survives restarts and rebalances, caches
//! message bodies, and drives an external replay scheduler.
//!
//! ## Principles
//!
//! - **One owner per partition** - The assignment protocol hands each partition
//!   to a single process; version conflicts in the store are treated as fatal.
//! - **Snapshots are atomic** - All dirty partitions are written in one
//!   operation group per persistence cycle.
//! - **Cursors only move forward** - Both per-partition offsets are monotonic.
//! - **Replay is best-effort** - A message whose body is gone is not replayed.
//!
//! ## Flow
//!
//! ```text
//! SEND:
//!   MessagesHandler → PartitionsStates.read + DataMessageCache.put
//!                   → OutboundPipeline → Publisher → sent / handled
//!
//! PERSIST (every period):
//!   dirty PartitionState → OperationGroup → StateStore.execute
//!
//! ACK:
//!   AckProcessor → cache.remove → forget → scheduler.remove_from_replay
//!
//! REPLAY:
//!   scheduler → MessageReplayer → cache.get → pipeline.replay → Publisher
//! ```
//!
//! ## Crate Structure
//!
//! - [`store`] - Versioned state store contract and backends
//! - [`partition_state`] - Per-partition ledger and snapshot format
//! - [`cache`] - Message body cache
//! - [`partitions_states`] - Assigned partitions and the persister
//! - [`ack`], [`replayer`], [`processor`], [`handler`] - Glue around the bus
//! - [`rebalance`] - Offset provider and assignment listener

pub mod ack;
pub mod cache;
pub mod configuration;
mod error;
pub mod handler;
pub mod health;
pub mod partition_state;
pub mod partitions_states;
pub mod pipeline;
pub mod processor;
pub mod rebalance;
pub mod replayer;
pub mod scheduler;
pub mod store;
mod tracker;
pub mod types;

#[cfg(test)]
mod tests;

pub use ack::{forward_ack, AckMessageProcessor, AckProcessor, AuthenticatedAck, InboundAck, APP_ACKS_TOPIC};
pub use cache::{DataMessageCache, DeletionStatus, OffsetsListener, RemoveOutcome};
pub use configuration::DeliveryTrackerConfiguration;
pub use error::{TrackerError, TrackerResult};
pub use handler::MessagesHandler;
pub use health::{HealthIndicator, LifecycleStatus};
pub use partition_state::{PartitionState, TrackedMessage};
pub use partitions_states::{PartitionHandle, PartitionsStates, PersistenceTask};
pub use pipeline::{OutboundPipeline, PublishFuture, Publisher};
pub use processor::DeliveryTrackerProcessor;
pub use rebalance::{PartitionAssignmentListener, StartingOffsetsProvider, TrackerRebalanceListener};
pub use replayer::MessageReplayer;
pub use scheduler::ReplayScheduler;
pub use store::{InMemoryStateStore, OperationGroup, SqliteStateStore, State, StateStore, StoreError};
pub use tracker::DeliveryTracker;
pub use tracker_config::DeliveryTrackerConfig;
pub use types::{
    AuthenticatedMessage, Counterparties, EventLogRecord, HoldingIdentity, MessageHeader, MessageId,
    MessageRecord, OutboundMessage, Record, SourcePosition, TrackedMessageState,
    UnauthenticatedMessage, NO_OFFSET,
};
