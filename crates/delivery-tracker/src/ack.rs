//! Acknowledgement handling.
//!
//! Two consumers retire acknowledged messages:
//!
//! - [`AckMessageProcessor`] handles acks arriving from the transport. It
//!   untracks the message and can forward the ack to the application topic.
//! - [`AckProcessor`] handles acks keyed by message id. It drops the cached
//!   body, untracks the message and removes it from the replay schedule.

use crate::cache::DataMessageCache;
use crate::error::TrackerResult;
use crate::partition_state::TrackedMessage;
use crate::partitions_states::PartitionsStates;
use crate::scheduler::ReplayScheduler;
use crate::types::{Counterparties, HoldingIdentity, MessageId, Record};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

/// Topic acknowledgements are forwarded to.
pub const APP_ACKS_TOPIC: &str = "p2p.app.acks";

/// Acknowledgement of an authenticated message, sent back by its recipient.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticatedAck {
    pub message_id: MessageId,
    /// The recipient of the original message.
    pub source: HoldingIdentity,
    /// The sender of the original message.
    pub destination: HoldingIdentity,
}

impl AuthenticatedAck {
    /// Counterparties of the acknowledged message, from the sender's side.
    pub fn counterparties(&self) -> Counterparties {
        Counterparties::new(
            self.destination.group_id.clone(),
            self.destination.x500_name.clone(),
            self.source.x500_name.clone(),
        )
    }
}

/// An inbound acknowledgement, resolved once at ingress.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundAck {
    Authenticated(AuthenticatedAck),
    #[serde(other)]
    Unknown,
}

/// Builds the record that republishes `ack` on [`APP_ACKS_TOPIC`].
pub fn forward_ack(ack: &AuthenticatedAck) -> TrackerResult<Record> {
    let value = serde_json::to_vec(&InboundAck::Authenticated(ack.clone()))?;
    Ok(Record::new(APP_ACKS_TOPIC, ack.message_id.as_str(), value))
}

/// Untracks messages as transport acks arrive.
pub struct AckMessageProcessor {
    states: Arc<PartitionsStates>,
}

impl AckMessageProcessor {
    pub fn new(states: Arc<PartitionsStates>) -> Self {
        Self { states }
    }

    /// Untrack the acknowledged message. Unknown ack types are ignored.
    pub fn process(&self, ack: &InboundAck) -> Option<TrackedMessage> {
        match ack {
            InboundAck::Authenticated(ack) => self
                .states
                .untrack_message(&ack.message_id, &ack.counterparties()),
            InboundAck::Unknown => {
                debug!("ignoring ack of unknown type");
                None
            }
        }
    }

    /// Untrack every recognized ack and build its forwarding record.
    pub fn process_batch(&self, acks: &[InboundAck]) -> TrackerResult<Vec<Record>> {
        let mut forwards = Vec::new();
        for ack in acks {
            self.process(ack);
            if let InboundAck::Authenticated(ack) = ack {
                forwards.push(forward_ack(ack)?);
            }
        }
        Ok(forwards)
    }
}

/// Fully retires acknowledged messages.
pub struct AckProcessor {
    cache: Arc<DataMessageCache>,
    states: Arc<PartitionsStates>,
    scheduler: Arc<dyn ReplayScheduler>,
}

impl AckProcessor {
    pub fn new(
        cache: Arc<DataMessageCache>,
        states: Arc<PartitionsStates>,
        scheduler: Arc<dyn ReplayScheduler>,
    ) -> Self {
        Self {
            cache,
            states,
            scheduler,
        }
    }

    /// Retire `message_id`. Returns false when nothing was known about it.
    ///
    /// A message whose body is gone from the cache is still untracked when
    /// any assigned partition tracks it.
    pub fn on_ack(&self, message_id: &MessageId) -> bool {
        let removed = self.cache.remove(message_id);
        if let Some(record) = removed.entry {
            self.states.forget(&record);
            self.scheduler
                .remove_from_replay(record.message_id(), &record.counterparties());
            return true;
        }

        let Some(tracked) = self.states.untrack_by_id(message_id) else {
            debug!(message_id = %message_id, "ack for unknown message ignored");
            return false;
        };
        debug!(message_id = %message_id, "retired tracked message without a cached body");
        self.scheduler
            .remove_from_replay(&tracked.state.message_id, &tracked.counterparties);
        true
    }

    /// Retire every key in `message_ids`. Returns how many were known.
    pub fn process_batch(&self, message_ids: &[MessageId]) -> usize {
        message_ids.iter().filter(|id| self.on_ack(id)).count()
    }
}
