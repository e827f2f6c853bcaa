//! Contract with the external replay scheduler.
//!
//! The scheduler owns all timing and backoff. The tracker only tells it which
//! messages are in flight and which have been acknowledged; on timeout the
//! scheduler hands the message id back to [`MessageReplayer`](crate::MessageReplayer).

use crate::types::{Counterparties, MessageId};

/// Schedules replays of unacknowledged messages.
pub trait ReplayScheduler: Send + Sync {
    /// Start replaying `message_id` relative to its first send attempt.
    fn add_for_replay(
        &self,
        original_attempt_timestamp: i64,
        message_id: &MessageId,
        counterparties: &Counterparties,
    );

    /// Stop replaying `message_id`.
    fn remove_from_replay(&self, message_id: &MessageId, counterparties: &Counterparties);
}
