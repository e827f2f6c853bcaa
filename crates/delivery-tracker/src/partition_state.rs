//! Per-partition ledger of unacknowledged messages.
//!
//! A [`PartitionState`] remembers every sent message of one source partition
//! that has not been acknowledged yet, grouped by [`Counterparties`], plus two
//! offset cursors:
//!
//! - `read_records_from_offset`: where tracking registration resumes after a
//!   restart.
//! - `process_records_from_offset`: how far handling bookkeeping has got.
//!
//! Both cursors start at [`NO_OFFSET`] and only move forward. The whole
//! ledger is written as one JSON document under
//! `delivery-tracker:partition:<n>`.

use crate::error::{TrackerError, TrackerResult};
use crate::store::{OperationGroup, State};
use crate::types::{Counterparties, MessageId, MessageRecord, TrackedMessageState, NO_OFFSET};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tracing::warn;

pub const PARTITION_KEY_PREFIX: &str = "delivery-tracker:partition:";

/// Store key of the snapshot for `partition`.
pub fn partition_key(partition: u32) -> String {
    format!("{PARTITION_KEY_PREFIX}{partition}")
}

/// Parses a key produced by [`partition_key`].
pub fn partition_from_key(key: &str) -> Option<u32> {
    key.strip_prefix(PARTITION_KEY_PREFIX)?.parse().ok()
}

/// A message that became tracked, with the pair it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackedMessage {
    pub counterparties: Counterparties,
    pub state: TrackedMessageState,
}

type Messages = BTreeMap<String, BTreeMap<String, BTreeMap<String, BTreeMap<String, TrackedMessageState>>>>;

/// Durable layout: group -> our id -> their id -> message id -> state.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Snapshot {
    read_records_from_offset: i64,
    process_records_from_offset: i64,
    #[serde(default)]
    messages: Messages,
}

/// In-memory ledger of one partition.
#[derive(Debug, Clone)]
pub struct PartitionState {
    partition: u32,
    read_records_from_offset: i64,
    process_records_from_offset: i64,
    messages: HashMap<Counterparties, HashMap<MessageId, TrackedMessageState>>,
    owners: HashMap<MessageId, Counterparties>,
    /// Store version of the last successful write, `None` if never written.
    persisted_version: Option<i32>,
    revision: u64,
    persisted_revision: Option<u64>,
}

impl PartitionState {
    /// A blank ledger for a partition with no snapshot.
    pub fn new(partition: u32) -> Self {
        Self {
            partition,
            read_records_from_offset: NO_OFFSET,
            process_records_from_offset: NO_OFFSET,
            messages: HashMap::new(),
            owners: HashMap::new(),
            persisted_version: None,
            revision: 0,
            persisted_revision: None,
        }
    }

    /// Hydrate from a stored snapshot, or start blank when there is none.
    pub fn from_state(partition: u32, state: Option<&State>) -> TrackerResult<Self> {
        let Some(state) = state else {
            return Ok(Self::new(partition));
        };

        let snapshot: Snapshot = serde_json::from_slice(&state.value)
            .map_err(|source| TrackerError::CorruptSnapshot { partition, source })?;

        let mut partition_state = Self::new(partition);
        partition_state.read_records_from_offset = snapshot.read_records_from_offset;
        partition_state.process_records_from_offset = snapshot.process_records_from_offset;
        for (group_id, sources) in snapshot.messages {
            for (our_id, destinations) in sources {
                for (their_id, tracked) in destinations {
                    let counterparties = Counterparties::new(group_id.clone(), our_id.clone(), their_id);
                    for (_, message) in tracked {
                        if let Some(owner) = partition_state.owners.get(&message.message_id) {
                            warn!(
                                partition,
                                message_id = %message.message_id,
                                kept = %owner,
                                skipped = %counterparties,
                                "snapshot tracks message under two counterparties"
                            );
                            continue;
                        }
                        partition_state.insert(counterparties.clone(), message);
                    }
                }
            }
        }
        partition_state.persisted_version = Some(state.version);
        partition_state.persisted_revision = Some(partition_state.revision);
        Ok(partition_state)
    }

    pub fn partition(&self) -> u32 {
        self.partition
    }

    pub fn read_records_from_offset(&self) -> i64 {
        self.read_records_from_offset
    }

    pub fn process_records_from_offset(&self) -> i64 {
        self.process_records_from_offset
    }

    /// Store version of the last write this ledger knows about.
    pub fn persisted_version(&self) -> Option<i32> {
        self.persisted_version
    }

    /// Number of tracked messages.
    pub fn len(&self) -> usize {
        self.owners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.owners.is_empty()
    }

    pub fn is_tracked(&self, message_id: &MessageId) -> bool {
        self.owners.contains_key(message_id)
    }

    /// Pair a tracked message belongs to.
    pub fn counterparties_of(&self, message_id: &MessageId) -> Option<&Counterparties> {
        self.owners.get(message_id)
    }

    /// Track every record not already tracked, stamped with `now`.
    ///
    /// Returns only the additions. A message id already tracked, under any
    /// counterparties, is skipped.
    pub fn read<'a>(
        &mut self,
        now: i64,
        records: impl IntoIterator<Item = &'a MessageRecord>,
    ) -> Vec<TrackedMessage> {
        let mut added = Vec::new();
        for record in records {
            let message_id = record.message_id();
            if self.owners.contains_key(message_id) {
                continue;
            }
            let tracked = TrackedMessage {
                counterparties: record.counterparties(),
                state: TrackedMessageState {
                    message_id: message_id.clone(),
                    timestamp: now,
                },
            };
            self.insert(tracked.counterparties.clone(), tracked.state.clone());
            added.push(tracked);
        }
        if !added.is_empty() {
            self.touch();
        }
        added
    }

    /// Stop tracking `message_id`. Returns what was tracked, if anything.
    pub fn forget(&mut self, message_id: &MessageId) -> Option<TrackedMessage> {
        let counterparties = self.owners.remove(message_id)?;
        let bucket = self.messages.get_mut(&counterparties)?;
        let state = bucket.remove(message_id)?;
        if bucket.is_empty() {
            self.messages.remove(&counterparties);
        }
        self.touch();
        Some(TrackedMessage {
            counterparties,
            state,
        })
    }

    /// Every tracked message grouped by pair, sorted for stable output.
    pub fn counterparties_to_messages(&self) -> Vec<(Counterparties, Vec<TrackedMessageState>)> {
        let mut grouped: Vec<_> = self
            .messages
            .iter()
            .map(|(counterparties, bucket)| {
                let mut states: Vec<_> = bucket.values().cloned().collect();
                states.sort_by(|a, b| a.message_id.cmp(&b.message_id));
                (counterparties.clone(), states)
            })
            .collect();
        grouped.sort_by(|a, b| a.0.cmp(&b.0));
        grouped
    }

    /// Move the read cursor forward. Lower offsets are ignored.
    pub fn advance_read_records_from_offset(&mut self, offset: i64) -> bool {
        if offset <= self.read_records_from_offset {
            return false;
        }
        self.read_records_from_offset = offset;
        self.touch();
        true
    }

    /// Move the processed cursor forward. Lower offsets are ignored.
    pub fn advance_process_records_from_offset(&mut self, offset: i64) -> bool {
        if offset <= self.process_records_from_offset {
            return false;
        }
        self.process_records_from_offset = offset;
        self.touch();
        true
    }

    /// Whether anything changed since the last successful write.
    pub fn is_dirty(&self) -> bool {
        self.persisted_revision != Some(self.revision)
    }

    /// Serialize into `group` as a create (never written) or an update.
    ///
    /// Returns the revision that was serialized, to be handed to
    /// [`mark_persisted`](Self::mark_persisted) once the group commits.
    pub fn add_to_operation_group(&self, group: &mut OperationGroup) -> TrackerResult<u64> {
        let value = serde_json::to_vec(&self.snapshot())?;
        let key = partition_key(self.partition);
        match self.persisted_version {
            None => group.create(State::new(key, value)),
            Some(version) => group.update(State::with_version(key, value, version)),
        };
        Ok(self.revision)
    }

    /// Record a committed write of `revision`.
    pub fn mark_persisted(&mut self, revision: u64) {
        self.persisted_version = Some(match self.persisted_version {
            None => 0,
            Some(version) => version + 1,
        });
        self.persisted_revision = Some(revision);
    }

    /// Adopt the version another writer left in the store.
    ///
    /// `None` means the snapshot no longer exists and the next write creates it.
    pub fn refresh_version(&mut self, current: Option<&State>) {
        self.persisted_version = current.map(|state| state.version);
    }

    fn snapshot(&self) -> Snapshot {
        let mut messages = Messages::new();
        for (counterparties, bucket) in &self.messages {
            let tracked = messages
                .entry(counterparties.group_id.clone())
                .or_default()
                .entry(counterparties.our_id.clone())
                .or_default()
                .entry(counterparties.their_id.clone())
                .or_default();
            for (message_id, state) in bucket {
                tracked.insert(message_id.to_string(), state.clone());
            }
        }
        Snapshot {
            read_records_from_offset: self.read_records_from_offset,
            process_records_from_offset: self.process_records_from_offset,
            messages,
        }
    }

    fn insert(&mut self, counterparties: Counterparties, state: TrackedMessageState) {
        self.owners
            .insert(state.message_id.clone(), counterparties.clone());
        self.messages
            .entry(counterparties)
            .or_default()
            .insert(state.message_id.clone(), state);
    }

    fn touch(&mut self) {
        self.revision += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AuthenticatedMessage, HoldingIdentity, MessageHeader};

    fn record(id: &str, from: &str, to: &str, offset: i64) -> MessageRecord {
        MessageRecord {
            message: AuthenticatedMessage {
                header: MessageHeader {
                    message_id: MessageId::from(id),
                    source: HoldingIdentity::new(from, "group-1"),
                    destination: HoldingIdentity::new(to, "group-1"),
                },
                payload: vec![1, 2, 3],
            },
            partition: 1,
            offset,
        }
    }

    fn ids(state: &PartitionState) -> Vec<String> {
        let mut ids: Vec<String> = state
            .counterparties_to_messages()
            .into_iter()
            .flat_map(|(_, states)| states.into_iter().map(|s| s.message_id.to_string()))
            .collect();
        ids.sort();
        ids
    }

    #[test]
    fn blank_state_starts_at_no_offset() {
        let state = PartitionState::from_state(4, None).unwrap();
        assert_eq!(state.partition(), 4);
        assert_eq!(state.read_records_from_offset(), NO_OFFSET);
        assert_eq!(state.process_records_from_offset(), NO_OFFSET);
        assert!(state.is_empty());
        assert!(state.is_dirty());
    }

    #[test]
    fn read_returns_only_new_messages() {
        let mut state = PartitionState::new(1);
        let first = [record("a", "Alice", "Bob", 1), record("b", "Alice", "Bob", 2)];

        let added = state.read(100, &first);
        assert_eq!(added.len(), 2);
        assert_eq!(added[0].state.timestamp, 100);

        let again = [record("b", "Alice", "Bob", 2), record("c", "Alice", "Bob", 3)];
        let added = state.read(200, &again);
        assert_eq!(added.len(), 1);
        assert_eq!(added[0].state.message_id.as_str(), "c");

        assert!(state.read(300, &again).is_empty());
        assert_eq!(ids(&state), vec!["a", "b", "c"]);
    }

    #[test]
    fn message_id_is_tracked_under_one_pair_only() {
        let mut state = PartitionState::new(1);
        state.read(1, &[record("a", "Alice", "Bob", 1)]);
        assert!(state.read(2, &[record("a", "Alice", "Carol", 2)]).is_empty());

        let grouped = state.counterparties_to_messages();
        assert_eq!(grouped.len(), 1);
        assert_eq!(grouped[0].0.their_id, "Bob");
    }

    #[test]
    fn forget_drops_empty_buckets() {
        let mut state = PartitionState::new(1);
        state.read(1, &[record("a", "Alice", "Bob", 1), record("b", "Alice", "Carol", 2)]);

        let forgotten = state.forget(&MessageId::from("a")).unwrap();
        assert_eq!(forgotten.counterparties.their_id, "Bob");
        assert!(state.forget(&MessageId::from("a")).is_none());

        let grouped = state.counterparties_to_messages();
        assert_eq!(grouped.len(), 1);
        assert_eq!(grouped[0].0.their_id, "Carol");
    }

    #[test]
    fn cursors_never_regress() {
        let mut state = PartitionState::new(1);
        assert!(state.advance_read_records_from_offset(10));
        assert!(!state.advance_read_records_from_offset(5));
        assert!(state.advance_process_records_from_offset(3));
        assert!(!state.advance_process_records_from_offset(3));

        assert_eq!(state.read_records_from_offset(), 10);
        assert_eq!(state.process_records_from_offset(), 3);
    }

    #[test]
    fn snapshot_roundtrip_keeps_cursors_and_messages() {
        let mut state = PartitionState::new(2);
        state.read(55, &[record("a", "Alice", "Bob", 1), record("b", "Bob", "Alice", 2)]);
        state.advance_read_records_from_offset(3);
        state.advance_process_records_from_offset(2);

        let mut group = OperationGroup::new();
        state.add_to_operation_group(&mut group).unwrap();
        let written = group.creates()[0].clone();
        assert_eq!(written.key, "delivery-tracker:partition:2");

        let restored = PartitionState::from_state(2, Some(&written)).unwrap();
        assert_eq!(restored.read_records_from_offset(), 3);
        assert_eq!(restored.process_records_from_offset(), 2);
        assert_eq!(
            restored.counterparties_to_messages(),
            state.counterparties_to_messages()
        );
        assert!(!restored.is_dirty());
    }

    #[test]
    fn snapshot_uses_nested_layout() {
        let mut state = PartitionState::new(5);
        state.read(10231, &[record("id-2", "Alice", "Bob", 1)]);

        let json: serde_json::Value = serde_json::to_value(state.snapshot()).unwrap();
        assert_eq!(json["readRecordsFromOffset"], -1);
        assert_eq!(
            json["messages"]["group-1"]["Alice"]["Bob"]["id-2"],
            serde_json::json!({"id": "id-2", "timestamp": 10231})
        );
    }

    #[test]
    fn first_write_creates_then_updates() {
        let mut state = PartitionState::new(1);

        let mut group = OperationGroup::new();
        let revision = state.add_to_operation_group(&mut group).unwrap();
        assert_eq!(group.creates().len(), 1);
        state.mark_persisted(revision);
        assert!(!state.is_dirty());
        assert_eq!(state.persisted_version(), Some(0));

        state.advance_read_records_from_offset(1);
        assert!(state.is_dirty());
        let mut group = OperationGroup::new();
        let revision = state.add_to_operation_group(&mut group).unwrap();
        assert_eq!(group.updates()[0].version, 0);
        state.mark_persisted(revision);
        assert_eq!(state.persisted_version(), Some(1));
    }

    #[test]
    fn changes_during_a_write_stay_dirty() {
        let mut state = PartitionState::new(1);
        let mut group = OperationGroup::new();
        let revision = state.add_to_operation_group(&mut group).unwrap();

        state.advance_read_records_from_offset(9);
        state.mark_persisted(revision);
        assert!(state.is_dirty());
    }

    #[test]
    fn malformed_snapshot_is_corrupt() {
        let bad = State::new(partition_key(3), b"{not json".to_vec());
        let err = PartitionState::from_state(3, Some(&bad)).unwrap_err();
        assert!(matches!(err, TrackerError::CorruptSnapshot { partition: 3, .. }));
    }

    #[test]
    fn snapshot_listing_an_id_twice_keeps_the_first_pair() {
        let snapshot = State::new(
            partition_key(4),
            br#"{"readRecordsFromOffset":1,"processRecordsFromOffset":1,"messages":{"g":{
                "Alice":{"Bob":{"x":{"id":"x","timestamp":1}}},
                "Carol":{"Bob":{"x":{"id":"x","timestamp":2}}}}}}"#
                .to_vec(),
        );
        let mut state = PartitionState::from_state(4, Some(&snapshot)).unwrap();

        assert_eq!(state.len(), 1);
        assert_eq!(
            state.counterparties_of(&MessageId::from("x")),
            Some(&Counterparties::new("g", "Alice", "Bob"))
        );

        state.forget(&MessageId::from("x")).unwrap();
        assert!(state.is_empty());
        assert!(state.counterparties_to_messages().is_empty());
    }

    #[test]
    fn partition_keys_roundtrip() {
        assert_eq!(partition_from_key(&partition_key(12)), Some(12));
        assert_eq!(partition_from_key("delivery-tracker:message:x"), None);
    }
}
