//! Test harness: recording collaborators, a failure-injecting store and
//! record builders.

use crate::pipeline::{OutboundPipeline, PublishFuture, Publisher};
use crate::scheduler::ReplayScheduler;
use crate::store::{
    Conflicts, InMemoryStateStore, OperationGroup, State, StateStore, StoreError, StoreResult,
};
use crate::types::{
    AuthenticatedMessage, Counterparties, EventLogRecord, HoldingIdentity, MessageHeader,
    MessageId, MessageRecord, OutboundMessage, Record, UnauthenticatedMessage,
};
use crate::{DeliveryTracker, DeliveryTrackerConfig, DeliveryTrackerConfiguration};
use futures_util::future;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

pub const SOURCE_TOPIC: &str = "p2p.out";
pub const LINK_TOPIC: &str = "link.out";

// =============================================================================
// Replay scheduler
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerCall {
    Add {
        timestamp: i64,
        message_id: MessageId,
        counterparties: Counterparties,
    },
    Remove {
        message_id: MessageId,
        counterparties: Counterparties,
    },
}

#[derive(Debug, Default)]
pub struct RecordingScheduler {
    calls: Mutex<Vec<SchedulerCall>>,
}

impl RecordingScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<SchedulerCall> {
        self.calls.lock().clone()
    }

    /// Ids passed to `add_for_replay`, in call order.
    pub fn added(&self) -> Vec<String> {
        self.calls
            .lock()
            .iter()
            .filter_map(|call| match call {
                SchedulerCall::Add { message_id, .. } => Some(message_id.to_string()),
                SchedulerCall::Remove { .. } => None,
            })
            .collect()
    }

    /// Ids passed to `remove_from_replay`, in call order.
    pub fn removed(&self) -> Vec<String> {
        self.calls
            .lock()
            .iter()
            .filter_map(|call| match call {
                SchedulerCall::Remove { message_id, .. } => Some(message_id.to_string()),
                SchedulerCall::Add { .. } => None,
            })
            .collect()
    }

    pub fn clear(&self) {
        self.calls.lock().clear();
    }
}

impl ReplayScheduler for RecordingScheduler {
    fn add_for_replay(
        &self,
        original_attempt_timestamp: i64,
        message_id: &MessageId,
        counterparties: &Counterparties,
    ) {
        self.calls.lock().push(SchedulerCall::Add {
            timestamp: original_attempt_timestamp,
            message_id: message_id.clone(),
            counterparties: counterparties.clone(),
        });
    }

    fn remove_from_replay(&self, message_id: &MessageId, counterparties: &Counterparties) {
        self.calls.lock().push(SchedulerCall::Remove {
            message_id: message_id.clone(),
            counterparties: counterparties.clone(),
        });
    }
}

// =============================================================================
// Publisher
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishMode {
    Ack,
    Reject,
    /// Publications never complete.
    Hang,
}

pub struct RecordingPublisher {
    mode: Mutex<PublishMode>,
    published: Mutex<Vec<Record>>,
}

impl RecordingPublisher {
    pub fn new() -> Self {
        Self {
            mode: Mutex::new(PublishMode::Ack),
            published: Mutex::new(Vec::new()),
        }
    }

    pub fn set_mode(&self, mode: PublishMode) {
        *self.mode.lock() = mode;
    }

    pub fn published(&self) -> Vec<Record> {
        self.published.lock().clone()
    }
}

impl Publisher for RecordingPublisher {
    fn publish(&self, records: Vec<Record>) -> Vec<PublishFuture> {
        let mode = *self.mode.lock();
        let count = records.len();
        self.published.lock().extend(records);
        (0..count)
            .map(|_| -> PublishFuture {
                match mode {
                    PublishMode::Ack => Box::pin(future::ready(Ok::<(), String>(()))),
                    PublishMode::Reject => {
                        Box::pin(future::ready(Err::<(), String>("rejected".to_string())))
                    }
                    PublishMode::Hang => Box::pin(future::pending::<Result<(), String>>()),
                }
            })
            .collect()
    }
}

// =============================================================================
// Outbound pipeline
// =============================================================================

/// Emits one link record per authenticated message, carrying its payload.
#[derive(Debug, Default)]
pub struct StubPipeline;

impl OutboundPipeline for StubPipeline {
    fn process(&self, records: &[EventLogRecord]) -> Vec<Record> {
        records
            .iter()
            .filter_map(|record| {
                let message = record.value.as_ref()?.as_authenticated()?;
                Some(Record::new(LINK_TOPIC, record.key.clone(), message.payload.clone()))
            })
            .collect()
    }

    fn replay(&self, message: &AuthenticatedMessage, key: &str) -> Vec<Record> {
        vec![Record::new(LINK_TOPIC, key, message.payload.clone())]
    }
}

// =============================================================================
// State store with failure injection
// =============================================================================

/// Wraps an [`InMemoryStateStore`], failing calls on demand and counting
/// successful operation groups.
#[derive(Debug, Default)]
pub struct FlakyStore {
    inner: InMemoryStateStore,
    failing_executes: AtomicU32,
    failing_reads: AtomicBool,
    failing_creates: AtomicBool,
    contended_deletes: AtomicBool,
    executes: AtomicUsize,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inner(&self) -> &InMemoryStateStore {
        &self.inner
    }

    /// Fail the next `count` calls to `execute`.
    pub fn fail_next_executes(&self, count: u32) {
        self.failing_executes.store(count, Ordering::SeqCst);
    }

    pub fn fail_reads(&self, failing: bool) {
        self.failing_reads.store(failing, Ordering::SeqCst);
    }

    pub fn fail_creates(&self, failing: bool) {
        self.failing_creates.store(failing, Ordering::SeqCst);
    }

    /// Report every delete as rejected by a concurrent writer.
    pub fn contend_deletes(&self, contended: bool) {
        self.contended_deletes.store(contended, Ordering::SeqCst);
    }

    /// Operation groups that reached the inner store.
    pub fn executes(&self) -> usize {
        self.executes.load(Ordering::SeqCst)
    }

    fn unavailable(operation: &str) -> StoreError {
        StoreError::Unavailable(format!("injected {operation} failure"))
    }
}

impl StateStore for FlakyStore {
    fn get(&self, keys: &[String]) -> StoreResult<HashMap<String, State>> {
        if self.failing_reads.load(Ordering::SeqCst) {
            return Err(Self::unavailable("get"));
        }
        self.inner.get(keys)
    }

    fn create(&self, states: Vec<State>) -> StoreResult<HashSet<String>> {
        if self.failing_creates.load(Ordering::SeqCst) {
            return Err(Self::unavailable("create"));
        }
        self.inner.create(states)
    }

    fn update(&self, states: Vec<State>) -> StoreResult<Conflicts> {
        self.inner.update(states)
    }

    fn delete(&self, states: Vec<State>) -> StoreResult<HashMap<String, State>> {
        if self.contended_deletes.load(Ordering::SeqCst) {
            return Ok(states
                .into_iter()
                .map(|state| (state.key.clone(), state))
                .collect());
        }
        self.inner.delete(states)
    }

    fn execute(&self, group: OperationGroup) -> StoreResult<Conflicts> {
        let failing = self
            .failing_executes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(Self::unavailable("execute"));
        }
        self.executes.fetch_add(1, Ordering::SeqCst);
        self.inner.execute(group)
    }
}

// =============================================================================
// Fixture
// =============================================================================

pub struct TestTracker {
    pub tracker: DeliveryTracker,
    pub store: Arc<FlakyStore>,
    pub scheduler: Arc<RecordingScheduler>,
    pub publisher: Arc<RecordingPublisher>,
}

impl TestTracker {
    pub fn new() -> Self {
        Self::with_config(DeliveryTrackerConfig::default())
    }

    pub fn with_config(config: DeliveryTrackerConfig) -> Self {
        Self::with_store(config, Arc::new(FlakyStore::new()))
    }

    pub fn with_store(config: DeliveryTrackerConfig, store: Arc<FlakyStore>) -> Self {
        let scheduler = Arc::new(RecordingScheduler::new());
        let publisher = Arc::new(RecordingPublisher::new());
        let tracker = DeliveryTracker::new(
            DeliveryTrackerConfiguration::new(config),
            store.clone(),
            scheduler.clone(),
            Arc::new(StubPipeline),
            publisher.clone(),
        );
        Self {
            tracker,
            store,
            scheduler,
            publisher,
        }
    }
}

// =============================================================================
// Builders
// =============================================================================

pub fn authenticated(id: &str, from: &str, to: &str, group: &str) -> AuthenticatedMessage {
    AuthenticatedMessage {
        header: MessageHeader {
            message_id: MessageId::from(id),
            source: HoldingIdentity::new(from, group),
            destination: HoldingIdentity::new(to, group),
        },
        payload: format!("payload of {id}").into_bytes(),
    }
}

pub fn message_record(id: &str, partition: u32, offset: i64) -> MessageRecord {
    MessageRecord {
        message: authenticated(id, "Alice", "Bob", "group-1"),
        partition,
        offset,
    }
}

pub fn event(id: &str, partition: u32, offset: i64) -> EventLogRecord {
    EventLogRecord {
        topic: SOURCE_TOPIC.to_string(),
        key: id.to_string(),
        value: Some(OutboundMessage::Authenticated(authenticated(
            id, "Alice", "Bob", "group-1",
        ))),
        partition,
        offset,
    }
}

pub fn unauthenticated_event(key: &str, partition: u32, offset: i64) -> EventLogRecord {
    EventLogRecord {
        topic: SOURCE_TOPIC.to_string(),
        key: key.to_string(),
        value: Some(OutboundMessage::Unauthenticated(UnauthenticatedMessage {
            source: HoldingIdentity::new("Alice", "group-1"),
            destination: HoldingIdentity::new("Bob", "group-1"),
            payload: b"plain".to_vec(),
        })),
        partition,
        offset,
    }
}

pub fn tombstone(key: &str, partition: u32, offset: i64) -> EventLogRecord {
    EventLogRecord {
        topic: SOURCE_TOPIC.to_string(),
        key: key.to_string(),
        value: None,
        partition,
        offset,
    }
}
