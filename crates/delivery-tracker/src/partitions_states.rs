//! # PartitionsStates
//!
//! Owns the [`PartitionState`] of every partition assigned to this process and
//! keeps them durable.
//!
//! ## Lifecycle
//!
//! 1. Partitions are loaded on assignment with [`PartitionsStates::load_partitions`].
//!    Every message recovered from a snapshot is registered with the replay
//!    scheduler again, with its original timestamp.
//! 2. The consumption path calls [`read`](PartitionsStates::read),
//!    [`sent`](PartitionsStates::sent) and [`handled`](PartitionsStates::handled).
//! 3. A background persister ([`PersistenceTask`]) writes every dirty partition
//!    in one atomic operation group per period, on the blocking thread pool.
//! 4. Partitions are dropped from memory on unassignment with
//!    [`PartitionsStates::forget_partitions`]; their snapshots stay in the store.
//!
//! ## Failure handling
//!
//! - A version conflict means another process wrote the same partition. The
//!   fresh versions are adopted and the health indicator is escalated at once.
//! - Any other failed cycle is tolerated until `maxNumberOfPersistenceRetries`
//!   consecutive cycles have failed. A successful cycle resets the count.

use crate::cache::OffsetsListener;
use crate::error::{TrackerError, TrackerResult};
use crate::health::HealthIndicator;
use crate::partition_state::{partition_from_key, partition_key, PartitionState, TrackedMessage};
use crate::scheduler::ReplayScheduler;
use crate::store::{OperationGroup, StateStore};
use crate::types::{now_millis, Counterparties, MessageId, MessageRecord, SourcePosition};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};
use tracker_config::DeliveryTrackerConfig;

/// Shared handle to one partition's ledger.
pub type PartitionHandle = Arc<Mutex<PartitionState>>;

/// Handle to the running persister.
///
/// Stopping only signals the task; a cycle already in progress finishes on
/// its own.
#[derive(Debug)]
pub struct PersistenceTask {
    shutdown: Option<oneshot::Sender<()>>,
    handle: JoinHandle<()>,
}

impl PersistenceTask {
    /// Ask the task to exit after the current cycle.
    pub fn stop(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

/// Tracking state of every assigned partition.
pub struct PartitionsStates {
    store: Arc<dyn StateStore>,
    scheduler: Arc<dyn ReplayScheduler>,
    config: watch::Receiver<DeliveryTrackerConfig>,
    health: HealthIndicator,
    partitions: DashMap<u32, PartitionHandle>,
    consecutive_failures: AtomicU32,
    task: Mutex<Option<PersistenceTask>>,
}

impl PartitionsStates {
    pub fn new(
        store: Arc<dyn StateStore>,
        scheduler: Arc<dyn ReplayScheduler>,
        config: watch::Receiver<DeliveryTrackerConfig>,
        health: HealthIndicator,
    ) -> Self {
        Self {
            store,
            scheduler,
            config,
            health,
            partitions: DashMap::new(),
            consecutive_failures: AtomicU32::new(0),
            task: Mutex::new(None),
        }
    }

    pub fn health(&self) -> &HealthIndicator {
        &self.health
    }

    /// Handle of an assigned partition.
    pub fn get(&self, partition: u32) -> Option<PartitionHandle> {
        self.partitions.get(&partition).map(|entry| entry.value().clone())
    }

    /// Assigned partitions, sorted.
    pub fn assigned_partitions(&self) -> Vec<u32> {
        let mut partitions: Vec<u32> = self.partitions.iter().map(|entry| *entry.key()).collect();
        partitions.sort_unstable();
        partitions
    }

    /// Consecutive failed persistence cycles so far.
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::SeqCst)
    }

    /// Bring `partitions` into memory and return their handles.
    ///
    /// Partitions already loaded are left as they are. The rest are read from
    /// the store in one batch; a corrupt snapshot fails the whole call and
    /// nothing is inserted.
    pub fn load_partitions(&self, partitions: &[u32]) -> TrackerResult<HashMap<u32, PartitionHandle>> {
        let mut missing: Vec<u32> = partitions
            .iter()
            .copied()
            .filter(|partition| !self.partitions.contains_key(partition))
            .collect();
        missing.sort_unstable();
        missing.dedup();

        if !missing.is_empty() {
            let keys: Vec<String> = missing.iter().map(|p| partition_key(*p)).collect();
            let stored = self.store.get(&keys)?;

            let mut loaded = Vec::with_capacity(missing.len());
            for (partition, key) in missing.iter().zip(&keys) {
                loaded.push(PartitionState::from_state(*partition, stored.get(key))?);
            }

            for state in loaded {
                let partition = state.partition();
                let recovered = state.counterparties_to_messages();
                let mut inserted = false;
                self.partitions.entry(partition).or_insert_with(|| {
                    inserted = true;
                    Arc::new(Mutex::new(state))
                });
                if !inserted {
                    continue;
                }

                let count: usize = recovered.iter().map(|(_, states)| states.len()).sum();
                for (counterparties, states) in recovered {
                    for tracked in states {
                        self.scheduler
                            .add_for_replay(tracked.timestamp, &tracked.message_id, &counterparties);
                    }
                }
                info!(partition, recovered = count, "loaded partition state");
            }
        }

        Ok(partitions
            .iter()
            .filter_map(|partition| self.get(*partition).map(|handle| (*partition, handle)))
            .collect())
    }

    /// Drop `partitions` from memory. Snapshots and replay registrations stay.
    pub fn forget_partitions(&self, partitions: &[u32]) {
        for partition in partitions {
            if self.partitions.remove(partition).is_some() {
                info!(partition, "forgot partition state");
            }
        }
    }

    /// Track the messages in `records` and register new ones for replay.
    ///
    /// Records of partitions that are not assigned are skipped.
    pub fn read(&self, records: &[MessageRecord]) -> Vec<TrackedMessage> {
        let now = now_millis();
        let mut added = Vec::new();
        for (partition, batch) in group_by_partition(records) {
            let Some(handle) = self.get(partition) else {
                debug!(partition, records = batch.len(), "skipping records of unassigned partition");
                continue;
            };
            let tracked = handle.lock().read(now, batch);
            added.extend(tracked);
        }

        for tracked in &added {
            self.scheduler.add_for_replay(
                tracked.state.timestamp,
                &tracked.state.message_id,
                &tracked.counterparties,
            );
        }
        added
    }

    /// Advance the read cursor to the highest offset of each partition in `records`.
    pub fn sent<R: SourcePosition>(&self, records: &[R]) {
        self.sent_retaining(records, &HashMap::new());
    }

    /// Like [`sent`](Self::sent), but never past `retained[partition]`, the
    /// lowest offset whose body would be lost on restart. Reading resumes
    /// there so the cache is refilled.
    pub fn sent_retaining<R: SourcePosition>(&self, records: &[R], retained: &HashMap<u32, i64>) {
        for (partition, offset) in max_offsets(records) {
            let offset = retained
                .get(&partition)
                .map_or(offset, |retained| offset.min(*retained));
            if let Some(handle) = self.get(partition) {
                handle.lock().advance_read_records_from_offset(offset);
            }
        }
    }

    /// Advance the processed cursor to the highest offset of each partition in `records`.
    pub fn handled<R: SourcePosition>(&self, records: &[R]) {
        for (partition, offset) in max_offsets(records) {
            if let Some(handle) = self.get(partition) {
                handle.lock().advance_process_records_from_offset(offset);
            }
        }
    }

    /// Stop tracking the message of `record` in its own partition.
    pub fn forget(&self, record: &MessageRecord) -> Option<TrackedMessage> {
        let Some(handle) = self.get(record.partition) else {
            debug!(partition = record.partition, "forget on unassigned partition ignored");
            return None;
        };
        let forgotten = handle.lock().forget(record.message_id());
        forgotten
    }

    /// Stop tracking `message_id` in whichever assigned partition holds it.
    pub fn untrack_message(
        &self,
        message_id: &MessageId,
        counterparties: &Counterparties,
    ) -> Option<TrackedMessage> {
        for entry in self.partitions.iter() {
            let mut state = entry.value().lock();
            if !state.is_tracked(message_id) {
                continue;
            }
            if state.counterparties_of(message_id) != Some(counterparties) {
                debug!(
                    message_id = %message_id,
                    counterparties = %counterparties,
                    partition = *entry.key(),
                    "untracking message under different counterparties"
                );
            }
            return state.forget(message_id);
        }
        debug!(message_id = %message_id, "untrack of unknown message ignored");
        None
    }

    /// Stop tracking `message_id` wherever it is, whatever its counterparties.
    pub fn untrack_by_id(&self, message_id: &MessageId) -> Option<TrackedMessage> {
        for entry in self.partitions.iter() {
            let forgotten = entry.value().lock().forget(message_id);
            if forgotten.is_some() {
                return forgotten;
            }
        }
        None
    }

    /// Run one persistence cycle and account for its outcome.
    pub fn persist_now(&self) -> TrackerResult<()> {
        match self.persist_dirty() {
            Ok(written) => {
                let previous = self.consecutive_failures.swap(0, Ordering::SeqCst);
                if previous > 0 {
                    info!(previous_failures = previous, "partition state persistence recovered");
                }
                if written > 0 {
                    debug!(partitions = written, "persisted partition states");
                }
                Ok(())
            }
            Err(e) => {
                let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
                let budget = self.config.borrow().max_number_of_persistence_retries;
                if failures >= budget {
                    self.health.set_error(format!(
                        "partition state persistence failed {failures} consecutive times: {e}"
                    ));
                    return Err(TrackerError::PersistenceExhausted {
                        attempts: failures,
                        source: Box::new(e),
                    });
                }
                warn!(error = %e, failures, budget, "partition state persistence failed");
                Err(e)
            }
        }
    }

    /// Write every dirty partition in one operation group. Returns how many
    /// partitions were written.
    fn persist_dirty(&self) -> TrackerResult<usize> {
        let handles: Vec<(u32, PartitionHandle)> = self
            .partitions
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();

        let mut group = OperationGroup::new();
        let mut pending = Vec::new();
        for (partition, handle) in handles {
            let revision = {
                let state = handle.lock();
                if !state.is_dirty() {
                    continue;
                }
                state.add_to_operation_group(&mut group)?
            };
            pending.push((partition, handle, revision));
        }
        if group.is_empty() {
            return Ok(0);
        }

        let conflicts = self.store.execute(group)?;
        if conflicts.is_empty() {
            for (_, handle, revision) in &pending {
                handle.lock().mark_persisted(*revision);
            }
            return Ok(pending.len());
        }

        let mut keys: Vec<String> = conflicts.keys().cloned().collect();
        keys.sort();
        for (key, current) in &conflicts {
            let Some(partition) = partition_from_key(key) else {
                continue;
            };
            if let Some(handle) = self.get(partition) {
                handle.lock().refresh_version(current.as_ref());
            }
        }
        self.health.set_error(format!(
            "partition state written by another owner: {}",
            keys.join(", ")
        ));
        Err(TrackerError::VersionConflict(keys))
    }

    /// Spawn the periodic persister. Does nothing if it is already running.
    pub fn start(self: &Arc<Self>) {
        let mut task = self.task.lock();
        if task.is_some() {
            return;
        }

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        let states = Arc::downgrade(self);
        let mut config = self.config.clone();

        let handle = tokio::spawn(async move {
            let mut period = config.borrow_and_update().state_persistence_period_seconds;
            let mut ticker = persistence_interval(period);
            let mut watching = true;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let Some(states) = Weak::upgrade(&states) else {
                            break;
                        };
                        // Store writes block; failures are accounted for by persist_now.
                        let cycle = tokio::task::spawn_blocking(move || states.persist_now());
                        if let Err(e) = cycle.await {
                            warn!(error = %e, "partition state persistence cycle panicked");
                        }
                    }
                    changed = config.changed(), if watching => {
                        if changed.is_err() {
                            watching = false;
                            continue;
                        }
                        let next = config.borrow_and_update().state_persistence_period_seconds;
                        if next != period {
                            info!(from = period, to = next, "rescheduling partition state persistence");
                            period = next;
                            ticker = persistence_interval(period);
                        }
                    }
                    _ = &mut shutdown_rx => {
                        break;
                    }
                }
            }
            debug!("partition state persister stopped");
        });

        *task = Some(PersistenceTask {
            shutdown: Some(shutdown_tx),
            handle,
        });
    }

    /// Signal the persister to stop. Returns without waiting for it.
    pub fn stop(&self) {
        if let Some(task) = self.task.lock().take() {
            task.stop();
        }
    }

    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }
}

impl OffsetsListener for PartitionsStates {
    /// Raise read cursors to the lowest offsets the cache still holds.
    fn offsets_to_read_from_changed(&self, offsets: &[(u32, i64)]) {
        for (partition, offset) in offsets {
            if let Some(handle) = self.get(*partition) {
                handle.lock().advance_read_records_from_offset(*offset);
            }
        }
    }
}

fn persistence_interval(period_seconds: u64) -> Interval {
    let period = Duration::from_secs(period_seconds.max(1));
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

fn group_by_partition(records: &[MessageRecord]) -> BTreeMap<u32, Vec<&MessageRecord>> {
    let mut grouped: BTreeMap<u32, Vec<&MessageRecord>> = BTreeMap::new();
    for record in records {
        grouped.entry(record.partition).or_default().push(record);
    }
    grouped
}

fn max_offsets<R: SourcePosition>(records: &[R]) -> BTreeMap<u32, i64> {
    let mut offsets = BTreeMap::new();
    for record in records {
        offsets
            .entry(record.partition())
            .and_modify(|offset: &mut i64| *offset = (*offset).max(record.offset()))
            .or_insert(record.offset());
    }
    offsets
}
