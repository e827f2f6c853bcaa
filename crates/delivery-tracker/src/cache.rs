//! Bounded cache of outbound message bodies.
//!
//! Bodies are kept in memory keyed by message id so replays do not have to go
//! back to the source log. Memory is bounded by source offset, not recency:
//! once a partition has advanced more than `maxCacheOffsetAge` offsets past the
//! last flush, every entry older than the retention window is written to the
//! state store and dropped from memory. When the total footprint exceeds
//! `maxCacheSizeMegabytes`, each partition additionally spills the older half
//! of its entries.
//!
//! After a flush the cache reports the lowest offset still held in memory for
//! the partition, so the read cursor never falls behind what is retrievable.

use crate::health::HealthIndicator;
use crate::store::{State, StateStore};
use crate::types::{MessageId, MessageRecord};
use dashmap::{DashMap, DashSet};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, warn};
use tracker_config::DeliveryTrackerConfig;

pub const MESSAGE_KEY_PREFIX: &str = "delivery-tracker:message:";

/// Durable deletes attempted by [`DataMessageCache::remove`] before giving up.
pub const MAX_DELETE_ATTEMPTS: u32 = 3;

/// Store key of a cached body.
pub fn message_key(message_id: &MessageId) -> String {
    format!("{MESSAGE_KEY_PREFIX}{message_id}")
}

/// Receives the lowest offset each partition still needs to be read from.
pub trait OffsetsListener: Send + Sync {
    fn offsets_to_read_from_changed(&self, offsets: &[(u32, i64)]);
}

/// Whether a durable delete is known to have happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeletionStatus {
    Confirmed,
    /// Retries ran out. The key stays hidden from [`DataMessageCache::get`].
    Unconfirmed,
}

/// Result of [`DataMessageCache::remove`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoveOutcome {
    /// The removed body, from memory or from the store.
    pub entry: Option<MessageRecord>,
    pub status: DeletionStatus,
}

#[derive(Debug)]
struct CachedEntry {
    record: MessageRecord,
    size: usize,
}

#[derive(Debug, Default)]
struct PartitionIndex {
    by_offset: BTreeMap<i64, HashSet<MessageId>>,
    latest: Option<i64>,
    last_flush: Option<i64>,
}

impl PartitionIndex {
    fn insert(&mut self, offset: i64, message_id: MessageId) {
        self.by_offset.entry(offset).or_default().insert(message_id);
        self.latest = Some(self.latest.map_or(offset, |latest| latest.max(offset)));
        if self.last_flush.is_none() {
            self.last_flush = Some(offset);
        }
    }

    fn remove(&mut self, offset: i64, message_id: &MessageId) {
        if let Some(ids) = self.by_offset.get_mut(&offset) {
            ids.remove(message_id);
            if ids.is_empty() {
                self.by_offset.remove(&offset);
            }
        }
    }

    fn len(&self) -> usize {
        self.by_offset.values().map(HashSet::len).sum()
    }

    /// Ids strictly below `offset`, in offset order.
    fn older_than(&self, offset: i64) -> Vec<MessageId> {
        self.by_offset
            .range(..offset)
            .flat_map(|(_, ids)| ids.iter().cloned())
            .collect()
    }

    /// The first `count` ids in offset order.
    fn oldest(&self, count: usize) -> Vec<MessageId> {
        self.by_offset
            .values()
            .flat_map(|ids| ids.iter().cloned())
            .take(count)
            .collect()
    }

    /// Lowest offset still in memory, or just past the newest one when empty.
    fn min_live_offset(&self) -> Option<i64> {
        match self.by_offset.keys().next() {
            Some(offset) => Some(*offset),
            None => self.latest.map(|latest| latest + 1),
        }
    }
}

/// Message body cache with offset-age overflow to a [`StateStore`].
pub struct DataMessageCache {
    store: Arc<dyn StateStore>,
    config: watch::Receiver<DeliveryTrackerConfig>,
    health: HealthIndicator,
    entries: DashMap<MessageId, CachedEntry>,
    partitions: Mutex<HashMap<u32, PartitionIndex>>,
    removed: DashSet<MessageId>,
    size: AtomicUsize,
    listener: Option<Arc<dyn OffsetsListener>>,
}

impl DataMessageCache {
    pub fn new(
        store: Arc<dyn StateStore>,
        config: watch::Receiver<DeliveryTrackerConfig>,
        health: HealthIndicator,
    ) -> Self {
        Self {
            store,
            config,
            health,
            entries: DashMap::new(),
            partitions: Mutex::new(HashMap::new()),
            removed: DashSet::new(),
            size: AtomicUsize::new(0),
            listener: None,
        }
    }

    /// Report flushes to `listener`.
    pub fn with_offsets_listener(mut self, listener: Arc<dyn OffsetsListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Number of bodies held in memory.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Estimated bytes held in memory.
    pub fn size_bytes(&self) -> usize {
        self.size.load(Ordering::Relaxed)
    }

    pub fn contains_in_memory(&self, message_id: &MessageId) -> bool {
        self.entries.contains_key(message_id)
    }

    /// Lowest offset per partition whose body is held only in memory.
    ///
    /// Partitions with nothing in memory are absent.
    pub fn lowest_cached_offsets(&self) -> HashMap<u32, i64> {
        self.partitions
            .lock()
            .iter()
            .filter_map(|(partition, index)| {
                index
                    .by_offset
                    .keys()
                    .next()
                    .map(|offset| (*partition, *offset))
            })
            .collect()
    }

    /// Insert or overwrite bodies, then flush whatever fell out of the window.
    pub fn put(&self, records: &[MessageRecord]) {
        if records.is_empty() {
            return;
        }
        let config = self.config.borrow().clone();
        let mut partitions = self.partitions.lock();
        let mut touched = HashSet::new();

        for record in records {
            let message_id = record.message_id().clone();
            self.removed.remove(&message_id);

            let size = record.message.estimated_size();
            let previous = self.entries.insert(
                message_id.clone(),
                CachedEntry {
                    record: record.clone(),
                    size,
                },
            );
            if let Some(previous) = previous {
                self.size.fetch_sub(previous.size, Ordering::Relaxed);
                if let Some(index) = partitions.get_mut(&previous.record.partition) {
                    index.remove(previous.record.offset, &message_id);
                }
            }
            self.size.fetch_add(size, Ordering::Relaxed);

            partitions
                .entry(record.partition)
                .or_default()
                .insert(record.offset, message_id);
            touched.insert(record.partition);
        }

        let mut to_flush: HashMap<u32, Vec<MessageId>> = HashMap::new();
        for partition in &touched {
            let Some(index) = partitions.get_mut(partition) else {
                continue;
            };
            let (Some(latest), Some(last_flush)) = (index.latest, index.last_flush) else {
                continue;
            };
            if latest - last_flush > config.max_cache_offset_age {
                index.last_flush = Some(latest);
                let stale = index.older_than(latest - config.max_cache_offset_age);
                if !stale.is_empty() {
                    to_flush.insert(*partition, stale);
                }
            }
        }

        if self.size_bytes() > config.max_cache_size_bytes() {
            debug!(
                size_bytes = self.size_bytes(),
                limit_bytes = config.max_cache_size_bytes(),
                "message cache over size budget"
            );
            for (partition, index) in partitions.iter() {
                let spill = index.oldest(index.len().div_ceil(2));
                let ids = to_flush.entry(*partition).or_default();
                for message_id in spill {
                    if !ids.contains(&message_id) {
                        ids.push(message_id);
                    }
                }
            }
        }

        let mut changed = Vec::new();
        for (partition, ids) in to_flush {
            if ids.is_empty() {
                continue;
            }
            if self.flush(partition, &ids, &mut partitions) {
                if let Some(offset) = partitions.get(&partition).and_then(PartitionIndex::min_live_offset) {
                    changed.push((partition, offset));
                }
            }
        }
        drop(partitions);

        if let Some(listener) = &self.listener {
            if !changed.is_empty() {
                changed.sort_unstable();
                listener.offsets_to_read_from_changed(&changed);
            }
        }
    }

    /// Write `ids` durably and evict them. Returns false when the write failed;
    /// the entries then stay in memory.
    fn flush(
        &self,
        partition: u32,
        ids: &[MessageId],
        partitions: &mut HashMap<u32, PartitionIndex>,
    ) -> bool {
        let mut states = Vec::with_capacity(ids.len());
        for message_id in ids {
            let Some(entry) = self.entries.get(message_id) else {
                continue;
            };
            match serde_json::to_vec(&entry.record) {
                Ok(value) => states.push(State::new(message_key(message_id), value)),
                Err(e) => warn!(message_id = %message_id, error = %e, "failed to encode cached message"),
            }
        }

        match self.store.create(states) {
            Ok(existing) => {
                if !existing.is_empty() {
                    debug!(partition, keys = existing.len(), "cached messages already stored");
                }
            }
            Err(e) => {
                self.health
                    .set_error(format!("failed to persist cached messages of partition {partition}: {e}"));
                return false;
            }
        }

        for message_id in ids {
            if let Some((_, entry)) = self.entries.remove(message_id) {
                self.size.fetch_sub(entry.size, Ordering::Relaxed);
                if let Some(index) = partitions.get_mut(&partition) {
                    index.remove(entry.record.offset, message_id);
                }
            }
        }
        debug!(partition, evicted = ids.len(), "flushed cached messages");
        true
    }

    /// Look a body up in memory, then in the store.
    ///
    /// Misses and read failures both return `None`.
    pub fn get(&self, message_id: &MessageId) -> Option<MessageRecord> {
        if self.removed.contains(message_id) {
            self.clear_tombstone_if_gone(message_id);
            return None;
        }
        if let Some(entry) = self.entries.get(message_id) {
            return Some(entry.record.clone());
        }

        let key = message_key(message_id);
        let stored = match self.store.get(std::slice::from_ref(&key)) {
            Ok(mut states) => states.remove(&key)?,
            Err(e) => {
                warn!(message_id = %message_id, error = %e, "failed to read cached message");
                return None;
            }
        };
        match serde_json::from_slice(&stored.value) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!(message_id = %message_id, error = %e, "failed to decode cached message");
                None
            }
        }
    }

    /// Number of ids hidden after a delete that could not be confirmed.
    pub fn tombstones(&self) -> usize {
        self.removed.len()
    }

    /// Forget the tombstone of `message_id` once the store no longer holds it.
    fn clear_tombstone_if_gone(&self, message_id: &MessageId) {
        let key = message_key(message_id);
        match self.store.get(std::slice::from_ref(&key)) {
            Ok(states) if !states.contains_key(&key) => {
                self.removed.remove(message_id);
                debug!(message_id = %message_id, "cached message deletion confirmed");
            }
            Ok(_) => {}
            Err(e) => {
                debug!(message_id = %message_id, error = %e, "failed to recheck deleted message");
            }
        }
    }

    /// Drop a body from memory and from the store.
    pub fn remove(&self, message_id: &MessageId) -> RemoveOutcome {
        let mut entry = None;
        if let Some((_, cached)) = self.entries.remove(message_id) {
            self.size.fetch_sub(cached.size, Ordering::Relaxed);
            if let Some(index) = self.partitions.lock().get_mut(&cached.record.partition) {
                index.remove(cached.record.offset, message_id);
            }
            entry = Some(cached.record);
        }
        self.removed.insert(message_id.clone());

        let key = message_key(message_id);
        for attempt in 1..=MAX_DELETE_ATTEMPTS {
            let current = match self.store.get(std::slice::from_ref(&key)) {
                Ok(mut states) => states.remove(&key),
                Err(e) => {
                    warn!(message_id = %message_id, attempt, error = %e, "failed to read cached message for deletion");
                    continue;
                }
            };
            let Some(current) = current else {
                self.removed.remove(message_id);
                return RemoveOutcome {
                    entry,
                    status: DeletionStatus::Confirmed,
                };
            };
            if entry.is_none() {
                entry = serde_json::from_slice(&current.value).ok();
            }

            match self.store.delete(vec![current]) {
                Ok(failures) if failures.is_empty() => {
                    self.removed.remove(message_id);
                    return RemoveOutcome {
                        entry,
                        status: DeletionStatus::Confirmed,
                    };
                }
                Ok(_) => {
                    debug!(message_id = %message_id, attempt, "cached message changed during deletion");
                }
                Err(e) => {
                    warn!(message_id = %message_id, attempt, error = %e, "failed to delete cached message");
                }
            }
        }

        warn!(message_id = %message_id, "could not confirm deletion of cached message");
        RemoveOutcome {
            entry,
            status: DeletionStatus::Unconfirmed,
        }
    }
}
