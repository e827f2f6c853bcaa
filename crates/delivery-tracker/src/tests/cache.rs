//! Cache behaviour when the store misbehaves.

use super::harness::{message_record, TestTracker};
use crate::cache::{message_key, DeletionStatus};
use crate::store::{State, StateStore};
use crate::types::MessageId;
use crate::{DeliveryTrackerConfig, LifecycleStatus};

fn aging_config() -> DeliveryTrackerConfig {
    DeliveryTrackerConfig {
        max_cache_offset_age: 10,
        ..Default::default()
    }
}

#[test]
fn flush_failure_keeps_entries_and_escalates() {
    let t = TestTracker::with_config(aging_config());
    t.store.fail_creates(true);
    let cache = t.tracker.cache();

    cache.put(&[message_record("old", 1, 0)]);
    cache.put(&[message_record("new", 1, 20)]);

    assert!(cache.contains_in_memory(&MessageId::from("old")));
    assert!(matches!(t.tracker.health().status(), LifecycleStatus::Error(_)));
}

#[test]
fn flush_raises_the_read_cursor() {
    let t = TestTracker::with_config(aging_config());
    t.tracker.states().load_partitions(&[1]).unwrap();
    let cache = t.tracker.cache();

    cache.put(&[message_record("a", 1, 0), message_record("b", 1, 8)]);
    cache.put(&[message_record("c", 1, 15)]);

    let handle = t.tracker.states().get(1).unwrap();
    assert_eq!(handle.lock().read_records_from_offset(), 8);
    assert!(t.tracker.health().is_up());
}

#[test]
fn read_failure_is_a_miss() {
    let t = TestTracker::new();
    let flushed = message_record("a", 1, 1);
    t.store
        .create(vec![State::new(
            message_key(flushed.message_id()),
            serde_json::to_vec(&flushed).unwrap(),
        )])
        .unwrap();
    let cache = t.tracker.cache();
    assert_eq!(cache.get(&MessageId::from("a")), Some(flushed));

    t.store.fail_reads(true);
    assert!(cache.get(&MessageId::from("a")).is_none());
    assert!(t.tracker.health().is_up());
}

#[test]
fn unconfirmed_delete_still_hides_the_key() {
    let t = TestTracker::new();
    let flushed = message_record("a", 1, 1);
    t.store
        .create(vec![State::new(
            message_key(flushed.message_id()),
            serde_json::to_vec(&flushed).unwrap(),
        )])
        .unwrap();
    t.store.contend_deletes(true);

    let outcome = t.tracker.cache().remove(&MessageId::from("a"));

    assert_eq!(outcome.status, DeletionStatus::Unconfirmed);
    assert_eq!(outcome.entry, Some(flushed));
    assert!(t.tracker.cache().get(&MessageId::from("a")).is_none());
    assert_eq!(t.store.inner().len(), 1);
    assert_eq!(t.tracker.cache().tombstones(), 1);
}

#[test]
fn tombstone_clears_once_the_store_forgets_the_key() {
    let t = TestTracker::new();
    let flushed = message_record("a", 1, 1);
    let key = message_key(flushed.message_id());
    t.store
        .create(vec![State::new(key.clone(), serde_json::to_vec(&flushed).unwrap())])
        .unwrap();
    t.store.contend_deletes(true);
    let cache = t.tracker.cache();
    cache.remove(&MessageId::from("a"));
    assert_eq!(cache.tombstones(), 1);

    let stored = t.store.inner().get(&[key.clone()]).unwrap().remove(&key).unwrap();
    t.store.inner().delete(vec![stored]).unwrap();

    assert!(cache.get(&MessageId::from("a")).is_none());
    assert_eq!(cache.tombstones(), 0);
}
