//! Send path: handler, processor and replayer.

use super::harness::{
    event, tombstone, unauthenticated_event, PublishMode, TestTracker, LINK_TOPIC,
};
use crate::rebalance::PartitionAssignmentListener;
use crate::types::MessageId;
use crate::{DeliveryTrackerConfig, TrackerError};

#[tokio::test]
async fn handler_tracks_only_authenticated_records() {
    let t = TestTracker::new();
    t.tracker.rebalance().on_partitions_assigned(&[1]).unwrap();

    let batch = vec![
        event("m-1", 1, 10),
        unauthenticated_event("plain", 1, 11),
        tombstone("gone", 1, 12),
    ];
    t.tracker.handler().on_next(&batch).await.unwrap();

    assert_eq!(t.scheduler.added(), vec!["m-1"]);
    assert!(t.tracker.cache().contains_in_memory(&MessageId::from("m-1")));

    let published = t.publisher.published();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].topic, LINK_TOPIC);
    assert_eq!(published[0].key, "m-1");

    let handle = t.tracker.states().get(1).unwrap();
    let state = handle.lock();
    assert_eq!(state.read_records_from_offset(), 10);
    assert_eq!(state.process_records_from_offset(), 12);
}

#[tokio::test]
async fn handled_cursor_moves_for_batches_without_trackables() {
    let t = TestTracker::new();
    t.tracker.rebalance().on_partitions_assigned(&[2]).unwrap();

    t.tracker
        .handler()
        .on_next(&[unauthenticated_event("plain", 2, 40)])
        .await
        .unwrap();

    assert!(t.publisher.published().is_empty());
    let handle = t.tracker.states().get(2).unwrap();
    assert_eq!(handle.lock().process_records_from_offset(), 40);
    assert_eq!(handle.lock().read_records_from_offset(), crate::NO_OFFSET);
}

#[tokio::test]
async fn redelivered_batch_is_not_registered_twice() {
    let t = TestTracker::new();
    t.tracker.rebalance().on_partitions_assigned(&[1]).unwrap();
    let batch = vec![event("m-1", 1, 1), event("m-2", 1, 2)];

    t.tracker.handler().on_next(&batch).await.unwrap();
    t.tracker.handler().on_next(&batch).await.unwrap();

    assert_eq!(t.scheduler.added(), vec!["m-1", "m-2"]);
    assert_eq!(t.tracker.states().get(1).unwrap().lock().len(), 2);
}

#[tokio::test]
async fn rejected_publication_fails_the_batch() {
    let t = TestTracker::new();
    t.tracker.rebalance().on_partitions_assigned(&[1]).unwrap();
    t.publisher.set_mode(PublishMode::Reject);

    let err = t
        .tracker
        .handler()
        .on_next(&[event("m-1", 1, 5)])
        .await
        .unwrap_err();

    assert!(matches!(err, TrackerError::Publish(_)));
    // The batch stays tracked; only the processed cursor waits.
    let handle = t.tracker.states().get(1).unwrap();
    assert_eq!(handle.lock().read_records_from_offset(), 5);
    assert_eq!(handle.lock().process_records_from_offset(), crate::NO_OFFSET);
}

#[tokio::test]
async fn unacknowledged_publication_times_out() {
    let t = TestTracker::with_config(DeliveryTrackerConfig {
        outbound_batch_processing_timeout_seconds: 1,
        ..Default::default()
    });
    t.tracker.rebalance().on_partitions_assigned(&[1]).unwrap();
    t.publisher.set_mode(PublishMode::Hang);

    let err = t
        .tracker
        .handler()
        .on_next(&[event("m-1", 1, 5)])
        .await
        .unwrap_err();
    assert!(matches!(err, TrackerError::PublishTimeout(1)));
}

#[tokio::test]
async fn replay_republishes_cached_body() {
    let t = TestTracker::new();
    t.tracker.rebalance().on_partitions_assigned(&[1]).unwrap();
    t.tracker.handler().on_next(&[event("m-1", 1, 1)]).await.unwrap();

    let replayed = t
        .tracker
        .replayer()
        .replay_message(&MessageId::from("m-1"))
        .await
        .unwrap();

    assert!(replayed);
    let published = t.publisher.published();
    assert_eq!(published.len(), 2);
    assert_eq!(published[1].key, "m-1");
    assert_eq!(published[1].value, published[0].value);
}

#[tokio::test]
async fn replay_of_uncached_message_is_skipped() {
    let t = TestTracker::new();

    let replayed = t
        .tracker
        .replayer()
        .replay_message(&MessageId::from("never-sent"))
        .await
        .unwrap();

    assert!(!replayed);
    assert!(t.publisher.published().is_empty());
}

#[tokio::test]
async fn replay_reports_publish_failure() {
    let t = TestTracker::new();
    t.tracker.rebalance().on_partitions_assigned(&[1]).unwrap();
    t.tracker.handler().on_next(&[event("m-1", 1, 1)]).await.unwrap();
    t.publisher.set_mode(PublishMode::Reject);

    let result = t
        .tracker
        .replayer()
        .replay_message(&MessageId::from("m-1"))
        .await;
    assert!(matches!(result, Err(TrackerError::Publish(_))));
}

#[tokio::test]
async fn read_cursor_waits_for_the_oldest_cached_body() {
    let t = TestTracker::new();
    t.tracker.rebalance().on_partitions_assigned(&[1]).unwrap();

    let batch = vec![event("m-1", 1, 1), event("m-2", 1, 2), event("m-3", 1, 3)];
    t.tracker.handler().on_next(&batch).await.unwrap();
    let handle = t.tracker.states().get(1).unwrap();
    assert_eq!(handle.lock().read_records_from_offset(), 1);
    assert_eq!(handle.lock().process_records_from_offset(), 3);

    assert!(t.tracker.acks().on_ack(&MessageId::from("m-1")));
    t.tracker.handler().on_next(&[event("m-4", 1, 4)]).await.unwrap();
    assert_eq!(handle.lock().read_records_from_offset(), 2);
}
