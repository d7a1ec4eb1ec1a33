use std::time::Duration;

use super::pool::ConsumeOptions;
use super::tracker::DeliveryTracker;
use crate::config::ConsumerSettings;

#[test]
fn test_tracker_ack_happy_path() {
    let mut tracker = DeliveryTracker::new(1);
    let epoch = tracker.track(7);
    assert_eq!(epoch, 1);
    assert_eq!(tracker.pending(), 1);

    tracker.begin_ack(7, epoch).expect("first ack must be allowed");
    tracker.complete_ack(7);
    assert_eq!(tracker.pending(), 0);
}

#[test]
fn test_tracker_rejects_double_ack() {
    let mut tracker = DeliveryTracker::new(1);
    let epoch = tracker.track(7);

    tracker.begin_ack(7, epoch).unwrap();
    // Second claim for the same tag must fail whether or not the first
    // completed yet.
    assert!(tracker.begin_ack(7, epoch).is_err());
    tracker.complete_ack(7);
    assert!(tracker.begin_ack(7, epoch).is_err());
}

#[test]
fn test_tracker_rejects_unknown_tag() {
    let mut tracker = DeliveryTracker::new(1);
    let err = tracker.begin_ack(99, 1).unwrap_err();
    assert_eq!(err.tag, 99);
}

#[test]
fn test_tracker_rejects_stale_epoch() {
    let mut tracker = DeliveryTracker::new(1);
    let old_epoch = tracker.track(7);

    // Recovery: the channel epoch moves on and the books are wiped.
    tracker.discard_all(2);
    assert_eq!(tracker.epoch(), 2);
    assert_eq!(tracker.pending(), 0);

    // A worker that finished late still holds the old epoch; even if the
    // new channel reuses tag 7, that ack must not go through.
    let reused = tracker.track(7);
    assert_eq!(reused, 2);
    assert!(tracker.begin_ack(7, old_epoch).is_err());

    // The new epoch's own ack is unaffected.
    tracker.begin_ack(7, 2).unwrap();
}

#[test]
fn test_consume_options_from_settings() {
    let options = ConsumeOptions::from_settings(&ConsumerSettings {
        concurrency: 4,
        max_retries: 2,
        drain_timeout_ms: 250,
    });
    assert_eq!(options.concurrency, 4);
    assert_eq!(options.max_retries, 2);
    assert_eq!(options.drain_timeout, Duration::from_millis(250));
}

#[test]
fn test_consume_options_defaults() {
    let options = ConsumeOptions::default();
    assert_eq!(options.concurrency, 1);
    assert_eq!(options.max_retries, 3);
    assert_eq!(options.drain_timeout, Duration::from_secs(5));
}
