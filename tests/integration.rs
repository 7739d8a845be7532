//! Integration tests for the event hub.

use std::time::Duration;
use tempfile::TempDir;
use threadcast::{
    ConnectionId, EventCursor, EventHub, EventId, EventInput, HubConfig, ThreadId, UserId,
};

fn test_hub(dir: &TempDir) -> EventHub {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    EventHub::create(HubConfig {
        path: dir.path().join("hub"),
        partitions: 2,
        retry_attempts: 2,
        retry_backoff: Duration::from_millis(1),
        snapshot_interval: 0,
        ..Default::default()
    })
    .unwrap()
}

fn message(n: u64) -> EventInput {
    EventInput::json("message", &serde_json::json!({ "n": n })).unwrap()
}

const RECV_TIMEOUT: Duration = Duration::from_secs(2);

// --- Realistic Workflow Tests ---

#[test]
fn test_fresh_subscriber_gets_live_events_only() {
    let dir = TempDir::new().unwrap();
    let hub = test_hub(&dir);

    let alice = UserId::new("alice");
    let t1 = ThreadId::new("t1");
    hub.create_thread(&alice, t1.clone()).unwrap();

    let handle = hub.attach(ConnectionId::new("c1"), alice.clone());
    let recent = hub
        .subscribe(&handle.connection_id, &alice, Some(t1.clone()), None)
        .unwrap();
    assert!(recent.is_empty(), "nothing existed before subscribing");

    let ack = hub.publish(&alice, &t1, message(1)).unwrap();
    assert!(ack.accepted());

    let notification = handle.recv_timeout(RECV_TIMEOUT).unwrap();
    assert_eq!(&notification.event.event_id, ack.event_id());
    assert_eq!(notification.event.thread_id, t1);
}

#[test]
fn test_late_subscriber_catches_up_from_cursor() {
    let dir = TempDir::new().unwrap();
    let hub = test_hub(&dir);

    let alice = UserId::new("alice");
    let t1 = ThreadId::new("t1");
    hub.create_thread(&alice, t1.clone()).unwrap();

    for i in 1..=3 {
        hub.publish(
            &alice,
            &t1,
            message(i).with_event_id(EventId::new(format!("e{}", i))),
        )
        .unwrap();
    }
    hub.flush();

    let first = hub.attach(ConnectionId::new("c1"), alice.clone());
    hub.subscribe(&first.connection_id, &alice, Some(t1.clone()), None)
        .unwrap();

    // Second subscriber resumes from e1 and must see exactly e2, e3
    let second = hub.attach(ConnectionId::new("c2"), alice.clone());
    let recent = hub
        .subscribe(
            &second.connection_id,
            &alice,
            Some(t1.clone()),
            Some(EventCursor::Event(EventId::new("e1"))),
        )
        .unwrap();

    let ids: Vec<&str> = recent.iter().map(|e| e.event_id.as_str()).collect();
    assert_eq!(ids, vec!["e2", "e3"]);

    // A new publish reaches both; e1 is never re-delivered
    hub.publish(&alice, &t1, message(4).with_event_id(EventId::new("e4")))
        .unwrap();

    let to_first = first.recv_timeout(RECV_TIMEOUT).unwrap();
    assert_eq!(to_first.event.event_id, EventId::new("e4"));

    let to_second = second.recv_timeout(RECV_TIMEOUT).unwrap();
    assert_eq!(to_second.event.event_id, EventId::new("e4"));
    assert!(second.try_recv().is_err(), "no duplicate deliveries");
}

#[test]
fn test_duplicate_event_id_is_committed_once() {
    let dir = TempDir::new().unwrap();
    let hub = test_hub(&dir);

    let alice = UserId::new("alice");
    let t1 = ThreadId::new("t1");
    hub.create_thread(&alice, t1.clone()).unwrap();

    let input = message(1).with_event_id(EventId::new("X"));
    let first = hub.publish(&alice, &t1, input.clone()).unwrap();
    let second = hub.publish(&alice, &t1, input.clone()).unwrap();
    hub.flush();

    assert!(first.accepted());
    assert!(!second.accepted());

    // Re-publishing after commit is also a no-op
    let third = hub.publish(&alice, &t1, input).unwrap();
    assert!(!third.accepted());
    hub.flush();

    let stats = hub.stats().unwrap();
    assert_eq!(stats.event_count, 1);

    let metrics = hub.metrics();
    assert_eq!(metrics.events_persisted, 1);
    assert_eq!(metrics.events_duplicate, 2);
}

#[test]
fn test_subscribe_to_foreign_thread_is_rejected() {
    let dir = TempDir::new().unwrap();
    let hub = test_hub(&dir);

    let alice = UserId::new("alice");
    let bob = UserId::new("bob");
    let t1 = ThreadId::new("t1");
    hub.create_thread(&alice, t1.clone()).unwrap();

    let handle = hub.attach(ConnectionId::new("cb"), bob.clone());
    let result = hub.subscribe(&handle.connection_id, &bob, Some(t1), None);

    assert!(matches!(
        result,
        Err(threadcast::HubError::Unauthorized { .. })
    ));
    assert_eq!(hub.stats().unwrap().subscription_count, 0);
}

#[test]
fn test_publish_succeeds_after_subscriber_disconnects() {
    let dir = TempDir::new().unwrap();
    let hub = test_hub(&dir);

    let alice = UserId::new("alice");
    let t1 = ThreadId::new("t1");
    hub.create_thread(&alice, t1.clone()).unwrap();

    let gone = hub.attach(ConnectionId::new("c1"), alice.clone());
    hub.subscribe(&gone.connection_id, &alice, Some(t1.clone()), None)
        .unwrap();

    hub.disconnect(&gone.connection_id);
    hub.disconnect(&gone.connection_id); // idempotent
    drop(gone);

    let ack = hub.publish(&alice, &t1, message(4)).unwrap();
    assert!(ack.accepted());
    hub.flush();

    assert_eq!(hub.stats().unwrap().event_count, 1);
    assert_eq!(hub.stats().unwrap().subscription_count, 0);
    assert_eq!(hub.stats().unwrap().connection_count, 0);
}

#[test]
fn test_snapshot_and_events_reconstructs_current_state() {
    let dir = TempDir::new().unwrap();
    let hub = test_hub(&dir);

    let alice = UserId::new("alice");
    let t1 = ThreadId::new("t1");
    hub.create_thread(&alice, t1.clone()).unwrap();

    for i in 1..=5 {
        hub.publish(
            &alice,
            &t1,
            message(i).with_event_id(EventId::new(format!("e{}", i))),
        )
        .unwrap();
    }
    hub.flush();
    hub.compact(&t1).unwrap();

    let replay = hub
        .snapshot_and_events(
            &t1,
            &alice,
            Some(&EventCursor::Event(EventId::new("e1"))),
            usize::MAX,
        )
        .unwrap();

    let reconstructed =
        threadcast::fold_entries(replay.snapshot.state.clone(), &replay.events).unwrap();

    let current = hub.current_state(&t1, &alice).unwrap();
    assert_eq!(reconstructed, current.state);
    assert!(replay.gaps.is_empty());
}

// --- Fan-out Behavior ---

#[test]
fn test_per_thread_ordering_for_live_subscriber() {
    let dir = TempDir::new().unwrap();
    let hub = test_hub(&dir);

    let alice = UserId::new("alice");
    let t1 = ThreadId::new("t1");
    hub.create_thread(&alice, t1.clone()).unwrap();

    let handle = hub.attach(ConnectionId::new("c1"), alice.clone());
    hub.subscribe(&handle.connection_id, &alice, Some(t1.clone()), None)
        .unwrap();

    for i in 1..=50 {
        hub.publish(
            &alice,
            &t1,
            message(i).with_event_id(EventId::new(format!("e{}", i))),
        )
        .unwrap();
    }

    for i in 1..=50 {
        let notification = handle.recv_timeout(RECV_TIMEOUT).unwrap();
        assert_eq!(
            notification.event.event_id,
            EventId::new(format!("e{}", i)),
            "notifications must arrive in publish order"
        );
    }
}

#[test]
fn test_all_threads_subscription_spans_owned_threads() {
    let dir = TempDir::new().unwrap();
    let hub = test_hub(&dir);

    let alice = UserId::new("alice");
    let t1 = ThreadId::new("t1");
    let t2 = ThreadId::new("t2");
    hub.create_thread(&alice, t1.clone()).unwrap();
    hub.create_thread(&alice, t2.clone()).unwrap();

    let handle = hub.attach(ConnectionId::new("c1"), alice.clone());
    hub.subscribe(&handle.connection_id, &alice, None, None)
        .unwrap();

    hub.publish(&alice, &t1, message(1).with_event_id(EventId::new("a")))
        .unwrap();
    hub.flush();
    hub.publish(&alice, &t2, message(2).with_event_id(EventId::new("b")))
        .unwrap();
    hub.flush();

    let first = handle.recv_timeout(RECV_TIMEOUT).unwrap();
    assert_eq!(first.event.event_id, EventId::new("a"));
    let second = handle.recv_timeout(RECV_TIMEOUT).unwrap();
    assert_eq!(second.event.event_id, EventId::new("b"));
}

#[test]
fn test_broken_recipient_does_not_affect_others() {
    let dir = TempDir::new().unwrap();
    let hub = test_hub(&dir);

    let alice = UserId::new("alice");
    let t1 = ThreadId::new("t1");
    hub.create_thread(&alice, t1.clone()).unwrap();

    // Broken: receiver dropped, channel closed
    let broken = hub.attach(ConnectionId::new("cx"), alice.clone());
    hub.subscribe(&broken.connection_id, &alice, Some(t1.clone()), None)
        .unwrap();
    drop(broken);

    let healthy = hub.attach(ConnectionId::new("cy"), alice.clone());
    hub.subscribe(&healthy.connection_id, &alice, Some(t1.clone()), None)
        .unwrap();

    hub.publish(&alice, &t1, message(1).with_event_id(EventId::new("e1")))
        .unwrap();

    let notification = healthy.recv_timeout(RECV_TIMEOUT).unwrap();
    assert_eq!(notification.event.event_id, EventId::new("e1"));

    hub.flush();
    assert!(hub.metrics().delivery_failures > 0);

    // The broken recipient's subscription stays intact; it is expected to
    // catch up after reconnecting
    assert_eq!(hub.stats().unwrap().subscription_count, 2);
}

#[test]
fn test_resubscribe_updates_cursor_without_duplicating() {
    let dir = TempDir::new().unwrap();
    let hub = test_hub(&dir);

    let alice = UserId::new("alice");
    let t1 = ThreadId::new("t1");
    hub.create_thread(&alice, t1.clone()).unwrap();

    for i in 1..=2 {
        hub.publish(
            &alice,
            &t1,
            message(i).with_event_id(EventId::new(format!("e{}", i))),
        )
        .unwrap();
    }
    hub.flush();

    let handle = hub.attach(ConnectionId::new("c1"), alice.clone());
    hub.subscribe(
        &handle.connection_id,
        &alice,
        Some(t1.clone()),
        Some(EventCursor::Event(EventId::new("e1"))),
    )
    .unwrap();

    // Same (connection, filter): updated in place, not duplicated
    hub.subscribe(
        &handle.connection_id,
        &alice,
        Some(t1.clone()),
        Some(EventCursor::Event(EventId::new("e2"))),
    )
    .unwrap();

    assert_eq!(hub.stats().unwrap().subscription_count, 1);

    hub.publish(&alice, &t1, message(3).with_event_id(EventId::new("e3")))
        .unwrap();
    let notification = handle.recv_timeout(RECV_TIMEOUT).unwrap();
    assert_eq!(notification.event.event_id, EventId::new("e3"));
    assert!(handle.try_recv().is_err());
}

#[test]
fn test_hub_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("hub");
    let alice = UserId::new("alice");
    let t1 = ThreadId::new("t1");

    {
        let hub = EventHub::create(HubConfig {
            path: path.clone(),
            partitions: 2,
            retry_attempts: 2,
            retry_backoff: Duration::from_millis(1),
            snapshot_interval: 0,
            ..Default::default()
        })
        .unwrap();

        hub.create_thread(&alice, t1.clone()).unwrap();
        for i in 1..=3 {
            hub.publish(
                &alice,
                &t1,
                message(i).with_event_id(EventId::new(format!("e{}", i))),
            )
            .unwrap();
        }
        hub.flush();
    }

    {
        let hub = EventHub::open(HubConfig {
            path,
            ..Default::default()
        })
        .unwrap();

        assert_eq!(hub.stats().unwrap().event_count, 3);
        assert_eq!(hub.stats().unwrap().thread_count, 1);

        // Ownership survives; publishing continues where it left off
        let ack = hub
            .publish(&alice, &t1, message(4).with_event_id(EventId::new("e4")))
            .unwrap();
        assert!(ack.accepted());
        hub.flush();

        let replay = hub
            .snapshot_and_events(
                &t1,
                &alice,
                Some(&EventCursor::Event(EventId::new("e3"))),
                usize::MAX,
            )
            .unwrap();
        assert_eq!(replay.events.len(), 1);
        assert_eq!(replay.events[0].event.event_id, EventId::new("e4"));
    }
}
