use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures::StreamExt;

use super::*;
use crate::test_utils::{RecordingSink, SinkEvent};

#[test]
fn test_publish_reaches_all_subscribers() {
    let channel: EventChannel<i32> = EventChannel::new();
    let a = RecordingSink::new();
    let b = RecordingSink::new();
    channel.subscribe(a.clone());
    channel.subscribe(b.clone());

    channel.publish(1);
    channel.publish(2);

    assert_eq!(a.values(), vec![1, 2]);
    assert_eq!(b.values(), vec![1, 2]);
}

#[test]
fn test_late_join_replays_last_value() {
    let channel: EventChannel<i32> = EventChannel::new();
    channel.publish(7);
    channel.publish(9);

    let sink = RecordingSink::new();
    channel.subscribe(sink.clone());
    channel.publish(10);

    // Replay of the last value, never the older one, before live values.
    assert_eq!(sink.values(), vec![9, 10]);
}

#[test]
fn test_terminal_delivered_exactly_once() {
    let channel: EventChannel<i32> = EventChannel::new();
    let sink = RecordingSink::new();
    channel.subscribe(sink.clone());

    channel.publish(1);
    channel.complete();
    channel.complete();
    channel.publish(2);

    assert_eq!(
        sink.events(),
        vec![SinkEvent::Value(1), SinkEvent::Completed]
    );
}

#[test]
fn test_fail_then_complete_keeps_first_terminal() {
    let channel: EventChannel<i32> = EventChannel::new();
    let sink = RecordingSink::new();
    channel.subscribe(sink.clone());

    channel.fail(EventError::Stream("boom".to_string()));
    channel.complete();

    assert_eq!(
        sink.events(),
        vec![SinkEvent::Error(EventError::Stream("boom".to_string()))]
    );
}

#[test]
fn test_subscribe_after_terminal_gets_replay_then_signal() {
    let channel: EventChannel<i32> = EventChannel::new();
    channel.publish(7);
    channel.publish(9);
    channel.complete();

    let sink = RecordingSink::new();
    channel.subscribe(sink.clone());

    assert_eq!(
        sink.events(),
        vec![SinkEvent::Value(9), SinkEvent::Completed]
    );
    assert!(!channel.has_subscribers());
}

#[test]
fn test_subscribe_after_fail_gets_error() {
    let channel: EventChannel<i32> = EventChannel::new();
    channel.fail(EventError::Stream("down".to_string()));

    let sink = RecordingSink::new();
    channel.subscribe(sink.clone());
    assert_eq!(
        sink.events(),
        vec![SinkEvent::Error(EventError::Stream("down".to_string()))]
    );
}

#[test]
fn test_unsubscribe_stops_deliveries() {
    let channel: EventChannel<i32> = EventChannel::new();
    let a = RecordingSink::new();
    let b = RecordingSink::new();
    let handle_a = channel.subscribe(a.clone());
    channel.subscribe(b.clone());

    channel.publish(0);
    channel.publish(1);
    channel.publish(2);
    channel.unsubscribe(&handle_a);
    channel.publish(3);
    channel.publish(4);

    // A's departure must not affect B.
    assert_eq!(a.values(), vec![0, 1, 2]);
    assert_eq!(b.values(), vec![0, 1, 2, 3, 4]);
}

struct HookCounter {
    first: AtomicUsize,
    empty: AtomicUsize,
}

impl ChannelHooks for HookCounter {
    fn on_first_subscribe(&self) {
        self.first.fetch_add(1, Ordering::SeqCst);
    }

    fn on_all_unsubscribe(&self) {
        self.empty.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn test_hook_symmetry_across_interleavings() {
    let hooks = Arc::new(HookCounter {
        first: AtomicUsize::new(0),
        empty: AtomicUsize::new(0),
    });
    let channel: EventChannel<i32> = EventChannel::with_hooks(hooks.clone());

    let h1 = channel.subscribe(RecordingSink::new());
    let h2 = channel.subscribe(RecordingSink::new());
    channel.unsubscribe(&h1);
    channel.unsubscribe(&h2);
    let h3 = channel.subscribe(RecordingSink::new());
    channel.unsubscribe(&h3);

    assert_eq!(hooks.first.load(Ordering::SeqCst), 2);
    assert_eq!(hooks.empty.load(Ordering::SeqCst), 2);
}

#[test]
fn test_terminal_drain_does_not_fire_all_unsubscribe() {
    let hooks = Arc::new(HookCounter {
        first: AtomicUsize::new(0),
        empty: AtomicUsize::new(0),
    });
    let channel: EventChannel<i32> = EventChannel::with_hooks(hooks.clone());
    channel.subscribe(RecordingSink::new());
    channel.complete();

    assert_eq!(hooks.empty.load(Ordering::SeqCst), 0);
}

#[test]
fn test_backpressure_violation_removes_only_violator() {
    let channel: EventChannel<i32> = EventChannel::new();
    let slow = RecordingSink::new();
    let fast = RecordingSink::new();
    channel.subscribe_with_credits(slow.clone(), 2);
    channel.subscribe(fast.clone());

    channel.publish(1);
    channel.publish(2);
    channel.publish(3);
    channel.publish(4);

    assert_eq!(slow.values(), vec![1, 2]);
    assert_eq!(
        slow.errors(),
        vec![EventError::BackpressureViolation {
            requested: 2,
            produced: 2,
        }]
    );
    assert_eq!(fast.values(), vec![1, 2, 3, 4]);
    assert!(fast.errors().is_empty());
}

#[test]
fn test_request_extends_credits() {
    let channel: EventChannel<i32> = EventChannel::new();
    let sink = RecordingSink::new();
    let handle = channel.subscribe_with_credits(sink.clone(), 1);

    channel.publish(1);
    channel.request(&handle, 2);
    channel.publish(2);
    channel.publish(3);
    channel.publish(4);

    assert_eq!(sink.values(), vec![1, 2, 3]);
    assert_eq!(sink.errors().len(), 1);
}

#[test]
fn test_zero_credit_subscriber_violates_on_replay() {
    let channel: EventChannel<i32> = EventChannel::new();
    channel.publish(5);

    let sink = RecordingSink::new();
    channel.subscribe_with_credits(sink.clone(), 0);

    assert!(sink.values().is_empty());
    assert_eq!(sink.errors().len(), 1);
    assert!(!channel.has_subscribers());
}

#[test]
fn test_detach_all_sends_no_signal() {
    let channel: EventChannel<i32> = EventChannel::new();
    let sink = RecordingSink::new();
    channel.subscribe(sink.clone());
    channel.publish(1);

    channel.detach_all();
    channel.publish(2);

    assert_eq!(sink.events(), vec![SinkEvent::Value(1)]);
    assert!(!channel.has_subscribers());
}

#[test]
fn test_concurrent_publish_and_subscribe() {
    let channel: Arc<EventChannel<i32>> = Arc::new(EventChannel::new());
    let publisher = {
        let channel = channel.clone();
        std::thread::spawn(move || {
            for i in 0..200 {
                channel.publish(i);
            }
        })
    };
    let subscriber = {
        let channel = channel.clone();
        std::thread::spawn(move || {
            for _ in 0..50 {
                let sink = RecordingSink::new();
                let handle = channel.subscribe(sink.clone());
                channel.unsubscribe(&handle);
            }
        })
    };
    publisher.join().unwrap();
    subscriber.join().unwrap();

    let sink = RecordingSink::new();
    channel.subscribe(sink.clone());
    assert_eq!(sink.values(), vec![199]);
}

#[tokio::test]
async fn test_event_stream_receives_and_completes() {
    let channel: Arc<EventChannel<i32>> = Arc::new(EventChannel::new());
    let mut stream = EventStream::attach(&channel, UNBOUNDED_CREDITS);

    channel.publish(1);
    channel.publish(2);
    channel.complete();

    assert_eq!(stream.recv().await, Some(Ok(1)));
    assert_eq!(stream.recv().await, Some(Ok(2)));
    assert_eq!(stream.recv().await, None);
    assert_eq!(stream.recv().await, None);
}

#[tokio::test]
async fn test_event_stream_surfaces_failure_last() {
    let channel: Arc<EventChannel<i32>> = Arc::new(EventChannel::new());
    let mut stream = EventStream::attach(&channel, UNBOUNDED_CREDITS);

    channel.publish(1);
    channel.fail(EventError::Stream("down".to_string()));

    assert_eq!(stream.recv().await, Some(Ok(1)));
    assert_eq!(
        stream.recv().await,
        Some(Err(EventError::Stream("down".to_string())))
    );
    assert_eq!(stream.recv().await, None);
}

#[tokio::test]
async fn test_event_stream_drop_unsubscribes() {
    let channel: Arc<EventChannel<i32>> = Arc::new(EventChannel::new());
    let stream = EventStream::attach(&channel, UNBOUNDED_CREDITS);
    assert!(channel.has_subscribers());
    drop(stream);
    assert!(!channel.has_subscribers());
}

#[tokio::test]
async fn test_event_stream_as_futures_stream() {
    let channel: Arc<EventChannel<i32>> = Arc::new(EventChannel::new());
    let stream = EventStream::attach(&channel, UNBOUNDED_CREDITS);

    channel.publish(1);
    channel.publish(2);
    channel.complete();

    let collected: Vec<_> = stream.collect().await;
    assert_eq!(collected, vec![Ok(1), Ok(2)]);
}
