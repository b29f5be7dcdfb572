use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use bytes::Bytes;
use futures::stream;

use super::*;
use crate::envelope::{decode, AdaptedValue};
use crate::test_utils::{CountingListener, RecordingSink, SinkEvent};

fn decoded_values<T: EventData>(sink: &RecordingSink<Envelope>) -> Vec<T> {
    let adapters = AdapterRegistry::new();
    sink.values()
        .iter()
        .map(|envelope| {
            T::from_value(decode(envelope, &adapters).unwrap()).unwrap()
        })
        .collect()
}

#[test]
fn test_send_delivers_encoded_values() {
    let controller = EventController::<i32>::new();
    let surface = controller.surface();
    let sink = RecordingSink::new();
    surface.subscribe(sink.clone()).unwrap();

    controller.send(1).unwrap();
    controller.send(2).unwrap();

    assert_eq!(decoded_values::<i32>(&sink), vec![1, 2]);
    assert_eq!(controller.last_value(), Some(2));
}

#[test]
fn test_late_subscriber_gets_replay_then_completion() {
    // Values sent and completed before any consumer exists.
    let controller = EventController::<i32>::new();
    controller.send(7).unwrap();
    controller.send(9).unwrap();
    controller.complete().unwrap();

    let sink = RecordingSink::new();
    controller.surface().subscribe(sink.clone()).unwrap();

    assert_eq!(decoded_values::<i32>(&sink), vec![9]);
    assert_eq!(sink.completed_count(), 1);
}

#[test]
fn test_late_subscriber_gets_replay_then_failure() {
    let controller = EventController::<i32>::new();
    controller.send(3).unwrap();
    controller
        .fail(EventError::Stream("gone".to_string()))
        .unwrap();

    let sink = RecordingSink::new();
    controller.surface().subscribe(sink.clone()).unwrap();

    assert_eq!(decoded_values::<i32>(&sink), vec![3]);
    assert_eq!(
        sink.errors(),
        vec![EventError::Stream("gone".to_string())]
    );
    assert_eq!(
        controller.last_error(),
        Some(EventError::Stream("gone".to_string()))
    );
}

#[test]
fn test_send_after_complete_is_noop() {
    let controller = EventController::<i32>::new();
    let sink = RecordingSink::new();
    controller.surface().subscribe(sink.clone()).unwrap();

    controller.send(1).unwrap();
    controller.complete().unwrap();
    controller.send(2).unwrap();

    assert_eq!(decoded_values::<i32>(&sink), vec![1]);
    assert_eq!(controller.last_value(), Some(1));
}

#[test]
fn test_terminal_calls_are_idempotent() {
    let controller = EventController::<i32>::new();
    let sink = RecordingSink::new();
    controller.surface().subscribe(sink.clone()).unwrap();

    controller.complete().unwrap();
    controller.complete().unwrap();
    controller
        .fail(EventError::Stream("late".to_string()))
        .unwrap();

    assert_eq!(sink.completed_count(), 1);
    assert!(sink.errors().is_empty());
}

#[test]
fn test_dedup_last_drops_equal_consecutive_sends() {
    let controller = EventController::<i32>::new();
    controller.set_dedup_last(true);
    let sink = RecordingSink::new();
    controller.surface().subscribe(sink.clone()).unwrap();

    controller.send(5).unwrap();
    controller.send(5).unwrap();
    controller.send(6).unwrap();
    controller.send(5).unwrap();

    assert_eq!(decoded_values::<i32>(&sink), vec![5, 6, 5]);
}

#[test]
fn test_unsupported_type_is_rejected_without_state_change() {
    // No codec registered for this adapted type: strict rejection.
    let controller = EventController::<AdaptedValue>::new();
    let value = AdaptedValue {
        type_id: "unregistered.Type".to_string(),
        payload: Bytes::from_static(b"x"),
    };

    let error = controller.send(value).unwrap_err();
    assert_eq!(
        error,
        EventError::UnsupportedType("unregistered.Type".to_string())
    );
    assert_eq!(controller.last_value(), None);
    assert!(!controller.is_completed());
}

#[test]
fn test_close_is_terminal_and_irreversible() {
    let controller = EventController::<i32>::new();
    let listener = CountingListener::new();
    controller.set_listener(listener.clone());

    let surface = controller.surface();
    let sink = RecordingSink::new();
    surface.subscribe(sink.clone()).unwrap();

    controller.close();
    controller.close();

    assert_eq!(listener.closed_count(), 1);
    assert_eq!(controller.send(1), Err(EventError::Closed));
    assert_eq!(controller.complete(), Err(EventError::Closed));
    assert_eq!(
        surface.subscribe(RecordingSink::new()).unwrap_err(),
        EventError::Closed
    );
    // Detached without any terminal signal.
    assert_eq!(sink.events(), Vec::<SinkEvent<Envelope>>::new());
}

#[test]
fn test_listener_fires_on_first_and_last_consumer() {
    let controller = EventController::<i32>::new();
    let listener = CountingListener::new();
    controller.set_listener(listener.clone());
    let surface = controller.surface();

    let first = surface.subscribe(RecordingSink::new()).unwrap();
    let second = surface.subscribe(RecordingSink::new()).unwrap();
    assert_eq!(listener.subscribed_count(), 1);

    surface.unsubscribe(first);
    assert_eq!(listener.unsubscribed_count(), 0);
    surface.unsubscribe(second);
    assert_eq!(listener.unsubscribed_count(), 1);
    assert!(!surface.has_consumers());
}

#[tokio::test]
async fn test_source_starts_on_first_consumer() {
    let controller =
        EventController::with_source(|| stream::iter([Ok(1i32), Ok(2), Ok(3)]));
    let sink = RecordingSink::new();
    assert!(!controller.is_completed());

    controller.surface().subscribe(sink.clone()).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(decoded_values::<i32>(&sink), vec![1, 2, 3]);
    assert_eq!(sink.completed_count(), 1);
    assert!(controller.is_completed());
}

#[tokio::test]
async fn test_source_failure_fails_stream() {
    let controller = EventController::with_source(|| {
        stream::iter([Ok(1i32), Err(EventError::Stream("source died".to_string()))])
    });
    let sink = RecordingSink::new();
    controller.surface().subscribe(sink.clone()).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(decoded_values::<i32>(&sink), vec![1]);
    assert_eq!(
        sink.errors(),
        vec![EventError::Stream("source died".to_string())]
    );
}

#[tokio::test]
async fn test_source_restarts_per_first_consumer_transition() {
    let starts = Arc::new(AtomicUsize::new(0));
    let controller = {
        let starts = starts.clone();
        EventController::<i32>::with_source(move || {
            starts.fetch_add(1, Ordering::SeqCst);
            stream::pending()
        })
    };
    let surface = controller.surface();

    let first = surface.subscribe(RecordingSink::new()).unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(starts.load(Ordering::SeqCst), 1);

    surface.unsubscribe(first);
    tokio::time::sleep(Duration::from_millis(20)).await;

    surface.subscribe(RecordingSink::new()).unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(starts.load(Ordering::SeqCst), 2);
}
