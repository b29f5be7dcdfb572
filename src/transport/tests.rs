use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use super::*;
use crate::controller::EventController;
use crate::test_utils::RecordingSink;

struct CountingWatcher {
    deaths: AtomicUsize,
}

impl CountingWatcher {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            deaths: AtomicUsize::new(0),
        })
    }
}

impl DeathWatcher for CountingWatcher {
    fn on_death(&self) {
        self.deaths.fetch_add(1, Ordering::SeqCst);
    }
}

struct NullEvents;

impl SubscriptionEvents for NullEvents {
    fn on_event(&self, _envelope: Envelope) {}
    fn on_completed(&self) {}
    fn on_error(&self, _error: EventError) {}
}

#[tokio::test]
async fn test_open_subscription_against_unknown_endpoint_fails() {
    let transport = InProcessTransport::new();
    let result = transport
        .open_subscription(&TransportHandle::new(), Arc::new(NullEvents))
        .await;
    assert!(matches!(result, Err(EventError::Transport(_))));
}

#[tokio::test]
async fn test_subscription_connects_consumer_to_surface() {
    let transport = InProcessTransport::new();
    let controller = EventController::<i32>::new();
    let handle = transport.register(controller.surface());

    struct Forward {
        sink: Arc<RecordingSink<i32>>,
    }

    impl SubscriptionEvents for Forward {
        fn on_event(&self, envelope: Envelope) {
            use crate::channel::EventSink;
            use crate::envelope::{decode, AdapterRegistry, EventData};
            let value =
                i32::from_value(decode(&envelope, &AdapterRegistry::new()).unwrap()).unwrap();
            EventSink::on_event(self.sink.as_ref(), value);
        }

        fn on_completed(&self) {
            use crate::channel::EventSink;
            EventSink::<i32>::on_completed(self.sink.as_ref());
        }

        fn on_error(&self, error: EventError) {
            use crate::channel::EventSink;
            EventSink::<i32>::on_error(self.sink.as_ref(), error);
        }
    }

    let sink = RecordingSink::new();
    let token = transport
        .open_subscription(&handle, Arc::new(Forward { sink: sink.clone() }))
        .await
        .unwrap();
    assert!(controller.has_consumers());

    controller.send(5).unwrap();
    assert_eq!(sink.values(), vec![5]);

    transport.close_subscription(token).await.unwrap();
    assert!(!controller.has_consumers());
}

#[tokio::test]
async fn test_kill_fires_watchers_once_and_detaches_consumers() {
    let transport = InProcessTransport::new();
    let controller = EventController::<i32>::new();
    let handle = transport.register(controller.surface());

    let watcher = CountingWatcher::new();
    transport
        .register_death_watch(&handle, watcher.clone())
        .unwrap();
    transport
        .open_subscription(&handle, Arc::new(NullEvents))
        .await
        .unwrap();
    assert!(controller.has_consumers());
    assert!(transport.is_alive(&handle));

    transport.kill(&handle);
    transport.kill(&handle);

    assert_eq!(watcher.deaths.load(Ordering::SeqCst), 1);
    assert!(!controller.has_consumers());
    assert!(!transport.is_alive(&handle));
}

#[tokio::test]
async fn test_dead_endpoint_rejects_new_subscriptions() {
    let transport = InProcessTransport::new();
    let controller = EventController::<i32>::new();
    let handle = transport.register(controller.surface());
    transport.kill(&handle);

    let result = transport
        .open_subscription(&handle, Arc::new(NullEvents))
        .await;
    assert!(matches!(result, Err(EventError::Transport(_))));
}

#[tokio::test]
async fn test_unregistered_watcher_does_not_fire() {
    let transport = InProcessTransport::new();
    let controller = EventController::<i32>::new();
    let handle = transport.register(controller.surface());

    let watcher = CountingWatcher::new();
    let id = transport
        .register_death_watch(&handle, watcher.clone())
        .unwrap();
    transport.unregister_death_watch(&handle, id);
    transport.kill(&handle);

    assert_eq!(watcher.deaths.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_rebind_requires_live_target() {
    let transport = InProcessTransport::new();
    let controller = EventController::<i32>::new();
    let handle = transport.register(controller.surface());
    transport.kill(&handle);

    let dead = TransportHandle::new();
    assert!(matches!(
        transport.rebind(&handle, &dead).await,
        Err(EventError::Transport(_))
    ));

    let fresh_controller = EventController::<i32>::new();
    let fresh = transport.register(fresh_controller.surface());
    transport.rebind(&handle, &fresh).await.unwrap();
}
