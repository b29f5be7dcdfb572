//! Test utilities and mock implementations.
//!
//! Recording sinks and listeners for asserting delivery order and
//! lifecycle transitions without a real transport.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::channel::EventSink;
use crate::controller::ControllerListener;
use crate::error::EventError;
use crate::proxy::DataListener;

/// One observed delivery.
#[derive(Debug, Clone, PartialEq)]
pub enum SinkEvent<T> {
    Value(T),
    Completed,
    Error(EventError),
}

/// Sink recording every delivery in order.
#[derive(Default)]
pub struct RecordingSink<T> {
    events: Mutex<Vec<SinkEvent<T>>>,
}

impl<T: Clone> RecordingSink<T> {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            events: Mutex::new(Vec::new()),
        })
    }

    fn lock_events(&self) -> MutexGuard<'_, Vec<SinkEvent<T>>> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Everything observed so far, in delivery order.
    pub fn events(&self) -> Vec<SinkEvent<T>> {
        self.lock_events().clone()
    }

    /// The values observed so far, without terminal signals.
    pub fn values(&self) -> Vec<T> {
        self.lock_events()
            .iter()
            .filter_map(|event| match event {
                SinkEvent::Value(value) => Some(value.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn completed_count(&self) -> usize {
        self.lock_events()
            .iter()
            .filter(|event| matches!(event, SinkEvent::Completed))
            .count()
    }

    pub fn errors(&self) -> Vec<EventError> {
        self.lock_events()
            .iter()
            .filter_map(|event| match event {
                SinkEvent::Error(error) => Some(error.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn is_terminated(&self) -> bool {
        self.lock_events()
            .iter()
            .any(|event| !matches!(event, SinkEvent::Value(_)))
    }
}

impl<T: Clone + Send + Sync> EventSink<T> for RecordingSink<T> {
    fn on_event(&self, value: T) {
        self.lock_events().push(SinkEvent::Value(value));
    }

    fn on_completed(&self) {
        self.lock_events().push(SinkEvent::Completed);
    }

    fn on_error(&self, error: EventError) {
        self.lock_events().push(SinkEvent::Error(error));
    }
}

/// Sink counting value deliveries.
#[derive(Default)]
pub struct CountingSink {
    count: Arc<AtomicUsize>,
}

impl CountingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared counter incremented per value delivery.
    pub fn count(&self) -> Arc<AtomicUsize> {
        self.count.clone()
    }
}

impl<T: Send + Sync> EventSink<T> for CountingSink {
    fn on_event(&self, _value: T) {
        self.count.fetch_add(1, Ordering::SeqCst);
    }

    fn on_completed(&self) {}

    fn on_error(&self, _error: EventError) {}
}

/// Controller listener counting lifecycle transitions.
#[derive(Default)]
pub struct CountingListener {
    pub subscribed: AtomicUsize,
    pub unsubscribed: AtomicUsize,
    pub closed: AtomicUsize,
}

impl CountingListener {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn subscribed_count(&self) -> usize {
        self.subscribed.load(Ordering::SeqCst)
    }

    pub fn unsubscribed_count(&self) -> usize {
        self.unsubscribed.load(Ordering::SeqCst)
    }

    pub fn closed_count(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }
}

impl ControllerListener for CountingListener {
    fn on_subscribed(&self) {
        self.subscribed.fetch_add(1, Ordering::SeqCst);
    }

    fn on_unsubscribed(&self) {
        self.unsubscribed.fetch_add(1, Ordering::SeqCst);
    }

    fn on_closed(&self) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}

/// Data listener recording every observed value.
#[derive(Default)]
pub struct RecordingListener<T> {
    values: Mutex<Vec<T>>,
}

impl<T: Clone> RecordingListener<T> {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            values: Mutex::new(Vec::new()),
        })
    }

    pub fn values(&self) -> Vec<T> {
        self.values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl<T: Clone + Send + Sync> DataListener<T> for RecordingListener<T> {
    fn on_data(&self, value: &T) {
        self.values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(value.clone());
    }
}
