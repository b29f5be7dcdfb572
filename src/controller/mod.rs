//! Producer-side controller for one logical event stream.
//!
//! An [`EventController`] validates and encodes outgoing values, drives the
//! dispatcher through its lifecycle, and exposes the envelope-level
//! [`ProducerSurface`] a transport calls on behalf of remote consumers.
//! A controller can also wrap a producing source stream that is started by
//! the first consumer and stopped when the last one leaves.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use futures::stream::{BoxStream, StreamExt};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::channel::{ChannelHooks, EventChannel, EventSink, SubscriptionHandle};
use crate::config::ControllerConfig;
use crate::envelope::{encode, AdapterRegistry, Envelope, EventData};
use crate::error::{EventError, Result};

#[cfg(test)]
mod tests;

/// Lifecycle callbacks for the owner of a controller.
///
/// All methods default to no-ops; implement the ones you care about.
pub trait ControllerListener: Send + Sync {
    /// The first consumer subscribed.
    ///
    /// May synchronously call back into the controller, e.g. to seed the
    /// new consumer with a value.
    fn on_subscribed(&self) {}

    /// The last consumer unsubscribed.
    ///
    /// Called from whichever thread removed the consumer, possibly from
    /// inside a `send` that evicted a backpressure violator, so it must
    /// not synchronously call back into this controller.
    fn on_unsubscribed(&self) {}

    /// The controller was closed.
    fn on_closed(&self) {}
}

/// Identifies one transport-facing consumer at a producer surface.
pub type ConsumerId = u64;

/// Envelope-level surface a transport drives on behalf of remote
/// consumers: subscribe/unsubscribe notifications and remote close.
pub trait ProducerSurface: Send + Sync {
    /// Register a consumer. Replays the last envelope and any terminal
    /// state before live deliveries, per dispatcher semantics.
    fn subscribe(&self, sink: Arc<dyn EventSink<Envelope>>) -> Result<ConsumerId>;

    /// Deregister a consumer; also the mapping for a consumer death.
    fn unsubscribe(&self, id: ConsumerId);

    /// Remote close request: tears the controller down.
    fn close(&self);

    /// Whether any transport consumer is registered.
    fn has_consumers(&self) -> bool;
}

struct ControllerState<T> {
    completed: bool,
    closed: bool,
    last_value: Option<T>,
    last_error: Option<EventError>,
}

type SourceFactory<T> = Box<dyn Fn() -> BoxStream<'static, Result<T>> + Send + Sync>;

struct SourceSlot<T> {
    factory: Option<SourceFactory<T>>,
    task: Option<JoinHandle<()>>,
}

/// Producer-side owner of a logical stream.
///
/// Values go out through [`send`](Self::send); exactly one terminal call
/// ([`complete`](Self::complete) or [`fail`](Self::fail)) ends the stream,
/// and [`close`](Self::close) irreversibly releases the controller.
pub struct EventController<T: EventData> {
    weak_self: Weak<EventController<T>>,
    state: Mutex<ControllerState<T>>,
    channel: Arc<EventChannel<Envelope>>,
    adapters: Arc<AdapterRegistry>,
    dedup_last: AtomicBool,
    listener: Mutex<Option<Arc<dyn ControllerListener>>>,
    source: Mutex<SourceSlot<T>>,
}

struct ControllerHooks<T: EventData> {
    controller: Weak<EventController<T>>,
}

impl<T: EventData> ChannelHooks for ControllerHooks<T> {
    fn on_first_subscribe(&self) {
        if let Some(controller) = self.controller.upgrade() {
            controller.handle_first_subscribe();
        }
    }

    fn on_all_unsubscribe(&self) {
        if let Some(controller) = self.controller.upgrade() {
            controller.handle_all_unsubscribe();
        }
    }
}

impl<T: EventData> EventController<T> {
    pub fn new() -> Arc<Self> {
        Self::build(
            Arc::new(AdapterRegistry::new()),
            ControllerConfig::default(),
            None,
        )
    }

    pub fn with_config(config: ControllerConfig) -> Arc<Self> {
        Self::build(Arc::new(AdapterRegistry::new()), config, None)
    }

    pub fn with_adapters(adapters: Arc<AdapterRegistry>) -> Arc<Self> {
        Self::build(adapters, ControllerConfig::default(), None)
    }

    /// Wrap a producing source. The factory is invoked on every 0→1
    /// consumer transition; the produced stream is forwarded through
    /// `send`/`fail`/`complete` and aborted when the last consumer
    /// leaves. Requires a Tokio runtime at first-subscribe time.
    pub fn with_source<S, F>(factory: F) -> Arc<Self>
    where
        S: futures::Stream<Item = Result<T>> + Send + 'static,
        F: Fn() -> S + Send + Sync + 'static,
    {
        Self::build(
            Arc::new(AdapterRegistry::new()),
            ControllerConfig::default(),
            Some(Box::new(move || factory().boxed())),
        )
    }

    fn build(
        adapters: Arc<AdapterRegistry>,
        config: ControllerConfig,
        factory: Option<SourceFactory<T>>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<Self>| Self {
            weak_self: weak.clone(),
            state: Mutex::new(ControllerState {
                completed: false,
                closed: false,
                last_value: None,
                last_error: None,
            }),
            channel: Arc::new(EventChannel::with_hooks(Arc::new(ControllerHooks {
                controller: weak.clone(),
            }))),
            adapters,
            dedup_last: AtomicBool::new(config.dedup_last),
            listener: Mutex::new(None),
            source: Mutex::new(SourceSlot {
                factory,
                task: None,
            }),
        })
    }

    fn lock_state(&self) -> MutexGuard<'_, ControllerState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_source(&self) -> MutexGuard<'_, SourceSlot<T>> {
        self.source.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn current_listener(&self) -> Option<Arc<dyn ControllerListener>> {
        self.listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Install the lifecycle listener.
    pub fn set_listener(&self, listener: Arc<dyn ControllerListener>) {
        *self.listener.lock().unwrap_or_else(PoisonError::into_inner) = Some(listener);
    }

    /// Drop a sent value when it equals the previous one. Off by default.
    pub fn set_dedup_last(&self, enabled: bool) {
        self.dedup_last.store(enabled, Ordering::Relaxed);
    }

    /// Send a value to every consumer.
    ///
    /// No-op after `complete`/`fail`; an error after `close`. A value
    /// whose adapter type has no registered codec is rejected with
    /// `UnsupportedType` without touching the cached last value.
    pub fn send(&self, value: T) -> Result<()> {
        let mut state = self.lock_state();
        if state.closed {
            return Err(EventError::Closed);
        }
        if state.completed {
            debug!("Ignoring send on completed controller");
            return Ok(());
        }
        if self.dedup_last.load(Ordering::Relaxed) {
            if let Some(last) = &state.last_value {
                if *last == value {
                    debug!("Ignoring send equal to last value");
                    return Ok(());
                }
            }
        }

        let envelope = encode(&value.clone().into_value(), &self.adapters)?;
        state.last_value = Some(value);
        // Published under the state lock: producer-side ordering comes
        // from serializing send/complete/fail here.
        self.channel.publish(envelope);
        Ok(())
    }

    /// Complete the stream. Idempotent; later `send` calls are no-ops.
    pub fn complete(&self) -> Result<()> {
        let mut state = self.lock_state();
        if state.closed {
            return Err(EventError::Closed);
        }
        if state.completed {
            return Ok(());
        }
        state.completed = true;
        self.channel.complete();
        Ok(())
    }

    /// Fail the stream. Idempotent after any terminal call.
    pub fn fail(&self, error: EventError) -> Result<()> {
        let mut state = self.lock_state();
        if state.closed {
            return Err(EventError::Closed);
        }
        if state.completed {
            return Ok(());
        }
        state.completed = true;
        state.last_error = Some(error.clone());
        self.channel.fail(error);
        Ok(())
    }

    /// Irreversibly release the controller: stop any source production,
    /// detach every transport consumer without a signal, and notify the
    /// listener. Subsequent operations fail with `Closed`.
    pub fn close(&self) {
        {
            let mut state = self.lock_state();
            if state.closed {
                return;
            }
            state.closed = true;
            state.completed = true;
        }
        self.stop_source();
        self.channel.detach_all();
        if let Some(listener) = self.current_listener() {
            listener.on_unsubscribed();
            listener.on_closed();
        }
        info!("Event controller closed");
    }

    /// The last successfully sent value, if any.
    pub fn last_value(&self) -> Option<T> {
        self.lock_state().last_value.clone()
    }

    /// The failure passed to `fail`, if any.
    pub fn last_error(&self) -> Option<EventError> {
        self.lock_state().last_error.clone()
    }

    pub fn is_completed(&self) -> bool {
        self.lock_state().completed
    }

    pub fn is_closed(&self) -> bool {
        self.lock_state().closed
    }

    /// Whether any transport consumer is currently registered.
    pub fn has_consumers(&self) -> bool {
        self.channel.has_subscribers()
    }

    /// The envelope-level surface a transport registers for this
    /// controller. The surface holds a weak reference; once the
    /// controller is dropped it reports `Closed`.
    pub fn surface(&self) -> Arc<dyn ProducerSurface> {
        Arc::new(ControllerSurface {
            controller: self.weak_self.clone(),
        })
    }

    fn handle_first_subscribe(&self) {
        debug!("First consumer subscribed");
        self.start_source();
        if let Some(listener) = self.current_listener() {
            listener.on_subscribed();
        }
    }

    fn handle_all_unsubscribe(&self) {
        debug!("All consumers unsubscribed");
        self.stop_source();
        if let Some(listener) = self.current_listener() {
            listener.on_unsubscribed();
        }
    }

    fn start_source(&self) {
        // Lock order: the state lock is never taken while holding the
        // source lock; publish paths nest them the other way around.
        if self.lock_state().completed {
            return;
        }
        let mut slot = self.lock_source();
        if slot.task.is_some() {
            return;
        }
        let Some(factory) = slot.factory.as_ref() else {
            return;
        };
        let mut stream = factory();
        let controller = self.weak_self.clone();
        debug!("Starting source production");
        slot.task = Some(tokio::spawn(async move {
            while let Some(item) = stream.next().await {
                let Some(controller) = controller.upgrade() else {
                    return;
                };
                match item {
                    Ok(value) => {
                        if controller.send(value).is_err() {
                            return;
                        }
                    }
                    Err(error) => {
                        let _ = controller.fail(error);
                        return;
                    }
                }
            }
            if let Some(controller) = controller.upgrade() {
                let _ = controller.complete();
            }
        }));
    }

    fn stop_source(&self) {
        let mut slot = self.lock_source();
        if let Some(task) = slot.task.take() {
            task.abort();
            debug!("Stopped source production");
        }
    }
}

struct ControllerSurface<T: EventData> {
    controller: Weak<EventController<T>>,
}

impl<T: EventData> ProducerSurface for ControllerSurface<T> {
    fn subscribe(&self, sink: Arc<dyn EventSink<Envelope>>) -> Result<ConsumerId> {
        let controller = self.controller.upgrade().ok_or(EventError::Closed)?;
        if controller.is_closed() {
            return Err(EventError::Closed);
        }
        let handle = controller.channel.subscribe(sink);
        Ok(handle.id())
    }

    fn unsubscribe(&self, id: ConsumerId) {
        if let Some(controller) = self.controller.upgrade() {
            controller
                .channel
                .unsubscribe(&SubscriptionHandle::from_id(id));
        }
    }

    fn close(&self) {
        if let Some(controller) = self.controller.upgrade() {
            controller.close();
        }
    }

    fn has_consumers(&self) -> bool {
        self.controller
            .upgrade()
            .map(|controller| controller.channel.has_subscribers())
            .unwrap_or(false)
    }
}
