//! Multicast dispatcher with last-value replay.
//!
//! An [`EventChannel`] fans one logical stream out to a dynamic set of
//! subscribers with per-subscriber demand accounting. Late joiners receive
//! the last published value before anything newer; completion and failure
//! are delivered at most once to every current and future subscriber.
//!
//! Concurrency model: the subscriber set and last value live behind one
//! state mutex, held only for snapshots and pointer-sized updates. A
//! separate delivery mutex serializes the actual sink callbacks so each
//! subscriber observes values in publish order even when publishers race.
//! Hooks fire with no channel lock held.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, warn};

use crate::error::EventError;

mod stream;

pub use stream::EventStream;

#[cfg(test)]
mod tests;

/// Receiver of one subscription's deliveries.
///
/// Invoked synchronously from whichever thread published; implementations
/// must not block.
pub trait EventSink<T>: Send + Sync {
    /// A value was published.
    fn on_event(&self, value: T);

    /// The stream completed; the final delivery to this sink.
    fn on_completed(&self);

    /// The stream failed, or this subscriber violated backpressure; the
    /// final delivery to this sink.
    fn on_error(&self, error: EventError);
}

/// Lifecycle hooks fired on subscriber-set transitions.
///
/// `on_first_subscribe` fires on every 0→1 transition, before the joining
/// subscriber is delivered anything; `on_all_unsubscribe` on every explicit
/// 1→0 transition (terminal drain does not count). Hooks run with no
/// channel lock held and may call back into the channel.
pub trait ChannelHooks: Send + Sync {
    fn on_first_subscribe(&self) {}
    fn on_all_unsubscribe(&self) {}
}

struct NoHooks;

impl ChannelHooks for NoHooks {}

/// Handle identifying one subscription, used to request credits or leave.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionHandle {
    id: u64,
}

impl SubscriptionHandle {
    pub(crate) fn from_id(id: u64) -> Self {
        Self { id }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }
}

/// Credits request large enough to never run out in practice.
pub const UNBOUNDED_CREDITS: u64 = u64::MAX;

struct ChannelSubscriber<T> {
    id: u64,
    sink: Arc<dyn EventSink<T>>,
    /// Monotonically increasing demand. Saturates instead of wrapping.
    requested: AtomicU64,
    /// Deliveries consumed so far. Invariant: `produced <= requested`;
    /// a delivery that would break it becomes a backpressure violation.
    produced: AtomicU64,
    active: AtomicBool,
}

impl<T> ChannelSubscriber<T> {
    fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    fn deactivate(&self) {
        self.active.store(false, Ordering::Release);
    }

    fn add_credits(&self, n: u64) {
        let _ = self
            .requested
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |r| {
                Some(r.saturating_add(n))
            });
    }

    /// Consume one credit. Callers serialize through the delivery mutex,
    /// so load/store on `produced` is race-free.
    fn claim_credit(&self) -> Result<(), EventError> {
        let requested = self.requested.load(Ordering::Acquire);
        let produced = self.produced.load(Ordering::Acquire);
        if produced >= requested {
            return Err(EventError::BackpressureViolation {
                requested,
                produced,
            });
        }
        self.produced.store(produced + 1, Ordering::Release);
        Ok(())
    }

    fn produced_count(&self) -> u64 {
        self.produced.load(Ordering::Acquire)
    }
}

#[derive(Clone)]
enum Terminal {
    Active,
    Completed,
    Failed(EventError),
}

impl Terminal {
    fn is_active(&self) -> bool {
        matches!(self, Terminal::Active)
    }
}

struct ChannelState<T> {
    subscribers: Vec<Arc<ChannelSubscriber<T>>>,
    terminal: Terminal,
    last: Option<T>,
}

/// Concurrency-safe multicast fan-out of values, completion, and errors.
pub struct EventChannel<T> {
    state: Mutex<ChannelState<T>>,
    delivery: Mutex<()>,
    hooks: Arc<dyn ChannelHooks>,
    next_id: AtomicU64,
}

impl<T> EventChannel<T> {
    pub fn new() -> Self {
        Self::with_hooks(Arc::new(NoHooks))
    }

    pub fn with_hooks(hooks: Arc<dyn ChannelHooks>) -> Self {
        Self {
            state: Mutex::new(ChannelState {
                subscribers: Vec::new(),
                terminal: Terminal::Active,
                last: None,
            }),
            delivery: Mutex::new(()),
            hooks,
            next_id: AtomicU64::new(1),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, ChannelState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_delivery(&self) -> MutexGuard<'_, ()> {
        self.delivery.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Grant additional credits to a subscription.
    pub fn request(&self, handle: &SubscriptionHandle, n: u64) {
        let subscriber = {
            let state = self.lock_state();
            state
                .subscribers
                .iter()
                .find(|s| s.id == handle.id)
                .cloned()
        };
        if let Some(subscriber) = subscriber {
            subscriber.add_credits(n);
        }
    }

    /// Remove a subscription. Safe under concurrent publish; a delivery
    /// already in progress to this subscriber is not interrupted.
    pub fn unsubscribe(&self, handle: &SubscriptionHandle) {
        let subscriber = {
            let state = self.lock_state();
            state
                .subscribers
                .iter()
                .find(|s| s.id == handle.id)
                .cloned()
        };
        if let Some(subscriber) = subscriber {
            subscriber.deactivate();
            self.remove_subscriber(handle.id);
        }
    }

    /// Whether any live subscriber is registered.
    pub fn has_subscribers(&self) -> bool {
        !self.lock_state().subscribers.is_empty()
    }

    /// Whether a terminal signal has been accepted.
    pub fn is_terminal(&self) -> bool {
        !self.lock_state().terminal.is_active()
    }

    /// Drop every subscriber without any signal and without firing the
    /// all-unsubscribe hook. Used by close paths where subscribers must
    /// see plain unsubscribe semantics, not an error.
    pub(crate) fn detach_all(&self) {
        let detached = {
            let mut state = self.lock_state();
            std::mem::take(&mut state.subscribers)
        };
        for subscriber in detached {
            subscriber.deactivate();
        }
    }

    /// Remove a subscriber by id, firing the all-unsubscribe hook on a
    /// 1→0 transition. Must not be called while holding channel locks.
    fn remove_subscriber(&self, id: u64) {
        let emptied = {
            let mut state = self.lock_state();
            let before = state.subscribers.len();
            state.subscribers.retain(|s| s.id != id);
            state.subscribers.len() != before && state.subscribers.is_empty()
        };
        if emptied {
            self.hooks.on_all_unsubscribe();
        }
    }
}

impl<T: Clone + Send + 'static> Default for EventChannel<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + 'static> EventChannel<T> {
    /// Register a subscriber with effectively unbounded demand.
    pub fn subscribe(&self, sink: Arc<dyn EventSink<T>>) -> SubscriptionHandle {
        self.subscribe_with_credits(sink, UNBOUNDED_CREDITS)
    }

    /// Register a subscriber with an initial credit allowance.
    ///
    /// If the channel is already terminal, the subscriber is handed the
    /// last value (if any) followed by the terminal signal and is never
    /// added to the live set. Otherwise it joins the set, the
    /// first-subscribe hook fires on a 0→1 transition, and the last value
    /// is replayed unless a racing publish already delivered something
    /// newer to this subscriber.
    pub fn subscribe_with_credits(
        &self,
        sink: Arc<dyn EventSink<T>>,
        credits: u64,
    ) -> SubscriptionHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let subscriber = Arc::new(ChannelSubscriber {
            id,
            sink,
            requested: AtomicU64::new(credits),
            produced: AtomicU64::new(0),
            active: AtomicBool::new(true),
        });

        let joined = {
            let mut state = self.lock_state();
            match state.terminal.clone() {
                Terminal::Active => {
                    state.subscribers.push(subscriber.clone());
                    Ok((state.subscribers.len() == 1, state.last.clone()))
                }
                terminal => Err((terminal, state.last.clone())),
            }
        };

        match joined {
            Ok((was_empty, replay)) => {
                if was_empty {
                    self.hooks.on_first_subscribe();
                }
                if let Some(value) = replay {
                    let mut violated = false;
                    {
                        let _delivery = self.lock_delivery();
                        // Skip the replay if a racing publish already
                        // reached this subscriber with a newer value.
                        if subscriber.is_active() && subscriber.produced_count() == 0 {
                            violated = !self.deliver_value(&subscriber, value);
                        }
                    }
                    if violated {
                        self.remove_subscriber(id);
                    }
                }
            }
            Err((terminal, replay)) => {
                subscriber.deactivate();
                let _delivery = self.lock_delivery();
                if let Some(value) = replay {
                    if subscriber.claim_credit().is_ok() {
                        subscriber.sink.on_event(value);
                    }
                }
                match terminal {
                    Terminal::Completed => subscriber.sink.on_completed(),
                    Terminal::Failed(error) => subscriber.sink.on_error(error),
                    Terminal::Active => {}
                }
            }
        }

        SubscriptionHandle { id }
    }

    /// Publish a value to the current subscriber snapshot and store it as
    /// the last value for late joiners.
    ///
    /// Subscribers out of credits receive a backpressure-violation error
    /// instead of the value and are removed; others are unaffected.
    pub fn publish(&self, value: T) {
        let snapshot = {
            let mut state = self.lock_state();
            if !state.terminal.is_active() {
                debug!("Ignoring publish on terminal channel");
                return;
            }
            state.last = Some(value.clone());
            state.subscribers.clone()
        };

        let mut violated = Vec::new();
        {
            let _delivery = self.lock_delivery();
            for subscriber in &snapshot {
                if !subscriber.is_active() {
                    continue;
                }
                if !self.deliver_value(subscriber, value.clone()) {
                    violated.push(subscriber.id);
                }
            }
        }
        for id in violated {
            self.remove_subscriber(id);
        }
    }

    /// Complete the stream. Idempotent; the first terminal call wins.
    pub fn complete(&self) {
        self.terminate(Terminal::Completed);
    }

    /// Fail the stream. Idempotent; the first terminal call wins.
    pub fn fail(&self, error: EventError) {
        self.terminate(Terminal::Failed(error));
    }

    fn terminate(&self, terminal: Terminal) {
        let snapshot = {
            let mut state = self.lock_state();
            if !state.terminal.is_active() {
                return;
            }
            state.terminal = terminal.clone();
            std::mem::take(&mut state.subscribers)
        };

        let _delivery = self.lock_delivery();
        for subscriber in snapshot {
            if !subscriber.is_active() {
                continue;
            }
            subscriber.deactivate();
            match &terminal {
                Terminal::Completed => subscriber.sink.on_completed(),
                Terminal::Failed(error) => subscriber.sink.on_error(error.clone()),
                Terminal::Active => {}
            }
        }
    }

    /// The value a late joiner would be replayed, if any.
    pub fn last_value(&self) -> Option<T> {
        self.lock_state().last.clone()
    }

    /// Deliver one value under the delivery mutex. Returns `false` when
    /// the subscriber violated backpressure and must be removed; the
    /// violation error has already been delivered in that case.
    fn deliver_value(&self, subscriber: &Arc<ChannelSubscriber<T>>, value: T) -> bool {
        match subscriber.claim_credit() {
            Ok(()) => {
                subscriber.sink.on_event(value);
                true
            }
            Err(error) => {
                warn!(
                    subscriber = subscriber.id,
                    error = %error,
                    "Removing subscriber after backpressure violation"
                );
                subscriber.deactivate();
                subscriber.sink.on_error(error);
                false
            }
        }
    }
}
