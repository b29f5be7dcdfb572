//! Process-wide keyed registry of shared channels.
//!
//! Lets unrelated call sites fan data into the same logical stream: the
//! first `of(key)` call creates the entry, every producer created for the
//! key mirrors the shared sends, and a late-created producer seeds its
//! first consumer with the key's cached last value. Completing or failing
//! a key tears its entry down.
//!
//! The registry itself is plain state; hosts typically hold one in a
//! `LazyLock` for process-wide use.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tracing::{debug, info, warn};

use crate::controller::{ControllerListener, EventController};
use crate::envelope::EventData;
use crate::error::{EventError, Result};


struct SharedState<T: EventData> {
    last: Option<T>,
    controllers: Vec<Arc<EventController<T>>>,
}

/// One keyed logical stream shared by any number of producers.
pub struct SharedChannel<T: EventData> {
    key: String,
    weak_self: Weak<SharedChannel<T>>,
    registry: Weak<ChannelRegistry<T>>,
    state: Mutex<SharedState<T>>,
}

impl<T: EventData> SharedChannel<T> {
    fn lock_state(&self) -> MutexGuard<'_, SharedState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The key this channel is registered under.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Cached last value sent through this key.
    pub fn last_value(&self) -> Option<T> {
        self.lock_state().last.clone()
    }

    /// Create a controller registered under this key, typically to hand
    /// its transport surface to one remote consumer.
    ///
    /// The controller replays the key's cached last value to its first
    /// consumer and removes itself from the entry when closed.
    pub fn new_producer(&self) -> Arc<EventController<T>> {
        let controller = EventController::new();
        controller.set_listener(Arc::new(SharedChannelListener {
            shared: self.weak_self.clone(),
            controller: Arc::downgrade(&controller),
        }));
        self.lock_state().controllers.push(controller.clone());
        debug!(key = %self.key, "Created producer for shared channel");
        controller
    }

    /// Send a value through every producer registered under this key and
    /// cache it for late-created producers.
    ///
    /// Individual producer failures are logged and do not stop the
    /// fan-out; the first one is returned.
    pub fn send(&self, value: T) -> Result<()> {
        let controllers = {
            let mut state = self.lock_state();
            state.last = Some(value.clone());
            state.controllers.clone()
        };
        let mut first_error = None;
        for controller in controllers {
            if let Err(error) = controller.send(value.clone()) {
                warn!(key = %self.key, error = %error, "Producer rejected shared send");
                first_error.get_or_insert(error);
            }
        }
        match first_error {
            None => Ok(()),
            Some(error) => Err(error),
        }
    }

    /// Complete every producer under this key and drop the entry.
    pub fn complete(&self) {
        for controller in self.drain() {
            let _ = controller.complete();
        }
        self.remove_entry();
    }

    /// Fail every producer under this key and drop the entry.
    pub fn fail(&self, error: EventError) {
        for controller in self.drain() {
            let _ = controller.fail(error.clone());
        }
        self.remove_entry();
    }

    fn drain(&self) -> Vec<Arc<EventController<T>>> {
        std::mem::take(&mut self.lock_state().controllers)
    }

    fn remove_entry(&self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(&self.key);
        }
    }

    fn remove_controller(&self, controller: &Weak<EventController<T>>) {
        let Some(controller) = controller.upgrade() else {
            return;
        };
        self.lock_state()
            .controllers
            .retain(|c| !Arc::ptr_eq(c, &controller));
    }
}

/// Replays the shared last value to a producer's first consumer and
/// unregisters the producer when it closes.
struct SharedChannelListener<T: EventData> {
    shared: Weak<SharedChannel<T>>,
    controller: Weak<EventController<T>>,
}

impl<T: EventData> ControllerListener for SharedChannelListener<T> {
    fn on_subscribed(&self) {
        let (Some(shared), Some(controller)) = (self.shared.upgrade(), self.controller.upgrade())
        else {
            return;
        };
        if let Some(last) = shared.last_value() {
            let _ = controller.send(last);
        }
    }

    fn on_closed(&self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.remove_controller(&self.controller);
        }
    }
}

/// Keyed table of shared channels, guarded by a single map-level lock.
pub struct ChannelRegistry<T: EventData> {
    weak_self: Weak<ChannelRegistry<T>>,
    entries: Mutex<HashMap<String, Arc<SharedChannel<T>>>>,
}

impl<T: EventData> ChannelRegistry<T> {
    pub fn new() -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            weak_self: weak.clone(),
            entries: Mutex::new(HashMap::new()),
        })
    }

    fn lock_entries(&self) -> MutexGuard<'_, HashMap<String, Arc<SharedChannel<T>>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The shared channel for `key`, created on first use.
    pub fn of(&self, key: &str) -> Arc<SharedChannel<T>> {
        let mut entries = self.lock_entries();
        if let Some(existing) = entries.get(key) {
            return existing.clone();
        }
        let shared = Arc::new_cyclic(|weak| SharedChannel {
            key: key.to_string(),
            weak_self: weak.clone(),
            registry: self.weak_self.clone(),
            state: Mutex::new(SharedState {
                last: None,
                controllers: Vec::new(),
            }),
        });
        entries.insert(key.to_string(), shared.clone());
        info!(key = %key, "Created shared channel");
        shared
    }

    /// Drop the entry for `key`. A handle obtained earlier keeps working
    /// but is no longer shared with future `of` calls.
    pub fn remove(&self, key: &str) {
        if self.lock_entries().remove(key).is_some() {
            info!(key = %key, "Removed shared channel");
        }
    }

    /// Whether an entry exists for `key`.
    pub fn contains(&self, key: &str) -> bool {
        self.lock_entries().contains_key(key)
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.lock_entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock_entries().is_empty()
    }
}
