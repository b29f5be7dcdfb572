//! In-process transport implementation.
//!
//! Routes envelopes directly between producer surfaces and consumer
//! proxies inside one process, with no serialization boundary beyond the
//! envelope itself. Ideal for:
//! - Single-process applications
//! - Testing, including death/reconnect scenarios via [`kill`]
//!
//! [`kill`]: InProcessTransport::kill

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::channel::EventSink;
use crate::controller::{ConsumerId, ProducerSurface};
use crate::envelope::Envelope;
use crate::error::{EventError, Result};

use super::{
    DeathWatchId, DeathWatcher, SubscriptionEvents, SubscriptionToken, Transport, TransportHandle,
};

/// Bridges dispatcher deliveries onto a consumer's subscription callbacks.
struct ForwardSink {
    events: Arc<dyn SubscriptionEvents>,
}

impl EventSink<Envelope> for ForwardSink {
    fn on_event(&self, envelope: Envelope) {
        self.events.on_event(envelope);
    }

    fn on_completed(&self) {
        self.events.on_completed();
    }

    fn on_error(&self, error: EventError) {
        self.events.on_error(error);
    }
}

struct Endpoint {
    surface: Arc<dyn ProducerSurface>,
    watchers: HashMap<u64, Arc<dyn DeathWatcher>>,
}

#[derive(Default)]
struct Inner {
    endpoints: HashMap<TransportHandle, Endpoint>,
    subscriptions: HashMap<SubscriptionToken, (TransportHandle, ConsumerId)>,
}

/// Direct-delivery transport for a single process.
///
/// Producer surfaces register to obtain a [`TransportHandle`]; consumer
/// proxies subscribe against that handle. Event delivery is synchronous:
/// a producer's `send` runs the consumer callbacks inline.
#[derive(Default)]
pub struct InProcessTransport {
    inner: Mutex<Inner>,
    next_token: AtomicU64,
    next_watch: AtomicU64,
}

impl InProcessTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock_inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a producer surface, minting the handle consumers use to
    /// reach it.
    pub fn register(&self, surface: Arc<dyn ProducerSurface>) -> TransportHandle {
        let handle = TransportHandle::new();
        self.lock_inner().endpoints.insert(
            handle.clone(),
            Endpoint {
                surface,
                watchers: HashMap::new(),
            },
        );
        info!(handle = %handle, "Registered producer endpoint");
        handle
    }

    /// Simulate the death of an endpoint: its consumers are detached from
    /// the producer surface and every armed death watcher fires once. The
    /// handle rejects all further operations.
    pub fn kill(&self, handle: &TransportHandle) {
        let (endpoint, consumers) = {
            let mut inner = self.lock_inner();
            let Some(endpoint) = inner.endpoints.remove(handle) else {
                warn!(handle = %handle, "Kill on unknown endpoint");
                return;
            };
            let dead: Vec<SubscriptionToken> = inner
                .subscriptions
                .iter()
                .filter(|(_, (h, _))| h == handle)
                .map(|(token, _)| *token)
                .collect();
            let consumers: Vec<ConsumerId> = dead
                .iter()
                .filter_map(|token| inner.subscriptions.remove(token))
                .map(|(_, consumer)| consumer)
                .collect();
            (endpoint, consumers)
        };

        info!(handle = %handle, "Endpoint died");
        for consumer in consumers {
            endpoint.surface.unsubscribe(consumer);
        }
        for watcher in endpoint.watchers.into_values() {
            watcher.on_death();
        }
    }

    /// Whether an endpoint is still alive.
    pub fn is_alive(&self, handle: &TransportHandle) -> bool {
        self.lock_inner().endpoints.contains_key(handle)
    }

    fn surface_for(&self, handle: &TransportHandle) -> Result<Arc<dyn ProducerSurface>> {
        self.lock_inner()
            .endpoints
            .get(handle)
            .map(|endpoint| endpoint.surface.clone())
            .ok_or_else(|| EventError::Transport(format!("Unknown endpoint {}", handle)))
    }
}

#[async_trait]
impl Transport for InProcessTransport {
    async fn open_subscription(
        &self,
        handle: &TransportHandle,
        events: Arc<dyn SubscriptionEvents>,
    ) -> Result<SubscriptionToken> {
        let surface = self.surface_for(handle)?;
        // Subscribe outside the table lock: replay runs consumer
        // callbacks inline.
        let consumer = surface.subscribe(Arc::new(ForwardSink { events }))?;

        let mut inner = self.lock_inner();
        if !inner.endpoints.contains_key(handle) {
            // Endpoint died between lookup and registration.
            drop(inner);
            surface.unsubscribe(consumer);
            return Err(EventError::Transport(format!(
                "Endpoint {} died during subscribe",
                handle
            )));
        }
        let token = SubscriptionToken(self.next_token.fetch_add(1, Ordering::Relaxed));
        inner
            .subscriptions
            .insert(token, (handle.clone(), consumer));
        debug!(handle = %handle, consumer, "Opened subscription");
        Ok(token)
    }

    async fn close_subscription(&self, token: SubscriptionToken) -> Result<()> {
        let entry = self.lock_inner().subscriptions.remove(&token);
        let Some((handle, consumer)) = entry else {
            return Ok(());
        };
        if let Ok(surface) = self.surface_for(&handle) {
            surface.unsubscribe(consumer);
        }
        debug!(handle = %handle, consumer, "Closed subscription");
        Ok(())
    }

    fn register_death_watch(
        &self,
        handle: &TransportHandle,
        watcher: Arc<dyn DeathWatcher>,
    ) -> Result<DeathWatchId> {
        let mut inner = self.lock_inner();
        let endpoint = inner
            .endpoints
            .get_mut(handle)
            .ok_or_else(|| EventError::Transport(format!("Unknown endpoint {}", handle)))?;
        let id = DeathWatchId(self.next_watch.fetch_add(1, Ordering::Relaxed));
        endpoint.watchers.insert(id.0, watcher);
        Ok(id)
    }

    fn unregister_death_watch(&self, handle: &TransportHandle, id: DeathWatchId) {
        let mut inner = self.lock_inner();
        if let Some(endpoint) = inner.endpoints.get_mut(handle) {
            endpoint.watchers.remove(&id.0);
        }
    }

    async fn rebind(&self, old: &TransportHandle, new: &TransportHandle) -> Result<()> {
        let mut inner = self.lock_inner();
        if !inner.endpoints.contains_key(new) {
            return Err(EventError::Transport(format!(
                "Rebind target {} is not registered",
                new
            )));
        }
        // Migrate any watchers still armed on the old handle; with the
        // usual death-then-rebind flow there are none left.
        let stale: Vec<(u64, Arc<dyn DeathWatcher>)> = inner
            .endpoints
            .get_mut(old)
            .map(|endpoint| endpoint.watchers.drain().collect())
            .unwrap_or_default();
        if let Some(endpoint) = inner.endpoints.get_mut(new) {
            endpoint.watchers.extend(stale);
        }
        debug!(old = %old, new = %new, "Rebound endpoint");
        Ok(())
    }
}
