//! Consumer-side proxy mirroring a remote event stream.
//!
//! A [`RemoteChannelHandle`] lazily opens a subscription through the
//! transport, decodes incoming envelopes, tracks the latest value for
//! synchronous reads, republishes into a local dispatcher for any number
//! of local subscribers, and runs the death-detection/reconnect state
//! machine when the remote endpoint goes away.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use async_trait::async_trait;
use tokio::sync::{Mutex as AsyncMutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::channel::{EventChannel, EventStream, UNBOUNDED_CREDITS};
use crate::config::ProxyConfig;
use crate::envelope::{decode, AdapterRegistry, Envelope, EventData};
use crate::error::{EventError, Result};
use crate::transport::{
    DeathWatchId, DeathWatcher, SubscriptionEvents, SubscriptionToken, Transport, TransportHandle,
};


/// Connection lifecycle of a proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No remote subscription has been requested yet.
    Unopened,
    /// A subscription request is in flight.
    Subscribing,
    /// Subscribed and receiving deliveries.
    Active,
    /// The endpoint died; a reconnect attempt is scheduled or running.
    Reconnecting,
    /// The endpoint died and no reconnect succeeded or was configured.
    Disconnected,
    /// Explicitly closed. Terminal.
    Closed,
}

/// Callback observing every decoded value, for callers that want a push
/// notification instead of a stream.
pub trait DataListener<T>: Send + Sync {
    fn on_data(&self, value: &T);
}

/// Supplies a fresh endpoint handle after the previous one died.
///
/// Invoked once per death event, after the configured delay. Returning
/// `None` leaves the proxy disconnected.
#[async_trait]
pub trait ReconnectStrategy: Send + Sync {
    async fn reconnect(&self) -> Option<TransportHandle>;
}

struct Cache<T> {
    last: Option<T>,
    data_received: bool,
    terminated: bool,
    closed: bool,
}

struct Conn {
    handle: TransportHandle,
    state: ConnectionState,
    token: Option<SubscriptionToken>,
    watch: Option<DeathWatchId>,
    /// Bumped on every death and on close, invalidating in-flight
    /// reconnect attempts from earlier epochs.
    epoch: u64,
    reconnect_task: Option<JoinHandle<()>>,
}

struct ProxyShared<T: EventData> {
    transport: Arc<dyn Transport>,
    adapters: Arc<AdapterRegistry>,
    channel: Arc<EventChannel<T>>,
    cache: Mutex<Cache<T>>,
    conn: AsyncMutex<Conn>,
    /// Wakes blocked `latest(wait = true)` callers on first data,
    /// terminal, and close.
    gate: Notify,
    waiters: AtomicUsize,
    listener: Mutex<Option<Arc<dyn DataListener<T>>>>,
    strategy: Mutex<Option<Arc<dyn ReconnectStrategy>>>,
    config: ProxyConfig,
}

impl<T: EventData> ProxyShared<T> {
    fn lock_cache(&self) -> MutexGuard<'_, Cache<T>> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn current_listener(&self) -> Option<Arc<dyn DataListener<T>>> {
        self.listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn current_strategy(&self) -> Option<Arc<dyn ReconnectStrategy>> {
        self.strategy
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Decodes transport deliveries and feeds the local dispatcher.
struct ProxyEvents<T: EventData> {
    shared: Weak<ProxyShared<T>>,
}

impl<T: EventData> SubscriptionEvents for ProxyEvents<T> {
    fn on_event(&self, envelope: Envelope) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        let value = match decode(&envelope, &shared.adapters).and_then(T::from_value) {
            Ok(value) => value,
            Err(error) => {
                // Dropped without touching the cache: a failed decode must
                // not desynchronize the latest value.
                warn!(error = %error, "Dropping undecodable envelope");
                return;
            }
        };
        {
            let mut cache = shared.lock_cache();
            if cache.closed {
                return;
            }
            cache.last = Some(value.clone());
            cache.data_received = true;
        }
        shared.gate.notify_waiters();
        if let Some(listener) = shared.current_listener() {
            listener.on_data(&value);
        }
        shared.channel.publish(value);
    }

    fn on_completed(&self) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        debug!("Remote stream completed");
        shared.lock_cache().terminated = true;
        shared.gate.notify_waiters();
        shared.channel.complete();
    }

    fn on_error(&self, error: EventError) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        debug!(error = %error, "Remote stream failed");
        shared.lock_cache().terminated = true;
        shared.gate.notify_waiters();
        shared.channel.fail(error);
    }
}

struct ProxyDeathWatcher<T: EventData> {
    shared: Weak<ProxyShared<T>>,
}

impl<T: EventData> DeathWatcher for ProxyDeathWatcher<T> {
    fn on_death(&self) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        info!("Lost connection with remote endpoint");
        tokio::spawn(handle_death(shared));
    }
}

/// Proxy for a remote event stream.
///
/// Cheap to clone; clones share the subscription, cache, and local
/// dispatcher.
pub struct RemoteChannelHandle<T: EventData> {
    shared: Arc<ProxyShared<T>>,
}

impl<T: EventData> Clone for RemoteChannelHandle<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T: EventData> RemoteChannelHandle<T> {
    /// Bind a proxy to the producer endpoint behind `handle`.
    ///
    /// Nothing crosses the transport until the first `stream()` or
    /// `latest()` call.
    pub fn new(transport: Arc<dyn Transport>, handle: TransportHandle) -> Self {
        Self::with_options(
            transport,
            handle,
            Arc::new(AdapterRegistry::new()),
            ProxyConfig::default(),
        )
    }

    pub fn with_options(
        transport: Arc<dyn Transport>,
        handle: TransportHandle,
        adapters: Arc<AdapterRegistry>,
        config: ProxyConfig,
    ) -> Self {
        Self {
            shared: Arc::new(ProxyShared {
                transport,
                adapters,
                channel: Arc::new(EventChannel::new()),
                cache: Mutex::new(Cache {
                    last: None,
                    data_received: false,
                    terminated: false,
                    closed: false,
                }),
                conn: AsyncMutex::new(Conn {
                    handle,
                    state: ConnectionState::Unopened,
                    token: None,
                    watch: None,
                    epoch: 0,
                    reconnect_task: None,
                }),
                gate: Notify::new(),
                waiters: AtomicUsize::new(0),
                listener: Mutex::new(None),
                strategy: Mutex::new(None),
                config,
            }),
        }
    }

    /// Install a callback observing every decoded value.
    pub fn set_listener(&self, listener: Arc<dyn DataListener<T>>) {
        *self
            .shared
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(listener);
    }

    /// Install the strategy used to obtain a fresh endpoint after a
    /// death signal. Without one the proxy stays disconnected.
    pub fn set_reconnect_strategy(&self, strategy: Arc<dyn ReconnectStrategy>) {
        *self
            .shared
            .strategy
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(strategy);
    }

    /// Current connection lifecycle state.
    pub async fn connection_state(&self) -> ConnectionState {
        self.shared.conn.lock().await.state
    }

    /// Subscribe to the mirrored stream with unbounded demand.
    ///
    /// Opens the remote subscription on first use; a value already
    /// mirrored is replayed to the new stream before live deliveries.
    pub async fn stream(&self) -> Result<EventStream<T>> {
        self.stream_with_credits(UNBOUNDED_CREDITS).await
    }

    /// Subscribe with an explicit initial credit allowance.
    pub async fn stream_with_credits(&self, credits: u64) -> Result<EventStream<T>> {
        if self.shared.lock_cache().closed {
            return Err(EventError::Closed);
        }
        ensure_subscribed(&self.shared).await?;
        Ok(EventStream::attach(&self.shared.channel, credits))
    }

    /// Read the latest mirrored value.
    ///
    /// With `wait = true`, suspends until the first value or terminal
    /// signal arrives; returns `Ok(None)` if the stream terminated
    /// without data. With `wait = false`, returns whatever is cached.
    pub async fn latest(&self, wait: bool) -> Result<Option<T>> {
        if self.shared.lock_cache().closed {
            return Err(EventError::Closed);
        }
        ensure_subscribed(&self.shared).await?;
        if !wait {
            return Ok(self.shared.lock_cache().last.clone());
        }

        self.shared.waiters.fetch_add(1, Ordering::AcqRel);
        let _guard = WaiterGuard(&self.shared.waiters);
        loop {
            let notified = self.shared.gate.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let cache = self.shared.lock_cache();
                if cache.closed {
                    return Err(EventError::Closed);
                }
                if cache.data_received || cache.terminated {
                    return Ok(cache.last.clone());
                }
            }
            notified.await;
        }
    }

    /// Close the proxy: cancel any pending reconnect, tear down the
    /// remote subscription, and detach local subscribers without a
    /// terminal signal. Idempotent; later operations fail with `Closed`.
    pub async fn close(&self) {
        let mut conn = self.shared.conn.lock().await;
        if conn.state == ConnectionState::Closed {
            return;
        }
        if let Some(task) = conn.reconnect_task.take() {
            task.abort();
        }
        if let Some(id) = conn.watch.take() {
            self.shared
                .transport
                .unregister_death_watch(&conn.handle, id);
        }
        if let Some(token) = conn.token.take() {
            if let Err(error) = self.shared.transport.close_subscription(token).await {
                debug!(error = %error, "Ignoring close_subscription failure");
            }
        }
        conn.state = ConnectionState::Closed;
        conn.epoch += 1;
        drop(conn);

        {
            let mut cache = self.shared.lock_cache();
            cache.closed = true;
            cache.last = None;
            cache.data_received = false;
        }
        self.shared.gate.notify_waiters();
        self.shared.channel.detach_all();
        info!("Remote channel handle closed");
    }
}

struct WaiterGuard<'a>(&'a AtomicUsize);

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Open the remote subscription if this proxy has not yet.
async fn ensure_subscribed<T: EventData>(shared: &Arc<ProxyShared<T>>) -> Result<()> {
    let mut conn = shared.conn.lock().await;
    match conn.state {
        ConnectionState::Closed => Err(EventError::Closed),
        ConnectionState::Active
        | ConnectionState::Subscribing
        | ConnectionState::Reconnecting
        | ConnectionState::Disconnected => Ok(()),
        ConnectionState::Unopened => {
            conn.state = ConnectionState::Subscribing;
            debug!(handle = %conn.handle, "Opening remote subscription");
            if conn.watch.is_none() {
                let watcher: Arc<dyn DeathWatcher> = Arc::new(ProxyDeathWatcher {
                    shared: Arc::downgrade(shared),
                });
                match shared.transport.register_death_watch(&conn.handle, watcher) {
                    Ok(id) => conn.watch = Some(id),
                    Err(error) => {
                        conn.state = ConnectionState::Unopened;
                        return Err(error);
                    }
                }
            }
            let events: Arc<dyn SubscriptionEvents> = Arc::new(ProxyEvents {
                shared: Arc::downgrade(shared),
            });
            match shared.transport.open_subscription(&conn.handle, events).await {
                Ok(token) => {
                    conn.token = Some(token);
                    conn.state = ConnectionState::Active;
                    info!(handle = %conn.handle, "Remote subscription active");
                    Ok(())
                }
                Err(error) => {
                    if let Some(id) = conn.watch.take() {
                        shared.transport.unregister_death_watch(&conn.handle, id);
                    }
                    conn.state = ConnectionState::Unopened;
                    warn!(handle = %conn.handle, error = %error, "Failed to open remote subscription");
                    Err(error)
                }
            }
        }
    }
}

/// React to a death signal: either schedule the single reconnect attempt
/// or park the proxy in `Disconnected`.
async fn handle_death<T: EventData>(shared: Arc<ProxyShared<T>>) {
    let strategy = shared.current_strategy();
    let mut conn = shared.conn.lock().await;
    if conn.state == ConnectionState::Closed {
        return;
    }
    // The dead endpoint took the subscription and the (fired) watch
    // with it.
    conn.token = None;
    conn.watch = None;
    conn.epoch += 1;
    if let Some(task) = conn.reconnect_task.take() {
        task.abort();
    }
    match strategy {
        None => {
            conn.state = ConnectionState::Disconnected;
            info!("No reconnect strategy configured; remaining disconnected");
        }
        Some(strategy) => {
            conn.state = ConnectionState::Reconnecting;
            let epoch = conn.epoch;
            let delay = shared.config.reconnect_delay();
            let task_shared = shared.clone();
            debug!(delay_ms = delay.as_millis() as u64, "Scheduling reconnect attempt");
            conn.reconnect_task = Some(tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                attempt_reconnect(task_shared, strategy, epoch).await;
            }));
        }
    }
}

/// The single reconnect attempt for one death event.
async fn attempt_reconnect<T: EventData>(
    shared: Arc<ProxyShared<T>>,
    strategy: Arc<dyn ReconnectStrategy>,
    epoch: u64,
) {
    info!("Attempting reconnection");
    let fresh = strategy.reconnect().await;
    let mut conn = shared.conn.lock().await;
    if conn.epoch != epoch || conn.state != ConnectionState::Reconnecting {
        // Closed or superseded while the strategy ran.
        return;
    }
    let Some(new_handle) = fresh else {
        warn!("Reconnect strategy yielded no endpoint; remaining disconnected");
        conn.state = ConnectionState::Disconnected;
        return;
    };

    let old = std::mem::replace(&mut conn.handle, new_handle);
    if let Err(error) = shared.transport.rebind(&old, &conn.handle).await {
        warn!(error = %error, "Rebind failed; remaining disconnected");
        conn.state = ConnectionState::Disconnected;
        return;
    }
    let watcher: Arc<dyn DeathWatcher> = Arc::new(ProxyDeathWatcher {
        shared: Arc::downgrade(&shared),
    });
    match shared.transport.register_death_watch(&conn.handle, watcher) {
        Ok(id) => conn.watch = Some(id),
        Err(error) => {
            warn!(error = %error, "Re-arming death watch failed; remaining disconnected");
            conn.state = ConnectionState::Disconnected;
            return;
        }
    }

    let interested =
        shared.channel.has_subscribers() || shared.waiters.load(Ordering::Acquire) > 0;
    if !interested {
        // Bound to the fresh endpoint; the next stream()/latest() call
        // opens the subscription.
        conn.state = ConnectionState::Unopened;
        info!("Reconnected with no local subscribers; subscription deferred");
        return;
    }
    let events: Arc<dyn SubscriptionEvents> = Arc::new(ProxyEvents {
        shared: Arc::downgrade(&shared),
    });
    match shared.transport.open_subscription(&conn.handle, events).await {
        Ok(token) => {
            conn.token = Some(token);
            conn.state = ConnectionState::Active;
            info!(handle = %conn.handle, "Reconnected and resubscribed");
        }
        Err(error) => {
            warn!(error = %error, "Resubscribe after reconnect failed");
            conn.state = ConnectionState::Disconnected;
        }
    }
}
