//! Transport layer abstraction for cross-process subscriptions.
//!
//! The core is transport-agnostic: a [`Transport`] moves envelopes, one-way
//! notifications, and death signals between a producer's
//! [`ProducerSurface`](crate::controller::ProducerSurface) and a consumer
//! proxy. Implementations:
//! - [`InProcessTransport`]: direct delivery inside one process, also the
//!   substrate for integration tests
//! - cross-process mechanisms supplied by host applications

use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use crate::envelope::Envelope;
use crate::error::{EventError, Result};

mod in_process;

pub use in_process::InProcessTransport;

#[cfg(test)]
mod tests;

/// Opaque handle addressing a producer endpoint reachable through a
/// transport. Handles are cheap to clone and compare; a proxy's handle is
/// replaced during reconnect.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransportHandle(Uuid);

impl TransportHandle {
    /// Mint a fresh handle. Transports hand these out when a producer
    /// surface is registered.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TransportHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TransportHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Identifies one open subscription at a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionToken(pub(crate) u64);

/// Identifies one registered death watch at a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeathWatchId(pub(crate) u64);

/// Consumer-side callbacks for one subscription.
///
/// Invoked synchronously from the transport's delivery context; they must
/// not block.
pub trait SubscriptionEvents: Send + Sync {
    /// A value envelope arrived from the producer.
    fn on_event(&self, envelope: Envelope);

    /// The producer completed the stream.
    fn on_completed(&self);

    /// The producer failed the stream.
    fn on_error(&self, error: EventError);
}

/// Callback fired when the endpoint behind a handle becomes unreachable.
pub trait DeathWatcher: Send + Sync {
    fn on_death(&self);
}

/// Process-boundary call surface consumed by controllers and proxies.
///
/// Subscription management crosses the boundary as unary calls; event
/// delivery and death signals come back as one-way notifications.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a subscription against the producer behind `handle`.
    async fn open_subscription(
        &self,
        handle: &TransportHandle,
        events: Arc<dyn SubscriptionEvents>,
    ) -> Result<SubscriptionToken>;

    /// Tear down a previously opened subscription.
    async fn close_subscription(&self, token: SubscriptionToken) -> Result<()>;

    /// Arm a death watch on an endpoint. The watcher fires at most once,
    /// when the endpoint dies; it is unregistered implicitly by firing.
    fn register_death_watch(
        &self,
        handle: &TransportHandle,
        watcher: Arc<dyn DeathWatcher>,
    ) -> Result<DeathWatchId>;

    /// Disarm a death watch that has not fired.
    fn unregister_death_watch(&self, handle: &TransportHandle, id: DeathWatchId);

    /// Point state associated with `old` at the endpoint behind `new`.
    /// Used during reconnect after `old`'s endpoint died.
    async fn rebind(&self, old: &TransportHandle, new: &TransportHandle) -> Result<()>;
}
