//! Death and reconnect behavior over the in-process transport.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use farcast::config::ProxyConfig;
use farcast::controller::EventController;
use farcast::envelope::AdapterRegistry;
use farcast::proxy::{ConnectionState, ReconnectStrategy, RemoteChannelHandle};
use farcast::transport::{InProcessTransport, TransportHandle};

struct FixedStrategy {
    handle: TransportHandle,
}

#[async_trait]
impl ReconnectStrategy for FixedStrategy {
    async fn reconnect(&self) -> Option<TransportHandle> {
        Some(self.handle.clone())
    }
}

fn fast_reconnect() -> ProxyConfig {
    ProxyConfig {
        reconnect_delay_ms: 10,
    }
}

#[tokio::test]
async fn test_consumer_survives_producer_restart() {
    let transport = InProcessTransport::new();

    let first = EventController::<i32>::new();
    let first_handle = transport.register(first.surface());

    // The restarted producer the strategy will hand back.
    let second = EventController::<i32>::new();
    let second_handle = transport.register(second.surface());

    let proxy = RemoteChannelHandle::<i32>::with_options(
        transport.clone(),
        first_handle.clone(),
        Arc::new(AdapterRegistry::new()),
        fast_reconnect(),
    );
    proxy.set_reconnect_strategy(Arc::new(FixedStrategy {
        handle: second_handle,
    }));

    let mut stream = proxy.stream().await.unwrap();
    first.send(1).unwrap();
    assert_eq!(stream.recv().await, Some(Ok(1)));

    transport.kill(&first_handle);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(proxy.connection_state().await, ConnectionState::Active);

    // The existing stream keeps delivering without resubscribing.
    second.send(2).unwrap();
    second.send(3).unwrap();
    assert_eq!(stream.recv().await, Some(Ok(2)));
    assert_eq!(stream.recv().await, Some(Ok(3)));
}

#[tokio::test]
async fn test_no_strategy_leaves_consumer_stalled() {
    let transport = InProcessTransport::new();
    let controller = EventController::<i32>::new();
    let handle = transport.register(controller.surface());

    let proxy = RemoteChannelHandle::<i32>::new(transport.clone(), handle.clone());
    let mut stream = proxy.stream().await.unwrap();
    controller.send(1).unwrap();
    assert_eq!(stream.recv().await, Some(Ok(1)));

    transport.kill(&handle);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(
        proxy.connection_state().await,
        ConnectionState::Disconnected
    );

    // No terminal signal, no error: the stream simply stalls, and the
    // cached value remains readable.
    let stalled = tokio::time::timeout(Duration::from_millis(50), stream.recv()).await;
    assert!(stalled.is_err());
    assert_eq!(proxy.latest(false).await.unwrap(), Some(1));
}

#[tokio::test]
async fn test_close_during_reconnect_window_cancels_attempt() {
    let transport = InProcessTransport::new();
    let first = EventController::<i32>::new();
    let first_handle = transport.register(first.surface());
    let second = EventController::<i32>::new();
    let second_handle = transport.register(second.surface());

    let proxy = RemoteChannelHandle::<i32>::with_options(
        transport.clone(),
        first_handle.clone(),
        Arc::new(AdapterRegistry::new()),
        ProxyConfig {
            reconnect_delay_ms: 200,
        },
    );
    proxy.set_reconnect_strategy(Arc::new(FixedStrategy {
        handle: second_handle,
    }));

    let _stream = proxy.stream().await.unwrap();
    transport.kill(&first_handle);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(
        proxy.connection_state().await,
        ConnectionState::Reconnecting
    );

    proxy.close().await;
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(proxy.connection_state().await, ConnectionState::Closed);
    assert!(!second.has_consumers());
}
