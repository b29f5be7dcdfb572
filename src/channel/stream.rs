//! Pull-style subscription over an [`EventChannel`].
//!
//! An `EventStream` registers a buffering sink and exposes the deliveries
//! as a `futures::Stream`. Dropping the stream unsubscribes it.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::mpsc;

use crate::error::{EventError, Result};

use super::{EventChannel, EventSink, SubscriptionHandle};

enum StreamItem<T> {
    Value(T),
    Completed,
    Failed(EventError),
}

struct StreamSink<T> {
    tx: mpsc::UnboundedSender<StreamItem<T>>,
}

impl<T: Send> EventSink<T> for StreamSink<T> {
    fn on_event(&self, value: T) {
        let _ = self.tx.send(StreamItem::Value(value));
    }

    fn on_completed(&self) {
        let _ = self.tx.send(StreamItem::Completed);
    }

    fn on_error(&self, error: EventError) {
        let _ = self.tx.send(StreamItem::Failed(error));
    }
}

/// Buffered view of one subscription.
///
/// Yields `Ok(value)` per delivery, then either ends (completion) or
/// yields one final `Err` (stream failure or a backpressure violation by
/// this subscriber).
pub struct EventStream<T> {
    channel: Arc<EventChannel<T>>,
    handle: SubscriptionHandle,
    rx: mpsc::UnboundedReceiver<StreamItem<T>>,
    done: bool,
}

impl<T: Clone + Send + 'static> EventStream<T> {
    /// Subscribe to a channel with the given initial credits.
    pub fn attach(channel: &Arc<EventChannel<T>>, credits: u64) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = channel.subscribe_with_credits(Arc::new(StreamSink { tx }), credits);
        Self {
            channel: channel.clone(),
            handle,
            rx,
            done: false,
        }
    }

    /// Grant additional credits to this subscription.
    pub fn request(&self, n: u64) {
        self.channel.request(&self.handle, n);
    }

    /// Receive the next delivery. Returns `None` once the stream completed
    /// or was detached.
    pub async fn recv(&mut self) -> Option<Result<T>> {
        futures::future::poll_fn(|cx| Pin::new(&mut *self).poll_next(cx)).await
    }
}

impl<T: Clone + Send + 'static> Stream for EventStream<T> {
    type Item = Result<T>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }
        match this.rx.poll_recv(cx) {
            Poll::Ready(Some(StreamItem::Value(value))) => Poll::Ready(Some(Ok(value))),
            Poll::Ready(Some(StreamItem::Failed(error))) => {
                this.done = true;
                Poll::Ready(Some(Err(error)))
            }
            Poll::Ready(Some(StreamItem::Completed)) | Poll::Ready(None) => {
                this.done = true;
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<T> Drop for EventStream<T> {
    fn drop(&mut self) {
        self.channel.unsubscribe(&self.handle);
    }
}
