use std::fmt::{Debug, Formatter};
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};

use futures::channel::mpsc::{UnboundedReceiver, UnboundedSender, unbounded};
use futures::{FutureExt, Stream, StreamExt};

/// Hot multicast notification channel owned by a control.
///
/// Subscribers only observe emissions that happen after they subscribed.
/// Cloning yields another handle onto the same set of subscribers.
pub struct ChangeStream<T> {
    subscribers: Arc<Mutex<Vec<UnboundedSender<T>>>>,
}

impl<T> Clone for ChangeStream<T> {
    fn clone(&self) -> Self {
        Self {
            subscribers: Arc::clone(&self.subscribers),
        }
    }
}

impl<T> Debug for ChangeStream<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeStream")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

impl<T> Default for ChangeStream<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ChangeStream<T> {
    pub fn new() -> Self {
        Self {
            subscribers: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn subscribe(&self) -> Subscription<T> {
        let (sender, receiver) = unbounded();
        self.lock().push(sender);
        Subscription { receiver }
    }

    /// Number of live subscribers. Dropped subscriptions are pruned on the
    /// next emission.
    pub fn subscriber_count(&self) -> usize {
        self.lock()
            .iter()
            .filter(|sender| !sender.is_closed())
            .count()
    }

    pub fn same_stream(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.subscribers, &other.subscribers)
    }

    fn lock(&self) -> MutexGuard<'_, Vec<UnboundedSender<T>>> {
        match self.subscribers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl<T: Clone> ChangeStream<T> {
    pub(crate) fn emit(&self, value: T) {
        self.lock()
            .retain(|sender| sender.unbounded_send(value.clone()).is_ok());
    }
}

/// Receiving end of a [`ChangeStream`]. Dropping it unsubscribes.
pub struct Subscription<T> {
    receiver: UnboundedReceiver<T>,
}

impl<T> Subscription<T> {
    /// Collects everything already emitted without waiting for more.
    pub fn drain(&mut self) -> Vec<T> {
        let mut received = Vec::new();
        while let Some(Some(value)) = self.receiver.next().now_or_never() {
            received.push(value);
        }
        received
    }
}

impl<T> Stream for Subscription<T> {
    type Item = T;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.receiver).poll_next(cx)
    }
}
