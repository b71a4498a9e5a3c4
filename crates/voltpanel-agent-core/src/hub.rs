//! # EventHub: non-blocking fan-out to live observers
//!
//! Every subscriber owns a bounded queue. `publish` clones the event into each
//! queue with `try_send` and returns immediately.
//!
//! ## What it guarantees
//! - `publish` never waits on a subscriber.
//! - Per-subscriber FIFO for events that were not dropped.
//! - A subscriber only sees events published after `subscribe` returned.
//!
//! ## What it does **not** guarantee
//! - No ordering across subscribers.
//! - No retries: when a subscriber's queue is full the event is dropped for that
//!   subscriber only and its dropped-event counter is incremented.
//! - No history or replay.
//!
//! ```text
//!    publish(ev)
//!        ├──try_send──► [queue S1] ─► Subscription S1
//!        ├──try_send──► [queue S2] ─► Subscription S2   (full: dropped += 1)
//!        └──try_send──► [queue SN] ─► Subscription SN
//! ```

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::task::{Context, Poll};

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_stream::Stream;
use tracing::debug;

use crate::config::DEFAULT_SUBSCRIBER_QUEUE_CAPACITY;
use crate::event::PanelEvent;

/// Opaque registration id of a subscriber
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(u64);

struct SubscriberSlot<E> {
    sender: mpsc::Sender<E>,
    dropped: Arc<AtomicU64>,
}

struct HubInner<E> {
    subscribers: Mutex<HashMap<SubscriberId, SubscriberSlot<E>>>,
    next_id: AtomicU64,
    queue_capacity: usize,
}

impl<E> HubInner<E> {
    // A panicking publisher must not take the hub down with it.
    fn subscribers(&self) -> MutexGuard<'_, HashMap<SubscriberId, SubscriberSlot<E>>> {
        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn remove(&self, id: SubscriberId) -> bool {
        self.subscribers().remove(&id).is_some()
    }
}

/// Publish/subscribe broadcaster. Cheap to clone; clones share subscribers.
pub struct EventHub<E = PanelEvent> {
    inner: Arc<HubInner<E>>,
}

impl<E> Clone for EventHub<E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<E: Clone + Send + 'static> Default for EventHub<E> {
    fn default() -> Self {
        Self::new(DEFAULT_SUBSCRIBER_QUEUE_CAPACITY)
    }
}

impl<E: Clone + Send + 'static> EventHub<E> {
    /// Creates a hub whose subscribers each buffer up to `queue_capacity` events.
    /// The minimum capacity is 1 (clamped).
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            inner: Arc::new(HubInner {
                subscribers: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                queue_capacity: queue_capacity.max(1),
            }),
        }
    }

    /// Registers a new subscriber. Nothing published earlier is replayed.
    pub fn subscribe(&self) -> Subscription<E> {
        let id = SubscriberId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let (sender, receiver) = mpsc::channel(self.inner.queue_capacity);
        let dropped = Arc::new(AtomicU64::new(0));

        self.inner.subscribers().insert(
            id,
            SubscriberSlot {
                sender,
                dropped: Arc::clone(&dropped),
            },
        );
        debug!(subscriber = id.0, "Subscriber registered");

        Subscription {
            id,
            receiver,
            dropped,
            hub: Arc::downgrade(&self.inner),
        }
    }

    /// Removes a subscriber. Returns whether it was still registered.
    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        let removed = self.inner.remove(id);
        if removed {
            debug!(subscriber = id.0, "Subscriber removed");
        }
        removed
    }

    /// Fan-out one event to all current subscribers without blocking.
    ///
    /// Returns the number of subscribers the event was queued for.
    pub fn publish(&self, event: E) -> usize {
        let mut subscribers = self.inner.subscribers();
        let mut delivered = 0;
        let mut closed = Vec::new();

        for (id, slot) in subscribers.iter() {
            match slot.sender.try_send(event.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    let total = slot.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                    debug!(subscriber = id.0, dropped = total, "Subscriber queue full, event dropped");
                }
                Err(TrySendError::Closed(_)) => closed.push(*id),
            }
        }

        for id in closed {
            subscribers.remove(&id);
            debug!(subscriber = id.0, "Subscriber disconnected");
        }

        delivered
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers().len()
    }
}

/// Receiving end of one subscriber. Dropping it unsubscribes.
pub struct Subscription<E = PanelEvent> {
    id: SubscriberId,
    receiver: mpsc::Receiver<E>,
    dropped: Arc<AtomicU64>,
    hub: Weak<HubInner<E>>,
}

impl<E> Subscription<E> {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Next event, or `None` once unsubscribed and drained
    pub async fn recv(&mut self) -> Option<E> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<E> {
        self.receiver.try_recv().ok()
    }

    /// Events discarded for this subscriber because its queue was full
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl<E> Stream for Subscription<E> {
    type Item = E;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<E>> {
        self.get_mut().receiver.poll_recv(cx)
    }
}

impl<E> Drop for Subscription<E> {
    fn drop(&mut self) {
        if let Some(hub) = self.hub.upgrade() {
            hub.remove(self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio_stream::StreamExt;

    #[tokio::test]
    async fn test_subscribers_registered_before_publish_receive() {
        let hub: EventHub<String> = EventHub::new(8);
        let mut first = hub.subscribe();
        let mut second = hub.subscribe();

        assert_eq!(hub.publish("hello".to_string()), 2);

        assert_eq!(first.recv().await.as_deref(), Some("hello"));
        assert_eq!(second.recv().await.as_deref(), Some("hello"));
    }

    #[tokio::test]
    async fn test_late_subscriber_sees_nothing_earlier() {
        let hub: EventHub<u32> = EventHub::new(8);
        let mut early = hub.subscribe();
        hub.publish(1);

        let mut late = hub.subscribe();
        hub.publish(2);

        assert_eq!(early.recv().await, Some(1));
        assert_eq!(early.recv().await, Some(2));
        assert_eq!(late.recv().await, Some(2));
        assert_eq!(late.try_recv(), None);
    }

    #[tokio::test]
    async fn test_unsubscribe_is_idempotent_and_stops_delivery() {
        let hub: EventHub<u32> = EventHub::new(8);
        let mut sub = hub.subscribe();
        let id = sub.id();

        assert!(hub.unsubscribe(id));
        assert!(!hub.unsubscribe(id));
        assert_eq!(hub.publish(7), 0);

        // sender side is gone, so the receiver terminates
        assert_eq!(sub.recv().await, None);
    }

    #[tokio::test]
    async fn test_full_queue_drops_for_that_subscriber_only() {
        let hub: EventHub<u32> = EventHub::new(2);
        let mut slow = hub.subscribe();
        let mut fast = hub.subscribe();

        for n in 0..5 {
            hub.publish(n);
            assert_eq!(fast.recv().await, Some(n));
        }

        assert_eq!(slow.dropped(), 3);
        assert_eq!(fast.dropped(), 0);
        // publish order is kept for what was queued
        assert_eq!(slow.recv().await, Some(0));
        assert_eq!(slow.recv().await, Some(1));
        assert_eq!(slow.try_recv(), None);
    }

    #[tokio::test]
    async fn test_dropping_subscription_unsubscribes() {
        let hub: EventHub<u32> = EventHub::default();
        let sub = hub.subscribe();
        assert_eq!(hub.subscriber_count(), 1);
        drop(sub);
        assert_eq!(hub.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_publish_does_not_block_without_readers() {
        let hub: EventHub<u32> = EventHub::new(1);
        let _idle = hub.subscribe();

        let publish_all = async {
            for n in 0..10_000 {
                hub.publish(n);
            }
        };
        tokio::time::timeout(Duration::from_secs(1), publish_all)
            .await
            .expect("publish must never wait on a subscriber");
    }

    #[tokio::test]
    async fn test_subscription_as_stream() {
        let hub: EventHub<u32> = EventHub::new(8);
        let sub = hub.subscribe();
        hub.publish(1);
        hub.publish(2);
        hub.publish(3);

        let received: Vec<u32> = sub.take(3).collect().await;
        assert_eq!(received, vec![1, 2, 3]);
    }
}
