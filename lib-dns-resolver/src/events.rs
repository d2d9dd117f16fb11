//! A publish-subscribe fan-out for cache events.
//!
//! The publish path must never degrade because of a slow consumer, so the
//! subscriber list is an immutable snapshot behind an `Arc`: publishing
//! clones the `Arc` and pushes into each subscriber's bounded channel with
//! `try_send`, dropping the event for any subscriber whose channel is full.
//! Subscribing and unsubscribing are serialized and swap in a new snapshot.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::RwLock;
use tokio::sync::mpsc;

use dns_types::protocol::types::DomainName;

/// Per-subscriber channel capacity.
pub const DEFAULT_SUBSCRIBER_CAPACITY: usize = 1024;

/// What happened in the cache.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum EventKind {
    Store,
    Evict,
    Hit,
    Miss,
    Flush,
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            EventKind::Store => write!(f, "store"),
            EventKind::Evict => write!(f, "evict"),
            EventKind::Hit => write!(f, "hit"),
            EventKind::Miss => write!(f, "miss"),
            EventKind::Flush => write!(f, "flush"),
        }
    }
}

/// A single cache event.
#[derive(Debug, Clone)]
pub struct Event {
    pub timestamp: SystemTime,
    pub kind: EventKind,
    pub qname: DomainName,
    pub reason: String,
}

impl Event {
    pub fn new(kind: EventKind, qname: DomainName, reason: impl Into<String>) -> Self {
        Self {
            timestamp: SystemTime::now(),
            kind,
            qname,
            reason: reason.into(),
        }
    }
}

/// Identifies a subscription, for cancellation.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct SubscriptionId(u64);

#[derive(Clone)]
struct Subscriber {
    id: SubscriptionId,
    sender: mpsc::Sender<Event>,
}

/// Cloning gives another handle to the same broadcaster.
#[derive(Clone)]
pub struct Broadcaster {
    inner: Arc<BroadcasterInner>,
}

struct BroadcasterInner {
    /// The current subscriber snapshot.  Publishers take the read lock just
    /// long enough to clone the `Arc`; only (un)subscribe takes the write
    /// lock.
    subscribers: RwLock<Arc<[Subscriber]>>,
    next_id: AtomicU64,
    capacity: usize,
    published: AtomicU64,
    dropped: AtomicU64,
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new(DEFAULT_SUBSCRIBER_CAPACITY)
    }
}

impl Broadcaster {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(BroadcasterInner {
                subscribers: RwLock::new(Vec::new().into()),
                next_id: AtomicU64::new(0),
                capacity: capacity.max(1),
                published: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
            }),
        }
    }

    /// Register a new subscriber and return its id and event channel.
    pub fn subscribe(&self) -> (SubscriptionId, mpsc::Receiver<Event>) {
        let id = SubscriptionId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let (sender, receiver) = mpsc::channel(self.inner.capacity);

        let mut subscribers = self.inner.subscribers.write();
        let mut next = subscribers.iter().cloned().collect::<Vec<_>>();
        next.push(Subscriber { id, sender });
        *subscribers = next.into();

        (id, receiver)
    }

    /// Remove a subscriber.  Publishing to a cancelled id is a no-op.
    pub fn unsubscribe(&self, id: SubscriptionId) {
        let mut subscribers = self.inner.subscribers.write();
        let next = subscribers
            .iter()
            .filter(|subscriber| subscriber.id != id)
            .cloned()
            .collect::<Vec<_>>();
        *subscribers = next.into();
    }

    /// Deliver an event to every subscriber that has room for it.  Never
    /// blocks: subscribers whose channels are full miss the event.
    pub fn publish(&self, event: Event) {
        let snapshot = Arc::clone(&self.inner.subscribers.read());
        if snapshot.is_empty() {
            return;
        }

        self.inner.published.fetch_add(1, Ordering::Relaxed);
        for subscriber in snapshot.iter() {
            if subscriber.sender.try_send(event.clone()).is_err() {
                self.inner.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.read().len()
    }

    /// `(published, dropped)` counters.  Dropped counts per-subscriber
    /// misses, so it can exceed published.
    pub fn counters(&self) -> (u64, u64) {
        (
            self.inner.published.load(Ordering::Relaxed),
            self.inner.dropped.load(Ordering::Relaxed),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dns_types::protocol::types::test_util::*;

    fn event(kind: EventKind) -> Event {
        Event::new(kind, domain("www.example.com."), "test")
    }

    #[tokio::test]
    async fn subscribers_receive_in_publish_order() {
        let broadcaster = Broadcaster::default();
        let (_id, mut receiver) = broadcaster.subscribe();

        broadcaster.publish(event(EventKind::Store));
        broadcaster.publish(event(EventKind::Hit));
        broadcaster.publish(event(EventKind::Evict));

        assert_eq!(EventKind::Store, receiver.recv().await.unwrap().kind);
        assert_eq!(EventKind::Hit, receiver.recv().await.unwrap().kind);
        assert_eq!(EventKind::Evict, receiver.recv().await.unwrap().kind);
    }

    #[tokio::test]
    async fn slow_subscribers_lose_events_but_do_not_block() {
        let broadcaster = Broadcaster::new(2);
        let (_id, mut slow) = broadcaster.subscribe();

        for _ in 0..10 {
            broadcaster.publish(event(EventKind::Store));
        }

        // only the first two fit; the rest were dropped for this subscriber
        assert_eq!(EventKind::Store, slow.recv().await.unwrap().kind);
        assert_eq!(EventKind::Store, slow.recv().await.unwrap().kind);
        assert!(slow.try_recv().is_err());

        let (published, dropped) = broadcaster.counters();
        assert_eq!(10, published);
        assert_eq!(8, dropped);
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let broadcaster = Broadcaster::default();
        let (id, mut receiver) = broadcaster.subscribe();
        assert_eq!(1, broadcaster.subscriber_count());

        broadcaster.unsubscribe(id);
        assert_eq!(0, broadcaster.subscriber_count());

        broadcaster.publish(event(EventKind::Store));
        assert!(receiver.try_recv().is_err());
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_cheap_and_safe() {
        let broadcaster = Broadcaster::default();
        broadcaster.publish(event(EventKind::Flush));
        assert_eq!((0, 0), broadcaster.counters());
    }
}
