//! Event fan-out
//!
//! [`EventBus`] delivers every published event to all live subscriptions.
//! A [`Subscription`] is an owned handle: dropping it unsubscribes, and
//! calling [`Subscription::unsubscribe`] more than once is harmless.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;

struct BusInner<E> {
    subscribers: Mutex<HashMap<u64, mpsc::UnboundedSender<E>>>,
    next_id: AtomicU64,
}

/// Multi-subscriber broadcast of `E`
pub struct EventBus<E> {
    inner: Arc<BusInner<E>>,
}

impl<E> Clone for EventBus<E> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<E: Clone + Send + 'static> Default for EventBus<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Clone + Send + 'static> EventBus<E> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BusInner {
                subscribers: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn subscribe(&self) -> Subscription<E> {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.subscribers.lock().insert(id, tx);
        Subscription {
            id,
            bus: Arc::downgrade(&self.inner),
            rx,
            active: true,
        }
    }

    /// Deliver `event` to every subscriber, returning how many received it
    pub fn publish(&self, event: E) -> usize {
        let mut subscribers = self.inner.subscribers.lock();
        subscribers.retain(|_, tx| tx.send(event.clone()).is_ok());
        subscribers.len()
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.lock().len()
    }
}

/// Receiving end of an [`EventBus`]
pub struct Subscription<E> {
    id: u64,
    bus: Weak<BusInner<E>>,
    rx: mpsc::UnboundedReceiver<E>,
    active: bool,
}

impl<E> Subscription<E> {
    /// Next event; `None` once unsubscribed or the bus is gone
    pub async fn recv(&mut self) -> Option<E> {
        if !self.active {
            return None;
        }
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<E> {
        if !self.active {
            return None;
        }
        self.rx.try_recv().ok()
    }

    pub fn unsubscribe(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;
        if let Some(bus) = self.bus.upgrade() {
            bus.subscribers.lock().remove(&self.id);
        }
        self.rx.close();
    }

    pub fn is_active(&self) -> bool {
        self.active
    }
}

impl<E> Drop for Subscription<E> {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_every_subscriber_sees_every_event() {
        let bus = EventBus::new();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        assert_eq!(bus.publish(1u32), 2);
        assert_eq!(bus.publish(2u32), 2);

        assert_eq!(a.recv().await, Some(1));
        assert_eq!(a.recv().await, Some(2));
        assert_eq!(b.recv().await, Some(1));
        assert_eq!(b.recv().await, Some(2));
    }

    #[tokio::test]
    async fn test_unsubscribe_is_idempotent() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe();
        sub.unsubscribe();
        sub.unsubscribe();

        assert_eq!(bus.subscriber_count(), 0);
        assert_eq!(bus.publish("ignored"), 0);
        assert_eq!(sub.recv().await, None);
    }

    #[test]
    fn test_drop_unsubscribes() {
        let bus: EventBus<u8> = EventBus::new();
        {
            let _sub = bus.subscribe();
            assert_eq!(bus.subscriber_count(), 1);
        }
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_subscription_outlives_bus() {
        let bus: EventBus<u8> = EventBus::new();
        let mut sub = bus.subscribe();
        drop(bus);
        assert_eq!(sub.try_recv(), None);
        sub.unsubscribe();
    }
}
