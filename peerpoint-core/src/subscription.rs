//! Revocable event subscriptions.
//!
//! Transport objects expose one [`EventHub`] per event kind. Consumers
//! [`attach`](EventHub::attach) to receive a [`Subscription`], and a session
//! groups all of its subscriptions in a [`SubscriptionScope`] so they can be
//! revoked together on teardown. Once revoked, a subscription yields `None`
//! even if events were already queued for it.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tokio::sync::mpsc;

struct HubInner<E> {
    next_id: u64,
    listeners: HashMap<u64, mpsc::UnboundedSender<E>>,
    /// Events emitted before the first listener attached (only when enabled).
    backlog: Option<VecDeque<E>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned: PoisonError<_>| {
        tracing::error!("Subscription lock poisoned; continuing with inner state");
        poisoned.into_inner()
    })
}

/// Fan-out point for one kind of event.
pub struct EventHub<E> {
    inner: Arc<Mutex<HubInner<E>>>,
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
        Self::new()
    }
}

impl<E: Clone + Send + 'static> EventHub<E> {
    /// Create a hub that drops events emitted while nobody listens.
    #[must_use]
    pub fn new() -> Self {
        Self::build(None)
    }

    /// Create a hub that replays events emitted before the first attach.
    ///
    /// Transport backends raise events from their own callbacks, possibly
    /// before the owning session has subscribed; this keeps the early
    /// `open`/`message` events from being lost.
    #[must_use]
    pub fn with_backlog() -> Self {
        Self::build(Some(VecDeque::new()))
    }

    fn build(backlog: Option<VecDeque<E>>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(HubInner {
                next_id: 0,
                listeners: HashMap::new(),
                backlog,
            })),
        }
    }

    /// Deliver an event to every live listener.
    ///
    /// Returns the number of listeners that received it.
    pub fn emit(&self, event: E) -> usize {
        let mut inner = lock(&self.inner);
        if inner.listeners.is_empty() {
            if let Some(backlog) = inner.backlog.as_mut() {
                backlog.push_back(event);
            }
            return 0;
        }
        inner.listeners.retain(|_, tx| tx.send(event.clone()).is_ok());
        inner.listeners.len()
    }

    /// Attach a new listener.
    pub fn attach(&self) -> Subscription<E> {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = {
            let mut inner = lock(&self.inner);
            let id = inner.next_id;
            inner.next_id += 1;
            if let Some(backlog) = inner.backlog.take() {
                for event in backlog {
                    let _ = tx.send(event);
                }
            }
            inner.listeners.insert(id, tx);
            id
        };

        let weak: Weak<Mutex<HubInner<E>>> = Arc::downgrade(&self.inner);
        let remove = move || {
            if let Some(inner) = weak.upgrade() {
                lock(&inner).listeners.remove(&id);
            }
        };

        Subscription {
            rx,
            detacher: Detacher {
                revoked: Arc::new(AtomicBool::new(false)),
                remove: Arc::new(remove),
            },
        }
    }

    /// Number of currently attached listeners.
    #[must_use]
    pub fn listener_count(&self) -> usize {
        lock(&self.inner).listeners.len()
    }

    /// Drop every listener; their subscriptions end after draining.
    pub fn clear(&self) {
        lock(&self.inner).listeners.clear();
    }
}

/// Handle that revokes one subscription.
#[derive(Clone)]
pub struct Detacher {
    revoked: Arc<AtomicBool>,
    remove: Arc<dyn Fn() + Send + Sync>,
}

impl Detacher {
    /// Revoke the subscription. Idempotent.
    pub fn detach(&self) {
        if !self.revoked.swap(true, Ordering::SeqCst) {
            (self.remove)();
        }
    }

    /// Whether the subscription has been revoked.
    #[must_use]
    pub fn is_detached(&self) -> bool {
        self.revoked.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for Detacher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Detacher")
            .field("revoked", &self.is_detached())
            .finish_non_exhaustive()
    }
}

/// Receiving side of one attached listener.
pub struct Subscription<E> {
    rx: mpsc::UnboundedReceiver<E>,
    detacher: Detacher,
}

impl<E> Subscription<E> {
    /// Wait for the next event.
    ///
    /// Returns `None` once the subscription is revoked or the hub is gone.
    pub async fn recv(&mut self) -> Option<E> {
        if self.detacher.is_detached() {
            return None;
        }
        let event = self.rx.recv().await;
        if self.detacher.is_detached() {
            return None;
        }
        event
    }

    /// Take the next already-queued event without waiting.
    pub fn try_recv(&mut self) -> Option<E> {
        if self.detacher.is_detached() {
            return None;
        }
        self.rx.try_recv().ok()
    }

    /// Handle that can revoke this subscription from elsewhere.
    #[must_use]
    pub fn detacher(&self) -> Detacher {
        self.detacher.clone()
    }

    /// Revoke this subscription.
    pub fn detach(&self) {
        self.detacher.detach();
    }
}

impl<E> Drop for Subscription<E> {
    fn drop(&mut self) {
        self.detacher.detach();
    }
}

/// Groups the subscriptions owned by one session.
#[derive(Debug, Default)]
pub struct SubscriptionScope {
    detachers: Mutex<Vec<Detacher>>,
    done: AtomicBool,
}

impl SubscriptionScope {
    /// Create an empty, live scope.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscription with this scope.
    ///
    /// Subscriptions tracked after [`detach_all`](Self::detach_all) are
    /// revoked immediately.
    pub fn track<E>(&self, subscription: Subscription<E>) -> Subscription<E> {
        if self.is_done() {
            subscription.detach();
        } else {
            lock(&self.detachers).push(subscription.detacher());
        }
        subscription
    }

    /// Revoke every tracked subscription and close the scope.
    ///
    /// Returns how many subscriptions were revoked by this call.
    pub fn detach_all(&self) -> usize {
        self.done.store(true, Ordering::SeqCst);
        let detachers: Vec<Detacher> = lock(&self.detachers).drain(..).collect();
        let revoked = detachers.iter().filter(|d| !d.is_detached()).count();
        for detacher in &detachers {
            detacher.detach();
        }
        revoked
    }

    /// Whether the scope has been closed.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::SeqCst)
    }
}

impl Drop for SubscriptionScope {
    fn drop(&mut self) {
        self.detach_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emit_reaches_all_listeners() {
        let hub = EventHub::<u32>::new();
        let mut a = hub.attach();
        let mut b = hub.attach();

        assert_eq!(hub.emit(7), 2);
        assert_eq!(a.recv().await, Some(7));
        assert_eq!(b.recv().await, Some(7));
    }

    #[test]
    fn test_events_without_listener_are_dropped() {
        let hub = EventHub::<u32>::new();
        assert_eq!(hub.emit(1), 0);
        let mut sub = hub.attach();
        assert_eq!(sub.try_recv(), None);
    }

    #[test]
    fn test_backlog_replays_to_first_listener_only() {
        let hub = EventHub::<u32>::with_backlog();
        hub.emit(1);
        hub.emit(2);

        let mut first = hub.attach();
        let mut second = hub.attach();
        assert_eq!(first.try_recv(), Some(1));
        assert_eq!(first.try_recv(), Some(2));
        assert_eq!(second.try_recv(), None);
    }

    #[test]
    fn test_detached_subscription_ignores_queued_events() {
        let hub = EventHub::<u32>::new();
        let mut sub = hub.attach();
        hub.emit(1);
        sub.detach();

        assert_eq!(sub.try_recv(), None);
        assert_eq!(hub.listener_count(), 0);
    }

    #[test]
    fn test_drop_detaches() {
        let hub = EventHub::<u32>::new();
        {
            let _sub = hub.attach();
            assert_eq!(hub.listener_count(), 1);
        }
        assert_eq!(hub.listener_count(), 0);
    }

    #[tokio::test]
    async fn test_scope_detaches_everything() {
        let numbers = EventHub::<u32>::new();
        let words = EventHub::<String>::new();
        let scope = SubscriptionScope::new();

        let mut n = scope.track(numbers.attach());
        let mut w = scope.track(words.attach());
        numbers.emit(3);
        words.emit("late".to_string());

        assert_eq!(scope.detach_all(), 2);
        assert!(scope.is_done());
        assert_eq!(n.recv().await, None);
        assert_eq!(w.recv().await, None);
        assert_eq!(numbers.listener_count(), 0);
        assert_eq!(words.listener_count(), 0);
    }

    #[test]
    fn test_track_after_done_revokes_immediately() {
        let hub = EventHub::<u32>::new();
        let scope = SubscriptionScope::new();
        scope.detach_all();

        let mut sub = scope.track(hub.attach());
        hub.emit(5);
        assert_eq!(sub.try_recv(), None);
    }
}
