//! Event bus implementation

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use tokio::sync::Notify;

use super::Event;
use crate::time::MonotonicClock;
use crate::types::EventSessionId;

/// Per-subscriber buffer used when none is requested
pub const DEFAULT_SUBSCRIBER_BUFFER: usize = 256;

/// Which events a subscription receives
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionFilter {
    /// Every event
    All,
    /// Events scoped to one session identifier
    Session(EventSessionId),
}

impl SessionFilter {
    /// Filter for one session
    pub fn session(id: impl Into<EventSessionId>) -> Self {
        SessionFilter::Session(id.into())
    }

    /// Whether an event with this session identifier passes the filter
    pub fn matches(&self, session_id: &EventSessionId) -> bool {
        match self {
            SessionFilter::All => true,
            SessionFilter::Session(id) => id == session_id,
        }
    }
}

/// Bounded queue owned by one subscription
struct Mailbox {
    filter: SessionFilter,
    capacity: usize,
    queue: Mutex<VecDeque<Event>>,
    dropped: AtomicU64,
    closed: AtomicBool,
    notify: Notify,
}

impl Mailbox {
    fn new(filter: SessionFilter, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            filter,
            capacity,
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
            dropped: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    /// Enqueue without blocking; a full queue loses its oldest entry
    fn push(&self, event: Event) {
        {
            let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
            if self.closed.load(Ordering::Acquire) {
                return;
            }
            if queue.len() == self.capacity {
                queue.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            queue.push_back(event);
        }
        self.notify.notify_one();
    }

    fn pop(&self) -> Option<Event> {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
    }

    fn len(&self) -> usize {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Returns true only for the call that actually closed the mailbox
    fn close(&self) -> bool {
        let first = !self.closed.swap(true, Ordering::AcqRel);
        if first {
            self.notify.notify_one();
        }
        first
    }
}

struct BusInner {
    subscribers: RwLock<HashMap<u64, Arc<Mailbox>>>,
    next_id: AtomicU64,
    /// Last assigned timestamp; held while stamping and delivering
    publish_lock: Mutex<u64>,
    clock: MonotonicClock,
    default_buffer: usize,
}

impl BusInner {
    fn remove(&self, id: u64) -> Option<Arc<Mailbox>> {
        self.subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
    }
}

/// Session-scoped publish/subscribe bus
///
/// Cheap to clone; clones share the subscription table.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    /// Create a bus whose subscriptions default to `default_buffer` slots
    pub fn new(default_buffer: usize) -> Self {
        Self {
            inner: Arc::new(BusInner {
                subscribers: RwLock::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                publish_lock: Mutex::new(0),
                clock: MonotonicClock::new(),
                default_buffer: default_buffer.max(1),
            }),
        }
    }

    /// Deliver an event to every matching subscription
    ///
    /// Never blocks on subscribers. Returns the number of subscriptions the
    /// event was delivered to.
    pub fn publish(&self, mut event: Event) -> usize {
        let mut last = self
            .inner
            .publish_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let now = self.inner.clock.now_millis().max(*last);
        *last = now;
        event.timestamp_ms = now;

        let subscribers = self
            .inner
            .subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let mut delivered = 0;
        for mailbox in subscribers.values() {
            if mailbox.filter.matches(&event.session_id) {
                mailbox.push(event.clone());
                delivered += 1;
            }
        }

        tracing::trace!(
            kind = %event.kind,
            session = %event.session_id,
            delivered,
            "Published event"
        );
        delivered
    }

    /// Register a subscription
    ///
    /// Only events published after this returns are delivered.
    pub fn subscribe(&self, filter: SessionFilter, buffer: usize) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let mailbox = Arc::new(Mailbox::new(filter, buffer));
        self.inner
            .subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, Arc::clone(&mailbox));

        tracing::debug!(subscription = id, filter = ?mailbox.filter, "Subscribed");
        Subscription {
            id,
            mailbox,
            bus: Arc::clone(&self.inner),
        }
    }

    /// Register a subscription with the default buffer size
    pub fn subscribe_default(&self, filter: SessionFilter) -> Subscription {
        self.subscribe(filter, self.inner.default_buffer)
    }

    /// Cancel a subscription; idempotent
    pub fn unsubscribe(&self, subscription: &Subscription) {
        subscription.unsubscribe();
    }

    /// Number of live subscriptions
    pub fn subscriber_count(&self) -> usize {
        self.inner
            .subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_SUBSCRIBER_BUFFER)
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

/// One bus client
///
/// Dropping a subscription unsubscribes it.
pub struct Subscription {
    id: u64,
    mailbox: Arc<Mailbox>,
    bus: Arc<BusInner>,
}

impl Subscription {
    /// Subscription identifier, unique within its bus
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Filter this subscription was registered with
    pub fn filter(&self) -> &SessionFilter {
        &self.mailbox.filter
    }

    /// Wait for the next event
    ///
    /// After unsubscribe, events already queued are still returned; then
    /// `None`.
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            if let Some(event) = self.mailbox.pop() {
                return Some(event);
            }
            if self.mailbox.closed.load(Ordering::Acquire) {
                return self.mailbox.pop();
            }
            self.mailbox.notify.notified().await;
        }
    }

    /// Take the next queued event without waiting
    pub fn try_recv(&mut self) -> Option<Event> {
        self.mailbox.pop()
    }

    /// Take every queued event
    pub fn drain(&mut self) -> Vec<Event> {
        let mut queue = self
            .mailbox
            .queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let events = queue.drain(..).collect();
        events
    }

    /// Events discarded because this subscriber fell behind
    pub fn dropped(&self) -> u64 {
        self.mailbox.dropped.load(Ordering::Relaxed)
    }

    /// Events currently queued
    pub fn len(&self) -> usize {
        self.mailbox.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the subscription has been cancelled
    pub fn is_closed(&self) -> bool {
        self.mailbox.closed.load(Ordering::Acquire)
    }

    /// Cancel this subscription; the delivery channel closes exactly once
    pub fn unsubscribe(&self) {
        if self.mailbox.close() {
            self.bus.remove(self.id);
            tracing::debug!(
                subscription = self.id,
                dropped = self.dropped(),
                "Unsubscribed"
            );
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("filter", &self.mailbox.filter)
            .field("queued", &self.len())
            .field("dropped", &self.dropped())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bt_protocol::EventKind;
    use std::time::Duration;

    fn progress(session: &str, step: usize) -> Event {
        Event::new(EventKind::JobProgress, session).with_step(format!("segment-{}", step))
    }

    #[test]
    fn test_session_filtering() {
        let bus = EventBus::default();
        let mut a = bus.subscribe(SessionFilter::session("A"), 16);
        let mut b = bus.subscribe(SessionFilter::session("B"), 16);
        let mut all = bus.subscribe(SessionFilter::All, 16);

        for i in 0..6 {
            let session = if i % 2 == 0 { "A" } else { "B" };
            bus.publish(progress(session, i));
        }

        let steps = |events: Vec<Event>| {
            events
                .into_iter()
                .map(|e| e.step.unwrap_or_default())
                .collect::<Vec<_>>()
        };
        assert_eq!(steps(a.drain()), ["segment-0", "segment-2", "segment-4"]);
        assert_eq!(steps(b.drain()), ["segment-1", "segment-3", "segment-5"]);
        assert_eq!(all.drain().len(), 6);
    }

    #[test]
    fn test_no_replay_of_past_events() {
        let bus = EventBus::default();
        bus.publish(progress("A", 0));
        let mut sub = bus.subscribe(SessionFilter::All, 16);
        assert!(sub.try_recv().is_none());

        bus.publish(progress("A", 1));
        assert_eq!(sub.try_recv().unwrap().step.as_deref(), Some("segment-1"));
    }

    #[test]
    fn test_slow_subscriber_drops_oldest() {
        let bus = EventBus::default();
        let mut slow = bus.subscribe(SessionFilter::session("reader"), 256);

        for i in 0..1000 {
            bus.publish(progress("reader", i));
        }

        assert!(slow.dropped() >= 744);
        let retained = slow.drain();
        assert_eq!(retained.len(), 256);
        assert_eq!(retained[0].step.as_deref(), Some("segment-744"));
        assert_eq!(retained[255].step.as_deref(), Some("segment-999"));
    }

    #[test]
    fn test_timestamps_monotonic() {
        let bus = EventBus::default();
        let mut sub = bus.subscribe(SessionFilter::All, 64);
        for i in 0..50 {
            bus.publish(progress("A", i));
        }
        let events = sub.drain();
        assert!(events
            .windows(2)
            .all(|w| w[0].timestamp_ms <= w[1].timestamp_ms));
        assert!(events[0].timestamp_ms > 0);
    }

    #[test]
    fn test_unsubscribe_idempotent() {
        let bus = EventBus::default();
        let sub = bus.subscribe(SessionFilter::All, 4);
        assert_eq!(bus.subscriber_count(), 1);

        bus.unsubscribe(&sub);
        sub.unsubscribe();
        assert!(sub.is_closed());
        assert_eq!(bus.subscriber_count(), 0);
        assert_eq!(bus.publish(progress("A", 0)), 0);
    }

    #[test]
    fn test_drop_unsubscribes() {
        let bus = EventBus::default();
        {
            let _sub = bus.subscribe(SessionFilter::All, 4);
            assert_eq!(bus.subscriber_count(), 1);
        }
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_recv_wakes_on_publish() {
        let bus = EventBus::default();
        let mut sub = bus.subscribe(SessionFilter::session("A"), 8);

        let publisher = bus.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            publisher.publish(progress("A", 7));
        });

        let event = tokio::time::timeout(Duration::from_secs(2), sub.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.step.as_deref(), Some("segment-7"));
    }

    #[tokio::test]
    async fn test_recv_returns_none_after_close() {
        let bus = EventBus::default();
        let mut sub = bus.subscribe(SessionFilter::All, 8);
        bus.publish(progress("A", 0));
        sub.unsubscribe();

        assert!(sub.recv().await.is_some());
        assert!(sub.recv().await.is_none());
    }
}
