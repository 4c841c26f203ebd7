//! Typed event dispatch for session observers
//!
//! Each session owns one `EventDispatcher`. Observers either take an
//! [`EventSubscription`] (an ordered stream of events) or register a closure
//! with [`EventDispatcher::on`]. Every published event reaches each matching
//! subscriber exactly once, in publish order.

pub mod types;

pub use types::{EventKind, SessionEvent};

use futures::Stream;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tracing::trace;

/// Subscriber identifier, unique within one dispatcher
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(u64);

type Handler = Arc<dyn Fn(&SessionEvent) + Send + Sync>;

#[derive(Clone)]
enum Sink {
    Channel(mpsc::UnboundedSender<SessionEvent>),
    Handler(Handler),
}

#[derive(Clone)]
struct Subscriber {
    id: SubscriberId,
    /// `None` matches every kind
    kinds: Option<HashSet<EventKind>>,
    sink: Sink,
}

impl Subscriber {
    fn wants(&self, kind: EventKind) -> bool {
        self.kinds.as_ref().map_or(true, |kinds| kinds.contains(&kind))
    }

    fn is_closed(&self) -> bool {
        matches!(&self.sink, Sink::Channel(tx) if tx.is_closed())
    }
}

#[derive(Default)]
struct DispatcherInner {
    next_id: u64,
    subscribers: Vec<Subscriber>,
}

/// Publish/subscribe surface for one session
#[derive(Default)]
pub struct EventDispatcher {
    inner: Mutex<DispatcherInner>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self, kinds: Option<HashSet<EventKind>>, sink: Sink) -> SubscriberId {
        let mut inner = self.inner.lock();
        let id = SubscriberId(inner.next_id);
        inner.next_id += 1;
        inner.subscribers.push(Subscriber { id, kinds, sink });
        id
    }

    /// Subscribe to the given event kinds
    pub fn subscribe(&self, kinds: impl IntoIterator<Item = EventKind>) -> EventSubscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.register(Some(kinds.into_iter().collect()), Sink::Channel(tx));
        EventSubscription { id, rx }
    }

    /// Subscribe to every event kind
    pub fn subscribe_all(&self) -> EventSubscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.register(None, Sink::Channel(tx));
        EventSubscription { id, rx }
    }

    /// Register a closure for one event kind
    ///
    /// The handler runs on the publishing task and must not block.
    pub fn on<F>(&self, kind: EventKind, handler: F) -> SubscriberId
    where
        F: Fn(&SessionEvent) + Send + Sync + 'static,
    {
        let kinds = HashSet::from([kind]);
        self.register(Some(kinds), Sink::Handler(Arc::new(handler)))
    }

    /// Remove a subscriber. Returns `false` if it was already gone.
    pub fn off(&self, id: SubscriberId) -> bool {
        let mut inner = self.inner.lock();
        let before = inner.subscribers.len();
        inner.subscribers.retain(|s| s.id != id);
        inner.subscribers.len() != before
    }

    /// Deliver an event to every matching subscriber
    ///
    /// Returns the number of subscribers that received it.
    pub fn publish(&self, event: SessionEvent) -> usize {
        let kind = event.kind();

        // Snapshot so handlers may subscribe/unsubscribe without deadlocking
        let targets: Vec<Subscriber> = {
            let mut inner = self.inner.lock();
            inner.subscribers.retain(|s| !s.is_closed());
            inner
                .subscribers
                .iter()
                .filter(|s| s.wants(kind))
                .cloned()
                .collect()
        };

        let mut delivered = 0;
        for subscriber in targets {
            match subscriber.sink {
                Sink::Channel(tx) => {
                    if tx.send(event.clone()).is_ok() {
                        delivered += 1;
                    }
                }
                Sink::Handler(handler) => {
                    handler(&event);
                    delivered += 1;
                }
            }
        }

        trace!("Dispatched {} to {} subscriber(s)", kind, delivered);
        delivered
    }

    /// Drop every subscriber, closing all subscription streams
    pub fn clear(&self) {
        self.inner.lock().subscribers.clear();
    }

    /// Get the current number of live subscribers
    pub fn subscriber_count(&self) -> usize {
        let mut inner = self.inner.lock();
        inner.subscribers.retain(|s| !s.is_closed());
        inner.subscribers.len()
    }
}

/// Ordered stream of session events
///
/// Dropping the subscription unsubscribes it.
pub struct EventSubscription {
    id: SubscriberId,
    rx: mpsc::UnboundedReceiver<SessionEvent>,
}

impl EventSubscription {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Wait for the next event. Returns `None` once the dispatcher is cleared.
    pub async fn recv(&mut self) -> Option<SessionEvent> {
        self.rx.recv().await
    }

    /// Take the next event if one is already queued
    pub fn try_recv(&mut self) -> Option<SessionEvent> {
        self.rx.try_recv().ok()
    }

    /// Drain all queued events
    pub fn drain(&mut self) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.rx.try_recv() {
            events.push(event);
        }
        events
    }
}

impl Stream for EventSubscription {
    type Item = SessionEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}
