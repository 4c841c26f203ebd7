//! Demultiplexing of the shared engine channel by session identity
//!
//! The router is the single consumer of the [`EngineEventBus`] and owns a
//! table of per-session routes. Notifications are handed to the matching
//! session synchronously, one at a time, so per-session delivery order is the
//! engine's emission order.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use crate::engine::{EngineEvent, EngineEventBus, EngineEventKind};
use crate::error::{Result, RtcError};
use crate::session::SessionId;

/// Receiver of routed notifications for one session
pub trait EventSink: Send + Sync {
    fn deliver(&self, event: EngineEventKind);
}

/// Session-identity router over the shared engine channel
pub struct EventRouter {
    bus: EngineEventBus,
    routes: RwLock<HashMap<SessionId, Weak<dyn EventSink>>>,
    cancel: CancellationToken,
}

impl EventRouter {
    pub fn new(bus: EngineEventBus) -> Arc<Self> {
        Arc::new(Self {
            bus,
            routes: RwLock::new(HashMap::new()),
            cancel: CancellationToken::new(),
        })
    }

    pub fn bus(&self) -> &EngineEventBus {
        &self.bus
    }

    /// Register a route for a session
    ///
    /// The router keeps only a weak reference; a dropped sink is pruned on the
    /// next event addressed to it.
    pub fn register(self: &Arc<Self>, id: SessionId, sink: Weak<dyn EventSink>) -> Result<RouteHandle> {
        let mut routes = self.routes.write();
        if routes.contains_key(&id) {
            return Err(RtcError::Internal(format!(
                "session {} is already routed",
                id
            )));
        }
        routes.insert(id, sink);
        debug!("Route registered for session {}", id);

        Ok(RouteHandle {
            router: Arc::downgrade(self),
            id,
            released: AtomicBool::new(false),
        })
    }

    fn remove(&self, id: SessionId) -> bool {
        let removed = self.routes.write().remove(&id).is_some();
        if removed {
            debug!("Route released for session {}", id);
        }
        removed
    }

    /// Whether notifications for `id` are currently delivered
    pub fn is_routed(&self, id: SessionId) -> bool {
        self.routes.read().contains_key(&id)
    }

    pub fn route_count(&self) -> usize {
        self.routes.read().len()
    }

    /// Deliver one notification to its session
    ///
    /// Returns `false` when no live route matches the identity.
    pub fn route(&self, event: EngineEvent) -> bool {
        let sink = self.routes.read().get(&event.session_id).cloned();

        let Some(sink) = sink else {
            trace!(
                "Ignoring {} for unrouted session {}",
                event.event.name(),
                event.session_id
            );
            return false;
        };

        match sink.upgrade() {
            Some(sink) => {
                trace!("Routing {} to session {}", event.event.name(), event.session_id);
                sink.deliver(event.event);
                true
            }
            None => {
                self.remove(event.session_id);
                false
            }
        }
    }

    /// Consume the shared queue until [`shutdown`](Self::shutdown)
    pub async fn run(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<EngineEvent>) {
        info!("Event router started");
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                received = rx.recv() => match received {
                    Some(event) => {
                        self.route(event);
                    }
                    None => break,
                },
            }
        }
        info!("Event router stopped");
    }

    /// Take the bus's consuming end and run the routing loop on a new task
    ///
    /// Must be called from within a tokio runtime. Fails if the bus already
    /// has a consumer.
    pub fn spawn(self: &Arc<Self>) -> Result<JoinHandle<()>> {
        let rx = self.bus.take_receiver().ok_or_else(|| {
            RtcError::Internal("engine event bus already has a consumer".to_string())
        })?;
        Ok(tokio::spawn(self.clone().run(rx)))
    }

    /// Stop the routing loop
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

/// Exclusive handle to one session's route
///
/// Releasing is idempotent; dropping the handle releases it.
pub struct RouteHandle {
    router: Weak<EventRouter>,
    id: SessionId,
    released: AtomicBool,
}

impl RouteHandle {
    pub fn session_id(&self) -> SessionId {
        self.id
    }

    /// Stop routing notifications for this session
    ///
    /// Returns `true` only for the call that actually released the route.
    pub fn release(&self) -> bool {
        if self.released.swap(true, Ordering::AcqRel) {
            return false;
        }
        if let Some(router) = self.router.upgrade() {
            router.remove(self.id);
        }
        true
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }
}

impl Drop for RouteHandle {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<EngineEventKind>>,
    }

    impl EventSink for Recorder {
        fn deliver(&self, event: EngineEventKind) {
            self.seen.lock().push(event);
        }
    }

    fn sink(recorder: &Arc<Recorder>) -> Weak<dyn EventSink> {
        let sink: Arc<dyn EventSink> = recorder.clone();
        Arc::downgrade(&sink)
    }

    #[test]
    fn test_exact_identity_match() {
        let router = EventRouter::new(EngineEventBus::default());
        let a = Arc::new(Recorder::default());
        let b = Arc::new(Recorder::default());
        let _ha = router.register(SessionId::new(1), sink(&a)).unwrap();
        let _hb = router.register(SessionId::new(2), sink(&b)).unwrap();

        assert!(router.route(EngineEvent::new(SessionId::new(2), EngineEventKind::NegotiationNeeded)));
        assert!(!router.route(EngineEvent::new(SessionId::new(3), EngineEventKind::NegotiationNeeded)));

        assert!(a.seen.lock().is_empty());
        assert_eq!(b.seen.lock().len(), 1);
    }

    #[test]
    fn test_release_is_idempotent() {
        let router = EventRouter::new(EngineEventBus::default());
        let recorder = Arc::new(Recorder::default());
        let handle = router.register(SessionId::new(1), sink(&recorder)).unwrap();

        assert!(handle.release());
        assert!(!handle.release());
        assert!(handle.is_released());
        assert!(!router.is_routed(SessionId::new(1)));
        assert!(!router.route(EngineEvent::new(SessionId::new(1), EngineEventKind::NegotiationNeeded)));
        assert!(recorder.seen.lock().is_empty());
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let router = EventRouter::new(EngineEventBus::default());
        let recorder = Arc::new(Recorder::default());
        let _handle = router.register(SessionId::new(1), sink(&recorder)).unwrap();
        assert!(router.register(SessionId::new(1), sink(&recorder)).is_err());
    }

    #[test]
    fn test_dropped_sink_pruned() {
        let router = EventRouter::new(EngineEventBus::default());
        let recorder = Arc::new(Recorder::default());
        let _handle = router.register(SessionId::new(4), sink(&recorder)).unwrap();
        drop(recorder);

        assert!(!router.route(EngineEvent::new(SessionId::new(4), EngineEventKind::NegotiationNeeded)));
        assert_eq!(router.route_count(), 0);
    }

    #[test]
    fn test_handle_drop_releases() {
        let router = EventRouter::new(EngineEventBus::default());
        let recorder = Arc::new(Recorder::default());
        let handle = router.register(SessionId::new(1), sink(&recorder)).unwrap();
        drop(handle);
        assert_eq!(router.route_count(), 0);
    }

    #[tokio::test]
    async fn test_run_loop_preserves_order() {
        let bus = EngineEventBus::default();
        let router = EventRouter::new(bus.clone());
        let recorder = Arc::new(Recorder::default());
        let _handle = router.register(SessionId::new(1), sink(&recorder)).unwrap();
        let task = router.spawn().unwrap();

        let states = ["stable", "have-local-offer", "stable"];
        for state in states {
            bus.publish_json(&format!(
                r#"{{"sessionId":1,"event":{{"type":"signaling-state-changed","state":"{}"}}}}"#,
                state
            ))
            .unwrap();
        }
        bus.publish(EngineEvent::new(SessionId::new(1), EngineEventKind::NegotiationNeeded));

        for _ in 0..100 {
            if recorder.seen.lock().len() == 4 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        router.shutdown();
        task.await.unwrap();

        let seen = recorder.seen.lock();
        assert_eq!(seen.len(), 4);
        assert_eq!(seen[3], EngineEventKind::NegotiationNeeded);
        assert!(matches!(
            seen[1],
            EngineEventKind::SignalingStateChanged {
                state: crate::signaling::SignalingState::HaveLocalOffer
            }
        ));
    }

    #[tokio::test]
    async fn test_burst_delivered_without_loss() {
        let bus = EngineEventBus::default();
        let router = EventRouter::new(bus.clone());
        let recorder = Arc::new(Recorder::default());
        let _handle = router.register(SessionId::new(1), sink(&recorder)).unwrap();
        let task = router.spawn().unwrap();
        assert!(router.spawn().is_err());

        for n in 0..300 {
            bus.publish(EngineEvent::new(
                SessionId::new(1),
                EngineEventKind::StreamAdded {
                    stream_id: format!("s{}", n),
                    tracks: Vec::new(),
                },
            ));
        }

        for _ in 0..200 {
            if recorder.seen.lock().len() == 300 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        router.shutdown();
        task.await.unwrap();

        let seen = recorder.seen.lock();
        assert_eq!(seen.len(), 300);
        for (n, event) in seen.iter().enumerate() {
            match event {
                EngineEventKind::StreamAdded { stream_id, .. } => {
                    assert_eq!(stream_id, &format!("s{}", n))
                }
                other => panic!("unexpected event {:?}", other),
            }
        }
    }
}
