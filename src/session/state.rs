//! Observable session state
//!
//! Transitions arrive from the engine and are applied as-is: the engine is the
//! authority on which transitions are legal. Descriptions are only recorded
//! from a successful set-description completion.

use parking_lot::RwLock;
use serde::Serialize;
use std::sync::Arc;
use tracing::debug;

use crate::events::{EventDispatcher, SessionEvent};
use crate::signaling::{
    ConnectionState, IceConnectionState, IceGatheringState, SessionDescription, SignalingState,
};

/// Snapshot of every observable state field
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SessionState {
    pub signaling: SignalingState,
    pub ice_connection: IceConnectionState,
    pub ice_gathering: IceGatheringState,
    pub connection: ConnectionState,
    pub local_description: Option<SessionDescription>,
    pub remote_description: Option<SessionDescription>,
}

/// Engine-driven state change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Signaling(SignalingState),
    IceConnection(IceConnectionState),
    IceGathering(IceGatheringState),
}

/// State fields of one session plus change notification
pub struct StateStore {
    state: RwLock<SessionState>,
    events: Arc<EventDispatcher>,
}

impl StateStore {
    pub fn new(events: Arc<EventDispatcher>) -> Self {
        Self {
            state: RwLock::new(SessionState::default()),
            events,
        }
    }

    /// Overwrite a state field and emit its change event
    ///
    /// The change event is emitted even when the value did not change. An ICE
    /// connection transition also emits `connectionstatechange` when the
    /// derived connection state moves.
    pub fn apply_transition(&self, transition: Transition) {
        let mut emitted = Vec::with_capacity(2);
        {
            let mut state = self.state.write();
            match transition {
                Transition::Signaling(value) => {
                    state.signaling = value;
                    emitted.push(SessionEvent::SignalingStateChange { state: value });
                }
                Transition::IceConnection(value) => {
                    state.ice_connection = value;
                    emitted.push(SessionEvent::IceConnectionStateChange { state: value });

                    let derived = ConnectionState::from(value);
                    if derived != state.connection {
                        state.connection = derived;
                        emitted.push(SessionEvent::ConnectionStateChange { state: derived });
                    }
                }
                Transition::IceGathering(value) => {
                    state.ice_gathering = value;
                    emitted.push(SessionEvent::IceGatheringStateChange { state: value });
                }
            }
        }

        debug!("Applied transition {:?}", transition);
        for event in emitted {
            self.events.publish(event);
        }
    }

    pub fn record_local_description(&self, description: SessionDescription) {
        self.state.write().local_description = Some(description);
    }

    pub fn record_remote_description(&self, description: SessionDescription) {
        self.state.write().remote_description = Some(description);
    }

    pub fn signaling_state(&self) -> SignalingState {
        self.state.read().signaling
    }

    pub fn ice_connection_state(&self) -> IceConnectionState {
        self.state.read().ice_connection
    }

    pub fn ice_gathering_state(&self) -> IceGatheringState {
        self.state.read().ice_gathering
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.state.read().connection
    }

    pub fn local_description(&self) -> Option<SessionDescription> {
        self.state.read().local_description.clone()
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.state.read().remote_description.clone()
    }

    pub fn snapshot(&self) -> SessionState {
        self.state.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventKind;

    fn store() -> (StateStore, Arc<EventDispatcher>) {
        let events = Arc::new(EventDispatcher::new());
        (StateStore::new(events.clone()), events)
    }

    #[test]
    fn test_initial_state() {
        let (store, _) = store();
        let state = store.snapshot();
        assert_eq!(state.signaling, SignalingState::Stable);
        assert_eq!(state.ice_connection, IceConnectionState::New);
        assert_eq!(state.ice_gathering, IceGatheringState::New);
        assert_eq!(state.connection, ConnectionState::New);
        assert!(state.local_description.is_none());
        assert!(state.remote_description.is_none());
    }

    #[test]
    fn test_latest_transition_wins() {
        let (store, events) = store();
        let mut sub = events.subscribe([EventKind::IceGatheringStateChange]);

        store.apply_transition(Transition::IceGathering(IceGatheringState::Complete));
        store.apply_transition(Transition::IceGathering(IceGatheringState::Gathering));

        // No legality check: complete -> gathering is accepted as sent
        assert_eq!(store.ice_gathering_state(), IceGatheringState::Gathering);
        assert_eq!(sub.drain().len(), 2);
    }

    #[test]
    fn test_repeated_value_still_emits() {
        let (store, events) = store();
        let mut sub = events.subscribe([EventKind::SignalingStateChange]);

        store.apply_transition(Transition::Signaling(SignalingState::Stable));
        store.apply_transition(Transition::Signaling(SignalingState::Stable));

        assert_eq!(sub.drain().len(), 2);
    }

    #[test]
    fn test_connection_state_follows_ice() {
        let (store, events) = store();
        let mut sub = events.subscribe([EventKind::ConnectionStateChange]);

        store.apply_transition(Transition::IceConnection(IceConnectionState::Checking));
        store.apply_transition(Transition::IceConnection(IceConnectionState::Connected));
        store.apply_transition(Transition::IceConnection(IceConnectionState::Completed));

        assert_eq!(store.connection_state(), ConnectionState::Connected);
        // connected -> completed maps to the same connection state
        let changes = sub.drain();
        assert_eq!(changes.len(), 2);
        assert!(matches!(
            changes[1],
            SessionEvent::ConnectionStateChange {
                state: ConnectionState::Connected
            }
        ));
    }

    #[test]
    fn test_descriptions_recorded() {
        let (store, _) = store();
        store.record_local_description(SessionDescription::offer("local"));
        store.record_remote_description(SessionDescription::answer("remote"));

        assert_eq!(store.local_description().unwrap().sdp, "local");
        assert_eq!(store.remote_description().unwrap().sdp, "remote");
        // Recording a description never touches signaling state
        assert_eq!(store.signaling_state(), SignalingState::Stable);
    }
}
