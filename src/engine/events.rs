//! Inbound engine notifications and the shared channel that carries them
//!
//! Wire shape of one notification:
//!
//! ```json
//! { "sessionId": 1, "event": { "type": "stream-added", "streamId": "s1", "tracks": [] } }
//! ```

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::{Result, RtcError};
use crate::media::Track;
use crate::session::SessionId;
use crate::signaling::{
    IceCandidate, IceCandidateError, IceConnectionState, IceGatheringState, SignalingState,
};

/// Kind-specific payload of an engine notification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum EngineEventKind {
    NegotiationNeeded,
    IceConnectionChanged {
        state: IceConnectionState,
    },
    SignalingStateChanged {
        state: SignalingState,
    },
    StreamAdded {
        #[serde(rename = "streamId")]
        stream_id: String,
        #[serde(default)]
        tracks: Vec<Track>,
    },
    StreamRemoved {
        #[serde(rename = "streamId")]
        stream_id: String,
    },
    /// `candidate: null` marks end-of-candidates
    IceCandidate {
        #[serde(default)]
        candidate: Option<IceCandidate>,
    },
    IceGatheringChanged {
        state: IceGatheringState,
    },
    IceCandidateError(IceCandidateError),
}

impl EngineEventKind {
    pub fn name(&self) -> &'static str {
        match self {
            EngineEventKind::NegotiationNeeded => "negotiation-needed",
            EngineEventKind::IceConnectionChanged { .. } => "ice-connection-changed",
            EngineEventKind::SignalingStateChanged { .. } => "signaling-state-changed",
            EngineEventKind::StreamAdded { .. } => "stream-added",
            EngineEventKind::StreamRemoved { .. } => "stream-removed",
            EngineEventKind::IceCandidate { .. } => "ice-candidate",
            EngineEventKind::IceGatheringChanged { .. } => "ice-gathering-changed",
            EngineEventKind::IceCandidateError(_) => "ice-candidate-error",
        }
    }
}

/// Engine notification addressed to one session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineEvent {
    #[serde(rename = "sessionId")]
    pub session_id: SessionId,
    pub event: EngineEventKind,
}

impl EngineEvent {
    pub fn new(session_id: SessionId, event: EngineEventKind) -> Self {
        Self { session_id, event }
    }

    /// Decode a notification from its JSON wire form
    ///
    /// Unknown event types and state names are rejected here rather than
    /// propagated into session state.
    pub fn from_json(raw: &str) -> Result<Self> {
        serde_json::from_str(raw)
            .map_err(|e| RtcError::Decode(format!("invalid engine event: {}", e)))
    }
}

/// Process-wide queue carrying engine notifications for every session
///
/// Engines publish here; the [`EventRouter`](crate::router::EventRouter) is
/// the single consumer and fans notifications out per session. The queue is
/// unbounded and notifications published before the router starts are kept,
/// so none is ever dropped or coalesced.
#[derive(Clone)]
pub struct EngineEventBus {
    tx: mpsc::UnboundedSender<EngineEvent>,
    rx: Arc<Mutex<Option<mpsc::UnboundedReceiver<EngineEvent>>>>,
}

impl EngineEventBus {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Arc::new(Mutex::new(Some(rx))),
        }
    }

    /// Publish a notification
    ///
    /// Only fails to deliver once the consumer has shut down.
    pub fn publish(&self, event: EngineEvent) {
        if let Err(e) = self.tx.send(event) {
            debug!(
                "Engine event {} for session {} published after the router stopped",
                e.0.event.name(),
                e.0.session_id
            );
        }
    }

    /// Decode and publish a JSON notification
    pub fn publish_json(&self, raw: &str) -> Result<()> {
        self.publish(EngineEvent::from_json(raw)?);
        Ok(())
    }

    /// Take the consuming end. Only the first call gets it.
    pub fn take_receiver(&self) -> Option<mpsc::UnboundedReceiver<EngineEvent>> {
        self.rx.lock().take()
    }

    /// Whether the consuming end has been taken
    pub fn has_consumer(&self) -> bool {
        self.rx.lock().is_none()
    }
}

impl Default for EngineEventBus {
    fn default() -> Self {
        Self::new()
    }
}
