//! Observer-facing session event types

use serde::Serialize;
use std::fmt;
use std::str::FromStr;

use crate::media::MediaStream;
use crate::signaling::{
    ConnectionState, IceCandidate, IceCandidateError, IceConnectionState, IceGatheringState,
    SignalingState,
};

/// Named event kinds observers can subscribe to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    ConnectionStateChange,
    IceCandidate,
    IceCandidateError,
    IceConnectionStateChange,
    IceGatheringStateChange,
    NegotiationNeeded,
    SignalingStateChange,
    AddStream,
    RemoveStream,
}

impl EventKind {
    pub const ALL: [EventKind; 9] = [
        EventKind::ConnectionStateChange,
        EventKind::IceCandidate,
        EventKind::IceCandidateError,
        EventKind::IceConnectionStateChange,
        EventKind::IceGatheringStateChange,
        EventKind::NegotiationNeeded,
        EventKind::SignalingStateChange,
        EventKind::AddStream,
        EventKind::RemoveStream,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::ConnectionStateChange => "connectionstatechange",
            EventKind::IceCandidate => "icecandidate",
            EventKind::IceCandidateError => "icecandidateerror",
            EventKind::IceConnectionStateChange => "iceconnectionstatechange",
            EventKind::IceGatheringStateChange => "icegatheringstatechange",
            EventKind::NegotiationNeeded => "negotiationneeded",
            EventKind::SignalingStateChange => "signalingstatechange",
            EventKind::AddStream => "addstream",
            EventKind::RemoveStream => "removestream",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventKind::ALL
            .iter()
            .copied()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| format!("unknown event kind: {}", s))
    }
}

/// Session event delivered to observers
///
/// Serialized as `{"event": "<kind>", "data": {...}}`.
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "event", content = "data")]
pub enum SessionEvent {
    #[serde(rename = "connectionstatechange")]
    ConnectionStateChange { state: ConnectionState },

    /// `candidate` is `None` once the engine signals end-of-candidates
    #[serde(rename = "icecandidate")]
    IceCandidate { candidate: Option<IceCandidate> },

    #[serde(rename = "icecandidateerror")]
    IceCandidateError(IceCandidateError),

    #[serde(rename = "iceconnectionstatechange")]
    IceConnectionStateChange { state: IceConnectionState },

    #[serde(rename = "icegatheringstatechange")]
    IceGatheringStateChange { state: IceGatheringState },

    #[serde(rename = "negotiationneeded")]
    NegotiationNeeded,

    #[serde(rename = "signalingstatechange")]
    SignalingStateChange { state: SignalingState },

    #[serde(rename = "addstream")]
    AddStream { stream: MediaStream },

    /// `stream` is `None` when the removed identity was never tracked
    #[serde(rename = "removestream")]
    RemoveStream {
        stream_id: String,
        stream: Option<MediaStream>,
    },
}

impl SessionEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            SessionEvent::ConnectionStateChange { .. } => EventKind::ConnectionStateChange,
            SessionEvent::IceCandidate { .. } => EventKind::IceCandidate,
            SessionEvent::IceCandidateError(_) => EventKind::IceCandidateError,
            SessionEvent::IceConnectionStateChange { .. } => EventKind::IceConnectionStateChange,
            SessionEvent::IceGatheringStateChange { .. } => EventKind::IceGatheringStateChange,
            SessionEvent::NegotiationNeeded => EventKind::NegotiationNeeded,
            SessionEvent::SignalingStateChange { .. } => EventKind::SignalingStateChange,
            SessionEvent::AddStream { .. } => EventKind::AddStream,
            SessionEvent::RemoveStream { .. } => EventKind::RemoveStream,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::Track;

    #[test]
    fn test_kind_names_round_trip() {
        for kind in EventKind::ALL {
            assert_eq!(kind.as_str().parse::<EventKind>().unwrap(), kind);
        }
        assert!("trackadded".parse::<EventKind>().is_err());
    }

    #[test]
    fn test_event_serialization() {
        let event = SessionEvent::SignalingStateChange {
            state: SignalingState::HaveLocalOffer,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "signalingstatechange");
        assert_eq!(json["data"]["state"], "have-local-offer");

        let event = SessionEvent::RemoveStream {
            stream_id: "s9".to_string(),
            stream: None,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "removestream");
        assert!(json["data"]["stream"].is_null());
    }

    #[test]
    fn test_event_kind_mapping() {
        let event = SessionEvent::AddStream {
            stream: MediaStream::new("s1", vec![Track::audio("t1")]),
        };
        assert_eq!(event.kind(), EventKind::AddStream);
        assert_eq!(SessionEvent::NegotiationNeeded.kind().to_string(), "negotiationneeded");
    }
}
