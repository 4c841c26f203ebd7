//! In-process loopback engine
//!
//! Runs the offer/answer state machine locally and publishes the notifications
//! a real engine would on the shared bus. Nothing leaves the process: the
//! generated descriptions only carry the local stream identities, which the
//! peer that applies them reports back as remote streams.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, trace, warn};

use super::{Completion, EngineEvent, EngineEventBus, EngineEventKind, EngineFailure, NegotiationEngine, StatsEntry, StatsReport};
use crate::config::{LoopbackConfig, SessionConfig};
use crate::media::Track;
use crate::session::data_channel::DataChannelOptions;
use crate::session::{CommandKind, SessionId};
use crate::signaling::{
    IceCandidate, IceConnectionState, IceGatheringState, MediaConstraints, SdpType,
    SessionDescription, SignalingState,
};

const MSID_PREFIX: &str = "a=msid:";

#[derive(Debug, Default)]
struct PeerState {
    signaling: SignalingState,
    ice: IceConnectionState,
    gathering: IceGatheringState,
    local_streams: Vec<String>,
    /// (stream id, track) pairs added with `add_track`
    local_tracks: Vec<(String, Track)>,
    remote_streams: Vec<String>,
    has_local: bool,
    has_remote: bool,
    sdp_version: u64,
    candidates_added: u64,
    data_channels: Vec<String>,
}

impl PeerState {
    fn describe(&mut self, session: SessionId, sdp_type: SdpType) -> SessionDescription {
        self.sdp_version += 1;
        let mut sdp = format!(
            "v=0\r\no=- {} {} IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n",
            session, self.sdp_version
        );
        for stream in &self.local_streams {
            let mut tracks = self.local_tracks.iter().filter(|(s, _)| s == stream).peekable();
            if tracks.peek().is_none() {
                sdp.push_str(&format!("{}{}\r\n", MSID_PREFIX, stream));
            }
            for (_, track) in tracks {
                sdp.push_str(&format!("{}{} {} {}\r\n", MSID_PREFIX, stream, track.id, track.kind));
            }
        }
        SessionDescription::new(sdp_type, sdp)
    }
}

/// Streams (and their tracks) announced by a description
///
/// Lines have the form `a=msid:<stream> [<track> <audio|video>]`.
fn announced_streams(sdp: &str) -> Vec<(String, Vec<Track>)> {
    let mut streams: Vec<(String, Vec<Track>)> = Vec::new();
    for line in sdp.lines() {
        let Some(rest) = line.trim().strip_prefix(MSID_PREFIX) else {
            continue;
        };
        let mut parts = rest.split_whitespace();
        let Some(id) = parts.next() else {
            continue;
        };
        let track = match (parts.next(), parts.next()) {
            (Some(track_id), Some("audio")) => Some(Track::audio(track_id)),
            (Some(track_id), Some("video")) => Some(Track::video(track_id)),
            _ => None,
        };

        let index = match streams.iter().position(|(s, _)| s == id) {
            Some(index) => index,
            None => {
                streams.push((id.to_string(), Vec::new()));
                streams.len() - 1
            }
        };
        if let Some(track) = track {
            streams[index].1.push(track);
        }
    }
    streams
}

/// Host candidate port, kept inside the dynamic range (49152-65535)
fn candidate_port(n: u32) -> u32 {
    49_152 + n % 16_384
}

/// Next signaling state for applying a description, `None` if not allowed
fn next_signaling(current: SignalingState, sdp_type: SdpType, local: bool) -> Option<SignalingState> {
    use SignalingState::*;
    match (current, sdp_type, local) {
        (Stable | HaveLocalOffer, SdpType::Offer, true) => Some(HaveLocalOffer),
        (HaveRemoteOffer | HaveLocalPranswer, SdpType::Answer, true) => Some(Stable),
        (HaveRemoteOffer | HaveLocalPranswer, SdpType::Pranswer, true) => Some(HaveLocalPranswer),
        (Stable | HaveRemoteOffer, SdpType::Offer, false) => Some(HaveRemoteOffer),
        (HaveLocalOffer | HaveRemotePranswer, SdpType::Answer, false) => Some(Stable),
        (HaveLocalOffer | HaveRemotePranswer, SdpType::Pranswer, false) => Some(HaveRemotePranswer),
        _ => None,
    }
}

/// Loopback [`NegotiationEngine`]
pub struct LoopbackEngine {
    bus: EngineEventBus,
    config: LoopbackConfig,
    peers: Mutex<HashMap<SessionId, PeerState>>,
    injected: Mutex<HashMap<CommandKind, EngineFailure>>,
}

impl LoopbackEngine {
    pub fn new(bus: EngineEventBus, config: LoopbackConfig) -> Self {
        Self {
            bus,
            config,
            peers: Mutex::new(HashMap::new()),
            injected: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &LoopbackConfig {
        &self.config
    }

    /// Fail the next command of `kind`, whichever session issues it
    pub fn fail_next(&self, kind: CommandKind, failure: impl Into<EngineFailure>) {
        self.injected.lock().insert(kind, failure.into());
    }

    /// Number of sessions with engine resources bound
    pub fn session_count(&self) -> usize {
        self.peers.lock().len()
    }

    fn emit(&self, session: SessionId, event: EngineEventKind) {
        trace!("Loopback {}: emitting {}", session, event.name());
        self.bus.publish(EngineEvent::new(session, event));
    }

    fn take_injected(&self, kind: CommandKind) -> Option<EngineFailure> {
        self.injected.lock().remove(&kind)
    }

    /// Resolve a completion on a runtime task, after the configured delay if any
    ///
    /// Outside a runtime the completion is resolved inline.
    fn finish<T: Send + 'static>(&self, done: Completion<T>, result: Result<T, EngineFailure>) {
        let delay = self.config.completion_delay_ms;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if delay > 0 {
                        tokio::time::sleep(Duration::from_millis(delay)).await;
                    }
                    done.complete(result);
                });
            }
            Err(_) => {
                if delay > 0 {
                    warn!("No runtime for delayed completion, resolving inline");
                }
                done.complete(result);
            }
        }
    }

    fn with_peer<R>(
        &self,
        session: SessionId,
        f: impl FnOnce(&mut PeerState) -> Result<R, EngineFailure>,
    ) -> Result<R, EngineFailure> {
        let mut peers = self.peers.lock();
        match peers.get_mut(&session) {
            Some(peer) => f(peer),
            None => Err(EngineFailure::message(format!("unknown session {}", session))),
        }
    }

    fn create_description(&self, session: SessionId, kind: CommandKind, done: Completion<SessionDescription>) {
        if let Some(failure) = self.take_injected(kind) {
            return self.finish(done, Err(failure));
        }

        let result = self.with_peer(session, |peer| match kind {
            CommandKind::CreateAnswer => match peer.signaling {
                SignalingState::HaveRemoteOffer | SignalingState::HaveLocalPranswer => {
                    Ok(peer.describe(session, SdpType::Answer))
                }
                state => Err(EngineFailure::message(format!(
                    "cannot create answer in state {}",
                    state
                ))),
            },
            _ => match peer.signaling {
                SignalingState::Stable | SignalingState::HaveLocalOffer => {
                    Ok(peer.describe(session, SdpType::Offer))
                }
                state => Err(EngineFailure::message(format!(
                    "cannot create offer in state {}",
                    state
                ))),
            },
        });
        self.finish(done, result);
    }

    fn apply_description(&self, session: SessionId, raw: &str, local: bool, done: Completion<()>) {
        let kind = if local {
            CommandKind::SetLocalDescription
        } else {
            CommandKind::SetRemoteDescription
        };
        if let Some(failure) = self.take_injected(kind) {
            return self.finish(done, Err(failure));
        }

        let description: SessionDescription = match serde_json::from_str(raw) {
            Ok(d) => d,
            Err(e) => {
                return self.finish(
                    done,
                    Err(EngineFailure::message(format!("invalid description: {}", e))),
                )
            }
        };

        let mut events = Vec::new();
        let result = self.with_peer(session, |peer| {
            let next = next_signaling(peer.signaling, description.sdp_type, local).ok_or_else(|| {
                EngineFailure::message(format!(
                    "cannot apply {} {} in state {}",
                    if local { "local" } else { "remote" },
                    description.sdp_type,
                    peer.signaling
                ))
            })?;

            if next != peer.signaling {
                peer.signaling = next;
                events.push(EngineEventKind::SignalingStateChanged { state: next });
            }

            if local {
                peer.has_local = true;
                if peer.gathering == IceGatheringState::New {
                    peer.gathering = IceGatheringState::Gathering;
                    events.push(EngineEventKind::IceGatheringChanged {
                        state: IceGatheringState::Gathering,
                    });
                    for n in 0..u32::from(self.config.gather_candidates) {
                        let candidate = IceCandidate::new(format!(
                            "candidate:{} 1 udp {} 127.0.0.1 {} typ host",
                            n + 1,
                            2_130_706_431 - n,
                            candidate_port(n)
                        ))
                        .with_mid("0", 0);
                        events.push(EngineEventKind::IceCandidate {
                            candidate: Some(candidate),
                        });
                    }
                    events.push(EngineEventKind::IceCandidate { candidate: None });
                    peer.gathering = IceGatheringState::Complete;
                    events.push(EngineEventKind::IceGatheringChanged {
                        state: IceGatheringState::Complete,
                    });
                }
            } else {
                peer.has_remote = true;
                let announced = announced_streams(&description.sdp);
                for gone in peer
                    .remote_streams
                    .iter()
                    .filter(|s| !announced.iter().any(|(id, _)| id == *s))
                {
                    events.push(EngineEventKind::StreamRemoved {
                        stream_id: gone.clone(),
                    });
                }
                for (added, tracks) in announced
                    .iter()
                    .filter(|(id, _)| !peer.remote_streams.contains(id))
                {
                    events.push(EngineEventKind::StreamAdded {
                        stream_id: added.clone(),
                        tracks: tracks.clone(),
                    });
                }
                peer.remote_streams = announced.into_iter().map(|(id, _)| id).collect();
            }

            if peer.signaling == SignalingState::Stable
                && peer.has_local
                && peer.has_remote
                && peer.ice == IceConnectionState::New
            {
                for state in [IceConnectionState::Checking, IceConnectionState::Connected] {
                    peer.ice = state;
                    events.push(EngineEventKind::IceConnectionChanged { state });
                }
            }

            Ok(())
        });

        for event in events {
            self.emit(session, event);
        }
        self.finish(done, result);
    }
}

impl NegotiationEngine for LoopbackEngine {
    fn init(&self, session: SessionId, config: &SessionConfig) {
        debug!(
            "Loopback {}: init ({} ICE servers, {:?} transport, {:?} bundle)",
            session,
            config.ice_servers.len(),
            config.ice_transport_policy,
            config.bundle_policy
        );
        self.peers.lock().insert(session, PeerState::default());
    }

    fn add_stream(&self, session: SessionId, stream_id: &str) {
        let added = self
            .with_peer(session, |peer| {
                if peer.local_streams.iter().any(|s| s == stream_id) {
                    return Ok(false);
                }
                peer.local_streams.push(stream_id.to_string());
                Ok(true)
            })
            .unwrap_or(false);
        if added {
            self.emit(session, EngineEventKind::NegotiationNeeded);
        }
    }

    fn add_track(&self, session: SessionId, stream_id: &str, track: &Track) {
        let changed = self
            .with_peer(session, |peer| {
                let mut changed = false;
                if !peer.local_streams.iter().any(|s| s == stream_id) {
                    peer.local_streams.push(stream_id.to_string());
                    changed = true;
                }
                if !peer
                    .local_tracks
                    .iter()
                    .any(|(s, t)| s == stream_id && t.id == track.id)
                {
                    peer.local_tracks.push((stream_id.to_string(), track.clone()));
                    changed = true;
                }
                Ok(changed)
            })
            .unwrap_or(false);
        if changed {
            self.emit(session, EngineEventKind::NegotiationNeeded);
        }
    }

    fn remove_stream(&self, session: SessionId, stream_id: &str) {
        let removed = self
            .with_peer(session, |peer| {
                let before = peer.local_streams.len();
                peer.local_streams.retain(|s| s != stream_id);
                peer.local_tracks.retain(|(s, _)| s != stream_id);
                Ok(peer.local_streams.len() != before)
            })
            .unwrap_or(false);
        if removed {
            self.emit(session, EngineEventKind::NegotiationNeeded);
        }
    }

    fn create_offer(
        &self,
        session: SessionId,
        constraints: &MediaConstraints,
        done: Completion<SessionDescription>,
    ) {
        trace!("Loopback {}: createOffer {}", session, constraints.0);
        self.create_description(session, CommandKind::CreateOffer, done);
    }

    fn create_answer(
        &self,
        session: SessionId,
        constraints: &MediaConstraints,
        done: Completion<SessionDescription>,
    ) {
        trace!("Loopback {}: createAnswer {}", session, constraints.0);
        self.create_description(session, CommandKind::CreateAnswer, done);
    }

    fn set_local_description(&self, session: SessionId, description: &str, done: Completion<()>) {
        self.apply_description(session, description, true, done);
    }

    fn set_remote_description(&self, session: SessionId, description: &str, done: Completion<()>) {
        self.apply_description(session, description, false, done);
    }

    fn add_ice_candidate(&self, session: SessionId, candidate: &str, done: Completion<()>) {
        if let Some(failure) = self.take_injected(CommandKind::AddIceCandidate) {
            return self.finish(done, Err(failure));
        }

        let result = serde_json::from_str::<IceCandidate>(candidate)
            .map_err(|e| EngineFailure::message(format!("invalid candidate: {}", e)))
            .and_then(|candidate| {
                self.with_peer(session, |peer| {
                    if !peer.has_remote {
                        return Err(EngineFailure::message("remote description not set"));
                    }
                    peer.candidates_added += 1;
                    trace!("Loopback {}: candidate {}", session, candidate.candidate);
                    Ok(())
                })
            });
        self.finish(done, result);
    }

    fn supports_stats(&self) -> bool {
        self.config.stats_supported
    }

    fn get_stats(&self, session: SessionId, track_id: Option<&str>, done: Completion<StatsReport>) {
        if let Some(failure) = self.take_injected(CommandKind::GetStats) {
            return self.finish(done, Err(failure));
        }

        let result = self.with_peer(session, |peer| {
            let mut values = serde_json::Map::new();
            values.insert("iceConnectionState".into(), peer.ice.to_string().into());
            values.insert("candidatesAdded".into(), peer.candidates_added.into());
            values.insert("dataChannelsOpened".into(), peer.data_channels.len().into());
            let mut entries = vec![StatsEntry {
                id: format!("PC{}", session),
                kind: "peer-connection".to_string(),
                values,
            }];

            if let Some(track) = track_id {
                let known = peer
                    .local_streams
                    .iter()
                    .chain(peer.remote_streams.iter())
                    .any(|s| s == track)
                    || peer.local_tracks.iter().any(|(_, t)| t.id == track);
                let mut values = serde_json::Map::new();
                values.insert("known".into(), known.into());
                entries.push(StatsEntry {
                    id: track.to_string(),
                    kind: "track".to_string(),
                    values,
                });
            }
            Ok(StatsReport::new(entries))
        });
        self.finish(done, result);
    }

    fn create_data_channel(&self, session: SessionId, label: &str, options: &DataChannelOptions) {
        let _ = self.with_peer(session, |peer| {
            debug!(
                "Loopback {}: data channel '{}' (ordered: {})",
                session, label, options.ordered
            );
            peer.data_channels.push(label.to_string());
            Ok(())
        });
    }

    fn close(&self, session: SessionId) {
        if self.peers.lock().remove(&session).is_none() {
            debug!("Loopback {}: close for unknown session", session);
            return;
        }
        self.emit(
            session,
            EngineEventKind::SignalingStateChanged {
                state: SignalingState::Closed,
            },
        );
        self.emit(
            session,
            EngineEventKind::IceConnectionChanged {
                state: IceConnectionState::Closed,
            },
        );
    }
}
