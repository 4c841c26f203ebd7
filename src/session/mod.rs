//! Peer session: negotiation commands, routed engine events and observable state
//!
//! ```text
//!            commands                         engine notifications
//! caller ──> Session ──> CommandPipeline ──> NegotiationEngine ──> EngineEventBus
//!              ^                                                        │
//!              │  StateStore / RemoteStreamSet <── Session <── EventRouter
//!              │              │
//!              └── EventDispatcher ──> observers
//! ```
//!
//! A session is torn down when the engine reports ICE connection state
//! `closed`: its route is released, observers are unsubscribed, and any further
//! command is rejected with [`RtcError::SessionClosed`].

pub mod data_channel;
pub mod pipeline;
pub mod registry;
pub mod state;
pub mod streams;

pub use data_channel::{DataChannel, DataChannelOptions};
pub use pipeline::{CommandKind, CommandPipeline, CommandTicket};
pub use registry::{SessionInfo, SessionRegistry};
pub use state::{SessionState, StateStore, Transition};
pub use streams::RemoteStreamSet;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use tracing::{debug, info, warn};

use crate::config::SessionConfig;
use crate::engine::{EngineEventKind, NegotiationEngine, StatsReport};
use crate::error::{Result, RtcError};
use crate::events::{EventDispatcher, EventKind, EventSubscription, SessionEvent, SubscriberId};
use crate::media::{MediaStream, Track};
use crate::router::{EventRouter, EventSink, RouteHandle};
use crate::signaling::{
    ConnectionState, IceCandidate, IceConnectionState, IceGatheringState, MediaConstraints,
    SessionDescription, SignalingState,
};

/// Session identity, allocated by the [`SessionRegistry`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(u64);

impl SessionId {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

struct SessionInner {
    id: SessionId,
    created_at: DateTime<Utc>,
    engine: Arc<dyn NegotiationEngine>,
    events: Arc<EventDispatcher>,
    state: Arc<StateStore>,
    remote_streams: RemoteStreamSet,
    pipeline: Arc<CommandPipeline>,
    route: OnceLock<RouteHandle>,
    /// Set once ICE connection state `closed` has been applied
    torn_down: AtomicBool,
    close_requested: AtomicBool,
    local_streams: Mutex<Vec<String>>,
    data_channels: Mutex<Vec<DataChannel>>,
}

impl SessionInner {
    fn teardown(&self) {
        if self.torn_down.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(route) = self.route.get() {
            route.release();
        }
        self.events.clear();
        info!("Session {} torn down", self.id);
    }
}

impl EventSink for SessionInner {
    fn deliver(&self, event: EngineEventKind) {
        if self.torn_down.load(Ordering::Acquire) {
            return;
        }

        match event {
            EngineEventKind::NegotiationNeeded => {
                self.events.publish(SessionEvent::NegotiationNeeded);
            }
            EngineEventKind::IceConnectionChanged { state } => {
                self.state
                    .apply_transition(Transition::IceConnection(state));
                if state == IceConnectionState::Closed {
                    self.teardown();
                }
            }
            EngineEventKind::SignalingStateChanged { state } => {
                self.state.apply_transition(Transition::Signaling(state));
            }
            EngineEventKind::StreamAdded { stream_id, tracks } => {
                self.remote_streams.add_stream(stream_id, tracks);
            }
            EngineEventKind::StreamRemoved { stream_id } => {
                self.remote_streams.remove_stream(&stream_id);
            }
            EngineEventKind::IceCandidate { candidate } => {
                self.events.publish(SessionEvent::IceCandidate { candidate });
            }
            EngineEventKind::IceGatheringChanged { state } => {
                self.state.apply_transition(Transition::IceGathering(state));
            }
            EngineEventKind::IceCandidateError(error) => {
                debug!(
                    "Session {} candidate error {}: {}",
                    self.id, error.error_code, error.error_text
                );
                self.events.publish(SessionEvent::IceCandidateError(error));
            }
        }
    }
}

/// One negotiation endpoint
///
/// Cheap to clone; clones share the same session.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    /// Open a session: register its route, then initialise it in the engine
    pub fn open(
        id: SessionId,
        config: &SessionConfig,
        engine: Arc<dyn NegotiationEngine>,
        router: &Arc<EventRouter>,
    ) -> Result<Self> {
        let events = Arc::new(EventDispatcher::new());
        let inner = Arc::new(SessionInner {
            id,
            created_at: Utc::now(),
            engine,
            state: Arc::new(StateStore::new(events.clone())),
            remote_streams: RemoteStreamSet::new(events.clone()),
            events,
            pipeline: CommandPipeline::new(id),
            route: OnceLock::new(),
            torn_down: AtomicBool::new(false),
            close_requested: AtomicBool::new(false),
            local_streams: Mutex::new(Vec::new()),
            data_channels: Mutex::new(Vec::new()),
        });

        let sink: Arc<dyn EventSink> = inner.clone();
        let handle = router.register(id, Arc::downgrade(&sink))?;
        if inner.route.set(handle).is_err() {
            return Err(RtcError::Internal(format!("session {} routed twice", id)));
        }

        inner.engine.init(id, config);
        info!("Session {} opened", id);

        Ok(Self { inner })
    }

    pub fn id(&self) -> SessionId {
        self.inner.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.inner.created_at
    }

    /// Whether ICE connection state `closed` has been received
    pub fn is_closed(&self) -> bool {
        self.inner.torn_down.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(RtcError::SessionClosed(self.inner.id));
        }
        Ok(())
    }

    fn reject<T>(&self, kind: CommandKind, err: RtcError) -> CommandTicket<T> {
        debug!("Session {}: {} rejected: {}", self.inner.id, kind, err);
        self.inner.pipeline.resolved(kind, Err(err))
    }

    // ------------------------------------------------------------------
    // Negotiation commands
    // ------------------------------------------------------------------

    /// Ask the engine for an offer. Constraints are forwarded unmodified.
    pub fn create_offer(&self, constraints: MediaConstraints) -> CommandTicket<SessionDescription> {
        self.create_description(CommandKind::CreateOffer, constraints)
    }

    /// Ask the engine for an answer. Constraints are forwarded unmodified.
    pub fn create_answer(&self, constraints: MediaConstraints) -> CommandTicket<SessionDescription> {
        self.create_description(CommandKind::CreateAnswer, constraints)
    }

    fn create_description(
        &self,
        kind: CommandKind,
        constraints: MediaConstraints,
    ) -> CommandTicket<SessionDescription> {
        if let Err(e) = self.ensure_open() {
            return self.reject(kind, e);
        }

        let inner = &self.inner;
        inner.pipeline.issue(kind, Ok, |done| match kind {
            CommandKind::CreateAnswer => inner.engine.create_answer(inner.id, &constraints, done),
            _ => inner.engine.create_offer(inner.id, &constraints, done),
        })
    }

    /// Apply a local description
    ///
    /// On success the given description (not an engine echo) becomes
    /// `local_description` before the ticket resolves. Signaling state only
    /// changes when the engine reports it.
    pub fn set_local_description(&self, description: SessionDescription) -> CommandTicket<()> {
        self.set_description(CommandKind::SetLocalDescription, description)
    }

    /// Apply a remote description. Mirrors [`set_local_description`](Self::set_local_description).
    pub fn set_remote_description(&self, description: SessionDescription) -> CommandTicket<()> {
        self.set_description(CommandKind::SetRemoteDescription, description)
    }

    fn set_description(&self, kind: CommandKind, description: SessionDescription) -> CommandTicket<()> {
        if let Err(e) = self.ensure_open() {
            return self.reject(kind, e);
        }
        let wire = match serde_json::to_string(&description) {
            Ok(wire) => wire,
            Err(e) => return self.reject(kind, e.into()),
        };

        let inner = &self.inner;
        let state = inner.state.clone();
        let local = kind == CommandKind::SetLocalDescription;
        let record = move |()| {
            if local {
                state.record_local_description(description);
            } else {
                state.record_remote_description(description);
            }
            Ok(())
        };

        inner.pipeline.issue(kind, record, |done| {
            if local {
                inner.engine.set_local_description(inner.id, &wire, done);
            } else {
                inner.engine.set_remote_description(inner.id, &wire, done);
            }
        })
    }

    /// Hand a remote candidate to the engine
    ///
    /// Call [`CommandTicket::detach`] when the outcome does not matter.
    pub fn add_ice_candidate(&self, candidate: IceCandidate) -> CommandTicket<()> {
        let kind = CommandKind::AddIceCandidate;
        if let Err(e) = self.ensure_open() {
            return self.reject(kind, e);
        }
        let wire = match serde_json::to_string(&candidate) {
            Ok(wire) => wire,
            Err(e) => return self.reject(kind, e.into()),
        };

        let inner = &self.inner;
        inner.pipeline.issue(kind, Ok, |done| {
            inner.engine.add_ice_candidate(inner.id, &wire, done)
        })
    }

    /// Fetch statistics, optionally for one track
    ///
    /// Resolves to `Ok(None)` with a warning when the engine cannot collect
    /// statistics.
    pub fn get_stats(&self, track_id: Option<&str>) -> CommandTicket<Option<StatsReport>> {
        let kind = CommandKind::GetStats;
        if let Err(e) = self.ensure_open() {
            return self.reject(kind, e);
        }

        let inner = &self.inner;
        if !inner.engine.supports_stats() {
            warn!(
                "Session {}: engine does not support statistics, getStats ignored",
                inner.id
            );
            return inner.pipeline.resolved(kind, Ok(None));
        }

        inner.pipeline.issue(kind, |report| Ok(Some(report)), |done| {
            inner.engine.get_stats(inner.id, track_id, done)
        })
    }

    /// Request teardown from the engine
    ///
    /// State is not changed here; the session closes when the engine confirms
    /// with ICE connection state `closed`. Repeated calls are no-ops.
    pub fn close(&self) {
        if self.is_closed() || self.inner.close_requested.swap(true, Ordering::AcqRel) {
            debug!("Session {}: close already requested", self.inner.id);
            return;
        }
        info!("Session {}: close requested", self.inner.id);
        self.inner.engine.close(self.inner.id);
    }

    pub fn is_close_requested(&self) -> bool {
        self.inner.close_requested.load(Ordering::Acquire)
    }

    /// Create a data channel handle bound to this session
    pub fn create_data_channel(
        &self,
        label: impl Into<String>,
        options: DataChannelOptions,
    ) -> Result<DataChannel> {
        self.ensure_open()?;

        let channel = DataChannel::new(self.inner.id, label, options);
        self.inner
            .engine
            .create_data_channel(self.inner.id, channel.label(), channel.options());
        info!(
            "Session {}: data channel '{}' created",
            self.inner.id,
            channel.label()
        );
        self.inner.data_channels.lock().push(channel.clone());
        Ok(channel)
    }

    pub fn data_channels(&self) -> Vec<DataChannel> {
        self.inner.data_channels.lock().clone()
    }

    // ------------------------------------------------------------------
    // Local (outbound) media
    // ------------------------------------------------------------------

    /// Offer a local stream to the engine
    ///
    /// Adding an identity twice forwards it once. Remote streams are not
    /// affected.
    pub fn add_stream(&self, stream_id: &str) -> Result<()> {
        self.ensure_open()?;
        {
            let mut local = self.inner.local_streams.lock();
            if local.iter().any(|s| s == stream_id) {
                return Ok(());
            }
            local.push(stream_id.to_string());
        }
        self.inner.engine.add_stream(self.inner.id, stream_id);
        debug!("Session {}: local stream {} added", self.inner.id, stream_id);
        Ok(())
    }

    /// Add a local track as part of `stream_id`
    ///
    /// Every track is forwarded, including further tracks of a stream that is
    /// already local.
    pub fn add_track(&self, track: &Track, stream_id: &str) -> Result<()> {
        self.ensure_open()?;
        {
            let mut local = self.inner.local_streams.lock();
            if !local.iter().any(|s| s == stream_id) {
                local.push(stream_id.to_string());
            }
        }
        self.inner.engine.add_track(self.inner.id, stream_id, track);
        debug!(
            "Session {}: {} track {} added to stream {}",
            self.inner.id, track.kind, track.id, stream_id
        );
        Ok(())
    }

    /// Withdraw a local stream from the engine
    pub fn remove_stream(&self, stream_id: &str) -> Result<()> {
        self.ensure_open()?;
        self.inner.local_streams.lock().retain(|s| s != stream_id);
        self.inner.engine.remove_stream(self.inner.id, stream_id);
        debug!("Session {}: local stream {} removed", self.inner.id, stream_id);
        Ok(())
    }

    pub fn local_streams(&self) -> Vec<String> {
        self.inner.local_streams.lock().clone()
    }

    // ------------------------------------------------------------------
    // State
    // ------------------------------------------------------------------

    pub fn signaling_state(&self) -> SignalingState {
        self.inner.state.signaling_state()
    }

    pub fn ice_connection_state(&self) -> IceConnectionState {
        self.inner.state.ice_connection_state()
    }

    pub fn ice_gathering_state(&self) -> IceGatheringState {
        self.inner.state.ice_gathering_state()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.inner.state.connection_state()
    }

    pub fn local_description(&self) -> Option<SessionDescription> {
        self.inner.state.local_description()
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.inner.state.remote_description()
    }

    pub fn state(&self) -> SessionState {
        self.inner.state.snapshot()
    }

    pub fn remote_streams(&self) -> Vec<MediaStream> {
        self.inner.remote_streams.list()
    }

    pub fn remote_stream(&self, id: &str) -> Option<MediaStream> {
        self.inner.remote_streams.get(id)
    }

    /// Commands still awaiting completion
    pub fn pending_commands(&self) -> usize {
        self.inner.pipeline.in_flight()
    }

    // ------------------------------------------------------------------
    // Observers
    // ------------------------------------------------------------------

    pub fn subscribe(&self, kinds: impl IntoIterator<Item = EventKind>) -> EventSubscription {
        self.inner.events.subscribe(kinds)
    }

    pub fn subscribe_all(&self) -> EventSubscription {
        self.inner.events.subscribe_all()
    }

    pub fn on<F>(&self, kind: EventKind, handler: F) -> SubscriberId
    where
        F: Fn(&SessionEvent) + Send + Sync + 'static,
    {
        self.inner.events.on(kind, handler)
    }

    pub fn off(&self, id: SubscriberId) -> bool {
        self.inner.events.off(id)
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.inner.id)
            .field("signaling", &self.signaling_state())
            .field("ice_connection", &self.ice_connection_state())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{Completion, EngineEvent, EngineEventBus, EngineFailure, StatsEntry};
    use crate::media::TrackKind;

    /// Engine that records commands and parks completions for the test to resolve
    #[derive(Default)]
    struct ManualEngine {
        calls: Mutex<Vec<String>>,
        descriptions: Mutex<Vec<Completion<SessionDescription>>>,
        applies: Mutex<Vec<Completion<()>>>,
        stats: bool,
    }

    impl ManualEngine {
        fn with_stats() -> Self {
            Self {
                stats: true,
                ..Default::default()
            }
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }

        fn record(&self, call: String) {
            self.calls.lock().push(call);
        }

        fn next_description(&self) -> Completion<SessionDescription> {
            self.descriptions.lock().remove(0)
        }

        fn next_apply(&self) -> Completion<()> {
            self.applies.lock().remove(0)
        }
    }

    impl NegotiationEngine for ManualEngine {
        fn init(&self, session: SessionId, _config: &SessionConfig) {
            self.record(format!("init {}", session));
        }

        fn add_stream(&self, session: SessionId, stream_id: &str) {
            self.record(format!("add_stream {} {}", session, stream_id));
        }

        fn add_track(&self, session: SessionId, stream_id: &str, track: &Track) {
            self.record(format!("add_track {} {} {}", session, stream_id, track.id));
        }

        fn remove_stream(&self, session: SessionId, stream_id: &str) {
            self.record(format!("remove_stream {} {}", session, stream_id));
        }

        fn create_offer(
            &self,
            session: SessionId,
            constraints: &MediaConstraints,
            done: Completion<SessionDescription>,
        ) {
            self.record(format!("create_offer {} {}", session, constraints.0));
            self.descriptions.lock().push(done);
        }

        fn create_answer(
            &self,
            session: SessionId,
            _constraints: &MediaConstraints,
            done: Completion<SessionDescription>,
        ) {
            self.record(format!("create_answer {}", session));
            self.descriptions.lock().push(done);
        }

        fn set_local_description(&self, session: SessionId, description: &str, done: Completion<()>) {
            self.record(format!("set_local {} {}", session, description));
            self.applies.lock().push(done);
        }

        fn set_remote_description(&self, session: SessionId, description: &str, done: Completion<()>) {
            self.record(format!("set_remote {} {}", session, description));
            self.applies.lock().push(done);
        }

        fn add_ice_candidate(&self, session: SessionId, candidate: &str, done: Completion<()>) {
            self.record(format!("add_candidate {} {}", session, candidate));
            self.applies.lock().push(done);
        }

        fn supports_stats(&self) -> bool {
            self.stats
        }

        fn get_stats(&self, session: SessionId, track_id: Option<&str>, done: Completion<StatsReport>) {
            self.record(format!("get_stats {} {:?}", session, track_id));
            done.succeed(StatsReport::new(vec![StatsEntry {
                id: "RTCTransport_0".to_string(),
                kind: "transport".to_string(),
                values: serde_json::Map::new(),
            }]));
        }

        fn create_data_channel(&self, session: SessionId, label: &str, _options: &DataChannelOptions) {
            self.record(format!("create_data_channel {} {}", session, label));
        }

        fn close(&self, session: SessionId) {
            self.record(format!("close {}", session));
        }
    }

    struct Fixture {
        engine: Arc<ManualEngine>,
        router: Arc<EventRouter>,
        session: Session,
    }

    impl Fixture {
        fn new() -> Self {
            Self::with_engine(ManualEngine::default())
        }

        fn with_engine(engine: ManualEngine) -> Self {
            let engine = Arc::new(engine);
            let router = EventRouter::new(EngineEventBus::default());
            let session = Session::open(
                SessionId::new(1),
                &SessionConfig::default(),
                engine.clone(),
                &router,
            )
            .unwrap();
            Self {
                engine,
                router,
                session,
            }
        }

        fn inbound(&self, event: EngineEventKind) -> bool {
            self.router.route(EngineEvent::new(self.session.id(), event))
        }
    }

    #[test]
    fn test_open_initialises_engine_and_route() {
        let fx = Fixture::new();
        assert_eq!(fx.engine.calls(), ["init 1"]);
        assert!(fx.router.is_routed(SessionId::new(1)));
        assert_eq!(fx.session.signaling_state(), SignalingState::Stable);
        assert!(!fx.session.is_closed());
    }

    #[tokio::test]
    async fn test_offer_then_set_local_scenario() {
        let fx = Fixture::new();
        let mut signaling = fx.session.subscribe([EventKind::SignalingStateChange]);

        let offer = fx.session.create_offer(MediaConstraints::default());
        fx.engine
            .next_description()
            .succeed(SessionDescription::offer("v=0..."));
        let offer = offer.await.unwrap();
        assert_eq!(offer.sdp_type, crate::signaling::SdpType::Offer);

        let applied = fx.session.set_local_description(offer.clone());
        fx.engine.next_apply().succeed(());
        applied.await.unwrap();

        assert_eq!(fx.session.local_description(), Some(offer));
        // Not changed until the engine reports it
        assert_eq!(fx.session.signaling_state(), SignalingState::Stable);
        assert!(signaling.try_recv().is_none());

        fx.inbound(EngineEventKind::SignalingStateChanged {
            state: SignalingState::HaveLocalOffer,
        });
        assert_eq!(fx.session.signaling_state(), SignalingState::HaveLocalOffer);
        assert!(signaling.try_recv().is_some());
    }

    #[tokio::test]
    async fn test_failed_set_local_leaves_state() {
        let fx = Fixture::new();

        let first = fx.session.set_local_description(SessionDescription::offer("first"));
        fx.engine.next_apply().succeed(());
        first.await.unwrap();

        let second = fx.session.set_local_description(SessionDescription::offer("second"));
        fx.engine.next_apply().fail("invalid description");
        let err = second.await.unwrap_err();
        assert_eq!(err.engine_failure(), Some(&EngineFailure::from("invalid description")));

        assert_eq!(fx.session.local_description().unwrap().sdp, "first");
    }

    #[tokio::test]
    async fn test_set_remote_stores_callers_description() {
        let fx = Fixture::new();
        let remote = SessionDescription::answer("remote-sdp");

        let applied = fx.session.set_remote_description(remote.clone());
        assert!(fx.engine.calls().iter().any(|c| c.contains(r#""type":"answer""#)));
        fx.engine.next_apply().succeed(());
        applied.await.unwrap();

        assert_eq!(fx.session.remote_description(), Some(remote));
        assert!(fx.session.local_description().is_none());
    }

    #[tokio::test]
    async fn test_overlapping_set_local_rejected() {
        let fx = Fixture::new();

        let first = fx.session.set_local_description(SessionDescription::offer("a"));
        let second = fx.session.set_local_description(SessionDescription::offer("b"));
        assert!(matches!(
            second.await,
            Err(RtcError::NegotiationInProgress(CommandKind::SetLocalDescription))
        ));

        fx.engine.next_apply().succeed(());
        first.await.unwrap();
        assert_eq!(fx.session.local_description().unwrap().sdp, "a");
        assert_eq!(fx.session.pending_commands(), 0);
    }

    #[tokio::test]
    async fn test_add_candidate_outcome_discarded() {
        let fx = Fixture::new();
        fx.session
            .add_ice_candidate(IceCandidate::new("candidate:1").with_mid("0", 0))
            .detach();

        assert_eq!(fx.session.pending_commands(), 1);
        fx.engine.next_apply().fail("stale candidate");
        assert_eq!(fx.session.pending_commands(), 0);
        assert!(fx.engine.calls().iter().any(|c| c.contains(r#""sdpMid":"0""#)));
    }

    #[tokio::test]
    async fn test_stats_unsupported_is_silent() {
        let fx = Fixture::new();
        let stats = fx.session.get_stats(None).await.unwrap();
        assert!(stats.is_none());
        assert!(!fx.engine.calls().iter().any(|c| c.starts_with("get_stats")));
    }

    #[tokio::test]
    async fn test_stats_supported() {
        let fx = Fixture::with_engine(ManualEngine::with_stats());
        let report = fx.session.get_stats(Some("t1")).await.unwrap().unwrap();
        assert!(report.entry("RTCTransport_0").is_some());
        assert!(fx.engine.calls().contains(&"get_stats 1 Some(\"t1\")".to_string()));
    }

    #[test]
    fn test_stream_events_scenario() {
        let fx = Fixture::new();
        let mut sub = fx.session.subscribe([EventKind::AddStream, EventKind::RemoveStream]);

        fx.inbound(EngineEventKind::StreamAdded {
            stream_id: "s1".to_string(),
            tracks: vec![Track::audio("t1")],
        });
        let streams = fx.session.remote_streams();
        assert_eq!(streams.len(), 1);
        assert_eq!(streams[0].tracks()[0].id, "t1");
        assert_eq!(streams[0].tracks()[0].kind, TrackKind::Audio);

        fx.inbound(EngineEventKind::StreamRemoved {
            stream_id: "s1".to_string(),
        });
        assert!(fx.session.remote_streams().is_empty());

        let events = sub.drain();
        assert_eq!(events.len(), 2);
        match &events[1] {
            SessionEvent::RemoveStream { stream: Some(stream), .. } => assert_eq!(stream.id(), "s1"),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_closed_tears_down_routing() {
        let fx = Fixture::new();
        let mut sub = fx.session.subscribe_all();

        fx.inbound(EngineEventKind::IceConnectionChanged {
            state: IceConnectionState::Closed,
        });
        assert!(fx.session.is_closed());
        assert!(!fx.router.is_routed(SessionId::new(1)));

        // A misbehaving engine keeps talking after closed
        assert!(!fx.inbound(EngineEventKind::NegotiationNeeded));
        assert!(!fx.inbound(EngineEventKind::StreamAdded {
            stream_id: "late".to_string(),
            tracks: vec![],
        }));

        let kinds: Vec<EventKind> = sub.drain().iter().map(|e| e.kind()).collect();
        assert_eq!(
            kinds,
            [EventKind::IceConnectionStateChange, EventKind::ConnectionStateChange]
        );
        assert!(fx.session.remote_streams().is_empty());
    }

    #[tokio::test]
    async fn test_commands_rejected_after_closed() {
        let fx = Fixture::new();
        fx.inbound(EngineEventKind::IceConnectionChanged {
            state: IceConnectionState::Closed,
        });

        let err = fx.session.create_offer(MediaConstraints::default()).await.unwrap_err();
        assert!(matches!(err, RtcError::SessionClosed(id) if id == SessionId::new(1)));
        assert!(fx.session.add_stream("s1").is_err());
        assert!(fx.session.create_data_channel("chat", DataChannelOptions::default()).is_err());
        assert_eq!(fx.engine.calls(), ["init 1"]);
    }

    #[test]
    fn test_close_is_requested_once() {
        let fx = Fixture::new();
        fx.session.close();
        fx.session.close();

        assert_eq!(fx.engine.calls(), ["init 1", "close 1"]);
        assert!(fx.session.is_close_requested());
        // Confirmation has not arrived yet
        assert_eq!(fx.session.ice_connection_state(), IceConnectionState::New);
        assert!(!fx.session.is_closed());
    }

    #[tokio::test]
    async fn test_in_flight_completion_survives_teardown() {
        let fx = Fixture::new();
        let offer = fx.session.create_offer(MediaConstraints::default());

        fx.inbound(EngineEventKind::IceConnectionChanged {
            state: IceConnectionState::Closed,
        });
        fx.engine
            .next_description()
            .succeed(SessionDescription::offer("late"));

        assert_eq!(offer.await.unwrap().sdp, "late");
    }

    #[test]
    fn test_local_streams_do_not_touch_remote_set() {
        let fx = Fixture::new();
        fx.session.add_track(&Track::video("cam"), "local-1").unwrap();
        fx.session.add_track(&Track::audio("mic"), "local-1").unwrap();
        fx.session.add_stream("local-1").unwrap();
        assert_eq!(fx.session.local_streams(), ["local-1"]);
        fx.session.remove_stream("local-1").unwrap();

        assert_eq!(
            fx.engine.calls(),
            [
                "init 1",
                "add_track 1 local-1 cam",
                "add_track 1 local-1 mic",
                "remove_stream 1 local-1"
            ]
        );
        assert!(fx.session.local_streams().is_empty());
        assert!(fx.session.remote_streams().is_empty());
    }

    #[test]
    fn test_data_channel_bound_to_session() {
        let fx = Fixture::new();
        let channel = fx
            .session
            .create_data_channel("hid", DataChannelOptions::unreliable())
            .unwrap();

        assert_eq!(channel.session_id(), fx.session.id());
        assert_eq!(channel.label(), "hid");
        assert_eq!(fx.session.data_channels().len(), 1);
        assert!(fx.engine.calls().contains(&"create_data_channel 1 hid".to_string()));
    }

    #[test]
    fn test_candidate_events_dispatched() {
        let fx = Fixture::new();
        let mut sub = fx.session.subscribe([EventKind::IceCandidate, EventKind::IceCandidateError]);

        fx.inbound(EngineEventKind::IceCandidate {
            candidate: Some(IceCandidate::new("candidate:7")),
        });
        fx.inbound(EngineEventKind::IceCandidate { candidate: None });
        fx.inbound(EngineEventKind::IceCandidateError(crate::signaling::IceCandidateError {
            address: None,
            port: None,
            url: "stun:stun.example.org".to_string(),
            error_code: 701,
            error_text: "unreachable".to_string(),
        }));

        let events = sub.drain();
        assert_eq!(events.len(), 3);
        assert!(matches!(&events[0], SessionEvent::IceCandidate { candidate: Some(c) } if c.candidate == "candidate:7"));
        assert!(matches!(&events[1], SessionEvent::IceCandidate { candidate: None }));
        assert!(matches!(&events[2], SessionEvent::IceCandidateError(e) if e.error_code == 701));
    }
}
