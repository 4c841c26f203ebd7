//! Media/negotiation engine boundary
//!
//! The engine is an external collaborator: this crate hands it commands and
//! listens to the notifications it publishes on the shared [`EngineEventBus`].
//!
//! ```text
//!  Session ──command + Completion──> NegotiationEngine
//!     ^                                   │
//!     │ ticket resolves <──Completion─────┤
//!     │                                   │
//!  EventRouter <──── EngineEventBus <─────┘ (unsolicited events)
//! ```
//!
//! Every request/completion command receives a [`Completion`] that the engine
//! must resolve exactly once, from any thread, at any later time.

pub mod events;
pub mod loopback;

pub use events::{EngineEvent, EngineEventBus, EngineEventKind};
pub use loopback::LoopbackEngine;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::config::SessionConfig;
use crate::media::Track;
use crate::session::data_channel::DataChannelOptions;
use crate::session::SessionId;
use crate::signaling::{MediaConstraints, SessionDescription};

/// Opaque diagnostic payload supplied by the engine when a command fails
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EngineFailure(pub serde_json::Value);

impl EngineFailure {
    pub fn message(message: impl Into<String>) -> Self {
        Self(serde_json::Value::String(message.into()))
    }

    pub fn payload(&self) -> &serde_json::Value {
        &self.0
    }
}

impl fmt::Display for EngineFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            serde_json::Value::String(s) => f.write_str(s),
            other => write!(f, "{}", other),
        }
    }
}

impl From<&str> for EngineFailure {
    fn from(message: &str) -> Self {
        Self::message(message)
    }
}

impl From<String> for EngineFailure {
    fn from(message: String) -> Self {
        Self::message(message)
    }
}

impl From<serde_json::Value> for EngineFailure {
    fn from(value: serde_json::Value) -> Self {
        Self(value)
    }
}

/// How a completion was resolved
#[derive(Debug)]
pub(crate) enum Outcome<T> {
    Succeeded(T),
    Failed(EngineFailure),
    /// Dropped by the engine without being resolved
    Abandoned,
}

type Continuation<T> = Box<dyn FnOnce(Outcome<T>) + Send + 'static>;

/// One-shot completion handed to the engine with each command
///
/// Consumed by [`succeed`](Self::succeed) or [`fail`](Self::fail), so it can
/// only be resolved once. Dropping it unresolved resolves the pending command
/// as abandoned.
pub struct Completion<T> {
    continuation: Option<Continuation<T>>,
}

impl<T> Completion<T> {
    pub(crate) fn new<F>(continuation: F) -> Self
    where
        F: FnOnce(Outcome<T>) + Send + 'static,
    {
        Self {
            continuation: Some(Box::new(continuation)),
        }
    }

    fn resolve(mut self, outcome: Outcome<T>) {
        if let Some(continuation) = self.continuation.take() {
            continuation(outcome);
        }
    }

    /// Resolve the command successfully
    pub fn succeed(self, value: T) {
        self.resolve(Outcome::Succeeded(value));
    }

    /// Resolve the command with an engine diagnostic payload
    pub fn fail(self, failure: impl Into<EngineFailure>) {
        self.resolve(Outcome::Failed(failure.into()));
    }

    /// Resolve from a `Result`
    pub fn complete(self, result: std::result::Result<T, EngineFailure>) {
        match result {
            Ok(value) => self.succeed(value),
            Err(failure) => self.fail(failure),
        }
    }
}

impl<T> Drop for Completion<T> {
    fn drop(&mut self) {
        if let Some(continuation) = self.continuation.take() {
            continuation(Outcome::Abandoned);
        }
    }
}

impl<T> fmt::Debug for Completion<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion")
            .field("resolved", &self.continuation.is_none())
            .finish()
    }
}

/// One statistics record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsEntry {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub values: serde_json::Map<String, serde_json::Value>,
}

/// Statistics snapshot returned by the engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsReport {
    pub timestamp: DateTime<Utc>,
    pub entries: Vec<StatsEntry>,
}

impl StatsReport {
    pub fn new(entries: Vec<StatsEntry>) -> Self {
        Self {
            timestamp: Utc::now(),
            entries,
        }
    }

    pub fn entry(&self, id: &str) -> Option<&StatsEntry> {
        self.entries.iter().find(|e| e.id == id)
    }
}

/// Command surface of the external media/negotiation engine
///
/// No method may block. Commands taking a [`Completion`] return immediately
/// and resolve it later; the rest are fire-and-forget. Descriptions and
/// candidates are passed in their JSON wire form.
pub trait NegotiationEngine: Send + Sync + 'static {
    /// Bind engine resources to a new session
    fn init(&self, session: SessionId, config: &SessionConfig);

    fn add_stream(&self, session: SessionId, stream_id: &str);

    /// Add one local track to a local stream, creating the stream if needed
    ///
    /// Engines without per-track control only see the stream.
    fn add_track(&self, session: SessionId, stream_id: &str, _track: &Track) {
        self.add_stream(session, stream_id);
    }

    fn remove_stream(&self, session: SessionId, stream_id: &str);

    fn create_offer(
        &self,
        session: SessionId,
        constraints: &MediaConstraints,
        done: Completion<SessionDescription>,
    );

    fn create_answer(
        &self,
        session: SessionId,
        constraints: &MediaConstraints,
        done: Completion<SessionDescription>,
    );

    fn set_local_description(&self, session: SessionId, description: &str, done: Completion<()>);

    fn set_remote_description(&self, session: SessionId, description: &str, done: Completion<()>);

    fn add_ice_candidate(&self, session: SessionId, candidate: &str, done: Completion<()>);

    /// Whether [`get_stats`](Self::get_stats) is implemented
    fn supports_stats(&self) -> bool {
        false
    }

    /// Collect statistics, optionally for one track
    ///
    /// Only called when [`supports_stats`](Self::supports_stats) is `true`.
    fn get_stats(
        &self,
        _session: SessionId,
        _track_id: Option<&str>,
        done: Completion<StatsReport>,
    ) {
        done.fail("statistics not supported");
    }

    fn create_data_channel(
        &self,
        _session: SessionId,
        _label: &str,
        _options: &DataChannelOptions,
    ) {
    }

    /// Request teardown. Confirmation arrives as an `ice-connection-changed`
    /// event carrying `closed`.
    fn close(&self, session: SessionId);
}
