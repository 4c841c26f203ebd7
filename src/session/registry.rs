//! Session registry
//!
//! Owns the engine handle, the event router and identity allocation for every
//! session created through it.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

use super::{Session, SessionId};
use crate::config::SessionConfig;
use crate::engine::NegotiationEngine;
use crate::error::{Result, RtcError};
use crate::router::EventRouter;
use crate::signaling::{ConnectionState, IceConnectionState, SignalingState};

/// Session summary
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub session_id: SessionId,
    pub created_at: DateTime<Utc>,
    pub signaling_state: SignalingState,
    pub ice_connection_state: IceConnectionState,
    pub connection_state: ConnectionState,
    pub remote_streams: usize,
    pub closed: bool,
}

impl From<&Session> for SessionInfo {
    fn from(session: &Session) -> Self {
        Self {
            session_id: session.id(),
            created_at: session.created_at(),
            signaling_state: session.signaling_state(),
            ice_connection_state: session.ice_connection_state(),
            connection_state: session.connection_state(),
            remote_streams: session.remote_streams().len(),
            closed: session.is_closed(),
        }
    }
}

/// Creates sessions and hands out their identities
pub struct SessionRegistry {
    config: SessionConfig,
    engine: Arc<dyn NegotiationEngine>,
    router: Arc<EventRouter>,
    next_id: AtomicU64,
    sessions: RwLock<HashMap<SessionId, Session>>,
}

impl SessionRegistry {
    pub fn new(
        config: SessionConfig,
        engine: Arc<dyn NegotiationEngine>,
        router: Arc<EventRouter>,
    ) -> Self {
        Self {
            config,
            engine,
            router,
            next_id: AtomicU64::new(1),
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn router(&self) -> &Arc<EventRouter> {
        &self.router
    }

    /// Create a new session
    ///
    /// Identities are never reused by one registry.
    pub fn create_session(&self) -> Result<Session> {
        // Check and insert under one guard so concurrent callers cannot overshoot the limit
        let mut sessions = self.sessions.write();
        if self.config.max_sessions > 0 && sessions.len() >= self.config.max_sessions {
            return Err(RtcError::ServiceUnavailable(format!(
                "Maximum sessions ({}) reached",
                self.config.max_sessions
            )));
        }

        let id = SessionId::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        let session = Session::open(id, &self.config, self.engine.clone(), &self.router)?;

        sessions.insert(id, session.clone());
        info!("Session created: {} ({} live)", id, sessions.len());
        Ok(session)
    }

    pub fn get_session(&self, id: SessionId) -> Option<Session> {
        self.sessions.read().get(&id).cloned()
    }

    /// Like [`get_session`](Self::get_session), but a missing session is an error
    pub fn session(&self, id: SessionId) -> Result<Session> {
        self.get_session(id)
            .ok_or_else(|| RtcError::NotFound(format!("Session not found: {}", id)))
    }

    /// Request close and stop tracking the session
    ///
    /// Routing continues until the engine confirms the close.
    pub fn close_session(&self, id: SessionId) -> Result<()> {
        let session = self.sessions.write().remove(&id);
        match session {
            Some(session) => {
                session.close();
                info!("Session closed: {}", id);
                Ok(())
            }
            None => Err(RtcError::NotFound(format!("Session not found: {}", id))),
        }
    }

    pub fn list_sessions(&self) -> Vec<SessionInfo> {
        let mut sessions: Vec<SessionInfo> =
            self.sessions.read().values().map(SessionInfo::from).collect();
        sessions.sort_by_key(|s| s.session_id);
        sessions
    }

    /// Drop sessions whose ICE connection has closed. Returns how many.
    pub fn cleanup_closed_sessions(&self) -> usize {
        let mut sessions = self.sessions.write();
        let before = sessions.len();
        sessions.retain(|id, session| {
            let keep = !session.is_closed();
            if !keep {
                debug!("Removing closed session: {}", id);
            }
            keep
        });
        before - sessions.len()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }

    /// Request close on every session
    pub fn close_all(&self) {
        let sessions: Vec<Session> = self.sessions.write().drain().map(|(_, s)| s).collect();
        for session in sessions {
            session.close();
        }
    }
}
