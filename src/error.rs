use thiserror::Error;

use crate::engine::EngineFailure;
use crate::session::pipeline::CommandKind;
use crate::session::SessionId;

/// Crate-wide error type
#[derive(Error, Debug)]
pub enum RtcError {
    #[error("Session {0} is closed")]
    SessionClosed(SessionId),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("{0} already in progress")]
    NegotiationInProgress(CommandKind),

    #[error("{command} failed: {failure}")]
    CommandFailed {
        command: CommandKind,
        failure: EngineFailure,
    },

    #[error("{0} was dropped by the engine without completing")]
    CommandAbandoned(CommandKind),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl RtcError {
    /// Engine-supplied diagnostic payload, if this is a command failure
    pub fn engine_failure(&self) -> Option<&EngineFailure> {
        match self {
            RtcError::CommandFailed { failure, .. } => Some(failure),
            _ => None,
        }
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, RtcError>;
