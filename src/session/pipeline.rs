//! Pending-result tickets for asynchronous engine commands
//!
//! Issuing a command registers a ticket, forwards the request to the engine
//! with a [`Completion`], and hands the caller a [`CommandTicket`] future. The
//! engine resolves the completion later; a success hook (for example recording
//! the local description) runs before the ticket resolves, whether or not the
//! caller is still waiting on it.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::engine::{Completion, Outcome};
use crate::error::{Result, RtcError};
use crate::session::SessionId;

/// Asynchronous command kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    CreateOffer,
    CreateAnswer,
    SetLocalDescription,
    SetRemoteDescription,
    AddIceCandidate,
    GetStats,
}

impl CommandKind {
    /// Kinds allowed at most once in flight per session
    pub fn is_exclusive(&self) -> bool {
        matches!(
            self,
            CommandKind::SetLocalDescription | CommandKind::SetRemoteDescription
        )
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandKind::CreateOffer => write!(f, "createOffer"),
            CommandKind::CreateAnswer => write!(f, "createAnswer"),
            CommandKind::SetLocalDescription => write!(f, "setLocalDescription"),
            CommandKind::SetRemoteDescription => write!(f, "setRemoteDescription"),
            CommandKind::AddIceCandidate => write!(f, "addIceCandidate"),
            CommandKind::GetStats => write!(f, "getStats"),
        }
    }
}

/// Ticket identifier, unique within one session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TicketId(u64);

impl fmt::Display for TicketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Tracks the commands of one session that are awaiting completion
pub struct CommandPipeline {
    session_id: SessionId,
    next_ticket: AtomicU64,
    in_flight: Mutex<HashMap<TicketId, CommandKind>>,
}

impl CommandPipeline {
    pub fn new(session_id: SessionId) -> Arc<Self> {
        Arc::new(Self {
            session_id,
            next_ticket: AtomicU64::new(1),
            in_flight: Mutex::new(HashMap::new()),
        })
    }

    /// Register a ticket and forward the command
    ///
    /// `forward` receives the completion to hand to the engine. `on_success`
    /// maps the engine value into the ticket's result and runs before the
    /// ticket resolves. Exclusive kinds are rejected with
    /// [`RtcError::NegotiationInProgress`] while one of the same kind is
    /// outstanding, without reaching the engine.
    pub fn issue<T, R, S, F>(self: &Arc<Self>, kind: CommandKind, on_success: S, forward: F) -> CommandTicket<R>
    where
        T: Send + 'static,
        R: Send + 'static,
        S: FnOnce(T) -> Result<R> + Send + 'static,
        F: FnOnce(Completion<T>),
    {
        let id = TicketId(self.next_ticket.fetch_add(1, Ordering::Relaxed));
        {
            let mut in_flight = self.in_flight.lock();
            if kind.is_exclusive() && in_flight.values().any(|k| *k == kind) {
                debug!(
                    "Session {}: rejecting {}, one is already in flight",
                    self.session_id, kind
                );
                return CommandTicket::ready(id, kind, Err(RtcError::NegotiationInProgress(kind)));
            }
            in_flight.insert(id, kind);
        }

        let (tx, rx) = oneshot::channel();
        let pipeline = Arc::clone(self);
        let completion = Completion::new(move |outcome: Outcome<T>| {
            let result = match outcome {
                Outcome::Succeeded(value) => on_success(value),
                Outcome::Failed(failure) => {
                    debug!(
                        "Session {}: {} {} failed: {}",
                        pipeline.session_id, kind, id, failure
                    );
                    Err(RtcError::CommandFailed {
                        command: kind,
                        failure,
                    })
                }
                Outcome::Abandoned => {
                    warn!(
                        "Session {}: engine dropped {} {} without completing it",
                        pipeline.session_id, kind, id
                    );
                    Err(RtcError::CommandAbandoned(kind))
                }
            };
            pipeline.finish(id);
            // Receiver gone means the caller discarded the ticket
            let _ = tx.send(result);
        });

        debug!("Session {}: issuing {} {}", self.session_id, kind, id);
        forward(completion);

        CommandTicket {
            id,
            kind,
            state: TicketState::Pending(rx),
        }
    }

    /// Build a ticket that resolves immediately without reaching the engine
    pub fn resolved<R>(&self, kind: CommandKind, result: Result<R>) -> CommandTicket<R> {
        let id = TicketId(self.next_ticket.fetch_add(1, Ordering::Relaxed));
        CommandTicket::ready(id, kind, result)
    }

    fn finish(&self, id: TicketId) {
        self.in_flight.lock().remove(&id);
    }

    /// Number of commands awaiting completion
    pub fn in_flight(&self) -> usize {
        self.in_flight.lock().len()
    }

    pub fn is_in_flight(&self, kind: CommandKind) -> bool {
        self.in_flight.lock().values().any(|k| *k == kind)
    }
}

enum TicketState<T> {
    Pending(oneshot::Receiver<Result<T>>),
    Ready(Option<Result<T>>),
}

/// Future resolving to the result of one command
///
/// Dropping the ticket (or calling [`detach`](Self::detach)) discards the
/// outcome; the command itself still runs to completion.
#[must_use = "dropping a ticket discards the command outcome; call detach() to make that explicit"]
pub struct CommandTicket<T> {
    id: TicketId,
    kind: CommandKind,
    state: TicketState<T>,
}

impl<T> CommandTicket<T> {
    fn ready(id: TicketId, kind: CommandKind, result: Result<T>) -> Self {
        Self {
            id,
            kind,
            state: TicketState::Ready(Some(result)),
        }
    }

    pub fn id(&self) -> TicketId {
        self.id
    }

    pub fn kind(&self) -> CommandKind {
        self.kind
    }

    /// Explicitly discard the outcome
    pub fn detach(self) {}
}

// Neither state is structurally pinned
impl<T> Unpin for CommandTicket<T> {}

impl<T> Future for CommandTicket<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let kind = self.kind;
        match &mut self.state {
            TicketState::Pending(rx) => match Pin::new(rx).poll(cx) {
                Poll::Ready(Ok(result)) => Poll::Ready(result),
                Poll::Ready(Err(_)) => Poll::Ready(Err(RtcError::CommandAbandoned(kind))),
                Poll::Pending => Poll::Pending,
            },
            TicketState::Ready(result) => match result.take() {
                Some(result) => Poll::Ready(result),
                None => Poll::Ready(Err(RtcError::Internal(format!(
                    "{} ticket polled after completion",
                    kind
                )))),
            },
        }
    }
}

impl<T> fmt::Debug for CommandTicket<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandTicket")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .finish()
    }
}
