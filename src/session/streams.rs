//! Remote media streams associated with a session

use parking_lot::RwLock;
use std::sync::Arc;
use tracing::debug;

use crate::events::{EventDispatcher, SessionEvent};
use crate::media::{MediaStream, Track};

/// Remote streams keyed by identity, in arrival order
pub struct RemoteStreamSet {
    streams: RwLock<Vec<MediaStream>>,
    events: Arc<EventDispatcher>,
}

impl RemoteStreamSet {
    pub fn new(events: Arc<EventDispatcher>) -> Self {
        Self {
            streams: RwLock::new(Vec::new()),
            events,
        }
    }

    /// Track a new remote stream and emit `addstream`
    ///
    /// A stream whose identity is already present is ignored. Returns whether
    /// the stream was inserted.
    pub fn add_stream(&self, id: impl Into<String>, tracks: Vec<Track>) -> bool {
        let id = id.into();
        let stream = {
            let mut streams = self.streams.write();
            if streams.iter().any(|s| s.id() == id) {
                debug!("Remote stream {} already present, ignoring", id);
                return false;
            }
            let stream = MediaStream::new(id, tracks);
            streams.push(stream.clone());
            stream
        };

        debug!(
            "Remote stream {} added with {} track(s)",
            stream.id(),
            stream.tracks().len()
        );
        self.events.publish(SessionEvent::AddStream { stream });
        true
    }

    /// Stop tracking a remote stream and emit `removestream`
    ///
    /// An unknown identity still emits `removestream`, without a stream.
    pub fn remove_stream(&self, id: &str) -> Option<MediaStream> {
        let removed = {
            let mut streams = self.streams.write();
            streams
                .iter()
                .position(|s| s.id() == id)
                .map(|index| streams.remove(index))
        };

        if removed.is_none() {
            debug!("Removal of unknown remote stream {}", id);
        }
        self.events.publish(SessionEvent::RemoveStream {
            stream_id: id.to_string(),
            stream: removed.clone(),
        });
        removed
    }

    pub fn get(&self, id: &str) -> Option<MediaStream> {
        self.streams.read().iter().find(|s| s.id() == id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.streams.read().iter().any(|s| s.id() == id)
    }

    /// All streams, in the order they were added
    pub fn list(&self) -> Vec<MediaStream> {
        self.streams.read().clone()
    }

    pub fn len(&self) -> usize {
        self.streams.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.read().is_empty()
    }
}
