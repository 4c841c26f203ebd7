//! Data channel handles

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::session::SessionId;

/// Data channel creation options, forwarded to the engine as given
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DataChannelOptions {
    pub ordered: bool,
    pub max_packet_life_time: Option<u16>,
    pub max_retransmits: Option<u16>,
    pub protocol: String,
    pub negotiated: bool,
    pub id: Option<u16>,
}

impl Default for DataChannelOptions {
    fn default() -> Self {
        Self {
            ordered: true,
            max_packet_life_time: None,
            max_retransmits: None,
            protocol: String::new(),
            negotiated: false,
            id: None,
        }
    }
}

impl DataChannelOptions {
    /// Unordered channel without retransmissions
    pub fn unreliable() -> Self {
        Self {
            ordered: false,
            max_retransmits: Some(0),
            ..Default::default()
        }
    }
}

/// Handle to a data channel bound to one session
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DataChannel {
    id: Uuid,
    label: String,
    session_id: SessionId,
    options: DataChannelOptions,
}

impl DataChannel {
    pub(crate) fn new(session_id: SessionId, label: impl Into<String>, options: DataChannelOptions) -> Self {
        Self {
            id: Uuid::new_v4(),
            label: label.into(),
            session_id,
            options,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn options(&self) -> &DataChannelOptions {
        &self.options
    }

    pub fn is_reliable(&self) -> bool {
        self.options.ordered
            && self.options.max_retransmits.is_none()
            && self.options.max_packet_life_time.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_options_wire_names() {
        let options: DataChannelOptions =
            serde_json::from_str(r#"{"ordered":false,"maxRetransmits":3}"#).unwrap();
        assert!(!options.ordered);
        assert_eq!(options.max_retransmits, Some(3));
        assert!(options.protocol.is_empty());
    }

    #[test]
    fn test_reliability() {
        let reliable = DataChannel::new(SessionId::new(1), "hid", DataChannelOptions::default());
        let lossy = DataChannel::new(SessionId::new(1), "hid-unreliable", DataChannelOptions::unreliable());
        assert!(reliable.is_reliable());
        assert!(!lossy.is_reliable());
        assert_ne!(reliable.id(), lossy.id());
        assert_eq!(lossy.session_id(), SessionId::new(1));
    }
}
