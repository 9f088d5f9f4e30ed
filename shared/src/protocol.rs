//! Signaling messages exchanged over the rendezvous WebSocket.

use serde::{Deserialize, Serialize};

/// Version tag written into tunneled request lines.
pub const HTTP_VERSION: &str = "HTTP/1.1";

/// Longest routing tag the wire format can carry (single length byte).
pub const MAX_TAG_LEN: usize = 255;

/// Control messages for session setup. JSON on the wire, e.g.
/// `{"type":"offer","target":"host-1","sender":"gateway-ab12","sdp":"..."}`.
///
/// `answer` and `candidate` carry an optional `target` so the rendezvous
/// can route them back to the offering peer; receivers ignore it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SignalMessage {
    Register {
        id: String,
    },
    Offer {
        target: String,
        sender: String,
        sdp: String,
    },
    Answer {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sender: Option<String>,
        sdp: String,
    },
    Candidate {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<String>,
        candidate: serde_json::Value,
    },
}

impl SignalMessage {
    /// Peer the rendezvous should deliver this message to, if any.
    pub fn target(&self) -> Option<&str> {
        match self {
            SignalMessage::Register { .. } => None,
            SignalMessage::Offer { target, .. } => Some(target),
            SignalMessage::Answer { target, .. } => target.as_deref(),
            SignalMessage::Candidate { target, .. } => target.as_deref(),
        }
    }
}
