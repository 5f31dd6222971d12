//! Media engine boundary
//!
//! The negotiation state machine drives the native WebRTC engine only
//! through this session-description/ICE-candidate surface. The production
//! implementation lives in [`crate::rtc`]; tests substitute a recording fake.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::Result;

/// One network path a peer advertises for connectivity, as relayed over
/// signaling
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    /// The candidate-attribute line
    pub candidate: String,
    /// Identifier of the media description this candidate belongs to
    #[serde(rename = "sdpMid", skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    /// Index of the media description this candidate belongs to
    #[serde(rename = "sdpMLineIndex", skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
}

/// ICE connectivity state of one session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

/// Which half of the offer/answer exchange an SDP payload is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpKind {
    Offer,
    Answer,
}

/// Asynchronous event raised by a native session, tagged with its
/// connection id
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// A candidate was gathered locally and should be relayed to the remote
    /// party
    LocalCandidate(IceCandidate),
    /// ICE connectivity changed
    IceStateChanged(IceState),
    /// Media arrived on a new remote stream
    RemoteStreamAdded(String),
    /// A remote stream went away
    RemoteStreamRemoved(String),
}

/// Sender half used by engine sessions to report events
pub type SessionEvents = mpsc::UnboundedSender<(String, SessionEvent)>;

/// The SDP/ICE surface of one native peer-connection session
///
/// The negotiation layer holds sessions behind shared handles and never
/// assumes exclusive ownership; the engine keeps its own lifecycle.
#[async_trait]
pub trait MediaSession: Send + Sync {
    /// Ask the engine for a local offer
    async fn create_offer(&self) -> Result<String>;

    /// Ask the engine for a local answer to the current remote offer
    async fn create_answer(&self) -> Result<String>;

    /// Install a locally generated description
    async fn set_local_description(&self, kind: SdpKind, sdp: &str) -> Result<()>;

    /// Install the remote party's description
    async fn set_remote_description(&self, kind: SdpKind, sdp: &str) -> Result<()>;

    /// Hand one remote candidate to the ICE agent
    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<()>;

    /// Release the native session
    async fn close(&self) -> Result<()>;
}

/// Factory for native sessions
#[async_trait]
pub trait MediaEngine: Send + Sync {
    /// Create a session for `connection_id`, reporting its asynchronous
    /// events through `events`
    async fn create_session(
        &self,
        connection_id: &str,
        events: SessionEvents,
    ) -> Result<Arc<dyn MediaSession>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_candidate_wire_field_names() {
        let candidate = IceCandidate {
            candidate: "candidate:0 1 UDP 2122 192.0.2.1 54321 typ host".into(),
            sdp_mid: Some("video".into()),
            sdp_mline_index: Some(0),
        };
        let json = serde_json::to_value(&candidate).unwrap();
        assert_eq!(json["sdpMid"], "video");
        assert_eq!(json["sdpMLineIndex"], 0);

        let back: IceCandidate = serde_json::from_value(json).unwrap();
        assert_eq!(back, candidate);
    }

    #[test]
    fn test_candidate_optional_fields_omitted() {
        let candidate = IceCandidate {
            candidate: "candidate:1".into(),
            sdp_mid: None,
            sdp_mline_index: None,
        };
        let json = serde_json::to_value(&candidate).unwrap();
        assert!(json.get("sdpMid").is_none());
        assert!(json.get("sdpMLineIndex").is_none());
    }
}
