//! Peer-connection negotiation for the mediasig signaling core
//!
//! Tracks SDP offer/answer exchange and ICE-candidate queueing per remote
//! connection id, driving a native WebRTC engine through a narrow
//! session-description/ICE surface.
//!
//! - [`engine`] — the media-engine boundary (traits + events)
//! - [`rtc`] — the production engine over the `webrtc` crate
//! - [`peer`] — the negotiation state machine and its delegate
//! - [`session`] — per-connection negotiation state

pub mod engine;
pub mod error;
pub mod peer;
pub mod rtc;
pub mod session;

pub use engine::{IceCandidate, IceState, MediaEngine, MediaSession, SdpKind, SessionEvent, SessionEvents};
pub use error::{Error, Result};
pub use peer::{ConnectionInfo, PeerDelegate, WebRtcPeer};
pub use rtc::{RtcConfig, RtcEngine};
