//! Error types for peer negotiation

use thiserror::Error;

/// Result type alias for negotiation operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types that can occur during peer negotiation
///
/// Every variant is scoped to a single peer session: a failure here never
/// tears down other sessions and never affects the signaling connection.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// No session exists for the given connection id
    #[error("unknown connection: {0}")]
    UnknownConnection(String),

    /// The operation is not valid in the session's current state
    #[error("invalid negotiation state: {0}")]
    InvalidState(String),

    /// The media engine rejected a session description
    #[error("SDP error: {0}")]
    Sdp(String),

    /// The media engine rejected an ICE candidate
    #[error("ICE error: {0}")]
    Ice(String),

    /// The media engine failed to create or operate a session
    #[error("media engine error: {0}")]
    Engine(String),
}
