//! Error types for the signaling client

use thiserror::Error;

/// Result type alias for signaling client operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types that can occur in the signaling client
///
/// Application-level RPC failures are not represented here: a well-formed
/// response carrying an `error` member is delivered to the request completion
/// unchanged, so callers can always tell "server said no" apart from "server
/// never answered" (`RequestTimeout`) and from channel failures (`Transport`,
/// `ConnectionClosed`).
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// The underlying channel failed to open or broke while in use
    #[error("transport error: {0}")]
    Transport(String),

    /// The channel closed while the request was still in flight
    #[error("connection closed")]
    ConnectionClosed,

    /// The client is not connected and cannot accept the operation
    #[error("client is not connected")]
    NotConnected,

    /// An inbound message could not be decoded as JSON-RPC 2.0
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    /// No response arrived within the configured interval, retries included
    #[error("request {method:?} timed out after {attempts} attempt(s)")]
    RequestTimeout {
        /// Method of the request that went unanswered
        method: String,
        /// Total send attempts made (original + retries)
        attempts: u32,
    },

    /// The request was canceled before a response arrived
    #[error("request canceled")]
    Canceled,

    /// Caller contract violation (empty method, params of the wrong shape)
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The configured endpoint could not be parsed as a WebSocket URL
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),
}
