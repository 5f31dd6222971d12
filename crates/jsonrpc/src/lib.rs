//! JSON-RPC 2.0 signaling client
//!
//! The request/response engine at the core of a real-time media client:
//! correlates asynchronous requests with responses by id, enforces
//! per-request timeouts with bounded retry, multiplexes server-initiated
//! traffic and tracks the connection lifecycle, reconnection included.
//!
//! - [`message`] — the wire codec for the three JSON-RPC 2.0 message shapes
//! - [`transport`] — the opaque channel boundary and its WebSocket impl
//! - [`client`] — the connection/correlation engine

pub mod client;
pub mod error;
pub mod message;
pub mod transport;

pub use client::{ClientConfig, ClientDelegate, ConnectionState, JsonRpcClient, PendingCall};
pub use error::{Error, Result};
pub use message::{error_codes, Message, Request, Response, ResponseError};
pub use transport::{Transport, TransportEvent, TransportState, WebSocketTransport};
