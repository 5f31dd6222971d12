//! Transport channel boundary
//!
//! The client engine treats the wire as an opaque duplex channel that
//! delivers whole text messages and reports state transitions. The production
//! implementation is a WebSocket client over tokio-tungstenite; tests plug in
//! in-memory channels through the same trait.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use tracing::{debug, warn};
use url::Url;

use crate::error::{Error, Result};

/// Connection state reported by a transport channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    /// Handshake in progress
    Opening,
    /// Established and ready for use
    Open,
    /// Teardown in progress
    Closing,
    /// Disconnected
    Closed,
}

/// Asynchronous event reported by a transport channel
#[derive(Debug)]
pub enum TransportEvent {
    /// The channel state changed
    StateChanged(TransportState),
    /// The channel encountered an error
    Error(String),
    /// One decoded JSON object arrived (no batching)
    Message(Value),
}

/// An opaque bidirectional message channel
///
/// `open` establishes the channel and hands it the sender used for all
/// asynchronous reporting; `send` transmits one whole text message. All
/// methods are invoked from the client's event loop only.
#[async_trait]
pub trait Transport: Send {
    /// Open the channel, reporting events through `events`
    ///
    /// Returns an error when the channel cannot be created at all (malformed
    /// endpoint, refused connection); after a successful return the channel
    /// reports `StateChanged(Open)` and later transitions through `events`.
    async fn open(&mut self, events: mpsc::UnboundedSender<TransportEvent>) -> Result<()>;

    /// Send one text message over the open channel
    async fn send(&mut self, text: String) -> Result<()>;

    /// Close the channel; reports `StateChanged(Closed)` when done
    async fn close(&mut self);
}

enum WriterCommand {
    Text(String),
    Pong(Vec<u8>),
    Close,
}

/// WebSocket transport over tokio-tungstenite
///
/// Text frames are surfaced one decoded JSON object at a time; pings are
/// answered with pongs; binary frames are ignored with a debug log;
/// undecodable text is a protocol fault: logged and dropped, the channel
/// stays up.
pub struct WebSocketTransport {
    endpoint: String,
    writer_tx: Option<mpsc::UnboundedSender<WriterCommand>>,
}

impl WebSocketTransport {
    /// Create a transport for the given WebSocket endpoint
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            writer_tx: None,
        }
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn open(&mut self, events: mpsc::UnboundedSender<TransportEvent>) -> Result<()> {
        let url = Url::parse(&self.endpoint)
            .map_err(|e| Error::InvalidEndpoint(format!("{}: {}", self.endpoint, e)))?;

        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .map_err(|e| Error::Transport(format!("connect failed: {}", e)))?;
        debug!(endpoint = %self.endpoint, "websocket channel open");

        let (mut ws_tx, mut ws_rx) = ws_stream.split();

        // Writer task: serializes all outbound frames through one channel so
        // the reader can answer pings without sharing the sink.
        let (writer_tx, mut writer_rx) = mpsc::unbounded_channel::<WriterCommand>();
        self.writer_tx = Some(writer_tx.clone());
        tokio::spawn(async move {
            while let Some(command) = writer_rx.recv().await {
                let frame = match command {
                    WriterCommand::Text(text) => WsMessage::Text(text),
                    WriterCommand::Pong(payload) => WsMessage::Pong(payload),
                    WriterCommand::Close => {
                        let _ = ws_tx.send(WsMessage::Close(None)).await;
                        break;
                    }
                };
                if let Err(e) = ws_tx.send(frame).await {
                    warn!("websocket send failed: {}", e);
                    break;
                }
            }
        });

        // Reader task: one event per inbound frame, in arrival order.
        tokio::spawn(async move {
            let _ = events.send(TransportEvent::StateChanged(TransportState::Open));
            while let Some(frame) = ws_rx.next().await {
                match frame {
                    Ok(WsMessage::Text(text)) => match serde_json::from_str::<Value>(&text) {
                        Ok(value) => {
                            let _ = events.send(TransportEvent::Message(value));
                        }
                        Err(e) => {
                            warn!("dropping undecodable message: {}", e);
                        }
                    },
                    Ok(WsMessage::Ping(payload)) => {
                        let _ = writer_tx.send(WriterCommand::Pong(payload));
                    }
                    Ok(WsMessage::Close(_)) => {
                        debug!("websocket closed by remote");
                        break;
                    }
                    Ok(WsMessage::Binary(_)) => {
                        debug!("ignoring binary frame");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        let _ = events.send(TransportEvent::Error(e.to_string()));
                        break;
                    }
                }
            }
            let _ = events.send(TransportEvent::StateChanged(TransportState::Closed));
        });

        Ok(())
    }

    async fn send(&mut self, text: String) -> Result<()> {
        let writer = self.writer_tx.as_ref().ok_or(Error::NotConnected)?;
        writer
            .send(WriterCommand::Text(text))
            .map_err(|_| Error::ConnectionClosed)
    }

    async fn close(&mut self) {
        if let Some(writer) = self.writer_tx.take() {
            let _ = writer.send(WriterCommand::Close);
        }
    }
}
