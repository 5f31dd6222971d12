//! JSON-RPC 2.0 client engine
//!
//! Owns the connection lifecycle, the outbound request correlation table,
//! timeout/retry scheduling and notification dispatch. All mutable state
//! lives inside one event-loop task per client; the public handle marshals
//! every operation onto that loop through a command channel, so the
//! correlation table needs no locking and a completing response can cancel
//! its timer in the same serialized step.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::message::{Message, Request, Response};
use crate::transport::{Transport, TransportEvent, TransportState, WebSocketTransport};

/// Connection lifecycle of a [`JsonRpcClient`]
///
/// Transitions are linear except for reconnect: `Closed → Opening` happens on
/// an explicit `connect` or when auto-connect re-opens a dropped channel.
/// There is no transition out of `Closing` except to `Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Channel handshake in progress
    Opening,
    /// Channel established and ready for requests
    Open,
    /// Graceful teardown in progress
    Closing,
    /// Not connected
    Closed,
}

/// Configuration for a [`JsonRpcClient`]
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Timeout for each request attempt. Default: 5 s
    pub request_timeout: Duration,
    /// Retries after a timed-out attempt (same id, identical request).
    /// Default: 1
    pub max_retries: u32,
    /// Connect on construction, and re-open the channel after an unexpected
    /// close. Default: true
    pub auto_connect: bool,
    /// Timeout for the channel handshake itself. Default: 5 s
    pub connect_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(5),
            max_retries: 1,
            auto_connect: true,
            connect_timeout: Duration::from_secs(5),
        }
    }
}

/// Listener for client-level events
///
/// One listener per client instance; the client holds it weakly and never
/// extends its lifetime. All methods default to no-ops. Implementations run
/// on the client's event loop and must not block.
pub trait ClientDelegate: Send + Sync {
    /// The channel opened and the client is ready to send requests
    fn on_connected(&self) {}

    /// The channel closed; every pending request has already been failed
    fn on_disconnected(&self) {}

    /// A server-originated request or notification arrived
    ///
    /// Responses are matched against the pending table and never surface
    /// here; everything else is forwarded verbatim, in arrival order.
    fn on_request_received(&self, _request: Request) {}

    /// A connection-level fault occurred (channel error, connect failure)
    fn on_error(&self, _error: &Error) {}
}

/// An in-flight request: the sent [`Request`] plus its completion
///
/// The completion fires exactly once, with the matching [`Response`] or one
/// synthesized error (timeout, transport fault, cancellation).
#[derive(Debug)]
pub struct PendingCall {
    request: Request,
    rx: oneshot::Receiver<Result<Response>>,
}

impl PendingCall {
    /// The request that was sent, id included
    pub fn request(&self) -> &Request {
        &self.request
    }

    /// Wait for the completion
    pub async fn wait(self) -> Result<Response> {
        self.rx.await.map_err(|_| Error::ConnectionClosed)?
    }
}

enum Command {
    Connect,
    Close,
    SendRequest {
        request: Request,
        completion: oneshot::Sender<Result<Response>>,
    },
    SendNotification {
        request: Request,
    },
    Cancel {
        id: u64,
    },
    CancelAll,
    SetDelegate(Weak<dyn ClientDelegate>),
    DetachDelegate,
    TimedOut {
        id: u64,
        generation: u32,
    },
}

/// JSON-RPC 2.0 client over a persistent duplex channel
///
/// The handle is cheap to clone; all clones drive the same connection. See
/// [`ClientConfig`] for timeout/retry/auto-connect knobs and
/// [`ClientDelegate`] for server-originated traffic.
#[derive(Clone)]
pub struct JsonRpcClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    cmd_tx: mpsc::UnboundedSender<Command>,
    next_id: AtomicU64,
    state_rx: watch::Receiver<ConnectionState>,
    config: ClientConfig,
}

impl JsonRpcClient {
    /// Create a client for a WebSocket endpoint with the default configuration
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self::with_config(endpoint, ClientConfig::default())
    }

    /// Create a client for a WebSocket endpoint with the given configuration
    ///
    /// A malformed endpoint is not rejected here: the connect attempt fails
    /// and is reported through [`ClientDelegate::on_error`].
    pub fn with_config(endpoint: impl Into<String>, config: ClientConfig) -> Self {
        Self::with_transport(WebSocketTransport::new(endpoint), config)
    }

    /// Create a client over an arbitrary [`Transport`]
    pub fn with_transport<T: Transport + 'static>(transport: T, config: ClientConfig) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Closed);

        let event_loop = EventLoop {
            transport,
            config: config.clone(),
            cmd_tx: cmd_tx.clone(),
            cmd_rx,
            state_tx,
            delegate: None,
            pending: HashMap::new(),
            queued: VecDeque::new(),
            user_closed: false,
        };
        tokio::spawn(event_loop.run());

        if config.auto_connect {
            let _ = cmd_tx.send(Command::Connect);
        }

        Self {
            inner: Arc::new(ClientInner {
                cmd_tx,
                next_id: AtomicU64::new(0),
                state_rx,
                config,
            }),
        }
    }

    /// Register the delegate; the client keeps only a weak reference
    pub fn set_delegate(&self, delegate: Weak<dyn ClientDelegate>) {
        let _ = self.inner.cmd_tx.send(Command::SetDelegate(delegate));
    }

    /// Drop the delegate reference without waiting for it to be collected
    pub fn detach_delegate(&self) {
        let _ = self.inner.cmd_tx.send(Command::DetachDelegate);
    }

    /// Open the channel; no-op while already Opening or Open
    pub fn connect(&self) {
        let _ = self.inner.cmd_tx.send(Command::Connect);
    }

    /// Tear the connection down gracefully
    ///
    /// Every pending request completes with a transport-fault error; no
    /// auto-reconnect follows a user-requested close.
    pub fn close(&self) {
        let _ = self.inner.cmd_tx.send(Command::Close);
    }

    /// Build and send a request, returning it together with its completion
    ///
    /// The request value is returned synchronously; the completion fires
    /// later, exactly once. `method` must be non-empty and `params`, when
    /// present, an object or an array — violations are reported here and
    /// never sent.
    pub fn send_request(&self, method: impl Into<String>, params: Option<Value>) -> Result<PendingCall> {
        self.send_request_object(Request::new(method, params))
    }

    /// Send a pre-built request
    ///
    /// The id is always (re)assigned from the client's own sequence so that
    /// ids stay unique per connection.
    pub fn send_request_object(&self, mut request: Request) -> Result<PendingCall> {
        validate(&request)?;
        request.id = Some(self.inner.next_id.fetch_add(1, Ordering::Relaxed) + 1);

        let (completion, rx) = oneshot::channel();
        let command = Command::SendRequest {
            request: request.clone(),
            completion,
        };
        if let Err(err) = self.inner.cmd_tx.send(command) {
            if let Command::SendRequest { completion, .. } = err.0 {
                let _ = completion.send(Err(Error::ConnectionClosed));
            }
        }
        Ok(PendingCall { request, rx })
    }

    /// Build and send a notification: fire-and-forget, never tracked
    pub fn send_notification(&self, method: impl Into<String>, params: Option<Value>) -> Result<Request> {
        self.send_notification_object(Request::new(method, params))
    }

    /// Send a pre-built notification; any id on the value is stripped
    pub fn send_notification_object(&self, mut request: Request) -> Result<Request> {
        validate(&request)?;
        request.id = None;
        let _ = self.inner.cmd_tx.send(Command::SendNotification {
            request: request.clone(),
        });
        Ok(request)
    }

    /// Cancel a request: its completion fires with a cancellation result and
    /// nothing is sent to the server
    pub fn cancel_request(&self, request: &Request) {
        if let Some(id) = request.id {
            let _ = self.inner.cmd_tx.send(Command::Cancel { id });
        }
    }

    /// Cancel every pending request
    pub fn cancel_all_requests(&self) {
        let _ = self.inner.cmd_tx.send(Command::CancelAll);
    }

    /// Current connection state
    pub fn connection_state(&self) -> ConnectionState {
        *self.inner.state_rx.borrow()
    }

    /// Whether the channel is open and ready for requests
    pub fn is_connected(&self) -> bool {
        self.connection_state() == ConnectionState::Open
    }

    /// Watch connection-state transitions
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_rx.clone()
    }

    /// The configuration this client was built with
    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }
}

fn validate(request: &Request) -> Result<()> {
    if request.method.is_empty() {
        return Err(Error::InvalidRequest("method must not be empty".into()));
    }
    if let Some(params) = &request.params {
        if !params.is_object() && !params.is_array() {
            return Err(Error::InvalidRequest(
                "params must be an object or an array".into(),
            ));
        }
    }
    Ok(())
}

struct PendingRequest {
    request: Request,
    attempts_made: u32,
    /// Timer generation; a fired timer carrying a stale generation is ignored
    generation: u32,
    completion: oneshot::Sender<Result<Response>>,
}

enum QueuedItem {
    Call(u64),
    Notification(Request),
}

struct EventLoop<T: Transport> {
    transport: T,
    config: ClientConfig,
    cmd_tx: mpsc::UnboundedSender<Command>,
    cmd_rx: mpsc::UnboundedReceiver<Command>,
    state_tx: watch::Sender<ConnectionState>,
    delegate: Option<Weak<dyn ClientDelegate>>,
    pending: HashMap<u64, PendingRequest>,
    /// Outbound traffic issued while Opening, flushed FIFO on Open
    queued: VecDeque<QueuedItem>,
    user_closed: bool,
}

impl<T: Transport> EventLoop<T> {
    async fn run(mut self) {
        let (transport_tx, mut transport_rx) = mpsc::unbounded_channel();
        loop {
            tokio::select! {
                command = self.cmd_rx.recv() => match command {
                    Some(command) => self.handle_command(command, &transport_tx).await,
                    // All handles dropped; nothing can resolve the pending
                    // table anymore, so fail it before the loop dies.
                    None => break,
                },
                event = transport_rx.recv() => {
                    if let Some(event) = event {
                        self.handle_transport_event(event).await;
                    }
                }
            }
        }
        self.fail_all(Error::ConnectionClosed);
    }

    fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    fn set_state(&self, state: ConnectionState) {
        if *self.state_tx.borrow() != state {
            debug!(?state, "connection state changed");
            let _ = self.state_tx.send(state);
        }
    }

    fn delegate(&self) -> Option<Arc<dyn ClientDelegate>> {
        self.delegate.as_ref().and_then(Weak::upgrade)
    }

    async fn handle_command(
        &mut self,
        command: Command,
        transport_tx: &mpsc::UnboundedSender<TransportEvent>,
    ) {
        match command {
            Command::Connect => {
                if matches!(self.state(), ConnectionState::Opening | ConnectionState::Open) {
                    debug!("connect ignored: already opening or open");
                    return;
                }
                self.open_channel(transport_tx).await;
            }
            Command::Close => self.handle_close().await,
            Command::SendRequest { request, completion } => {
                self.handle_send_request(request, completion, transport_tx).await;
            }
            Command::SendNotification { request } => {
                self.handle_send_notification(request, transport_tx).await;
            }
            Command::Cancel { id } => {
                if let Some(entry) = self.pending.remove(&id) {
                    debug!(id, method = %entry.request.method, "request canceled");
                    let _ = entry.completion.send(Err(Error::Canceled));
                    self.queued.retain(|item| !matches!(item, QueuedItem::Call(q) if *q == id));
                }
            }
            Command::CancelAll => {
                debug!(count = self.pending.len(), "canceling all requests");
                self.fail_all(Error::Canceled);
            }
            Command::SetDelegate(delegate) => self.delegate = Some(delegate),
            Command::DetachDelegate => self.delegate = None,
            Command::TimedOut { id, generation } => self.handle_timeout(id, generation).await,
        }
    }

    async fn open_channel(&mut self, transport_tx: &mpsc::UnboundedSender<TransportEvent>) {
        self.user_closed = false;
        self.set_state(ConnectionState::Opening);
        let opened = tokio::time::timeout(
            self.config.connect_timeout,
            self.transport.open(transport_tx.clone()),
        )
        .await;
        match opened {
            Ok(Ok(())) => {
                // Stay in Opening until the channel reports Open.
            }
            Ok(Err(e)) => {
                warn!("connect failed: {}", e);
                self.set_state(ConnectionState::Closed);
                if let Some(delegate) = self.delegate() {
                    delegate.on_error(&e);
                }
                self.fail_all(Error::Transport(format!("connect failed: {}", e)));
            }
            Err(_) => {
                let e = Error::Transport("connect timed out".into());
                warn!("{}", e);
                self.set_state(ConnectionState::Closed);
                if let Some(delegate) = self.delegate() {
                    delegate.on_error(&e);
                }
                self.fail_all(e);
            }
        }
    }

    async fn handle_close(&mut self) {
        self.user_closed = true;
        match self.state() {
            ConnectionState::Open => {
                self.set_state(ConnectionState::Closing);
                self.transport.close().await;
                // Closed is reported by the channel and finishes teardown.
            }
            ConnectionState::Opening => {
                self.transport.close().await;
                self.set_state(ConnectionState::Closed);
                self.fail_all(Error::ConnectionClosed);
            }
            ConnectionState::Closing | ConnectionState::Closed => {}
        }
    }

    async fn handle_send_request(
        &mut self,
        request: Request,
        completion: oneshot::Sender<Result<Response>>,
        transport_tx: &mpsc::UnboundedSender<TransportEvent>,
    ) {
        let id = match request.id {
            Some(id) => id,
            None => {
                let _ = completion.send(Err(Error::InvalidRequest("request without id".into())));
                return;
            }
        };
        self.pending.insert(
            id,
            PendingRequest {
                request,
                attempts_made: 0,
                generation: 0,
                completion,
            },
        );
        match self.state() {
            ConnectionState::Open => self.transmit(id).await,
            ConnectionState::Opening => self.queued.push_back(QueuedItem::Call(id)),
            ConnectionState::Closed if self.config.auto_connect && !self.user_closed => {
                // Auto-connect: the send doubles as an implicit connect.
                self.queued.push_back(QueuedItem::Call(id));
                self.open_channel(transport_tx).await;
            }
            ConnectionState::Closing | ConnectionState::Closed => {
                if let Some(entry) = self.pending.remove(&id) {
                    let _ = entry.completion.send(Err(Error::NotConnected));
                }
            }
        }
    }

    async fn handle_send_notification(
        &mut self,
        request: Request,
        transport_tx: &mpsc::UnboundedSender<TransportEvent>,
    ) {
        match self.state() {
            ConnectionState::Open => {
                if let Err(e) = self.transport.send(request.to_json_string()).await {
                    warn!(method = %request.method, "notification dropped: {}", e);
                }
            }
            ConnectionState::Opening => self.queued.push_back(QueuedItem::Notification(request)),
            ConnectionState::Closed if self.config.auto_connect && !self.user_closed => {
                self.queued.push_back(QueuedItem::Notification(request));
                self.open_channel(transport_tx).await;
            }
            ConnectionState::Closing | ConnectionState::Closed => {
                warn!(method = %request.method, "notification dropped: not connected");
            }
        }
    }

    /// Send the request for `id` and arm its timeout timer
    async fn transmit(&mut self, id: u64) {
        let text = match self.pending.get(&id) {
            Some(entry) => entry.request.to_json_string(),
            // Canceled while queued
            None => return,
        };
        match self.transport.send(text).await {
            Ok(()) => {
                let Some(entry) = self.pending.get_mut(&id) else {
                    return;
                };
                entry.generation += 1;
                let generation = entry.generation;
                let cmd_tx = self.cmd_tx.clone();
                let timeout = self.config.request_timeout;
                tokio::spawn(async move {
                    tokio::time::sleep(timeout).await;
                    let _ = cmd_tx.send(Command::TimedOut { id, generation });
                });
            }
            Err(e) => {
                if let Some(entry) = self.pending.remove(&id) {
                    warn!(id, method = %entry.request.method, "send failed: {}", e);
                    let _ = entry
                        .completion
                        .send(Err(Error::Transport(format!("send failed: {}", e))));
                }
            }
        }
    }

    async fn handle_timeout(&mut self, id: u64, generation: u32) {
        let Some(entry) = self.pending.get_mut(&id) else {
            // Resolved or canceled before the timer fired
            return;
        };
        if entry.generation != generation {
            // A retry already rearmed this request
            return;
        }
        if entry.attempts_made < self.config.max_retries {
            entry.attempts_made += 1;
            debug!(
                id,
                method = %entry.request.method,
                attempt = entry.attempts_made + 1,
                "request timed out, retrying"
            );
            // Identical request, same id: a late answer to any attempt
            // resolves this entry.
            self.transmit(id).await;
        } else if let Some(entry) = self.pending.remove(&id) {
            let attempts = entry.attempts_made + 1;
            warn!(id, method = %entry.request.method, attempts, "request timed out");
            let _ = entry.completion.send(Err(Error::RequestTimeout {
                method: entry.request.method,
                attempts,
            }));
        }
    }

    async fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::StateChanged(TransportState::Open) => {
                info!("signaling channel open");
                self.set_state(ConnectionState::Open);
                if let Some(delegate) = self.delegate() {
                    delegate.on_connected();
                }
                self.flush_queue().await;
            }
            TransportEvent::StateChanged(TransportState::Closed) => {
                let was_user_close = self.user_closed;
                info!(user_requested = was_user_close, "signaling channel closed");
                self.set_state(ConnectionState::Closed);
                self.fail_all(Error::ConnectionClosed);
                if let Some(delegate) = self.delegate() {
                    delegate.on_disconnected();
                }
                if !was_user_close && self.config.auto_connect {
                    // Previously failed requests are not re-submitted; that
                    // is the caller's responsibility.
                    let _ = self.cmd_tx.send(Command::Connect);
                }
            }
            TransportEvent::StateChanged(_) => {}
            TransportEvent::Error(message) => {
                warn!("transport error: {}", message);
                if let Some(delegate) = self.delegate() {
                    delegate.on_error(&Error::Transport(message));
                }
            }
            TransportEvent::Message(value) => self.dispatch_message(&value),
        }
    }

    async fn flush_queue(&mut self) {
        while let Some(item) = self.queued.pop_front() {
            match item {
                QueuedItem::Call(id) => self.transmit(id).await,
                QueuedItem::Notification(request) => {
                    if let Err(e) = self.transport.send(request.to_json_string()).await {
                        warn!(method = %request.method, "queued notification dropped: {}", e);
                    }
                }
            }
        }
    }

    fn dispatch_message(&mut self, value: &Value) {
        match Message::decode(value) {
            Ok(Message::Response(response)) => {
                let Some(id) = response.id else {
                    warn!("dropping response with null id: {:?}", response.error);
                    return;
                };
                match self.pending.remove(&id) {
                    Some(entry) => {
                        // Removing the entry retires its timer in the same
                        // serialized step: a later firing finds no entry.
                        let _ = entry.completion.send(Ok(response));
                    }
                    None => {
                        // Either never ours or already answered after a retry
                        debug!(id, "dropping response with no matching request");
                    }
                }
            }
            Ok(Message::Request(request)) => {
                match self.delegate() {
                    Some(delegate) => delegate.on_request_received(request),
                    None => debug!(method = %request.method, "request dropped: no delegate"),
                }
            }
            Err(e) => {
                // Protocol fault: logged and dropped, connection stays up
                warn!("dropping malformed message: {}", e);
            }
        }
    }

    fn fail_all(&mut self, error: Error) {
        self.queued.clear();
        for (_, entry) in self.pending.drain() {
            let _ = entry.completion.send(Err(error.clone()));
        }
    }
}
