//! Client engine integration tests
//!
//! Drive the engine over an in-memory transport: request/response
//! correlation, timeout + retry timing, cancellation, disconnect handling
//! and server-originated traffic.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_test::assert_ok;

use mediasig_jsonrpc::{
    ClientConfig, ClientDelegate, ConnectionState, Error, JsonRpcClient, Request, Result,
    Transport, TransportEvent, TransportState,
};

// =============================================================================
// Test Helpers
// =============================================================================

/// Shared side of the in-memory transport: what the client sent, plus a way
/// to inject inbound traffic and to kill the channel.
struct MockLink {
    sent_tx: mpsc::UnboundedSender<String>,
    events: Mutex<Option<mpsc::UnboundedSender<TransportEvent>>>,
    opens: AtomicUsize,
    fail_open: bool,
}

impl MockLink {
    fn inject(&self, value: Value) {
        let events = self.events.lock().unwrap();
        events
            .as_ref()
            .expect("channel not open")
            .send(TransportEvent::Message(value))
            .unwrap();
    }

    fn drop_connection(&self) {
        let events = self.events.lock().unwrap();
        events
            .as_ref()
            .expect("channel not open")
            .send(TransportEvent::StateChanged(TransportState::Closed))
            .unwrap();
    }

    fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

struct MockTransport {
    link: Arc<MockLink>,
}

#[async_trait]
impl Transport for MockTransport {
    async fn open(&mut self, events: mpsc::UnboundedSender<TransportEvent>) -> Result<()> {
        self.link.opens.fetch_add(1, Ordering::SeqCst);
        if self.link.fail_open {
            return Err(Error::Transport("connection refused".into()));
        }
        let _ = events.send(TransportEvent::StateChanged(TransportState::Open));
        *self.link.events.lock().unwrap() = Some(events);
        Ok(())
    }

    async fn send(&mut self, text: String) -> Result<()> {
        self.link
            .sent_tx
            .send(text)
            .map_err(|_| Error::ConnectionClosed)
    }

    async fn close(&mut self) {
        self.drop_link();
    }
}

impl MockTransport {
    fn drop_link(&self) {
        let events = self.link.events.lock().unwrap();
        if let Some(events) = events.as_ref() {
            let _ = events.send(TransportEvent::StateChanged(TransportState::Closed));
        }
    }
}

fn mock_client(
    config: ClientConfig,
) -> (JsonRpcClient, Arc<MockLink>, mpsc::UnboundedReceiver<String>) {
    mock_client_with(config, false)
}

fn mock_client_with(
    config: ClientConfig,
    fail_open: bool,
) -> (JsonRpcClient, Arc<MockLink>, mpsc::UnboundedReceiver<String>) {
    let (sent_tx, sent_rx) = mpsc::unbounded_channel();
    let link = Arc::new(MockLink {
        sent_tx,
        events: Mutex::new(None),
        opens: AtomicUsize::new(0),
        fail_open,
    });
    let transport = MockTransport {
        link: Arc::clone(&link),
    };
    let client = JsonRpcClient::with_transport(transport, config);
    (client, link, sent_rx)
}

async fn wait_for_state(client: &JsonRpcClient, state: ConnectionState) {
    let mut rx = client.subscribe_state();
    rx.wait_for(|s| *s == state).await.unwrap();
}

fn parse(text: &str) -> Value {
    serde_json::from_str(text).unwrap()
}

/// Delegate that forwards server-originated requests and errors to the test
struct RecordingDelegate {
    requests_tx: mpsc::UnboundedSender<Request>,
    errors: Mutex<Vec<String>>,
}

impl ClientDelegate for RecordingDelegate {
    fn on_request_received(&self, request: Request) {
        let _ = self.requests_tx.send(request);
    }

    fn on_error(&self, error: &Error) {
        self.errors.lock().unwrap().push(error.to_string());
    }
}

// =============================================================================
// Request/response correlation
// =============================================================================

#[tokio::test]
async fn test_ping_pong_scenario() {
    let (client, link, mut sent_rx) = mock_client(ClientConfig::default());
    wait_for_state(&client, ConnectionState::Open).await;

    let call = client.send_request("ping", Some(json!({}))).unwrap();
    assert_eq!(call.request().id, Some(1));

    let sent = parse(&sent_rx.recv().await.unwrap());
    assert_eq!(sent["jsonrpc"], "2.0");
    assert_eq!(sent["method"], "ping");
    assert_eq!(sent["id"], 1);

    link.inject(json!({"jsonrpc": "2.0", "id": 1, "result": "pong"}));

    let response = tokio_test::assert_ok!(call.wait().await);
    assert_eq!(response.result, Some(json!("pong")));
    assert!(response.error.is_none());
}

#[tokio::test]
async fn test_ids_strictly_increasing() {
    let (client, link, mut sent_rx) = mock_client(ClientConfig::default());
    wait_for_state(&client, ConnectionState::Open).await;

    let calls: Vec<_> = (0..3)
        .map(|_| client.send_request("ping", None).unwrap())
        .collect();
    let ids: Vec<_> = calls.iter().map(|c| c.request().id.unwrap()).collect();
    assert_eq!(ids, vec![1, 2, 3]);

    // Sent in issue order; resolvable in any order
    for id in &ids {
        let sent = parse(&sent_rx.recv().await.unwrap());
        assert_eq!(sent["id"], *id);
    }
    for (call, id) in calls.into_iter().zip(ids).rev() {
        link.inject(json!({"jsonrpc": "2.0", "id": id, "result": null}));
        let response = call.wait().await.unwrap();
        assert_eq!(response.id, Some(id));
    }
}

#[tokio::test]
async fn test_unmatched_response_dropped() {
    let (client, link, mut sent_rx) = mock_client(ClientConfig::default());
    wait_for_state(&client, ConnectionState::Open).await;

    let call = client.send_request("ping", None).unwrap();
    sent_rx.recv().await.unwrap();

    // Response for an id nobody is waiting on: dropped, the real pending
    // request is untouched.
    link.inject(json!({"jsonrpc": "2.0", "id": 99, "result": "stray"}));
    link.inject(json!({"jsonrpc": "2.0", "id": 1, "result": "mine"}));

    let response = call.wait().await.unwrap();
    assert_eq!(response.result, Some(json!("mine")));
}

#[tokio::test]
async fn test_error_response_delivered_unchanged() {
    let (client, link, mut sent_rx) = mock_client(ClientConfig::default());
    wait_for_state(&client, ConnectionState::Open).await;

    let call = client.send_request("joinRoom", Some(json!({"room": "r"}))).unwrap();
    sent_rx.recv().await.unwrap();

    link.inject(json!({
        "jsonrpc": "2.0",
        "id": 1,
        "error": {"code": -32000, "message": "room full", "data": {"max": 4}}
    }));

    // Application-level failure: a response, not a client error
    let response = call.wait().await.unwrap();
    let error = response.error.unwrap();
    assert_eq!(error.code, -32000);
    assert_eq!(error.message, "room full");
    assert_eq!(error.data, Some(json!({"max": 4})));
}

#[tokio::test]
async fn test_malformed_inbound_does_not_close_connection() {
    let (client, link, mut sent_rx) = mock_client(ClientConfig::default());
    wait_for_state(&client, ConnectionState::Open).await;

    link.inject(json!({"no": "jsonrpc"}));
    link.inject(json!({"jsonrpc": "2.0"}));

    // Channel still works after the garbage
    let call = client.send_request("ping", None).unwrap();
    sent_rx.recv().await.unwrap();
    link.inject(json!({"jsonrpc": "2.0", "id": 1, "result": "pong"}));
    assert_eq!(call.wait().await.unwrap().result, Some(json!("pong")));
    assert!(client.is_connected());
}

// =============================================================================
// Timeout and retry
// =============================================================================

fn fast_timeout_config() -> ClientConfig {
    ClientConfig {
        request_timeout: Duration::from_millis(100),
        max_retries: 1,
        ..ClientConfig::default()
    }
}

#[tokio::test(start_paused = true)]
async fn test_timeout_after_retries_exhausted() {
    let (client, _link, mut sent_rx) = mock_client(fast_timeout_config());
    wait_for_state(&client, ConnectionState::Open).await;

    let started = tokio::time::Instant::now();
    let call = client.send_request("ping", Some(json!({}))).unwrap();

    // Original send plus exactly one retry, byte-identical (same id)
    let first = sent_rx.recv().await.unwrap();
    let second = sent_rx.recv().await.unwrap();
    assert_eq!(first, second);

    let err = call.wait().await.unwrap_err();
    match err {
        Error::RequestTimeout { method, attempts } => {
            assert_eq!(method, "ping");
            assert_eq!(attempts, 2);
        }
        other => panic!("expected timeout, got {:?}", other),
    }

    // No earlier than 2 * 100 ms, no later than scheduling slack allows
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(200), "completed too early: {:?}", elapsed);
    assert!(elapsed < Duration::from_millis(250), "completed too late: {:?}", elapsed);

    // And nothing else was sent
    assert!(sent_rx.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn test_late_response_after_retry_still_resolves() {
    let (client, link, mut sent_rx) = mock_client(fast_timeout_config());
    wait_for_state(&client, ConnectionState::Open).await;

    let call = client.send_request("ping", None).unwrap();
    sent_rx.recv().await.unwrap();
    // First attempt timed out, retry went out...
    sent_rx.recv().await.unwrap();
    // ...and the answer to the original attempt arrives late: same id, so it
    // still resolves the call.
    link.inject(json!({"jsonrpc": "2.0", "id": 1, "result": "pong"}));

    let response = call.wait().await.unwrap();
    assert_eq!(response.result, Some(json!("pong")));
}

#[tokio::test(start_paused = true)]
async fn test_error_response_is_never_retried() {
    let (client, link, mut sent_rx) = mock_client(fast_timeout_config());
    wait_for_state(&client, ConnectionState::Open).await;

    let call = client.send_request("publishVideo", None).unwrap();
    sent_rx.recv().await.unwrap();
    link.inject(json!({
        "jsonrpc": "2.0", "id": 1,
        "error": {"code": -32601, "message": "method not found"}
    }));

    let response = call.wait().await.unwrap();
    assert_eq!(response.error.unwrap().code, -32601);

    // Let the timeout window pass twice over: no resend happens
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(sent_rx.try_recv().is_err());
}

// =============================================================================
// Cancellation
// =============================================================================

#[tokio::test]
async fn test_cancel_request_fires_cancellation_result() {
    let (client, _link, mut sent_rx) = mock_client(ClientConfig::default());
    wait_for_state(&client, ConnectionState::Open).await;

    let call = client.send_request("ping", None).unwrap();
    sent_rx.recv().await.unwrap();

    let request = call.request().clone();
    client.cancel_request(&request);

    assert!(matches!(call.wait().await.unwrap_err(), Error::Canceled));
    // Cancellation sends nothing to the server
    assert!(sent_rx.try_recv().is_err());
}

#[tokio::test]
async fn test_cancel_all_requests() {
    let (client, _link, mut sent_rx) = mock_client(ClientConfig::default());
    wait_for_state(&client, ConnectionState::Open).await;

    let first = client.send_request("a", None).unwrap();
    let second = client.send_request("b", None).unwrap();
    sent_rx.recv().await.unwrap();
    sent_rx.recv().await.unwrap();

    client.cancel_all_requests();

    assert!(matches!(first.wait().await.unwrap_err(), Error::Canceled));
    assert!(matches!(second.wait().await.unwrap_err(), Error::Canceled));
}

// =============================================================================
// Connection lifecycle
// =============================================================================

#[tokio::test]
async fn test_requests_queued_while_opening_flush_in_order() {
    let config = ClientConfig {
        auto_connect: false,
        ..ClientConfig::default()
    };
    let (client, link, mut sent_rx) = mock_client(config);
    assert_eq!(client.connection_state(), ConnectionState::Closed);

    client.connect();
    let first = client.send_request("first", None).unwrap();
    let second = client.send_request("second", None).unwrap();

    wait_for_state(&client, ConnectionState::Open).await;

    let a = parse(&sent_rx.recv().await.unwrap());
    let b = parse(&sent_rx.recv().await.unwrap());
    assert_eq!(a["method"], "first");
    assert_eq!(b["method"], "second");

    link.inject(json!({"jsonrpc": "2.0", "id": 1, "result": null}));
    link.inject(json!({"jsonrpc": "2.0", "id": 2, "result": null}));
    first.wait().await.unwrap();
    second.wait().await.unwrap();
}

#[tokio::test]
async fn test_disconnect_fails_pending_with_transport_fault() {
    let config = ClientConfig {
        auto_connect: false,
        ..ClientConfig::default()
    };
    let (client, link, mut sent_rx) = mock_client(config);
    client.connect();
    wait_for_state(&client, ConnectionState::Open).await;

    let call = client.send_request("ping", None).unwrap();
    sent_rx.recv().await.unwrap();

    link.drop_connection();

    // No completion hangs over a disconnect
    assert!(matches!(
        call.wait().await.unwrap_err(),
        Error::ConnectionClosed
    ));
    wait_for_state(&client, ConnectionState::Closed).await;
}

#[tokio::test]
async fn test_auto_reconnect_after_unexpected_close() {
    let (client, link, _sent_rx) = mock_client(ClientConfig::default());
    wait_for_state(&client, ConnectionState::Open).await;
    assert_eq!(link.open_count(), 1);

    link.drop_connection();

    // Channel is re-opened without caller involvement; previously failed
    // requests are not re-submitted.
    tokio::time::timeout(Duration::from_secs(1), async {
        while link.open_count() < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("no reconnect attempt");
    wait_for_state(&client, ConnectionState::Open).await;
}

#[tokio::test]
async fn test_connect_failure_reported_via_delegate() {
    let (requests_tx, _requests_rx) = mpsc::unbounded_channel();
    let delegate = Arc::new(RecordingDelegate {
        requests_tx,
        errors: Mutex::new(Vec::new()),
    });

    let config = ClientConfig {
        auto_connect: false,
        ..ClientConfig::default()
    };
    let (client, _link, _sent_rx) = mock_client_with(config, true);
    client.set_delegate(Arc::downgrade(&delegate) as Weak<dyn ClientDelegate>);

    client.connect();

    // Connect fails silently: state goes back to Closed and the failure is
    // reported through the delegate, not panicked or swallowed.
    tokio::time::timeout(Duration::from_secs(1), async {
        while delegate.errors.lock().unwrap().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("connect failure never reported");
    assert_eq!(client.connection_state(), ConnectionState::Closed);
}

#[tokio::test]
async fn test_close_is_graceful_and_final() {
    let (client, _link, mut sent_rx) = mock_client(ClientConfig::default());
    wait_for_state(&client, ConnectionState::Open).await;

    let call = client.send_request("ping", None).unwrap();
    sent_rx.recv().await.unwrap();

    client.close();
    wait_for_state(&client, ConnectionState::Closed).await;
    assert!(matches!(
        call.wait().await.unwrap_err(),
        Error::ConnectionClosed
    ));

    // User-requested close: auto-connect must not kick back in
    tokio::task::yield_now().await;
    assert_eq!(client.connection_state(), ConnectionState::Closed);
}

// =============================================================================
// Server-originated traffic
// =============================================================================

#[tokio::test]
async fn test_unsolicited_notification_goes_to_delegate() {
    let (requests_tx, mut requests_rx) = mpsc::unbounded_channel();
    let delegate = Arc::new(RecordingDelegate {
        requests_tx,
        errors: Mutex::new(Vec::new()),
    });

    let (client, link, _sent_rx) = mock_client(ClientConfig::default());
    client.set_delegate(Arc::downgrade(&delegate) as Weak<dyn ClientDelegate>);
    wait_for_state(&client, ConnectionState::Open).await;

    link.inject(json!({
        "jsonrpc": "2.0",
        "method": "iceCandidate",
        "params": {"candidate": "candidate:0 1 UDP 2122", "sdpMid": "video"}
    }));

    // Never matched against the pending table, delivered verbatim
    let request = requests_rx.recv().await.unwrap();
    assert!(request.is_notification());
    assert_eq!(request.method, "iceCandidate");
    assert_eq!(request.params.unwrap()["sdpMid"], "video");
}

#[tokio::test]
async fn test_server_request_with_id_goes_to_delegate() {
    let (requests_tx, mut requests_rx) = mpsc::unbounded_channel();
    let delegate = Arc::new(RecordingDelegate {
        requests_tx,
        errors: Mutex::new(Vec::new()),
    });

    let (client, link, _sent_rx) = mock_client(ClientConfig::default());
    client.set_delegate(Arc::downgrade(&delegate) as Weak<dyn ClientDelegate>);
    wait_for_state(&client, ConnectionState::Open).await;

    link.inject(json!({
        "jsonrpc": "2.0",
        "id": 42,
        "method": "participantLeft",
        "params": {"name": "peer-2"}
    }));

    let request = requests_rx.recv().await.unwrap();
    assert_eq!(request.id, Some(42));
    assert_eq!(request.method, "participantLeft");
}

// =============================================================================
// Caller contract
// =============================================================================

#[tokio::test]
async fn test_invalid_requests_rejected_before_send() {
    let (client, _link, mut sent_rx) = mock_client(ClientConfig::default());
    wait_for_state(&client, ConnectionState::Open).await;

    assert!(matches!(
        client.send_request("", None).unwrap_err(),
        Error::InvalidRequest(_)
    ));
    assert!(matches!(
        client.send_request("m", Some(json!(42))).unwrap_err(),
        Error::InvalidRequest(_)
    ));
    assert!(matches!(
        client.send_notification("m", Some(json!("scalar"))).unwrap_err(),
        Error::InvalidRequest(_)
    ));

    tokio::task::yield_now().await;
    assert!(sent_rx.try_recv().is_err());
}

#[tokio::test]
async fn test_notification_carries_no_id_and_is_untracked() {
    let (client, _link, mut sent_rx) = mock_client(ClientConfig::default());
    wait_for_state(&client, ConnectionState::Open).await;

    let sent_value = client
        .send_notification("onIceCandidate", Some(json!({"candidate": "c"})))
        .unwrap();
    assert!(sent_value.is_notification());

    let sent = parse(&sent_rx.recv().await.unwrap());
    assert!(sent.get("id").is_none());
    assert_eq!(sent["method"], "onIceCandidate");
}
