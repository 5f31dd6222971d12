//! Peer-connection negotiation state machine
//!
//! [`WebRtcPeer`] owns one [`PeerSession`] per remote connection id and
//! drives the media engine through the offer/answer exchange, queueing
//! remote ICE candidates until the remote description lands. Operations on
//! one connection id are serialized against each other; distinct ids proceed
//! independently. A failure is always scoped to its session: it is returned
//! to the caller or reported through the delegate, and never touches other
//! sessions or the signaling connection.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::engine::{
    IceCandidate, IceState, MediaEngine, MediaSession, SdpKind, SessionEvent, SessionEvents,
};
use crate::error::{Error, Result};
use crate::session::PeerSession;

/// Listener for negotiation events
///
/// One listener per peer manager; held weakly, never kept alive by the
/// machine. All methods default to no-ops and must not block.
pub trait PeerDelegate: Send + Sync {
    /// A local offer was generated and should be relayed to the remote party
    fn on_offer_generated(&self, _connection_id: &str, _sdp: &str) {}

    /// A local answer was generated and should be relayed to the remote party
    fn on_answer_generated(&self, _connection_id: &str, _sdp: &str) {}

    /// A candidate was gathered locally and should be relayed to the remote
    /// party
    fn on_local_ice_candidate(&self, _connection_id: &str, _candidate: &IceCandidate) {}

    /// Media arrived on a new remote stream
    fn on_remote_stream_added(&self, _connection_id: &str, _stream_id: &str) {}

    /// A remote stream went away (or its session was closed)
    fn on_remote_stream_removed(&self, _connection_id: &str, _stream_id: &str) {}

    /// ICE connectivity of one session changed
    fn on_ice_state_changed(&self, _connection_id: &str, _state: IceState) {}

    /// A failure scoped to one session (e.g. a queued candidate the engine
    /// rejected while draining)
    fn on_session_error(&self, _connection_id: &str, _error: &Error) {}
}

/// Observable snapshot of one session's negotiation state
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    /// The remote connection identifier
    pub connection_id: String,
    /// Whether this side generated the offer
    pub is_initiator: bool,
    /// Whether the remote description has been applied
    pub remote_description_set: bool,
    /// Remote candidates still waiting for the remote description
    pub queued_candidates: usize,
    /// ICE failures observed since the last successful connection
    pub ice_attempts: u32,
    /// Active remote stream, when media has arrived
    pub remote_stream: Option<String>,
}

type SessionTable = Arc<RwLock<HashMap<String, Arc<Mutex<PeerSession>>>>>;
type DelegateSlot = Arc<parking_lot::Mutex<Option<Weak<dyn PeerDelegate>>>>;

/// Negotiation state machine over a table of peer sessions
pub struct WebRtcPeer {
    engine: Arc<dyn MediaEngine>,
    sessions: SessionTable,
    delegate: DelegateSlot,
    events_tx: SessionEvents,
}

impl WebRtcPeer {
    /// Create a peer manager over the given media engine
    pub fn new(engine: Arc<dyn MediaEngine>) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let sessions: SessionTable = Arc::new(RwLock::new(HashMap::new()));
        let delegate: DelegateSlot = Arc::new(parking_lot::Mutex::new(None));
        tokio::spawn(pump_events(
            events_rx,
            Arc::clone(&sessions),
            Arc::clone(&delegate),
        ));
        Self {
            engine,
            sessions,
            delegate,
            events_tx,
        }
    }

    /// Register the delegate; the machine keeps only a weak reference
    pub fn set_delegate(&self, delegate: Weak<dyn PeerDelegate>) {
        *self.delegate.lock() = Some(delegate);
    }

    /// Drop the delegate reference without waiting for it to be collected
    pub fn detach_delegate(&self) {
        *self.delegate.lock() = None;
    }

    fn delegate(&self) -> Option<Arc<dyn PeerDelegate>> {
        resolve_delegate(&self.delegate)
    }

    /// Generate a local offer for `connection_id`, creating the session if
    /// absent and marking it initiator
    ///
    /// The offer is installed as the local description, surfaced through
    /// [`PeerDelegate::on_offer_generated`] and returned for relay.
    pub async fn generate_offer(&self, connection_id: &str) -> Result<String> {
        let session = self.get_or_create(connection_id, true).await?;
        let mut session = session.lock().await;

        let offer = session.session().create_offer().await?;
        session
            .session()
            .set_local_description(SdpKind::Offer, &offer)
            .await?;
        session.set_local_description(offer.clone());
        drop(session);

        info!(connection_id, "local offer generated");
        if let Some(delegate) = self.delegate() {
            delegate.on_offer_generated(connection_id, &offer);
        }
        Ok(offer)
    }

    /// Apply a remote offer for `connection_id` and generate the answer
    ///
    /// Creates the session if absent (non-initiator), installs the remote
    /// description, drains any queued candidates in arrival order, then
    /// generates and surfaces the local answer.
    pub async fn process_offer(&self, sdp: &str, connection_id: &str) -> Result<String> {
        let session = self.get_or_create(connection_id, false).await?;
        let mut session = session.lock().await;

        session
            .session()
            .set_remote_description(SdpKind::Offer, sdp)
            .await?;
        session.mark_remote_description_set();
        let failures = session.drain_remote_candidates().await;

        let answer = session.session().create_answer().await?;
        session
            .session()
            .set_local_description(SdpKind::Answer, &answer)
            .await?;
        session.set_local_description(answer.clone());
        drop(session);

        self.report_failures(connection_id, failures);
        info!(connection_id, "remote offer processed, local answer generated");
        if let Some(delegate) = self.delegate() {
            delegate.on_answer_generated(connection_id, &answer);
        }
        Ok(answer)
    }

    /// Apply the remote answer to a previously generated offer
    ///
    /// Contract violation — reported as an error, never ignored — when the
    /// session is unknown, was not the initiator, or has no offer out yet.
    pub async fn process_answer(&self, sdp: &str, connection_id: &str) -> Result<()> {
        let session = self
            .session(connection_id)
            .await
            .ok_or_else(|| Error::UnknownConnection(connection_id.to_owned()))?;
        let mut session = session.lock().await;

        if !session.is_initiator() || session.local_description().is_none() {
            return Err(Error::InvalidState(format!(
                "no local offer outstanding for connection {}",
                connection_id
            )));
        }

        session
            .session()
            .set_remote_description(SdpKind::Answer, sdp)
            .await?;
        session.mark_remote_description_set();
        let failures = session.drain_remote_candidates().await;
        drop(session);

        self.report_failures(connection_id, failures);
        info!(connection_id, "remote answer applied");
        Ok(())
    }

    /// Hand a remote candidate to the session for `connection_id`
    ///
    /// Applied immediately once the remote description is set; queued in
    /// arrival order until then. No dedup, no reordering.
    pub async fn add_ice_candidate(
        &self,
        candidate: IceCandidate,
        connection_id: &str,
    ) -> Result<()> {
        let session = self
            .session(connection_id)
            .await
            .ok_or_else(|| Error::UnknownConnection(connection_id.to_owned()))?;
        let mut session = session.lock().await;
        session.add_remote_candidate(candidate).await
    }

    /// Close the session for `connection_id`, releasing the native session
    /// and discarding queued candidates
    ///
    /// Idempotent: closing an unknown or already-closed id is a no-op.
    pub async fn close_connection(&self, connection_id: &str) {
        let removed = self.sessions.write().await.remove(connection_id);
        let Some(session) = removed else {
            debug!(connection_id, "close on unknown connection ignored");
            return;
        };
        let mut session = session.lock().await;
        if let Some(stream_id) = session.remote_stream().map(str::to_owned) {
            if let Some(delegate) = self.delegate() {
                delegate.on_remote_stream_removed(connection_id, &stream_id);
            }
        }
        session.close().await;
        info!(connection_id, "connection closed");
    }

    /// Close every session (signaling teardown path)
    pub async fn close_all_connections(&self) {
        let ids: Vec<String> = self.sessions.read().await.keys().cloned().collect();
        for connection_id in ids {
            self.close_connection(&connection_id).await;
        }
    }

    /// Connection ids with a live session
    pub async fn active_connections(&self) -> Vec<String> {
        self.sessions.read().await.keys().cloned().collect()
    }

    /// Whether a session exists for `connection_id`
    pub async fn has_connection(&self, connection_id: &str) -> bool {
        self.sessions.read().await.contains_key(connection_id)
    }

    /// Snapshot of one session's negotiation state
    pub async fn connection_info(&self, connection_id: &str) -> Option<ConnectionInfo> {
        let session = self.session(connection_id).await?;
        let session = session.lock().await;
        Some(ConnectionInfo {
            connection_id: session.connection_id().to_owned(),
            is_initiator: session.is_initiator(),
            remote_description_set: session.remote_description_set(),
            queued_candidates: session.queued_candidates(),
            ice_attempts: session.ice_attempts(),
            remote_stream: session.remote_stream().map(str::to_owned),
        })
    }

    async fn session(&self, connection_id: &str) -> Option<Arc<Mutex<PeerSession>>> {
        self.sessions.read().await.get(connection_id).cloned()
    }

    async fn get_or_create(
        &self,
        connection_id: &str,
        is_initiator: bool,
    ) -> Result<Arc<Mutex<PeerSession>>> {
        // Write lock held across creation so two callers cannot race a
        // second native session into existence for the same id.
        let mut sessions = self.sessions.write().await;
        if let Some(session) = sessions.get(connection_id) {
            return Ok(Arc::clone(session));
        }
        let native = self
            .engine
            .create_session(connection_id, self.events_tx.clone())
            .await?;
        debug!(connection_id, is_initiator, "peer session created");
        let session = Arc::new(Mutex::new(PeerSession::new(
            connection_id,
            is_initiator,
            native,
        )));
        sessions.insert(connection_id.to_owned(), Arc::clone(&session));
        Ok(session)
    }

    fn report_failures(&self, connection_id: &str, failures: Vec<(IceCandidate, Error)>) {
        if failures.is_empty() {
            return;
        }
        let Some(delegate) = self.delegate() else {
            return;
        };
        for (_, error) in &failures {
            delegate.on_session_error(connection_id, error);
        }
    }
}

fn resolve_delegate(slot: &DelegateSlot) -> Option<Arc<dyn PeerDelegate>> {
    slot.lock().as_ref().and_then(Weak::upgrade)
}

/// Forward engine events to the delegate and keep per-session bookkeeping
/// (remote stream handle, ICE attempt counter) current
async fn pump_events(
    mut events_rx: mpsc::UnboundedReceiver<(String, SessionEvent)>,
    sessions: SessionTable,
    delegate: DelegateSlot,
) {
    while let Some((connection_id, event)) = events_rx.recv().await {
        let session = sessions.read().await.get(&connection_id).cloned();
        match event {
            SessionEvent::LocalCandidate(candidate) => {
                if let Some(delegate) = resolve_delegate(&delegate) {
                    delegate.on_local_ice_candidate(&connection_id, &candidate);
                }
            }
            SessionEvent::IceStateChanged(state) => {
                if let Some(session) = session {
                    let mut session = session.lock().await;
                    match state {
                        IceState::Failed => {
                            session.record_ice_failure();
                            warn!(
                                connection_id = %connection_id,
                                attempts = session.ice_attempts(),
                                "ICE connectivity failed"
                            );
                        }
                        IceState::Connected | IceState::Completed => {
                            session.reset_ice_attempts();
                        }
                        _ => {}
                    }
                }
                if let Some(delegate) = resolve_delegate(&delegate) {
                    delegate.on_ice_state_changed(&connection_id, state);
                }
            }
            SessionEvent::RemoteStreamAdded(stream_id) => {
                if let Some(session) = session {
                    session.lock().await.set_remote_stream(Some(stream_id.clone()));
                }
                if let Some(delegate) = resolve_delegate(&delegate) {
                    delegate.on_remote_stream_added(&connection_id, &stream_id);
                }
            }
            SessionEvent::RemoteStreamRemoved(stream_id) => {
                if let Some(session) = session {
                    session.lock().await.set_remote_stream(None);
                }
                if let Some(delegate) = resolve_delegate(&delegate) {
                    delegate.on_remote_stream_removed(&connection_id, &stream_id);
                }
            }
        }
    }
}
