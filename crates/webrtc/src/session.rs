//! Per-connection negotiation state
//!
//! A [`PeerSession`] tracks one remote party's offer/answer progress and owns
//! the remote-candidate queue. The invariant everything here protects: a
//! candidate reaches the native engine only after the remote description is
//! set; until then candidates queue in arrival order and are applied, in that
//! same order, exactly once.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::engine::{IceCandidate, MediaSession};
use crate::error::{Error, Result};

/// Negotiation state for one connection id
pub struct PeerSession {
    connection_id: String,
    is_initiator: bool,
    local_description: Option<String>,
    remote_description_set: bool,
    queued_remote_candidates: Vec<IceCandidate>,
    remote_stream: Option<String>,
    ice_attempts: u32,
    session: Arc<dyn MediaSession>,
}

impl PeerSession {
    pub(crate) fn new(
        connection_id: impl Into<String>,
        is_initiator: bool,
        session: Arc<dyn MediaSession>,
    ) -> Self {
        Self {
            connection_id: connection_id.into(),
            is_initiator,
            local_description: None,
            remote_description_set: false,
            queued_remote_candidates: Vec::new(),
            remote_stream: None,
            ice_attempts: 0,
            session,
        }
    }

    pub(crate) fn connection_id(&self) -> &str {
        &self.connection_id
    }

    pub(crate) fn is_initiator(&self) -> bool {
        self.is_initiator
    }

    pub(crate) fn session(&self) -> &Arc<dyn MediaSession> {
        &self.session
    }

    pub(crate) fn local_description(&self) -> Option<&str> {
        self.local_description.as_deref()
    }

    pub(crate) fn set_local_description(&mut self, sdp: String) {
        self.local_description = Some(sdp);
    }

    pub(crate) fn remote_description_set(&self) -> bool {
        self.remote_description_set
    }

    pub(crate) fn mark_remote_description_set(&mut self) {
        self.remote_description_set = true;
    }

    pub(crate) fn queued_candidates(&self) -> usize {
        self.queued_remote_candidates.len()
    }

    pub(crate) fn remote_stream(&self) -> Option<&str> {
        self.remote_stream.as_deref()
    }

    pub(crate) fn set_remote_stream(&mut self, stream_id: Option<String>) {
        self.remote_stream = stream_id;
    }

    pub(crate) fn ice_attempts(&self) -> u32 {
        self.ice_attempts
    }

    pub(crate) fn record_ice_failure(&mut self) {
        self.ice_attempts += 1;
    }

    pub(crate) fn reset_ice_attempts(&mut self) {
        self.ice_attempts = 0;
    }

    /// Apply a remote candidate, or queue it while the remote description is
    /// still pending
    pub(crate) async fn add_remote_candidate(&mut self, candidate: IceCandidate) -> Result<()> {
        if self.remote_description_set {
            self.session.add_ice_candidate(&candidate).await
        } else {
            debug!(
                connection_id = %self.connection_id,
                queued = self.queued_remote_candidates.len() + 1,
                "queueing remote candidate until remote description is set"
            );
            self.queued_remote_candidates.push(candidate);
            Ok(())
        }
    }

    /// Apply every queued candidate in arrival order, exactly once
    ///
    /// The queue is emptied regardless of per-candidate failures, which are
    /// returned for session-scoped reporting; a rejected candidate never
    /// blocks the ones behind it.
    pub(crate) async fn drain_remote_candidates(&mut self) -> Vec<(IceCandidate, Error)> {
        let candidates = std::mem::take(&mut self.queued_remote_candidates);
        if candidates.is_empty() {
            return Vec::new();
        }
        debug!(
            connection_id = %self.connection_id,
            count = candidates.len(),
            "draining queued remote candidates"
        );
        let mut failures = Vec::new();
        for candidate in candidates {
            if let Err(e) = self.session.add_ice_candidate(&candidate).await {
                warn!(connection_id = %self.connection_id, "queued candidate rejected: {}", e);
                failures.push((candidate, e));
            }
        }
        failures
    }

    /// Release the native session and discard any queued candidates
    pub(crate) async fn close(&mut self) {
        self.queued_remote_candidates.clear();
        if let Err(e) = self.session.close().await {
            warn!(connection_id = %self.connection_id, "session close failed: {}", e);
        }
    }
}
