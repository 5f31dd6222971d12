//! Production media engine over the `webrtc` crate
//!
//! Maps the [`MediaSession`] surface onto `RTCPeerConnection` and forwards
//! the connection's callbacks (gathered candidates, ICE state, remote
//! tracks) into the tagged session-event channel.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use crate::engine::{
    IceCandidate, IceState, MediaEngine, MediaSession, SdpKind, SessionEvent, SessionEvents,
};
use crate::error::{Error, Result};

/// ICE server configuration for the production engine
#[derive(Debug, Clone)]
pub struct RtcConfig {
    /// STUN/TURN server URLs handed to every new session
    pub ice_servers: Vec<String>,
}

impl Default for RtcConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec!["stun:stun.l.google.com:19302".to_owned()],
        }
    }
}

/// Media engine backed by the `webrtc` crate
pub struct RtcEngine {
    config: RtcConfig,
}

impl RtcEngine {
    /// Create an engine with the given ICE server configuration
    pub fn new(config: RtcConfig) -> Self {
        Self { config }
    }

    fn rtc_configuration(&self) -> RTCConfiguration {
        RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: self.config.ice_servers.clone(),
                ..Default::default()
            }],
            ..Default::default()
        }
    }
}

#[async_trait]
impl MediaEngine for RtcEngine {
    async fn create_session(
        &self,
        connection_id: &str,
        events: SessionEvents,
    ) -> Result<Arc<dyn MediaSession>> {
        let rtc = APIBuilder::new()
            .build()
            .new_peer_connection(self.rtc_configuration())
            .await
            .map_err(|e| Error::Engine(format!("failed to create peer connection: {}", e)))?;
        let rtc = Arc::new(rtc);
        debug!(connection_id, "native peer connection created");

        let id = connection_id.to_owned();
        let candidate_events = events.clone();
        rtc.on_ice_candidate(Box::new(move |candidate| {
            let id = id.clone();
            let events = candidate_events.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    // Gathering complete
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = events.send((
                            id,
                            SessionEvent::LocalCandidate(IceCandidate {
                                candidate: init.candidate,
                                sdp_mid: init.sdp_mid,
                                sdp_mline_index: init.sdp_mline_index,
                            }),
                        ));
                    }
                    Err(e) => warn!("failed to serialize gathered candidate: {}", e),
                }
            })
        }));

        let id = connection_id.to_owned();
        let ice_events = events.clone();
        rtc.on_ice_connection_state_change(Box::new(move |state| {
            let _ = ice_events.send((id.clone(), SessionEvent::IceStateChanged(map_ice_state(state))));
            Box::pin(async {})
        }));

        let id = connection_id.to_owned();
        rtc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let _ = events.send((id.clone(), SessionEvent::RemoteStreamAdded(track.stream_id())));
            Box::pin(async {})
        }));

        Ok(Arc::new(RtcSession { rtc }))
    }
}

fn map_ice_state(state: RTCIceConnectionState) -> IceState {
    match state {
        RTCIceConnectionState::New => IceState::New,
        RTCIceConnectionState::Checking => IceState::Checking,
        RTCIceConnectionState::Connected => IceState::Connected,
        RTCIceConnectionState::Completed => IceState::Completed,
        RTCIceConnectionState::Disconnected => IceState::Disconnected,
        RTCIceConnectionState::Failed => IceState::Failed,
        RTCIceConnectionState::Closed | RTCIceConnectionState::Unspecified => IceState::Closed,
    }
}

fn description(kind: SdpKind, sdp: &str) -> Result<RTCSessionDescription> {
    match kind {
        SdpKind::Offer => RTCSessionDescription::offer(sdp.to_owned()),
        SdpKind::Answer => RTCSessionDescription::answer(sdp.to_owned()),
    }
    .map_err(|e| Error::Sdp(format!("invalid {:?} SDP: {}", kind, e)))
}

struct RtcSession {
    rtc: Arc<RTCPeerConnection>,
}

#[async_trait]
impl MediaSession for RtcSession {
    async fn create_offer(&self) -> Result<String> {
        let offer = self
            .rtc
            .create_offer(None)
            .await
            .map_err(|e| Error::Sdp(format!("create_offer failed: {}", e)))?;
        Ok(offer.sdp)
    }

    async fn create_answer(&self) -> Result<String> {
        let answer = self
            .rtc
            .create_answer(None)
            .await
            .map_err(|e| Error::Sdp(format!("create_answer failed: {}", e)))?;
        Ok(answer.sdp)
    }

    async fn set_local_description(&self, kind: SdpKind, sdp: &str) -> Result<()> {
        self.rtc
            .set_local_description(description(kind, sdp)?)
            .await
            .map_err(|e| Error::Sdp(format!("set_local_description failed: {}", e)))
    }

    async fn set_remote_description(&self, kind: SdpKind, sdp: &str) -> Result<()> {
        self.rtc
            .set_remote_description(description(kind, sdp)?)
            .await
            .map_err(|e| Error::Sdp(format!("set_remote_description failed: {}", e)))
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<()> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate.clone(),
            sdp_mid: candidate.sdp_mid.clone(),
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: None,
        };
        self.rtc
            .add_ice_candidate(init)
            .await
            .map_err(|e| Error::Ice(format!("add_ice_candidate failed: {}", e)))
    }

    async fn close(&self) -> Result<()> {
        self.rtc
            .close()
            .await
            .map_err(|e| Error::Engine(format!("close failed: {}", e)))
    }
}
