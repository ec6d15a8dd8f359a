//! [`PeerEngine`] backed by a `webrtc` peer connection with one data channel.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use signal_envelope::{IceCandidate, SdpKind, SessionDescription};
use tracing::{debug, warn};
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use crate::engine::{
    EngineError, EngineEvent, EngineEventSender, IceConnectionState, PeerEngine, SdpRole,
};

pub const DEFAULT_STUN_SERVERS: &[&str] = &[
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
    "stun:stun2.l.google.com:19302",
];

const DATA_CHANNEL_LABEL: &str = "data";

pub struct WebRtcEngine {
    peer: Arc<RTCPeerConnection>,
    data_channel: Arc<Mutex<Option<Arc<RTCDataChannel>>>>,
    events: EngineEventSender,
}

impl WebRtcEngine {
    pub async fn new(stun_servers: &[String], events: EngineEventSender) -> Result<Self, EngineError> {
        let api = APIBuilder::new().build();
        let config = RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: stun_servers.to_vec(),
                ..Default::default()
            }],
            ..Default::default()
        };
        let peer = Arc::new(
            api.new_peer_connection(config)
                .await
                .map_err(|err| EngineError::Setup(err.to_string()))?,
        );
        let data_channel = Arc::new(Mutex::new(None));

        let candidate_tx = events.clone();
        peer.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            if let Some(candidate) = candidate {
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = candidate_tx.send(EngineEvent::LocalCandidate(IceCandidate::new(
                            init.candidate,
                            u32::from(init.sdp_mline_index.unwrap_or(0)),
                            init.sdp_mid,
                        )));
                    }
                    Err(err) => warn!(error = %err, "failed to serialise local candidate"),
                }
            }
            Box::pin(async {})
        }));

        let state_tx = events.clone();
        peer.on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
            debug!(state = %state, "ice connection state changed");
            if let Some(state) = map_ice_state(state) {
                let _ = state_tx.send(EngineEvent::ConnectionStateChanged(state));
            }
            Box::pin(async {})
        }));

        let slot = Arc::clone(&data_channel);
        let message_tx = events.clone();
        peer.on_data_channel(Box::new(move |channel: Arc<RTCDataChannel>| {
            debug!(label = channel.label(), "remote data channel opened");
            attach_data_channel(&channel, message_tx.clone());
            *slot.lock() = Some(channel);
            Box::pin(async {})
        }));

        Ok(Self {
            peer,
            data_channel,
            events,
        })
    }

    pub async fn close(&self) -> Result<(), EngineError> {
        self.peer
            .close()
            .await
            .map_err(|err| EngineError::Setup(err.to_string()))
    }

    /// The offering side owns the data channel; it has to exist before the
    /// first offer so the offer carries an application section.
    async fn ensure_data_channel(&self) -> Result<(), EngineError> {
        if self.data_channel.lock().is_some() {
            return Ok(());
        }
        let channel = self
            .peer
            .create_data_channel(DATA_CHANNEL_LABEL, None)
            .await
            .map_err(|err| EngineError::Create {
                role: SdpRole::Offer,
                reason: err.to_string(),
            })?;
        attach_data_channel(&channel, self.events.clone());
        *self.data_channel.lock() = Some(channel);
        Ok(())
    }
}

#[async_trait]
impl PeerEngine for WebRtcEngine {
    async fn create_local_description(
        &self,
        role: SdpRole,
    ) -> Result<SessionDescription, EngineError> {
        let created = match role {
            SdpRole::Offer => {
                self.ensure_data_channel().await?;
                self.peer.create_offer(None).await
            }
            SdpRole::Answer => self.peer.create_answer(None).await,
        };
        created
            .map(|description| SessionDescription::new(role.kind(), description.sdp))
            .map_err(|err| EngineError::Create {
                role,
                reason: err.to_string(),
            })
    }

    async fn apply_local_description(
        &self,
        description: &SessionDescription,
    ) -> Result<(), EngineError> {
        let local_error = |err: webrtc::Error| EngineError::LocalDescription {
            kind: description.kind,
            reason: err.to_string(),
        };
        let rtc = to_rtc_description(description).map_err(local_error)?;
        self.peer.set_local_description(rtc).await.map_err(local_error)
    }

    async fn apply_remote_description(
        &self,
        description: &SessionDescription,
    ) -> Result<(), EngineError> {
        let remote_error = |err: webrtc::Error| EngineError::RemoteDescription {
            kind: description.kind,
            reason: err.to_string(),
        };
        let rtc = to_rtc_description(description).map_err(remote_error)?;
        self.peer
            .set_remote_description(rtc)
            .await
            .map_err(remote_error)
    }

    async fn apply_remote_candidate(&self, candidate: &IceCandidate) -> Result<(), EngineError> {
        let sdp_mline_index = u16::try_from(candidate.sdp_mline_index)
            .map_err(|_| EngineError::Candidate("sdpMLineIndex out of range".into()))?;
        self.peer
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.sdp.clone(),
                sdp_mid: candidate.sdp_mid.clone(),
                sdp_mline_index: Some(sdp_mline_index),
                username_fragment: None,
            })
            .await
            .map_err(|err| EngineError::Candidate(err.to_string()))
    }

    async fn send_data(&self, text: &str) -> Result<(), EngineError> {
        let channel = self
            .data_channel
            .lock()
            .clone()
            .ok_or_else(|| EngineError::DataChannel("no data channel yet".into()))?;
        channel
            .send_text(text.to_string())
            .await
            .map(|_| ())
            .map_err(|err| EngineError::DataChannel(err.to_string()))
    }
}

fn attach_data_channel(channel: &Arc<RTCDataChannel>, events: EngineEventSender) {
    channel.on_message(Box::new(move |message: DataChannelMessage| {
        let text = String::from_utf8_lossy(&message.data).into_owned();
        let _ = events.send(EngineEvent::DataMessage(text));
        Box::pin(async {})
    }));
}

fn to_rtc_description(
    description: &SessionDescription,
) -> Result<RTCSessionDescription, webrtc::Error> {
    let sdp = description.sdp.clone();
    match description.kind {
        SdpKind::Offer => RTCSessionDescription::offer(sdp),
        SdpKind::ProvisionalAnswer => RTCSessionDescription::pranswer(sdp),
        SdpKind::Answer => RTCSessionDescription::answer(sdp),
        SdpKind::Rollback => {
            let mut rollback = RTCSessionDescription::default();
            rollback.sdp_type = RTCSdpType::Rollback;
            Ok(rollback)
        }
    }
}

fn map_ice_state(state: RTCIceConnectionState) -> Option<IceConnectionState> {
    Some(match state {
        RTCIceConnectionState::New => IceConnectionState::New,
        RTCIceConnectionState::Checking => IceConnectionState::Checking,
        RTCIceConnectionState::Connected => IceConnectionState::Connected,
        RTCIceConnectionState::Completed => IceConnectionState::Completed,
        RTCIceConnectionState::Failed => IceConnectionState::Failed,
        RTCIceConnectionState::Disconnected => IceConnectionState::Disconnected,
        RTCIceConnectionState::Closed => IceConnectionState::Closed,
        RTCIceConnectionState::Unspecified => return None,
    })
}
