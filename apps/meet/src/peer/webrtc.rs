//! [`MediaConnection`] backed by a webrtc-rs `RTCPeerConnection`.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use meet_proto::{IceCandidate, SdpKind, SessionDescription};
use parking_lot::Mutex;
use tracing::{debug, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use super::connection::{
    ConnectionEvent, ConnectionEvents, ConnectionState, MediaConnection, MediaConnector,
    RemoteTrack,
};
use crate::error::ConnectionError;
use crate::media::{MediaTrack, TrackKind};

const STREAM_ID: &str = "meet";

fn rejected(err: webrtc::Error) -> ConnectionError {
    ConnectionError::Rejected(err.to_string())
}

pub struct WebRtcConnector {
    api: API,
    stun_urls: Vec<String>,
}

impl WebRtcConnector {
    pub fn new(stun_urls: Vec<String>) -> Result<Self, ConnectionError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs().map_err(rejected)?;
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine).map_err(rejected)?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();
        Ok(Self { api, stun_urls })
    }
}

#[async_trait]
impl MediaConnector for WebRtcConnector {
    async fn connect(
        &self,
        events: ConnectionEvents,
    ) -> Result<Arc<dyn MediaConnection>, ConnectionError> {
        let ice_servers = if self.stun_urls.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: self.stun_urls.clone(),
                ..Default::default()
            }]
        };
        let config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };
        let peer_connection = Arc::new(
            self.api
                .new_peer_connection(config)
                .await
                .map_err(rejected)?,
        );

        let candidate_events = events.clone();
        peer_connection.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let events = candidate_events.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        events.emit(ConnectionEvent::LocalCandidate(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                            username_fragment: init.username_fragment,
                        }));
                    }
                    Err(err) => warn!(target: "peer", "failed to serialize local candidate: {err}"),
                }
            })
        }));

        let state_events = events.clone();
        peer_connection.on_peer_connection_state_change(Box::new(
            move |state: RTCPeerConnectionState| {
                let events = state_events.clone();
                Box::pin(async move {
                    let mapped = match state {
                        RTCPeerConnectionState::New | RTCPeerConnectionState::Unspecified => {
                            ConnectionState::New
                        }
                        RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
                        RTCPeerConnectionState::Connected => ConnectionState::Connected,
                        RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
                        RTCPeerConnectionState::Failed => ConnectionState::Failed,
                        RTCPeerConnectionState::Closed => ConnectionState::Closed,
                    };
                    events.emit(ConnectionEvent::StateChanged(mapped));
                })
            },
        ));

        let track_events = events.clone();
        peer_connection.on_track(Box::new(move |track, _receiver, _transceiver| {
            let events = track_events.clone();
            Box::pin(async move {
                let kind = match track.kind() {
                    RTPCodecType::Audio => TrackKind::Audio,
                    RTPCodecType::Video => TrackKind::Video,
                    RTPCodecType::Unspecified => return,
                };
                events.emit(ConnectionEvent::RemoteTrack(RemoteTrack {
                    id: track.id(),
                    kind,
                }));
            })
        }));

        debug!(target: "peer", remote_id = events.remote_id(), "peer connection created");
        Ok(Arc::new(WebRtcConnection {
            peer_connection,
            senders: Mutex::new(HashMap::new()),
        }))
    }
}

pub struct WebRtcConnection {
    peer_connection: Arc<RTCPeerConnection>,
    /// Local track id to the sender carrying it.
    senders: Mutex<HashMap<String, Arc<RTCRtpSender>>>,
}

fn to_rtc(description: SessionDescription) -> Result<RTCSessionDescription, ConnectionError> {
    let parsed = match description.kind {
        SdpKind::Offer => RTCSessionDescription::offer(description.sdp),
        SdpKind::Answer => RTCSessionDescription::answer(description.sdp),
    };
    parsed.map_err(|err| ConnectionError::InvalidDescription(err.to_string()))
}

fn from_rtc(description: RTCSessionDescription) -> Result<SessionDescription, ConnectionError> {
    match description.sdp_type {
        RTCSdpType::Offer => Ok(SessionDescription::offer(description.sdp)),
        RTCSdpType::Answer => Ok(SessionDescription::answer(description.sdp)),
        other => Err(ConnectionError::InvalidDescription(format!(
            "unexpected sdp type {other}"
        ))),
    }
}

/// Sample track carrying `track` on the wire. Samples are written by the
/// capture backend; muted tracks send nothing.
fn local_track(track: &MediaTrack) -> Arc<dyn TrackLocal + Send + Sync> {
    let mime_type = match track.kind() {
        TrackKind::Audio => MIME_TYPE_OPUS,
        TrackKind::Video => MIME_TYPE_VP8,
    };
    Arc::new(TrackLocalStaticSample::new(
        RTCRtpCodecCapability {
            mime_type: mime_type.to_owned(),
            ..Default::default()
        },
        track.id().to_string(),
        STREAM_ID.to_owned(),
    ))
}

#[async_trait]
impl MediaConnection for WebRtcConnection {
    async fn create_offer(&self) -> Result<SessionDescription, ConnectionError> {
        let offer = self
            .peer_connection
            .create_offer(None)
            .await
            .map_err(rejected)?;
        from_rtc(offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription, ConnectionError> {
        let answer = self
            .peer_connection
            .create_answer(None)
            .await
            .map_err(rejected)?;
        from_rtc(answer)
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), ConnectionError> {
        self.peer_connection
            .set_local_description(to_rtc(description)?)
            .await
            .map_err(rejected)
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), ConnectionError> {
        self.peer_connection
            .set_remote_description(to_rtc(description)?)
            .await
            .map_err(rejected)
    }

    async fn rollback(&self) -> Result<(), ConnectionError> {
        if self.peer_connection.signaling_state() != RTCSignalingState::HaveLocalOffer {
            return Ok(());
        }
        let mut rollback = RTCSessionDescription::default();
        rollback.sdp_type = RTCSdpType::Rollback;
        self.peer_connection
            .set_local_description(rollback)
            .await
            .map_err(rejected)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), ConnectionError> {
        self.peer_connection
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: candidate.username_fragment,
            })
            .await
            .map_err(rejected)
    }

    async fn add_track(&self, track: Arc<MediaTrack>) -> Result<(), ConnectionError> {
        if self.senders.lock().contains_key(track.id()) {
            return Ok(());
        }
        let sender = self
            .peer_connection
            .add_track(local_track(&track))
            .await
            .map_err(rejected)?;
        self.senders.lock().insert(track.id().to_string(), sender);
        Ok(())
    }

    async fn replace_track(
        &self,
        old: &MediaTrack,
        new: Arc<MediaTrack>,
    ) -> Result<(), ConnectionError> {
        let sender = self
            .senders
            .lock()
            .remove(old.id())
            .ok_or_else(|| ConnectionError::Rejected(format!("no sender for {}", old.id())))?;
        sender
            .replace_track(Some(local_track(&new)))
            .await
            .map_err(rejected)?;
        self.senders.lock().insert(new.id().to_string(), sender);
        Ok(())
    }

    async fn remove_track(&self, track: &MediaTrack) -> Result<(), ConnectionError> {
        let sender = self.senders.lock().remove(track.id());
        match sender {
            Some(sender) => self
                .peer_connection
                .remove_track(&sender)
                .await
                .map_err(rejected),
            None => Ok(()),
        }
    }

    async fn close(&self) {
        if let Err(err) = self.peer_connection.close().await {
            debug!(target: "peer", "peer connection close failed: {err}");
        }
    }
}
