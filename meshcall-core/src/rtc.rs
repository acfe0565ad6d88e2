//! Peer transports backed by the `webrtc` crate
//!
//! One `RTCPeerConnection` per link. Local tracks are published as
//! `TrackLocalStaticSample`s keyed by the capture track id; feeding samples
//! into them is the capture pipeline's job. Connection callbacks are forwarded
//! to the link's [`TransportEventSink`].

use crate::config::IceServerConfig;
use crate::identity::ParticipantId;
use crate::media::{MediaTrack, RemoteStream, TrackKind};
use crate::peer::transport::{
    PeerTransport, PeerTransportFactory, TransportError, TransportEventKind, TransportEventSink,
};
use crate::types::{ConnectionState, IceCandidate, SdpType, SessionDescription};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

fn backend(context: &str, e: impl std::fmt::Display) -> TransportError {
    TransportError::Backend(format!("{context}: {e}"))
}

fn codec_for(kind: TrackKind) -> RTCRtpCodecCapability {
    match kind {
        TrackKind::Audio => RTCRtpCodecCapability {
            mime_type: "audio/opus".to_string(),
            clock_rate: 48000,
            channels: 2,
            sdp_fmtp_line: String::new(),
            rtcp_feedback: vec![],
        },
        TrackKind::Video => RTCRtpCodecCapability {
            mime_type: "video/VP8".to_string(),
            clock_rate: 90000,
            channels: 0,
            sdp_fmtp_line: String::new(),
            rtcp_feedback: vec![],
        },
    }
}

fn sample_track(track: &MediaTrack) -> Arc<TrackLocalStaticSample> {
    Arc::new(TrackLocalStaticSample::new(
        codec_for(track.kind()),
        track.id().to_string(),
        track.stream_id().to_string(),
    ))
}

fn to_rtc(desc: SessionDescription) -> Result<RTCSessionDescription, TransportError> {
    let result = match desc.sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(desc.sdp),
        SdpType::Answer => RTCSessionDescription::answer(desc.sdp),
    };
    result.map_err(|e| TransportError::Sdp(e.to_string()))
}

fn connection_state(state: RTCPeerConnectionState) -> Option<ConnectionState> {
    match state {
        RTCPeerConnectionState::New => Some(ConnectionState::New),
        RTCPeerConnectionState::Connecting => Some(ConnectionState::Connecting),
        RTCPeerConnectionState::Connected => Some(ConnectionState::Connected),
        RTCPeerConnectionState::Disconnected => Some(ConnectionState::Disconnected),
        RTCPeerConnectionState::Failed => Some(ConnectionState::Failed),
        RTCPeerConnectionState::Closed => Some(ConnectionState::Closed),
        RTCPeerConnectionState::Unspecified => None,
    }
}

/// Builds `RTCPeerConnection`-backed transports
pub struct RtcPeerTransportFactory {
    api: API,
    config: RTCConfiguration,
}

impl RtcPeerTransportFactory {
    /// Factory using the default codecs and interceptors
    ///
    /// # Errors
    ///
    /// Returns error if the media engine cannot be set up
    pub fn new(ice_servers: &[IceServerConfig]) -> Result<Self, TransportError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| backend("register codecs", e))?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(|e| backend("register interceptors", e))?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: ice_servers
                .iter()
                .map(|server| RTCIceServer {
                    urls: server.urls.clone(),
                    username: server.username.clone().unwrap_or_default(),
                    credential: server.credential.clone().unwrap_or_default(),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        };
        Ok(Self { api, config })
    }
}

#[async_trait]
impl PeerTransportFactory for RtcPeerTransportFactory {
    async fn create(
        &self,
        peer: &ParticipantId,
        sink: TransportEventSink,
    ) -> Result<Box<dyn PeerTransport>, TransportError> {
        let pc = Arc::new(
            self.api
                .new_peer_connection(self.config.clone())
                .await
                .map_err(|e| backend("create peer connection", e))?,
        );

        let candidates = sink.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let sink = candidates.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        sink.emit(TransportEventKind::LocalCandidate(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_m_line_index: init.sdp_mline_index,
                        }));
                    }
                    Err(e) => tracing::warn!(error = %e, "Failed to encode local candidate"),
                }
            })
        }));

        let states = sink.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let sink = states.clone();
            Box::pin(async move {
                tracing::debug!(peer = %sink.peer(), ?state, "Peer connection state changed");
                if let Some(state) = connection_state(state) {
                    sink.emit(TransportEventKind::ConnectionState(state));
                }
            })
        }));

        let received: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        pc.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                let sink = sink.clone();
                let received = Arc::clone(&received);
                Box::pin(async move {
                    let track_ids = {
                        let mut ids = received.lock();
                        ids.push(track.id());
                        ids.clone()
                    };
                    sink.emit(TransportEventKind::RemoteStream(RemoteStream::new(
                        track.stream_id(),
                        track_ids,
                    )));
                })
            },
        ));

        tracing::debug!(peer = %peer, "Created RTCPeerConnection");
        Ok(Box::new(RtcTransport {
            peer: peer.clone(),
            pc,
            video_sender: Mutex::new(None),
        }))
    }
}

struct RtcTransport {
    peer: ParticipantId,
    pc: Arc<RTCPeerConnection>,
    video_sender: Mutex<Option<Arc<RTCRtpSender>>>,
}

#[async_trait]
impl PeerTransport for RtcTransport {
    async fn add_track(&self, track: &MediaTrack) -> Result<(), TransportError> {
        let local: Arc<dyn TrackLocal + Send + Sync> = sample_track(track);
        let sender = self
            .pc
            .add_track(local)
            .await
            .map_err(|e| TransportError::Track(e.to_string()))?;
        if track.kind() == TrackKind::Video {
            *self.video_sender.lock() = Some(sender);
        }
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| TransportError::Sdp(e.to_string()))?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| TransportError::Sdp(e.to_string()))?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), TransportError> {
        self.pc
            .set_local_description(to_rtc(desc)?)
            .await
            .map_err(|e| TransportError::Sdp(e.to_string()))
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), TransportError> {
        self.pc
            .set_remote_description(to_rtc(desc)?)
            .await
            .map_err(|e| TransportError::Sdp(e.to_string()))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_m_line_index,
            ..Default::default()
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|e| TransportError::Candidate(e.to_string()))
    }

    async fn replace_video_track(&self, track: &MediaTrack) -> Result<(), TransportError> {
        let sender = self
            .video_sender
            .lock()
            .clone()
            .ok_or_else(|| TransportError::Track("no video sender".to_string()))?;
        let local: Arc<dyn TrackLocal + Send + Sync> = sample_track(track);
        sender
            .replace_track(Some(local))
            .await
            .map_err(|e| TransportError::Track(e.to_string()))
    }

    async fn close(&self) {
        if let Err(e) = self.pc.close().await {
            tracing::debug!(peer = %self.peer, error = %e, "Error closing peer connection");
        }
    }
}
