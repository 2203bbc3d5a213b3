//! webrtc-rs negotiation engine

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, trace, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use super::engine::{EngineEvent, EngineFactory, NegotiationEngine};
use crate::config::CallConfig;
use crate::media::{LocalTrack, RemoteTrack, TrackKind};
use crate::peer::ConnectionState;
use crate::signaling::{IceCandidate, SdpType, SessionDescription};
use crate::{Error, Result};

/// Builds `RtcEngine`s sharing one webrtc-rs API instance
pub struct RtcEngineFactory {
    api: API,
    ice_servers: Vec<RTCIceServer>,
}

impl RtcEngineFactory {
    /// Register the default codecs and interceptors and take ICE servers from
    /// `config`
    pub fn new(config: &CallConfig) -> Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| Error::WebRtcError(format!("Failed to register codecs: {}", e)))?;

        let registry = register_default_interceptors(Default::default(), &mut media_engine)
            .map_err(|e| Error::WebRtcError(format!("Failed to register interceptors: {}", e)))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let ice_servers = config
            .stun_servers
            .iter()
            .map(|url| RTCIceServer {
                urls: vec![url.clone()],
                ..Default::default()
            })
            .chain(config.turn_servers.iter().map(|turn| RTCIceServer {
                urls: vec![turn.url.clone()],
                username: turn.username.clone(),
                credential: turn.credential.clone(),
                ..Default::default()
            }))
            .collect();

        Ok(Self { api, ice_servers })
    }
}

#[async_trait]
impl EngineFactory for RtcEngineFactory {
    async fn create(
        &self,
        events: mpsc::UnboundedSender<EngineEvent>,
    ) -> Result<Arc<dyn NegotiationEngine>> {
        let rtc_config = RTCConfiguration {
            ice_servers: self.ice_servers.clone(),
            ..Default::default()
        };
        let peer_connection = Arc::new(
            self.api
                .new_peer_connection(rtc_config)
                .await
                .map_err(|e| Error::WebRtcError(format!("Failed to create peer connection: {}", e)))?,
        );
        Ok(Arc::new(RtcEngine::new(peer_connection, events)))
    }
}

/// Negotiation engine over an `RTCPeerConnection`
pub struct RtcEngine {
    peer_connection: Arc<RTCPeerConnection>,
    stream_id: String,
    /// Senders are retained so their tracks stay negotiated
    senders: Mutex<Vec<(Arc<TrackLocalStaticSample>, Arc<RTCRtpSender>)>>,
    closed: AtomicBool,
}

impl RtcEngine {
    #[instrument(skip_all)]
    fn new(peer_connection: Arc<RTCPeerConnection>, events: mpsc::UnboundedSender<EngineEvent>) -> Self {
        let stream_id = format!("campuscare-{}", uuid::Uuid::new_v4());

        let candidate_tx = events.clone();
        peer_connection.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let tx = candidate_tx.clone();
            Box::pin(async move {
                // None marks the end of gathering
                let Some(candidate) = candidate else { return };
                match candidate.to_json() {
                    Ok(init) => {
                        trace!("Gathered local candidate {}", init.candidate);
                        let _ = tx.send(EngineEvent::LocalCandidate(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_m_line_index: init.sdp_mline_index,
                            username_fragment: init.username_fragment,
                        }));
                    }
                    Err(e) => warn!("Failed to serialize local candidate: {}", e),
                }
            })
        }));

        let state_tx = events.clone();
        peer_connection.on_peer_connection_state_change(Box::new(
            move |s: RTCPeerConnectionState| {
                let tx = state_tx.clone();
                Box::pin(async move {
                    let state = match s {
                        RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
                        RTCPeerConnectionState::Connected => ConnectionState::Connected,
                        RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
                        RTCPeerConnectionState::Failed => ConnectionState::Failed,
                        // New is the initial state; Closed is owned by the session
                        _ => return,
                    };
                    let _ = tx.send(EngineEvent::StateChanged(state));
                })
            },
        ));

        let track_tx = events;
        peer_connection.on_track(Box::new(move |track: Arc<TrackRemote>, _receiver, _transceiver| {
            let tx = track_tx.clone();
            Box::pin(async move {
                let kind = match track.kind() {
                    RTPCodecType::Audio => TrackKind::Audio,
                    RTPCodecType::Video => TrackKind::Video,
                    other => {
                        warn!("Ignoring remote track of kind {:?}", other);
                        return;
                    }
                };
                info!("Remote {} track {} added", kind, track.id());
                let _ = tx.send(EngineEvent::RemoteTrack(RemoteTrack {
                    id: track.id(),
                    kind,
                    stream_id: track.stream_id(),
                }));

                // Keep reading so the receiver's buffers never stall
                tokio::spawn(async move {
                    while track.read_rtp().await.is_ok() {}
                });
            })
        }));

        Self {
            peer_connection,
            stream_id,
            senders: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    async fn local_description(&self) -> Result<SessionDescription> {
        let desc = self
            .peer_connection
            .local_description()
            .await
            .ok_or_else(|| Error::NegotiationError("No local description after setting it".to_string()))?;
        from_rtc(desc)
    }
}

fn from_rtc(desc: RTCSessionDescription) -> Result<SessionDescription> {
    match desc.sdp_type {
        RTCSdpType::Offer => Ok(SessionDescription::offer(desc.sdp)),
        RTCSdpType::Answer => Ok(SessionDescription::answer(desc.sdp)),
        other => Err(Error::NegotiationError(format!(
            "unexpected local description type {:?}",
            other
        ))),
    }
}

fn codec_for(kind: TrackKind) -> RTCRtpCodecCapability {
    match kind {
        TrackKind::Audio => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_OPUS.to_owned(),
            clock_rate: 48000,
            channels: 2,
            sdp_fmtp_line: "minptime=10;useinbandfec=1".to_owned(),
            rtcp_feedback: vec![],
        },
        TrackKind::Video => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_VP8.to_owned(),
            clock_rate: 90000,
            channels: 0,
            sdp_fmtp_line: String::new(),
            rtcp_feedback: vec![],
        },
    }
}

#[async_trait]
impl NegotiationEngine for RtcEngine {
    async fn add_local_track(&self, track: &LocalTrack) -> Result<()> {
        let sample = Arc::new(TrackLocalStaticSample::new(
            codec_for(track.kind()),
            track.id().to_string(),
            self.stream_id.clone(),
        ));
        let sender = self
            .peer_connection
            .add_track(Arc::clone(&sample) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| Error::WebRtcError(format!("Failed to add {} track: {}", track.kind(), e)))?;

        // Drain RTCP so interceptors keep running
        let rtcp_sender = Arc::clone(&sender);
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while rtcp_sender.read(&mut buf).await.is_ok() {}
        });

        debug!("Added local {} track {}", track.kind(), track.id());
        self.senders.lock().push((sample, sender));
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        let offer = self
            .peer_connection
            .create_offer(None)
            .await
            .map_err(|e| Error::NegotiationError(format!("Failed to create offer: {}", e)))?;
        self.peer_connection
            .set_local_description(offer)
            .await
            .map_err(|e| Error::NegotiationError(format!("Failed to set local description: {}", e)))?;
        self.local_description().await
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let answer = self
            .peer_connection
            .create_answer(None)
            .await
            .map_err(|e| Error::NegotiationError(format!("Failed to create answer: {}", e)))?;
        self.peer_connection
            .set_local_description(answer)
            .await
            .map_err(|e| Error::NegotiationError(format!("Failed to set local description: {}", e)))?;
        self.local_description().await
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        let desc = match description.sdp_type {
            SdpType::Offer => RTCSessionDescription::offer(description.sdp),
            SdpType::Answer => RTCSessionDescription::answer(description.sdp),
        }
        .map_err(|e| Error::NegotiationError(format!("Failed to parse remote description: {}", e)))?;

        self.peer_connection
            .set_remote_description(desc)
            .await
            .map_err(|e| Error::NegotiationError(format!("Failed to set remote description: {}", e)))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_m_line_index,
            username_fragment: candidate.username_fragment,
        };
        self.peer_connection
            .add_ice_candidate(init)
            .await
            .map_err(|e| Error::IceCandidateError(format!("Failed to add ICE candidate: {}", e)))
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.peer_connection
            .close()
            .await
            .map_err(|e| Error::WebRtcError(format!("Failed to close peer connection: {}", e)))
    }
}
