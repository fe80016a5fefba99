//! Peer Connection Abstraktion
//!
//! Die Negotiation Engine spricht nur mit [`PeerConnection`]. Die
//! Produktiv-Implementierung basiert auf `webrtc`; Events der Peer Connection
//! (ICE Candidates, Gathering-Status, Tracks, Verbindungsstatus) landen als
//! [`PeerEvent`] in einer Senke, statt in verstreuten Callbacks.

use super::audio::{LocalAudio, SAMPLE_RATE};
use super::sdp::{IceCandidate, SdpRole, SessionDescription};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use thiserror::Error;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_gatherer_state::RTCIceGathererState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocal;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PeerError {
    #[error("WebRTC error: {0}")]
    WebRTC(String),

    #[error("Description rejected: {0}")]
    Rejected(String),

    #[error("Local description was not created by this connection")]
    ForeignLocalDescription,
}

// ============================================================================
// EVENTS
// ============================================================================

/// ICE Gathering Status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceGatheringState {
    New,
    Gathering,
    Complete,
}

/// Verbindungsstatus der Peer Connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Remote-Audio, das an die Anzeige weitergereicht wird
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteStream {
    pub stream_id: String,
    pub track_id: String,
    pub mime_type: String,
}

/// Events der Peer Connection
#[derive(Debug, Clone, PartialEq)]
pub enum PeerEvent {
    IceCandidate(IceCandidate),
    IceGatheringStateChanged(IceGatheringState),
    RemoteTrack(RemoteStream),
    ConnectionStateChanged(PeerConnectionState),
}

/// Senke für Peer Events
pub type PeerEventSink = Arc<dyn Fn(PeerEvent) + Send + Sync>;

// ============================================================================
// TRAITS
// ============================================================================

/// Die Operationen, die die Negotiation Engine von einer Peer Connection braucht
#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn add_local_audio(&self, audio: &LocalAudio) -> Result<(), PeerError>;
    async fn create_offer(&self) -> Result<SessionDescription, PeerError>;
    async fn create_answer(&self) -> Result<SessionDescription, PeerError>;
    async fn set_local_description(&self, description: &SessionDescription) -> Result<(), PeerError>;
    async fn set_remote_description(&self, description: &SessionDescription) -> Result<(), PeerError>;
    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), PeerError>;
    async fn close(&self) -> Result<(), PeerError>;
}

/// Erzeugt eine Peer Connection pro Anrufversuch
#[async_trait]
pub trait PeerFactory: Send + Sync {
    async fn create(&self, events: PeerEventSink) -> Result<Arc<dyn PeerConnection>, PeerError>;
}

// ============================================================================
// WEBRTC IMPLEMENTATION
// ============================================================================

/// Baut Peer Connections mit `webrtc`
#[derive(Debug, Clone)]
pub struct WebRtcPeerFactory {
    ice_servers: Vec<RTCIceServer>,
}

impl WebRtcPeerFactory {
    /// `ice_servers` sind STUN/TURN URLs, z.B. `stun:stun.l.google.com:19302`
    pub fn new(ice_servers: Vec<String>) -> Self {
        let ice_servers = if ice_servers.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: ice_servers,
                ..Default::default()
            }]
        };
        Self { ice_servers }
    }
}

#[async_trait]
impl PeerFactory for WebRtcPeerFactory {
    async fn create(&self, events: PeerEventSink) -> Result<Arc<dyn PeerConnection>, PeerError> {
        // Media Engine mit Opus konfigurieren
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| PeerError::WebRTC(e.to_string()))?;

        // Interceptors für RTCP, NACK etc.
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| PeerError::WebRTC(e.to_string()))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: self.ice_servers.clone(),
            ..Default::default()
        };

        let pc = Arc::new(
            api.new_peer_connection(config)
                .await
                .map_err(|e| PeerError::WebRTC(e.to_string()))?,
        );

        register_handlers(&pc, events);

        Ok(Arc::new(WebRtcPeer {
            pc,
            last_created: Mutex::new(None),
            tracks: Mutex::new(Vec::new()),
        }))
    }
}

/// Registriert die Event Handler der Peer Connection
fn register_handlers(pc: &Arc<RTCPeerConnection>, events: PeerEventSink) {
    let sink = Arc::clone(&events);
    pc.on_ice_candidate(Box::new(move |candidate| {
        if let Some(c) = candidate {
            match c.to_json() {
                Ok(init) => sink(PeerEvent::IceCandidate(IceCandidate {
                    candidate: init.candidate,
                    sdp_mline_index: init.sdp_mline_index,
                    sdp_mid: init.sdp_mid,
                })),
                Err(e) => tracing::warn!("Failed to serialize local ICE candidate: {}", e),
            }
        }
        Box::pin(async {})
    }));

    let sink = Arc::clone(&events);
    pc.on_ice_gathering_state_change(Box::new(move |state: RTCIceGathererState| {
        tracing::debug!("ICE gathering state: {:?}", state);
        let mapped = match state {
            RTCIceGathererState::Gathering => Some(IceGatheringState::Gathering),
            RTCIceGathererState::Complete => Some(IceGatheringState::Complete),
            RTCIceGathererState::New => Some(IceGatheringState::New),
            _ => None,
        };
        if let Some(state) = mapped {
            sink(PeerEvent::IceGatheringStateChanged(state));
        }
        Box::pin(async {})
    }));

    let sink = Arc::clone(&events);
    pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
        tracing::info!("Peer connection state: {:?}", state);
        let mapped = match state {
            RTCPeerConnectionState::New => Some(PeerConnectionState::New),
            RTCPeerConnectionState::Connecting => Some(PeerConnectionState::Connecting),
            RTCPeerConnectionState::Connected => Some(PeerConnectionState::Connected),
            RTCPeerConnectionState::Disconnected => Some(PeerConnectionState::Disconnected),
            RTCPeerConnectionState::Failed => Some(PeerConnectionState::Failed),
            RTCPeerConnectionState::Closed => Some(PeerConnectionState::Closed),
            _ => None,
        };
        if let Some(state) = mapped {
            sink(PeerEvent::ConnectionStateChanged(state));
        }
        Box::pin(async {})
    }));

    let sink = events;
    pc.on_track(Box::new(move |track, _, _| {
        let remote = RemoteStream {
            stream_id: track.stream_id(),
            track_id: track.id(),
            mime_type: track.codec().capability.mime_type,
        };
        tracing::info!("Received remote track: {:?}", remote);
        sink(PeerEvent::RemoteTrack(remote));
        Box::pin(async {})
    }));
}

/// Peer Connection auf Basis von `webrtc`
struct WebRtcPeer {
    pc: Arc<RTCPeerConnection>,
    /// Zuletzt erzeugtes Offer/Answer; nur dieses darf lokal gesetzt werden
    last_created: Mutex<Option<RTCSessionDescription>>,
    tracks: Mutex<Vec<Arc<TrackLocalStaticRTP>>>,
}

impl WebRtcPeer {
    fn remember(&self, description: RTCSessionDescription, role: SdpRole) -> SessionDescription {
        let parsed = SessionDescription::parse(&description.sdp, role);
        *self.last_created.lock() = Some(description);
        parsed
    }
}

#[async_trait]
impl PeerConnection for WebRtcPeer {
    async fn add_local_audio(&self, audio: &LocalAudio) -> Result<(), PeerError> {
        let track = Arc::new(TrackLocalStaticRTP::new(
            RTCRtpCodecCapability {
                mime_type: "audio/opus".to_string(),
                clock_rate: SAMPLE_RATE,
                channels: audio.info().channels,
                ..Default::default()
            },
            audio.track_id().to_string(),
            audio.stream_id().to_string(),
        ));

        self.pc
            .add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| PeerError::WebRTC(e.to_string()))?;

        self.tracks.lock().push(track);
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, PeerError> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| PeerError::WebRTC(e.to_string()))?;
        Ok(self.remember(offer, SdpRole::Offer))
    }

    async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| PeerError::WebRTC(e.to_string()))?;
        Ok(self.remember(answer, SdpRole::Answer))
    }

    async fn set_local_description(&self, description: &SessionDescription) -> Result<(), PeerError> {
        let created = self
            .last_created
            .lock()
            .clone()
            .ok_or(PeerError::ForeignLocalDescription)?;

        if SessionDescription::parse(&created.sdp, description.role()) != *description {
            return Err(PeerError::ForeignLocalDescription);
        }

        self.pc
            .set_local_description(created)
            .await
            .map_err(|e| PeerError::Rejected(e.to_string()))
    }

    async fn set_remote_description(&self, description: &SessionDescription) -> Result<(), PeerError> {
        let sdp = description.to_sdp();
        let remote = match description.role() {
            SdpRole::Offer => RTCSessionDescription::offer(sdp),
            SdpRole::Answer => RTCSessionDescription::answer(sdp),
        }
        .map_err(|e| PeerError::Rejected(e.to_string()))?;

        self.pc
            .set_remote_description(remote)
            .await
            .map_err(|e| PeerError::Rejected(e.to_string()))
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), PeerError> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate.clone(),
                sdp_mid: candidate.sdp_mid.clone(),
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: None,
            })
            .await
            .map_err(|e| PeerError::Rejected(e.to_string()))
    }

    async fn close(&self) -> Result<(), PeerError> {
        self.tracks.lock().clear();
        self.pc
            .close()
            .await
            .map_err(|e| PeerError::WebRTC(e.to_string()))
    }
}
