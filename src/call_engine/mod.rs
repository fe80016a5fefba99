//! Call Engine Module - WebRTC und Audio
//!
//! Dieses Modul verwaltet:
//! - Mikrofon-Zugriff (lokaler Audio-Stream)
//! - SDP Zeilenmodell mit eingebetteten ICE Candidates
//! - WebRTC Peer Connections hinter einem Trait
//! - Die Offer/Answer Negotiation pro Anrufversuch

mod audio;
mod engine;
mod peer;
pub mod sdp;

pub use audio::{LocalAudio, MediaError, MediaSource, Microphone, StreamInfo, CHANNELS, SAMPLE_RATE};
pub use engine::{
    NegotiationError, NegotiationMilestone, NegotiationRole, NegotiationSession, NegotiationState,
};
pub use peer::{
    IceGatheringState, PeerConnection, PeerConnectionState, PeerError, PeerEvent, PeerEventSink,
    PeerFactory, RemoteStream, WebRtcPeerFactory,
};
pub use sdp::{IceCandidate, SdpRole, SessionDescription};

#[cfg(test)]
pub(crate) use engine::testing;
