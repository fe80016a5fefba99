//! Negotiation Engine
//!
//! Eine [`NegotiationSession`] pro Anrufversuch. Sie besitzt die Peer
//! Connection exklusiv und führt den Offer/Answer-Ablauf:
//!
//! ```text
//! Idle -> GatheringMedia -> CreatingOffer|CreatingAnswer -> GatheringIce
//!      -> Ready -> Negotiating -> Connected
//! ```
//!
//! `Failed` und `Closed` sind aus jedem Zustand erreichbar. ICE Candidates
//! werden bis zum Ende des Gatherings gepuffert und dann ins lokale SDP
//! eingebettet (kein Trickle ICE).

use super::audio::{LocalAudio, MediaError, MediaSource};
use super::peer::{
    IceGatheringState, PeerConnection, PeerConnectionState, PeerError, PeerEvent, PeerEventSink,
    PeerFactory, RemoteStream,
};
use super::sdp::{IceCandidate, SdpLine, SdpRole, SessionDescription};
use std::sync::Arc;
use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq)]
pub enum NegotiationError {
    #[error("Media error: {0}")]
    Media(#[from] MediaError),

    #[error("Peer connection error: {0}")]
    Peer(#[from] PeerError),

    #[error("No local media stream")]
    NoLocalMedia,

    #[error("No peer connection")]
    NoPeerConnection,

    #[error("Cannot {operation} in state {state:?}")]
    InvalidState {
        operation: &'static str,
        state: NegotiationState,
    },
}

// ============================================================================
// STATE
// ============================================================================

/// Zustand einer Negotiation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    Idle,
    GatheringMedia,
    CreatingOffer,
    CreatingAnswer,
    GatheringIce,
    Ready,
    Negotiating,
    Connected,
    Failed,
    Closed,
}

impl NegotiationState {
    pub fn is_terminal(self) -> bool {
        matches!(self, NegotiationState::Failed | NegotiationState::Closed)
    }
}

/// Ob wir das Offer erzeugen oder beantworten
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationRole {
    Offerer,
    Answerer,
}

/// Meilensteine, auf die der Orchestrator reagiert
#[derive(Debug, Clone, PartialEq)]
pub enum NegotiationMilestone {
    /// ICE Gathering fertig, lokales SDP inkl. Candidates bereit zum Senden
    LocalDescriptionReady(SessionDescription),
    RemoteStream(RemoteStream),
    Connected,
    Failed(String),
    Closed,
}

// ============================================================================
// NEGOTIATION SESSION
// ============================================================================

/// Negotiation für einen Anrufversuch
pub struct NegotiationSession {
    attempt: u64,
    factory: Arc<dyn PeerFactory>,
    sink: PeerEventSink,
    state: NegotiationState,
    role: Option<NegotiationRole>,
    local_audio: Option<LocalAudio>,
    peer: Option<Arc<dyn PeerConnection>>,
    pending_candidates: Vec<IceCandidate>,
    local_description: Option<SessionDescription>,
    outgoing_description: Option<SessionDescription>,
    remote_description: Option<SessionDescription>,
    remote_stream: Option<RemoteStream>,
}

impl NegotiationSession {
    /// `sink` bekommt alle Events der später erzeugten Peer Connection
    pub fn new(attempt: u64, factory: Arc<dyn PeerFactory>, sink: PeerEventSink) -> Self {
        Self {
            attempt,
            factory,
            sink,
            state: NegotiationState::Idle,
            role: None,
            local_audio: None,
            peer: None,
            pending_candidates: Vec::new(),
            local_description: None,
            outgoing_description: None,
            remote_description: None,
            remote_stream: None,
        }
    }

    pub fn attempt(&self) -> u64 {
        self.attempt
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    pub fn role(&self) -> Option<NegotiationRole> {
        self.role
    }

    pub fn local_audio(&self) -> Option<&LocalAudio> {
        self.local_audio.as_ref()
    }

    /// Lokale Description wie sie auf der Peer Connection gesetzt wurde
    pub fn local_description(&self) -> Option<&SessionDescription> {
        self.local_description.as_ref()
    }

    /// Lokale Description inkl. eingebetteter Candidates (ab `Ready`)
    pub fn outgoing_description(&self) -> Option<&SessionDescription> {
        self.outgoing_description.as_ref()
    }

    /// Zuletzt angewendete Remote Description inkl. Candidates
    pub fn remote_description(&self) -> Option<&SessionDescription> {
        self.remote_description.as_ref()
    }

    pub fn remote_stream(&self) -> Option<&RemoteStream> {
        self.remote_stream.as_ref()
    }

    pub fn has_peer(&self) -> bool {
        self.peer.is_some()
    }

    /// Holt einen lokalen Audio-Stream von der Media-Quelle
    pub async fn acquire_media(&mut self, source: &dyn MediaSource) -> Result<LocalAudio, NegotiationError> {
        self.expect_state("acquire media", &[NegotiationState::Idle])?;
        self.state = NegotiationState::GatheringMedia;

        match source.acquire_local_audio().await {
            Ok(audio) => {
                tracing::info!("Local audio acquired: {:?}", audio.info());
                self.local_audio = Some(audio.clone());
                Ok(audio)
            }
            Err(e) => Err(self.fail(e.into())),
        }
    }

    /// Übernimmt einen bereits geholten Stream
    pub fn with_media(&mut self, audio: LocalAudio) -> Result<(), NegotiationError> {
        self.expect_state("attach media", &[NegotiationState::Idle])?;
        self.state = NegotiationState::GatheringMedia;
        self.local_audio = Some(audio);
        Ok(())
    }

    /// Startet die Negotiation als Anrufer: Peer Connection, Offer, ICE Gathering
    pub async fn begin_as_offerer(&mut self) -> Result<(), NegotiationError> {
        self.expect_state("begin as offerer", &[NegotiationState::GatheringMedia])?;
        self.create_peer(NegotiationRole::Offerer).await?;

        self.state = NegotiationState::CreatingOffer;
        let peer = self.peer()?;
        let offer = match peer.create_offer().await {
            Ok(offer) => offer,
            Err(e) => return Err(self.fail(e.into())),
        };
        if let Err(e) = peer.set_local_description(&offer).await {
            return Err(self.fail(e.into()));
        }

        tracing::debug!("Local offer applied ({} lines)", offer.lines().len());
        self.local_description = Some(offer);
        self.state = NegotiationState::GatheringIce;
        Ok(())
    }

    /// Startet die Negotiation als Angerufener mit dem Remote-Offer
    pub async fn begin_as_answerer(&mut self, offer_sdp: &str) -> Result<(), NegotiationError> {
        self.expect_state("begin as answerer", &[NegotiationState::GatheringMedia])?;
        self.create_peer(NegotiationRole::Answerer).await?;
        self.apply_remote_description(offer_sdp, SdpRole::Offer).await
    }

    /// Wendet eine Remote Description an.
    ///
    /// Candidates werden aus dem SDP gelöst und einzeln hinzugefügt. Bei einem
    /// Offer wird anschließend automatisch das Answer erzeugt und lokal gesetzt.
    pub async fn apply_remote_description(&mut self, sdp: &str, role: SdpRole) -> Result<(), NegotiationError> {
        let Some(peer) = self.peer.clone() else {
            return Err(self.fail(NegotiationError::NoPeerConnection));
        };

        let allowed: &[NegotiationState] = match role {
            SdpRole::Offer => &[NegotiationState::GatheringMedia],
            SdpRole::Answer => &[NegotiationState::Ready, NegotiationState::Negotiating],
        };
        let expected_role = match role {
            SdpRole::Offer => NegotiationRole::Answerer,
            SdpRole::Answer => NegotiationRole::Offerer,
        };
        if !allowed.contains(&self.state) || self.role != Some(expected_role) {
            let state = self.state;
            return Err(self.fail(NegotiationError::InvalidState {
                operation: "apply remote description",
                state,
            }));
        }

        let parsed = SessionDescription::parse(sdp, role);
        let (description, candidates) = parsed.split_candidates();

        if let Err(e) = peer.set_remote_description(&description).await {
            return Err(self.fail(e.into()));
        }

        let mut rejected = 0;
        for candidate in &candidates {
            if let Err(e) = peer.add_ice_candidate(candidate).await {
                rejected += 1;
                tracing::warn!("Remote ICE candidate rejected ({}): {}", candidate.candidate, e);
            }
        }
        tracing::info!(
            "Remote {} applied with {} candidate(s), {} rejected",
            role,
            candidates.len(),
            rejected
        );
        self.remote_description = Some(description.with_candidates(&candidates));

        match role {
            SdpRole::Offer => {
                self.state = NegotiationState::CreatingAnswer;
                let answer = match peer.create_answer().await {
                    Ok(answer) => answer,
                    Err(e) => return Err(self.fail(e.into())),
                };
                if let Err(e) = peer.set_local_description(&answer).await {
                    return Err(self.fail(e.into()));
                }
                self.local_description = Some(answer);
                self.state = NegotiationState::GatheringIce;
            }
            SdpRole::Answer => {
                self.state = NegotiationState::Negotiating;
            }
        }
        Ok(())
    }

    /// Das lokale SDP wurde an den Server übergeben
    pub fn mark_sent(&mut self) -> Result<(), NegotiationError> {
        self.expect_state("hand off local description", &[NegotiationState::Ready])?;
        self.state = NegotiationState::Negotiating;
        Ok(())
    }

    /// Verarbeitet ein Event der eigenen Peer Connection
    pub fn handle_peer_event(&mut self, event: PeerEvent) -> Option<NegotiationMilestone> {
        if self.state.is_terminal() {
            tracing::debug!("Ignoring peer event in state {:?}: {:?}", self.state, event);
            return None;
        }

        match event {
            PeerEvent::IceCandidate(candidate) => {
                if self.state != NegotiationState::GatheringIce {
                    tracing::debug!("Late ICE candidate dropped in state {:?}", self.state);
                } else if self.is_buffered(&candidate) {
                    tracing::debug!("Duplicate local ICE candidate: {}", candidate.candidate);
                } else {
                    tracing::debug!("Buffered local ICE candidate: {}", candidate.candidate);
                    self.pending_candidates.push(candidate);
                }
                None
            }

            PeerEvent::IceGatheringStateChanged(IceGatheringState::Complete) => {
                if self.state != NegotiationState::GatheringIce {
                    return None;
                }
                let local = self.local_description.as_ref()?;
                let merged = local.with_candidates(&self.pending_candidates);
                tracing::info!(
                    "ICE gathering complete, {} candidate(s) embedded",
                    merged.candidate_count()
                );
                self.outgoing_description = Some(merged.clone());
                self.state = NegotiationState::Ready;
                Some(NegotiationMilestone::LocalDescriptionReady(merged))
            }

            PeerEvent::IceGatheringStateChanged(_) => None,

            PeerEvent::RemoteTrack(stream) => {
                self.remote_stream = Some(stream.clone());
                Some(NegotiationMilestone::RemoteStream(stream))
            }

            PeerEvent::ConnectionStateChanged(PeerConnectionState::Connected) => {
                self.state = NegotiationState::Connected;
                Some(NegotiationMilestone::Connected)
            }

            PeerEvent::ConnectionStateChanged(PeerConnectionState::Failed) => {
                self.state = NegotiationState::Failed;
                Some(NegotiationMilestone::Failed("peer connection failed".to_string()))
            }

            PeerEvent::ConnectionStateChanged(PeerConnectionState::Closed) => {
                self.state = NegotiationState::Closed;
                Some(NegotiationMilestone::Closed)
            }

            PeerEvent::ConnectionStateChanged(_) => None,
        }
    }

    /// Schließt die Peer Connection
    pub async fn close(&mut self) {
        if let Some(peer) = self.peer.take() {
            if let Err(e) = peer.close().await {
                tracing::warn!("Failed to close peer connection: {}", e);
            }
        }
        self.state = NegotiationState::Closed;
    }

    // ========================================================================
    // PRIVATE METHODS
    // ========================================================================

    async fn create_peer(&mut self, role: NegotiationRole) -> Result<(), NegotiationError> {
        let Some(audio) = self.local_audio.clone() else {
            return Err(self.fail(NegotiationError::NoLocalMedia));
        };

        let peer = match self.factory.create(Arc::clone(&self.sink)).await {
            Ok(peer) => peer,
            Err(e) => return Err(self.fail(e.into())),
        };
        // Ab hier gehört die Peer Connection der Session, auch im Fehlerfall
        self.peer = Some(Arc::clone(&peer));
        self.role = Some(role);

        if let Err(e) = peer.add_local_audio(&audio).await {
            return Err(self.fail(e.into()));
        }
        Ok(())
    }

    fn peer(&self) -> Result<Arc<dyn PeerConnection>, NegotiationError> {
        self.peer.clone().ok_or(NegotiationError::NoPeerConnection)
    }

    /// Candidate steht schon im Puffer oder im lokalen SDP
    fn is_buffered(&self, candidate: &IceCandidate) -> bool {
        let line = SdpLine::Candidate(candidate.candidate.clone());
        self.pending_candidates.iter().any(|c| c.candidate == candidate.candidate)
            || self
                .local_description
                .as_ref()
                .is_some_and(|local| local.lines().contains(&line))
    }

    fn expect_state(&mut self, operation: &'static str, allowed: &[NegotiationState]) -> Result<(), NegotiationError> {
        if allowed.contains(&self.state) {
            return Ok(());
        }
        let state = self.state;
        Err(self.fail(NegotiationError::InvalidState { operation, state }))
    }

    fn fail(&mut self, error: NegotiationError) -> NegotiationError {
        tracing::error!("Negotiation failed (attempt {}): {}", self.attempt, error);
        self.state = NegotiationState::Failed;
        error
    }
}

impl std::fmt::Debug for NegotiationSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NegotiationSession")
            .field("attempt", &self.attempt)
            .field("state", &self.state)
            .field("role", &self.role)
            .field("pending_candidates", &self.pending_candidates.len())
            .finish()
    }
}
