//! Call-Session Orchestrator
//!
//! Eine einzige Task mit einer einzigen Event-Queue. Benutzer-Kommandos,
//! Server-Notifications, Peer Events, RPC-Antworten und das Verbindungsende
//! landen als [`CallEvent`] in der Queue und werden der Reihe nach
//! abgearbeitet. Negotiation und Call Session gehören exklusiv dieser Task.

use super::call::{CallDirection, CallSession, CallState};
use crate::call_engine::{
    LocalAudio, MediaSource, NegotiationError, NegotiationMilestone, NegotiationRole,
    NegotiationSession, NegotiationState, PeerEvent, PeerEventSink, PeerFactory, RemoteStream,
    SdpRole, StreamInfo,
};
use crate::signaling::messages::{
    methods, notifications, CallAnswerParams, CallMakeParams, CallTonePlayParams, SdpParams,
};
use crate::signaling::{CallResult, LinkClosed, RpcClient, RpcError, ServerNotification, SessionId};
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};

/// Standard-Ton für `callTonePlay`
pub const DEFAULT_TONE_ID: &str = "425";

// ============================================================================
// EVENTS
// ============================================================================

/// RPC-Schritte, deren Antworten zurück in die Queue laufen
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcStep {
    Prepare,
    RtcCallMake,
    CallMake,
    RtcCallAnswer,
    CallAnswer,
    TonePlay,
}

impl RpcStep {
    pub fn method(self) -> &'static str {
        match self {
            RpcStep::Prepare => methods::RTC_PREPARE,
            RpcStep::RtcCallMake => methods::RTC_CALL_MAKE,
            RpcStep::CallMake => methods::CALL_MAKE,
            RpcStep::RtcCallAnswer => methods::RTC_CALL_ANSWER,
            RpcStep::CallAnswer => methods::CALL_ANSWER,
            RpcStep::TonePlay => methods::CALL_TONE_PLAY,
        }
    }

    /// Schritte, deren Fehlschlag den laufenden Anruf beendet
    fn establishes_call(self) -> bool {
        matches!(
            self,
            RpcStep::RtcCallMake | RpcStep::CallMake | RpcStep::RtcCallAnswer | RpcStep::CallAnswer
        )
    }
}

impl fmt::Display for RpcStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.method())
    }
}

/// Alles, worauf der Orchestrator reagiert
#[derive(Debug)]
pub enum CallEvent {
    /// Verbindung steht bzw. nächster Pre-Warm nach einem Anruf
    Start,
    /// Ausgehender Anruf an eine Adresse
    PlaceCall(String),
    Hangup,
    SetMuted(bool),
    Notification(ServerNotification),
    /// Event einer Peer Connection, markiert mit ihrem Anrufversuch
    Peer { attempt: u64, event: PeerEvent },
    /// Antwort auf einen Request, markiert mit dem Anruf, für den er lief
    RpcReply {
        call: u64,
        step: RpcStep,
        result: Result<Value, RpcError>,
    },
    TransportClosed(LinkClosed),
}

/// Events für den Host (Anzeige, CLI)
#[derive(Debug, Clone, PartialEq)]
pub enum PhoneEvent {
    Status(String),
    ReadyToCall(bool),
    LocalStream(StreamInfo),
    RemoteStream(RemoteStream),
    CallStateChanged {
        session_id: Option<SessionId>,
        state: CallState,
    },
    Error(String),
}

// ============================================================================
// ORCHESTRATOR
// ============================================================================

/// Steuert Negotiation und Call-Control-RPCs
pub struct CallOrchestrator {
    rpc: RpcClient,
    peers: Arc<dyn PeerFactory>,
    media: Arc<dyn MediaSource>,
    tone_id: Option<String>,
    events: broadcast::Sender<PhoneEvent>,
    queue_tx: mpsc::UnboundedSender<CallEvent>,
    queue_rx: mpsc::UnboundedReceiver<CallEvent>,

    attempt: u64,
    negotiation: Option<NegotiationSession>,
    local_audio: Option<LocalAudio>,
    call: Option<CallSession>,
    /// Zählt die Anrufe dieser Verbindung, der aktuelle hat die höchste Nummer
    call_serial: u64,
    /// `rtcPrepare` wurde auf dieser Verbindung bereits gesendet
    prepared: bool,
    pending_dial: Option<String>,
    pending_offer: Option<(String, Option<SessionId>)>,
    stopped: bool,
}

impl CallOrchestrator {
    /// Erstellt den Orchestrator und registriert die Notification-Handler am RPC-Client
    pub fn new(
        rpc: RpcClient,
        peers: Arc<dyn PeerFactory>,
        media: Arc<dyn MediaSource>,
        tone_id: Option<String>,
        events: broadcast::Sender<PhoneEvent>,
    ) -> Self {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();

        for method in notifications::ALL {
            let tx = queue_tx.clone();
            rpc.on(method, move |params| match ServerNotification::from_parts(method, params) {
                Ok(notification) => {
                    let _ = tx.send(CallEvent::Notification(notification));
                }
                Err(e) => tracing::warn!("Malformed {} notification: {}", method, e),
            });
        }

        Self {
            rpc,
            peers,
            media,
            tone_id,
            events,
            queue_tx,
            queue_rx,
            attempt: 0,
            negotiation: None,
            local_audio: None,
            call: None,
            call_serial: 0,
            prepared: false,
            pending_dial: None,
            pending_offer: None,
            stopped: false,
        }
    }

    /// Sender für Events in die Queue
    pub fn sender(&self) -> mpsc::UnboundedSender<CallEvent> {
        self.queue_tx.clone()
    }

    pub fn call(&self) -> Option<&CallSession> {
        self.call.as_ref()
    }

    pub fn negotiation(&self) -> Option<&NegotiationSession> {
        self.negotiation.as_ref()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// Arbeitet die Queue ab, bis die Verbindung endet
    pub async fn run(mut self) {
        tracing::info!("Call orchestrator started");
        while let Some(event) = self.queue_rx.recv().await {
            self.handle_event(event).await;
            if self.stopped {
                break;
            }
        }
        tracing::info!("Call orchestrator stopped");
    }

    /// Verarbeitet alle Events, die bereits in der Queue liegen
    pub async fn process_pending(&mut self) {
        while let Ok(event) = self.queue_rx.try_recv() {
            self.handle_event(event).await;
        }
    }

    pub async fn handle_event(&mut self, event: CallEvent) {
        if self.stopped {
            tracing::debug!("Orchestrator stopped, dropping {:?}", event);
            return;
        }

        match event {
            CallEvent::Start => self.prewarm().await,
            CallEvent::PlaceCall(address) => self.place_call(address),
            CallEvent::Hangup => self.hangup().await,
            CallEvent::SetMuted(muted) => self.set_muted(muted),
            CallEvent::Notification(notification) => self.on_notification(notification).await,
            CallEvent::Peer { attempt, event } => self.on_peer_event(attempt, event).await,
            CallEvent::RpcReply { call, step, result } => self.on_rpc_reply(call, step, result).await,
            CallEvent::TransportClosed(closed) => self.on_transport_closed(closed).await,
        }
    }

    // ========================================================================
    // NEGOTIATION LIFECYCLE
    // ========================================================================

    fn next_session(&mut self) -> NegotiationSession {
        self.attempt += 1;
        let attempt = self.attempt;
        let tx = self.queue_tx.clone();
        let sink: PeerEventSink = Arc::new(move |event| {
            let _ = tx.send(CallEvent::Peer { attempt, event });
        });
        NegotiationSession::new(attempt, Arc::clone(&self.peers), sink)
    }

    /// Holt (einmal) das Mikrofon und startet eine Offerer-Negotiation,
    /// damit das lokale SDP schon bereit ist, wenn der Benutzer anruft.
    async fn prewarm(&mut self) {
        if self.negotiation.as_ref().is_some_and(|n| !n.state().is_terminal()) {
            tracing::debug!("Negotiation already running, no pre-warm");
            return;
        }
        let mut session = self.next_session();

        match self.local_audio.clone() {
            Some(audio) => {
                if let Err(e) = session.with_media(audio) {
                    self.report_error(&e);
                    return;
                }
            }
            None => {
                self.status("Requesting microphone access...");
                match session.acquire_media(self.media.as_ref()).await {
                    Ok(audio) => {
                        self.emit(PhoneEvent::LocalStream(audio.info().clone()));
                        self.local_audio = Some(audio);
                    }
                    Err(e) => {
                        self.report_error(&e);
                        self.emit(PhoneEvent::ReadyToCall(false));
                        return;
                    }
                }
            }
        }

        // Ein Offer, das vor dem Mikrofon ankam, ersetzt gleich den Pre-Warm
        if let Some((sdp, call_session)) = self.pending_offer.take() {
            let _ = self.queue_tx.send(CallEvent::Notification(ServerNotification::RtcCallIncoming {
                sdp,
                call_session,
            }));
        }

        self.status("Getting ice candidates...");
        let result = session.begin_as_offerer().await;
        self.negotiation = Some(session);
        if let Err(e) = result {
            self.report_error(&e);
        }
    }

    async fn close_negotiation(&mut self) {
        if let Some(mut session) = self.negotiation.take() {
            tracing::debug!("Closing negotiation attempt {}", session.attempt());
            session.close().await;
        }
    }

    /// Beendet den Anruf; der nächste Pre-Warm läuft über die Queue
    async fn abort_call(&mut self, error: String) {
        self.report_error(&error);
        self.end_call().await;
        let _ = self.queue_tx.send(CallEvent::Start);
    }

    async fn end_call(&mut self) {
        self.close_negotiation().await;
        self.pending_dial = None;
        self.emit(PhoneEvent::ReadyToCall(false));
        if let Some(mut call) = self.call.take() {
            call.set_state(CallState::Ended);
            tracing::info!("Call ended after {}s", call.duration().num_seconds());
            self.emit_call_state(&call);
        }
    }

    // ========================================================================
    // USER COMMANDS
    // ========================================================================

    fn place_call(&mut self, address: String) {
        if self.call.is_some() {
            self.status("Call already in progress");
            return;
        }

        let ready = self.negotiation.as_ref().is_some_and(|n| {
            n.state() == NegotiationState::Ready && n.role() == Some(NegotiationRole::Offerer)
        });
        if !ready {
            tracing::info!("Local description not ready, dialing {} later", address);
            self.pending_dial = Some(address);
            return;
        }

        let Some(negotiation) = self.negotiation.as_mut() else {
            return;
        };
        let Some(sdp) = negotiation.outgoing_description().map(|d| d.to_sdp()) else {
            return;
        };

        let mut call = CallSession::outgoing(address.clone());
        if !call.mark_offer_sent() {
            return;
        }
        if let Err(e) = negotiation.mark_sent() {
            self.report_error(&e);
            return;
        }

        tracing::info!("Calling {}", address);
        self.emit_call_state(&call);
        self.call_serial += 1;
        self.call = Some(call);
        self.send(RpcStep::RtcCallMake, Some(SdpParams { sdp }));
        self.send(RpcStep::CallMake, Some(CallMakeParams { rtc_address: address }));
    }

    async fn hangup(&mut self) {
        if self.call.is_none() {
            self.status("No active call");
            return;
        }
        tracing::info!("Hanging up");
        self.end_call().await;
        self.status("Call ended");
        self.prewarm().await;
    }

    fn set_muted(&mut self, muted: bool) {
        match &self.local_audio {
            Some(audio) => {
                audio.set_muted(muted);
                self.status(if muted { "Microphone muted" } else { "Microphone unmuted" });
            }
            None => tracing::warn!("No local audio to mute"),
        }
    }

    // ========================================================================
    // SERVER NOTIFICATIONS
    // ========================================================================

    async fn on_notification(&mut self, notification: ServerNotification) {
        tracing::info!("Notification: {}", notification.method());

        match notification {
            ServerNotification::CallIncoming { call_session } => {
                if self.local_audio.is_none() {
                    self.report_error(&format!("Cannot answer call {}: no local audio", call_session));
                    return;
                }
                let Some(call) = self.incoming_call(Some(call_session.clone())) else {
                    return;
                };
                if !call.mark_answer_sent() {
                    tracing::debug!("Already answering call session {}", call_session);
                    return;
                }
                self.send(RpcStep::CallAnswer, Some(CallAnswerParams { call_session }));
            }

            ServerNotification::RtcCallIncoming { sdp, call_session } => {
                if self.local_audio.is_none() {
                    tracing::info!("Remote offer arrived before local audio, queued");
                    self.pending_offer = Some((sdp, call_session));
                    return;
                }
                if self.incoming_call(call_session).is_none() {
                    return;
                }
                self.close_negotiation().await;
                self.emit(PhoneEvent::ReadyToCall(false));
                self.accept_remote_offer(&sdp).await;
            }

            ServerNotification::RtcCallAnswer { sdp, call_session } => {
                self.accept_remote_answer(sdp, call_session).await;
            }

            ServerNotification::CallAnswer { call_session } => {
                let Some(call) = self.call.as_mut() else {
                    tracing::warn!("onCallAnswer without active call");
                    return;
                };
                if let Some(id) = call_session {
                    call.adopt_session_id(id);
                }
                self.play_tone();
            }
        }
    }

    /// Sucht oder erstellt den eingehenden Anruf zu einer Session-ID
    fn incoming_call(&mut self, session_id: Option<SessionId>) -> Option<&mut CallSession> {
        let busy = self.call.as_ref().filter(|call| {
            call.direction() != CallDirection::Incoming || !call.matches(session_id.as_ref())
        });
        if let Some(call) = busy {
            tracing::warn!(
                "Ignoring incoming call {:?}, busy with {:?}",
                session_id,
                call.session_id()
            );
            return None;
        }

        if self.call.is_none() {
            let call = CallSession::incoming(session_id.clone());
            tracing::info!("Incoming call {:?}", call.session_id());
            self.emit_call_state(&call);
            self.call_serial += 1;
            self.call = Some(call);
        }

        let call = self.call.as_mut()?;
        if let Some(id) = session_id {
            call.adopt_session_id(id);
        }
        Some(call)
    }

    /// Ersetzt die Negotiation durch einen Answerer für das Remote-Offer
    async fn accept_remote_offer(&mut self, sdp: &str) {
        let Some(audio) = self.local_audio.clone() else {
            return;
        };

        let mut session = self.next_session();
        let result = match session.with_media(audio) {
            Ok(()) => session.begin_as_answerer(sdp).await,
            Err(e) => Err(e),
        };
        self.negotiation = Some(session);

        match result {
            Ok(()) => self.status("Answering incoming call..."),
            Err(e) => self.abort_call(e.to_string()).await,
        }
    }

    async fn accept_remote_answer(&mut self, sdp: String, session_id: Option<SessionId>) {
        let matching = self.call.as_ref().is_some_and(|c| {
            c.direction() == CallDirection::Outgoing && c.matches(session_id.as_ref())
        }) && self
            .negotiation
            .as_ref()
            .is_some_and(|n| n.role() == Some(NegotiationRole::Offerer));

        if !matching {
            // Die Pre-Warm-Negotiation bleibt unangetastet
            let state = self
                .negotiation
                .as_ref()
                .map(|n| n.state())
                .unwrap_or(NegotiationState::Idle);
            self.report_error(&NegotiationError::InvalidState {
                operation: "apply remote answer without outgoing call",
                state,
            });
            return;
        }

        if let (Some(call), Some(id)) = (self.call.as_mut(), session_id) {
            call.adopt_session_id(id);
        }

        let Some(session) = self.negotiation.as_mut() else {
            return;
        };
        if let Err(e) = session.apply_remote_description(&sdp, SdpRole::Answer).await {
            self.abort_call(e.to_string()).await;
            return;
        }
        self.play_tone();
    }

    fn play_tone(&mut self) {
        let Some(tone_id) = self.tone_id.clone() else {
            return;
        };
        let Some(call) = self.call.as_mut() else {
            return;
        };
        let Some(call_session) = call.session_id().cloned() else {
            tracing::warn!("No call session id yet, tone not played");
            return;
        };
        if !call.mark_tone_played() {
            return;
        }
        self.send(RpcStep::TonePlay, Some(CallTonePlayParams { call_session, tone_id }));
    }

    // ========================================================================
    // PEER EVENTS
    // ========================================================================

    async fn on_peer_event(&mut self, attempt: u64, event: PeerEvent) {
        let Some(session) = self.negotiation.as_mut() else {
            return;
        };
        if session.attempt() != attempt {
            tracing::debug!("Ignoring event of stale attempt {}: {:?}", attempt, event);
            return;
        }

        let role = session.role();
        let Some(milestone) = session.handle_peer_event(event) else {
            return;
        };

        match milestone {
            NegotiationMilestone::LocalDescriptionReady(description) => match role {
                Some(NegotiationRole::Offerer) => {
                    self.prepare();
                    self.status("Connection established");
                    self.emit(PhoneEvent::ReadyToCall(true));
                    if let Some(address) = self.pending_dial.take() {
                        self.place_call(address);
                    }
                }
                Some(NegotiationRole::Answerer) => {
                    self.prepare();
                    let sdp = description.to_sdp();
                    if let Some(session) = self.negotiation.as_mut() {
                        if let Err(e) = session.mark_sent() {
                            self.abort_call(e.to_string()).await;
                            return;
                        }
                    }
                    self.send(RpcStep::RtcCallAnswer, Some(SdpParams { sdp }));
                    self.update_call_state(CallState::Negotiating);
                }
                None => {}
            },

            NegotiationMilestone::RemoteStream(stream) => {
                self.emit(PhoneEvent::RemoteStream(stream));
            }

            NegotiationMilestone::Connected => {
                self.update_call_state(CallState::Connected);
                self.status("Call connected");
            }

            NegotiationMilestone::Failed(reason) => {
                if self.call.is_some() {
                    self.abort_call(reason).await;
                } else {
                    self.report_error(&reason);
                }
            }

            NegotiationMilestone::Closed => {
                tracing::debug!("Peer connection of attempt {} closed", attempt);
            }
        }
    }

    // ========================================================================
    // RPC REPLIES & TRANSPORT
    // ========================================================================

    /// Erstes Gathering-Ende auf dieser Verbindung, egal in welcher Rolle
    fn prepare(&mut self) {
        if !self.prepared {
            self.prepared = true;
            self.send::<()>(RpcStep::Prepare, None);
        }
    }

    async fn on_rpc_reply(&mut self, call: u64, step: RpcStep, result: Result<Value, RpcError>) {
        let current_call = self.call.is_some() && call == self.call_serial;
        match result {
            Ok(value) => {
                let result = CallResult::from_value(&value);
                tracing::debug!("{} succeeded: {:?}", step, result);
                if let Some(message) = result.message {
                    self.status(message);
                }
                if step == RpcStep::CallMake && current_call {
                    if let (Some(call), Some(id)) = (self.call.as_mut(), result.call_session) {
                        if call.adopt_session_id(id) {
                            let call = call.clone();
                            self.emit_call_state(&call);
                        }
                    }
                }
            }
            Err(RpcError::TransportClosed) => {
                tracing::debug!("{} abandoned: transport closed", step);
            }
            Err(e) => {
                let error = format!("{}: {}", step, e);
                if step.establishes_call() && current_call {
                    self.abort_call(error).await;
                } else {
                    self.report_error(&error);
                }
            }
        }
    }

    async fn on_transport_closed(&mut self, closed: LinkClosed) {
        self.status(closed.describe());
        if let Some(error) = closed.as_error() {
            self.emit(PhoneEvent::Error(error.to_string()));
        }

        self.rpc.close();
        self.end_call().await;
        self.pending_offer = None;
        self.prepared = false;
        // Letzter Klon des Handles, beendet die Aufnahme
        self.local_audio = None;
        self.stopped = true;
    }

    // ========================================================================
    // HELPERS
    // ========================================================================

    /// Sendet einen Request sofort. Die Antwort reiht sich beim Lesen in
    /// die Queue ein, in derselben Reihenfolge wie Notifications.
    fn send<P: Serialize>(&self, step: RpcStep, params: Option<P>) {
        let tx = self.queue_tx.clone();
        let call = self.call_serial;
        let sent = self.rpc.request_with(step.method(), params, move |result| {
            let _ = tx.send(CallEvent::RpcReply { call, step, result });
        });
        if let Err(e) = sent {
            self.report_error(&format!("{}: {}", step, e));
        }
    }

    fn update_call_state(&mut self, state: CallState) {
        let Some(call) = self.call.as_mut() else {
            return;
        };
        if call.set_state(state) {
            let call = call.clone();
            self.emit_call_state(&call);
        }
    }

    fn emit_call_state(&self, call: &CallSession) {
        self.emit(PhoneEvent::CallStateChanged {
            session_id: call.session_id().cloned(),
            state: call.state(),
        });
    }

    fn report_error(&self, error: &dyn fmt::Display) {
        tracing::error!("{}", error);
        self.emit(PhoneEvent::Error(error.to_string()));
        self.status(format!("Connection error: {}", error));
    }

    fn status(&self, text: impl Into<String>) {
        let text = text.into();
        tracing::info!("Status: {}", text);
        self.emit(PhoneEvent::Status(text));
    }

    fn emit(&self, event: PhoneEvent) {
        // Ohne Empfänger geht das Event verloren
        let _ = self.events.send(event);
    }
}

impl fmt::Debug for CallOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallOrchestrator")
            .field("attempt", &self.attempt)
            .field("negotiation", &self.negotiation)
            .field("call", &self.call)
            .field("prepared", &self.prepared)
            .field("stopped", &self.stopped)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call_engine::testing::{candidate, FakeMedia, FakePeerFactory, FAKE_ANSWER, FAKE_OFFER};
    use crate::call_engine::{IceCandidate, IceGatheringState, PeerConnectionState};
    use serde_json::json;

    struct Harness {
        orch: CallOrchestrator,
        rpc: RpcClient,
        factory: Arc<FakePeerFactory>,
        frames: mpsc::UnboundedReceiver<String>,
        events: broadcast::Receiver<PhoneEvent>,
    }

    impl Harness {
        fn new(media: FakeMedia) -> Self {
            let rpc = RpcClient::new();
            let (tx, frames) = mpsc::unbounded_channel();
            rpc.attach(tx);

            let factory = Arc::new(FakePeerFactory::default());
            let (events_tx, events) = broadcast::channel(256);
            let orch = CallOrchestrator::new(
                rpc.clone(),
                Arc::clone(&factory) as Arc<dyn PeerFactory>,
                Arc::new(media),
                Some(DEFAULT_TONE_ID.to_string()),
                events_tx,
            );

            Self {
                orch,
                rpc,
                factory,
                frames,
                events,
            }
        }

        /// Alle seit dem letzten Aufruf gesendeten Frames
        fn sent(&mut self) -> Vec<Value> {
            let mut sent = Vec::new();
            while let Ok(frame) = self.frames.try_recv() {
                sent.push(serde_json::from_str(&frame).unwrap());
            }
            sent
        }

        fn phone_events(&mut self) -> Vec<PhoneEvent> {
            let mut events = Vec::new();
            while let Ok(event) = self.events.try_recv() {
                events.push(event);
            }
            events
        }

        async fn notify(&mut self, method: &str, params: Value) {
            let frame = json!({ "jsonrpc": "2.0", "method": method, "params": params });
            self.rpc.handle_frame(&frame.to_string());
            self.orch.process_pending().await;
        }

        async fn peer_event(&mut self, peer: usize, event: PeerEvent) {
            (self.factory.sink(peer))(event);
            self.orch.process_pending().await;
        }

        async fn gather(&mut self, peer: usize, candidates: &[IceCandidate]) {
            for c in candidates {
                self.peer_event(peer, PeerEvent::IceCandidate(c.clone())).await;
            }
            self.peer_event(peer, PeerEvent::IceGatheringStateChanged(IceGatheringState::Complete))
                .await;
        }

        fn reply(&self, id: &Value, result: Value) {
            self.rpc
                .handle_frame(&json!({ "jsonrpc": "2.0", "id": id, "result": result }).to_string());
        }

        /// Verbunden, Mikrofon geholt, Offer mit einem Candidate fertig
        async fn ready(media: FakeMedia) -> Self {
            let mut h = Self::new(media);
            h.orch.handle_event(CallEvent::Start).await;
            h.gather(0, &[candidate(1)]).await;
            h.sent();
            h.phone_events();
            h
        }
    }

    fn methods_of(frames: &[Value]) -> Vec<&str> {
        frames.iter().map(|f| f["method"].as_str().unwrap()).collect()
    }

    #[tokio::test]
    async fn test_outgoing_call_flow() {
        let mut h = Harness::new(FakeMedia::working());
        h.orch.handle_event(CallEvent::Start).await;

        assert!(h.sent().is_empty(), "nothing may be sent before ICE gathering completes");
        h.gather(0, &[candidate(1), candidate(2)]).await;

        let prepare = h.sent();
        assert_eq!(methods_of(&prepare), ["rtcPrepare"]);
        assert!(prepare[0].get("params").is_none());
        assert!(h.phone_events().contains(&PhoneEvent::ReadyToCall(true)));

        h.orch.handle_event(CallEvent::PlaceCall("1001".into())).await;
        h.orch.handle_event(CallEvent::PlaceCall("1001".into())).await;

        let frames = h.sent();
        assert_eq!(methods_of(&frames), ["rtcCallMake", "callMake"]);
        let sdp = frames[0]["params"]["sdp"].as_str().unwrap();
        assert_eq!(sdp.matches("a=candidate:").count(), 2);
        assert!(sdp.contains("a=end-of-candidates\r\n"));
        assert_eq!(frames[1]["params"], json!({ "rtc_address": "1001" }));

        h.reply(&frames[1]["id"], json!({ "message": "call created", "call_session": 77 }));
        h.orch.process_pending().await;
        assert_eq!(h.orch.call().unwrap().session_id().unwrap().as_str(), "77");
        assert!(h.phone_events().contains(&PhoneEvent::Status("call created".into())));

        let remote = format!("{}a=candidate:9 1 udp 1 10.0.0.9 4000 typ host\r\n", FAKE_ANSWER);
        h.notify("onRtcCallAnswer", json!({ "sdp": remote })).await;
        h.notify("onCallAnswer", json!({})).await;

        let frames = h.sent();
        assert_eq!(methods_of(&frames), ["callTonePlay"]);
        assert_eq!(frames[0]["params"], json!({ "call_session": "77", "tone_id": "425" }));
        assert!(h.factory.log(0).lock().calls.contains(&"set_remote_description:answer".to_string()));

        h.peer_event(0, PeerEvent::ConnectionStateChanged(PeerConnectionState::Connected))
            .await;
        assert_eq!(h.orch.call().unwrap().state(), CallState::Connected);
    }

    #[tokio::test]
    async fn test_dial_before_local_description_waits_for_prepare() {
        let mut h = Harness::new(FakeMedia::working());
        h.orch.handle_event(CallEvent::Start).await;
        h.orch.handle_event(CallEvent::PlaceCall("1001".into())).await;
        assert!(h.sent().is_empty());

        h.gather(0, &[candidate(1)]).await;
        assert_eq!(methods_of(&h.sent()), ["rtcPrepare", "rtcCallMake", "callMake"]);
    }

    #[tokio::test]
    async fn test_incoming_call_flow() {
        let mut h = Harness::ready(FakeMedia::working()).await;

        h.notify("onCallIncoming", json!({ "call_session": "abc" })).await;
        h.notify("onCallIncoming", json!({ "call_session": "abc" })).await;
        let frames = h.sent();
        assert_eq!(methods_of(&frames), ["callAnswer"]);
        assert_eq!(frames[0]["params"], json!({ "call_session": "abc" }));

        let offer = format!("{}a=candidate:5 1 udp 1 10.0.0.5 4000 typ host\r\n", FAKE_OFFER);
        h.notify("onRtcCallIncoming", json!({ "sdp": offer, "call_session": "abc" })).await;

        assert!(h.factory.log(0).lock().closed, "pre-warmed offerer is replaced");
        assert_eq!(h.factory.created(), 2);
        let calls = h.factory.log(1).lock().calls.clone();
        assert_eq!(
            calls[1..],
            ["set_remote_description:offer", "add_ice_candidate", "create_answer", "set_local_description"]
        );

        // Events des alten Versuchs zählen nicht mehr
        h.peer_event(0, PeerEvent::ConnectionStateChanged(PeerConnectionState::Connected))
            .await;
        assert_eq!(h.orch.call().unwrap().state(), CallState::Answering);

        h.gather(1, &[candidate(3)]).await;
        let frames = h.sent();
        assert_eq!(methods_of(&frames), ["rtcCallAnswer"]);
        let sdp = frames[0]["params"]["sdp"].as_str().unwrap();
        assert!(sdp.contains("a=candidate:3 "));
        assert!(sdp.ends_with("a=end-of-candidates\r\n"));
        assert_eq!(h.orch.call().unwrap().state(), CallState::Negotiating);

        h.notify("onCallAnswer", json!({})).await;
        h.notify("onCallAnswer", json!({})).await;
        let frames = h.sent();
        assert_eq!(methods_of(&frames), ["callTonePlay"]);
        assert_eq!(frames[0]["params"]["call_session"], "abc");
    }

    #[tokio::test]
    async fn test_numeric_session_id_is_normalised() {
        let mut h = Harness::ready(FakeMedia::working()).await;
        h.notify("onCallIncoming", json!({ "call_session": 12 })).await;
        h.notify("onCallIncoming", json!({ "call_session": "12" })).await;

        let frames = h.sent();
        assert_eq!(methods_of(&frames), ["callAnswer"]);
        assert_eq!(frames[0]["params"]["call_session"], "12");
    }

    #[tokio::test]
    async fn test_remote_answer_without_outgoing_call_is_recoverable() {
        let mut h = Harness::ready(FakeMedia::working()).await;

        h.notify("onRtcCallAnswer", json!({ "sdp": FAKE_ANSWER })).await;

        assert!(h.sent().is_empty());
        assert!(h.phone_events().iter().any(|e| matches!(e, PhoneEvent::Error(_))));
        let negotiation = h.orch.negotiation().unwrap();
        assert_eq!(negotiation.state(), NegotiationState::Ready);
        assert!(!h.orch.is_stopped());
    }

    #[tokio::test]
    async fn test_rejected_remote_answer_aborts_call_only() {
        let mut h = Harness::ready(FakeMedia::working()).await;
        h.orch.handle_event(CallEvent::PlaceCall("1001".into())).await;
        h.sent();

        h.notify("onRtcCallAnswer", json!({ "sdp": "v=0\r\ns=-\r\n" })).await;

        assert!(h.orch.call().is_none());
        assert!(h.sent().is_empty(), "no tone for a failed negotiation");
        assert!(h.factory.log(0).lock().closed);
        assert_eq!(h.factory.created(), 2, "a new offer is pre-warmed");
        assert!(h.rpc.is_open());
    }

    #[tokio::test]
    async fn test_remote_error_ends_call() {
        let mut h = Harness::ready(FakeMedia::working()).await;
        h.orch.handle_event(CallEvent::PlaceCall("9999".into())).await;
        let frames = h.sent();

        h.rpc.handle_frame(
            &json!({
                "jsonrpc": "2.0",
                "id": frames[1]["id"],
                "error": { "code": -32000, "message": "unknown address" }
            })
            .to_string(),
        );
        h.orch.process_pending().await;

        assert!(h.orch.call().is_none());
        let events = h.phone_events();
        assert!(events
            .iter()
            .any(|e| matches!(e, PhoneEvent::Status(s) if s.contains("unknown address"))));
        assert!(events.contains(&PhoneEvent::CallStateChanged {
            session_id: None,
            state: CallState::Ended
        }));
    }

    #[tokio::test]
    async fn test_reply_is_handled_before_following_notification() {
        let mut h = Harness::ready(FakeMedia::working()).await;
        h.orch.handle_event(CallEvent::PlaceCall("1001".into())).await;
        let frames = h.sent();

        // Antwort und Remote-Answer kommen direkt hintereinander an
        h.reply(&frames[1]["id"], json!({ "call_session": 77 }));
        h.notify("onRtcCallAnswer", json!({ "sdp": FAKE_ANSWER })).await;

        let frames = h.sent();
        assert_eq!(methods_of(&frames), ["callTonePlay"]);
        assert_eq!(frames[0]["params"]["call_session"], "77");
    }

    #[tokio::test]
    async fn test_call_answer_error_after_remote_offer_ends_call() {
        let mut h = Harness::ready(FakeMedia::working()).await;
        h.notify("onCallIncoming", json!({ "call_session": "abc" })).await;
        let answer = h.sent();
        assert_eq!(methods_of(&answer), ["callAnswer"]);

        h.notify("onRtcCallIncoming", json!({ "sdp": FAKE_OFFER, "call_session": "abc" })).await;
        assert_eq!(h.factory.created(), 2);

        h.rpc.handle_frame(
            &json!({
                "jsonrpc": "2.0",
                "id": answer[0]["id"],
                "error": { "code": -32000, "message": "call gone" }
            })
            .to_string(),
        );
        h.orch.process_pending().await;

        assert!(h.orch.call().is_none());
        assert!(h.factory.log(1).lock().closed);
        assert_eq!(h.factory.created(), 3, "a new offer is pre-warmed");
        assert!(h.phone_events().contains(&PhoneEvent::CallStateChanged {
            session_id: Some(SessionId::new("abc")),
            state: CallState::Ended
        }));
    }

    #[tokio::test]
    async fn test_reply_for_ended_call_does_not_touch_next_call() {
        let mut h = Harness::ready(FakeMedia::working()).await;
        h.orch.handle_event(CallEvent::PlaceCall("1001".into())).await;
        let first = h.sent();
        h.orch.handle_event(CallEvent::Hangup).await;
        h.gather(1, &[candidate(2)]).await;
        h.orch.handle_event(CallEvent::PlaceCall("1002".into())).await;
        h.sent();

        h.rpc.handle_frame(
            &json!({ "jsonrpc": "2.0", "id": first[1]["id"], "error": { "code": 1, "message": "late" } })
                .to_string(),
        );
        h.orch.process_pending().await;

        assert_eq!(h.orch.call().unwrap().remote_address(), Some("1002"));
    }

    #[tokio::test]
    async fn test_prepare_follows_answerer_gathering_when_offer_replaces_prewarm() {
        let mut h = Harness::new(FakeMedia::working());
        h.orch.handle_event(CallEvent::Start).await;
        h.notify("onCallIncoming", json!({ "call_session": "abc" })).await;
        h.notify("onRtcCallIncoming", json!({ "sdp": FAKE_OFFER, "call_session": "abc" })).await;
        assert_eq!(methods_of(&h.sent()), ["callAnswer"]);

        h.gather(1, &[candidate(1)]).await;
        assert_eq!(methods_of(&h.sent()), ["rtcPrepare", "rtcCallAnswer"]);

        h.orch.handle_event(CallEvent::Hangup).await;
        h.gather(2, &[candidate(2)]).await;
        assert!(h.sent().is_empty(), "rtcPrepare only once per connection");
    }

    #[tokio::test]
    async fn test_hangup_prewarms_new_offer_without_second_prepare() {
        let mut h = Harness::ready(FakeMedia::working()).await;
        h.orch.handle_event(CallEvent::PlaceCall("1001".into())).await;
        h.sent();

        h.orch.handle_event(CallEvent::Hangup).await;
        assert!(h.orch.call().is_none());
        assert!(h.factory.log(0).lock().closed);
        assert_eq!(h.factory.created(), 2);

        h.gather(1, &[candidate(4)]).await;
        assert!(h.sent().is_empty());
        assert!(h.phone_events().contains(&PhoneEvent::ReadyToCall(true)));
    }

    #[tokio::test]
    async fn test_transport_close_tears_everything_down() {
        let mut h = Harness::ready(FakeMedia::working()).await;
        h.orch.handle_event(CallEvent::PlaceCall("1001".into())).await;
        assert!(h.rpc.pending_count() >= 2);

        h.orch
            .handle_event(CallEvent::TransportClosed(LinkClosed {
                clean: false,
                code: 1006,
                reason: String::new(),
            }))
            .await;

        assert_eq!(h.rpc.pending_count(), 0);
        assert!(h.orch.is_stopped());
        assert!(h.orch.call().is_none());
        assert!(h.factory.log(0).lock().closed);

        let events = h.phone_events();
        assert!(events.contains(&PhoneEvent::Status(
            "Connection suddenly close, close code: 1006, reason: ".into()
        )));
        assert!(events.contains(&PhoneEvent::ReadyToCall(false)));

        h.orch.handle_event(CallEvent::PlaceCall("1001".into())).await;
        assert_eq!(h.factory.created(), 1);
    }

    #[tokio::test]
    async fn test_media_denied_reports_and_queues_remote_offer() {
        let mut h = Harness::new(FakeMedia::denied());
        h.orch.handle_event(CallEvent::Start).await;

        assert_eq!(h.factory.created(), 0);
        let events = h.phone_events();
        assert!(events
            .iter()
            .any(|e| matches!(e, PhoneEvent::Error(msg) if msg.contains("Microphone access denied"))));

        h.notify("onRtcCallIncoming", json!({ "sdp": FAKE_OFFER })).await;
        assert_eq!(h.factory.created(), 0);
        assert!(h.orch.call().is_none());
    }

    #[tokio::test]
    async fn test_call_is_not_answered_without_local_audio() {
        let mut h = Harness::new(FakeMedia::denied());
        h.orch.handle_event(CallEvent::Start).await;
        h.phone_events();

        h.notify("onCallIncoming", json!({ "call_session": "abc" })).await;

        assert!(h.sent().is_empty(), "callAnswer needs local audio");
        assert!(h.orch.call().is_none());
        assert!(h
            .phone_events()
            .iter()
            .any(|e| matches!(e, PhoneEvent::Error(msg) if msg.contains("no local audio"))));
    }

    #[tokio::test]
    async fn test_mute_toggles_local_audio() {
        let mut h = Harness::ready(FakeMedia::working()).await;
        h.orch.handle_event(CallEvent::SetMuted(true)).await;

        let audio = h.orch.negotiation().unwrap().local_audio().unwrap();
        assert!(audio.is_muted());
        assert!(h.phone_events().contains(&PhoneEvent::Status("Microphone muted".into())));
    }
}
