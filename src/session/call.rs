//! Call Session - Zustand eines einzelnen Anrufs auf Call-Control-Ebene

use crate::signaling::SessionId;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Richtung des Anrufs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CallDirection {
    Outgoing,
    Incoming,
}

/// Zustand des Anrufs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CallState {
    Dialing,
    Answering,
    Negotiating,
    Connected,
    Ended,
}

/// Ein Anruf vom ersten Request/Event bis Auflegen oder Verbindungsende
#[derive(Debug, Clone, Serialize)]
pub struct CallSession {
    session_id: Option<SessionId>,
    direction: CallDirection,
    state: CallState,
    remote_address: Option<String>,
    started_at: DateTime<Utc>,
    #[serde(skip)]
    offer_sent: bool,
    #[serde(skip)]
    answer_sent: bool,
    #[serde(skip)]
    tone_played: bool,
}

impl CallSession {
    /// Ausgehender Anruf; die Session-ID kommt später mit der `callMake`-Antwort
    pub fn outgoing(remote_address: impl Into<String>) -> Self {
        Self::new(CallDirection::Outgoing, CallState::Dialing, None, Some(remote_address.into()))
    }

    /// Eingehender Anruf, ggf. schon mit Session-ID
    pub fn incoming(session_id: Option<SessionId>) -> Self {
        Self::new(CallDirection::Incoming, CallState::Answering, session_id, None)
    }

    fn new(
        direction: CallDirection,
        state: CallState,
        session_id: Option<SessionId>,
        remote_address: Option<String>,
    ) -> Self {
        Self {
            session_id,
            direction,
            state,
            remote_address,
            started_at: Utc::now(),
            offer_sent: false,
            answer_sent: false,
            tone_played: false,
        }
    }

    pub fn session_id(&self) -> Option<&SessionId> {
        self.session_id.as_ref()
    }

    pub fn direction(&self) -> CallDirection {
        self.direction
    }

    pub fn state(&self) -> CallState {
        self.state
    }

    pub fn remote_address(&self) -> Option<&str> {
        self.remote_address.as_deref()
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Dauer seit Beginn des Anrufs
    pub fn duration(&self) -> chrono::Duration {
        Utc::now() - self.started_at
    }

    /// Gehört eine Notification mit dieser Session-ID zu diesem Anruf?
    ///
    /// Notifications ohne ID und Anrufe ohne ID passen immer.
    pub fn matches(&self, session_id: Option<&SessionId>) -> bool {
        match (&self.session_id, session_id) {
            (Some(ours), Some(theirs)) => ours == theirs,
            _ => true,
        }
    }

    /// Übernimmt die Session-ID, falls noch keine bekannt ist.
    /// Gibt `true` zurück, wenn sie neu gesetzt wurde.
    pub fn adopt_session_id(&mut self, session_id: SessionId) -> bool {
        if self.session_id.is_some() {
            return false;
        }
        tracing::info!("Call session id: {}", session_id);
        self.session_id = Some(session_id);
        true
    }

    /// Setzt den Zustand, gibt `true` bei einer Änderung zurück
    pub fn set_state(&mut self, state: CallState) -> bool {
        if self.state == state {
            return false;
        }
        tracing::debug!("Call state: {:?} -> {:?}", self.state, state);
        self.state = state;
        true
    }

    /// `rtcCallMake` darf pro Anruf nur einmal gesendet werden
    pub fn mark_offer_sent(&mut self) -> bool {
        !std::mem::replace(&mut self.offer_sent, true)
    }

    /// `callAnswer` darf pro Anruf nur einmal gesendet werden
    pub fn mark_answer_sent(&mut self) -> bool {
        !std::mem::replace(&mut self.answer_sent, true)
    }

    /// `callTonePlay` darf pro Anruf nur einmal gesendet werden
    pub fn mark_tone_played(&mut self) -> bool {
        !std::mem::replace(&mut self.tone_played, true)
    }
}
