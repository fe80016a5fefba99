//! callbridge - WebRTC Call-Signaling Client
//!
//! Verbindet eine WebRTC Peer Connection mit einem Telefonie-Server, der
//! JSON-RPC 2.0 über WebSocket spricht:
//! - Signaling: WebSocket Link und JSON-RPC Client
//! - Call Engine: Mikrofon, SDP, Peer Connection und Offer/Answer Negotiation
//! - Session: Call-Control-RPCs und Zustand des laufenden Anrufs
//!
//! Der [`Phone`] verdrahtet alles für eine Host-Anwendung.

pub mod call_engine;
pub mod config;
pub mod session;
pub mod signaling;

use call_engine::{MediaSource, Microphone, PeerFactory, WebRtcPeerFactory};
use config::{ConfigError, PhoneConfig};
use session::{CallEvent, CallOrchestrator, PhoneEvent};
use signaling::{LinkClosed, LinkEvent, RpcClient, SignalingError, SignalingLink};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};

/// Initialisiert das Logging (`RUST_LOG` überschreibt die Standard-Filter)
pub fn init_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("callbridge=debug,webrtc=warn"));

    // Ein zweiter Aufruf (z.B. aus Tests) ist harmlos
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum PhoneError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Signaling(#[from] SignalingError),

    #[error("Not connected to signaling server")]
    NotConnected,
}

// ============================================================================
// PHONE
// ============================================================================

struct Connection {
    link: SignalingLink,
    queue: mpsc::UnboundedSender<CallEvent>,
}

/// Einstiegspunkt für Host-Anwendungen
pub struct Phone {
    config: PhoneConfig,
    peers: Arc<dyn PeerFactory>,
    media: Arc<dyn MediaSource>,
    events: broadcast::Sender<PhoneEvent>,
    connection: Option<Connection>,
}

impl Phone {
    /// Phone mit Standard-Mikrofon und `webrtc` Peer Connections
    pub fn new(config: PhoneConfig) -> Self {
        let peers = Arc::new(WebRtcPeerFactory::new(config.ice_servers.clone()));
        Self::with_backends(config, peers, Arc::new(Microphone))
    }

    /// Phone mit eigenen Peer- und Media-Implementierungen
    pub fn with_backends(config: PhoneConfig, peers: Arc<dyn PeerFactory>, media: Arc<dyn MediaSource>) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            config,
            peers,
            media,
            events,
            connection: None,
        }
    }

    pub fn config(&self) -> &PhoneConfig {
        &self.config
    }

    /// Gibt einen Event-Receiver zurück
    pub fn subscribe(&self) -> broadcast::Receiver<PhoneEvent> {
        self.events.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.connection
            .as_ref()
            .map(|c| c.link.is_connected())
            .unwrap_or(false)
    }

    /// Verbindet mit dem Signaling-Server und startet den Pre-Warm
    pub async fn connect(&mut self) -> Result<(), PhoneError> {
        if self.is_connected() {
            return Ok(());
        }

        let rpc = RpcClient::new();
        let orchestrator = CallOrchestrator::new(
            rpc.clone(),
            Arc::clone(&self.peers),
            Arc::clone(&self.media),
            self.config.tone_id.clone(),
            self.events.clone(),
        );
        let queue = orchestrator.sender();

        let mut link = SignalingLink::new(self.config.signaling_url.clone(), rpc);
        let mut link_events = link.subscribe();
        if let Err(e) = link.connect().await {
            let _ = self.events.send(PhoneEvent::Status(format!("Connection error: {}", e)));
            return Err(e.into());
        }

        // Verbindungsende in die Queue des Orchestrators weiterleiten
        let tx = queue.clone();
        tokio::spawn(async move {
            loop {
                match link_events.recv().await {
                    Ok(LinkEvent::Closed(closed)) => {
                        let _ = tx.send(CallEvent::TransportClosed(closed));
                        break;
                    }
                    Ok(LinkEvent::Connected) => {}
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!("Missed {} link events", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        tokio::spawn(orchestrator.run());
        let _ = queue.send(CallEvent::Start);

        self.connection = Some(Connection { link, queue });
        Ok(())
    }

    /// Ruft eine Adresse an (wartet ggf. auf das lokale SDP)
    pub fn place_call(&self, address: impl Into<String>) -> Result<(), PhoneError> {
        self.send(CallEvent::PlaceCall(address.into()))
    }

    pub fn hangup(&self) -> Result<(), PhoneError> {
        self.send(CallEvent::Hangup)
    }

    pub fn set_muted(&self, muted: bool) -> Result<(), PhoneError> {
        self.send(CallEvent::SetMuted(muted))
    }

    /// Trennt die Verbindung und setzt allen Anrufzustand zurück
    pub fn disconnect(&mut self) {
        let Some(mut connection) = self.connection.take() else {
            return;
        };
        connection.link.disconnect();
        let _ = connection.queue.send(CallEvent::TransportClosed(LinkClosed {
            clean: true,
            code: 1000,
            reason: "disconnected by user".to_string(),
        }));
    }

    fn send(&self, event: CallEvent) -> Result<(), PhoneError> {
        let connection = self.connection.as_ref().ok_or(PhoneError::NotConnected)?;
        connection.queue.send(event).map_err(|_| PhoneError::NotConnected)
    }
}

impl std::fmt::Debug for Phone {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Phone")
            .field("config", &self.config)
            .field("connected", &self.is_connected())
            .finish()
    }
}
