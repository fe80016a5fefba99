//! WebSocket Link zum Signaling-Server
//!
//! Verwaltet die WebSocket-Verbindung:
//! - Read-Task leitet Text-Frames an den RPC-Client weiter
//! - Write-Task sendet die Frames des RPC-Clients
//! - Close-Status (sauber / abrupt, Code, Grund) als Event

use super::rpc::RpcClient;
use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_tungstenite::{connect_async, tungstenite::Message};

/// Close-Code wenn die Verbindung ohne Close-Frame endet
pub const ABNORMAL_CLOSURE: u16 = 1006;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone)]
pub enum SignalingError {
    #[error("WebSocket connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Invalid signaling URL: {0}")]
    InvalidUrl(String),

    #[error("Not connected to signaling server")]
    NotConnected,

    #[error("Connection closed abnormally (code {code}): {reason}")]
    AbnormalClose { code: u16, reason: String },
}

// ============================================================================
// LINK EVENTS
// ============================================================================

/// Wie die Verbindung beendet wurde
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkClosed {
    pub clean: bool,
    pub code: u16,
    pub reason: String,
}

impl LinkClosed {
    /// Status-Text für die Anzeige
    pub fn describe(&self) -> String {
        let headline = if self.clean {
            "Connection close was clean"
        } else {
            "Connection suddenly close"
        };
        format!(
            "{}, close code: {}, reason: {}",
            headline, self.code, self.reason
        )
    }

    /// Abrupte Schließung als Transportfehler
    pub fn as_error(&self) -> Option<SignalingError> {
        (!self.clean).then(|| SignalingError::AbnormalClose {
            code: self.code,
            reason: self.reason.clone(),
        })
    }
}

/// Events die vom SignalingLink ausgelöst werden
#[derive(Debug, Clone)]
pub enum LinkEvent {
    /// Verbunden mit Signaling-Server
    Connected,

    /// Verbindung getrennt
    Closed(LinkClosed),
}

// ============================================================================
// SIGNALING LINK
// ============================================================================

/// WebSocket-Verbindung, die Frames mit einem [`RpcClient`] austauscht
pub struct SignalingLink {
    server_url: String,
    rpc: RpcClient,
    connected: Arc<RwLock<bool>>,
    close_tx: Option<oneshot::Sender<()>>,
    event_tx: broadcast::Sender<LinkEvent>,
}

impl SignalingLink {
    /// Erstellt einen neuen Link (noch nicht verbunden)
    pub fn new(server_url: String, rpc: RpcClient) -> Self {
        let (event_tx, _) = broadcast::channel(16);

        Self {
            server_url,
            rpc,
            connected: Arc::new(RwLock::new(false)),
            close_tx: None,
            event_tx,
        }
    }

    /// Gibt einen Event-Receiver zurück
    pub fn subscribe(&self) -> broadcast::Receiver<LinkEvent> {
        self.event_tx.subscribe()
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    /// Prüft ob verbunden
    pub fn is_connected(&self) -> bool {
        *self.connected.read()
    }

    /// Baut die WebSocket-Verbindung auf und startet Read- und Write-Task
    pub async fn connect(&mut self) -> Result<(), SignalingError> {
        tracing::info!("Connecting to signaling server: {}", self.server_url);

        let (ws_stream, _) = connect_async(self.server_url.as_str())
            .await
            .map_err(|e| SignalingError::ConnectionFailed(e.to_string()))?;

        let (mut write, mut read) = ws_stream.split();

        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let (close_tx, mut close_rx) = oneshot::channel::<()>();
        self.close_tx = Some(close_tx);
        self.rpc.attach(tx);
        *self.connected.write() = true;

        let _ = self.event_tx.send(LinkEvent::Connected);

        // Read-Task starten
        let rpc = self.rpc.clone();
        let connected = Arc::clone(&self.connected);
        let event_tx = self.event_tx.clone();

        tokio::spawn(async move {
            let mut closed = LinkClosed {
                clean: false,
                code: ABNORMAL_CLOSURE,
                reason: String::new(),
            };

            while let Some(msg_result) = read.next().await {
                match msg_result {
                    Ok(Message::Text(text)) => rpc.handle_frame(&text),
                    Ok(Message::Close(frame)) => {
                        tracing::info!("WebSocket closed by server");
                        closed.clean = true;
                        if let Some(frame) = frame {
                            closed.code = u16::from(frame.code);
                            closed.reason = frame.reason.to_string();
                        } else {
                            closed.code = 1005;
                        }
                        break;
                    }
                    Err(e) => {
                        tracing::error!("WebSocket error: {}", e);
                        closed.reason = e.to_string();
                        break;
                    }
                    _ => {}
                }
            }

            // Disconnect-Status setzen
            *connected.write() = false;
            rpc.close();
            tracing::info!("{}", closed.describe());
            let _ = event_tx.send(LinkEvent::Closed(closed));
        });

        // Write-Task starten
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    msg = rx.recv() => {
                        let Some(msg) = msg else { break };
                        if let Err(e) = write.send(Message::Text(msg)).await {
                            tracing::error!("Failed to send WebSocket message: {}", e);
                            break;
                        }
                    }
                    _ = &mut close_rx => {
                        tracing::debug!("Sending close frame");
                        let _ = write.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
        });

        Ok(())
    }

    /// Schließt die Verbindung. Offene Calls werden sofort abgewiesen,
    /// das `Closed`-Event kommt sobald der Server den Close bestätigt.
    pub fn disconnect(&mut self) {
        if let Some(close_tx) = self.close_tx.take() {
            tracing::info!("Disconnecting from signaling server");
            let _ = close_tx.send(());
        }
        self.rpc.close();
    }
}

impl std::fmt::Debug for SignalingLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalingLink")
            .field("server_url", &self.server_url)
            .field("connected", &self.is_connected())
            .finish()
    }
}
