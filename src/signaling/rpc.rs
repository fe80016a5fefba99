//! JSON-RPC Client über einen Text-Frame-Kanal
//!
//! Nummeriert ausgehende Requests, ordnet Responses den offenen Calls zu und
//! verteilt Notifications an registrierte Handler. Der eigentliche Transport
//! (WebSocket) hängt sich über [`RpcClient::attach`] an.

use super::messages::{IncomingFrame, RpcErrorObject, RpcRequest};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RpcError {
    #[error("Transport closed")]
    TransportClosed,

    #[error("Remote error {code}: {message}")]
    RemoteError { code: i64, message: String },

    #[error("Failed to encode request: {0}")]
    Encode(String),
}

/// Handler für eingehende Notifications, bekommt die `params`
pub type NotificationHandler = Arc<dyn Fn(&Value) + Send + Sync>;

/// Callback für eine Antwort, läuft direkt im Lesepfad des Transports
pub type ReplyHandler = Box<dyn FnOnce(Result<Value, RpcError>) + Send>;

/// Wohin die Antwort eines offenen Calls geht
enum ReplyTarget {
    Channel(oneshot::Sender<Result<Value, RpcError>>),
    Handler(ReplyHandler),
}

impl ReplyTarget {
    fn deliver(self, outcome: Result<Value, RpcError>) {
        match self {
            ReplyTarget::Channel(tx) => {
                let _ = tx.send(outcome);
            }
            ReplyTarget::Handler(handler) => handler(outcome),
        }
    }
}

struct PendingCall {
    method: String,
    reply: ReplyTarget,
}

#[derive(Default)]
struct RpcInner {
    next_id: AtomicU64,
    pending: Mutex<HashMap<u64, PendingCall>>,
    handlers: RwLock<HashMap<String, Vec<NotificationHandler>>>,
    outbound: Mutex<Option<mpsc::UnboundedSender<String>>>,
}

// ============================================================================
// PENDING REPLY
// ============================================================================

/// Antwort auf einen bereits gesendeten Request
#[derive(Debug)]
pub struct PendingReply {
    id: u64,
    method: String,
    rx: oneshot::Receiver<Result<Value, RpcError>>,
}

impl PendingReply {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    /// Wartet auf die Response. Schließt der Transport vorher,
    /// endet der Call mit [`RpcError::TransportClosed`].
    pub async fn response(self) -> Result<Value, RpcError> {
        self.rx.await.unwrap_or(Err(RpcError::TransportClosed))
    }
}

// ============================================================================
// RPC CLIENT
// ============================================================================

/// JSON-RPC Client (günstig klonbar, alle Klone teilen sich den Zustand)
#[derive(Clone, Default)]
pub struct RpcClient {
    inner: Arc<RpcInner>,
}

impl RpcClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Verbindet den Client mit dem ausgehenden Frame-Kanal des Transports
    pub fn attach(&self, outbound: mpsc::UnboundedSender<String>) {
        *self.inner.outbound.lock() = Some(outbound);
    }

    /// Prüft ob ein Transport angehängt und offen ist
    pub fn is_open(&self) -> bool {
        self.inner
            .outbound
            .lock()
            .as_ref()
            .map(|tx| !tx.is_closed())
            .unwrap_or(false)
    }

    /// Anzahl offener Calls
    pub fn pending_count(&self) -> usize {
        self.inner.pending.lock().len()
    }

    /// Registriert einen Handler für eine Notification.
    /// Mehrere Handler pro Name werden in Registrierungsreihenfolge aufgerufen.
    pub fn on<F>(&self, method: &str, handler: F)
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.inner
            .handlers
            .write()
            .entry(method.to_string())
            .or_default()
            .push(Arc::new(handler));
    }

    /// Ruft eine Methode auf und wartet auf das Ergebnis
    pub async fn call<P: Serialize>(&self, method: &str, params: Option<P>) -> Result<Value, RpcError> {
        self.request(method, params)?.response().await
    }

    /// Sendet einen Request sofort und gibt die ausstehende Antwort zurück.
    ///
    /// Die Frames gehen in Aufrufreihenfolge raus, unabhängig davon wann
    /// auf die Antworten gewartet wird.
    pub fn request<P: Serialize>(&self, method: &str, params: Option<P>) -> Result<PendingReply, RpcError> {
        let (reply, rx) = oneshot::channel();
        let id = self.send_request(method, params, ReplyTarget::Channel(reply))?;
        Ok(PendingReply {
            id,
            method: method.to_string(),
            rx,
        })
    }

    /// Sendet einen Request; `on_reply` läuft, sobald die Antwort gelesen
    /// wurde, also vor allen später eintreffenden Frames.
    ///
    /// Schließt der Transport vorher, bekommt `on_reply` [`RpcError::TransportClosed`].
    pub fn request_with<P, F>(&self, method: &str, params: Option<P>, on_reply: F) -> Result<u64, RpcError>
    where
        P: Serialize,
        F: FnOnce(Result<Value, RpcError>) + Send + 'static,
    {
        self.send_request(method, params, ReplyTarget::Handler(Box::new(on_reply)))
    }

    fn send_request<P: Serialize>(&self, method: &str, params: Option<P>, reply: ReplyTarget) -> Result<u64, RpcError> {
        let params = params
            .map(serde_json::to_value)
            .transpose()
            .map_err(|e| RpcError::Encode(e.to_string()))?;

        let outbound = self.inner.outbound.lock();
        let tx = outbound.as_ref().ok_or(RpcError::TransportClosed)?;

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let frame = serde_json::to_string(&RpcRequest::new(id, method, params))
            .map_err(|e| RpcError::Encode(e.to_string()))?;

        self.inner.pending.lock().insert(
            id,
            PendingCall {
                method: method.to_string(),
                reply,
            },
        );

        tracing::debug!("RPC -> {}", frame);
        if tx.send(frame).is_err() {
            self.inner.pending.lock().remove(&id);
            return Err(RpcError::TransportClosed);
        }
        Ok(id)
    }

    /// Verarbeitet einen eingehenden Text-Frame.
    ///
    /// Kaputte Frames werden geloggt und verworfen, sie beenden nie die
    /// Verarbeitung nachfolgender Frames.
    pub fn handle_frame(&self, text: &str) {
        tracing::debug!("RPC <- {}", text);

        let frame: IncomingFrame = match serde_json::from_str::<Value>(text) {
            Ok(value @ Value::Object(_)) => match serde_json::from_value(value) {
                Ok(frame) => frame,
                Err(e) => {
                    tracing::warn!("Discarding malformed frame: {}", e);
                    return;
                }
            },
            Ok(_) => {
                tracing::warn!("Discarding frame that is not a JSON object");
                return;
            }
            Err(e) => {
                tracing::warn!("Discarding malformed frame: {}", e);
                return;
            }
        };

        let pending = frame
            .numeric_id()
            .and_then(|id| self.inner.pending.lock().remove(&id));

        if let Some(call) = pending {
            let outcome = match (frame.error, frame.result) {
                (Some(error), _) => {
                    let error = RpcErrorObject::from_value(&error);
                    tracing::warn!("{} failed: {} ({})", call.method, error.message, error.code);
                    Err(RpcError::RemoteError {
                        code: error.code,
                        message: error.message,
                    })
                }
                (None, result) => Ok(result.unwrap_or(Value::Null)),
            };
            call.reply.deliver(outcome);
            return;
        }

        match frame.method {
            Some(method) => self.dispatch(&method, &frame.params.unwrap_or(Value::Null)),
            None => tracing::debug!("Ignoring response without pending call: {:?}", frame.id),
        }
    }

    /// Trennt den Transport. Alle offenen Calls enden mit `TransportClosed`.
    pub fn close(&self) {
        self.inner.outbound.lock().take();

        let pending: Vec<PendingCall> = self.inner.pending.lock().drain().map(|(_, c)| c).collect();
        if !pending.is_empty() {
            tracing::info!("Rejecting {} pending call(s): transport closed", pending.len());
        }
        for call in pending {
            call.reply.deliver(Err(RpcError::TransportClosed));
        }
    }

    fn dispatch(&self, method: &str, params: &Value) {
        // Handler-Liste klonen, damit Handler selbst `on` aufrufen dürfen
        let handlers: Vec<NotificationHandler> = self
            .inner
            .handlers
            .read()
            .get(method)
            .cloned()
            .unwrap_or_default();

        if handlers.is_empty() {
            tracing::debug!("No handler for notification {}", method);
        }
        for handler in handlers {
            handler(params);
        }
    }
}

impl std::fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcClient")
            .field("is_open", &self.is_open())
            .field("pending", &self.pending_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn attached() -> (RpcClient, mpsc::UnboundedReceiver<String>) {
        let rpc = RpcClient::new();
        let (tx, rx) = mpsc::unbounded_channel();
        rpc.attach(tx);
        (rpc, rx)
    }

    fn sent(rx: &mut mpsc::UnboundedReceiver<String>) -> Value {
        serde_json::from_str(&rx.try_recv().expect("frame sent")).unwrap()
    }

    #[tokio::test]
    async fn test_call_resolves_with_matching_response() {
        let (rpc, mut rx) = attached();
        let reply = rpc.request("callMake", Some(json!({ "rtc_address": "100" }))).unwrap();

        let frame = sent(&mut rx);
        assert_eq!(frame["jsonrpc"], "2.0");
        assert_eq!(frame["method"], "callMake");
        assert_eq!(frame["params"]["rtc_address"], "100");

        rpc.handle_frame(&json!({ "jsonrpc": "2.0", "id": frame["id"], "result": { "message": "call created" } }).to_string());
        assert_eq!(reply.response().await.unwrap()["message"], "call created");
        assert_eq!(rpc.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_remote_error_is_surfaced() {
        let (rpc, mut rx) = attached();
        let reply = rpc.request::<Value>("rtcPrepare", None).unwrap();
        let frame = sent(&mut rx);
        assert!(frame.get("params").is_none());

        rpc.handle_frame(&json!({ "jsonrpc": "2.0", "id": frame["id"], "error": { "code": -32601, "message": "Method not found" } }).to_string());
        assert_eq!(
            reply.response().await,
            Err(RpcError::RemoteError {
                code: -32601,
                message: "Method not found".into()
            })
        );
    }

    #[test]
    fn test_reply_handler_runs_before_following_notification() {
        let (rpc, mut rx) = attached();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let log = Arc::clone(&seen);
        rpc.on("onRtcCallAnswer", move |_| log.lock().push("notification".to_string()));
        let log = Arc::clone(&seen);
        let id = rpc
            .request_with("callMake", Some(json!({ "rtc_address": "100" })), move |result| {
                log.lock().push(format!("reply:{}", result.unwrap()["call_session"]));
            })
            .unwrap();
        assert_eq!(sent(&mut rx)["id"], id);

        rpc.handle_frame(&json!({ "jsonrpc": "2.0", "id": id, "result": { "call_session": 77 } }).to_string());
        rpc.handle_frame(r#"{"jsonrpc":"2.0","method":"onRtcCallAnswer","params":{"sdp":""}}"#);

        assert_eq!(*seen.lock(), vec!["reply:77", "notification"]);
        assert_eq!(rpc.pending_count(), 0);
    }

    #[test]
    fn test_error_reply_without_message_rejects_call() {
        let (rpc, _rx) = attached();
        let outcome = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&outcome);
        let id = rpc
            .request_with("callMake", Some(json!({ "rtc_address": "1" })), move |result| {
                *slot.lock() = Some(result);
            })
            .unwrap();
        rpc.request::<Value>("rtcPrepare", None).unwrap();

        rpc.handle_frame(&json!({ "jsonrpc": "2.0", "id": id, "error": { "code": -32000 } }).to_string());

        assert_eq!(rpc.pending_count(), 1);
        assert_eq!(
            outcome.lock().take(),
            Some(Err(RpcError::RemoteError {
                code: -32000,
                message: "Unknown error".into()
            }))
        );
    }

    #[test]
    fn test_close_runs_pending_reply_handlers() {
        let (rpc, _rx) = attached();
        let outcome = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&outcome);
        rpc.request_with::<Value, _>("rtcPrepare", None, move |result| *slot.lock() = Some(result))
            .unwrap();

        rpc.close();
        assert_eq!(outcome.lock().take(), Some(Err(RpcError::TransportClosed)));
    }

    #[tokio::test]
    async fn test_call_without_transport_fails() {
        let rpc = RpcClient::new();
        let result = rpc.call::<Value>("rtcPrepare", None).await;
        assert_eq!(result, Err(RpcError::TransportClosed));
    }

    #[tokio::test]
    async fn test_close_rejects_all_pending_calls() {
        let (rpc, mut rx) = attached();
        let first = rpc.request("callMake", Some(json!({ "rtc_address": "1" }))).unwrap();
        let second = rpc.request("callAnswer", Some(json!({ "call_session": "2" }))).unwrap();
        assert_eq!(rpc.pending_count(), 2);
        let _ = sent(&mut rx);
        let _ = sent(&mut rx);

        rpc.close();

        assert_eq!(first.response().await, Err(RpcError::TransportClosed));
        assert_eq!(second.response().await, Err(RpcError::TransportClosed));
        assert!(!rpc.is_open());

        // Keine weiteren Sendeversuche nach dem Schließen
        assert_eq!(
            rpc.request::<Value>("rtcPrepare", None).unwrap_err(),
            RpcError::TransportClosed
        );
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_dropped_transport_fails_request() {
        let (rpc, rx) = attached();
        drop(rx);
        assert!(!rpc.is_open());
        assert_eq!(
            rpc.request::<Value>("rtcPrepare", None).unwrap_err(),
            RpcError::TransportClosed
        );
        assert_eq!(rpc.pending_count(), 0);
    }

    #[test]
    fn test_notifications_reach_all_handlers_in_order() {
        let (rpc, _rx) = attached();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let log = Arc::clone(&seen);
        rpc.on("onCallIncoming", move |params| {
            log.lock().push(format!("first:{}", params["call_session"]));
        });
        let log = Arc::clone(&seen);
        rpc.on("onCallIncoming", move |params| {
            log.lock().push(format!("second:{}", params["call_session"]));
        });
        let log = Arc::clone(&seen);
        rpc.on("onCallAnswer", move |_| log.lock().push("answer".to_string()));

        rpc.handle_frame(r#"{"jsonrpc":"2.0","method":"onCallIncoming","params":{"call_session":"42"}}"#);

        assert_eq!(*seen.lock(), vec![r#"first:"42""#, r#"second:"42""#]);
    }

    #[test]
    fn test_malformed_frames_do_not_stop_processing() {
        let (rpc, _rx) = attached();
        let seen = Arc::new(Mutex::new(0));
        let count = Arc::clone(&seen);
        rpc.on("onCallAnswer", move |_| *count.lock() += 1);

        rpc.handle_frame("{not json");
        rpc.handle_frame("[1,2,3]");
        rpc.handle_frame("");
        rpc.handle_frame(r#"{"jsonrpc":"2.0","method":"onCallAnswer"}"#);

        assert_eq!(*seen.lock(), 1);
    }

    #[test]
    fn test_request_with_unknown_id_is_treated_as_notification() {
        let (rpc, _rx) = attached();
        let seen = Arc::new(Mutex::new(Vec::<Value>::new()));
        let log = Arc::clone(&seen);
        rpc.on("onCallAnswer", move |params| log.lock().push(params.clone()));

        rpc.handle_frame(r#"{"jsonrpc":"2.0","id":999,"method":"onCallAnswer","params":{"call_session":"5"}}"#);
        rpc.handle_frame(r#"{"jsonrpc":"2.0","id":998,"result":{}}"#);

        assert_eq!(*seen.lock(), vec![json!({ "call_session": "5" })]);
    }
}
