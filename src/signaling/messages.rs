//! Message Types für das JSON-RPC Signaling-Protokoll
//!
//! JSON-RPC 2.0 Envelopes sowie typisierte Parameter für alle Methoden und
//! Notifications, die zwischen Client und Call-Control-Server ausgetauscht
//! werden.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::fmt;

/// JSON-RPC Protokollversion
pub const JSONRPC_VERSION: &str = "2.0";

/// Methodennamen Client → Server
pub mod methods {
    pub const RTC_PREPARE: &str = "rtcPrepare";
    pub const RTC_CALL_MAKE: &str = "rtcCallMake";
    pub const RTC_CALL_ANSWER: &str = "rtcCallAnswer";
    pub const CALL_MAKE: &str = "callMake";
    pub const CALL_ANSWER: &str = "callAnswer";
    pub const CALL_TONE_PLAY: &str = "callTonePlay";
}

/// Notification-Namen Server → Client
pub mod notifications {
    pub const ON_CALL_INCOMING: &str = "onCallIncoming";
    pub const ON_RTC_CALL_INCOMING: &str = "onRtcCallIncoming";
    pub const ON_RTC_CALL_ANSWER: &str = "onRtcCallAnswer";
    pub const ON_CALL_ANSWER: &str = "onCallAnswer";

    pub const ALL: [&str; 4] = [
        ON_CALL_INCOMING,
        ON_RTC_CALL_INCOMING,
        ON_RTC_CALL_ANSWER,
        ON_CALL_ANSWER,
    ];
}

// ============================================================================
// JSON-RPC ENVELOPES
// ============================================================================

/// Ausgehender Request
#[derive(Debug, Clone, Serialize)]
pub struct RpcRequest<'a> {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl<'a> RpcRequest<'a> {
    pub fn new(id: u64, method: &'a str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id,
            method,
            params,
        }
    }
}

/// Code für Fehler-Objekte ohne verwertbaren `code` (JSON-RPC "Internal error")
pub const FALLBACK_ERROR_CODE: i64 = -32603;

/// JSON-RPC Error-Objekt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcErrorObject {
    /// Liest ein Error-Objekt tolerant. Fehlende oder unpassende Felder
    /// bekommen Standardwerte, ein blanker String wird zur Nachricht.
    pub fn from_value(value: &Value) -> Self {
        let code = value
            .get("code")
            .and_then(|code| code.as_i64().or_else(|| code.as_f64().map(|f| f as i64)))
            .unwrap_or(FALLBACK_ERROR_CODE);

        let message = match value {
            Value::String(s) => s.clone(),
            _ => match value.get("message") {
                Some(Value::String(s)) => s.clone(),
                Some(Value::Null) | None => "Unknown error".to_string(),
                Some(other) => other.to_string(),
            },
        };

        Self {
            code,
            message,
            data: value.get("data").cloned(),
        }
    }
}

/// Eingehender Frame. Response und Notification teilen sich die Felder,
/// die Unterscheidung trifft der RPC-Client anhand der offenen Calls.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct IncomingFrame {
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub params: Option<Value>,
    #[serde(default)]
    pub result: Option<Value>,
    /// Roh gelesen, damit auch unvollständige Error-Objekte ihren Call beenden
    #[serde(default)]
    pub error: Option<Value>,
}

impl IncomingFrame {
    /// Numerische Request-ID (unsere IDs sind immer Zahlen)
    pub fn numeric_id(&self) -> Option<u64> {
        match self.id.as_ref()? {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }
}

// ============================================================================
// SESSION ID
// ============================================================================

/// Server-vergebene Call-Session-ID.
///
/// Der Server liefert sie je nach Version als String oder Zahl.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for SessionId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Text(String),
            Number(serde_json::Number),
        }

        Ok(match Raw::deserialize(deserializer)? {
            Raw::Text(s) => SessionId(s),
            Raw::Number(n) => SessionId(n.to_string()),
        })
    }
}

// ============================================================================
// CLIENT → SERVER PARAMS
// ============================================================================

/// Parameter für `rtcCallMake` und `rtcCallAnswer`
#[derive(Debug, Clone, Serialize)]
pub struct SdpParams {
    pub sdp: String,
}

/// Parameter für `callMake`
#[derive(Debug, Clone, Serialize)]
pub struct CallMakeParams {
    pub rtc_address: String,
}

/// Parameter für `callAnswer`
#[derive(Debug, Clone, Serialize)]
pub struct CallAnswerParams {
    pub call_session: SessionId,
}

/// Parameter für `callTonePlay`
#[derive(Debug, Clone, Serialize)]
pub struct CallTonePlayParams {
    pub call_session: SessionId,
    pub tone_id: String,
}

/// Ergebnis eines Calls, soweit es den Client interessiert
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CallResult {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub call_session: Option<SessionId>,
}

impl CallResult {
    /// Liest die bekannten Felder aus einem beliebigen Result-Wert
    pub fn from_value(value: &Value) -> Self {
        match value {
            Value::Object(_) => serde_json::from_value(value.clone()).unwrap_or_default(),
            Value::String(s) => Self {
                message: Some(s.clone()),
                call_session: None,
            },
            _ => Self::default(),
        }
    }
}

// ============================================================================
// SERVER → CLIENT NOTIFICATIONS
// ============================================================================

/// Alle Notifications, auf die der Client reagiert
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "method", content = "params")]
pub enum ServerNotification {
    /// Eingehender Anruf auf Call-Control-Ebene
    #[serde(rename = "onCallIncoming")]
    CallIncoming { call_session: SessionId },

    /// Remote-Offer für einen eingehenden Anruf
    #[serde(rename = "onRtcCallIncoming")]
    RtcCallIncoming {
        sdp: String,
        #[serde(default)]
        call_session: Option<SessionId>,
    },

    /// Remote-Answer auf unser Offer
    #[serde(rename = "onRtcCallAnswer")]
    RtcCallAnswer {
        sdp: String,
        #[serde(default)]
        call_session: Option<SessionId>,
    },

    /// Gegenstelle hat abgenommen
    #[serde(rename = "onCallAnswer")]
    CallAnswer {
        #[serde(default)]
        call_session: Option<SessionId>,
    },
}

impl ServerNotification {
    /// Baut die Notification aus Methodenname und `params` eines Frames
    pub fn from_parts(method: &str, params: &Value) -> Result<Self, serde_json::Error> {
        let params = match params {
            Value::Null => Value::Object(Default::default()),
            other => other.clone(),
        };
        serde_json::from_value(serde_json::json!({ "method": method, "params": params }))
    }

    pub fn method(&self) -> &'static str {
        match self {
            ServerNotification::CallIncoming { .. } => notifications::ON_CALL_INCOMING,
            ServerNotification::RtcCallIncoming { .. } => notifications::ON_RTC_CALL_INCOMING,
            ServerNotification::RtcCallAnswer { .. } => notifications::ON_RTC_CALL_ANSWER,
            ServerNotification::CallAnswer { .. } => notifications::ON_CALL_ANSWER,
        }
    }
}
