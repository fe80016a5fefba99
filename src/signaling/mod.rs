//! Signaling Module - JSON-RPC über WebSocket
//!
//! Dieses Modul verwaltet die Kommunikation mit dem Signaling-Server:
//! - WebSocket-Verbindung aufbauen und halten
//! - Requests nummerieren und Responses zuordnen
//! - Eingehende Notifications parsen und weiterleiten
//!

mod client;
pub mod messages;
mod rpc;

pub use client::{LinkClosed, LinkEvent, SignalingError, SignalingLink, ABNORMAL_CLOSURE};
pub use messages::{CallResult, ServerNotification, SessionId};
pub use rpc::{NotificationHandler, PendingReply, ReplyHandler, RpcClient, RpcError};
