//! Session Module - Call-Control über dem Signaling
//!
//! Verknüpft die Negotiation Engine mit den Call-Control-RPCs des Servers
//! und hält den Zustand des laufenden Anrufs.

mod call;
mod orchestrator;

pub use call::{CallDirection, CallSession, CallState};
pub use orchestrator::{CallEvent, CallOrchestrator, PhoneEvent, RpcStep, DEFAULT_TONE_ID};
