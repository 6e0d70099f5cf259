//! Call signaling and session control.
//!
//! Calls are negotiated over a per-conversation broadcast channel on the
//! realtime service. Offer and answer descriptions plus trickled ICE
//! candidates travel as broadcast events; every signal carries a `to`
//! field and receivers drop anything not addressed to them, because the
//! channel delivers each broadcast to every subscriber (senders included).

pub mod call_test;
pub mod channel;
pub mod loopback;
pub mod media;
pub mod negotiation;
pub mod session;

use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::api::client::BackendClient;
use crate::api::{chat, profiles};

pub use channel::{SignalChannel, SignalTransport};
pub use media::MediaEngine;
pub use negotiation::{CallDriver, CallMachine, CallOptions};

/// Media kind of a call, `callType` on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallKind {
    Audio,
    Video,
}

impl fmt::Display for CallKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallKind::Audio => write!(f, "audio"),
            CallKind::Video => write!(f, "video"),
        }
    }
}

/// Lifecycle of one call, as seen by the local endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallStatus {
    /// No call in progress.
    Idle,
    /// Acquiring media and publishing the offer.
    Requesting,
    /// A remote offer is waiting for accept or decline.
    Ringing,
    /// The offer is out; the answer is pending or on its way back.
    Connecting,
    /// The answer has been exchanged; the call is up.
    Active,
    /// The call is over, whatever the cause.
    Ended,
}

/// Which side of call setup we ended up on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallRole {
    Caller,
    Receiver,
}

/// Why a call reached [`CallStatus::Ended`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    /// We hung up.
    LocalHangup,
    /// The remote endpoint sent end-call.
    RemoteEnded,
    /// We declined a ringing call.
    Declined,
    /// Nobody answered the offer within the timeout.
    AnswerTimeout,
    /// The peer transport failed or was lost.
    ConnectionFailed,
    /// Local capture or negotiation failed.
    MediaFailed,
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            EndReason::LocalHangup => "call ended",
            EndReason::RemoteEnded => "remote endpoint ended the call",
            EndReason::Declined => "call declined",
            EndReason::AnswerTimeout => "no answer",
            EndReason::ConnectionFailed => "connection failed",
            EndReason::MediaFailed => "media failure",
        };
        write!(f, "{}", text)
    }
}

/// Errors from the calling subsystem.
#[derive(Debug, Error)]
pub enum CallError {
    /// Capture devices were denied or unavailable.
    #[error("media permission denied: {0}")]
    PermissionDenied(String),
    /// Offer/answer exchange could not complete.
    #[error("negotiation failed: {0}")]
    NegotiationFailed(String),
    /// The peer transport could not be established or was lost.
    #[error("connectivity failed: {0}")]
    ConnectivityFailed(String),
    /// The signaling channel refused us or dropped.
    #[error("signaling channel lost: {0}")]
    ChannelLost(String),
}

/// Session description in the JSON shape browsers produce.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    /// "offer" or "answer".
    #[serde(rename = "type")]
    pub kind: String,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        SessionDescription { kind: "offer".into(), sdp: sdp.into() }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        SessionDescription { kind: "answer".into(), sdp: sdp.into() }
    }
}

/// ICE candidate in the JSON shape browsers produce.
///
/// Optional fields are omitted when absent, never sent as null.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", skip_serializing_if = "Option::is_none")]
    pub sdp_m_line_index: Option<u32>,
    #[serde(rename = "usernameFragment", skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

/// One signal on the call channel.
///
/// Serializes to the exact shape the web clients exchange:
/// `{"event": "offer", "payload": {"to": ..., "offer": ..., "callType": ...}}`
/// and so on for the other events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload")]
pub enum SignalMessage {
    #[serde(rename = "offer")]
    Offer {
        to: String,
        offer: SessionDescription,
        #[serde(rename = "callType", skip_serializing_if = "Option::is_none")]
        call_type: Option<CallKind>,
    },
    #[serde(rename = "answer")]
    Answer { to: String, answer: SessionDescription },
    #[serde(rename = "ice-candidate")]
    IceCandidate { to: String, candidate: IceCandidate },
    #[serde(rename = "end-call")]
    EndCall { to: String },
}

impl SignalMessage {
    /// Endpoint the signal is addressed to.
    pub fn to(&self) -> &str {
        match self {
            SignalMessage::Offer { to, .. } => to,
            SignalMessage::Answer { to, .. } => to,
            SignalMessage::IceCandidate { to, .. } => to,
            SignalMessage::EndCall { to } => to,
        }
    }

    /// Wire name of the event.
    pub fn event_name(&self) -> &'static str {
        match self {
            SignalMessage::Offer { .. } => "offer",
            SignalMessage::Answer { .. } => "answer",
            SignalMessage::IceCandidate { .. } => "ice-candidate",
            SignalMessage::EndCall { .. } => "end-call",
        }
    }

    /// Rebuild a signal from a broadcast event name and payload.
    /// Returns None for unknown events or malformed payloads.
    pub fn from_parts(event: &str, payload: serde_json::Value) -> Option<Self> {
        let value = serde_json::json!({ "event": event, "payload": payload });
        serde_json::from_value(value).ok()
    }
}

/// Place a call to another user and run it until one side hangs up.
pub async fn call_user(username: &str, audio_only: bool) -> Result<()> {
    let client = BackendClient::new().await?;
    let callee = profiles::find_by_username(&client, username).await?;
    let conversation_id = chat::get_or_create_conversation(&client, &callee.id).await?;
    let kind = if audio_only { CallKind::Audio } else { CallKind::Video };

    println!("Calling {} ({} call)...", callee.display_name(), kind);

    let transport = channel::RealtimeSignalTransport::open(&client, conversation_id).await?;
    let signals = SignalChannel::new(Box::new(transport), client.user_id());

    // Platform capture sits behind the MediaEngine trait; the loopback
    // engine is the built-in backend.
    let engine: Arc<dyn MediaEngine> = Arc::new(loopback::LoopbackEngine::new());
    let session = session::MediaSession::new(engine, kind);
    let machine = CallMachine::new(client.user_id(), &callee.id, kind);

    let options = CallOptions {
        place_call: true,
        auto_accept: true,
        ctrl_c: true,
    };
    let outcome = CallDriver::new(machine, signals, session, options).run().await?;

    println!("{}", capitalize(&outcome.reason.to_string()));
    if outcome.connected {
        tracing::info!(
            "Candidates exchanged: {} sent, {} received",
            outcome.candidates_sent,
            outcome.candidates_received
        );
    }
    Ok(())
}

fn capitalize(text: &str) -> String {
    let mut chars = text.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_offer_wire_shape() {
        let msg = SignalMessage::Offer {
            to: "u2".into(),
            offer: SessionDescription::offer("v=0\r\n"),
            call_type: Some(CallKind::Video),
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            value,
            json!({
                "event": "offer",
                "payload": {
                    "to": "u2",
                    "offer": { "type": "offer", "sdp": "v=0\r\n" },
                    "callType": "video"
                }
            })
        );
    }

    #[test]
    fn test_offer_without_call_type_omits_field() {
        let msg = SignalMessage::Offer {
            to: "u2".into(),
            offer: SessionDescription::offer("v=0\r\n"),
            call_type: None,
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert!(value["payload"].get("callType").is_none());
    }

    #[test]
    fn test_answer_wire_shape() {
        let msg = SignalMessage::Answer {
            to: "u1".into(),
            answer: SessionDescription::answer("v=0\r\n"),
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            value,
            json!({
                "event": "answer",
                "payload": {
                    "to": "u1",
                    "answer": { "type": "answer", "sdp": "v=0\r\n" }
                }
            })
        );
    }

    #[test]
    fn test_candidate_wire_shape_omits_absent_fields() {
        let msg = SignalMessage::IceCandidate {
            to: "u1".into(),
            candidate: IceCandidate {
                candidate: "candidate:1 1 udp 2122260223 192.0.2.1 54400 typ host".into(),
                sdp_mid: Some("0".into()),
                sdp_m_line_index: Some(0),
                username_fragment: None,
            },
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["event"], "ice-candidate");
        assert_eq!(value["payload"]["candidate"]["sdpMid"], "0");
        assert_eq!(value["payload"]["candidate"]["sdpMLineIndex"], 0);
        assert!(value["payload"]["candidate"].get("usernameFragment").is_none());
    }

    #[test]
    fn test_end_call_wire_shape() {
        let msg = SignalMessage::EndCall { to: "u2".into() };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value, json!({ "event": "end-call", "payload": { "to": "u2" } }));
    }

    #[test]
    fn test_parse_browser_offer() {
        let text = r#"{
            "event": "offer",
            "payload": {
                "to": "a1b2",
                "offer": { "type": "offer", "sdp": "v=0\r\no=- 1 1 IN IP4 0.0.0.0\r\n" },
                "callType": "audio"
            }
        }"#;
        let msg: SignalMessage = serde_json::from_str(text).unwrap();
        match msg {
            SignalMessage::Offer { to, offer, call_type } => {
                assert_eq!(to, "a1b2");
                assert_eq!(offer.kind, "offer");
                assert_eq!(call_type, Some(CallKind::Audio));
            }
            other => panic!("parsed as {:?}", other),
        }
    }

    #[test]
    fn test_from_parts_rejects_unknown_event() {
        assert!(SignalMessage::from_parts("ring", json!({ "to": "x" })).is_none());
        assert!(SignalMessage::from_parts("offer", json!({ "to": "x" })).is_none());
    }

    #[test]
    fn test_from_parts_round_trip() {
        let msg = SignalMessage::EndCall { to: "u9".into() };
        let value = serde_json::to_value(&msg).unwrap();
        let rebuilt = SignalMessage::from_parts(
            value["event"].as_str().unwrap(),
            value["payload"].clone(),
        );
        assert_eq!(rebuilt, Some(msg));
    }
}
