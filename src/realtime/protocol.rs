//! Wire protocol of the realtime service.
//!
//! Every websocket message is one JSON frame with topic, event, payload
//! and an optional ref. Channel joins are `phx_join` pushes answered by
//! a `phx_reply` carrying the same ref; application traffic arrives as
//! `broadcast`, `presence_state`, `presence_diff` and
//! `postgres_changes` events on the joined topic.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

pub const TOPIC_PHOENIX: &str = "phoenix";

pub const EVENT_JOIN: &str = "phx_join";
pub const EVENT_LEAVE: &str = "phx_leave";
pub const EVENT_REPLY: &str = "phx_reply";
pub const EVENT_CLOSE: &str = "phx_close";
pub const EVENT_ERROR: &str = "phx_error";
pub const EVENT_HEARTBEAT: &str = "heartbeat";
pub const EVENT_BROADCAST: &str = "broadcast";
pub const EVENT_PRESENCE: &str = "presence";
pub const EVENT_PRESENCE_STATE: &str = "presence_state";
pub const EVENT_PRESENCE_DIFF: &str = "presence_diff";
pub const EVENT_POSTGRES_CHANGES: &str = "postgres_changes";

/// One frame on the realtime socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    pub topic: String,
    pub event: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(rename = "ref")]
    pub reference: Option<String>,
}

impl Frame {
    /// Channel join push. The payload carries the channel config and
    /// the user's access token, which the service uses for row level
    /// security on postgres change feeds.
    pub fn join(topic: &str, config: &ChannelConfig, access_token: &str, reference: &str) -> Frame {
        Frame {
            topic: topic.to_string(),
            event: EVENT_JOIN.to_string(),
            payload: json!({ "config": config, "access_token": access_token }),
            reference: Some(reference.to_string()),
        }
    }

    pub fn leave(topic: &str, reference: &str) -> Frame {
        Frame {
            topic: topic.to_string(),
            event: EVENT_LEAVE.to_string(),
            payload: json!({}),
            reference: Some(reference.to_string()),
        }
    }

    /// Keepalive on the reserved phoenix topic.
    pub fn heartbeat(reference: &str) -> Frame {
        Frame {
            topic: TOPIC_PHOENIX.to_string(),
            event: EVENT_HEARTBEAT.to_string(),
            payload: json!({}),
            reference: Some(reference.to_string()),
        }
    }

    /// Application broadcast push on a joined topic.
    pub fn broadcast(topic: &str, event: &str, payload: Value, reference: &str) -> Frame {
        Frame {
            topic: topic.to_string(),
            event: EVENT_BROADCAST.to_string(),
            payload: json!({ "type": "broadcast", "event": event, "payload": payload }),
            reference: Some(reference.to_string()),
        }
    }

    /// Presence track push: announces our payload under our presence key.
    pub fn presence_track(topic: &str, payload: Value, reference: &str) -> Frame {
        Frame {
            topic: topic.to_string(),
            event: EVENT_PRESENCE.to_string(),
            payload: json!({ "type": "presence", "event": "track", "payload": payload }),
            reference: Some(reference.to_string()),
        }
    }

    /// Parse a `phx_reply` payload.
    pub fn as_reply(&self) -> Option<ReplyPayload> {
        if self.event != EVENT_REPLY {
            return None;
        }
        serde_json::from_value(self.payload.clone()).ok()
    }

    /// Unwrap a `broadcast` frame into its inner event name and payload.
    pub fn as_broadcast(&self) -> Option<(String, Value)> {
        if self.event != EVENT_BROADCAST {
            return None;
        }
        let inner: BroadcastPayload = serde_json::from_value(self.payload.clone()).ok()?;
        Some((inner.event, inner.payload))
    }

    /// Parse a `postgres_changes` frame payload.
    pub fn as_postgres_change(&self) -> Option<PostgresChangeData> {
        if self.event != EVENT_POSTGRES_CHANGES {
            return None;
        }
        let outer: PostgresChangePayload = serde_json::from_value(self.payload.clone()).ok()?;
        Some(outer.data)
    }
}

/// Reply to a pushed frame.
#[derive(Debug, Deserialize)]
pub struct ReplyPayload {
    pub status: String,
    #[serde(default)]
    pub response: Value,
}

impl ReplyPayload {
    pub fn is_ok(&self) -> bool {
        self.status == "ok"
    }
}

#[derive(Debug, Deserialize)]
struct BroadcastPayload {
    event: String,
    #[serde(default)]
    payload: Value,
}

#[derive(Debug, Deserialize)]
struct PostgresChangePayload {
    data: PostgresChangeData,
}

/// One database change pushed on a postgres change feed.
#[derive(Debug, Deserialize)]
pub struct PostgresChangeData {
    #[serde(rename = "type")]
    pub change_type: String,
    pub table: Option<String>,
    pub record: Option<Value>,
}

/// Channel configuration inside the join payload.
#[derive(Debug, Clone, Serialize)]
pub struct ChannelConfig {
    pub broadcast: BroadcastOpts,
    pub presence: PresenceOpts,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub postgres_changes: Vec<PostgresChangesOpts>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BroadcastOpts {
    pub ack: bool,
    /// Deliver our own broadcasts back to us. Call channels rely on
    /// this being true; addressing is done by payload, not delivery.
    #[serde(rename = "self")]
    pub self_delivery: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct PresenceOpts {
    pub key: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PostgresChangesOpts {
    pub event: String,
    pub schema: String,
    pub table: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        ChannelConfig {
            broadcast: BroadcastOpts { ack: false, self_delivery: false },
            presence: PresenceOpts { key: String::new() },
            postgres_changes: Vec::new(),
        }
    }
}

impl ChannelConfig {
    /// Broadcast channel with self-delivery, as call channels need.
    pub fn broadcast_self() -> Self {
        ChannelConfig {
            broadcast: BroadcastOpts { ack: false, self_delivery: true },
            ..Default::default()
        }
    }

    /// Presence channel keyed by the given identifier.
    pub fn presence(key: &str) -> Self {
        ChannelConfig {
            presence: PresenceOpts { key: key.to_string() },
            ..Default::default()
        }
    }

    /// Channel subscribed to database changes.
    pub fn postgres_changes(changes: Vec<PostgresChangesOpts>) -> Self {
        ChannelConfig { postgres_changes: changes, ..Default::default() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_ref_field_name() {
        let frame = Frame::heartbeat("7");
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["topic"], "phoenix");
        assert_eq!(value["event"], "heartbeat");
        assert_eq!(value["ref"], "7");
    }

    #[test]
    fn test_join_payload_shape() {
        let config = ChannelConfig::broadcast_self();
        let frame = Frame::join("realtime:video_call_42", &config, "jwt-token", "1");
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["event"], "phx_join");
        assert_eq!(value["payload"]["access_token"], "jwt-token");
        assert_eq!(value["payload"]["config"]["broadcast"]["self"], true);
        assert_eq!(value["payload"]["config"]["broadcast"]["ack"], false);
        // No postgres_changes key when the list is empty.
        assert!(value["payload"]["config"].get("postgres_changes").is_none());
    }

    #[test]
    fn test_join_payload_with_postgres_changes() {
        let config = ChannelConfig::postgres_changes(vec![PostgresChangesOpts {
            event: "INSERT".into(),
            schema: "public".into(),
            table: "messages".into(),
            filter: Some("conversation_id=eq.42".into()),
        }]);
        let frame = Frame::join("realtime:conversation_42", &config, "t", "2");
        let value = serde_json::to_value(&frame).unwrap();
        let changes = &value["payload"]["config"]["postgres_changes"];
        assert_eq!(changes[0]["event"], "INSERT");
        assert_eq!(changes[0]["filter"], "conversation_id=eq.42");
    }

    #[test]
    fn test_parse_reply() {
        let text = r#"{
            "topic": "realtime:online_users",
            "event": "phx_reply",
            "payload": { "status": "ok", "response": {} },
            "ref": "1"
        }"#;
        let frame: Frame = serde_json::from_str(text).unwrap();
        let reply = frame.as_reply().unwrap();
        assert!(reply.is_ok());
        assert_eq!(frame.reference.as_deref(), Some("1"));
    }

    #[test]
    fn test_unwrap_broadcast() {
        let text = r#"{
            "topic": "realtime:video_call_42",
            "event": "broadcast",
            "payload": {
                "type": "broadcast",
                "event": "end-call",
                "payload": { "to": "u1" }
            },
            "ref": null
        }"#;
        let frame: Frame = serde_json::from_str(text).unwrap();
        let (event, payload) = frame.as_broadcast().unwrap();
        assert_eq!(event, "end-call");
        assert_eq!(payload["to"], "u1");
    }

    #[test]
    fn test_parse_postgres_change() {
        let text = r#"{
            "topic": "realtime:conversation_42",
            "event": "postgres_changes",
            "payload": {
                "ids": [1],
                "data": {
                    "type": "INSERT",
                    "table": "messages",
                    "record": { "id": 7, "content": "hi" }
                }
            },
            "ref": null
        }"#;
        let frame: Frame = serde_json::from_str(text).unwrap();
        let change = frame.as_postgres_change().unwrap();
        assert_eq!(change.change_type, "INSERT");
        assert_eq!(change.record.unwrap()["content"], "hi");
    }

    #[test]
    fn test_non_reply_frames_parse_as_none() {
        let frame = Frame::heartbeat("1");
        assert!(frame.as_reply().is_none());
        assert!(frame.as_broadcast().is_none());
        assert!(frame.as_postgres_change().is_none());
    }

    #[test]
    fn test_broadcast_push_wraps_payload() {
        let frame = Frame::broadcast(
            "realtime:video_call_1",
            "offer",
            serde_json::json!({ "to": "x" }),
            "3",
        );
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["payload"]["type"], "broadcast");
        assert_eq!(value["payload"]["event"], "offer");
        assert_eq!(value["payload"]["payload"]["to"], "x");
    }
}
