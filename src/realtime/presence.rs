//! Presence tracking on the shared online-users channel.
//!
//! The service keys presence by user id (set at join time), so the
//! keys of a `presence_state` snapshot are exactly the online user
//! ids. Diffs add join keys and remove leave keys; everything else in
//! the payload (metas and refs) is irrelevant here.

use std::collections::HashSet;
use std::time::Duration;

use anyhow::Result;
use serde_json::{json, Value};
use tokio::time;

use crate::api::client::BackendClient;

use super::protocol::{ChannelConfig, EVENT_PRESENCE_DIFF, EVENT_PRESENCE_STATE};
use super::RealtimeConnection;

pub const ONLINE_USERS_TOPIC: &str = "realtime:online_users";

const SNAPSHOT_TIMEOUT: Duration = Duration::from_secs(5);

/// Which users are online, fed from presence frames.
#[derive(Debug, Default)]
pub struct PresenceTracker {
    online: HashSet<String>,
}

impl PresenceTracker {
    pub fn new() -> Self {
        PresenceTracker::default()
    }

    /// Replace the known set with a `presence_state` snapshot.
    pub fn apply_state(&mut self, payload: &Value) {
        self.online.clear();
        if let Some(map) = payload.as_object() {
            self.online.extend(map.keys().cloned());
        }
    }

    /// Apply a `presence_diff`: joins first, then leaves.
    pub fn apply_diff(&mut self, payload: &Value) {
        if let Some(joins) = payload.get("joins").and_then(|v| v.as_object()) {
            self.online.extend(joins.keys().cloned());
        }
        if let Some(leaves) = payload.get("leaves").and_then(|v| v.as_object()) {
            for key in leaves.keys() {
                self.online.remove(key);
            }
        }
    }

    /// Route a presence frame by event name. Other events are ignored.
    pub fn apply_event(&mut self, event: &str, payload: &Value) {
        match event {
            EVENT_PRESENCE_STATE => self.apply_state(payload),
            EVENT_PRESENCE_DIFF => self.apply_diff(payload),
            _ => {}
        }
    }

    pub fn is_online(&self, user_id: &str) -> bool {
        self.online.contains(user_id)
    }

    /// Online ids, sorted for stable output.
    pub fn online_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.online.iter().cloned().collect();
        ids.sort();
        ids
    }

    /// Payload announced when tracking ourselves on the channel.
    pub fn track_payload() -> Value {
        json!({ "online_at": chrono::Utc::now().to_rfc3339() })
    }
}

/// One-shot snapshot of who is online right now.
///
/// Joins the presence channel without tracking, takes the
/// `presence_state` pushed after the join, and leaves again.
pub async fn online_snapshot(client: &BackendClient) -> Result<HashSet<String>> {
    let mut conn =
        RealtimeConnection::connect(&client.realtime_url(), client.access_token()).await?;
    conn.join(ONLINE_USERS_TOPIC, ChannelConfig::presence(client.user_id())).await?;

    let mut tracker = PresenceTracker::new();
    let deadline = time::Instant::now() + SNAPSHOT_TIMEOUT;
    loop {
        let frame = match time::timeout_at(deadline, conn.recv()).await {
            Ok(result) => result?,
            Err(_) => {
                tracing::warn!("No presence snapshot within {:?}", SNAPSHOT_TIMEOUT);
                break;
            }
        };
        match frame {
            Some(frame)
                if frame.topic == ONLINE_USERS_TOPIC
                    && frame.event == EVENT_PRESENCE_STATE =>
            {
                tracker.apply_state(&frame.payload);
                break;
            }
            Some(frame) => tracing::debug!("Skipping {} while waiting for snapshot", frame.event),
            None => break,
        }
    }

    let _ = conn.leave(ONLINE_USERS_TOPIC).await;
    Ok(tracker.online.into_iter().collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_replaces_known_set() {
        let mut tracker = PresenceTracker::new();
        tracker.apply_state(&json!({
            "u1": { "metas": [{ "phx_ref": "a", "online_at": "t" }] },
            "u2": { "metas": [{ "phx_ref": "b" }] }
        }));
        assert!(tracker.is_online("u1"));
        assert!(tracker.is_online("u2"));

        tracker.apply_state(&json!({ "u3": { "metas": [] } }));
        assert!(!tracker.is_online("u1"));
        assert!(tracker.is_online("u3"));
    }

    #[test]
    fn test_diff_applies_joins_and_leaves() {
        let mut tracker = PresenceTracker::new();
        tracker.apply_state(&json!({ "u1": {}, "u2": {} }));

        tracker.apply_diff(&json!({
            "joins": { "u3": { "metas": [] } },
            "leaves": { "u1": { "metas": [] } }
        }));
        assert_eq!(tracker.online_ids(), vec!["u2", "u3"]);
    }

    #[test]
    fn test_diff_without_sections_is_noop() {
        let mut tracker = PresenceTracker::new();
        tracker.apply_state(&json!({ "u1": {} }));
        tracker.apply_diff(&json!({}));
        assert_eq!(tracker.online_ids(), vec!["u1"]);
    }

    #[test]
    fn test_apply_event_routes_by_name() {
        let mut tracker = PresenceTracker::new();
        tracker.apply_event(EVENT_PRESENCE_STATE, &json!({ "u1": {} }));
        assert!(tracker.is_online("u1"));
        tracker.apply_event(EVENT_PRESENCE_DIFF, &json!({ "leaves": { "u1": {} } }));
        assert!(!tracker.is_online("u1"));
        tracker.apply_event("broadcast", &json!({ "u9": {} }));
        assert!(!tracker.is_online("u9"));
    }

    #[test]
    fn test_track_payload_has_timestamp() {
        let payload = PresenceTracker::track_payload();
        assert!(payload["online_at"].is_string());
    }
}
