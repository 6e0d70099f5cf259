//! Realtime WebSocket client
//!
//! Connects to the backend's Phoenix-style realtime service to receive
//! pushed database changes, presence updates and broadcast events.

pub mod channel;
pub mod presence;
pub mod protocol;
pub mod socket;

pub use channel::RealtimeConnection;

use anyhow::{Context, Result};
use std::time::{Duration, Instant};
use tokio::time;

use crate::api::client::BackendClient;
use crate::models::{Message, Profile};
use presence::PresenceTracker;

/// Reason the inner listen loop exited.
enum DisconnectReason {
    /// Clean shutdown (Ctrl+C). Do not reconnect.
    Shutdown,
    /// Error or server-initiated close. Should reconnect.
    Error(anyhow::Error),
}

/// Follow a conversation live: print messages as they are inserted and
/// report when the other participant goes online or offline.
///
/// On transient errors or server-initiated disconnects, reconnects with
/// exponential backoff (1s, 2s, 4s, ... capped at 64s). On clean shutdown
/// (Ctrl+C), exits immediately.
pub async fn listen_conversation(conversation_id: i64, peer: &Profile) -> Result<()> {
    let mut backoff = 1u64;

    loop {
        match listen_inner(conversation_id, peer).await {
            Ok(DisconnectReason::Shutdown) => {
                return Ok(());
            }
            Ok(DisconnectReason::Error(e)) => {
                // Connection was stable (>60s), reset backoff before reconnecting.
                backoff = 1;
                tracing::warn!(
                    "Realtime disconnected after stable session: {:#}. Reconnecting in 1s...",
                    e,
                );

                tokio::select! {
                    _ = time::sleep(Duration::from_secs(1)) => {}
                    _ = tokio::signal::ctrl_c() => {
                        println!("Shutting down...");
                        return Ok(());
                    }
                }
            }
            Err(e) => {
                tracing::warn!(
                    "Realtime disconnected: {:#}. Reconnecting in {}s...",
                    e,
                    backoff
                );

                tokio::select! {
                    _ = time::sleep(Duration::from_secs(backoff)) => {}
                    _ = tokio::signal::ctrl_c() => {
                        println!("Shutting down...");
                        return Ok(());
                    }
                }

                backoff = (backoff * 2).min(64);
            }
        }
    }
}

/// Run one listen session: connect, join channels, event loop.
///
/// Returns `DisconnectReason::Shutdown` on clean Ctrl+C, or
/// `DisconnectReason::Error` when the connection should be retried.
async fn listen_inner(conversation_id: i64, peer: &Profile) -> Result<DisconnectReason> {
    // Rebuild the client each attempt so reconnects pick up refreshed tokens.
    let client = BackendClient::new().await?;
    let own_id = client.user_id().to_string();

    let mut conn = RealtimeConnection::connect(&client.realtime_url(), client.access_token())
        .await
        .context("Failed to connect to realtime service")?;

    // Channel 1: database changes for this conversation's messages.
    let conversation_topic = format!("realtime:conversation_{}", conversation_id);
    let changes = vec![protocol::PostgresChangesOpts {
        event: "INSERT".to_string(),
        schema: "public".to_string(),
        table: "messages".to_string(),
        filter: Some(format!("conversation_id=eq.{}", conversation_id)),
    }];
    conn.join(&conversation_topic, protocol::ChannelConfig::postgres_changes(changes))
        .await?;

    // Channel 2: shared presence channel, keyed by our user id.
    conn.join(presence::ONLINE_USERS_TOPIC, protocol::ChannelConfig::presence(&own_id))
        .await?;
    conn.track_presence(presence::ONLINE_USERS_TOPIC, PresenceTracker::track_payload())
        .await?;

    let mut tracker = PresenceTracker::new();
    let mut peer_online = false;

    let connected_at = Instant::now();
    let mut heartbeat = time::interval(Duration::from_secs(30));
    heartbeat.tick().await; // skip first immediate tick

    // Stability threshold: reset backoff after 60s of successful connection.
    let stability_threshold = Duration::from_secs(60);

    println!("Listening for messages... (Ctrl-C to stop)");

    let disconnect_reason = loop {
        tokio::select! {
            frame = conn.recv() => {
                match frame {
                    Ok(Some(frame)) => handle_listen_frame(
                        &frame,
                        &conversation_topic,
                        &own_id,
                        peer,
                        &mut tracker,
                        &mut peer_online,
                    ),
                    Ok(None) => {
                        break DisconnectReason::Error(anyhow::anyhow!("WebSocket closed by server"));
                    }
                    Err(e) => {
                        break DisconnectReason::Error(e.context("WebSocket recv error"));
                    }
                }
            }
            _ = heartbeat.tick() => {
                if let Err(e) = conn.send_heartbeat().await {
                    break DisconnectReason::Error(e.context("Heartbeat send failed"));
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!("Shutting down...");
                break DisconnectReason::Shutdown;
            }
        }
    };

    // A session that outlived the threshold returns Ok either way so the
    // caller resets its backoff.
    if connected_at.elapsed() >= stability_threshold {
        return Ok(disconnect_reason);
    }

    match disconnect_reason {
        DisconnectReason::Shutdown => Ok(DisconnectReason::Shutdown),
        DisconnectReason::Error(e) => Err(e),
    }
}

/// Handle one pushed frame on the listen connection.
fn handle_listen_frame(
    frame: &protocol::Frame,
    conversation_topic: &str,
    own_id: &str,
    peer: &Profile,
    tracker: &mut PresenceTracker,
    peer_online: &mut bool,
) {
    if frame.topic == conversation_topic {
        let change = match frame.as_postgres_change() {
            Some(c) => c,
            None => {
                tracing::debug!("Ignoring {} frame on {}", frame.event, frame.topic);
                return;
            }
        };
        if change.change_type != "INSERT" || change.table.as_deref() != Some("messages") {
            return;
        }
        let record = match change.record {
            Some(r) => r,
            None => return,
        };
        match serde_json::from_value::<Message>(record) {
            Ok(msg) => print_live_message(&msg, own_id, peer),
            Err(e) => tracing::warn!("Unparseable message record: {:#}", e),
        }
        return;
    }

    if frame.topic == presence::ONLINE_USERS_TOPIC {
        tracker.apply_event(&frame.event, &frame.payload);
        tracing::debug!("Online now: {:?}", tracker.online_ids());
        let now_online = tracker.is_online(&peer.id);
        if now_online != *peer_online {
            *peer_online = now_online;
            let state = if now_online { "online" } else { "offline" };
            println!("[presence] {} is {}", peer.display_name(), state);
        }
        return;
    }

    tracing::debug!("Frame on topic {}: {}", frame.topic, frame.event);
}

fn print_live_message(msg: &Message, own_id: &str, peer: &Profile) {
    let sender = if msg.user_id == own_id {
        "me".to_string()
    } else {
        peer.display_name()
    };
    if msg.is_image {
        println!("[{}] {}: [image] {}", msg.short_time(), sender, msg.content);
    } else {
        println!("[{}] {}: {}", msg.short_time(), sender, msg.content);
    }
}
