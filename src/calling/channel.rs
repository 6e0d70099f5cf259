//! Signaling channel for one call.
//!
//! The channel is broadcast: every subscriber receives every signal,
//! including the sender's own. Addressing is the `to` field alone, so
//! [`SignalChannel::recv`] drops anything not addressed to the local
//! endpoint. Joining completes before the channel is handed out, which
//! keeps signals from being sent into a subscription that does not
//! exist yet.

use async_trait::async_trait;

use crate::api::client::BackendClient;
use crate::realtime::protocol::{self, ChannelConfig};
use crate::realtime::RealtimeConnection;

use super::{CallError, SignalMessage};

/// Transport carrying signals for one call channel.
///
/// Implementations deliver every broadcast to every subscriber, the
/// sender included. Addressing happens above, in [`SignalChannel`].
#[async_trait]
pub trait SignalTransport: Send {
    async fn send(&mut self, message: &SignalMessage) -> Result<(), CallError>;

    /// Next signal on the channel, addressed to anyone.
    /// Ok(None) means the channel is gone.
    async fn recv(&mut self) -> Result<Option<SignalMessage>, CallError>;

    async fn close(&mut self) -> Result<(), CallError>;

    /// Keepalive tick. Transports without heartbeats ignore it.
    async fn heartbeat(&mut self) -> Result<(), CallError> {
        Ok(())
    }
}

/// Call signaling endpoint: a transport plus the local `to` filter.
pub struct SignalChannel {
    transport: Box<dyn SignalTransport>,
    local_id: String,
    closed: bool,
}

impl SignalChannel {
    pub fn new(transport: Box<dyn SignalTransport>, local_id: impl Into<String>) -> Self {
        SignalChannel { transport, local_id: local_id.into(), closed: false }
    }

    /// Broadcast a signal to the channel.
    pub async fn send(&mut self, message: SignalMessage) -> Result<(), CallError> {
        tracing::debug!("Signal out: {} to {}", message.event_name(), message.to());
        self.transport.send(&message).await
    }

    /// Next signal addressed to this endpoint. Traffic for other
    /// endpoints, our own echoes included, is dropped here.
    pub async fn recv(&mut self) -> Result<Option<SignalMessage>, CallError> {
        loop {
            match self.transport.recv().await? {
                Some(msg) if msg.to() == self.local_id => {
                    tracing::debug!("Signal in: {}", msg.event_name());
                    return Ok(Some(msg));
                }
                Some(msg) => {
                    tracing::debug!(
                        "Dropping {} addressed to {}",
                        msg.event_name(),
                        msg.to()
                    );
                }
                None => return Ok(None),
            }
        }
    }

    pub async fn heartbeat(&mut self) -> Result<(), CallError> {
        self.transport.heartbeat().await
    }

    /// Leave the channel. Idempotent.
    pub async fn close(&mut self) -> Result<(), CallError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.transport.close().await
    }
}

/// Signal transport over a realtime broadcast channel.
///
/// One websocket connection, one joined topic named after the
/// conversation. Self-delivery is on so both endpoints can share the
/// topic and filter by `to`.
pub struct RealtimeSignalTransport {
    conn: RealtimeConnection,
    topic: String,
}

impl RealtimeSignalTransport {
    /// Connect and join the per-conversation call topic. Returns only
    /// once the service confirms the subscription.
    pub async fn open(client: &BackendClient, conversation_id: i64) -> anyhow::Result<Self> {
        let topic = format!("realtime:video_call_{}", conversation_id);
        let mut conn =
            RealtimeConnection::connect(&client.realtime_url(), client.access_token()).await?;
        conn.join(&topic, ChannelConfig::broadcast_self()).await?;
        Ok(RealtimeSignalTransport { conn, topic })
    }
}

fn lost(err: anyhow::Error) -> CallError {
    CallError::ChannelLost(format!("{:#}", err))
}

#[async_trait]
impl SignalTransport for RealtimeSignalTransport {
    async fn send(&mut self, message: &SignalMessage) -> Result<(), CallError> {
        let value = serde_json::to_value(message)
            .map_err(|e| CallError::ChannelLost(e.to_string()))?;
        let payload = value
            .get("payload")
            .cloned()
            .unwrap_or(serde_json::Value::Null);
        self.conn
            .broadcast(&self.topic, message.event_name(), payload)
            .await
            .map_err(lost)
    }

    async fn recv(&mut self) -> Result<Option<SignalMessage>, CallError> {
        loop {
            let frame = match self.conn.recv().await.map_err(lost)? {
                Some(frame) => frame,
                None => return Ok(None),
            };
            if frame.topic != self.topic {
                tracing::debug!("Ignoring frame for {}", frame.topic);
                continue;
            }
            match frame.event.as_str() {
                protocol::EVENT_BROADCAST => {
                    if let Some((event, payload)) = frame.as_broadcast() {
                        match SignalMessage::from_parts(&event, payload) {
                            Some(msg) => return Ok(Some(msg)),
                            None => {
                                tracing::debug!("Ignoring unknown broadcast event '{}'", event)
                            }
                        }
                    }
                }
                protocol::EVENT_CLOSE | protocol::EVENT_ERROR => {
                    tracing::warn!("Call channel closed by server ({})", frame.event);
                    return Ok(None);
                }
                other => tracing::debug!("Ignoring {} on call channel", other),
            }
        }
    }

    async fn close(&mut self) -> Result<(), CallError> {
        self.conn.leave(&self.topic).await.map_err(lost)
    }

    async fn heartbeat(&mut self) -> Result<(), CallError> {
        self.conn.send_heartbeat().await.map_err(lost)
    }
}

#[cfg(test)]
mod tests {
    use super::super::loopback::loopback_pair;
    use super::super::SessionDescription;
    use super::*;

    #[tokio::test]
    async fn test_recv_filters_by_addressee() {
        let (ta, tb) = loopback_pair();
        let mut a = SignalChannel::new(Box::new(ta), "a");
        let mut b = SignalChannel::new(Box::new(tb), "b");

        // Traffic for a third endpoint, then one for b.
        a.send(SignalMessage::EndCall { to: "zzz".into() }).await.unwrap();
        a.send(SignalMessage::Offer {
            to: "b".into(),
            offer: SessionDescription::offer("v=0"),
            call_type: None,
        })
        .await
        .unwrap();

        let got = b.recv().await.unwrap().unwrap();
        assert_eq!(got.event_name(), "offer");
        assert_eq!(got.to(), "b");
    }

    #[tokio::test]
    async fn test_own_echo_is_dropped() {
        let (ta, tb) = loopback_pair();
        let mut a = SignalChannel::new(Box::new(ta), "a");
        let mut b = SignalChannel::new(Box::new(tb), "b");

        // a's own send echoes back to a but must not surface there.
        a.send(SignalMessage::EndCall { to: "b".into() }).await.unwrap();
        b.send(SignalMessage::EndCall { to: "a".into() }).await.unwrap();

        // The first thing a sees is b's signal, not its own echo.
        let got = a.recv().await.unwrap().unwrap();
        assert_eq!(got.to(), "a");
    }

    #[tokio::test]
    async fn test_close_idempotent() {
        let (ta, _tb) = loopback_pair();
        let mut a = SignalChannel::new(Box::new(ta), "a");
        a.close().await.unwrap();
        a.close().await.unwrap();
    }
}
