//! Channels multiplexed over one realtime socket.
//!
//! Each join is pushed with a fresh ref and confirmed by the matching
//! `phx_reply` before the join call returns. Frames for other topics
//! arriving during a handshake are buffered, not lost.

use std::collections::VecDeque;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde_json::Value;
use tokio::time;

use super::protocol::{ChannelConfig, Frame};
use super::socket::RealtimeSocket;

const JOIN_TIMEOUT: Duration = Duration::from_secs(10);

pub struct RealtimeConnection {
    socket: RealtimeSocket,
    access_token: String,
    next_ref: u64,
    pending: VecDeque<Frame>,
}

impl RealtimeConnection {
    pub async fn connect(url: &str, access_token: &str) -> Result<Self> {
        let socket = RealtimeSocket::connect(url).await?;
        Ok(RealtimeConnection {
            socket,
            access_token: access_token.to_string(),
            next_ref: 0,
            pending: VecDeque::new(),
        })
    }

    fn take_ref(&mut self) -> String {
        self.next_ref += 1;
        self.next_ref.to_string()
    }

    /// Join a topic and wait for the service to confirm the
    /// subscription. Nothing should be pushed on the topic before this
    /// returns.
    pub async fn join(&mut self, topic: &str, config: ChannelConfig) -> Result<()> {
        let reference = self.take_ref();
        let frame = Frame::join(topic, &config, &self.access_token, &reference);
        self.socket.send_frame(&frame).await?;

        let deadline = time::Instant::now() + JOIN_TIMEOUT;
        loop {
            let frame = time::timeout_at(deadline, self.socket.recv_frame())
                .await
                .map_err(|_| anyhow::anyhow!("Timed out joining {}", topic))?
                .context("WebSocket error while joining channel")?
                .context("Connection closed while joining channel")?;

            if frame.topic == topic && frame.reference.as_deref() == Some(reference.as_str()) {
                match frame.as_reply() {
                    Some(reply) if reply.is_ok() => {
                        tracing::info!("Joined {}", topic);
                        return Ok(());
                    }
                    Some(reply) => {
                        bail!("Join of {} refused: {}", topic, reply.response)
                    }
                    None => tracing::debug!("Unexpected frame during join: {:?}", frame),
                }
            } else {
                // Traffic for already-joined topics keeps flowing while
                // we wait; hold on to it.
                self.pending.push_back(frame);
            }
        }
    }

    /// Next frame from any joined topic.
    pub async fn recv(&mut self) -> Result<Option<Frame>> {
        if let Some(frame) = self.pending.pop_front() {
            return Ok(Some(frame));
        }
        self.socket.recv_frame().await
    }

    /// Application broadcast on a joined topic.
    pub async fn broadcast(&mut self, topic: &str, event: &str, payload: Value) -> Result<()> {
        let reference = self.take_ref();
        self.socket
            .send_frame(&Frame::broadcast(topic, event, payload, &reference))
            .await
    }

    /// Announce our presence payload on a joined presence topic.
    pub async fn track_presence(&mut self, topic: &str, payload: Value) -> Result<()> {
        let reference = self.take_ref();
        self.socket
            .send_frame(&Frame::presence_track(topic, payload, &reference))
            .await
    }

    pub async fn send_heartbeat(&mut self) -> Result<()> {
        let reference = self.take_ref();
        self.socket.send_frame(&Frame::heartbeat(&reference)).await
    }

    /// Leave a topic. The reply is not waited for; the server drops the
    /// subscription either way.
    pub async fn leave(&mut self, topic: &str) -> Result<()> {
        let reference = self.take_ref();
        self.socket.send_frame(&Frame::leave(topic, &reference)).await
    }
}
