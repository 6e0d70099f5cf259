//! WebSocket connection to the realtime service.

use anyhow::{Context, Result};
use futures::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use super::protocol::Frame;

pub type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

pub struct RealtimeSocket {
    stream: WsStream,
}

impl RealtimeSocket {
    /// Open the websocket. The anon key rides in the URL; per-channel
    /// auth is carried in each join payload.
    pub async fn connect(url: &str) -> Result<Self> {
        tracing::info!("Connecting WebSocket to realtime service");
        let (stream, response) = connect_async(url)
            .await
            .context("WebSocket connection failed")?;
        tracing::info!("WebSocket connected (HTTP status {})", response.status());
        Ok(RealtimeSocket { stream })
    }

    pub async fn send_frame(&mut self, frame: &Frame) -> Result<()> {
        let text = serde_json::to_string(frame).context("Failed to serialize frame")?;
        tracing::debug!("WS send: {}", text);
        self.stream
            .send(Message::Text(text))
            .await
            .context("Failed to send WebSocket message")
    }

    /// Next protocol frame. Pings are answered inline; unparseable text
    /// is logged and skipped. Ok(None) means the connection closed.
    pub async fn recv_frame(&mut self) -> Result<Option<Frame>> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => {
                    tracing::debug!("WS recv: {}", text);
                    match serde_json::from_str::<Frame>(&text) {
                        Ok(frame) => return Ok(Some(frame)),
                        Err(e) => tracing::warn!("Unparseable frame ({}): {}", e, text),
                    }
                }
                Some(Ok(Message::Ping(data))) => {
                    self.stream
                        .send(Message::Pong(data))
                        .await
                        .context("Failed to send pong")?;
                }
                Some(Ok(Message::Close(frame))) => {
                    tracing::info!("WebSocket closed by server: {:?}", frame);
                    return Ok(None);
                }
                Some(Ok(other)) => {
                    tracing::debug!("Ignoring WebSocket frame: {:?}", other);
                }
                Some(Err(e)) => return Err(e).context("WebSocket receive error"),
                None => return Ok(None),
            }
        }
    }
}
