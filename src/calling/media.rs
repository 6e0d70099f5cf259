//! Media backend trait seam.
//!
//! The controller and negotiation code never touch a concrete media
//! stack; they talk to these traits. The loopback engine implements
//! them in-process, a platform WebRTC engine would implement them over
//! real devices and transports.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{CallError, CallKind, IceCandidate, SessionDescription};

/// Public STUN server used when no other ICE servers are configured.
pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";

/// Media track kind within a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Audio,
    Video,
}

/// Transport state of a peer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Connecting,
    Connected,
    Failed,
    Closed,
}

/// Events surfaced by a live peer connection.
#[derive(Debug, Clone)]
pub enum PeerEvent {
    /// A local ICE candidate was gathered and should be signaled.
    LocalCandidate(IceCandidate),
    /// The transport state changed.
    StateChanged(PeerState),
    /// The remote side added a media track.
    RemoteTrack { kind: TrackKind },
}

/// A local capture stream (microphone, camera).
pub trait MediaStream: Send + Sync {
    /// Enable or disable the audio tracks. Returns false if the stream
    /// has no audio track. Video tracks are never touched.
    fn set_audio_enabled(&self, enabled: bool) -> bool;

    /// Whether the stream carries a video track.
    fn has_video(&self) -> bool;

    /// Stop all tracks and release the devices. Idempotent.
    fn stop(&self);
}

/// One peer connection carrying the call media.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription, CallError>;

    async fn create_answer(&self) -> Result<SessionDescription, CallError>;

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), CallError>;

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), CallError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), CallError>;

    /// Close the transport. Idempotent.
    async fn close(&self);
}

/// Factory for capture streams and peer connections.
#[async_trait]
pub trait MediaEngine: Send + Sync {
    /// Acquire local capture. Audio is always requested; video only for
    /// video calls. Denied or missing devices map to
    /// [`CallError::PermissionDenied`].
    async fn capture_local(&self, kind: CallKind) -> Result<Arc<dyn MediaStream>, CallError>;

    /// Build a peer connection against the given STUN servers with the
    /// local stream's tracks attached. Events flow through `events`
    /// for the lifetime of the connection.
    async fn create_peer(
        &self,
        stun_servers: &[String],
        local: Arc<dyn MediaStream>,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn PeerConnection>, CallError>;
}
