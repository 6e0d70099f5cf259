//! In-process loopback backends.
//!
//! Stand-ins for platform media and for the realtime channel, used by
//! the self-call harness and the unit tests. The media engine hands out
//! peer connections that share a bus; a pair reaches Connected once
//! both ends have applied both session descriptions, which exercises
//! the same ordering rules a real transport would. The signal transport
//! is a broadcast bus with self-delivery, like the realtime channel.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;
use uuid::Uuid;

use super::media::{
    MediaEngine, MediaStream, PeerConnection, PeerEvent, PeerState, TrackKind,
};
use super::{CallError, CallKind, IceCandidate, SessionDescription, SignalMessage};

/// Local capture stream with toggleable audio.
pub struct LoopbackStream {
    audio_enabled: AtomicBool,
    video: bool,
    stopped: AtomicBool,
}

impl LoopbackStream {
    fn new(kind: CallKind) -> Self {
        LoopbackStream {
            audio_enabled: AtomicBool::new(true),
            video: kind == CallKind::Video,
            stopped: AtomicBool::new(false),
        }
    }

    #[cfg(test)]
    pub fn is_audio_enabled(&self) -> bool {
        self.audio_enabled.load(Ordering::SeqCst)
    }

    #[cfg(test)]
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

impl MediaStream for LoopbackStream {
    fn set_audio_enabled(&self, enabled: bool) -> bool {
        self.audio_enabled.store(enabled, Ordering::SeqCst);
        true
    }

    fn has_video(&self) -> bool {
        self.video
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}

struct EndState {
    local_set: bool,
    remote_set: bool,
    has_video: bool,
    events: mpsc::UnboundedSender<PeerEvent>,
}

struct Bus {
    expected: usize,
    connected: bool,
    ends: Vec<EndState>,
}

impl Bus {
    /// Once every expected end has both descriptions applied, tell all
    /// of them the transport came up.
    fn maybe_connect(&mut self) {
        if self.connected
            || self.ends.len() < self.expected
            || !self.ends.iter().all(|e| e.local_set && e.remote_set)
        {
            return;
        }
        self.connected = true;
        for (i, end) in self.ends.iter().enumerate() {
            let other = &self.ends[(i + 1) % self.ends.len()];
            let _ = end.events.send(PeerEvent::StateChanged(PeerState::Connecting));
            let _ = end.events.send(PeerEvent::StateChanged(PeerState::Connected));
            let _ = end.events.send(PeerEvent::RemoteTrack { kind: TrackKind::Audio });
            if other.has_video {
                let _ = end.events.send(PeerEvent::RemoteTrack { kind: TrackKind::Video });
            }
        }
    }
}

/// Peer connection backed by the shared bus.
pub struct LoopbackPeer {
    bus: Arc<Mutex<Bus>>,
    end: usize,
    video: bool,
    closed: AtomicBool,
    applied: Mutex<Vec<IceCandidate>>,
}

impl LoopbackPeer {
    /// Minimal but plausible SDP for this end.
    fn sdp_body(&self) -> String {
        let ufrag: String = Uuid::new_v4().simple().to_string()[..8].to_string();
        let mut sdp = format!(
            "v=0\r\no=- {} 0 IN IP4 127.0.0.1\r\ns=loopback\r\nt=0 0\r\n\
             a=ice-ufrag:{}\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\n",
            Uuid::new_v4().simple(),
            ufrag
        );
        if self.video {
            sdp.push_str("m=video 9 UDP/TLS/RTP/SAVPF 96\r\n");
        }
        sdp
    }

    fn check_open(&self) -> Result<(), CallError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(CallError::ConnectivityFailed("peer connection closed".into()));
        }
        Ok(())
    }

    /// Emit fake gathered candidates, as a real stack would after the
    /// local description is applied.
    fn gather_candidates(&self) {
        let bus = self.bus.lock().unwrap();
        let events = &bus.ends[self.end].events;
        for (n, typ) in [(1u32, "host"), (2, "srflx")] {
            let _ = events.send(PeerEvent::LocalCandidate(IceCandidate {
                candidate: format!(
                    "candidate:{} 1 udp {} 127.0.0.1 {} typ {}",
                    n,
                    2122260223u32 >> n,
                    50000 + n,
                    typ
                ),
                sdp_mid: Some("0".into()),
                sdp_m_line_index: Some(0),
                username_fragment: None,
            }));
        }
    }

    #[cfg(test)]
    pub fn applied_candidates(&self) -> Vec<IceCandidate> {
        self.applied.lock().unwrap().clone()
    }

    #[cfg(test)]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PeerConnection for LoopbackPeer {
    async fn create_offer(&self) -> Result<SessionDescription, CallError> {
        self.check_open()?;
        Ok(SessionDescription::offer(self.sdp_body()))
    }

    async fn create_answer(&self) -> Result<SessionDescription, CallError> {
        self.check_open()?;
        Ok(SessionDescription::answer(self.sdp_body()))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), CallError> {
        self.check_open()?;
        if desc.sdp.is_empty() {
            return Err(CallError::NegotiationFailed("empty local description".into()));
        }
        {
            let mut bus = self.bus.lock().unwrap();
            bus.ends[self.end].local_set = true;
            bus.maybe_connect();
        }
        self.gather_candidates();
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), CallError> {
        self.check_open()?;
        if desc.sdp.is_empty() {
            return Err(CallError::NegotiationFailed("empty remote description".into()));
        }
        let mut bus = self.bus.lock().unwrap();
        bus.ends[self.end].remote_set = true;
        bus.maybe_connect();
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), CallError> {
        self.check_open()?;
        self.applied.lock().unwrap().push(candidate);
        Ok(())
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let bus = self.bus.lock().unwrap();
        let _ = bus.ends[self.end].events.send(PeerEvent::StateChanged(PeerState::Closed));
    }
}

/// In-process media engine.
pub struct LoopbackEngine {
    bus: Arc<Mutex<Bus>>,
    fail_capture: bool,
    last_stream: Mutex<Option<Arc<LoopbackStream>>>,
    last_peer: Mutex<Option<Arc<LoopbackPeer>>>,
}

impl LoopbackEngine {
    /// Engine for a single endpoint. Its peer connection self-connects
    /// once both descriptions are applied locally.
    pub fn new() -> Self {
        Self::with_bus(
            Arc::new(Mutex::new(Bus { expected: 1, connected: false, ends: Vec::new() })),
            false,
        )
    }

    /// Two engines sharing a bus. Their peer connections reach
    /// Connected together, once both ends applied both descriptions.
    pub fn pair() -> (Self, Self) {
        let bus = Arc::new(Mutex::new(Bus { expected: 2, connected: false, ends: Vec::new() }));
        (Self::with_bus(bus.clone(), false), Self::with_bus(bus, false))
    }

    /// Engine whose capture always fails, for permission-denied paths.
    #[cfg(test)]
    pub fn failing() -> Self {
        Self::with_bus(
            Arc::new(Mutex::new(Bus { expected: 1, connected: false, ends: Vec::new() })),
            true,
        )
    }

    fn with_bus(bus: Arc<Mutex<Bus>>, fail_capture: bool) -> Self {
        LoopbackEngine {
            bus,
            fail_capture,
            last_stream: Mutex::new(None),
            last_peer: Mutex::new(None),
        }
    }

    #[cfg(test)]
    pub fn last_stream(&self) -> Option<Arc<LoopbackStream>> {
        self.last_stream.lock().unwrap().clone()
    }

    #[cfg(test)]
    pub fn last_peer(&self) -> Option<Arc<LoopbackPeer>> {
        self.last_peer.lock().unwrap().clone()
    }
}

impl Default for LoopbackEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MediaEngine for LoopbackEngine {
    async fn capture_local(&self, kind: CallKind) -> Result<Arc<dyn MediaStream>, CallError> {
        if self.fail_capture {
            return Err(CallError::PermissionDenied("capture device unavailable".into()));
        }
        let stream = Arc::new(LoopbackStream::new(kind));
        *self.last_stream.lock().unwrap() = Some(stream.clone());
        Ok(stream)
    }

    async fn create_peer(
        &self,
        _stun_servers: &[String],
        local: Arc<dyn MediaStream>,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn PeerConnection>, CallError> {
        let end = {
            let mut bus = self.bus.lock().unwrap();
            bus.ends.push(EndState {
                local_set: false,
                remote_set: false,
                has_video: local.has_video(),
                events,
            });
            bus.ends.len() - 1
        };
        let peer = Arc::new(LoopbackPeer {
            bus: self.bus.clone(),
            end,
            video: local.has_video(),
            closed: AtomicBool::new(false),
            applied: Mutex::new(Vec::new()),
        });
        *self.last_peer.lock().unwrap() = Some(peer.clone());
        Ok(peer)
    }
}

/// Linked pair of broadcast signal transports. Every send is delivered
/// to both ends, the sender included, like the realtime channel with
/// self-delivery on.
pub fn loopback_pair() -> (LoopbackTransport, LoopbackTransport) {
    let (tx_a, rx_a) = mpsc::unbounded_channel();
    let (tx_b, rx_b) = mpsc::unbounded_channel();
    (
        LoopbackTransport {
            peers: vec![tx_a.clone(), tx_b.clone()],
            inbox: rx_a,
            closed: false,
        },
        LoopbackTransport { peers: vec![tx_a, tx_b], inbox: rx_b, closed: false },
    )
}

pub struct LoopbackTransport {
    peers: Vec<mpsc::UnboundedSender<SignalMessage>>,
    inbox: mpsc::UnboundedReceiver<SignalMessage>,
    closed: bool,
}

#[async_trait]
impl super::channel::SignalTransport for LoopbackTransport {
    async fn send(&mut self, message: &SignalMessage) -> Result<(), CallError> {
        if self.closed {
            return Err(CallError::ChannelLost("transport closed".into()));
        }
        for peer in &self.peers {
            // A closed far end just misses the broadcast.
            let _ = peer.send(message.clone());
        }
        Ok(())
    }

    async fn recv(&mut self) -> Result<Option<SignalMessage>, CallError> {
        if self.closed {
            return Ok(None);
        }
        Ok(self.inbox.recv().await)
    }

    async fn close(&mut self) -> Result<(), CallError> {
        self.closed = true;
        self.peers.clear();
        self.inbox.close();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{timeout, Duration};

    async fn next_state(rx: &mut mpsc::UnboundedReceiver<PeerEvent>) -> PeerState {
        loop {
            let event = timeout(Duration::from_secs(1), rx.recv())
                .await
                .expect("timed out waiting for peer event")
                .expect("event channel closed");
            if let PeerEvent::StateChanged(state) = event {
                return state;
            }
        }
    }

    #[tokio::test]
    async fn test_pair_connects_after_full_exchange() {
        let (ea, eb) = LoopbackEngine::pair();
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();

        let stream_a = ea.capture_local(CallKind::Video).await.unwrap();
        let peer_a = ea.create_peer(&[], stream_a, tx_a).await.unwrap();
        let stream_b = eb.capture_local(CallKind::Video).await.unwrap();
        let peer_b = eb.create_peer(&[], stream_b, tx_b).await.unwrap();

        let offer = peer_a.create_offer().await.unwrap();
        peer_a.set_local_description(offer.clone()).await.unwrap();
        peer_b.set_remote_description(offer).await.unwrap();
        let answer = peer_b.create_answer().await.unwrap();
        peer_b.set_local_description(answer.clone()).await.unwrap();

        // Nothing is connected until the last description lands.
        assert!(rx_a.try_recv().is_ok()); // candidate events only
        peer_a.set_remote_description(answer).await.unwrap();

        assert_eq!(next_state(&mut rx_a).await, PeerState::Connecting);
        assert_eq!(next_state(&mut rx_a).await, PeerState::Connected);
        assert_eq!(next_state(&mut rx_b).await, PeerState::Connecting);
        assert_eq!(next_state(&mut rx_b).await, PeerState::Connected);
    }

    #[tokio::test]
    async fn test_local_description_triggers_candidate_gathering() {
        let engine = LoopbackEngine::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let stream = engine.capture_local(CallKind::Audio).await.unwrap();
        let peer = engine.create_peer(&[], stream, tx).await.unwrap();

        let offer = peer.create_offer().await.unwrap();
        assert!(offer.sdp.contains("m=audio"));
        assert!(!offer.sdp.contains("m=video"));
        peer.set_local_description(offer).await.unwrap();

        match rx.recv().await {
            Some(PeerEvent::LocalCandidate(c)) => assert!(c.candidate.starts_with("candidate:")),
            other => panic!("expected candidate, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_video_offer_includes_video_section() {
        let engine = LoopbackEngine::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let stream = engine.capture_local(CallKind::Video).await.unwrap();
        let peer = engine.create_peer(&[], stream, tx).await.unwrap();
        let offer = peer.create_offer().await.unwrap();
        assert!(offer.sdp.contains("m=video"));
    }

    #[tokio::test]
    async fn test_operations_fail_after_close() {
        let engine = LoopbackEngine::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let stream = engine.capture_local(CallKind::Audio).await.unwrap();
        let peer = engine.create_peer(&[], stream, tx).await.unwrap();
        peer.close().await;
        peer.close().await;
        assert!(peer.create_offer().await.is_err());
    }
}
