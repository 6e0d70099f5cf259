//! Media session controller.
//!
//! Owns the local capture stream and the peer connection for one call
//! and enforces the negotiation-order rules: the offer side never sees
//! a remote description before its answer arrives, and remote ICE
//! candidates that show up early are buffered until the remote
//! description is applied, then flushed in arrival order.

use std::sync::Arc;

use tokio::sync::mpsc;

use super::media::{MediaEngine, MediaStream, PeerConnection, PeerEvent, DEFAULT_STUN_SERVER};
use super::{CallError, CallKind, IceCandidate, SessionDescription};

pub struct MediaSession {
    engine: Arc<dyn MediaEngine>,
    kind: CallKind,
    local: Option<Arc<dyn MediaStream>>,
    peer: Option<Arc<dyn PeerConnection>>,
    muted: bool,
    remote_description_set: bool,
    pending_candidates: Vec<IceCandidate>,
    torn_down: bool,
}

impl MediaSession {
    pub fn new(engine: Arc<dyn MediaEngine>, kind: CallKind) -> Self {
        MediaSession {
            engine,
            kind,
            local: None,
            peer: None,
            muted: false,
            remote_description_set: false,
            pending_candidates: Vec::new(),
            torn_down: false,
        }
    }

    /// Switch the media kind before capture starts. An incoming offer's
    /// callType decides what the answering side captures.
    pub fn set_kind(&mut self, kind: CallKind) {
        if self.local.is_some() {
            tracing::warn!("Ignoring media kind change after capture started");
            return;
        }
        self.kind = kind;
    }

    /// Acquire local capture and build the peer connection. Peer events
    /// flow through `events` until teardown.
    pub async fn start(
        &mut self,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<(), CallError> {
        let local = self.engine.capture_local(self.kind).await?;
        tracing::debug!("Local capture acquired (video={})", local.has_video());

        let stun = vec![DEFAULT_STUN_SERVER.to_string()];
        let peer = self.engine.create_peer(&stun, local.clone(), events).await?;

        self.local = Some(local);
        self.peer = Some(peer);
        Ok(())
    }

    fn peer(&self) -> Result<&Arc<dyn PeerConnection>, CallError> {
        self.peer
            .as_ref()
            .ok_or_else(|| CallError::NegotiationFailed("no peer connection".into()))
    }

    /// Create the local offer and apply it as local description.
    pub async fn create_offer(&mut self) -> Result<SessionDescription, CallError> {
        let peer = self.peer()?;
        let offer = peer.create_offer().await?;
        peer.set_local_description(offer.clone()).await?;
        Ok(offer)
    }

    /// Apply a remote offer and produce the local answer.
    pub async fn accept_remote_offer(
        &mut self,
        offer: SessionDescription,
    ) -> Result<SessionDescription, CallError> {
        self.set_remote_description(offer).await?;
        let peer = self.peer()?;
        let answer = peer.create_answer().await?;
        peer.set_local_description(answer.clone()).await?;
        Ok(answer)
    }

    /// Apply the remote answer to our outstanding offer.
    pub async fn apply_remote_answer(
        &mut self,
        answer: SessionDescription,
    ) -> Result<(), CallError> {
        self.set_remote_description(answer).await
    }

    async fn set_remote_description(&mut self, desc: SessionDescription) -> Result<(), CallError> {
        self.peer()?.set_remote_description(desc).await?;
        self.remote_description_set = true;

        if !self.pending_candidates.is_empty() {
            tracing::debug!(
                "Flushing {} buffered ICE candidates",
                self.pending_candidates.len()
            );
        }
        let pending = std::mem::take(&mut self.pending_candidates);
        for candidate in pending {
            self.peer()?.add_ice_candidate(candidate).await?;
        }
        Ok(())
    }

    /// Feed a remote ICE candidate. Candidates arriving before the
    /// remote description are buffered, not dropped.
    pub async fn add_remote_candidate(&mut self, candidate: IceCandidate) -> Result<(), CallError> {
        if !self.remote_description_set {
            tracing::debug!("Buffering ICE candidate (no remote description yet)");
            self.pending_candidates.push(candidate);
            return Ok(());
        }
        self.peer()?.add_ice_candidate(candidate).await
    }

    /// Flip the local audio tracks. Returns the new muted state.
    /// Video tracks are unaffected.
    pub fn toggle_mute(&mut self) -> bool {
        self.muted = !self.muted;
        if let Some(local) = &self.local {
            local.set_audio_enabled(!self.muted);
        }
        tracing::info!("Microphone {}", if self.muted { "muted" } else { "unmuted" });
        self.muted
    }

    pub fn is_muted(&self) -> bool {
        self.muted
    }

    #[cfg(test)]
    pub fn buffered_candidates(&self) -> usize {
        self.pending_candidates.len()
    }

    /// Stop local tracks and close the peer connection. Safe to call in
    /// any state and more than once.
    pub async fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;

        if let Some(local) = self.local.take() {
            local.stop();
        }
        if let Some(peer) = self.peer.take() {
            peer.close().await;
        }
        self.pending_candidates.clear();
        self.remote_description_set = false;
        tracing::debug!("Media session torn down");
    }
}

#[cfg(test)]
mod tests {
    use super::super::loopback::LoopbackEngine;
    use super::*;

    fn candidate(n: u32) -> IceCandidate {
        IceCandidate {
            candidate: format!("candidate:{} 1 udp 2122260223 192.0.2.{} 54400 typ host", n, n),
            sdp_mid: Some("0".into()),
            sdp_m_line_index: Some(0),
            username_fragment: None,
        }
    }

    // Event receiver is dropped; the loopback engine tolerates that.
    fn events() -> mpsc::UnboundedSender<PeerEvent> {
        mpsc::unbounded_channel().0
    }

    #[tokio::test]
    async fn test_candidates_buffer_until_remote_description() {
        let (engine_a, engine_b) = LoopbackEngine::pair();
        let engine_a = Arc::new(engine_a);
        let engine_b = Arc::new(engine_b);

        let mut caller = MediaSession::new(engine_a.clone(), CallKind::Audio);
        caller.start(events()).await.unwrap();
        let offer = caller.create_offer().await.unwrap();

        // Candidates land before the answer.
        caller.add_remote_candidate(candidate(1)).await.unwrap();
        caller.add_remote_candidate(candidate(2)).await.unwrap();
        caller.add_remote_candidate(candidate(3)).await.unwrap();
        assert_eq!(caller.buffered_candidates(), 3);
        assert!(engine_a.last_peer().unwrap().applied_candidates().is_empty());

        let mut callee = MediaSession::new(engine_b, CallKind::Audio);
        callee.start(events()).await.unwrap();
        let answer = callee.accept_remote_offer(offer).await.unwrap();

        caller.apply_remote_answer(answer).await.unwrap();
        assert_eq!(caller.buffered_candidates(), 0);

        let applied = engine_a.last_peer().unwrap().applied_candidates();
        let numbers: Vec<&str> = applied
            .iter()
            .map(|c| c.candidate.split(' ').next().unwrap())
            .collect();
        assert_eq!(numbers, vec!["candidate:1", "candidate:2", "candidate:3"]);
    }

    #[tokio::test]
    async fn test_candidates_after_remote_description_apply_directly() {
        let (engine_a, engine_b) = LoopbackEngine::pair();
        let engine_a = Arc::new(engine_a);

        let mut caller = MediaSession::new(engine_a.clone(), CallKind::Audio);
        caller.start(events()).await.unwrap();
        let offer = caller.create_offer().await.unwrap();

        let mut callee = MediaSession::new(Arc::new(engine_b), CallKind::Audio);
        callee.start(events()).await.unwrap();
        let answer = callee.accept_remote_offer(offer).await.unwrap();
        caller.apply_remote_answer(answer).await.unwrap();

        caller.add_remote_candidate(candidate(7)).await.unwrap();
        assert_eq!(caller.buffered_candidates(), 0);
        assert_eq!(engine_a.last_peer().unwrap().applied_candidates().len(), 1);
    }

    #[tokio::test]
    async fn test_candidates_buffer_even_before_capture() {
        let (engine, _other) = LoopbackEngine::pair();
        let mut session = MediaSession::new(Arc::new(engine), CallKind::Video);

        // Ringing side: offer seen, media not started yet.
        session.add_remote_candidate(candidate(1)).await.unwrap();
        assert_eq!(session.buffered_candidates(), 1);
    }

    #[tokio::test]
    async fn test_toggle_mute_flips_audio_only() {
        let (engine, _other) = LoopbackEngine::pair();
        let engine = Arc::new(engine);
        let mut session = MediaSession::new(engine.clone(), CallKind::Video);
        session.start(events()).await.unwrap();

        let stream = engine.last_stream().unwrap();
        assert!(stream.is_audio_enabled());

        assert!(session.toggle_mute());
        assert!(session.is_muted());
        assert!(!stream.is_audio_enabled());
        assert!(stream.has_video());
        assert!(!stream.is_stopped());

        assert!(!session.toggle_mute());
        assert!(stream.is_audio_enabled());
    }

    #[tokio::test]
    async fn test_teardown_idempotent() {
        let (engine, _other) = LoopbackEngine::pair();
        let engine = Arc::new(engine);
        let mut session = MediaSession::new(engine.clone(), CallKind::Audio);
        session.start(events()).await.unwrap();

        session.teardown().await;
        let stream = engine.last_stream().unwrap();
        assert!(stream.is_stopped());
        assert!(engine.last_peer().unwrap().is_closed());

        // Second teardown is a no-op.
        session.teardown().await;
        assert!(stream.is_stopped());
    }

    #[tokio::test]
    async fn test_teardown_before_start() {
        let (engine, _other) = LoopbackEngine::pair();
        let mut session = MediaSession::new(Arc::new(engine), CallKind::Audio);
        session.teardown().await;
    }

    #[tokio::test]
    async fn test_capture_failure_maps_to_permission_denied() {
        let engine = Arc::new(LoopbackEngine::failing());
        let mut session = MediaSession::new(engine, CallKind::Video);
        match session.start(events()).await {
            Err(CallError::PermissionDenied(_)) => {}
            other => panic!("expected PermissionDenied, got {:?}", other.err()),
        }
    }
}
