//! Call negotiation.
//!
//! [`CallMachine`] is a pure state machine: inputs go in, a list of
//! actions comes out, and no I/O happens inside. [`CallDriver`] owns
//! the machine together with the signaling channel and the media
//! session and executes the actions.
//!
//! When both users start a call at the same time the tie is broken
//! deterministically: endpoint identifiers are compared as strings and
//! the lexically smaller one sends the offer. Both sides evaluate the
//! same rule, so they always agree on who the caller is.

use std::collections::VecDeque;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::mpsc;
use tokio::time;

use super::channel::SignalChannel;
use super::media::{PeerEvent, PeerState};
use super::session::MediaSession;
use super::{
    CallError, CallKind, CallRole, CallStatus, EndReason, IceCandidate, SessionDescription,
    SignalMessage,
};

/// How long an offer may go unanswered before the call is abandoned.
const ANSWER_TIMEOUT: Duration = Duration::from_secs(30);
/// Parked timer deadline, effectively unarmed.
const TIMER_IDLE: Duration = Duration::from_secs(86400);

/// Input to the negotiation machine.
#[derive(Debug)]
pub enum CallInput {
    /// The local user wants the call to happen.
    Start,
    /// The local user accepts a ringing call.
    Accept,
    /// The local user declines a ringing call. Local-only: the offer
    /// is dropped and the caller keeps waiting until its timeout.
    Decline,
    /// The local user hangs up.
    HangUp,
    /// A signal addressed to us arrived on the channel.
    Signal(SignalMessage),
    /// The peer transport changed state.
    Peer(PeerState),
    /// The driver finished publishing the offer.
    OfferSent,
    /// The driver finished publishing the answer.
    AnswerSent,
    /// The unanswered-offer timer fired.
    AnswerTimeout,
}

/// Side effect for the driver to execute.
#[derive(Debug, Clone, PartialEq)]
pub enum CallAction {
    /// Acquire media, create the peer, send the offer.
    SendOffer { kind: CallKind },
    /// Acquire media, apply the stored offer, send the answer.
    SendAnswer { offer: SessionDescription, kind: CallKind },
    /// Apply the remote answer to the media session.
    ApplyAnswer(SessionDescription),
    /// Feed a remote ICE candidate to the media session.
    ApplyCandidate(IceCandidate),
    /// Broadcast end-call addressed to the remote endpoint.
    SendEndCall,
    /// Tear down the media session.
    Teardown,
    /// Arm the unanswered-offer timer.
    ArmAnswerTimer,
    /// Park the unanswered-offer timer.
    CancelAnswerTimer,
    /// Tell the user a call is ringing.
    NotifyRinging { kind: CallKind },
    /// Tell the user the call went active.
    NotifyActive,
    /// The ringing call was declined; the machine is idle again.
    NotifyDeclined,
}

pub struct CallMachine {
    local_id: String,
    remote_id: String,
    kind: CallKind,
    status: CallStatus,
    role: Option<CallRole>,
    wants_call: bool,
    pending_offer: Option<SessionDescription>,
    pending_kind: CallKind,
    ended: Option<EndReason>,
}

impl CallMachine {
    pub fn new(local_id: &str, remote_id: &str, kind: CallKind) -> Self {
        CallMachine {
            local_id: local_id.to_string(),
            remote_id: remote_id.to_string(),
            kind,
            status: CallStatus::Idle,
            role: None,
            wants_call: false,
            pending_offer: None,
            pending_kind: kind,
            ended: None,
        }
    }

    pub fn status(&self) -> CallStatus {
        self.status
    }

    pub fn role(&self) -> Option<CallRole> {
        self.role
    }

    pub fn remote_id(&self) -> &str {
        &self.remote_id
    }

    /// Why the call ended, once it has.
    pub fn end_reason(&self) -> Option<EndReason> {
        self.ended
    }

    /// Simultaneous-start tie-break: the endpoint with the lexically
    /// smaller identifier sends the offer.
    pub fn local_initiates(&self) -> bool {
        self.local_id < self.remote_id
    }

    /// End the call from outside the transition table, used by the
    /// driver when executing an action fails.
    pub fn force_end(&mut self, reason: EndReason) {
        self.end(reason);
    }

    fn end(&mut self, reason: EndReason) {
        self.status = CallStatus::Ended;
        self.ended = Some(reason);
    }

    /// Advance the machine. Returns the actions the driver must run, in
    /// order.
    pub fn handle(&mut self, input: CallInput) -> Vec<CallAction> {
        match input {
            CallInput::Start => self.on_start(),
            CallInput::Accept => self.on_accept(),
            CallInput::Decline => self.on_decline(),
            CallInput::HangUp => self.on_hang_up(),
            CallInput::AnswerTimeout => self.on_answer_timeout(),
            CallInput::Signal(signal) => match signal {
                SignalMessage::Offer { offer, call_type, .. } => self.on_offer(offer, call_type),
                SignalMessage::Answer { answer, .. } => self.on_answer(answer),
                SignalMessage::IceCandidate { candidate, .. } => self.on_candidate(candidate),
                SignalMessage::EndCall { .. } => self.on_end_call(),
            },
            CallInput::Peer(state) => self.on_peer(state),
            CallInput::OfferSent => self.on_offer_sent(),
            CallInput::AnswerSent => self.on_answer_sent(),
        }
    }

    fn on_start(&mut self) -> Vec<CallAction> {
        if self.status != CallStatus::Idle {
            tracing::debug!("Ignoring start in {:?}", self.status);
            return vec![];
        }
        self.wants_call = true;
        if self.local_initiates() {
            self.role = Some(CallRole::Caller);
            self.status = CallStatus::Requesting;
            vec![CallAction::SendOffer { kind: self.kind }, CallAction::ArmAnswerTimer]
        } else {
            // The remote id is smaller, so the offer is theirs to send.
            // Stay idle until it arrives, with the same timeout.
            self.role = Some(CallRole::Receiver);
            tracing::debug!("Remote endpoint initiates; waiting for its offer");
            vec![CallAction::ArmAnswerTimer]
        }
    }

    fn on_accept(&mut self) -> Vec<CallAction> {
        if self.status != CallStatus::Ringing {
            tracing::debug!("Ignoring accept in {:?}", self.status);
            return vec![];
        }
        let offer = match self.pending_offer.take() {
            Some(offer) => offer,
            None => {
                tracing::warn!("Ringing without a stored offer");
                return vec![];
            }
        };
        self.status = CallStatus::Connecting;
        vec![CallAction::SendAnswer { offer, kind: self.pending_kind }]
    }

    fn on_offer_sent(&mut self) -> Vec<CallAction> {
        if self.status == CallStatus::Requesting {
            self.status = CallStatus::Connecting;
        } else {
            tracing::debug!("Offer sent in {:?}", self.status);
        }
        vec![]
    }

    fn on_answer_sent(&mut self) -> Vec<CallAction> {
        if self.status == CallStatus::Connecting && self.role == Some(CallRole::Receiver) {
            self.status = CallStatus::Active;
            vec![CallAction::NotifyActive]
        } else {
            tracing::debug!("Answer sent in {:?}", self.status);
            vec![]
        }
    }

    fn on_decline(&mut self) -> Vec<CallAction> {
        if self.status != CallStatus::Ringing {
            tracing::debug!("Ignoring decline in {:?}", self.status);
            return vec![];
        }
        // Nothing goes on the wire and media is never touched. The
        // caller finds out when its own timer expires. The machine
        // returns to idle, so a later offer rings again.
        self.pending_offer = None;
        self.pending_kind = self.kind;
        self.role = None;
        self.wants_call = false;
        self.status = CallStatus::Idle;
        vec![CallAction::NotifyDeclined]
    }

    fn on_hang_up(&mut self) -> Vec<CallAction> {
        match self.status {
            CallStatus::Ended => vec![],
            // Hanging up on a ringing call is a decline.
            CallStatus::Ringing => self.on_decline(),
            CallStatus::Idle if !self.wants_call => {
                self.end(EndReason::LocalHangup);
                vec![CallAction::Teardown]
            }
            _ => {
                self.end(EndReason::LocalHangup);
                vec![
                    CallAction::CancelAnswerTimer,
                    CallAction::SendEndCall,
                    CallAction::Teardown,
                ]
            }
        }
    }

    fn on_answer_timeout(&mut self) -> Vec<CallAction> {
        match (self.status, self.role) {
            // Our offer went out (or is still going out) and no answer
            // came back. Tell the other side to stop ringing and clean
            // up.
            (CallStatus::Requesting | CallStatus::Connecting, Some(CallRole::Caller)) => {
                self.end(EndReason::AnswerTimeout);
                vec![CallAction::SendEndCall, CallAction::Teardown]
            }
            (CallStatus::Idle, _) if self.wants_call => {
                // We were waiting for the initiator's offer and it
                // never came. Nothing was signaled, nothing to end.
                self.end(EndReason::AnswerTimeout);
                vec![CallAction::Teardown]
            }
            _ => vec![],
        }
    }

    fn on_offer(
        &mut self,
        offer: SessionDescription,
        call_type: Option<CallKind>,
    ) -> Vec<CallAction> {
        match self.status {
            CallStatus::Idle => {
                self.role = Some(CallRole::Receiver);
                self.pending_kind = call_type.unwrap_or(CallKind::Video);
                self.pending_offer = Some(offer);
                self.status = CallStatus::Ringing;
                vec![
                    CallAction::CancelAnswerTimer,
                    CallAction::NotifyRinging { kind: self.pending_kind },
                ]
            }
            CallStatus::Ringing => {
                // A fresh offer while we ring replaces the stored one;
                // accepting uses the latest.
                tracing::debug!("Replacing pending offer");
                if let Some(kind) = call_type {
                    self.pending_kind = kind;
                }
                self.pending_offer = Some(offer);
                vec![]
            }
            _ => {
                tracing::warn!("Ignoring offer in {:?}", self.status);
                vec![]
            }
        }
    }

    fn on_answer(&mut self, answer: SessionDescription) -> Vec<CallAction> {
        if self.status != CallStatus::Connecting || self.role != Some(CallRole::Caller) {
            tracing::debug!("Ignoring answer in {:?}", self.status);
            return vec![];
        }
        // The answer makes the call: the transport keeps negotiating
        // underneath, but both endpoints treat the call as up from
        // here.
        self.status = CallStatus::Active;
        vec![
            CallAction::CancelAnswerTimer,
            CallAction::ApplyAnswer(answer),
            CallAction::NotifyActive,
        ]
    }

    fn on_candidate(&mut self, candidate: IceCandidate) -> Vec<CallAction> {
        match self.status {
            CallStatus::Requesting
            | CallStatus::Ringing
            | CallStatus::Connecting
            | CallStatus::Active => vec![CallAction::ApplyCandidate(candidate)],
            _ => {
                tracing::debug!("Dropping candidate in {:?}", self.status);
                vec![]
            }
        }
    }

    fn on_end_call(&mut self) -> Vec<CallAction> {
        match self.status {
            CallStatus::Ended => vec![],
            // An idle endpoint with no call attempt has nothing to
            // end; a parked glare side (wants_call) stops waiting.
            CallStatus::Idle if !self.wants_call => vec![],
            _ => {
                self.end(EndReason::RemoteEnded);
                vec![CallAction::CancelAnswerTimer, CallAction::Teardown]
            }
        }
    }

    // Transport state is telemetry for the status: the call goes
    // active on the answer, like the signaling exchange it mirrors.
    // Failures and silent closes still end it.
    fn on_peer(&mut self, state: PeerState) -> Vec<CallAction> {
        match (self.status, state) {
            (
                CallStatus::Requesting | CallStatus::Connecting | CallStatus::Active,
                PeerState::Failed,
            ) => {
                self.end(EndReason::ConnectionFailed);
                vec![
                    CallAction::CancelAnswerTimer,
                    CallAction::SendEndCall,
                    CallAction::Teardown,
                ]
            }
            (CallStatus::Connecting | CallStatus::Active, PeerState::Closed) => {
                // The transport went away underneath us without an
                // end-call signal.
                self.end(EndReason::ConnectionFailed);
                vec![
                    CallAction::CancelAnswerTimer,
                    CallAction::SendEndCall,
                    CallAction::Teardown,
                ]
            }
            _ => {
                tracing::debug!("Peer state {:?} in {:?}", state, self.status);
                vec![]
            }
        }
    }
}

/// Knobs for one call run.
#[derive(Debug, Clone, Copy, Default)]
pub struct CallOptions {
    /// Start the call on entry instead of waiting for an offer.
    pub place_call: bool,
    /// Accept an incoming ring without asking.
    pub auto_accept: bool,
    /// Hang up on Ctrl-C.
    pub ctrl_c: bool,
}

/// What a finished call looked like.
#[derive(Debug)]
pub struct CallOutcome {
    pub reason: EndReason,
    pub role: Option<CallRole>,
    /// Whether the call reached the active state at some point.
    pub connected: bool,
    pub muted: bool,
    pub candidates_sent: usize,
    pub candidates_received: usize,
}

/// Runtime commands for a running call.
#[derive(Debug, Clone, Copy)]
pub enum CallCommand {
    ToggleMute,
    HangUp,
}

/// Cloneable handle to poke a running call from another task.
#[derive(Clone)]
pub struct CallHandle {
    tx: mpsc::UnboundedSender<CallCommand>,
}

impl CallHandle {
    pub fn toggle_mute(&self) {
        let _ = self.tx.send(CallCommand::ToggleMute);
    }

    pub fn hang_up(&self) {
        let _ = self.tx.send(CallCommand::HangUp);
    }
}

/// Runs one call to completion: executes machine actions, pumps the
/// signaling channel, the peer events and the command handle.
pub struct CallDriver {
    machine: CallMachine,
    channel: SignalChannel,
    session: MediaSession,
    options: CallOptions,
    commands_tx: mpsc::UnboundedSender<CallCommand>,
    commands: mpsc::UnboundedReceiver<CallCommand>,
}

impl CallDriver {
    pub fn new(
        machine: CallMachine,
        channel: SignalChannel,
        session: MediaSession,
        options: CallOptions,
    ) -> Self {
        let (commands_tx, commands) = mpsc::unbounded_channel();
        CallDriver { machine, channel, session, options, commands_tx, commands }
    }

    /// Handle for injecting commands while the call runs.
    pub fn handle(&self) -> CallHandle {
        CallHandle { tx: self.commands_tx.clone() }
    }

    pub async fn run(self) -> Result<CallOutcome> {
        let CallDriver {
            mut machine,
            mut channel,
            mut session,
            options,
            commands_tx,
            mut commands,
        } = self;
        // Held so the command channel never closes under the select loop.
        let _commands_tx = commands_tx;

        let (peer_tx, mut peer_events) = mpsc::unbounded_channel();
        let remote_id = machine.remote_id().to_string();

        let mut connected = false;
        let mut declined = false;
        let mut candidates_sent = 0usize;
        let mut candidates_received = 0usize;
        let mut peer_gone = false;
        let mut ctrl_c_armed = options.ctrl_c;

        let mut answer_deadline = Box::pin(time::sleep(TIMER_IDLE));
        let mut heartbeat = time::interval(Duration::from_secs(30));
        heartbeat.tick().await;

        let mut queue: VecDeque<CallAction> = VecDeque::new();
        if options.place_call {
            queue.extend(machine.handle(CallInput::Start));
        }

        loop {
            // Drain pending actions before waiting for the next event.
            while let Some(action) = queue.pop_front() {
                match action {
                    CallAction::ArmAnswerTimer => {
                        answer_deadline
                            .as_mut()
                            .reset(time::Instant::now() + ANSWER_TIMEOUT);
                    }
                    CallAction::CancelAnswerTimer => {
                        answer_deadline.as_mut().reset(time::Instant::now() + TIMER_IDLE);
                    }
                    CallAction::NotifyRinging { kind } => {
                        println!("Incoming {} call from {}...", kind, remote_id);
                        if options.auto_accept {
                            queue.extend(machine.handle(CallInput::Accept));
                        }
                    }
                    CallAction::NotifyActive => {
                        connected = true;
                        println!(
                            "Call active.{}",
                            if ctrl_c_armed { " Ctrl-C to hang up." } else { "" }
                        );
                    }
                    CallAction::NotifyDeclined => {
                        // Machine is idle again; this call run is over.
                        declined = true;
                    }
                    CallAction::SendOffer { kind } => {
                        if let Err(e) =
                            send_offer(&mut session, &mut channel, &remote_id, kind, &peer_tx)
                                .await
                        {
                            // Nothing went out on the wire; abort quietly.
                            tracing::warn!("Could not place call: {}", e);
                            machine.force_end(reason_for(&e));
                            session.teardown().await;
                            let _ = channel.close().await;
                            return Err(e.into());
                        }
                        tracing::info!("Offer sent to {}", remote_id);
                        queue.extend(machine.handle(CallInput::OfferSent));
                    }
                    CallAction::SendAnswer { offer, kind } => {
                        if let Err(e) = send_answer(
                            &mut session,
                            &mut channel,
                            &remote_id,
                            offer,
                            kind,
                            &peer_tx,
                        )
                        .await
                        {
                            tracing::warn!("Could not accept call: {}", e);
                            // The caller is waiting on us; tell it the
                            // call is off. No answer was ever sent.
                            let _ = channel
                                .send(SignalMessage::EndCall { to: remote_id.clone() })
                                .await;
                            machine.force_end(reason_for(&e));
                            session.teardown().await;
                            let _ = channel.close().await;
                            return Err(e.into());
                        }
                        tracing::info!("Answer sent to {}", remote_id);
                        queue.extend(machine.handle(CallInput::AnswerSent));
                    }
                    CallAction::ApplyAnswer(answer) => {
                        if let Err(e) = session.apply_remote_answer(answer).await {
                            tracing::warn!("Remote answer failed to apply: {}", e);
                            let _ = channel
                                .send(SignalMessage::EndCall { to: remote_id.clone() })
                                .await;
                            machine.force_end(EndReason::MediaFailed);
                            // Anything still queued assumed the answer
                            // applied.
                            queue.clear();
                            queue.push_back(CallAction::Teardown);
                        }
                    }
                    CallAction::ApplyCandidate(candidate) => {
                        candidates_received += 1;
                        if let Err(e) = session.add_remote_candidate(candidate).await {
                            // A bad candidate is not fatal to the call.
                            tracing::warn!("Discarding ICE candidate: {}", e);
                        }
                    }
                    CallAction::SendEndCall => {
                        let msg = SignalMessage::EndCall { to: remote_id.clone() };
                        if let Err(e) = channel.send(msg).await {
                            tracing::warn!("Could not send end-call: {}", e);
                        }
                    }
                    CallAction::Teardown => session.teardown().await,
                }
            }

            if machine.status() == CallStatus::Ended || declined {
                break;
            }

            tokio::select! {
                signal = channel.recv() => match signal {
                    Ok(Some(msg)) => queue.extend(machine.handle(CallInput::Signal(msg))),
                    Ok(None) => {
                        tracing::warn!("Signaling channel closed");
                        machine.force_end(EndReason::ConnectionFailed);
                        queue.push_back(CallAction::Teardown);
                    }
                    Err(e) => {
                        tracing::warn!("Signaling channel error: {}", e);
                        machine.force_end(EndReason::ConnectionFailed);
                        queue.push_back(CallAction::Teardown);
                    }
                },
                event = peer_events.recv(), if !peer_gone => match event {
                    Some(PeerEvent::LocalCandidate(candidate)) => {
                        let msg = SignalMessage::IceCandidate {
                            to: remote_id.clone(),
                            candidate,
                        };
                        match channel.send(msg).await {
                            Ok(()) => candidates_sent += 1,
                            Err(e) => tracing::warn!("Could not send ICE candidate: {}", e),
                        }
                    }
                    Some(PeerEvent::RemoteTrack { kind }) => {
                        tracing::info!("Remote {:?} track added", kind);
                    }
                    Some(PeerEvent::StateChanged(state)) => {
                        tracing::debug!("Peer state: {:?}", state);
                        queue.extend(machine.handle(CallInput::Peer(state)));
                    }
                    None => {
                        // Engine dropped its event sender without a close.
                        peer_gone = true;
                        queue.extend(machine.handle(CallInput::Peer(PeerState::Failed)));
                    }
                },
                command = commands.recv() => match command {
                    Some(CallCommand::ToggleMute) => {
                        session.toggle_mute();
                    }
                    Some(CallCommand::HangUp) => {
                        queue.extend(machine.handle(CallInput::HangUp));
                    }
                    None => {}
                },
                _ = &mut answer_deadline => {
                    queue.extend(machine.handle(CallInput::AnswerTimeout));
                    answer_deadline.as_mut().reset(time::Instant::now() + TIMER_IDLE);
                }
                _ = heartbeat.tick() => {
                    if let Err(e) = channel.heartbeat().await {
                        tracing::warn!("Heartbeat failed: {}", e);
                    }
                }
                result = tokio::signal::ctrl_c(), if ctrl_c_armed => match result {
                    Ok(()) if machine.status() == CallStatus::Ringing => {
                        println!("Declining...");
                        queue.extend(machine.handle(CallInput::Decline));
                    }
                    Ok(()) => {
                        println!("Hanging up...");
                        queue.extend(machine.handle(CallInput::HangUp));
                    }
                    Err(e) => {
                        tracing::warn!("Ctrl-C handler unavailable: {}", e);
                        ctrl_c_armed = false;
                    }
                },
            }
        }

        let _ = channel.close().await;

        let reason = if declined {
            EndReason::Declined
        } else {
            machine.end_reason().unwrap_or(EndReason::LocalHangup)
        };

        Ok(CallOutcome {
            reason,
            role: machine.role(),
            connected,
            muted: session.is_muted(),
            candidates_sent,
            candidates_received,
        })
    }
}

async fn send_offer(
    session: &mut MediaSession,
    channel: &mut SignalChannel,
    remote_id: &str,
    kind: CallKind,
    peer_tx: &mpsc::UnboundedSender<PeerEvent>,
) -> Result<(), CallError> {
    session.start(peer_tx.clone()).await?;
    let offer = session.create_offer().await?;
    channel
        .send(SignalMessage::Offer {
            to: remote_id.to_string(),
            offer,
            call_type: Some(kind),
        })
        .await
}

async fn send_answer(
    session: &mut MediaSession,
    channel: &mut SignalChannel,
    remote_id: &str,
    offer: SessionDescription,
    kind: CallKind,
    peer_tx: &mpsc::UnboundedSender<PeerEvent>,
) -> Result<(), CallError> {
    session.set_kind(kind);
    session.start(peer_tx.clone()).await?;
    let answer = session.accept_remote_offer(offer).await?;
    channel
        .send(SignalMessage::Answer { to: remote_id.to_string(), answer })
        .await
}

fn reason_for(err: &CallError) -> EndReason {
    match err {
        CallError::PermissionDenied(_) | CallError::NegotiationFailed(_) => EndReason::MediaFailed,
        CallError::ConnectivityFailed(_) | CallError::ChannelLost(_) => {
            EndReason::ConnectionFailed
        }
    }
}
