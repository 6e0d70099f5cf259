//! Self-call harness.
//!
//! Runs a complete call between two in-process endpoints: loopback
//! signal transport, loopback media engines, and the real negotiation
//! machinery in between. The caller endpoint toggles mute halfway
//! through and hangs up at the end, so one run exercises offer, answer,
//! trickled candidates, mute and teardown.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::time;

use super::loopback::{loopback_pair, LoopbackEngine};
use super::negotiation::{CallDriver, CallMachine, CallOptions, CallOutcome};
use super::session::MediaSession;
use super::{CallKind, CallRole, EndReason, SignalChannel};

/// Half the requested duration, when the mid-call mute fires.
fn halfway_point(duration_secs: u64) -> Duration {
    Duration::from_millis(duration_secs.saturating_mul(500))
}

/// Result of a loopback self-call.
#[derive(Debug)]
pub struct CallTestResult {
    pub caller: CallOutcome,
    pub callee: CallOutcome,
}

impl CallTestResult {
    /// Both ends connected and shut down for the expected reasons.
    pub fn passed(&self) -> bool {
        self.caller.connected
            && self.callee.connected
            && self.caller.role == Some(CallRole::Caller)
            && self.callee.role == Some(CallRole::Receiver)
            && self.caller.reason == EndReason::LocalHangup
            && self.callee.reason == EndReason::RemoteEnded
    }
}

pub async fn run_call_test(duration_secs: u64, audio_only: bool) -> Result<CallTestResult> {
    let kind = if audio_only { CallKind::Audio } else { CallKind::Video };
    // "loop-a" sorts below "loop-b", so the a side sends the offer.
    let caller_id = "loop-a";
    let callee_id = "loop-b";

    println!();
    println!("=== Call Test (loopback self-call) ===");
    println!("Caller:   {}", caller_id);
    println!("Callee:   {}", callee_id);
    println!("Kind:     {}", kind);
    println!("Duration: {}s", duration_secs);
    println!();

    let (transport_a, transport_b) = loopback_pair();
    let (engine_a, engine_b) = LoopbackEngine::pair();

    let callee_driver = CallDriver::new(
        CallMachine::new(callee_id, caller_id, kind),
        SignalChannel::new(Box::new(transport_b), callee_id),
        MediaSession::new(Arc::new(engine_b), kind),
        CallOptions { auto_accept: true, ..Default::default() },
    );
    let callee_task = tokio::spawn(callee_driver.run());

    let caller_driver = CallDriver::new(
        CallMachine::new(caller_id, callee_id, kind),
        SignalChannel::new(Box::new(transport_a), caller_id),
        MediaSession::new(Arc::new(engine_a), kind),
        CallOptions { place_call: true, ..Default::default() },
    );
    let handle = caller_driver.handle();

    // Mute halfway through, hang up at the end.
    let half = halfway_point(duration_secs);
    let choreography = tokio::spawn(async move {
        time::sleep(half).await;
        handle.toggle_mute();
        time::sleep(half).await;
        handle.hang_up();
    });

    let caller = match caller_driver.run().await {
        Ok(outcome) => outcome,
        Err(e) => {
            callee_task.abort();
            return Err(e.context("Caller side failed"));
        }
    };
    let callee = callee_task
        .await
        .context("Callee task panicked")?
        .context("Callee side failed")?;
    choreography.await.ok();

    let result = CallTestResult { caller, callee };

    println!();
    println!("caller_connected={}", result.caller.connected);
    println!("callee_connected={}", result.callee.connected);
    println!("mute_toggled={}", result.caller.muted);
    println!("candidates_sent_caller={}", result.caller.candidates_sent);
    println!("candidates_received_caller={}", result.caller.candidates_received);
    println!("candidates_sent_callee={}", result.callee.candidates_sent);
    println!("candidates_received_callee={}", result.callee.candidates_received);
    println!("caller_result={}", result.caller.reason);
    println!("callee_result={}", result.callee.reason);
    println!("passed={}", result.passed());

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_loopback_self_call_completes() {
        let result = run_call_test(1, false).await.unwrap();
        assert!(result.passed(), "self-call failed: {:?}", result);
        assert!(result.caller.muted);
        assert!(result.caller.candidates_sent >= 2);
        assert!(result.callee.candidates_sent >= 2);
        assert_eq!(result.caller.candidates_received, result.callee.candidates_sent);
    }

    #[tokio::test]
    async fn test_audio_only_self_call() {
        let result = run_call_test(1, true).await.unwrap();
        assert!(result.passed(), "audio self-call failed: {:?}", result);
    }

    #[test]
    fn test_halfway_point_survives_huge_durations() {
        assert_eq!(halfway_point(6), Duration::from_secs(3));
        assert_eq!(halfway_point(u64::MAX), Duration::from_millis(u64::MAX));
    }
}
