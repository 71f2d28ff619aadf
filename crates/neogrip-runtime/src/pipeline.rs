//! End-to-end run loops.
//!
//! * [`run_local`] – signal and hand in one process: Cortex stream →
//!   [`HandController`].
//! * [`run_forwarder`] – signal host side of the relay: Cortex stream →
//!   [`RelayClient`].
//!
//! Both negotiate the session first, stop as soon as the [`KillSwitch`]
//! trips or the stream ends, and always run the shutdown path: the hand is
//! stopped and released, the relay is drained, the session is torn down.

use neogrip_kernel::{HandController, KillSwitch};
use neogrip_middleware::RelayClient;
use neogrip_types::{CommandEvent, NeoError};
use tracing::{debug, error, info, warn};

use crate::session::SessionClient;
use crate::transport::RpcTransport;

/// Why a run loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The operator tripped the killswitch.
    Killswitch,
    /// Cortex closed the stream.
    StreamEnded,
}

/// Drive a local hand from the Cortex command stream.
///
/// # Errors
///
/// The first negotiation, stream or actuator error. Teardown still runs.
pub async fn run_local<T: RpcTransport>(
    session: &mut SessionClient<T>,
    hand: &mut HandController,
    killswitch: &KillSwitch,
) -> Result<StopReason, NeoError> {
    let outcome = drive_hand(session, hand, killswitch).await;

    let stopped = if killswitch.is_tripped() {
        hand.hard_stop_all()
    } else {
        hand.stop_all().await
    };
    if let Err(e) = stopped {
        error!(error = %e, "failed to stop hand");
    }
    if let Err(e) = hand.release() {
        warn!(error = %e, "failed to release servo driver");
    }
    session.shutdown().await;

    if let Err(e) = &outcome {
        error!(error = %e, "local run aborted");
    }
    outcome
}

/// Forward the Cortex command stream to the actuator host.
///
/// # Errors
///
/// The first negotiation, stream or relay error. Teardown still runs.
pub async fn run_forwarder<T: RpcTransport>(
    session: &mut SessionClient<T>,
    relay: RelayClient,
    killswitch: &KillSwitch,
) -> Result<StopReason, NeoError> {
    let outcome = forward(session, &relay, killswitch).await;

    // Sends the killswitch record first if the switch has tripped.
    let drained = relay.finish().await;
    session.shutdown().await;

    match (outcome, drained) {
        (Err(e), _) | (Ok(_), Err(e)) => {
            error!(error = %e, "forwarder aborted");
            Err(e)
        }
        (Ok(reason), Ok(())) => Ok(reason),
    }
}

async fn drive_hand<T: RpcTransport>(
    session: &mut SessionClient<T>,
    hand: &mut HandController,
    killswitch: &KillSwitch,
) -> Result<StopReason, NeoError> {
    if !negotiate(session, killswitch).await? {
        return Ok(StopReason::Killswitch);
    }
    info!("streaming mental commands to the local hand");
    loop {
        let Some(event) = next_event(session, killswitch).await? else {
            return Ok(stop_reason(killswitch));
        };
        debug!(act = %event.act, pow = event.pow, "command");
        if let Some(state) = hand.apply_command(&event).await? {
            info!(state = %state, act = %event.act, pow = event.pow, "hand moved");
        }
    }
}

async fn forward<T: RpcTransport>(
    session: &mut SessionClient<T>,
    relay: &RelayClient,
    killswitch: &KillSwitch,
) -> Result<StopReason, NeoError> {
    if !negotiate(session, killswitch).await? {
        return Ok(StopReason::Killswitch);
    }
    info!("forwarding mental commands to the actuator host");
    loop {
        let Some(event) = next_event(session, killswitch).await? else {
            return Ok(stop_reason(killswitch));
        };
        debug!(act = %event.act, pow = event.pow, "forward");
        if let Some(reason) = relay_event(relay, killswitch, event).await? {
            return Ok(reason);
        }
    }
}

/// Hand one command to the relay. A trip between reading the command and
/// queueing it ends the run as a killswitch stop, not as a relay error.
async fn relay_event(
    relay: &RelayClient,
    killswitch: &KillSwitch,
    event: CommandEvent,
) -> Result<Option<StopReason>, NeoError> {
    match relay.forward(event).await {
        Ok(()) => Ok(None),
        Err(_) if killswitch.is_tripped() => Ok(Some(stop_reason(killswitch))),
        Err(e) => Err(e),
    }
}

/// `Ok(false)` if the killswitch tripped before negotiation finished.
async fn negotiate<T: RpcTransport>(
    session: &mut SessionClient<T>,
    killswitch: &KillSwitch,
) -> Result<bool, NeoError> {
    tokio::select! {
        biased;
        _ = killswitch.tripped() => Ok(false),
        res = session.negotiate() => res.map(|()| true),
    }
}

/// Next command, or `None` when the stream ended or the killswitch tripped.
async fn next_event<T: RpcTransport>(
    session: &mut SessionClient<T>,
    killswitch: &KillSwitch,
) -> Result<Option<CommandEvent>, NeoError> {
    tokio::select! {
        biased;
        _ = killswitch.tripped() => Ok(None),
        next = session.next_command() => next,
    }
}

fn stop_reason(killswitch: &KillSwitch) -> StopReason {
    if killswitch.is_tripped() {
        info!("stopped by operator");
        StopReason::Killswitch
    } else {
        info!("Cortex stream ended");
        StopReason::StreamEnded
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Phase;
    use crate::session::tests::{ScriptedTransport, config, happy_cortex};
    use neogrip_hal::{PulseJournal, SimDriver, shared};
    use neogrip_kernel::HandControllerConfig;
    use neogrip_types::MotorConfig;
    use serde_json::json;
    use std::time::Duration;
    use tokio::io::{AsyncBufReadExt, BufReader};

    fn hand(ks: &KillSwitch) -> (HandController, PulseJournal) {
        let (sim, journal) = SimDriver::with_journal(330);
        let hand = HandController::new(
            HandControllerConfig {
                min_interval: Duration::ZERO,
                ..HandControllerConfig::default()
            },
            [("index".to_string(), MotorConfig::new(3, 2000, 3000, 1000))],
            shared(sim),
            330,
            ks.clone(),
        )
        .unwrap();
        (hand, journal)
    }

    fn com(act: &str, pow: f64) -> serde_json::Value {
        json!({ "com": [act, pow], "sid": "sess-9", "time": 1.0 })
    }

    #[tokio::test(start_paused = true)]
    async fn local_run_moves_hand_then_stops_and_tears_down() {
        let mut transport = ScriptedTransport::new(happy_cortex);
        transport.push(com("push", 0.8));
        transport.push(com("push", 0.5));
        transport.push(com("pull", 0.9));
        let sent = transport.sent.clone();
        let closed = transport.closed.clone();
        let mut session = SessionClient::new(transport, config());
        let ks = KillSwitch::new();
        let (mut hand, journal) = hand(&ks);

        let reason = run_local(&mut session, &mut hand, &ks).await.unwrap();
        assert_eq!(reason, StopReason::StreamEnded);

        // open, close, then the orderly stop (no brake from close)
        assert_eq!(journal.pulses_for(3), vec![3000, 1000, 2000]);
        assert!(journal.released());
        assert_eq!(session.phase(), Phase::Closed);
        assert!(*closed.lock().unwrap());
        let methods = ScriptedTransport::methods(&sent);
        assert_eq!(&methods[methods.len() - 2..], ["updateSession", "release"]);
    }

    #[tokio::test(start_paused = true)]
    async fn negotiation_failure_still_tears_down() {
        let transport = ScriptedTransport::new(|req| {
            if req["method"] == "queryHeadsets" {
                vec![crate::session::tests::ok(req, json!([]))]
            } else {
                happy_cortex(req)
            }
        });
        let sent = transport.sent.clone();
        let mut session = SessionClient::new(transport, config());
        let ks = KillSwitch::new();
        let (mut hand, journal) = hand(&ks);

        let err = run_local(&mut session, &mut hand, &ks).await.unwrap_err();
        assert!(matches!(err, NeoError::NoHeadset));
        assert!(journal.released());
        assert_eq!(ScriptedTransport::methods(&sent).last().unwrap(), "release");
    }

    #[tokio::test(start_paused = true)]
    async fn tripped_killswitch_hard_stops_without_negotiating() {
        let transport = ScriptedTransport::new(happy_cortex);
        let sent = transport.sent.clone();
        let mut session = SessionClient::new(transport, config());
        let ks = KillSwitch::new();
        let (mut hand, journal) = hand(&ks);
        ks.trip();

        let reason = run_local(&mut session, &mut hand, &ks).await.unwrap();
        assert_eq!(reason, StopReason::Killswitch);
        assert_eq!(journal.pulses_for(3), vec![2000]);
        assert_eq!(ScriptedTransport::methods(&sent), vec!["release"]);
    }

    #[tokio::test]
    async fn forwarder_relays_commands_then_closes() {
        let mut transport = ScriptedTransport::new(happy_cortex);
        transport.push(com("push", 0.8));
        transport.push(com("neutral", 0.1));
        let mut session = SessionClient::new(transport, config());
        let ks = KillSwitch::new();
        let (near, far) = tokio::io::duplex(4096);
        let relay = RelayClient::spawn(near, ks.clone());

        let reason = run_forwarder(&mut session, relay, &ks).await.unwrap();
        assert_eq!(reason, StopReason::StreamEnded);

        let mut lines = BufReader::new(far).lines();
        let mut acts = Vec::new();
        while let Some(line) = lines.next_line().await.unwrap() {
            let v: serde_json::Value = serde_json::from_str(&line).unwrap();
            assert_eq!(v["type"], "com");
            acts.push(v["act"].as_str().unwrap().to_string());
        }
        assert_eq!(acts, vec!["push", "neutral"]);
        assert_eq!(session.phase(), Phase::Closed);
    }

    #[tokio::test]
    async fn forwarder_sends_one_killswitch_when_tripped() {
        let mut transport = ScriptedTransport::new(happy_cortex);
        transport.push(com("push", 0.8));
        let mut session = SessionClient::new(transport, config());
        let ks = KillSwitch::new();
        let (near, far) = tokio::io::duplex(4096);
        let relay = RelayClient::spawn(near, ks.clone());
        ks.trip();

        let reason = run_forwarder(&mut session, relay, &ks).await.unwrap();
        assert_eq!(reason, StopReason::Killswitch);

        let mut lines = BufReader::new(far).lines();
        let mut all = Vec::new();
        while let Some(line) = lines.next_line().await.unwrap() {
            all.push(line);
        }
        assert_eq!(all, vec![r#"{"act":"KILLSWITCH"}"#.to_string()]);
    }

    #[tokio::test]
    async fn trip_after_reading_a_command_is_a_killswitch_stop() {
        let ks = KillSwitch::new();
        let (near, far) = tokio::io::duplex(4096);
        let relay = RelayClient::spawn(near, ks.clone());
        let event = CommandEvent::new("push", 0.8);
        ks.trip();

        let reason = relay_event(&relay, &ks, event).await.unwrap();
        assert_eq!(reason, Some(StopReason::Killswitch));
        relay.finish().await.unwrap();

        let mut lines = BufReader::new(far).lines();
        assert_eq!(
            lines.next_line().await.unwrap().as_deref(),
            Some(r#"{"act":"KILLSWITCH"}"#)
        );
        assert_eq!(lines.next_line().await.unwrap(), None);
    }

    #[tokio::test]
    async fn relay_event_queues_while_untripped() {
        let ks = KillSwitch::new();
        let (near, far) = tokio::io::duplex(4096);
        let relay = RelayClient::spawn(near, ks.clone());
        let event = CommandEvent::new("pull", 0.6);

        assert_eq!(relay_event(&relay, &ks, event).await.unwrap(), None);
        relay.finish().await.unwrap();

        let mut lines = BufReader::new(far).lines();
        let line = lines.next_line().await.unwrap().unwrap();
        let v: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(v["act"], "pull");
    }
}
