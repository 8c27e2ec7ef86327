//
// Copyright (c) The bfdd Contributors
//
// SPDX-License-Identifier: MIT
//

use std::time::Duration;

use chrono::Utc;
use num_traits::FromPrimitive;
use rand::Rng;

use crate::clock::jittered_tx_interval;
use crate::debug::Debug;
use crate::error::Error;
use crate::packet::{DiagnosticCode, Packet, PacketFlags, State};
use crate::session::{Session, SessionRemoteInfo};
use crate::sla::{SlaEmit, SlaSample};

// Default period used while the session is not Up (RFC 5880's
// "BFD_DEF_SLOWTX", one second).
pub const SLOW_TX_INTERVAL: Duration = Duration::from_secs(1);

// Side effects produced by FSM processing that the dispatcher is
// responsible for carrying out (sending packets, (re)arming timers,
// starting/stopping the echo function, emitting notifications). Keeping
// the state machine itself free of I/O makes it straightforward to test.
#[derive(Debug)]
pub enum Effect {
    TransmitControl { final_bit: bool },
    RearmTx(Duration),
    RearmDetect(Duration),
    DisarmTx,
    DisarmDetect,
    StartEcho,
    StopEcho,
    NotifyStatus,
    NotifySla(SlaEmit),
}

// Validates a received control packet against RFC 5880 §6.8.6 before it's
// allowed to influence FSM state.
pub fn validate_packet(packet: &Packet) -> Result<(), Error> {
    if packet.version != Packet::VERSION {
        return Err(Error::VersionMismatch(packet.version));
    }
    if packet.detect_mult == 0 {
        return Err(crate::packet::DecodeError::InvalidDetectMult(packet.detect_mult).into());
    }
    if packet.flags.contains(PacketFlags::M) {
        return Err(crate::packet::DecodeError::InvalidFlags(packet.flags).into());
    }
    if packet.my_discr == 0 {
        return Err(crate::packet::DecodeError::InvalidMyDiscriminator(packet.my_discr).into());
    }
    if packet.your_discr == 0 && !matches!(packet.state, State::Down | State::AdminDown) {
        return Err(Error::InvalidYourDiscriminator(packet.your_discr));
    }
    Ok(())
}

// Processes an inbound, already-validated control packet against a
// session, mutating it and returning the effects the dispatcher must
// carry out.
pub fn on_rx_packet<R: Rng + ?Sized>(
    session: &mut Session,
    packet: &Packet,
    rng: &mut R,
) -> Vec<Effect> {
    let mut effects = Vec::new();
    let now = Utc::now();

    session.counters.control_pkt_rx += 1;

    let old_remote_min_tx = session.remote.as_ref().map(|r| r.min_tx);

    session.remote = Some(SessionRemoteInfo {
        discr: packet.my_discr,
        state: packet.state,
        diag: DiagnosticCode::from_u8(packet.diag).unwrap_or(DiagnosticCode::Nothing),
        demand_mode: packet.flags.contains(PacketFlags::D),
        detect_mult: packet.detect_mult,
        min_tx: Duration::from_micros(packet.desired_min_tx as u64),
        min_rx: Duration::from_micros(packet.req_min_rx as u64),
        min_echo_rx: Duration::from_micros(packet.req_min_echo_rx as u64),
        last_rx: now,
    });

    // Terminate an active Poll Sequence upon receiving the Final bit.
    if session.poll_active.load(std::sync::atomic::Ordering::Relaxed)
        && packet.flags.contains(PacketFlags::F)
    {
        session
            .poll_active
            .store(false, std::sync::atomic::Ordering::Relaxed);
        Debug::PollSequenceEnd(&session.key).log();
        session.timers.curr_min_tx = session.timers.desired_min_tx;
        session.timers.curr_min_rx = session.timers.required_min_rx;
    }

    // React to a changed remote required-min-rx per RFC 5880 §6.8.2.
    let new_remote_min_tx = session.remote.as_ref().map(|r| r.min_tx);
    if new_remote_min_tx != old_remote_min_tx {
        effects.push(Effect::RearmTx(next_tx_interval(session, rng)));
    }

    // RFC 5880 §6.8.6 terminal transition table (AdminDown is silent).
    let next = match (session.state, packet.state) {
        (State::AdminDown, _) => None,
        (State::Init | State::Up, State::AdminDown) => Some((State::Down, DiagnosticCode::NbrDown)),
        (State::Down, State::Down) => Some((State::Init, DiagnosticCode::Nothing)),
        (State::Down, State::Init) => Some((State::Up, DiagnosticCode::Nothing)),
        (State::Init, State::Init | State::Up) => Some((State::Up, DiagnosticCode::Nothing)),
        (State::Up, State::Down) => Some((State::Down, DiagnosticCode::NbrDown)),
        _ => None,
    };
    if let Some((state, diag)) = next {
        transition(session, state, diag, &mut effects);
    }

    // Computed after a possible transition so a session that just armed
    // echo on this same packet gets the echo path's (shorter) detect time.
    let detect_time = if session.echo_active {
        session.echo_detect_time()
    } else {
        session.detect_time()
    };
    if let Some(detect_time) = detect_time {
        effects.push(Effect::RearmDetect(detect_time));
    }

    if packet.flags.contains(PacketFlags::P) {
        effects.push(Effect::TransmitControl { final_bit: true });
    }

    effects
}

// Applies a detection-timer expiry. Per the reference implementation, the
// first expiry while Init/Up moves to Down; a *second* consecutive expiry
// while already Down zeroes the remote discriminator (the peer is
// considered fully gone rather than merely silent).
pub fn on_detect_timeout(session: &mut Session) -> Vec<Effect> {
    let mut effects = Vec::new();
    Debug::DetectionTimeExpiry(&session.key).log();

    match session.state {
        State::Init | State::Up => {
            transition(session, State::Down, DiagnosticCode::TimeExpired, &mut effects);
        }
        State::Down => {
            if let Some(remote) = session.remote.as_mut() {
                remote.discr = 0;
            }
            session.counters.zero_remote_discr_events += 1;
        }
        State::AdminDown => {}
    }

    effects
}

// Echo detection-timer expiry has the same effect as the control
// detection timer while Init/Up (RFC 5880 §6.8.4).
pub fn on_echo_detect_timeout(session: &mut Session) -> Vec<Effect> {
    let mut effects = Vec::new();
    Debug::EchoTimeExpiry(&session.key).log();

    if matches!(session.state, State::Init | State::Up) {
        transition(session, State::Down, DiagnosticCode::TimeExpired, &mut effects);
    }

    effects
}

// Applies an administrative shutdown: forces AdminDown, sends one last
// control packet (via `transition`'s Down|AdminDown arm), and disarms the
// transmit and detection timers so the session goes silent instead of
// continuing to send AdminDown packets forever.
pub fn apply_shutdown(session: &mut Session) -> Vec<Effect> {
    let mut effects = Vec::new();
    transition(session, State::AdminDown, DiagnosticCode::AdminDown, &mut effects);
    effects.push(Effect::DisarmTx);
    effects.push(Effect::DisarmDetect);
    effects
}

// Clears an administrative shutdown, returning the session to Down and
// re-arming timers.
pub fn clear_shutdown<R: Rng + ?Sized>(session: &mut Session, rng: &mut R) -> Vec<Effect> {
    let mut effects = Vec::new();
    transition(session, State::Down, DiagnosticCode::Nothing, &mut effects);
    effects.push(Effect::RearmTx(next_tx_interval(session, rng)));
    if session.echo_active {
        effects.push(Effect::StartEcho);
    }
    effects
}

// Performs a state transition, applying the side effects described in
// ("Session becomes Up" / "Session becomes Down") and appending
// the resulting effects. A notify fires for transitions into or out of
// Up or AdminDown (the Up<->Down and Down<->AdminDown classes NotifyOut
// documents); a plain Down<->Init handshake step stays silent.
fn transition(session: &mut Session, new_state: State, diag: DiagnosticCode, effects: &mut Vec<Effect>) {
    let old_state = session.state;
    if old_state == new_state {
        return;
    }

    Debug::FsmTransition(&session.key, old_state, new_state).log();

    match new_state {
        State::Up => {
            session.local_diag = DiagnosticCode::Nothing;
            session.poll_active.store(true, std::sync::atomic::Ordering::Relaxed);
            Debug::PollSequenceStart(&session.key).log();
            session.uptime = Some(Utc::now());
            session.counters.session_up_events += 1;

            let peer_echo_capable = session
                .remote
                .as_ref()
                .map(|r| r.min_echo_rx > Duration::ZERO)
                .unwrap_or(false);
            if session.config.echo && peer_echo_capable && !session.key.is_multihop() {
                session.echo_active = true;
                effects.push(Effect::StartEcho);
            }
            effects.push(Effect::TransmitControl { final_bit: false });
        }
        State::Down | State::AdminDown => {
            session.downtime = Some(Utc::now());
            session.last_down_diag = diag;
            if let Some(remote) = session.remote.as_mut() {
                remote.discr = 0;
            }
            session.demand_mode = false;
            session
                .poll_active
                .store(false, std::sync::atomic::Ordering::Relaxed);
            session.counters.session_down_events += 1;
            if session.echo_active {
                session.echo_active = false;
                effects.push(Effect::StopEcho);
            }
            effects.push(Effect::TransmitControl { final_bit: false });
        }
        State::Init => {}
    }

    session.local_diag = diag;
    session.state = new_state;

    let crosses_up = old_state == State::Up || new_state == State::Up;
    let crosses_admin_down = old_state == State::AdminDown || new_state == State::AdminDown;
    if crosses_up || crosses_admin_down {
        effects.push(Effect::NotifyStatus);
    }
}

// Computes the transmit period currently in effect: `BFD_DEF_SLOWTX`
// outside Up, or `max(up_min_tx, peer.required_min_rx)` while Up, then
// jitters it per RFC 5880 §6.8.2/§6.8.7.
pub fn next_tx_interval<R: Rng + ?Sized>(session: &Session, rng: &mut R) -> Duration {
    let nominal = if session.is_up() {
        let peer_req_min_rx = session
            .remote
            .as_ref()
            .map(|r| r.min_rx)
            .unwrap_or(Duration::ZERO);
        session.timers.curr_min_tx.max(peer_req_min_rx)
    } else {
        SLOW_TX_INTERVAL
    };

    jittered_tx_interval(rng, nominal, session.config.detect_mult)
}

// Feeds a completed round-trip into the session's SLA meter, if enabled,
// returning a notify effect when a cycle boundary is reached.
pub fn observe_sla(session: &mut Session, latency_ms: u32) -> Option<Effect> {
    if !session.config.track_sla {
        return None;
    }

    let total_rx = session.counters.control_pkt_rx as u32 + session.counters.echo_pkt_rx as u32;
    let total_tx = session.counters.control_pkt_tx as u32 + session.counters.echo_pkt_tx as u32;

    session
        .sla
        .observe(SlaSample {
            latency_ms,
            total_rx_pkts: total_rx,
            total_tx_pkts: total_tx,
            detect_mult: session.config.detect_mult,
        })
        .map(Effect::NotifySla)
}
