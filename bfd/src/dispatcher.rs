//
// Copyright (c) The bfdd Contributors
//
// SPDX-License-Identifier: MIT
//

// Wires the named collaborators together: decodes/encodes packets via
// `network`, drives `fsm`'s pure state-transition functions, arms/disarms
// `timers::Timer`s, and forwards the resulting events to `notify`. This is
// the only module that touches a `Session` while also touching I/O;
// everything else either does pure computation (`fsm`, `sla`) or pure
// bookkeeping (`table`).

use std::net::IpAddr;
use std::time::Duration;

use chrono::Utc;

use std::sync::Arc;

use crate::config;
use crate::error::Error;
use crate::fsm::{self, Effect};
use crate::master::{Master, ProtocolInputMsg, SockKey};
use crate::network::{self, PacketInfo};
use crate::notify::{Notification, PeerConfigNotify, PeerIdentity, PeerSlaNotify, PeerStatusNotify};
use crate::packet::{EchoPacket, Packet, PacketFlags};
use crate::session::{Session, SessionId, SessionKey};
use crate::timers::Timer;

// Entry point for a packet that just arrived off the wire: routes to the
// control or echo path based on which listening port it came in on.
pub fn on_rx_packet(
    master: &mut Master,
    sock_key: SockKey,
    info: PacketInfo,
    data: &[u8],
) -> Result<(), Error> {
    if sock_key.port == network::PORT_DST_ECHO {
        on_rx_echo_packet(master, info, data)
    } else {
        on_rx_control_packet(master, sock_key, info, data)
    }
}

fn on_rx_control_packet(
    master: &mut Master,
    sock_key: SockKey,
    info: PacketInfo,
    data: &[u8],
) -> Result<(), Error> {
    let packet = Packet::decode(data)?;
    fsm::validate_packet(&packet)?;

    let peer = info.src();
    let key = if sock_key.multihop {
        let PacketInfo::IpMultihop { dst, .. } = info else {
            return Err(Error::SessionNoMatch(peer, None));
        };
        SessionKey::new_mhop(peer, dst, String::new())
    } else {
        SessionKey::new_shop(peer, String::new())
    };

    let id = master
        .sessions
        .find_for_inbound(packet.your_discr, packet.state, peer, &key)
        .ok_or(Error::SessionNoMatch(peer, Some(packet.your_discr)))?;

    let session = master
        .sessions
        .get_mut(id)
        .expect("id returned by find_for_inbound must be valid");

    let mut effects = fsm::on_rx_packet(session, &packet, &mut master.rng);

    // Control packets only carry the measurement path's round trip while
    // echo isn't active; once echo starts, `on_rx_echo_packet` takes over
    // (see `Session::last_xmit_tv`).
    if !session.echo_active {
        let now = Utc::now();
        let latency_ms = session
            .last_xmit_tv
            .map(|sent| (now - sent).num_milliseconds().max(0) as u32);
        if let Some(latency_ms) = latency_ms {
            if let Some(effect) = fsm::observe_sla(session, latency_ms) {
                effects.push(effect);
            }
        }
    }

    apply_effects(master, id, effects)
}

fn on_rx_echo_packet(master: &mut Master, info: PacketInfo, data: &[u8]) -> Result<(), Error> {
    let echo = EchoPacket::decode(data)?;
    let peer = info.src();

    let id = master
        .sessions
        .get_by_discr(echo.local_discr)
        .filter(|s| s.echo_active)
        .map(|s| s.id)
        .ok_or(Error::SessionNoMatch(peer, Some(echo.local_discr)))?;

    let session = master.sessions.get_mut(id).expect("looked up above");
    session.counters.echo_pkt_rx += 1;

    let now = Utc::now();
    let latency_ms = session
        .last_xmit_tv
        .map(|sent| (now - sent).num_milliseconds().max(0) as u32);

    let mut effects = Vec::new();
    if let Some(detect_time) = session.echo_detect_time() {
        effects.push(Effect::RearmDetect(detect_time));
    }
    if let Some(latency_ms) = latency_ms {
        if let Some(effect) = fsm::observe_sla(session, latency_ms) {
            effects.push(effect);
        }
    }

    apply_effects(master, id, effects)
}

pub fn on_tx_timeout(master: &mut Master, id: SessionId) -> Result<(), Error> {
    let session = master
        .sessions
        .get_mut(id)
        .ok_or(Error::LookupMiss(placeholder_key()))?;

    let final_bit = false;
    let effects = vec![
        Effect::TransmitControl { final_bit },
        Effect::RearmTx(fsm::next_tx_interval(session, &mut master.rng)),
    ];
    apply_effects(master, id, effects)
}

pub fn on_detect_timeout(master: &mut Master, id: SessionId) -> Result<(), Error> {
    let session = master
        .sessions
        .get_mut(id)
        .ok_or(Error::LookupMiss(placeholder_key()))?;
    let effects = fsm::on_detect_timeout(session);
    apply_effects(master, id, effects)
}

pub fn on_echo_tx_timeout(master: &mut Master, id: SessionId) -> Result<(), Error> {
    let session = master
        .sessions
        .get_mut(id)
        .ok_or(Error::LookupMiss(placeholder_key()))?;
    if !session.echo_active {
        return Ok(());
    }

    let echo = EchoPacket {
        local_discr: session.local_discr,
    };
    let buf = echo.encode();
    let socket = master.tx_sockets.get(&id).cloned();
    if let Some(socket) = socket {
        network::send_packet(&socket, &buf, session.key.peer(), network::PORT_DST_ECHO)?;
    }

    session.counters.echo_pkt_tx += 1;
    session.last_xmit_tv = Some(Utc::now());

    let delay = session.timers.required_min_echo_rx;
    rearm_echo_tx(master, id, delay);
    Ok(())
}

pub fn on_echo_detect_timeout(master: &mut Master, id: SessionId) -> Result<(), Error> {
    let session = master
        .sessions
        .get_mut(id)
        .ok_or(Error::LookupMiss(placeholder_key()))?;
    let effects = fsm::on_echo_detect_timeout(session);
    apply_effects(master, id, effects)
}

// Carries out the side effects `fsm` functions describe: sending packets,
// (re)arming or disarming timers, and forwarding notifications.
fn apply_effects(master: &mut Master, id: SessionId, effects: Vec<Effect>) -> Result<(), Error> {
    for effect in effects {
        match effect {
            Effect::TransmitControl { final_bit } => transmit_control(master, id, final_bit)?,
            Effect::RearmTx(delay) => rearm_tx(master, id, delay),
            Effect::RearmDetect(delay) => rearm_detect(master, id, delay),
            Effect::DisarmTx => disarm_tx(master, id),
            Effect::DisarmDetect => disarm_detect(master, id),
            Effect::StartEcho => start_echo(master, id),
            Effect::StopEcho => stop_echo(master, id),
            Effect::NotifyStatus => notify_status(master, id),
            Effect::NotifySla(emit) => notify_sla(master, id, emit),
        }
    }
    Ok(())
}

fn transmit_control(master: &mut Master, id: SessionId, final_bit: bool) -> Result<(), Error> {
    let socket = master.tx_sockets.get(&id).cloned();
    let session = master
        .sessions
        .get_mut(id)
        .ok_or(Error::LookupMiss(placeholder_key()))?;

    let packet = build_control_packet(session, final_bit);
    let buf = packet.encode();
    let dst = session.key.peer();
    let port = if session.key.is_multihop() {
        network::PORT_DST_MULTIHOP
    } else {
        network::PORT_DST_SINGLE_HOP
    };

    if let Some(socket) = socket {
        network::send_packet(&socket, &buf, dst, port)?;
    }

    session.counters.control_pkt_tx += 1;
    if !session.echo_active {
        session.last_xmit_tv = Some(Utc::now());
    }
    Ok(())
}

fn build_control_packet(session: &Session, final_bit: bool) -> Packet {
    let mut flags = PacketFlags::empty();
    if final_bit {
        flags.insert(PacketFlags::F);
    } else if session
        .poll_active
        .load(std::sync::atomic::Ordering::Relaxed)
    {
        flags.insert(PacketFlags::P);
    }
    if session.demand_mode {
        flags.insert(PacketFlags::D);
    }

    Packet {
        version: Packet::VERSION,
        diag: session.local_diag as u8,
        state: session.state,
        flags,
        detect_mult: session.config.detect_mult,
        my_discr: session.local_discr,
        your_discr: session.remote.as_ref().map(|r| r.discr).unwrap_or(0),
        desired_min_tx: session.timers.curr_min_tx.as_micros() as u32,
        req_min_rx: session.timers.curr_min_rx.as_micros() as u32,
        req_min_echo_rx: session.timers.required_min_echo_rx.as_micros() as u32,
    }
}

// (Re)arms one of a session's four named timers, resetting it in place if
// already armed or spawning a fresh `Timer` otherwise. Field access is
// parameterized over plain fn pointers rather than closures so a single
// helper can serve `tx`/`rx`/`echo_tx`/`echo_rx` without overlapping a
// mutable borrow of `master.sessions` with the call to `master.arm_timer`
// (which itself borrows `master`).
fn rearm_named_timer(
    master: &mut Master,
    id: SessionId,
    delay: Duration,
    get: fn(&Session) -> &Option<Timer>,
    set: fn(&mut Session, Timer),
    make_msg: fn(SessionId) -> ProtocolInputMsg,
) {
    let has_timer = match master.sessions.get(id) {
        Some(session) => get(session).is_some(),
        None => return,
    };

    if has_timer {
        if let Some(timer) = master.sessions.get(id).and_then(|session| get(session).as_ref()) {
            timer.reset(delay);
        }
    } else {
        let timer = master.arm_timer(id, delay, || Duration::from_secs(86400), make_msg);
        if let Some(session) = master.sessions.get_mut(id) {
            set(session, timer);
        }
    }
}

fn get_t_tx(session: &Session) -> &Option<Timer> {
    &session.t_tx
}
fn set_t_tx(session: &mut Session, timer: Timer) {
    session.t_tx = Some(timer);
}
fn get_t_detect(session: &Session) -> &Option<Timer> {
    &session.t_detect
}
fn set_t_detect(session: &mut Session, timer: Timer) {
    session.t_detect = Some(timer);
}
fn get_t_echo_tx(session: &Session) -> &Option<Timer> {
    &session.t_echo_tx
}
fn set_t_echo_tx(session: &mut Session, timer: Timer) {
    session.t_echo_tx = Some(timer);
}
fn get_t_echo_detect(session: &Session) -> &Option<Timer> {
    &session.t_echo_detect
}
fn set_t_echo_detect(session: &mut Session, timer: Timer) {
    session.t_echo_detect = Some(timer);
}

fn make_tx_timeout(id: SessionId) -> ProtocolInputMsg {
    ProtocolInputMsg::TxTimeout { id }
}
fn make_detect_timeout(id: SessionId) -> ProtocolInputMsg {
    ProtocolInputMsg::DetectTimeout { id }
}
fn make_echo_tx_timeout(id: SessionId) -> ProtocolInputMsg {
    ProtocolInputMsg::EchoTxTimeout { id }
}
fn make_echo_detect_timeout(id: SessionId) -> ProtocolInputMsg {
    ProtocolInputMsg::EchoDetectTimeout { id }
}

fn rearm_tx(master: &mut Master, id: SessionId, delay: Duration) {
    rearm_named_timer(master, id, delay, get_t_tx, set_t_tx, make_tx_timeout);
}

fn rearm_detect(master: &mut Master, id: SessionId, delay: Duration) {
    rearm_named_timer(master, id, delay, get_t_detect, set_t_detect, make_detect_timeout);
}

fn rearm_echo_tx(master: &mut Master, id: SessionId, delay: Duration) {
    rearm_named_timer(master, id, delay, get_t_echo_tx, set_t_echo_tx, make_echo_tx_timeout);
}

fn start_echo(master: &mut Master, id: SessionId) {
    let (echo_tx_delay, echo_detect_delay) = match master.sessions.get(id) {
        Some(session) if session.timers.required_min_echo_rx.is_zero() => {
            // required_min_echo == 0 disables echo regardless of the
            // Echo-enabled flag.
            if let Some(session) = master.sessions.get_mut(id) {
                session.echo_active = false;
            }
            return;
        }
        Some(session) => {
            let tx_delay = session.timers.required_min_echo_rx;
            let detect_delay = session
                .echo_detect_time()
                .unwrap_or(tx_delay * session.config.detect_mult as u32);
            (tx_delay, detect_delay)
        }
        None => return,
    };

    rearm_named_timer(
        master,
        id,
        echo_tx_delay,
        get_t_echo_tx,
        set_t_echo_tx,
        make_echo_tx_timeout,
    );
    rearm_named_timer(
        master,
        id,
        echo_detect_delay,
        get_t_echo_detect,
        set_t_echo_detect,
        make_echo_detect_timeout,
    );
}

fn disarm_tx(master: &mut Master, id: SessionId) {
    if let Some(session) = master.sessions.get_mut(id) {
        session.t_tx = None;
    }
}

fn disarm_detect(master: &mut Master, id: SessionId) {
    if let Some(session) = master.sessions.get_mut(id) {
        session.t_detect = None;
    }
}

fn stop_echo(master: &mut Master, id: SessionId) {
    if let Some(session) = master.sessions.get_mut(id) {
        session.t_echo_tx = None;
        session.t_echo_detect = None;
    }
}

fn notify_status(master: &mut Master, id: SessionId) {
    if let Some(session) = master.sessions.get(id) {
        let _ = master
            .notify_tx
            .send(Notification::PeerStatus(PeerStatusNotify::from_session(session)));
    }
}

fn notify_sla(master: &mut Master, id: SessionId, emit: crate::sla::SlaEmit) {
    if let Some(session) = master.sessions.get(id) {
        let _ = master
            .notify_tx
            .send(Notification::PeerSlaUpdate(PeerSlaNotify::from_session(
                session, emit,
            )));
    }
}

// A placeholder key for `LookupMiss` errors raised against a `SessionId`
// that's already vanished from the table (the timer fired after deletion
// but before the `Timer`'s `Drop` cancelled it (a session handle
// validated against the registry at dispatch time).
fn placeholder_key() -> SessionKey {
    SessionKey::new_shop(IpAddr::from([0, 0, 0, 0]), String::new())
}

// Drains the dispatcher's input queue until the channel is closed. This is
// the single-threaded event loop: every message is
// processed to completion before the next is dequeued, so no two
// callbacks ever run concurrently against the session table.
pub async fn run(master: &mut Master) {
    while let Some(msg) = master.input_rx.recv().await {
        let result = match msg {
            ProtocolInputMsg::RxPacket {
                sock_key,
                info,
                data,
            } => on_rx_packet(master, sock_key, info, &data),
            ProtocolInputMsg::TxTimeout { id } => on_tx_timeout(master, id),
            ProtocolInputMsg::DetectTimeout { id } => on_detect_timeout(master, id),
            ProtocolInputMsg::EchoTxTimeout { id } => on_echo_tx_timeout(master, id),
            ProtocolInputMsg::EchoDetectTimeout { id } => on_echo_detect_timeout(master, id),
            ProtocolInputMsg::ApplyConfig { cfg, reply } => match apply_config(master, cfg) {
                Ok(id) => {
                    let _ = reply.send(Ok(id));
                    Ok(())
                }
                Err(error) => {
                    let _ = reply.send(Err(error.to_string()));
                    Err(error)
                }
            },
            ProtocolInputMsg::DeleteConfig { label, key, reply } => {
                match config::delete(&mut master.sessions, label.as_deref(), key.as_ref()) {
                    Ok(session) => {
                        master.tx_sockets.remove(&session.id);
                        let _ = master
                            .notify_tx
                            .send(Notification::ConfigDelete(PeerIdentity::from_session(&session)));
                        let _ = reply.send(Ok(()));
                        Ok(())
                    }
                    Err(error) => {
                        let _ = reply.send(Err(error.to_string()));
                        Err(error)
                    }
                }
            }
        };
        if let Err(error) = result {
            error.log();
        }
    }
}

// Applies a control-plane peer configuration, running it through the same
// `ConfigApplier` path admin requests always use, then carries out any
// effects it produced (e.g. a shutdown's final control packet).
fn apply_config(master: &mut Master, cfg: crate::config::PeerConfig) -> Result<SessionId, Error> {
    let already_existed = config::exists(&master.sessions, &cfg)?;

    let (id, effects) =
        config::create_or_update(&mut master.sessions, &mut master.discr_gen, cfg, &mut master.rng)?;

    ensure_tx_socket(master, id)?;
    apply_effects(master, id, effects)?;

    if let Some(session) = master.sessions.get(id) {
        let notify = PeerConfigNotify::from_session(session);
        let notification = if already_existed {
            Notification::ConfigUpdate(notify)
        } else {
            Notification::ConfigAdd(notify)
        };
        let _ = master.notify_tx.send(notification);
    }

    Ok(id)
}

// Opens the session's transmit socket the first time it's configured (the
// `ConfigApplier`'s "open a peer socket via Transport" step). A no-op on
// subsequent updates, since the socket outlives configuration changes and
// is only torn down when the session itself is deleted.
fn ensure_tx_socket(master: &mut Master, id: SessionId) -> Result<(), Error> {
    if master.tx_sockets.contains_key(&id) {
        return Ok(());
    }

    let session = match master.sessions.get(id) {
        Some(session) => session,
        None => return Ok(()),
    };
    let ttl = if session.key.is_multihop() {
        session.config.mhop_ttl
    } else {
        network::TTL_MAX
    };
    let socket = network::socket_tx(session.local_addr, ttl)?;
    master.tx_sockets.insert(id, Arc::new(socket));
    Ok(())
}
