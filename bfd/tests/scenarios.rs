//
// Copyright (c) The bfdd Contributors
//
// SPDX-License-Identifier: MIT
//
// End-to-end seed scenarios exercising `config`, `table` and `fsm`
// together, independent of the tokio runtime the dispatcher drives them
// with in production (`fsm` is pure, so these scenarios poke it directly
// the same way the dispatcher's `apply_effects` would).

use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::Ordering;

use rand::rngs::SmallRng;
use rand::SeedableRng;

use bfd::clock::DiscriminatorGen;
use bfd::config::{self, PeerConfig};
use bfd::error::Error;
use bfd::fsm::{self, Effect};
use bfd::packet::{DiagnosticCode, Packet, PacketFlags, State};
use bfd::table::Sessions;

fn rng() -> SmallRng {
    SmallRng::seed_from_u64(7)
}

fn peer_config(peer: IpAddr) -> PeerConfig {
    PeerConfig {
        peer_address: peer,
        local_address: None,
        multihop: false,
        local_interface: Some("eth0".to_string()),
        vrf_name: None,
        discriminator: None,
        detect_multiplier: 3,
        receive_interval: 300,
        transmit_interval: 300,
        echo_interval: 50,
        echo_mode: false,
        shutdown: false,
        create_only: false,
        label: None,
        track_sla: false,
    }
}

fn control_packet(state: State, my_discr: u32, your_discr: u32) -> Packet {
    Packet {
        version: Packet::VERSION,
        diag: 0,
        state,
        flags: PacketFlags::empty(),
        detect_mult: 3,
        my_discr,
        your_discr,
        desired_min_tx: 300_000,
        req_min_rx: 300_000,
        req_min_echo_rx: 0,
    }
}

// S1: bring-up. A fresh session starts Down; a peer packet reporting
// Down moves it to Init and learns the remote discriminator; a
// follow-up packet reporting Init completes the handshake to Up, which
// starts a Poll Sequence and emits a status notify.
#[test]
fn s1_bring_up_drives_down_to_up() {
    let mut sessions = Sessions::new();
    let mut discr_gen = DiscriminatorGen::new();
    let mut rng = rng();

    let peer = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2));
    let (id, create_effects) =
        config::create_or_update(&mut sessions, &mut discr_gen, peer_config(peer), &mut rng)
            .unwrap();
    assert_eq!(sessions.get(id).unwrap().state, State::Down);
    // A fresh, non-shutdown session must have its transmit timer armed, or
    // it can never send the first packet of the handshake.
    assert!(create_effects
        .iter()
        .any(|e| matches!(e, Effect::RearmTx(_))));

    let session = sessions.get_mut(id).unwrap();
    let down_pkt = control_packet(State::Down, 0x77, 0);
    fsm::validate_packet(&down_pkt).unwrap();
    let effects = fsm::on_rx_packet(session, &down_pkt, &mut rng);
    assert_eq!(session.state, State::Init);
    assert_eq!(session.remote.as_ref().unwrap().discr, 0x77);
    assert!(effects.iter().any(|e| matches!(e, Effect::RearmTx(_))));

    let my_discr = session.local_discr;
    let init_pkt = control_packet(State::Init, 0x77, my_discr);
    fsm::validate_packet(&init_pkt).unwrap();
    let effects = fsm::on_rx_packet(session, &init_pkt, &mut rng);
    assert_eq!(session.state, State::Up);
    assert!(session.poll_active.load(Ordering::Relaxed));
    assert!(effects.iter().any(|e| matches!(e, Effect::NotifyStatus)));
    assert!(effects
        .iter()
        .any(|e| matches!(e, Effect::TransmitControl { final_bit: false })));
}

// S2: a detect-timer expiry while Up drives the session to Down with
// diag=DetectTime, zeroes the remote discriminator, and notifies.
#[test]
fn s2_detect_timeout_drives_up_to_down() {
    let mut sessions = Sessions::new();
    let mut discr_gen = DiscriminatorGen::new();
    let mut rng = rng();

    let peer = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2));
    let (id, _) =
        config::create_or_update(&mut sessions, &mut discr_gen, peer_config(peer), &mut rng)
            .unwrap();
    bring_up(&mut sessions, id, &mut rng);
    assert_eq!(sessions.get(id).unwrap().state, State::Up);

    let session = sessions.get_mut(id).unwrap();
    let effects = fsm::on_detect_timeout(session);
    assert_eq!(session.state, State::Down);
    assert_eq!(session.local_diag, DiagnosticCode::TimeExpired);
    assert_eq!(session.remote.as_ref().unwrap().discr, 0);
    assert!(effects.iter().any(|e| matches!(e, Effect::NotifyStatus)));
    assert!(effects
        .iter()
        .any(|e| matches!(e, Effect::TransmitControl { final_bit: false })));
}

// S3: an administrative shutdown on an Up session forces AdminDown,
// sends one last control packet, and notifies; a second consecutive
// detect-timer expiry has no further effect (AdminDown is terminal).
#[test]
fn s3_shutdown_forces_admin_down() {
    let mut sessions = Sessions::new();
    let mut discr_gen = DiscriminatorGen::new();
    let mut rng = rng();

    let peer = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2));
    let mut cfg = peer_config(peer);
    let (id, _) =
        config::create_or_update(&mut sessions, &mut discr_gen, cfg.clone(), &mut rng).unwrap();
    bring_up(&mut sessions, id, &mut rng);

    cfg.shutdown = true;
    let (id2, effects) =
        config::create_or_update(&mut sessions, &mut discr_gen, cfg, &mut rng).unwrap();
    assert_eq!(id, id2);

    let session = sessions.get(id).unwrap();
    assert_eq!(session.state, State::AdminDown);
    assert_eq!(session.local_diag, DiagnosticCode::AdminDown);
    assert!(effects.iter().any(|e| matches!(e, Effect::NotifyStatus)));
    assert!(effects
        .iter()
        .any(|e| matches!(e, Effect::TransmitControl { .. })));
    // The transmit and detection timers must be disarmed, or the session
    // keeps sending AdminDown packets forever instead of going silent.
    assert!(effects.iter().any(|e| matches!(e, Effect::DisarmTx)));
    assert!(effects.iter().any(|e| matches!(e, Effect::DisarmDetect)));

    // A detect timeout while AdminDown is a no-op.
    let session = sessions.get_mut(id).unwrap();
    let effects = fsm::on_detect_timeout(session);
    assert_eq!(session.state, State::AdminDown);
    assert!(effects.is_empty());
}

// Clearing a shutdown (AdminDown -> Down) also notifies, per NotifyOut's
// "Down<->AdminDown" transition class (§4.6), and re-arms the tx timer.
#[test]
fn clearing_shutdown_notifies_and_rearms_tx() {
    let mut sessions = Sessions::new();
    let mut discr_gen = DiscriminatorGen::new();
    let mut rng = rng();

    let peer = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2));
    let mut cfg = peer_config(peer);
    cfg.shutdown = true;
    let (id, _) =
        config::create_or_update(&mut sessions, &mut discr_gen, cfg.clone(), &mut rng).unwrap();
    assert_eq!(sessions.get(id).unwrap().state, State::AdminDown);

    cfg.shutdown = false;
    let (id2, effects) =
        config::create_or_update(&mut sessions, &mut discr_gen, cfg, &mut rng).unwrap();
    assert_eq!(id, id2);

    assert_eq!(sessions.get(id).unwrap().state, State::Down);
    assert!(effects.iter().any(|e| matches!(e, Effect::NotifyStatus)));
    assert!(effects.iter().any(|e| matches!(e, Effect::RearmTx(_))));
}

// S4: creating a second session with a label already bound to a
// different peer is refused; the first session and its label are
// untouched, and the second session never comes into existence.
#[test]
fn s4_duplicate_label_is_refused() {
    let mut sessions = Sessions::new();
    let mut discr_gen = DiscriminatorGen::new();
    let mut rng = rng();

    let peer_a = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2));
    let mut cfg_a = peer_config(peer_a);
    cfg_a.label = Some("L".to_string());
    let (id_a, _) =
        config::create_or_update(&mut sessions, &mut discr_gen, cfg_a, &mut rng).unwrap();

    let peer_b = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 3));
    let mut cfg_b = peer_config(peer_b);
    cfg_b.label = Some("L".to_string());
    let result = config::create_or_update(&mut sessions, &mut discr_gen, cfg_b, &mut rng);

    assert!(matches!(result, Err(Error::InvalidConfig(_))));
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions.get(id_a).unwrap().label.as_deref(), Some("L"));
    assert!(sessions.find_shop(peer_b, "eth0").is_none());
}

// S5: a create-only request against an already-present session key is
// refused, and the existing session is left untouched.
#[test]
fn s5_create_only_collision_is_refused() {
    let mut sessions = Sessions::new();
    let mut discr_gen = DiscriminatorGen::new();
    let mut rng = rng();

    let peer = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2));
    let (id, _) =
        config::create_or_update(&mut sessions, &mut discr_gen, peer_config(peer), &mut rng)
            .unwrap();
    let original_discr = sessions.get(id).unwrap().local_discr;

    let mut cfg = peer_config(peer);
    cfg.create_only = true;
    let result = config::create_or_update(&mut sessions, &mut discr_gen, cfg, &mut rng);

    assert!(matches!(result, Err(Error::Exists(_))));
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions.get(id).unwrap().local_discr, original_discr);
}

// A received control packet's diag field is decoded into the session's
// remote-info, not discarded, so an operator reading the session back
// can see why the peer last declared itself down.
#[test]
fn on_rx_packet_decodes_remote_diagnostic_code() {
    let mut sessions = Sessions::new();
    let mut discr_gen = DiscriminatorGen::new();
    let mut rng = rng();

    let peer = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2));
    let (id, _) =
        config::create_or_update(&mut sessions, &mut discr_gen, peer_config(peer), &mut rng)
            .unwrap();

    let session = sessions.get_mut(id).unwrap();
    let mut pkt = control_packet(State::Down, 0x77, 0);
    pkt.diag = DiagnosticCode::NbrDown as u8;
    fsm::on_rx_packet(session, &pkt, &mut rng);

    assert_eq!(session.remote.as_ref().unwrap().diag, DiagnosticCode::NbrDown);
}

// Drives a freshly created session from Down to Up via the same
// Down/Init packet exchange as `s1_bring_up_drives_down_to_up`.
fn bring_up(sessions: &mut Sessions, id: bfd::session::SessionId, rng: &mut SmallRng) {
    let session = sessions.get_mut(id).unwrap();
    let down_pkt = control_packet(State::Down, 0x77, 0);
    fsm::on_rx_packet(session, &down_pkt, rng);
    let my_discr = session.local_discr;
    let init_pkt = control_packet(State::Init, 0x77, my_discr);
    fsm::on_rx_packet(session, &init_pkt, rng);
    assert_eq!(session.state, State::Up);
}
