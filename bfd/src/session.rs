//
// Copyright (c) The bfdd Contributors
//
// SPDX-License-Identifier: MIT
//

use std::net::IpAddr;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use generational_arena::Index;
use serde::{Deserialize, Serialize};

use crate::packet::{DiagnosticCode, State};
use crate::sla::SlaStats;
use crate::timers::Timer;

pub type SessionId = Index;

// Identifies a BFD session the way an inbound packet or a configuration
// request does: either a single-hop session (peer + local interface) or a
// multihop session (peer + local address + VRF).
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
#[derive(Deserialize, Serialize)]
pub enum SessionKey {
    Shop { peer: IpAddr, ifname: String },
    Mhop { peer: IpAddr, local: IpAddr, vrf: String },
}

impl SessionKey {
    pub fn new_shop(peer: IpAddr, ifname: String) -> Self {
        SessionKey::Shop { peer, ifname }
    }

    pub fn new_mhop(peer: IpAddr, local: IpAddr, vrf: String) -> Self {
        SessionKey::Mhop { peer, local, vrf }
    }

    pub fn peer(&self) -> IpAddr {
        match self {
            SessionKey::Shop { peer, .. } => *peer,
            SessionKey::Mhop { peer, .. } => *peer,
        }
    }

    pub fn is_multihop(&self) -> bool {
        matches!(self, SessionKey::Mhop { .. })
    }
}

impl std::fmt::Display for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionKey::Shop { peer, ifname } => {
                write!(f, "{peer}@{ifname}")
            }
            SessionKey::Mhop { peer, local, vrf } => {
                write!(f, "{peer}<-{local}%{vrf}")
            }
        }
    }
}

// Session parameters negotiated or configured locally.
#[derive(Clone, Debug)]
pub struct SessionTimers {
    // Locally configured desired min tx interval.
    pub desired_min_tx: Duration,
    // Locally configured required min rx interval.
    pub required_min_rx: Duration,
    // Locally configured required min echo rx interval (0 disables echo).
    pub required_min_echo_rx: Duration,
    // The min tx interval currently in effect (negotiated).
    pub curr_min_tx: Duration,
    // The min rx interval currently in effect (negotiated).
    pub curr_min_rx: Duration,
}

// Information about the remote end of a session, learned from received
// control packets. `None` until the first packet is received.
#[derive(Clone, Debug)]
pub struct SessionRemoteInfo {
    pub discr: u32,
    pub state: State,
    pub diag: DiagnosticCode,
    pub demand_mode: bool,
    pub detect_mult: u8,
    pub min_tx: Duration,
    pub min_rx: Duration,
    pub min_echo_rx: Duration,
    pub last_rx: DateTime<Utc>,
}

// Running counters maintained for observability, independent of the SLA
// rolling window.
#[derive(Clone, Copy, Debug, Default)]
#[derive(Deserialize, Serialize)]
pub struct SessionCounters {
    pub control_pkt_tx: u64,
    pub control_pkt_rx: u64,
    pub echo_pkt_tx: u64,
    pub echo_pkt_rx: u64,
    pub session_up_events: u64,
    pub session_down_events: u64,
    pub zero_remote_discr_events: u64,
}

// A BFD session and all state associated with it.
pub struct Session {
    pub id: SessionId,
    pub key: SessionKey,

    // Local address the session's transmit socket is bound to. Defaults
    // to the unspecified address of the peer's family when no
    // local-address was configured (single-hop sessions let the kernel
    // pick a source address via routing); mandatory input for multihop
    // sessions, where it also forms part of the session key.
    pub local_addr: IpAddr,

    // Configuration.
    pub config: SessionConfig,

    // FSM state.
    pub state: State,
    pub local_discr: u32,
    pub local_diag: DiagnosticCode,
    pub demand_mode: bool,
    pub poll_active: Arc<AtomicBool>,
    pub final_pending: bool,

    // Negotiated timer intervals.
    pub timers: SessionTimers,

    // Remote peer state, once learned.
    pub remote: Option<SessionRemoteInfo>,

    // Echo function state.
    pub echo_active: bool,

    // Interface resolution, supplied by the `OSIface` collaborator at
    // session-create time and refreshed on its rescan timer. Single-hop
    // sessions only; never consulted by the state machine itself.
    pub ifindex: Option<u32>,
    pub local_mac: Option<[u8; 6]>,
    pub peer_mac: Option<[u8; 6]>,

    // Timers (self-rearming, one-shot).
    pub t_tx: Option<Timer>,
    pub t_echo_tx: Option<Timer>,
    pub t_detect: Option<Timer>,
    pub t_echo_detect: Option<Timer>,

    // Bookkeeping.
    pub refcount: u32,
    pub label: Option<String>,
    pub uptime: Option<DateTime<Utc>>,
    pub downtime: Option<DateTime<Utc>>,
    pub last_down_diag: DiagnosticCode,
    pub counters: SessionCounters,
    pub sla: SlaStats,

    // Timestamp of the last packet transmitted on the active measurement
    // path (echo if active, control otherwise); paired with the arrival
    // time of the next received packet to derive SLA latency.
    pub last_xmit_tv: Option<DateTime<Utc>>,
}

// Per-session configuration, as supplied over the control plane.
#[derive(Clone, Debug)]
#[derive(Deserialize, Serialize)]
pub struct SessionConfig {
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub admin_down: bool,
    #[serde(default)]
    pub create_only: bool,
    #[serde(default)]
    pub echo: bool,
    #[serde(default)]
    pub track_sla: bool,
    #[serde(default)]
    pub local_discr: Option<u32>,
    #[serde(default = "SessionConfig::default_detect_mult")]
    pub detect_mult: u8,
    #[serde(default = "SessionConfig::default_min_tx_ms")]
    pub desired_min_tx_ms: u32,
    #[serde(default = "SessionConfig::default_min_rx_ms")]
    pub required_min_rx_ms: u32,
    #[serde(default = "SessionConfig::default_min_echo_rx_ms")]
    pub required_min_echo_rx_ms: u32,
    #[serde(default = "SessionConfig::default_mhop_ttl")]
    pub mhop_ttl: u8,
}

impl SessionConfig {
    // RFC 5880 doesn't mandate specific defaults; these mirror common
    // implementation practice (300ms tx/rx, detect mult 3).
    pub const fn default_detect_mult() -> u8 {
        3
    }

    pub const fn default_min_tx_ms() -> u32 {
        300
    }

    pub const fn default_min_rx_ms() -> u32 {
        300
    }

    pub const fn default_min_echo_rx_ms() -> u32 {
        50
    }

    pub const fn default_mhop_ttl() -> u8 {
        254
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            label: None,
            admin_down: false,
            create_only: false,
            echo: false,
            track_sla: false,
            local_discr: None,
            detect_mult: Self::default_detect_mult(),
            desired_min_tx_ms: Self::default_min_tx_ms(),
            required_min_rx_ms: Self::default_min_rx_ms(),
            required_min_echo_rx_ms: Self::default_min_echo_rx_ms(),
            mhop_ttl: Self::default_mhop_ttl(),
        }
    }
}

// ===== impl Session =====

impl Session {
    // The detection time is detect_mult times the negotiated rx interval
    // (the larger of our required min rx and the remote's desired min tx),
    // per RFC 5880 §6.8.4.
    pub fn detect_time(&self) -> Option<Duration> {
        let remote = self.remote.as_ref()?;
        let interval = self.timers.curr_min_rx.max(remote.min_tx);
        Some(interval * remote.detect_mult as u32)
    }

    pub fn is_up(&self) -> bool {
        self.state == State::Up
    }

    // Detection time along the echo path, used in place of `detect_time()`
    // while the echo function is active.
    pub fn echo_detect_time(&self) -> Option<Duration> {
        let remote = self.remote.as_ref()?;
        Some(self.timers.required_min_echo_rx * remote.detect_mult as u32)
    }
}
