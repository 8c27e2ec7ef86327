//
// Copyright (c) The bfdd Contributors
//
// SPDX-License-Identifier: MIT
//

use serde::{Deserialize, Serialize};

use crate::packet::{DiagnosticCode, State};
use crate::session::Session;
use crate::sla::SlaEmit;

// One of the three notification kinds `NotifyOut` emits to `ControlPlane`
// subscribers, tagged by `op` so the control-plane framing can dispatch on
// a single discriminant field (the wire framing is a JSON object with an
// `op` key).
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "kebab-case")]
pub enum Notification {
    PeerStatus(PeerStatusNotify),
    ConfigAdd(PeerConfigNotify),
    ConfigUpdate(PeerConfigNotify),
    ConfigDelete(PeerIdentity),
    PeerSlaUpdate(PeerSlaNotify),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct PeerIdentity {
    pub peer: std::net::IpAddr,
    pub local_interface: Option<String>,
    pub vrf_name: Option<String>,
    pub multihop: bool,
    pub local_discr: u32,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct PeerStatusNotify {
    #[serde(flatten)]
    pub identity: PeerIdentity,
    pub state: State,
    pub remote_discr: u32,
    pub local_diag: DiagnosticCode,
    pub remote_diag: DiagnosticCode,
    // Seconds since the state last changed to Up, if currently Up.
    pub uptime_secs: Option<i64>,
    // Seconds since the state last changed to Down/AdminDown.
    pub downtime_secs: Option<i64>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct PeerConfigNotify {
    #[serde(flatten)]
    pub identity: PeerIdentity,
    pub detect_multiplier: u8,
    pub transmit_interval_ms: u32,
    pub receive_interval_ms: u32,
    pub echo_interval_ms: u32,
    pub echo_mode: bool,
    pub shutdown: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct PeerSlaNotify {
    pub local_discr: u32,
    pub remote_discr: u32,
    pub latency_ms: u32,
    pub jitter_ms: u32,
    pub pkt_loss_pct: f32,
}

impl PeerIdentity {
    pub fn from_session(session: &Session) -> Self {
        let (local_interface, vrf_name, multihop) = match &session.key {
            crate::session::SessionKey::Shop { ifname, .. } => {
                (Some(ifname.clone()).filter(|s| !s.is_empty()), None, false)
            }
            crate::session::SessionKey::Mhop { vrf, .. } => {
                (None, Some(vrf.clone()).filter(|s| !s.is_empty()), true)
            }
        };
        PeerIdentity {
            peer: session.key.peer(),
            local_interface,
            vrf_name,
            multihop,
            local_discr: session.local_discr,
        }
    }
}

impl PeerStatusNotify {
    pub fn from_session(session: &Session) -> Self {
        let now = chrono::Utc::now();
        PeerStatusNotify {
            identity: PeerIdentity::from_session(session),
            state: session.state,
            remote_discr: session.remote.as_ref().map(|r| r.discr).unwrap_or(0),
            local_diag: session.local_diag,
            remote_diag: session
                .remote
                .as_ref()
                .map(|r| r.diag)
                .unwrap_or(DiagnosticCode::Nothing),
            uptime_secs: session
                .uptime
                .filter(|_| session.is_up())
                .map(|t| (now - t).num_seconds()),
            downtime_secs: session
                .downtime
                .filter(|_| !session.is_up())
                .map(|t| (now - t).num_seconds()),
        }
    }
}

impl PeerConfigNotify {
    pub fn from_session(session: &Session) -> Self {
        PeerConfigNotify {
            identity: PeerIdentity::from_session(session),
            detect_multiplier: session.config.detect_mult,
            transmit_interval_ms: session.config.desired_min_tx_ms,
            receive_interval_ms: session.config.required_min_rx_ms,
            echo_interval_ms: session.config.required_min_echo_rx_ms,
            echo_mode: session.config.echo,
            shutdown: session.config.admin_down,
        }
    }
}

impl PeerSlaNotify {
    pub fn from_session(session: &Session, emit: SlaEmit) -> Self {
        PeerSlaNotify {
            local_discr: session.local_discr,
            remote_discr: session.remote.as_ref().map(|r| r.discr).unwrap_or(0),
            latency_ms: emit.latency,
            jitter_ms: emit.jitter,
            pkt_loss_pct: emit.pkt_loss_pct,
        }
    }
}
