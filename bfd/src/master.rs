//
// Copyright (c) The bfdd Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rand::rngs::SmallRng;
use rand::SeedableRng;
use socket2::Socket;
use tokio::sync::{mpsc, oneshot};

use crate::clock::DiscriminatorGen;
use crate::config::PeerConfig;
use crate::network::PacketInfo;
use crate::notify::Notification;
use crate::session::{SessionId, SessionKey};
use crate::table::Sessions;
use crate::timers::Timer;

// Messages a session's timers, the UDP receive tasks, and `ControlPlane`
// post back to the single dispatcher. Nothing outside of `dispatcher::run`
// ever touches a `Session` directly, which is what lets many timer tasks,
// rx tasks, and control-plane requests run concurrently while the state
// machine itself stays single-threaded (the session table is mutated
// only by the dispatcher).
pub enum ProtocolInputMsg {
    RxPacket {
        sock_key: SockKey,
        info: PacketInfo,
        data: Vec<u8>,
    },
    TxTimeout { id: SessionId },
    DetectTimeout { id: SessionId },
    EchoTxTimeout { id: SessionId },
    EchoDetectTimeout { id: SessionId },
    ApplyConfig {
        cfg: PeerConfig,
        // A human-readable error, not `Error` itself: the reply is
        // consumed by `ControlPlane`'s `{status, error}` response, which
        // only ever needs the message, while the dispatcher logs the
        // typed `Error` locally.
        reply: oneshot::Sender<Result<SessionId, String>>,
    },
    DeleteConfig {
        label: Option<String>,
        key: Option<SessionKey>,
        reply: oneshot::Sender<Result<(), String>>,
    },
}

// Identifies which listening socket a received packet arrived on, so the
// dispatcher knows whether to interpret it as single-hop or multihop.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct SockKey {
    pub port: u16,
    pub multihop: bool,
}

// Owns every piece of process-wide state: the session table, the
// discriminator allocator, the jitter RNG, the transmit sockets, and the
// channel endpoints used to talk to the timer/rx tasks and to
// `ControlPlane`. This is the "SessionRegistry handle" the design notes
// call for: a single owning container instead of scattered raw pointers.
pub struct Master {
    pub sessions: Sessions,
    pub discr_gen: DiscriminatorGen,
    pub rng: SmallRng,
    pub tx_sockets: HashMap<SessionId, Arc<Socket>>,
    pub input_tx: mpsc::UnboundedSender<ProtocolInputMsg>,
    pub input_rx: mpsc::UnboundedReceiver<ProtocolInputMsg>,
    pub notify_tx: mpsc::UnboundedSender<Notification>,
}

impl Master {
    pub fn new(notify_tx: mpsc::UnboundedSender<Notification>) -> Self {
        let (input_tx, input_rx) = mpsc::unbounded_channel();
        Master {
            sessions: Sessions::new(),
            discr_gen: DiscriminatorGen::new(),
            rng: SmallRng::from_entropy(),
            tx_sockets: HashMap::new(),
            input_tx,
            input_rx,
            notify_tx,
        }
    }

    // Arms a self-rearming timer whose firing posts `msg_fn(id)` back onto
    // the dispatcher's input queue, and stores it in the slot the caller
    // selects out of a session (one of the four named timers).
    pub fn arm_timer<F>(
        &self,
        id: SessionId,
        delay: Duration,
        mut redelay: impl FnMut() -> Duration + Send + 'static,
        msg_fn: F,
    ) -> Timer
    where
        F: Fn(SessionId) -> ProtocolInputMsg + Send + 'static,
    {
        let tx = self.input_tx.clone();
        Timer::new(
            delay,
            move || {
                let _ = tx.send(msg_fn(id));
            },
            move || redelay(),
        )
    }
}
