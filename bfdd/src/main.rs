//
// Copyright (c) The bfdd Contributors
//
// SPDX-License-Identifier: MIT
//

#![warn(rust_2018_idioms)]

mod cli;
mod controlplane;
mod logging;
mod osiface;

use bfd::dispatcher;
use bfd::master::{Master, SockKey};
use bfd::network::{self, AddressFamily};
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{broadcast, mpsc};
use tracing::{error, info};

// Listening sockets this daemon binds at startup: one pair (v4/v6) per
// well-known BFD port (RFC 5881 single-hop, RFC 5883 multihop, RFC 5880
// §6.4 echo). Binding any of these is the closest analogue this core has
// to the reference daemon's process-wide interface-query socket, whose
// bind failure is fatal at startup.
struct Listener {
    family: AddressFamily,
    port: u16,
    multihop: bool,
    min_ttl: Option<u8>,
}

const LISTENERS: &[Listener] = &[
    Listener { family: AddressFamily::Ipv4, port: network::PORT_DST_SINGLE_HOP, multihop: false, min_ttl: None },
    Listener { family: AddressFamily::Ipv6, port: network::PORT_DST_SINGLE_HOP, multihop: false, min_ttl: None },
    Listener { family: AddressFamily::Ipv4, port: network::PORT_DST_ECHO, multihop: false, min_ttl: None },
    Listener { family: AddressFamily::Ipv6, port: network::PORT_DST_ECHO, multihop: false, min_ttl: None },
    // Multihop sessions are reachable from any TTL a router along the path
    // may have decremented to; per-session GTSM enforcement belongs in the
    // session's own configured `mh_ttl`, not at this shared socket, so no
    // floor is applied here.
    Listener { family: AddressFamily::Ipv4, port: network::PORT_DST_MULTIHOP, multihop: true, min_ttl: Some(1) },
    Listener { family: AddressFamily::Ipv6, port: network::PORT_DST_MULTIHOP, multihop: true, min_ttl: Some(1) },
];

fn bind_listeners(input_tx: &mpsc::UnboundedSender<bfd::master::ProtocolInputMsg>) {
    for listener in LISTENERS {
        let socket = match network::socket_rx(listener.family, listener.port, listener.min_ttl) {
            Ok(socket) => socket,
            Err(error) => {
                error.log();
                error!(
                    ?listener.family,
                    port = listener.port,
                    "failed to bind listening socket, exiting"
                );
                std::process::exit(1);
            }
        };

        let sock_key = SockKey { port: listener.port, multihop: listener.multihop };
        let input_tx = input_tx.clone();
        tokio::spawn(network::rx_loop(
            socket,
            sock_key,
            listener.family,
            listener.multihop,
            input_tx,
        ));
    }
}

fn main() {
    let cli = cli::Cli::parse();

    logging::init(None);

    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("failed to create async runtime")
        .block_on(run(cli));
}

async fn run(cli: cli::Cli) {
    info!("starting up");

    let (notify_tx, notify_rx) = mpsc::unbounded_channel();
    let mut master = Master::new(notify_tx);
    let input_tx = master.input_tx.clone();

    let (broadcast_tx, _) = broadcast::channel(256);
    tokio::spawn(controlplane::forward_notifications(notify_rx, broadcast_tx.clone()));

    bind_listeners(&input_tx);

    {
        let control_socket = cli.control_socket.clone();
        let input_tx = input_tx.clone();
        let broadcast_tx = broadcast_tx.clone();
        tokio::spawn(async move {
            if let Err(error) = controlplane::serve(control_socket, input_tx, broadcast_tx).await {
                error!(%error, "control socket task ended");
            }
        });
    }

    if let Some(path) = cli.config.clone() {
        let input_tx = input_tx.clone();
        tokio::spawn(async move {
            if let Err(error) = controlplane::load_file(&path, &input_tx).await {
                error!(%error, "failed to load initial configuration");
            }
        });
    }

    let mut sighup = match signal(SignalKind::hangup()) {
        Ok(sighup) => sighup,
        Err(error) => {
            error!(%error, "failed to install SIGHUP handler");
            std::process::exit(1);
        }
    };

    let dispatcher_fut = dispatcher::run(&mut master);
    tokio::pin!(dispatcher_fut);

    loop {
        tokio::select! {
            _ = &mut dispatcher_fut => {
                info!("dispatcher input channel closed, shutting down");
                break;
            }
            _ = sighup.recv() => {
                let Some(path) = cli.config.clone() else {
                    info!("received SIGHUP with no configuration file to reload");
                    continue;
                };
                info!(path = %path.display(), "received SIGHUP, reloading configuration");
                let input_tx = input_tx.clone();
                tokio::spawn(async move {
                    if let Err(error) = controlplane::load_file(&path, &input_tx).await {
                        error!(%error, "failed to reload configuration");
                    }
                });
            }
            _ = tokio::signal::ctrl_c() => {
                info!("received interrupt, shutting down");
                break;
            }
        }
    }
}
