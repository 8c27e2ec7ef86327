//
// Copyright (c) The bfdd Contributors
//
// SPDX-License-Identifier: MIT
//

// `ControlPlane`: loads the initial JSON configuration document and serves
// a Unix control socket accepting the same per-peer records framed as
// newline-delimited JSON. Every mutation is relayed to the single
// dispatcher task over `Master::input_tx` rather than touching `Sessions`
// directly, keeping the "mutated only by the dispatcher" invariant intact
// across tasks. State/config/SLA notifications produced by the dispatcher
// are broadcast to every open connection as they arrive.

use std::io;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use bfd::config::PeerConfig;
use bfd::master::ProtocolInputMsg;
use bfd::notify::Notification;
use bfd::session::SessionKey;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, mpsc, oneshot};

// The on-disk configuration document: peer objects grouped by address
// family/label, each entry a self-contained `PeerConfig` (address family
// already follows from its `peer-address`). The grouping only affects how
// the document reads.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ConfigDocument {
    ipv4: Vec<PeerConfig>,
    ipv6: Vec<PeerConfig>,
    label: Vec<PeerConfig>,
}

impl ConfigDocument {
    fn into_peers(self) -> Vec<PeerConfig> {
        let mut peers = self.ipv4;
        peers.extend(self.ipv6);
        peers.extend(self.label);
        peers
    }
}

// One control-socket request record, tagged by `op`.
#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "kebab-case")]
enum ControlRequest {
    ConfigAdd(PeerConfig),
    ConfigUpdate(PeerConfig),
    ConfigDelete(DeleteRequest),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct DeleteRequest {
    #[serde(default)]
    label: Option<String>,
    #[serde(default)]
    peer_address: Option<IpAddr>,
    #[serde(default)]
    local_interface: Option<String>,
    #[serde(default)]
    local_address: Option<IpAddr>,
    #[serde(default)]
    vrf_name: Option<String>,
    #[serde(default)]
    multihop: bool,
}

impl DeleteRequest {
    fn key(&self) -> Option<SessionKey> {
        let peer = self.peer_address?;
        if self.multihop {
            let local = self.local_address?;
            Some(SessionKey::new_mhop(peer, local, self.vrf_name.clone().unwrap_or_default()))
        } else {
            Some(SessionKey::new_shop(peer, self.local_interface.clone().unwrap_or_default()))
        }
    }
}

// Loads the initial configuration document and applies every peer entry
// it contains. Parse/apply failures are logged and skipped: parse-time
// errors increment an error counter and skip the offending entry but do
// not abort the batch.
pub async fn load_file(path: &Path, input_tx: &mpsc::UnboundedSender<ProtocolInputMsg>) -> io::Result<()> {
    let text = tokio::fs::read_to_string(path).await?;
    let doc: ConfigDocument = match serde_json::from_str(&text) {
        Ok(doc) => doc,
        Err(error) => {
            tracing::warn!(%error, path = %path.display(), "failed to parse configuration file");
            return Ok(());
        }
    };

    for cfg in doc.into_peers() {
        if let Err(error) = apply_config(input_tx, cfg).await {
            tracing::warn!(%error, "failed to apply configuration entry");
        }
    }
    Ok(())
}

async fn apply_config(input_tx: &mpsc::UnboundedSender<ProtocolInputMsg>, cfg: PeerConfig) -> Result<(), String> {
    let (reply, recv) = oneshot::channel();
    input_tx
        .send(ProtocolInputMsg::ApplyConfig { cfg, reply })
        .map_err(|_| "dispatcher shut down".to_string())?;
    recv.await
        .map_err(|_| "dispatcher dropped the reply channel".to_string())?
        .map(|_id| ())
}

async fn delete_config(
    input_tx: &mpsc::UnboundedSender<ProtocolInputMsg>,
    label: Option<String>,
    key: Option<SessionKey>,
) -> Result<(), String> {
    let (reply, recv) = oneshot::channel();
    input_tx
        .send(ProtocolInputMsg::DeleteConfig { label, key, reply })
        .map_err(|_| "dispatcher shut down".to_string())?;
    recv.await.map_err(|_| "dispatcher dropped the reply channel".to_string())?
}

// Forwards every notification the dispatcher produces onto a broadcast
// channel so `serve`'s per-connection tasks can each subscribe to their
// own receiver. Runs until the dispatcher's notify sender is dropped.
pub async fn forward_notifications(
    mut notify_rx: mpsc::UnboundedReceiver<Notification>,
    broadcast_tx: broadcast::Sender<Notification>,
) {
    while let Some(notification) = notify_rx.recv().await {
        // No error if there are currently no subscribers; a notification
        // nobody asked for is simply dropped.
        let _ = broadcast_tx.send(notification);
    }
}

// Serves the Unix control socket until the process is asked to stop.
// Each accepted connection handles NDJSON requests (answered with a
// `{status, error?}` object) and, concurrently, relays broadcast
// notifications to that same connection as newline-delimited JSON.
pub async fn serve(
    socket_path: PathBuf,
    input_tx: mpsc::UnboundedSender<ProtocolInputMsg>,
    notify_tx: broadcast::Sender<Notification>,
) -> io::Result<()> {
    let _ = std::fs::remove_file(&socket_path);
    let listener = UnixListener::bind(&socket_path)?;
    tracing::info!(path = %socket_path.display(), "control socket listening");

    loop {
        let (stream, _) = listener.accept().await?;
        let input_tx = input_tx.clone();
        let notify_rx = notify_tx.subscribe();
        tokio::spawn(async move {
            if let Err(error) = handle_connection(stream, input_tx, notify_rx).await {
                tracing::warn!(%error, "control connection ended with an error");
            }
        });
    }
}

async fn handle_connection(
    stream: UnixStream,
    input_tx: mpsc::UnboundedSender<ProtocolInputMsg>,
    mut notify_rx: broadcast::Receiver<Notification>,
) -> io::Result<()> {
    let (rx_half, mut tx_half) = stream.into_split();
    let mut lines = BufReader::new(rx_half).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                if line.trim().is_empty() {
                    continue;
                }

                let response = match serde_json::from_str::<ControlRequest>(&line) {
                    Ok(request) => dispatch(&input_tx, request).await,
                    Err(error) => Err(error.to_string()),
                };

                let body = match response {
                    Ok(()) => serde_json::json!({ "status": "ok" }),
                    Err(error) => serde_json::json!({ "status": "error", "error": error }),
                };
                let mut text = body.to_string();
                text.push('\n');
                tx_half.write_all(text.as_bytes()).await?;
            }
            notification = notify_rx.recv() => {
                match notification {
                    Ok(notification) => {
                        let mut text = serde_json::to_string(&notification)
                            .expect("Notification serialization is infallible");
                        text.push('\n');
                        tx_half.write_all(text.as_bytes()).await?;
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "control connection missed notifications");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }
    Ok(())
}

async fn dispatch(
    input_tx: &mpsc::UnboundedSender<ProtocolInputMsg>,
    request: ControlRequest,
) -> Result<(), String> {
    match request {
        ControlRequest::ConfigAdd(cfg) | ControlRequest::ConfigUpdate(cfg) => {
            apply_config(input_tx, cfg).await
        }
        ControlRequest::ConfigDelete(req) => {
            let key = req.key();
            delete_config(input_tx, req.label.clone(), key).await
        }
    }
}
