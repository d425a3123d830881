//! Routing hub: accept peers, assign ids, dispatch frames, mediate transfer
//! consent, expire idle transfers.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use ferry_core::endpoint::Endpoint;
use ferry_core::transfer::{ChunkOutcome, TransferPolicy, TransferRegistry};
use ferry_core::{Message, PeerId, DEFAULT_MAX_FILE_SIZE, DEFAULT_MAX_IDLE, SERVER_SENDER,
    UPLOAD_CONFIRMED_SENDER};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;

/// Tunables the hub needs at runtime; derived from [`Config`] in the binary.
#[derive(Debug, Clone)]
pub struct HubOptions {
    pub max_file_size: u64,
    pub max_idle: Duration,
    pub sweep_interval: Duration,
}

impl Default for HubOptions {
    fn default() -> Self {
        HubOptions {
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            max_idle: DEFAULT_MAX_IDLE,
            sweep_interval: Duration::from_secs(60),
        }
    }
}

impl From<&Config> for HubOptions {
    fn from(cfg: &Config) -> Self {
        HubOptions {
            max_file_size: cfg.max_file_bytes(),
            max_idle: Duration::from_secs(cfg.transfer_idle_secs),
            sweep_interval: Duration::from_secs(cfg.sweep_interval_secs),
        }
    }
}

struct PeerEntry {
    endpoint: Arc<Endpoint>,
    name: String,
    #[allow(dead_code)]
    connected_at: Instant,
}

pub struct Hub {
    peers: Mutex<HashMap<PeerId, PeerEntry>>,
    registry: TransferRegistry,
    opts: HubOptions,
    shutdown: CancellationToken,
}

impl Hub {
    pub fn new(opts: HubOptions, shutdown: CancellationToken) -> Arc<Hub> {
        let policy = TransferPolicy {
            max_file_size: opts.max_file_size,
        };
        Arc::new(Hub {
            peers: Mutex::new(HashMap::new()),
            registry: TransferRegistry::new(policy),
            opts,
            shutdown,
        })
    }

    pub fn peer_count(&self) -> usize {
        self.peers.lock().unwrap().len()
    }

    /// Accept peers on `listener` until the shutdown token trips, then close
    /// every endpoint so connection tasks drain.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> std::io::Result<()> {
        if let Ok(addr) = listener.local_addr() {
            info!(%addr, "hub listening");
        }
        let sweeper = self.clone();
        let sweep_task = tokio::spawn(async move { sweeper.sweep_loop().await });

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        let hub = self.clone();
                        tokio::spawn(async move { hub.serve_peer(stream, addr).await });
                    }
                    Err(err) => warn!(error = %err, "accept failed"),
                },
            }
        }

        sweep_task.abort();
        let endpoints: Vec<Arc<Endpoint>> = {
            let peers = self.peers.lock().unwrap();
            peers.values().map(|p| p.endpoint.clone()).collect()
        };
        for ep in endpoints {
            ep.close();
        }
        info!("hub stopped");
        Ok(())
    }

    async fn sweep_loop(self: Arc<Self>) {
        let mut tick = tokio::time::interval(self.opts.sweep_interval);
        tick.tick().await; // immediate first tick carries no work
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tick.tick() => {
                    for t in self.registry.sweep(Instant::now(), self.opts.max_idle) {
                        info!(transfer = %t.id, file = %t.file_name, "transfer expired");
                        for peer in [&t.sender, &t.target] {
                            let end = Message::FileEnd {
                                sender: SERVER_SENDER.to_owned(),
                                target: peer.clone(),
                                transfer_id: t.id.clone(),
                                success: false,
                                error: "expired".to_owned(),
                            };
                            self.send_to(peer, end).await;
                        }
                    }
                }
            }
        }
    }

    async fn serve_peer(self: Arc<Self>, stream: TcpStream, addr: SocketAddr) {
        let cancel = self.shutdown.child_token();
        let (endpoint, mut reader) = Endpoint::pair(stream, cancel.clone());

        let id = {
            let mut peers = self.peers.lock().unwrap();
            let mut id = PeerId::generate();
            while peers.contains_key(&id) {
                id = PeerId::generate();
            }
            peers.insert(
                id.clone(),
                PeerEntry {
                    endpoint: endpoint.clone(),
                    name: String::new(),
                    connected_at: Instant::now(),
                },
            );
            id
        };
        info!(peer = %id, %addr, "peer connected");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                next = reader.next() => match next {
                    Ok(Some(mut msg)) => {
                        msg.set_sender(id.as_str());
                        self.dispatch(&id, msg).await;
                    }
                    Ok(None) => break,
                    Err(err) => {
                        warn!(peer = %id, error = %err, "connection error");
                        break;
                    }
                },
            }
        }

        self.remove_peer(&id).await;
    }

    async fn remove_peer(&self, id: &PeerId) {
        let entry = self.peers.lock().unwrap().remove(id);
        let Some(entry) = entry else { return };
        entry.endpoint.close();
        info!(peer = %id, name = %entry.name, "peer removed");

        // Abort transfers the peer participated in and tell the survivor.
        for t in self.registry.abort_for_peer(id.as_str()) {
            let other = if t.sender == id.as_str() {
                &t.target
            } else {
                &t.sender
            };
            warn!(transfer = %t.id, survivor = %other, "aborting transfer after peer loss");
            let end = Message::FileEnd {
                sender: SERVER_SENDER.to_owned(),
                target: other.clone(),
                transfer_id: t.id.clone(),
                success: false,
                error: "peer disconnected".to_owned(),
            };
            self.send_to(other, end).await;
        }
    }

    /// Unicast, best effort. False when the target is absent or the write
    /// failed; a failed write trips the target's cancellation, so its
    /// connection task cleans up.
    async fn send_to(&self, target: &str, msg: Message) -> bool {
        let ep = {
            let peers = self.peers.lock().unwrap();
            peers.get(target).map(|p| p.endpoint.clone())
        };
        match ep {
            Some(ep) => ep.send(&msg).await.is_ok(),
            None => false,
        }
    }

    /// Fan out to every peer but the sender. The peer table is snapshotted
    /// first; no lock is held across network writes.
    async fn broadcast(&self, from: &PeerId, msg: &Message) {
        let snapshot: Vec<(PeerId, Arc<Endpoint>)> = {
            let peers = self.peers.lock().unwrap();
            peers
                .iter()
                .filter(|(id, _)| *id != from)
                .map(|(id, p)| (id.clone(), p.endpoint.clone()))
                .collect()
        };
        for (id, ep) in snapshot {
            if ep.send(msg).await.is_err() {
                debug!(peer = %id, "broadcast write failed, peer marked for cleanup");
            }
        }
    }

    async fn error_to(&self, peer: &PeerId, description: String) {
        let msg = Message::Error {
            sender: SERVER_SENDER.to_owned(),
            target: peer.to_string(),
            description,
        };
        self.send_to(peer.as_str(), msg).await;
    }

    /// Apply the routing rules to one inbound frame. The sender field has
    /// already been rewritten to the authoritative id.
    async fn dispatch(&self, from: &PeerId, msg: Message) {
        match msg {
            Message::Chat {
                sender,
                target,
                content,
            } => {
                let msg = Message::Chat {
                    sender,
                    target: target.clone(),
                    content,
                };
                if target.is_empty() {
                    debug!(peer = %from, "broadcast chat");
                    self.broadcast(from, &msg).await;
                } else if !self.send_to(&target, msg).await {
                    self.error_to(from, format!("no such peer: {target}")).await;
                }
            }

            Message::FileStart {
                sender,
                target,
                transfer_id,
                file_name,
                file_size,
            } => {
                match self
                    .registry
                    .open(&transfer_id, &file_name, file_size, &sender, &target)
                {
                    Ok(()) => {
                        info!(
                            transfer = %transfer_id,
                            file = %file_name,
                            size = file_size,
                            from = %sender,
                            to = %target,
                            "transfer proposed"
                        );
                        let id = transfer_id.clone();
                        let fwd = Message::FileStart {
                            sender,
                            target: target.clone(),
                            transfer_id,
                            file_name,
                            file_size,
                        };
                        if !self.send_to(&target, fwd).await {
                            self.registry.close(&id, false);
                            self.error_to(from, format!("recipient {target} is not connected"))
                                .await;
                        }
                    }
                    Err(err) => {
                        self.error_to(from, format!("transfer refused: {err}")).await;
                    }
                }
            }

            Message::DownloadAccept {
                sender: _,
                transfer_id,
            } => match self.registry.accept(&transfer_id) {
                Ok(t) => {
                    info!(transfer = %transfer_id, "transfer accepted");
                    let confirm = Message::UploadConfirmed {
                        sender: UPLOAD_CONFIRMED_SENDER.to_owned(),
                        transfer_id,
                    };
                    self.send_to(&t.sender, confirm).await;
                }
                Err(err) => {
                    self.error_to(from, format!("accept failed: {err}")).await;
                }
            },

            Message::DownloadReject {
                sender: _,
                transfer_id,
            } => match self.registry.reject(&transfer_id) {
                Ok(t) => {
                    info!(transfer = %transfer_id, "transfer rejected by recipient");
                    let end = Message::FileEnd {
                        sender: SERVER_SENDER.to_owned(),
                        target: t.sender.clone(),
                        transfer_id,
                        success: false,
                        error: "rejected by recipient".to_owned(),
                    };
                    self.send_to(&t.sender, end).await;
                }
                Err(err) => {
                    self.error_to(from, format!("reject failed: {err}")).await;
                }
            },

            Message::FileData {
                sender,
                target,
                transfer_id,
                seq,
                data,
            } => match self.registry.observe_chunk(&transfer_id, seq, data.len()) {
                Ok(outcome) => {
                    if outcome == ChunkOutcome::Complete {
                        debug!(transfer = %transfer_id, "final chunk relayed");
                    }
                    let ack = Message::Ack {
                        sender: SERVER_SENDER.to_owned(),
                        target: from.to_string(),
                        transfer_id: transfer_id.clone(),
                        seq,
                    };
                    let fwd = Message::FileData {
                        sender,
                        target: target.clone(),
                        transfer_id,
                        seq,
                        data,
                    };
                    self.send_to(&target, fwd).await;
                    self.send_to(from.as_str(), ack).await;
                }
                Err(err) => {
                    warn!(peer = %from, transfer = %transfer_id, error = %err, "chunk refused");
                    self.error_to(from, format!("chunk refused: {err}")).await;
                }
            },

            Message::FileEnd {
                sender,
                target,
                transfer_id,
                success,
                error,
            } => {
                if let Some(t) = self.registry.close(&transfer_id, success) {
                    info!(
                        transfer = %t.id,
                        success,
                        bytes = t.bytes_accounted,
                        "transfer closed"
                    );
                }
                let fwd = Message::FileEnd {
                    sender,
                    target: target.clone(),
                    transfer_id,
                    success,
                    error,
                };
                self.send_to(&target, fwd).await;
            }

            Message::Ack {
                sender,
                target,
                transfer_id,
                seq,
            } => {
                let fwd = Message::Ack {
                    sender,
                    target: target.clone(),
                    transfer_id,
                    seq,
                };
                self.send_to(&target, fwd).await;
            }

            Message::Error {
                sender,
                target,
                description,
            } => {
                let fwd = Message::Error {
                    sender,
                    target: target.clone(),
                    description,
                };
                self.send_to(&target, fwd).await;
            }

            Message::Connect {
                sender: _,
                client_name,
            } => {
                info!(peer = %from, name = %client_name, "peer registered");
                if let Some(entry) = self.peers.lock().unwrap().get_mut(from.as_str()) {
                    entry.name = client_name;
                }
                let reply = Message::IdResponse {
                    sender: SERVER_SENDER.to_owned(),
                    client_id: from.to_string(),
                };
                self.send_to(from.as_str(), reply).await;
            }

            Message::Disconnect { sender: _, reason } => {
                info!(peer = %from, reason = %reason, "peer leaving");
                let ep = {
                    let peers = self.peers.lock().unwrap();
                    peers.get(from.as_str()).map(|p| p.endpoint.clone())
                };
                if let Some(ep) = ep {
                    ep.close();
                }
            }

            // Hub-originated kinds carry no meaning inbound.
            Message::IdResponse { .. } | Message::UploadConfirmed { .. } => {
                debug!(peer = %from, "ignoring hub-only frame from peer");
            }
        }
    }
}
