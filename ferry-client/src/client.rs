//! Peer client core: hub session, outbound transfer driver, inbound transfer
//! assembler, pending tables.
//!
//! The core performs no console I/O. Commands arrive over a channel from the
//! control surface; everything the surface should show leaves as an [`Event`].

use std::collections::{BTreeMap, HashMap};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use ferry_core::endpoint::Endpoint;
use ferry_core::{is_server_sender, Message, CHUNK_SIZE, DEFAULT_MAX_FILE_SIZE};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

/// Wait on the hub's confirmation before a pending upload is dropped.
pub const CONFIRM_TIMEOUT: Duration = Duration::from_secs(2 * 60);

/// Wait on the user's verdict before a pending offer is dropped.
pub const OFFER_TIMEOUT: Duration = Duration::from_secs(10 * 60);

const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Requests from the control surface.
#[derive(Debug)]
pub enum Command {
    /// Chat; no target = broadcast.
    Chat {
        target: Option<String>,
        content: String,
    },
    SendFile {
        target: String,
        path: PathBuf,
    },
    Accept(u32),
    Reject(u32),
    List,
    Quit,
}

/// Everything the control surface renders.
#[derive(Debug, Clone)]
pub enum Event {
    Connected {
        peer_id: String,
    },
    Chat {
        sender: String,
        content: String,
        direct: bool,
    },
    Offer {
        ordinal: u32,
        sender: String,
        file_name: String,
        size: u64,
    },
    OfferExpired {
        ordinal: u32,
        file_name: String,
    },
    UploadStarted {
        transfer_id: String,
        file_name: String,
    },
    UploadDone {
        file_name: String,
        bytes: u64,
    },
    DownloadDone {
        file_name: String,
        path: PathBuf,
        bytes: u64,
    },
    TransferFailed {
        file_name: String,
        reason: String,
    },
    Listing {
        offers: Vec<OfferSummary>,
        uploads: Vec<UploadSummary>,
    },
    /// Feedback on a command that could not be carried out.
    Notice(String),
    /// ERROR frame from the hub.
    ServerError(String),
    Disconnected {
        reason: String,
    },
}

#[derive(Debug, Clone)]
pub struct OfferSummary {
    pub ordinal: u32,
    pub sender: String,
    pub file_name: String,
    pub size: u64,
}

#[derive(Debug, Clone)]
pub struct UploadSummary {
    pub file_name: String,
    pub target: String,
    pub state: &'static str,
}

#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub server_addr: String,
    pub name: String,
    pub storage_dir: PathBuf,
    pub max_file_size: u64,
    pub confirm_timeout: Duration,
    pub offer_timeout: Duration,
    pub sweep_interval: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        ClientOptions {
            server_addr: "127.0.0.1:8888".to_owned(),
            name: "anon".to_owned(),
            storage_dir: PathBuf::from("storage"),
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            confirm_timeout: CONFIRM_TIMEOUT,
            offer_timeout: OFFER_TIMEOUT,
            sweep_interval: SWEEP_INTERVAL,
        }
    }
}

/// Announced to the hub, awaiting UPLOAD_CONFIRMED. `temp_artifact` marks a
/// file produced by a pre-send step (e.g. an external compressor); such files
/// are deleted once the transfer ends, whatever the outcome.
struct PendingUpload {
    path: PathBuf,
    target: String,
    file_name: String,
    temp_artifact: bool,
    created: Instant,
}

/// Offered by a remote peer, awaiting the user's verdict.
struct PendingOffer {
    sender: String,
    transfer_id: String,
    file_name: String,
    size: u64,
    arrived: Instant,
}

struct ActiveUpload {
    file_name: String,
    target: String,
    path: PathBuf,
    temp_artifact: bool,
    cancel: CancellationToken,
}

struct ActiveDownload {
    file: File,
    path: PathBuf,
    file_name: String,
    sender: String,
    next_seq: i32,
    bytes: u64,
}

struct UploadOutcome {
    transfer_id: String,
    result: Result<u64, String>,
}

/// Connect to the hub and run the session until quit or disconnect.
pub async fn run(
    opts: ClientOptions,
    mut commands: mpsc::Receiver<Command>,
    events: mpsc::UnboundedSender<Event>,
) -> anyhow::Result<()> {
    let stream = TcpStream::connect(&opts.server_addr)
        .await
        .with_context(|| format!("failed to connect to {}", opts.server_addr))?;
    let cancel = CancellationToken::new();
    let (endpoint, mut reader) = Endpoint::pair(stream, cancel.clone());
    endpoint
        .send(&Message::Connect {
            sender: String::new(),
            client_name: opts.name.clone(),
        })
        .await
        .context("failed to announce to the hub")?;

    let (done_tx, mut done_rx) = mpsc::unbounded_channel();
    let mut session = Session {
        endpoint,
        events,
        done_tx,
        opts,
        my_id: String::new(),
        pending_uploads: HashMap::new(),
        offers: BTreeMap::new(),
        next_ordinal: 1,
        active_uploads: HashMap::new(),
        downloads: HashMap::new(),
    };
    let mut sweep = tokio::time::interval(session.opts.sweep_interval);
    sweep.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                session.emit(Event::Disconnected { reason: "connection closed".to_owned() });
                break;
            }
            cmd = commands.recv() => match cmd {
                None | Some(Command::Quit) => {
                    session.quit("quit").await;
                    break;
                }
                Some(cmd) => session.handle_command(cmd).await,
            },
            frame = reader.next() => match frame {
                Ok(Some(msg)) => session.handle_message(msg).await,
                Ok(None) => {
                    session.emit(Event::Disconnected { reason: "hub closed the connection".to_owned() });
                    break;
                }
                Err(err) => {
                    session.emit(Event::Disconnected { reason: err.to_string() });
                    break;
                }
            },
            Some(outcome) = done_rx.recv() => session.finish_upload(outcome).await,
            _ = sweep.tick() => session.sweep_pending(),
        }
    }

    session.teardown().await;
    Ok(())
}

struct Session {
    endpoint: Arc<Endpoint>,
    events: mpsc::UnboundedSender<Event>,
    done_tx: mpsc::UnboundedSender<UploadOutcome>,
    opts: ClientOptions,
    my_id: String,
    pending_uploads: HashMap<String, PendingUpload>,
    offers: BTreeMap<u32, PendingOffer>,
    next_ordinal: u32,
    active_uploads: HashMap<String, ActiveUpload>,
    downloads: HashMap<String, ActiveDownload>,
}

impl Session {
    fn emit(&self, event: Event) {
        let _ = self.events.send(event);
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Chat { target, content } => {
                let msg = Message::Chat {
                    sender: self.my_id.clone(),
                    target: target.unwrap_or_default(),
                    content,
                };
                if self.endpoint.send(&msg).await.is_err() {
                    debug!("chat send failed; connection is going down");
                }
            }
            Command::SendFile { target, path } => self.queue_send(target, path, false).await,
            Command::Accept(ordinal) => self.accept_offer(ordinal).await,
            Command::Reject(ordinal) => self.reject_offer(ordinal).await,
            Command::List => self.emit_listing(),
            Command::Quit => unreachable!("handled by the session loop"),
        }
    }

    /// Announce a file to the hub and hold it until the recipient consents.
    /// `temp_artifact` files are removed after the transfer ends.
    async fn queue_send(&mut self, target: String, path: PathBuf, temp_artifact: bool) {
        let file_name = match path.file_name().and_then(|n| n.to_str()) {
            Some(n) => n.to_owned(),
            None => {
                self.emit(Event::Notice(format!(
                    "cannot send {}: invalid file name",
                    path.display()
                )));
                return;
            }
        };
        if target.is_empty() {
            self.emit(Event::Notice("file transfers need a target peer".to_owned()));
            return;
        }
        let meta = match tokio::fs::metadata(&path).await {
            Ok(m) => m,
            Err(err) => {
                self.emit(Event::TransferFailed {
                    file_name,
                    reason: err.to_string(),
                });
                return;
            }
        };
        if !meta.is_file() {
            self.emit(Event::TransferFailed {
                file_name,
                reason: "not a regular file".to_owned(),
            });
            return;
        }
        if meta.len() > self.opts.max_file_size {
            self.emit(Event::TransferFailed {
                file_name,
                reason: format!(
                    "file is {} bytes, cap is {}",
                    meta.len(),
                    self.opts.max_file_size
                ),
            });
            return;
        }

        let transfer_id = Uuid::new_v4().to_string();
        let start = Message::FileStart {
            sender: self.my_id.clone(),
            target: target.clone(),
            transfer_id: transfer_id.clone(),
            file_name: file_name.clone(),
            file_size: meta.len() as i64,
        };
        if self.endpoint.send(&start).await.is_err() {
            self.emit(Event::TransferFailed {
                file_name,
                reason: "failed to announce transfer".to_owned(),
            });
            return;
        }
        self.pending_uploads.insert(
            transfer_id,
            PendingUpload {
                path,
                target,
                file_name,
                temp_artifact,
                created: Instant::now(),
            },
        );
    }

    async fn accept_offer(&mut self, ordinal: u32) {
        let Some(offer) = self.offers.remove(&ordinal) else {
            self.emit(Event::Notice(format!("no pending offer #{ordinal}")));
            return;
        };
        if let Err(err) = tokio::fs::create_dir_all(&self.opts.storage_dir).await {
            self.emit(Event::Notice(format!(
                "cannot prepare {}: {err}",
                self.opts.storage_dir.display()
            )));
            self.send_reject(&offer.transfer_id).await;
            return;
        }
        let dest = unique_dest(&self.opts.storage_dir, &offer.file_name);
        let file = match File::create(&dest).await {
            Ok(f) => f,
            Err(err) => {
                self.emit(Event::TransferFailed {
                    file_name: offer.file_name.clone(),
                    reason: err.to_string(),
                });
                self.send_reject(&offer.transfer_id).await;
                return;
            }
        };
        let accept = Message::DownloadAccept {
            sender: self.my_id.clone(),
            transfer_id: offer.transfer_id.clone(),
        };
        if self.endpoint.send(&accept).await.is_err() {
            let _ = tokio::fs::remove_file(&dest).await;
            return;
        }
        self.downloads.insert(
            offer.transfer_id,
            ActiveDownload {
                file,
                path: dest,
                file_name: offer.file_name,
                sender: offer.sender,
                next_seq: 0,
                bytes: 0,
            },
        );
    }

    async fn reject_offer(&mut self, ordinal: u32) {
        let Some(offer) = self.offers.remove(&ordinal) else {
            self.emit(Event::Notice(format!("no pending offer #{ordinal}")));
            return;
        };
        self.send_reject(&offer.transfer_id).await;
    }

    async fn send_reject(&self, transfer_id: &str) {
        let msg = Message::DownloadReject {
            sender: self.my_id.clone(),
            transfer_id: transfer_id.to_owned(),
        };
        let _ = self.endpoint.send(&msg).await;
    }

    fn emit_listing(&self) {
        let offers = self
            .offers
            .iter()
            .map(|(&ordinal, o)| OfferSummary {
                ordinal,
                sender: o.sender.clone(),
                file_name: o.file_name.clone(),
                size: o.size,
            })
            .collect();
        let uploads = self
            .pending_uploads
            .values()
            .map(|u| UploadSummary {
                file_name: u.file_name.clone(),
                target: u.target.clone(),
                state: "awaiting consent",
            })
            .chain(self.active_uploads.values().map(|u| UploadSummary {
                file_name: u.file_name.clone(),
                target: u.target.clone(),
                state: "streaming",
            }))
            .collect();
        self.emit(Event::Listing { offers, uploads });
    }

    async fn handle_message(&mut self, msg: Message) {
        match msg {
            Message::IdResponse { client_id, .. } => {
                self.my_id = client_id.clone();
                self.emit(Event::Connected { peer_id: client_id });
            }
            Message::Chat {
                sender,
                target,
                content,
            } => {
                self.emit(Event::Chat {
                    sender,
                    content,
                    direct: !target.is_empty(),
                });
            }
            Message::FileStart {
                sender,
                transfer_id,
                file_name,
                file_size,
                ..
            } => {
                if file_size < 0 {
                    warn!(transfer = %transfer_id, "ignoring offer with negative size");
                    return;
                }
                let ordinal = self.next_ordinal;
                self.next_ordinal += 1;
                self.offers.insert(
                    ordinal,
                    PendingOffer {
                        sender: sender.clone(),
                        transfer_id,
                        file_name: file_name.clone(),
                        size: file_size as u64,
                        arrived: Instant::now(),
                    },
                );
                self.emit(Event::Offer {
                    ordinal,
                    sender,
                    file_name,
                    size: file_size as u64,
                });
            }
            Message::UploadConfirmed {
                sender,
                transfer_id,
            } => {
                if !is_server_sender(&sender) {
                    warn!(%sender, "ignoring upload confirmation not from the hub");
                    return;
                }
                self.start_upload(transfer_id);
            }
            Message::FileData {
                transfer_id,
                seq,
                data,
                ..
            } => self.handle_chunk(transfer_id, seq, data).await,
            Message::FileEnd {
                transfer_id,
                success,
                error,
                ..
            } => self.handle_file_end(transfer_id, success, error).await,
            Message::Ack { transfer_id, seq, .. } => {
                debug!(transfer = %transfer_id, seq, "chunk acknowledged");
            }
            Message::Error { description, .. } => {
                self.emit(Event::ServerError(description));
            }
            other => {
                debug!(kind = ?other.kind(), "ignoring unexpected frame");
            }
        }
    }

    fn start_upload(&mut self, transfer_id: String) {
        let Some(pending) = self.pending_uploads.remove(&transfer_id) else {
            debug!(transfer = %transfer_id, "confirmation for unknown upload");
            return;
        };
        let cancel = CancellationToken::new();
        self.active_uploads.insert(
            transfer_id.clone(),
            ActiveUpload {
                file_name: pending.file_name.clone(),
                target: pending.target.clone(),
                path: pending.path.clone(),
                temp_artifact: pending.temp_artifact,
                cancel: cancel.clone(),
            },
        );
        self.emit(Event::UploadStarted {
            transfer_id: transfer_id.clone(),
            file_name: pending.file_name,
        });
        tokio::spawn(run_upload(
            self.endpoint.clone(),
            self.my_id.clone(),
            pending.target,
            transfer_id,
            pending.path,
            cancel,
            self.done_tx.clone(),
        ));
    }

    async fn handle_chunk(&mut self, transfer_id: String, seq: i32, data: Vec<u8>) {
        let write_err = match self.downloads.get_mut(&transfer_id) {
            None => {
                debug!(transfer = %transfer_id, "chunk for unknown transfer");
                return;
            }
            Some(dl) => {
                if seq != dl.next_seq {
                    warn!(
                        transfer = %transfer_id,
                        expected = dl.next_seq,
                        got = seq,
                        "unexpected chunk sequence"
                    );
                    return;
                }
                match dl.file.write_all(&data).await {
                    Ok(()) => {
                        dl.next_seq += 1;
                        dl.bytes += data.len() as u64;
                        return;
                    }
                    Err(err) => err,
                }
            }
        };

        // Resource error: abort this transfer, drop the partial file.
        let dl = self.downloads.remove(&transfer_id).unwrap();
        drop(dl.file);
        let _ = tokio::fs::remove_file(&dl.path).await;
        let end = Message::FileEnd {
            sender: self.my_id.clone(),
            target: dl.sender,
            transfer_id,
            success: false,
            error: write_err.to_string(),
        };
        let _ = self.endpoint.send(&end).await;
        self.emit(Event::TransferFailed {
            file_name: dl.file_name,
            reason: write_err.to_string(),
        });
    }

    async fn handle_file_end(&mut self, transfer_id: String, success: bool, error: String) {
        if let Some(mut dl) = self.downloads.remove(&transfer_id) {
            if success {
                if let Err(err) = dl.file.flush().await {
                    let _ = tokio::fs::remove_file(&dl.path).await;
                    self.emit(Event::TransferFailed {
                        file_name: dl.file_name,
                        reason: err.to_string(),
                    });
                    return;
                }
                self.emit(Event::DownloadDone {
                    file_name: dl.file_name,
                    path: dl.path,
                    bytes: dl.bytes,
                });
            } else {
                drop(dl.file);
                let _ = tokio::fs::remove_file(&dl.path).await;
                let reason = if error.is_empty() {
                    "transfer aborted".to_owned()
                } else {
                    error
                };
                self.emit(Event::TransferFailed {
                    file_name: dl.file_name,
                    reason,
                });
            }
            return;
        }

        // An offer the user never answered, aborted remotely.
        if let Some(ordinal) = self
            .offers
            .iter()
            .find(|(_, o)| o.transfer_id == transfer_id)
            .map(|(&k, _)| k)
        {
            let offer = self.offers.remove(&ordinal).unwrap();
            self.emit(Event::OfferExpired {
                ordinal,
                file_name: offer.file_name,
            });
            return;
        }

        // Sender side: the hub gave up on an upload of ours.
        if let Some(pending) = self.pending_uploads.remove(&transfer_id) {
            self.cleanup_artifact(&pending.path, pending.temp_artifact).await;
            let reason = if error.is_empty() {
                "transfer aborted".to_owned()
            } else {
                error
            };
            self.emit(Event::TransferFailed {
                file_name: pending.file_name,
                reason,
            });
            return;
        }
        if let Some(active) = self.active_uploads.get(&transfer_id) {
            // Stop the streaming task; its outcome arrives on the done channel.
            active.cancel.cancel();
        }
    }

    async fn finish_upload(&mut self, outcome: UploadOutcome) {
        let Some(active) = self.active_uploads.remove(&outcome.transfer_id) else {
            return;
        };
        self.cleanup_artifact(&active.path, active.temp_artifact).await;
        match outcome.result {
            Ok(bytes) => self.emit(Event::UploadDone {
                file_name: active.file_name,
                bytes,
            }),
            Err(reason) => self.emit(Event::TransferFailed {
                file_name: active.file_name,
                reason,
            }),
        }
    }

    async fn cleanup_artifact(&self, path: &Path, temp_artifact: bool) {
        if temp_artifact {
            if let Err(err) = tokio::fs::remove_file(path).await {
                warn!(path = %path.display(), error = %err, "failed to remove temporary artifact");
            }
        }
    }

    fn sweep_pending(&mut self) {
        let now = Instant::now();

        let stale: Vec<String> = self
            .pending_uploads
            .iter()
            .filter(|(_, u)| now.saturating_duration_since(u.created) >= self.opts.confirm_timeout)
            .map(|(id, _)| id.clone())
            .collect();
        for id in stale {
            let pending = self.pending_uploads.remove(&id).unwrap();
            if pending.temp_artifact {
                let _ = std::fs::remove_file(&pending.path);
            }
            self.emit(Event::TransferFailed {
                file_name: pending.file_name,
                reason: "no confirmation from recipient".to_owned(),
            });
        }

        let stale: Vec<u32> = self
            .offers
            .iter()
            .filter(|(_, o)| now.saturating_duration_since(o.arrived) >= self.opts.offer_timeout)
            .map(|(&k, _)| k)
            .collect();
        for ordinal in stale {
            let offer = self.offers.remove(&ordinal).unwrap();
            self.emit(Event::OfferExpired {
                ordinal,
                file_name: offer.file_name,
            });
        }
    }

    async fn quit(&mut self, reason: &str) {
        let msg = Message::Disconnect {
            sender: self.my_id.clone(),
            reason: reason.to_owned(),
        };
        let _ = self.endpoint.send(&msg).await;
        self.endpoint.close();
    }

    /// Orderly teardown: stop uploads, drop partial downloads.
    async fn teardown(&mut self) {
        let uploads: Vec<(String, ActiveUpload)> = self.active_uploads.drain().collect();
        for (_, upload) in uploads {
            upload.cancel.cancel();
            self.cleanup_artifact(&upload.path, upload.temp_artifact).await;
        }
        let downloads: Vec<(String, ActiveDownload)> = self.downloads.drain().collect();
        for (_, dl) in downloads {
            drop(dl.file);
            let _ = tokio::fs::remove_file(&dl.path).await;
            self.emit(Event::TransferFailed {
                file_name: dl.file_name,
                reason: "connection lost".to_owned(),
            });
        }
    }
}

async fn run_upload(
    endpoint: Arc<Endpoint>,
    my_id: String,
    target: String,
    transfer_id: String,
    path: PathBuf,
    cancel: CancellationToken,
    done: mpsc::UnboundedSender<UploadOutcome>,
) {
    let result = stream_file(&endpoint, &my_id, &target, &transfer_id, &path, &cancel).await;
    if let Err(reason) = &result {
        let end = Message::FileEnd {
            sender: my_id,
            target,
            transfer_id: transfer_id.clone(),
            success: false,
            error: reason.clone(),
        };
        let _ = endpoint.send(&end).await;
    }
    let _ = done.send(UploadOutcome {
        transfer_id,
        result,
    });
}

/// Read the file in CHUNK_SIZE blocks and stream them with consecutive
/// sequence numbers, then close with a successful FILE_END. An empty file
/// produces no chunks, only the FILE_END.
async fn stream_file(
    endpoint: &Endpoint,
    my_id: &str,
    target: &str,
    transfer_id: &str,
    path: &Path,
    cancel: &CancellationToken,
) -> Result<u64, String> {
    let mut file = File::open(path).await.map_err(|e| e.to_string())?;
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut seq: i32 = 0;
    let mut sent: u64 = 0;
    loop {
        if cancel.is_cancelled() {
            return Err("transfer cancelled".to_owned());
        }
        let n = read_chunk(&mut file, &mut buf).await.map_err(|e| e.to_string())?;
        if n == 0 {
            break;
        }
        let msg = Message::FileData {
            sender: my_id.to_owned(),
            target: target.to_owned(),
            transfer_id: transfer_id.to_owned(),
            seq,
            data: buf[..n].to_vec(),
        };
        endpoint.send(&msg).await.map_err(|e| e.to_string())?;
        seq += 1;
        sent += n as u64;
    }
    let end = Message::FileEnd {
        sender: my_id.to_owned(),
        target: target.to_owned(),
        transfer_id: transfer_id.to_owned(),
        success: true,
        error: String::new(),
    };
    endpoint.send(&end).await.map_err(|e| e.to_string())?;
    Ok(sent)
}

/// Fill `buf` from the file; only the final chunk may come back short.
async fn read_chunk(file: &mut File, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = file.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// Destination path under `dir` for `name` (basename only), appending `_N`
/// before the extension until the name is free.
fn unique_dest(dir: &Path, name: &str) -> PathBuf {
    let base = Path::new(name)
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| OsString::from("download"));
    let candidate = dir.join(&base);
    if !candidate.exists() {
        return candidate;
    }
    let base = base.to_string_lossy();
    let (stem, ext) = match base.rsplit_once('.') {
        Some((s, e)) if !s.is_empty() => (s.to_owned(), Some(e.to_owned())),
        _ => (base.into_owned(), None),
    };
    let mut n = 1u32;
    loop {
        let alt = match &ext {
            Some(e) => format!("{stem}_{n}.{e}"),
            None => format!("{stem}_{n}"),
        };
        let path = dir.join(alt);
        if !path.exists() {
            return path;
        }
        n += 1;
    }
}
