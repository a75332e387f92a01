// P2P Chat - peer-to-peer chat node with presence and reliable file transfer
// over direct TCP connections, no central server.
// Copyright (C) 2021  rumblefrog
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

//! Chunking, transmission, and reassembly of files broadcast over the
//! transport layer. Grounded on the original `FileTransferManager` in
//! `file_transfer.py`; reorganized into the `Shared` + free-function
//! worker shape `crate::transport` already uses, rather than methods on
//! `self`, since the sending/monitor workers here are long-lived tasks
//! spawned independently of the manager's own lifetime.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use md5::{Digest, Md5};
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::config::General;
use crate::envelope::{now_timestamp, Envelope};
use crate::error::ChatResult;
use crate::presence::{Notification, PresenceLayer};
use crate::transport::Transport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    Sending,
    Receiving,
    Completed,
    Failed,
}

/// Where a received chunk's decoded bytes live until assembly.
///
/// A tagged variant rather than the original's "string that happens to
/// be a path vs. raw bytes" duck-typing.
#[derive(Clone)]
enum ChunkStorage {
    InMemory(Vec<u8>),
    OnDisk(PathBuf),
}

struct OutgoingTransfer {
    file_path: PathBuf,
    file_name: String,
    total_chunks: u64,
    last_activity: Instant,
    status: TransferStatus,
    acked_chunks: HashSet<u64>,
    retry_counts: HashMap<u64, u32>,
}

struct IncomingTransfer {
    file_path: PathBuf,
    total_chunks: u64,
    file_hash: String,
    sender: String,
    received_chunks: HashMap<u64, ChunkStorage>,
    /// Held only to keep the directory alive; dropped (and removed from
    /// disk) when the transfer is removed from `incoming`, whether on
    /// success, on `stop()`, or never explicitly (large-file path
    /// unused).
    temp_dir: Option<TempDir>,
    last_activity: Instant,
    status: TransferStatus,
}

struct CompletedTransfer {
    file_name: String,
    sender: String,
    completed_at: f64,
}

/// Snapshot returned by [`FileTransferManager::get_transfer_status`].
#[derive(Debug, Clone)]
pub struct TransferStatusInfo {
    pub status: TransferStatus,
    pub progress: f64,
    pub file_name: String,
    pub sender: Option<String>,
    pub completed_at: Option<f64>,
}

struct Shared {
    transport: Arc<Transport>,
    presence: Arc<PresenceLayer>,
    username: String,
    download_dir: PathBuf,
    chunk_size: usize,
    transfer_timeout: Duration,
    large_file_threshold: u64,
    outgoing: Mutex<HashMap<String, OutgoingTransfer>>,
    incoming: Mutex<HashMap<String, IncomingTransfer>>,
    completed: Mutex<HashMap<String, CompletedTransfer>>,
}

/// Chunks files for outbound transfer and reassembles inbound ones.
///
/// Holds `Arc<Transport>` + a username directly rather than routing
/// through a separate capability trait: `Transport::broadcast` and a
/// plain `String` already are exactly the narrow surface the original
/// back-reference calls for, and neither type refers back to this one,
/// so no reference cycle exists to design around. The extra
/// `Arc<PresenceLayer>` handle exists only so the 5-second timeout
/// monitor — which runs independently of any inbound message — can
/// deliver stalled-transfer notifications to the same callback list the
/// chat layer uses, without the Node façade having to poll this module.
pub struct FileTransferManager {
    shared: Arc<Shared>,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl FileTransferManager {
    pub async fn new(
        transport: Arc<Transport>,
        presence: Arc<PresenceLayer>,
        username: impl Into<String>,
        config: &General,
    ) -> ChatResult<Self> {
        let download_dir = PathBuf::from(&config.download_dir);
        tokio::fs::create_dir_all(&download_dir).await?;

        Ok(Self {
            shared: Arc::new(Shared {
                transport,
                presence,
                username: username.into(),
                download_dir,
                chunk_size: config.chunk_size,
                transfer_timeout: Duration::from_secs(config.transfer_timeout_secs),
                large_file_threshold: config.large_file_threshold_bytes,
                outgoing: Mutex::new(HashMap::new()),
                incoming: Mutex::new(HashMap::new()),
                completed: Mutex::new(HashMap::new()),
            }),
            monitor: Mutex::new(None),
        })
    }

    /// Spawn the 5-second timeout-monitor worker.
    pub async fn start(&self) {
        let shared = self.shared.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(5));
            loop {
                ticker.tick().await;
                monitor_tick(&shared).await;
            }
        });
        *self.monitor.lock().await = Some(handle);
    }

    /// Stop the monitor and drop all in-progress incoming transfers,
    /// removing their temp directories.
    pub async fn stop(&self) {
        if let Some(handle) = self.monitor.lock().await.take() {
            handle.abort();
        }
        self.shared.incoming.lock().await.clear();
    }

    /// Broadcast file metadata, register the transfer, and hand off
    /// chunk sending to a background worker. Returns `false` if the
    /// file doesn't exist or broadcasting metadata finds no peers.
    pub async fn send_file(&self, file_path: impl AsRef<Path>) -> bool {
        let file_path = file_path.as_ref().to_path_buf();

        let metadata = match tokio::fs::metadata(&file_path).await {
            Ok(m) => m,
            Err(_) => return false,
        };
        let file_size = metadata.len();
        let file_name = file_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();

        let file_hash = match hash_file(&file_path).await {
            Ok(h) => h,
            Err(_) => return false,
        };

        let chunk_size = self.shared.chunk_size as u64;
        let total_chunks = (file_size + chunk_size - 1) / chunk_size;
        let transfer_id = format!(
            "{}_{}_{}",
            now_timestamp() as u64,
            self.shared.username,
            file_name
        );

        {
            let mut outgoing = self.shared.outgoing.lock().await;
            outgoing.insert(
                transfer_id.clone(),
                OutgoingTransfer {
                    file_path: file_path.clone(),
                    file_name: file_name.clone(),
                    total_chunks,
                    last_activity: Instant::now(),
                    status: TransferStatus::Sending,
                    acked_chunks: HashSet::new(),
                    retry_counts: HashMap::new(),
                },
            );
        }

        let metadata_envelope = Envelope::FileMetadata {
            transfer_id: transfer_id.clone(),
            file_name,
            file_size,
            chunk_size: self.shared.chunk_size,
            total_chunks,
            file_hash,
            sender: self.shared.username.clone(),
            timestamp: now_timestamp(),
        };

        if !self.shared.transport.broadcast(&metadata_envelope).await {
            self.shared.outgoing.lock().await.remove(&transfer_id);
            return false;
        }

        let shared = self.shared.clone();
        tokio::spawn(async move {
            send_file_chunks(shared, transfer_id).await;
        });

        true
    }

    /// Dispatch target for every `file_*` envelope type (called by
    /// [`crate::node::Node`]'s inbound-envelope dispatch).
    pub async fn handle_file_message(&self, envelope: &Envelope) {
        match envelope {
            Envelope::FileMetadata { .. } => handle_file_metadata(&self.shared, envelope).await,
            Envelope::FileChunk { .. } => handle_file_chunk(&self.shared, envelope).await,
            Envelope::FileTransferComplete { .. } => {
                handle_transfer_complete(&self.shared, envelope).await
            }
            Envelope::FileChunkAck { .. } => handle_chunk_ack(&self.shared, envelope).await,
            Envelope::FileChunkRequest { .. } => handle_chunk_request(&self.shared, envelope).await,
            _ => {}
        }
    }

    pub async fn get_transfer_status(&self, transfer_id: &str) -> Option<TransferStatusInfo> {
        if let Some(t) = self.shared.incoming.lock().await.get(transfer_id) {
            let progress = (t.received_chunks.len() as f64 / t.total_chunks as f64) * 100.0;
            return Some(TransferStatusInfo {
                status: t.status,
                progress,
                file_name: file_name_of(&t.file_path),
                sender: Some(t.sender.clone()),
                completed_at: None,
            });
        }

        if let Some(t) = self.shared.outgoing.lock().await.get(transfer_id) {
            let progress = (t.acked_chunks.len() as f64 / t.total_chunks as f64) * 100.0;
            return Some(TransferStatusInfo {
                status: t.status,
                progress,
                file_name: t.file_name.clone(),
                sender: None,
                completed_at: None,
            });
        }

        if let Some(t) = self.shared.completed.lock().await.get(transfer_id) {
            return Some(TransferStatusInfo {
                status: TransferStatus::Completed,
                progress: 100.0,
                file_name: t.file_name.clone(),
                sender: Some(t.sender.clone()),
                completed_at: Some(t.completed_at),
            });
        }

        None
    }
}

fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default()
}

/// Human-readable byte count, e.g. `"4.1 MB"`.
fn format_size(size_bytes: u64) -> String {
    const KB: f64 = 1024.0;
    const MB: f64 = KB * 1024.0;
    const GB: f64 = MB * 1024.0;

    let bytes = size_bytes as f64;
    if bytes < KB {
        format!("{} B", size_bytes)
    } else if bytes < MB {
        format!("{:.1} KB", bytes / KB)
    } else if bytes < GB {
        format!("{:.1} MB", bytes / MB)
    } else {
        format!("{:.1} GB", bytes / GB)
    }
}

async fn hash_file(path: &Path) -> ChatResult<String> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Md5::new();
    let mut buf = vec![0u8; 4096];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

async fn send_file_chunks(shared: Arc<Shared>, transfer_id: String) {
    let total_chunks = {
        let outgoing = shared.outgoing.lock().await;
        match outgoing.get(&transfer_id) {
            Some(t) => t.total_chunks,
            None => return,
        }
    };

    for chunk_index in 0..total_chunks {
        send_file_chunk(&shared, &transfer_id, chunk_index).await;
        if chunk_index % 10 == 0 {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    let wait_start = Instant::now();
    loop {
        let (exists, done) = {
            let outgoing = shared.outgoing.lock().await;
            match outgoing.get(&transfer_id) {
                Some(t) => (true, t.acked_chunks.len() as u64 >= t.total_chunks),
                None => (false, false),
            }
        };
        if !exists || done || wait_start.elapsed() > Duration::from_secs(30) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }

    {
        let mut outgoing = shared.outgoing.lock().await;
        if let Some(t) = outgoing.get_mut(&transfer_id) {
            if t.acked_chunks.len() as u64 >= t.total_chunks {
                t.status = TransferStatus::Completed;
            }
        }
    }

    let complete = Envelope::FileTransferComplete {
        transfer_id: transfer_id.clone(),
        sender: shared.username.clone(),
        timestamp: now_timestamp(),
    };
    shared.transport.broadcast(&complete).await;
}

async fn send_file_chunk(shared: &Arc<Shared>, transfer_id: &str, chunk_index: u64) -> bool {
    let file_path = {
        let mut outgoing = shared.outgoing.lock().await;
        match outgoing.get_mut(transfer_id) {
            Some(t) => {
                t.last_activity = Instant::now();
                t.file_path.clone()
            }
            None => return false,
        }
    };

    let mut file = match tokio::fs::File::open(&file_path).await {
        Ok(f) => f,
        Err(e) => {
            log::error!("error opening {} for chunk {}: {}", file_path.display(), chunk_index, e);
            return false;
        }
    };

    let offset = chunk_index * shared.chunk_size as u64;
    if let Err(e) = file.seek(std::io::SeekFrom::Start(offset)).await {
        log::error!("error seeking chunk {} of {}: {}", chunk_index, transfer_id, e);
        return false;
    }

    let mut buf = vec![0u8; shared.chunk_size];
    let n = match file.read(&mut buf).await {
        Ok(n) => n,
        Err(e) => {
            log::error!("error reading chunk {} of {}: {}", chunk_index, transfer_id, e);
            return false;
        }
    };
    if n == 0 {
        return false;
    }
    buf.truncate(n);

    let envelope = Envelope::FileChunk {
        transfer_id: transfer_id.to_string(),
        chunk_index,
        data: base64::encode(&buf),
        sender: shared.username.clone(),
        timestamp: now_timestamp(),
    };

    shared.transport.broadcast(&envelope).await
}

async fn handle_file_metadata(shared: &Arc<Shared>, envelope: &Envelope) {
    let Envelope::FileMetadata {
        transfer_id,
        file_name,
        file_size,
        total_chunks,
        file_hash,
        sender,
        ..
    } = envelope
    else {
        return;
    };

    let path = Path::new(file_name);
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| file_name.clone());
    let ext = path
        .extension()
        .map(|s| format!(".{}", s.to_string_lossy()))
        .unwrap_or_default();
    let unique_name = format!("{}_{}{}", stem, now_timestamp() as u64, ext);
    let save_path = shared.download_dir.join(unique_name);

    let temp_dir = if *file_size > shared.large_file_threshold {
        match tempfile::Builder::new()
            .prefix(&format!("filetransfer_{}_", transfer_id))
            .tempdir()
        {
            Ok(dir) => Some(dir),
            Err(e) => {
                log::error!("failed to create temp dir for {}: {}", transfer_id, e);
                None
            }
        }
    } else {
        None
    };

    shared.incoming.lock().await.insert(
        transfer_id.clone(),
        IncomingTransfer {
            file_path: save_path,
            total_chunks: *total_chunks,
            file_hash: file_hash.clone(),
            sender: sender.clone(),
            received_chunks: HashMap::new(),
            temp_dir,
            last_activity: Instant::now(),
            status: TransferStatus::Receiving,
        },
    );

    shared
        .presence
        .notify_external(Notification::System {
            content: format!(
                "Receiving file '{}' ({}) from {}...",
                file_name,
                format_size(*file_size),
                sender
            ),
            timestamp: now_timestamp(),
        })
        .await;
}

async fn handle_file_chunk(shared: &Arc<Shared>, envelope: &Envelope) {
    let Envelope::FileChunk {
        transfer_id,
        chunk_index,
        data,
        ..
    } = envelope
    else {
        return;
    };

    let exists = shared.incoming.lock().await.contains_key(transfer_id);
    if !exists {
        return;
    }

    {
        let mut incoming = shared.incoming.lock().await;
        if let Some(t) = incoming.get_mut(transfer_id) {
            t.last_activity = Instant::now();
        }
    }

    let ack = Envelope::FileChunkAck {
        transfer_id: transfer_id.clone(),
        chunk_index: *chunk_index,
        timestamp: now_timestamp(),
    };
    shared.transport.broadcast(&ack).await;

    let decoded = match base64::decode(data) {
        Ok(d) => d,
        Err(e) => {
            shared
                .presence
                .notify_external(Notification::System {
                    content: format!("Error processing file chunk: {}", e),
                    timestamp: now_timestamp(),
                })
                .await;
            return;
        }
    };

    let temp_dir_path = {
        let incoming = shared.incoming.lock().await;
        incoming
            .get(transfer_id)
            .and_then(|t| t.temp_dir.as_ref().map(|d| d.path().to_path_buf()))
    };

    let storage = if let Some(dir) = temp_dir_path {
        let chunk_path = dir.join(format!("chunk_{}", chunk_index));
        match tokio::fs::write(&chunk_path, &decoded).await {
            Ok(()) => ChunkStorage::OnDisk(chunk_path),
            Err(e) => {
                shared
                    .presence
                    .notify_external(Notification::System {
                        content: format!("Error processing file chunk: {}", e),
                        timestamp: now_timestamp(),
                    })
                    .await;
                return;
            }
        }
    } else {
        ChunkStorage::InMemory(decoded)
    };

    let (should_notify, sender, progress) = {
        let mut incoming = shared.incoming.lock().await;
        let Some(t) = incoming.get_mut(transfer_id) else {
            return;
        };
        t.received_chunks.insert(*chunk_index, storage);
        let received = t.received_chunks.len() as u64;
        let total = t.total_chunks;
        let step = (total / 20).max(1);
        (
            received % step == 0,
            t.sender.clone(),
            (received as f64 / total as f64) * 100.0,
        )
    };

    if should_notify {
        shared
            .presence
            .notify_external(Notification::System {
                content: format!("File transfer from {}: {}% complete", sender, progress as u64),
                timestamp: now_timestamp(),
            })
            .await;
    }
}

async fn handle_chunk_ack(shared: &Arc<Shared>, envelope: &Envelope) {
    let Envelope::FileChunkAck {
        transfer_id,
        chunk_index,
        ..
    } = envelope
    else {
        return;
    };

    let notify = {
        let mut outgoing = shared.outgoing.lock().await;
        let Some(t) = outgoing.get_mut(transfer_id) else {
            return;
        };
        t.acked_chunks.insert(*chunk_index);
        t.last_activity = Instant::now();

        let total = t.total_chunks;
        let acked = t.acked_chunks.len() as u64;
        let step = (total / 20).max(1);

        if acked == total || acked % step == 0 {
            Some((acked, total))
        } else {
            None
        }
    };

    if let Some((acked, total)) = notify {
        let progress = (acked as f64 / total as f64) * 100.0;
        shared
            .presence
            .notify_external(Notification::System {
                content: format!(
                    "File upload progress: {}% ({}/{} chunks)",
                    progress as u64, acked, total
                ),
                timestamp: now_timestamp(),
            })
            .await;
    }
}

async fn handle_chunk_request(shared: &Arc<Shared>, envelope: &Envelope) {
    let Envelope::FileChunkRequest {
        transfer_id,
        chunks,
        ..
    } = envelope
    else {
        return;
    };

    let exists = shared.outgoing.lock().await.contains_key(transfer_id);
    if !exists {
        return;
    }

    for &chunk_index in chunks {
        send_file_chunk(shared, transfer_id, chunk_index).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

async fn handle_transfer_complete(shared: &Arc<Shared>, envelope: &Envelope) {
    let Envelope::FileTransferComplete { transfer_id, .. } = envelope else {
        return;
    };

    let (total, received) = {
        let incoming = shared.incoming.lock().await;
        match incoming.get(transfer_id) {
            Some(t) => (t.total_chunks, t.received_chunks.len() as u64),
            None => {
                shared
                    .presence
                    .notify_external(Notification::System {
                        content: "received file transfer completion for unknown transfer"
                            .to_string(),
                        timestamp: now_timestamp(),
                    })
                    .await;
                return;
            }
        }
    };

    if received != total {
        let missing = total - received;
        let requested = request_missing_chunks(shared, transfer_id).await;
        if !requested {
            shared
                .presence
                .notify_external(Notification::System {
                    content: format!(
                        "File transfer incomplete: Missing {} chunks. Requesting missing data...",
                        missing
                    ),
                    timestamp: now_timestamp(),
                })
                .await;
        }
        return;
    }

    assemble_transfer(shared, transfer_id).await;
}

/// Shared by the `file_transfer_complete` handler and the timeout
/// monitor. Returns `false` (no request issued) when the transfer is
/// unknown or already complete.
async fn request_missing_chunks(shared: &Arc<Shared>, transfer_id: &str) -> bool {
    let missing: Vec<u64> = {
        let mut incoming = shared.incoming.lock().await;
        let Some(t) = incoming.get_mut(transfer_id) else {
            return false;
        };
        t.last_activity = Instant::now();
        (0..t.total_chunks)
            .filter(|i| !t.received_chunks.contains_key(i))
            .collect()
    };

    if missing.is_empty() {
        return false;
    }

    let capped: Vec<u64> = missing.into_iter().take(50).collect();
    let count = capped.len();

    let request = Envelope::FileChunkRequest {
        transfer_id: transfer_id.to_string(),
        chunks: capped,
        timestamp: now_timestamp(),
    };
    shared.transport.broadcast(&request).await;

    shared
        .presence
        .notify_external(Notification::System {
            content: format!("Transfer stalled. Requesting {} missing chunks...", count),
            timestamp: now_timestamp(),
        })
        .await;

    true
}

async fn assemble_transfer(shared: &Arc<Shared>, transfer_id: &str) {
    let (file_path, total_chunks, file_hash, sender) = {
        let incoming = shared.incoming.lock().await;
        match incoming.get(transfer_id) {
            Some(t) => (
                t.file_path.clone(),
                t.total_chunks,
                t.file_hash.clone(),
                t.sender.clone(),
            ),
            None => return,
        }
    };

    let assemble_result = assemble_file(shared, transfer_id, &file_path, total_chunks).await;
    if let Err(e) = assemble_result {
        shared
            .presence
            .notify_external(Notification::System {
                content: format!("Error saving file: {}", e),
                timestamp: now_timestamp(),
            })
            .await;
        return;
    }

    let calculated = match hash_file(&file_path).await {
        Ok(h) => h,
        Err(e) => {
            shared
                .presence
                .notify_external(Notification::System {
                    content: format!("Error saving file: {}", e),
                    timestamp: now_timestamp(),
                })
                .await;
            return;
        }
    };

    if calculated != file_hash {
        let _ = tokio::fs::remove_file(&file_path).await;
        if let Some(t) = shared.incoming.lock().await.get_mut(transfer_id) {
            t.status = TransferStatus::Failed;
        }
        shared
            .presence
            .notify_external(Notification::System {
                content: "File transfer failed: Hash verification failed".to_string(),
                timestamp: now_timestamp(),
            })
            .await;
        return;
    }

    let file_name = file_name_of(&file_path);

    shared.incoming.lock().await.remove(transfer_id);
    shared.completed.lock().await.insert(
        transfer_id.to_string(),
        CompletedTransfer {
            file_name: file_name.clone(),
            sender,
            completed_at: now_timestamp(),
        },
    );

    shared
        .presence
        .notify_external(Notification::System {
            content: format!("File received successfully: {}", file_name),
            timestamp: now_timestamp(),
        })
        .await;
}

async fn assemble_file(
    shared: &Arc<Shared>,
    transfer_id: &str,
    file_path: &Path,
    total_chunks: u64,
) -> std::io::Result<()> {
    let mut out = tokio::fs::File::create(file_path).await?;

    for i in 0..total_chunks {
        let storage = {
            let incoming = shared.incoming.lock().await;
            incoming
                .get(transfer_id)
                .and_then(|t| t.received_chunks.get(&i).cloned())
        };

        if let Some(storage) = storage {
            match storage {
                ChunkStorage::InMemory(bytes) => out.write_all(&bytes).await?,
                ChunkStorage::OnDisk(path) => {
                    let bytes = tokio::fs::read(&path).await?;
                    out.write_all(&bytes).await?;
                }
            }
        }
    }

    out.flush().await
}

async fn monitor_tick(shared: &Arc<Shared>) {
    let stalled_outgoing: Vec<String> = {
        let outgoing = shared.outgoing.lock().await;
        outgoing
            .iter()
            .filter(|(_, t)| {
                t.status == TransferStatus::Sending
                    && t.last_activity.elapsed() > shared.transfer_timeout
            })
            .map(|(id, _)| id.clone())
            .collect()
    };
    for transfer_id in stalled_outgoing {
        resume_stalled_transfer(shared, &transfer_id).await;
    }

    let stalled_incoming: Vec<String> = {
        let incoming = shared.incoming.lock().await;
        incoming
            .iter()
            .filter(|(_, t)| t.last_activity.elapsed() > shared.transfer_timeout)
            .map(|(id, _)| id.clone())
            .collect()
    };
    for transfer_id in stalled_incoming {
        request_missing_chunks(shared, &transfer_id).await;
    }
}

async fn resume_stalled_transfer(shared: &Arc<Shared>, transfer_id: &str) {
    let missing: Vec<u64> = {
        let mut outgoing = shared.outgoing.lock().await;
        let Some(t) = outgoing.get_mut(transfer_id) else {
            return;
        };
        t.last_activity = Instant::now();
        (0..t.total_chunks)
            .filter(|i| !t.acked_chunks.contains(i))
            .collect()
    };

    for &chunk_index in missing.iter().take(20) {
        send_file_chunk(shared, transfer_id, chunk_index).await;
        let mut outgoing = shared.outgoing.lock().await;
        if let Some(t) = outgoing.get_mut(transfer_id) {
            *t.retry_counts.entry(chunk_index).or_insert(0) += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::PresenceStatus;

    fn test_config() -> General {
        General {
            username: "alice".into(),
            bind_address: "127.0.0.1".into(),
            download_dir: std::env::temp_dir()
                .join(format!("p2p_chat_test_{}", std::process::id()))
                .to_string_lossy()
                .to_string(),
            heartbeat_interval_secs: 5,
            connection_timeout_secs: 15,
            message_ttl: 100,
            chunk_size: 16,
            retry_limit: 3,
            chunk_timeout_secs: 10,
            transfer_timeout_secs: 60,
            large_file_threshold_bytes: 64,
        }
    }

    async fn test_manager() -> FileTransferManager {
        let transport = Arc::new(Transport::new(
            "127.0.0.1",
            0,
            Duration::from_secs(5),
            Duration::from_secs(15),
            100,
        ));
        let presence = Arc::new(PresenceLayer::new("alice", transport.clone()));
        FileTransferManager::new(transport, presence, "alice", &test_config())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn send_file_missing_path_returns_false() {
        let manager = test_manager().await;
        assert!(!manager.send_file("/nonexistent/path/to/file").await);
    }

    #[tokio::test]
    async fn send_file_with_no_peers_aborts_transfer() {
        let manager = test_manager().await;
        let file = tempfile::NamedTempFile::new().unwrap();
        tokio::fs::write(file.path(), b"hello world").await.unwrap();

        let sent = manager.send_file(file.path()).await;
        assert!(!sent);
        assert!(manager.shared.outgoing.lock().await.is_empty());
    }

    #[tokio::test]
    async fn format_size_matches_expected_units() {
        assert_eq!(format_size(500), "500 B");
        assert_eq!(format_size(2048), "2.0 KB");
        assert_eq!(format_size(5 * 1024 * 1024), "5.0 MB");
    }

    #[tokio::test]
    async fn large_file_metadata_allocates_temp_dir() {
        let manager = test_manager().await;
        let envelope = Envelope::FileMetadata {
            transfer_id: "t1".into(),
            file_name: "big.bin".into(),
            file_size: 1000,
            chunk_size: 16,
            total_chunks: 63,
            file_hash: "deadbeef".into(),
            sender: "bob".into(),
            timestamp: now_timestamp(),
        };
        manager.handle_file_message(&envelope).await;

        let incoming = manager.shared.incoming.lock().await;
        let transfer = incoming.get("t1").unwrap();
        assert!(transfer.temp_dir.is_some());
    }

    #[tokio::test]
    async fn chunk_ack_for_unknown_transfer_is_ignored() {
        let manager = test_manager().await;
        let envelope = Envelope::FileChunkAck {
            transfer_id: "ghost".into(),
            chunk_index: 0,
            timestamp: now_timestamp(),
        };
        manager.handle_file_message(&envelope).await;
        assert!(manager.get_transfer_status("ghost").await.is_none());
    }

    #[tokio::test]
    async fn small_file_hash_mismatch_marks_failed_and_deletes_destination() {
        let manager = test_manager().await;

        let metadata = Envelope::FileMetadata {
            transfer_id: "t2".into(),
            file_name: "small.txt".into(),
            file_size: 5,
            chunk_size: 16,
            total_chunks: 1,
            file_hash: "0".repeat(32),
            sender: "bob".into(),
            timestamp: now_timestamp(),
        };
        manager.handle_file_message(&metadata).await;

        let chunk = Envelope::FileChunk {
            transfer_id: "t2".into(),
            chunk_index: 0,
            data: base64::encode(b"hello"),
            sender: "bob".into(),
            timestamp: now_timestamp(),
        };
        manager.handle_file_message(&chunk).await;

        let complete = Envelope::FileTransferComplete {
            transfer_id: "t2".into(),
            sender: "bob".into(),
            timestamp: now_timestamp(),
        };
        manager.handle_file_message(&complete).await;

        // The record survives the failed assembly (matching the original,
        // which likewise leaves the entry in `ongoing_transfers`); only its
        // status flips and the partial destination file is removed.
        let incoming = manager.shared.incoming.lock().await;
        let transfer = incoming.get("t2").expect("failed transfer stays recorded");
        assert_eq!(transfer.status, TransferStatus::Failed);
        assert!(!transfer.file_path.exists());
        drop(incoming);

        assert!(manager.shared.completed.lock().await.get("t2").is_none());
    }

    #[test]
    fn presence_status_round_trips_through_envelope() {
        let s = PresenceStatus::Online;
        assert_eq!(s, PresenceStatus::Online);
    }
}
