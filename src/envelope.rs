// P2P Chat - peer-to-peer chat node with presence and reliable file transfer
// over direct TCP connections, no central server.
//
// Adapted from Lrthrome's `protocol.rs` (Copyright (C) 2021 rumblefrog),
// rewritten to frame newline-delimited JSON instead of a binary nom-parsed
// wire format.

use serde::{Deserialize, Serialize};

/// A single newline-terminated JSON message exchanged between peers.
///
/// Envelopes are separated on the wire by a single `\n` byte; an
/// envelope body must not itself contain an unescaped newline (this
/// holds automatically for compact `serde_json` output).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Envelope {
    Heartbeat {
        timestamp: f64,
    },

    Chat {
        sender: String,
        content: String,
        timestamp: f64,
    },

    Presence {
        username: String,
        status: PresenceStatus,
        timestamp: f64,
    },

    System {
        content: String,
        timestamp: f64,
    },

    FileMetadata {
        transfer_id: String,
        file_name: String,
        file_size: u64,
        chunk_size: usize,
        total_chunks: u64,
        file_hash: String,
        sender: String,
        timestamp: f64,
    },

    FileChunk {
        transfer_id: String,
        chunk_index: u64,
        data: String,
        sender: String,
        timestamp: f64,
    },

    FileChunkAck {
        transfer_id: String,
        chunk_index: u64,
        timestamp: f64,
    },

    FileChunkRequest {
        transfer_id: String,
        chunks: Vec<u64>,
        timestamp: f64,
    },

    FileTransferComplete {
        transfer_id: String,
        sender: String,
        timestamp: f64,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Online,
    Offline,
}

impl Envelope {
    /// Fingerprint used for duplicate suppression: `"{timestamp}_{sender}"`.
    ///
    /// Envelopes lacking both fields (heartbeat, acks, requests,
    /// completion) all collapse onto the same `"None_None"` fingerprint —
    /// this is a documented quirk of the protocol, not fixed here.
    pub fn fingerprint(&self) -> String {
        let (timestamp, sender) = match self {
            Envelope::Heartbeat { .. } => (None, None),
            Envelope::Chat {
                sender, timestamp, ..
            } => (Some(*timestamp), Some(sender.as_str())),
            Envelope::Presence { timestamp, .. } => (Some(*timestamp), None),
            Envelope::System { timestamp, .. } => (Some(*timestamp), None),
            Envelope::FileMetadata {
                sender, timestamp, ..
            } => (Some(*timestamp), Some(sender.as_str())),
            Envelope::FileChunk {
                sender, timestamp, ..
            } => (Some(*timestamp), Some(sender.as_str())),
            Envelope::FileChunkAck { .. } => (None, None),
            Envelope::FileChunkRequest { .. } => (None, None),
            Envelope::FileTransferComplete { .. } => (None, None),
        };

        format!(
            "{}_{}",
            timestamp
                .map(|t| t.to_string())
                .unwrap_or_else(|| "None".to_string()),
            sender.unwrap_or("None")
        )
    }

    /// Serialize this envelope as a single line ready to write to a peer
    /// socket: compact JSON followed by a trailing `\n`.
    pub fn to_line(&self) -> serde_json::Result<Vec<u8>> {
        let mut bytes = serde_json::to_vec(self)?;
        bytes.push(b'\n');
        Ok(bytes)
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Envelope::Heartbeat { .. } => "heartbeat",
            Envelope::Chat { .. } => "chat",
            Envelope::Presence { .. } => "presence",
            Envelope::System { .. } => "system",
            Envelope::FileMetadata { .. } => "file_metadata",
            Envelope::FileChunk { .. } => "file_chunk",
            Envelope::FileChunkAck { .. } => "file_chunk_ack",
            Envelope::FileChunkRequest { .. } => "file_chunk_request",
            Envelope::FileTransferComplete { .. } => "file_transfer_complete",
        }
    }
}

/// Seconds since the Unix epoch, as a float (fractional seconds allowed).
pub fn now_timestamp() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}
