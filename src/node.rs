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

//! Composes [`Transport`], [`PresenceLayer`], and [`FileTransferManager`]
//! into the single object application code talks to. Grounded on
//! `ChatRoom` in `chat.py`, which owned a `ChatNetwork` and a
//! `FileTransferManager` the same way.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;
use crate::envelope::Envelope;
use crate::error::{ChatError, ChatResult};
use crate::file_transfer::{FileTransferManager, TransferStatusInfo};
use crate::presence::{MessageCallback, Notification, PresenceLayer};
use crate::transport::{OnMessage, PeerAddr, Transport};

pub struct Node {
    transport: Arc<Transport>,
    presence: Arc<PresenceLayer>,
    file_transfer: Arc<FileTransferManager>,
}

impl Node {
    pub async fn new(config: &Config) -> ChatResult<Self> {
        let general = &config.general;
        let (host, port) = parse_bind_address(&general.bind_address)?;

        let transport = Arc::new(Transport::new(
            host,
            port,
            Duration::from_secs(general.heartbeat_interval_secs),
            Duration::from_secs(general.connection_timeout_secs),
            general.message_ttl,
        ));

        let presence = Arc::new(PresenceLayer::new(general.username.clone(), transport.clone()));

        let file_transfer = Arc::new(
            FileTransferManager::new(
                transport.clone(),
                presence.clone(),
                general.username.clone(),
                general,
            )
            .await?,
        );

        Ok(Self {
            transport,
            presence,
            file_transfer,
        })
    }

    /// Binds the listen socket, announces `online` presence, and starts
    /// every background worker (heartbeat, presence refresh, transfer
    /// monitor).
    pub async fn start(&self) -> ChatResult<()> {
        let presence = self.presence.clone();
        let file_transfer = self.file_transfer.clone();

        let on_message: OnMessage = Arc::new(move |address, envelope| {
            let presence = presence.clone();
            let file_transfer = file_transfer.clone();
            tokio::spawn(async move {
                dispatch(&presence, &file_transfer, address, envelope).await;
            });
        });

        self.transport.start(on_message).await?;
        self.presence.start().await;
        self.file_transfer.start().await;

        Ok(())
    }

    /// Cancel the periodic refresh, announce `offline`, stop the
    /// transfer monitor, then tear down the transport. Order matters:
    /// the offline presence broadcast must still have live peer sockets
    /// to send through.
    pub async fn stop(&self) {
        self.presence.stop().await;
        self.file_transfer.stop().await;
        self.transport.stop().await;
    }

    pub async fn connect_to_peer(&self, host: &str, port: u16) -> ChatResult<bool> {
        self.presence.connect_to_peer(host, port).await
    }

    pub async fn send_message(&self, content: &str) -> bool {
        self.presence.send_message(content).await
    }

    pub async fn send_file(&self, file_path: impl AsRef<Path>) -> bool {
        self.file_transfer.send_file(file_path).await
    }

    pub async fn register_message_callback(&self, callback: MessageCallback) {
        self.presence.register_callback(callback).await;
    }

    pub async fn get_transfer_status(&self, transfer_id: &str) -> Option<TransferStatusInfo> {
        self.file_transfer.get_transfer_status(transfer_id).await
    }

    pub async fn online_users(&self) -> Vec<String> {
        self.presence.online_usernames().await
    }

    pub async fn message_history(&self) -> Vec<Notification> {
        self.presence.message_history().await
    }

    pub async fn connected_peers(&self) -> Vec<PeerAddr> {
        self.transport.connected_peers().await
    }

    pub fn port(&self) -> u16 {
        self.transport.port()
    }
}

/// Routes one parsed inbound envelope to the presence layer or the
/// file-transfer layer by type, mirroring `ChatRoom._handle_message`'s
/// dispatch table. `Heartbeat` never reaches here: Transport filters it
/// before invoking `on_message`.
async fn dispatch(
    presence: &Arc<PresenceLayer>,
    file_transfer: &Arc<FileTransferManager>,
    address: PeerAddr,
    envelope: Envelope,
) {
    match &envelope {
        Envelope::Heartbeat { .. } => {}
        Envelope::Chat { .. } => presence.handle_chat(&envelope).await,
        Envelope::Presence { .. } => presence.handle_presence(address, &envelope).await,
        Envelope::System { .. } => presence.handle_system(&envelope).await,
        Envelope::FileMetadata { .. }
        | Envelope::FileChunk { .. }
        | Envelope::FileChunkAck { .. }
        | Envelope::FileChunkRequest { .. }
        | Envelope::FileTransferComplete { .. } => {
            file_transfer.handle_file_message(&envelope).await
        }
    }
}

fn parse_bind_address(bind_address: &str) -> ChatResult<(String, u16)> {
    let addr: SocketAddr = bind_address.parse().map_err(|_| {
        ChatError::IoError(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("invalid bind_address: {}", bind_address),
        ))
    })?;
    Ok((addr.ip().to_string(), addr.port()))
}
