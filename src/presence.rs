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

//! Tracks known users, bounds chat/system history, and fans notifications
//! out to application callbacks. Grounded on `ChatRoom` in the original
//! implementation's `chat.py`: the dispatch-by-`type` logic there lives
//! one level up in [`crate::node`] here, since Rust's module boundaries
//! make a three-way split (transport/presence/file-transfer) cleaner
//! than one class owning all of it.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::envelope::{now_timestamp, Envelope, PresenceStatus};
use crate::error::ChatResult;
use crate::transport::{PeerAddr, Transport};

const MAX_HISTORY: usize = 100;
const REFRESH_INTERVAL_SECS: u64 = 30;

/// One entry in the user table, keyed by address (not username).
#[derive(Debug, Clone)]
pub struct User {
    pub username: String,
    pub address: PeerAddr,
    pub status: PresenceStatus,
    pub last_seen: f64,
}

/// An application-visible event delivered through a registered callback.
///
/// Unlike [`Envelope`], `UserUpdate` never appears on the wire — it is
/// synthesized locally whenever the user table changes.
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    Chat {
        sender: String,
        content: String,
        timestamp: f64,
    },
    System {
        content: String,
        timestamp: f64,
    },
    UserUpdate {
        users: Vec<String>,
        timestamp: f64,
    },
}

pub type MessageCallback = Arc<dyn Fn(Notification) + Send + Sync>;

pub struct PresenceLayer {
    username: String,
    transport: Arc<Transport>,
    users: Mutex<HashMap<PeerAddr, User>>,
    history: Mutex<VecDeque<Notification>>,
    callbacks: Mutex<Vec<MessageCallback>>,
    refresh_task: Mutex<Option<JoinHandle<()>>>,
}

impl PresenceLayer {
    pub fn new(username: impl Into<String>, transport: Arc<Transport>) -> Self {
        Self {
            username: username.into(),
            transport,
            users: Mutex::new(HashMap::new()),
            history: Mutex::new(VecDeque::new()),
            callbacks: Mutex::new(Vec::new()),
            refresh_task: Mutex::new(None),
        }
    }

    pub async fn register_callback(&self, callback: MessageCallback) {
        self.callbacks.lock().await.push(callback);
    }

    /// Announce `status=online` and begin the periodic peer-list refresh.
    pub async fn start(&self) {
        self.set_status(PresenceStatus::Online).await;

        let this_for_timer = TimerHandle {
            transport: self.transport.clone(),
            username: self.username.clone(),
        };

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(
                REFRESH_INTERVAL_SECS,
            ));
            ticker.tick().await; // first tick fires immediately; skip it
            loop {
                ticker.tick().await;
                this_for_timer.tick().await;
            }
        });

        *self.refresh_task.lock().await = Some(handle);
    }

    /// Broadcast `status=offline` and cancel the refresh timer.
    pub async fn stop(&self) {
        if let Some(handle) = self.refresh_task.lock().await.take() {
            handle.abort();
        }
        self.set_status(PresenceStatus::Offline).await;
    }

    /// Delegate to Transport; on success, immediately unicast a presence
    /// envelope to the new peer and trigger a refresh.
    pub async fn connect_to_peer(&self, host: &str, port: u16) -> ChatResult<bool> {
        let connected = self.transport.connect_to_peer(host, port).await?;
        if connected {
            let envelope = Envelope::Presence {
                username: self.username.clone(),
                status: PresenceStatus::Online,
                timestamp: now_timestamp(),
            };
            let address = (host.to_string(), port);
            self.transport.send_to_peer(&address, &envelope).await;
            self.refresh_peer_list().await;
        }
        Ok(connected)
    }

    /// Build, record, and broadcast a chat envelope.
    pub async fn send_message(&self, content: &str) -> bool {
        let timestamp = now_timestamp();
        let envelope = Envelope::Chat {
            sender: self.username.clone(),
            content: content.to_string(),
            timestamp,
        };

        self.push_history(Notification::Chat {
            sender: self.username.clone(),
            content: content.to_string(),
            timestamp,
        })
        .await;

        self.transport.broadcast(&envelope).await
    }

    /// Dispatch target for inbound `chat` envelopes.
    pub async fn handle_chat(&self, envelope: &Envelope) {
        if let Envelope::Chat {
            sender,
            content,
            timestamp,
        } = envelope
        {
            let notification = Notification::Chat {
                sender: sender.clone(),
                content: content.clone(),
                timestamp: *timestamp,
            };
            self.push_history(notification.clone()).await;
            self.fan_out(notification).await;
        }
    }

    /// Dispatch target for inbound `system` envelopes.
    pub async fn handle_system(&self, envelope: &Envelope) {
        if let Envelope::System { content, timestamp } = envelope {
            let notification = Notification::System {
                content: content.clone(),
                timestamp: *timestamp,
            };
            self.push_history(notification.clone()).await;
            self.fan_out(notification).await;
        }
    }

    /// Dispatch target for inbound `presence` envelopes: upsert the user
    /// table, emit a synthetic "connected" notification on first sight,
    /// then always emit a `user_update`.
    pub async fn handle_presence(&self, address: PeerAddr, envelope: &Envelope) {
        let (username, status) = match envelope {
            Envelope::Presence { username, status, .. } => (username.clone(), *status),
            _ => return,
        };

        let is_new = {
            let users = self.users.lock().await;
            !users.contains_key(&address)
        };

        if is_new {
            let notification = Notification::System {
                content: format!("{} connected", username),
                timestamp: now_timestamp(),
            };
            self.fan_out(notification).await;
        }

        let mut users = self.users.lock().await;
        let entry = users.entry(address.clone()).or_insert_with(|| User {
            username: username.clone(),
            address: address.clone(),
            status,
            last_seen: now_timestamp(),
        });
        entry.username = username;
        entry.status = status;
        entry.last_seen = now_timestamp();
        drop(users);

        let user_update = Notification::UserUpdate {
            users: self.online_usernames().await,
            timestamp: now_timestamp(),
        };
        self.fan_out(user_update).await;
    }

    /// Deliver a notification produced outside this layer (the
    /// file-transfer layer) straight to callbacks, bypassing history.
    pub async fn notify_external(&self, notification: Notification) {
        self.fan_out(notification).await;
    }

    pub async fn online_usernames(&self) -> Vec<String> {
        self.users
            .lock()
            .await
            .values()
            .filter(|u| u.status == PresenceStatus::Online)
            .map(|u| u.username.clone())
            .collect()
    }

    pub async fn message_history(&self) -> Vec<Notification> {
        self.history.lock().await.iter().cloned().collect()
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    async fn set_status(&self, status: PresenceStatus) {
        let envelope = Envelope::Presence {
            username: self.username.clone(),
            status,
            timestamp: now_timestamp(),
        };
        self.transport.broadcast(&envelope).await;
    }

    async fn refresh_peer_list(&self) {
        self.set_status(PresenceStatus::Online).await;
        let user_update = Notification::UserUpdate {
            users: self.online_usernames().await,
            timestamp: now_timestamp(),
        };
        self.fan_out(user_update).await;
    }

    async fn push_history(&self, notification: Notification) {
        let mut history = self.history.lock().await;
        history.push_back(notification);
        if history.len() > MAX_HISTORY {
            history.pop_front();
        }
    }

    async fn fan_out(&self, notification: Notification) {
        let callbacks = self.callbacks.lock().await;
        for callback in callbacks.iter() {
            callback(notification.clone());
        }
    }
}

/// Captures just enough state for the periodic refresh task to run
/// without holding a reference back into `PresenceLayer` (it only needs
/// to broadcast presence; the user-table/history bookkeeping that a full
/// refresh would also touch happens through the normal inbound-presence
/// path on every peer that receives the broadcast).
struct TimerHandle {
    transport: Arc<Transport>,
    username: String,
}

impl TimerHandle {
    async fn tick(&self) {
        let envelope = Envelope::Presence {
            username: self.username.clone(),
            status: PresenceStatus::Online,
            timestamp: now_timestamp(),
        };
        self.transport.broadcast(&envelope).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn test_transport() -> Arc<Transport> {
        Arc::new(Transport::new(
            "127.0.0.1",
            0,
            Duration::from_secs(5),
            Duration::from_secs(15),
            100,
        ))
    }

    #[tokio::test]
    async fn send_message_with_no_peers_returns_false() {
        let layer = PresenceLayer::new("alice", test_transport());
        assert!(!layer.send_message("hi").await);
        assert_eq!(layer.message_history().await.len(), 1);
    }

    #[tokio::test]
    async fn history_is_capped_at_100() {
        let layer = PresenceLayer::new("alice", test_transport());
        for i in 0..150 {
            layer.send_message(&format!("msg {}", i)).await;
        }
        assert_eq!(layer.message_history().await.len(), 100);
    }

    #[tokio::test]
    async fn presence_upsert_emits_connected_then_user_update() {
        let layer = PresenceLayer::new("alice", test_transport());
        let received: Arc<Mutex<Vec<Notification>>> = Arc::new(Mutex::new(Vec::new()));
        let received_clone = received.clone();
        layer
            .register_callback(Arc::new(move |n| {
                let received_clone = received_clone.clone();
                tokio::spawn(async move {
                    received_clone.lock().await.push(n);
                });
            }))
            .await;

        let address = ("10.0.0.5".to_string(), 6000);
        let envelope = Envelope::Presence {
            username: "bob".into(),
            status: PresenceStatus::Online,
            timestamp: now_timestamp(),
        };
        layer.handle_presence(address, &envelope).await;

        tokio::time::sleep(Duration::from_millis(20)).await;

        let got = received.lock().await;
        assert_eq!(got.len(), 2);
        assert!(matches!(&got[0], Notification::System { content, .. } if content == "bob connected"));
        assert!(
            matches!(&got[1], Notification::UserUpdate { users, .. } if users == &vec!["bob".to_string()])
        );
    }
}
