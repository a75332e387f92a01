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

//! Delivers framed JSON envelopes between this node and each connected
//! peer, and detects/removes dead peers. Grounded on
//! `rumblefrog-lrthrome/server/src/lrthrome.rs`'s accept-loop +
//! per-peer-task + periodic-timer shape.

mod codec;

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use socket2::{SockRef, TcpKeepalive};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::codec::FramedRead;

use crate::envelope::{now_timestamp, Envelope};
use crate::error::{ChatError, ChatResult};
use codec::LineJsonCodec;

/// `(host, port)` — the peer socket's remote address.
pub type PeerAddr = (String, u16);

/// Invoked for every non-heartbeat envelope successfully parsed from any
/// peer. Runs on that peer's reader task — not UI-thread-safe.
pub type OnMessage = Arc<dyn Fn(PeerAddr, Envelope) + Send + Sync>;

struct PeerState {
    write_half: Arc<Mutex<OwnedWriteHalf>>,
    last_heartbeat: Instant,
    reader: JoinHandle<()>,
}

struct Shared {
    peers: Mutex<HashMap<PeerAddr, PeerState>>,
    processed_messages: Mutex<HashSet<String>>,
    message_ttl: usize,
    on_message: Mutex<Option<OnMessage>>,
}

pub struct Transport {
    host: String,
    port: u16,
    heartbeat_interval: Duration,
    connection_timeout: Duration,
    shared: Arc<Shared>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Transport {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        heartbeat_interval: Duration,
        connection_timeout: Duration,
        message_ttl: usize,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Self {
            host: host.into(),
            port,
            heartbeat_interval,
            connection_timeout,
            shared: Arc::new(Shared {
                peers: Mutex::new(HashMap::new()),
                processed_messages: Mutex::new(HashSet::new()),
                message_ttl,
                on_message: Mutex::new(None),
            }),
            shutdown_tx,
            shutdown_rx,
            workers: Mutex::new(Vec::new()),
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Bind the listen socket (address reuse enabled, backlog >= 5),
    /// begin accepting, and spawn the heartbeat worker.
    pub async fn start(&self, on_message: OnMessage) -> ChatResult<()> {
        *self.shared.on_message.lock().await = Some(on_message);

        let addr: SocketAddr = format!("{}:{}", self.host, self.port)
            .parse()
            .map_err(|_| {
                ChatError::IoError(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "invalid bind address",
                ))
            })?;

        let socket = socket2::Socket::new(
            socket2::Domain::for_address(addr),
            socket2::Type::STREAM,
            None,
        )?;
        socket.set_reuse_address(true)?;
        socket.bind(&addr.into())?;
        socket.listen(5)?;
        socket.set_nonblocking(true)?;
        let std_listener: std::net::TcpListener = socket.into();
        let listener = TcpListener::from_std(std_listener)?;

        log::info!("chat node listening on {}:{}", self.host, self.port);

        let shared = self.shared.clone();
        let connection_timeout = self.connection_timeout;
        let mut shutdown_rx = self.shutdown_rx.clone();
        let acceptor = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    accepted = listener.accept() => {
                        match accepted {
                            Ok((stream, addr)) => {
                                log::info!("new peer connection from {}", addr);
                                spawn_peer_reader(shared.clone(), stream, connection_timeout).await;
                            }
                            Err(e) => {
                                log::error!("error accepting connection: {}", e);
                            }
                        }
                    }
                }
            }
        });

        let shared = self.shared.clone();
        let heartbeat_interval = self.heartbeat_interval;
        let connection_timeout = self.connection_timeout;
        let mut shutdown_rx = self.shutdown_rx.clone();
        let heartbeat = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(heartbeat_interval);
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        send_heartbeats(&shared).await;
                        reap_stale_peers(&shared, connection_timeout).await;
                    }
                }
            }
        });

        let mut workers = self.workers.lock().await;
        workers.push(acceptor);
        workers.push(heartbeat);

        Ok(())
    }

    /// Refuse self-connection to `(localhost|127.0.0.1, self.port)`.
    pub async fn connect_to_peer(&self, host: &str, port: u16) -> ChatResult<bool> {
        if (host == "localhost" || host == "127.0.0.1") && port == self.port {
            return Err(ChatError::SelfConnect(host.to_string(), port));
        }

        let stream = match TcpStream::connect((host, port)).await {
            Ok(stream) => stream,
            Err(e) => {
                log::warn!("failed to connect to peer {}:{}: {}", host, port, e);
                return Ok(false);
            }
        };

        log::info!("connected to peer {}:{}", host, port);
        spawn_peer_reader(self.shared.clone(), stream, self.connection_timeout).await;

        Ok(true)
    }

    /// Serialize `envelope` and write it atomically to `address`'s
    /// socket. Removes the peer and returns `false` on any I/O failure.
    pub async fn send_to_peer(&self, address: &PeerAddr, envelope: &Envelope) -> bool {
        let write_half = {
            let peers = self.shared.peers.lock().await;
            match peers.get(address) {
                Some(state) => state.write_half.clone(),
                None => return false,
            }
        };

        let line = match envelope.to_line() {
            Ok(line) => line,
            Err(e) => {
                log::error!("failed to serialize envelope: {}", e);
                return false;
            }
        };

        let mut guard = write_half.lock().await;
        match guard.write_all(&line).await {
            Ok(()) => true,
            Err(e) => {
                log::warn!("send error to {:?}: {}", address, e);
                drop(guard);
                remove_peer(&self.shared, address).await;
                false
            }
        }
    }

    /// Send `envelope` to every currently connected peer, tolerating
    /// per-peer failures. Returns `true` if at least one send succeeded.
    pub async fn broadcast(&self, envelope: &Envelope) -> bool {
        let addresses: Vec<PeerAddr> = {
            let peers = self.shared.peers.lock().await;
            peers.keys().cloned().collect()
        };

        let mut any_succeeded = false;
        for address in addresses {
            if self.send_to_peer(&address, envelope).await {
                any_succeeded = true;
            }
        }
        any_succeeded
    }

    pub async fn connected_peers(&self) -> Vec<PeerAddr> {
        self.shared.peers.lock().await.keys().cloned().collect()
    }

    /// Signal shutdown, close all sockets (peers before listener), and
    /// drain workers.
    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(true);

        let mut peers = self.shared.peers.lock().await;
        for (_, state) in peers.drain() {
            state.reader.abort();
        }
        drop(peers);

        let mut workers = self.workers.lock().await;
        for worker in workers.drain(..) {
            worker.abort();
        }
    }

    /// Best-effort reconnect helper. Not wired into the reader loop's
    /// error path — the original is "largely vestigial" and only ever
    /// invoked from explicit call sites, never automatically.
    pub async fn attempt_reconnect(&self, host: &str, port: u16, max_attempts: u32) -> bool {
        for attempt in 0..max_attempts {
            log::info!("attempting to reconnect to {}:{} (try {})", host, port, attempt + 1);
            match self.connect_to_peer(host, port).await {
                Ok(true) => return true,
                _ => tokio::time::sleep(Duration::from_secs(1)).await,
            }
        }
        false
    }
}

fn peer_addr_key(addr: SocketAddr) -> PeerAddr {
    (addr.ip().to_string(), addr.port())
}

async fn spawn_peer_reader(shared: Arc<Shared>, stream: TcpStream, connection_timeout: Duration) {
    if let Err(e) = apply_socket_options(&stream, connection_timeout) {
        log::warn!("failed to set socket options: {}", e);
    }

    let peer_addr = match stream.peer_addr() {
        Ok(addr) => peer_addr_key(addr),
        Err(e) => {
            log::warn!("could not read peer address: {}", e);
            return;
        }
    };

    let (read_half, write_half) = stream.into_split();
    let write_half = Arc::new(Mutex::new(write_half));
    let addr_for_task = peer_addr.clone();
    let shared_for_task = shared.clone();

    let reader = tokio::spawn(async move {
        run_peer_reader(shared_for_task, addr_for_task, read_half, connection_timeout).await;
    });

    let mut peers = shared.peers.lock().await;
    peers.insert(
        peer_addr,
        PeerState {
            write_half,
            last_heartbeat: Instant::now(),
            reader,
        },
    );
}

fn apply_socket_options(stream: &TcpStream, connection_timeout: Duration) -> std::io::Result<()> {
    let sock_ref = SockRef::from(stream);
    sock_ref.set_keepalive(true)?;
    sock_ref.set_tcp_keepalive(&TcpKeepalive::new().with_time(connection_timeout))?;
    Ok(())
}

async fn run_peer_reader(
    shared: Arc<Shared>,
    address: PeerAddr,
    read_half: tokio::net::tcp::OwnedReadHalf,
    connection_timeout: Duration,
) {
    let mut framed = FramedRead::new(read_half, LineJsonCodec);

    loop {
        use futures::StreamExt;
        let next = tokio::time::timeout(connection_timeout, framed.next()).await;

        match next {
            Ok(Some(Ok(envelope))) => {
                touch_heartbeat(&shared, &address).await;

                if matches!(envelope, Envelope::Heartbeat { .. }) {
                    continue;
                }

                if is_duplicate(&shared, &envelope).await {
                    continue;
                }

                let callback = shared.on_message.lock().await.clone();
                if let Some(callback) = callback {
                    callback(address.clone(), envelope);
                }
            }
            Ok(Some(Err(e))) => {
                log::warn!("connection error with {:?}: {}", address, e);
                break;
            }
            Ok(None) => {
                // EOF
                break;
            }
            Err(_elapsed) => {
                // No data within connection_timeout; the periodic
                // heartbeat worker owns the actual disconnect decision.
                continue;
            }
        }
    }

    remove_peer(&shared, &address).await;
}

async fn touch_heartbeat(shared: &Arc<Shared>, address: &PeerAddr) {
    if let Some(state) = shared.peers.lock().await.get_mut(address) {
        state.last_heartbeat = Instant::now();
    }
}

async fn is_duplicate(shared: &Arc<Shared>, envelope: &Envelope) -> bool {
    let fingerprint = envelope.fingerprint();
    let mut processed = shared.processed_messages.lock().await;

    if processed.contains(&fingerprint) {
        return true;
    }

    processed.insert(fingerprint);
    if processed.len() > shared.message_ttl {
        if let Some(arbitrary) = processed.iter().next().cloned() {
            processed.remove(&arbitrary);
        }
    }

    false
}

async fn send_heartbeats(shared: &Arc<Shared>) {
    let addresses: Vec<PeerAddr> = shared.peers.lock().await.keys().cloned().collect();
    let heartbeat = Envelope::Heartbeat {
        timestamp: now_timestamp(),
    };

    for address in addresses {
        let write_half = {
            let peers = shared.peers.lock().await;
            peers.get(&address).map(|s| s.write_half.clone())
        };

        if let Some(write_half) = write_half {
            if let Ok(line) = heartbeat.to_line() {
                let mut guard = write_half.lock().await;
                if let Err(e) = guard.write_all(&line).await {
                    log::warn!("heartbeat send error to {:?}: {}", address, e);
                    drop(guard);
                    remove_peer(shared, &address).await;
                }
            }
        }
    }
}

async fn reap_stale_peers(shared: &Arc<Shared>, connection_timeout: Duration) {
    let stale: Vec<PeerAddr> = {
        let peers = shared.peers.lock().await;
        let now = Instant::now();
        peers
            .iter()
            .filter(|(_, state)| now.duration_since(state.last_heartbeat) > connection_timeout)
            .map(|(addr, _)| addr.clone())
            .collect()
    };

    for address in stale {
        log::info!("connection timeout for {:?}", address);
        remove_peer(shared, &address).await;
    }
}

/// Idempotent: close socket, drop from peer map.
async fn remove_peer(shared: &Arc<Shared>, address: &PeerAddr) {
    let mut peers = shared.peers.lock().await;
    if let Some(state) = peers.remove(address) {
        state.reader.abort();
        log::info!("peer {:?} disconnected", address);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn refuses_self_connect() {
        let transport = Transport::new(
            "127.0.0.1",
            5001,
            Duration::from_secs(5),
            Duration::from_secs(15),
            100,
        );
        let result = transport.connect_to_peer("localhost", 5001).await;
        assert!(matches!(result, Err(ChatError::SelfConnect(_, 5001))));
        drop(transport);
    }

    #[tokio::test]
    async fn two_nodes_exchange_envelope() {
        let _ = env_logger::builder().is_test(true).try_init();

        let received = Arc::new(Mutex::new(Vec::new()));
        let received_clone = received.clone();

        // Bind to an ephemeral port by asking the OS, then read it back.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port_b = listener.local_addr().unwrap().port();
        drop(listener);

        let node_b = Transport::new(
            "127.0.0.1",
            port_b,
            Duration::from_secs(5),
            Duration::from_secs(15),
            100,
        );

        let on_message: OnMessage = Arc::new(move |_addr, envelope| {
            let received_clone = received_clone.clone();
            tokio::spawn(async move {
                received_clone.lock().await.push(envelope);
            });
        });

        node_b.start(on_message).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let node_a = Transport::new(
            "127.0.0.1",
            0,
            Duration::from_secs(5),
            Duration::from_secs(15),
            100,
        );
        node_a
            .start(Arc::new(|_, _| {}))
            .await
            .unwrap();

        let connected = node_a.connect_to_peer("127.0.0.1", port_b).await.unwrap();
        assert!(connected);

        tokio::time::sleep(Duration::from_millis(50)).await;

        let envelope = Envelope::Chat {
            sender: "a".into(),
            content: "hello".into(),
            timestamp: now_timestamp(),
        };
        let sent = node_a.broadcast(&envelope).await;
        assert!(sent);

        tokio::time::sleep(Duration::from_millis(100)).await;

        let got = received.lock().await;
        assert_eq!(got.len(), 1);
        assert!(matches!(&got[0], Envelope::Chat { content, .. } if content == "hello"));

        node_a.stop().await;
        node_b.stop().await;
    }
}
