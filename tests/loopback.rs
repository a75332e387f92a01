//! Integration tests: full `Node` instances talking to each other over
//! real loopback TCP sockets, covering the scenarios the transport and
//! file-transfer unit tests can't exercise end-to-end on their own.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;

use p2p_chat::config::{Config, General};
use p2p_chat::node::Node;
use p2p_chat::presence::Notification;

fn config_for(username: &str) -> Config {
    config_with_chunk_size(username, 16)
}

fn config_with_chunk_size(username: &str, chunk_size: usize) -> Config {
    Config {
        general: General {
            username: username.to_string(),
            bind_address: "127.0.0.1:0".to_string(),
            download_dir: std::env::temp_dir()
                .join(format!(
                    "p2p_chat_loopback_{}_{}",
                    username,
                    std::process::id()
                ))
                .to_string_lossy()
                .to_string(),
            heartbeat_interval_secs: 5,
            connection_timeout_secs: 15,
            message_ttl: 100,
            chunk_size,
            retry_limit: 3,
            chunk_timeout_secs: 10,
            transfer_timeout_secs: 60,
            large_file_threshold_bytes: 64,
        },
    }
}

async fn collecting_callback() -> (
    p2p_chat::presence::MessageCallback,
    Arc<Mutex<Vec<Notification>>>,
) {
    let received: Arc<Mutex<Vec<Notification>>> = Arc::new(Mutex::new(Vec::new()));
    let received_clone = received.clone();
    let callback: p2p_chat::presence::MessageCallback = Arc::new(move |n| {
        let received_clone = received_clone.clone();
        tokio::spawn(async move {
            received_clone.lock().await.push(n);
        });
    });
    (callback, received)
}

/// S1: two nodes exchange a chat message over a direct loopback
/// connection, with presence notifications observed on both sides.
#[tokio::test]
async fn two_nodes_exchange_chat_over_loopback() {
    let _ = env_logger::builder().is_test(true).try_init();

    let node_b = Node::new(&config_for("bob")).await.unwrap();
    node_b.start().await.unwrap();
    let port_b = node_b.port();

    let (callback_b, received_b) = collecting_callback().await;
    node_b.register_message_callback(callback_b).await;

    let node_a = Node::new(&config_for("alice")).await.unwrap();
    node_a.start().await.unwrap();

    let connected = node_a.connect_to_peer("127.0.0.1", port_b).await.unwrap();
    assert!(connected);

    tokio::time::sleep(Duration::from_millis(150)).await;

    node_a.send_message("hello from alice").await;

    tokio::time::sleep(Duration::from_millis(200)).await;

    let got = received_b.lock().await;
    assert!(got.iter().any(|n| matches!(
        n,
        Notification::Chat { sender, content, .. }
            if sender == "alice" && content == "hello from alice"
    )));

    node_a.stop().await;
    node_b.stop().await;
}

/// S2: presence fan-out and offline-on-stop. Node B sees alice in its
/// online-user list after connect, and a "disconnected"-style offline
/// update after alice stops (the original's `Stop` sequencing — presence
/// is announced before the transport's sockets close).
#[tokio::test]
async fn presence_reflects_connect_and_stop() {
    let _ = env_logger::builder().is_test(true).try_init();

    let node_b = Node::new(&config_for("bob")).await.unwrap();
    node_b.start().await.unwrap();
    let port_b = node_b.port();

    let (callback_b, received_b) = collecting_callback().await;
    node_b.register_message_callback(callback_b).await;

    let node_a = Node::new(&config_for("alice")).await.unwrap();
    node_a.start().await.unwrap();

    node_a.connect_to_peer("127.0.0.1", port_b).await.unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;

    let online = node_b.online_users().await;
    assert!(online.contains(&"alice".to_string()));

    node_a.stop().await;
    tokio::time::sleep(Duration::from_millis(150)).await;

    let got = received_b.lock().await;
    assert!(got
        .iter()
        .any(|n| matches!(n, Notification::UserUpdate { .. })));

    node_b.stop().await;
}

/// S3: a file that fits in a single chunk (`chunk_size` raised to 4096
/// here, matching spec.md's own S3 of a 3 KiB file at the 4096-byte
/// default) is sent whole, acked once, and reassembled with a passing
/// hash check — the one ack the sender needs isn't subject to the
/// `file_chunk_ack`/`"None_None"` dedup collision from §9 because there
/// is nothing else racing it onto the wire first.
#[tokio::test]
async fn small_file_transfers_end_to_end() {
    let _ = env_logger::builder().is_test(true).try_init();

    let node_b = Node::new(&config_with_chunk_size("bob", 4096)).await.unwrap();
    node_b.start().await.unwrap();
    let port_b = node_b.port();

    let (callback_b, received_b) = collecting_callback().await;
    node_b.register_message_callback(callback_b).await;

    let node_a = Node::new(&config_with_chunk_size("alice", 4096)).await.unwrap();
    node_a.start().await.unwrap();

    node_a.connect_to_peer("127.0.0.1", port_b).await.unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;

    let file = tempfile::NamedTempFile::new().unwrap();
    tokio::fs::write(file.path(), b"a small test file").await.unwrap();

    let sent = node_a.send_file(file.path()).await;
    assert!(sent);

    tokio::time::sleep(Duration::from_millis(500)).await;

    let got = received_b.lock().await;
    assert!(got.iter().any(|n| matches!(
        n,
        Notification::System { content, .. } if content.starts_with("File received successfully")
    )));

    node_a.stop().await;
    node_b.stop().await;
}

/// S4: a file larger than one chunk (`chunk_size` is 16 bytes here) is
/// split across multiple `file_chunk` envelopes, each individually
/// fingerprinted on `(timestamp, sender)` so every one of them reaches
/// the receiver and gets stored at its index. This does not assert the
/// final `file_transfer_complete` / "File received successfully" step:
/// every `file_chunk_ack` the receiver broadcasts back collides on the
/// same `"None_None"` fingerprint (§9), so after the first ack the
/// sender's `acked_chunks` stops growing and `send_file_chunks` never
/// observes all chunks acked — it only learns about the rest 30 s later
/// (its ack-wait timeout) or on the next 5 s resend cycle, far outside a
/// sub-second test window. That is the documented quirk working as
/// specified, not a bug this test should paper over.
#[tokio::test]
async fn multi_chunk_file_data_all_arrives_despite_ack_dedup() {
    let _ = env_logger::builder().is_test(true).try_init();

    let node_b = Node::new(&config_for("bob")).await.unwrap();
    node_b.start().await.unwrap();
    let port_b = node_b.port();

    let (callback_b, received_b) = collecting_callback().await;
    node_b.register_message_callback(callback_b).await;

    let node_a = Node::new(&config_for("alice")).await.unwrap();
    node_a.start().await.unwrap();

    node_a.connect_to_peer("127.0.0.1", port_b).await.unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;

    let file = tempfile::NamedTempFile::new().unwrap();
    let contents = "x".repeat(200); // 200 bytes / 16-byte chunks = 13 chunks
    tokio::fs::write(file.path(), contents.as_bytes())
        .await
        .unwrap();

    let sent = node_a.send_file(file.path()).await;
    assert!(sent);

    tokio::time::sleep(Duration::from_millis(800)).await;

    let got = received_b.lock().await;
    assert!(got.iter().any(|n| matches!(
        n,
        Notification::System { content, .. }
            if content.starts_with("File transfer from alice") && content.contains("100% complete")
    )));

    node_a.stop().await;
    node_b.stop().await;
}
