#[macro_use]
extern crate log;

use std::env::var;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};

use p2p_chat::config::Config;
use p2p_chat::node::Node;
use p2p_chat::presence::Notification;

/// Minimal stdin-driven chat client: every non-empty line typed is
/// broadcast as a chat message. Command parsing, argument validation,
/// and any richer UI are out of scope here — this binary exists only to
/// exercise the library surface `Node` exposes.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let config_loc = var("CHAT_CONFIG").unwrap_or_else(|_| "config.toml".into());

    let config: Config = toml::from_slice(&std::fs::read(config_loc)?)?;

    let node = Node::new(&config).await?;

    node.register_message_callback(Arc::new(|notification| match notification {
        Notification::Chat {
            sender, content, ..
        } => println!("{}: {}", sender, content),
        Notification::System { content, .. } => println!("* {}", content),
        Notification::UserUpdate { users, .. } => println!("* online: {}", users.join(", ")),
    }))
    .await;

    node.start().await?;

    info!("chat node listening on port {}", node.port());

    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                break;
            }
            line = lines.next_line() => {
                match line? {
                    Some(text) if !text.is_empty() => {
                        node.send_message(&text).await;
                    }
                    Some(_) => {}
                    None => break,
                }
            }
        }
    }

    node.stop().await;

    Ok(())
}
