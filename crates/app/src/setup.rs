//! Interactive flows that turn a fresh node into a hub or a client

use std::io;

use hubchat_core::NodeConfig;
use hubchat_net::{Error, Node, NodeEvent};
use tokio::sync::mpsc::UnboundedReceiver;

use crate::banner;
use crate::prompt::Prompter;

/// A node that made it into a chat, with its event stream
pub struct Session {
    pub node: Node,
    pub events: UnboundedReceiver<NodeEvent>,
}

/// Ask for a port and start hosting, offering a retry when binding fails
pub async fn server_flow(config: NodeConfig, prompter: &mut Prompter) -> io::Result<Option<Session>> {
    let (node, events) = Node::new(config.clone());

    loop {
        let question = format!("Listening port (default {}): ", config.port);
        let Some(port) = prompter.ask_port(&question, config.port).await? else {
            node.shutdown().await;
            return Ok(None);
        };

        match node.start_server(&config.host, port).await {
            Ok(addr) => {
                banner::print_section(
                    "HUB STARTED",
                    &[
                        format!("'{}' is listening on {}", config.username, addr),
                        format!("Up to {} clients allowed", config.max_connections),
                        "Waiting for others to join...".to_string(),
                        "Type a message to send it to every client".to_string(),
                    ],
                );
                return Ok(Some(Session { node, events }));
            }
            Err(e) => {
                tracing::warn!(port, error = %e, "Could not start hub");
                println!("Could not start the hub: {}", e);
                if !prompter.confirm("Port busy or unavailable. Try again? (y/N): ").await? {
                    node.shutdown().await;
                    return Ok(None);
                }
            }
        }
    }
}

/// Ask for a hub address and join it, handling name clashes and retries
pub async fn client_flow(
    mut config: NodeConfig,
    prompter: &mut Prompter,
) -> io::Result<Option<Session>> {
    let (mut node, mut events) = Node::new(config.clone());

    loop {
        let question = format!("Hub address (default {}): ", config.host);
        let Some(host) = prompter.ask(&question).await? else {
            node.shutdown().await;
            return Ok(None);
        };
        let host = if host.is_empty() {
            config.host.clone()
        } else {
            host
        };

        let question = format!("Hub port (default {}): ", config.port);
        let Some(port) = prompter.ask_port(&question, config.port).await? else {
            node.shutdown().await;
            return Ok(None);
        };

        println!("Connecting to {}:{}...", host, port);
        match node.connect(&host, port).await {
            Ok(()) => {
                let hub = node.hub_username().await.unwrap_or_default();
                banner::print_section(
                    "CONNECTED",
                    &[
                        format!("Joined hub '{}' at {}:{}", hub, host, port),
                        "Type a message to send it to everyone in the chat".to_string(),
                        "Type 'quit' to leave".to_string(),
                    ],
                );
                return Ok(Some(Session { node, events }));
            }
            Err(Error::UsernameTaken) => {
                println!("Username already in use!");
                if !prompter
                    .confirm("Try again with another username? (y/N): ")
                    .await?
                {
                    node.shutdown().await;
                    return Ok(None);
                }
                let Some(username) = prompter
                    .ask_required("New username: ", "Username (required): ")
                    .await?
                else {
                    node.shutdown().await;
                    return Ok(None);
                };

                node.shutdown().await;
                config.username = username;
                (node, events) = Node::new(config.clone());
            }
            Err(e @ (Error::ConnectionFailed(_) | Error::Rejected(_))) => {
                println!("Could not join the chat: {}", e);
                println!("1. Retry");
                println!("2. Exit");
                let choice = prompter.choose("Choice (1/2): ", &["1", "2"]).await?;
                if choice.as_deref() != Some("1") {
                    node.shutdown().await;
                    return Ok(None);
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "Connection failed");
                println!("Error while connecting: {}", e);
                node.shutdown().await;
                return Ok(None);
            }
        }
    }
}
