//! HubChat - peer-to-peer terminal chat
//!
//! One node hosts, the others join it. When the hub goes away the remaining
//! clients elect a successor and carry on.

use std::io;
use std::path::{Path, PathBuf};

use chrono::Utc;
use hubchat_core::{NodeConfig, TranscriptWriter};
use hubchat_net::Node;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod banner;
mod console;
mod prompt;
mod setup;

use prompt::Prompter;
use setup::Session;

#[tokio::main]
async fn main() {
    // Logs go to stderr so they never interleave with the prompt
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    let config = NodeConfig::from_env();
    if let Err(e) = config.validate() {
        tracing::error!("Invalid configuration: {}", e);
        std::process::exit(1);
    }

    if let Err(e) = run(config).await {
        tracing::error!("Terminal error: {}", e);
        std::process::exit(1);
    }

    // A pending stdin read would otherwise keep the runtime alive
    std::process::exit(0);
}

async fn run(mut config: NodeConfig) -> io::Result<()> {
    banner::print();
    let mut prompter = Prompter::new();

    let question = if config.username.is_empty() {
        "Your username: ".to_string()
    } else {
        format!("Your username (default {}): ", config.username)
    };
    let Some(username) = prompter.ask(&question).await? else {
        return Ok(());
    };
    if !username.is_empty() {
        config.username = username;
    }
    if config.username.is_empty() {
        let Some(username) = prompter
            .ask_required("Username (required): ", "Username (required): ")
            .await?
        else {
            return Ok(());
        };
        config.username = username;
    }

    println!();
    println!("What would you like to do?");
    println!("1. Start a new chat (you become the hub)");
    println!("2. Join an existing chat");
    let Some(choice) = prompter.choose("Choice (1/2): ", &["1", "2"]).await? else {
        return Ok(());
    };

    let session = if choice == "1" {
        setup::server_flow(config.clone(), &mut prompter).await?
    } else {
        setup::client_flow(config.clone(), &mut prompter).await?
    };
    let Some(Session { node, events }) = session else {
        println!("Bye.");
        return Ok(());
    };

    console::print_help(node.role().await);
    console::run(&node, events, &mut prompter).await;

    node.shutdown().await;
    if let Some(reason) = node.stop_reason() {
        println!("Session ended: {}", reason);
    }
    save_transcript(&node, &config.transcript_dir);
    println!("Disconnected.");
    Ok(())
}

/// Write the session transcript and report where it went
fn save_transcript(node: &Node, dir: &Path) -> Option<PathBuf> {
    let writer = TranscriptWriter::new(dir);
    match writer.write(&node.transcript_header(), &node.transcript().entries(), Utc::now()) {
        Ok(Some(path)) => {
            println!("Chat saved to {}", path.display());
            Some(path)
        }
        Ok(None) => {
            println!("No messages to save.");
            None
        }
        Err(e) => {
            tracing::warn!(error = %e, "Failed to save transcript");
            println!("Could not save the chat log: {}", e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(username: &str) -> Node {
        let config = NodeConfig {
            username: username.to_string(),
            ..NodeConfig::default()
        };
        Node::new(config).0
    }

    #[test]
    fn test_save_transcript_skips_empty_session() {
        let dir = tempfile::tempdir().unwrap();
        assert!(save_transcript(&node("alice"), dir.path()).is_none());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_save_transcript_writes_log() {
        let dir = tempfile::tempdir().unwrap();
        let node = node("alice");
        node.transcript().system("alice joined the chat");

        let path = save_transcript(&node, dir.path()).unwrap();
        let text = std::fs::read_to_string(path).unwrap();
        assert!(text.contains("CHAT LOG - User: alice"));
        assert!(text.contains(">>> alice joined the chat"));
        assert!(text.contains("Mode: OFFLINE"));
    }
}
