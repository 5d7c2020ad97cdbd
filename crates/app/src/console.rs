//! Chat console: reads typed lines, prints node events

use hubchat_net::{Error, Node, NodeEvent, RoleKind};
use tokio::sync::mpsc::UnboundedReceiver;

use crate::prompt::Prompter;

/// What a typed line asks for
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Quit,
    List,
    Say(String),
    Empty,
}

impl Command {
    pub fn parse(line: &str) -> Self {
        let line = line.trim();
        if line.is_empty() {
            return Command::Empty;
        }
        match line.to_lowercase().as_str() {
            "quit" | "exit" | "q" => Command::Quit,
            "list" => Command::List,
            _ => Command::Say(line.to_string()),
        }
    }
}

pub fn print_help(role: RoleKind) {
    println!();
    println!("Commands:");
    if role == RoleKind::Server {
        println!("  list    - show connected clients");
        println!("  quit    - close the hub");
    } else {
        println!("  list    - show the hub you are connected to");
        println!("  quit    - disconnect");
    }
    println!("  <text>  - send a message to everyone");
    println!();
}

/// Run until the user quits, stdin closes, Ctrl-C arrives or the node stops
pub async fn run(node: &Node, mut events: UnboundedReceiver<NodeEvent>, prompter: &mut Prompter) {
    loop {
        tokio::select! {
            Some(event) = events.recv() => {
                println!("{}", event);
            }
            _ = node.stopped() => break,
            _ = tokio::signal::ctrl_c() => {
                println!();
                println!("Interrupted, closing...");
                break;
            }
            line = prompter.line() => match line {
                Ok(Some(line)) => match Command::parse(&line) {
                    Command::Quit => break,
                    Command::List => list(node).await,
                    Command::Say(text) => say(node, &text).await,
                    Command::Empty => {}
                },
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to read stdin");
                    break;
                }
            },
        }
    }

    // Show whatever arrived while leaving the loop
    while let Ok(event) = events.try_recv() {
        println!("{}", event);
    }
}

async fn list(node: &Node) {
    match node.role().await {
        RoleKind::Server => {
            let sessions = node.sessions().await;
            println!(
                "Connected clients: {}/{}",
                sessions.len(),
                node.config().max_connections
            );
            if sessions.is_empty() {
                println!("No clients connected");
            }
            for session in sessions {
                println!("  - {} ({})", session.username, session.addr);
            }
        }
        RoleKind::Client => {
            let hub = node.hub_username().await.unwrap_or_default();
            println!("Connected to hub: {}", hub);
        }
        RoleKind::Unset => println!("Not connected to any chat"),
    }
}

async fn say(node: &Node, text: &str) {
    match node.send(text).await {
        Ok(()) => println!("You: {}", text),
        Err(Error::NoPeers) => println!("No clients connected!"),
        Err(Error::NotConnected) => println!("Not connected to any chat!"),
        Err(e) => println!("Could not send the message: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_commands() {
        assert_eq!(Command::parse("quit"), Command::Quit);
        assert_eq!(Command::parse("EXIT"), Command::Quit);
        assert_eq!(Command::parse(" q "), Command::Quit);
        assert_eq!(Command::parse("list"), Command::List);
        assert_eq!(Command::parse("   "), Command::Empty);
        assert_eq!(
            Command::parse(" hello there "),
            Command::Say("hello there".to_string())
        );
    }

    #[test]
    fn test_list_is_exact_word() {
        assert_eq!(
            Command::parse("list all"),
            Command::Say("list all".to_string())
        );
    }
}
