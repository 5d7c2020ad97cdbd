//! hubchat Network Library
//!
//! A star-shaped TCP chat overlay that survives the loss of its hub.
//!
//! # Architecture
//!
//! - **Server**: the hub; admits clients and relays every line to the others
//! - **Client**: a spoke connected to exactly one hub
//! - **Failover**: on hub loss the earliest-joined client promotes itself and
//!   the rest reconnect to it
//! - **Protocol**: length-prefixed JSON messages
//!
//! # Usage
//!
//! ```ignore
//! let (node, mut events) = Node::new(config);
//! node.connect("localhost", 5555).await?;
//!
//! tokio::spawn(async move {
//!     while let Some(event) = events.recv().await {
//!         println!("{event}");
//!     }
//! });
//!
//! node.send("hello").await?;
//! node.shutdown().await;
//! ```

mod client;
mod context;
pub mod error;
pub mod event;
mod failover;
mod frame;
mod node;
pub mod protocol;
mod server;
mod tasks;

pub use error::{Error, Result};
pub use event::NodeEvent;
pub use node::{Node, RoleKind};
pub use protocol::Message;
pub use server::SessionInfo;
