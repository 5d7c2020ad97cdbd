//! TCP client for joining a hub

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use hubchat_core::{join_order_now, EntryKind, PeerList};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::context::Context;
use crate::error::{Error, Result};
use crate::event::NodeEvent;
use crate::frame::{encode_frame, read_frame, write_frame, write_loop};
use crate::protocol::{is_name_conflict, Message};

/// Outbound queue depth
const OUTBOUND_QUEUE: usize = 64;

/// How the link to the hub ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum LinkEnd {
    /// Closed from this side
    Closed,
    /// The hub said goodbye
    HubShutdown(String),
    /// The connection dropped or broke
    Lost(String),
}

/// Client handle for a live hub connection
pub(crate) struct Client {
    ctx: Context,
    hub_username: String,
    host: String,
    port: u16,
    join_order: f64,
    peers: Arc<RwLock<PeerList>>,
    tx: mpsc::Sender<Message>,
    cancel: CancellationToken,
}

fn connection_failed(e: Error) -> Error {
    match e {
        Error::ConnectionFailed(_) => e,
        other => Error::ConnectionFailed(other.to_string()),
    }
}

impl Client {
    /// Connect to a hub and run the join handshake.
    ///
    /// The receiver resolves once the link ends, telling the caller why.
    pub async fn connect(
        ctx: &Context,
        host: &str,
        port: u16,
        connect_timeout: Duration,
    ) -> Result<(Self, oneshot::Receiver<LinkEnd>)> {
        info!(host = %host, port, "Connecting to hub");

        let join_order = join_order_now();
        let handshake = async {
            let mut stream = TcpStream::connect((host, port))
                .await
                .map_err(|e| Error::ConnectionFailed(e.to_string()))?;

            let request = Message::JoinRequest {
                username: ctx.username.clone(),
                join_order: Some(join_order),
            };
            write_frame(&mut stream, &request)
                .await
                .map_err(connection_failed)?;
            let reply = read_frame(&mut stream).await.map_err(connection_failed)?;

            Ok::<_, Error>((stream, reply))
        };

        let (stream, reply) = tokio::select! {
            _ = ctx.shutdown.cancelled() => return Err(Error::ShuttingDown),
            result = timeout(connect_timeout, handshake) => match result {
                Ok(result) => result?,
                Err(_) => return Err(Error::ConnectionFailed("timed out".into())),
            },
        };

        let (hub_username, peer_list) = match reply {
            Message::JoinAccepted {
                hub_username,
                peer_list,
                message,
            } => {
                info!(hub = %hub_username, peers = peer_list.len(), status = %message, "Joined hub");
                (hub_username, peer_list)
            }
            Message::JoinRejected { reason } => {
                warn!(reason = %reason, "Join rejected");
                return Err(Error::Rejected(reason));
            }
            Message::Error { reason } if is_name_conflict(&reason) => {
                return Err(Error::UsernameTaken);
            }
            Message::Error { reason } => return Err(Error::Remote(reason)),
            other => {
                return Err(Error::ConnectionFailed(format!(
                    "unexpected {} reply",
                    other.kind()
                )))
            }
        };

        let (reader, writer) = stream.into_split();
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE);
        let cancel = ctx.shutdown.child_token();
        let peers = Arc::new(RwLock::new(peer_list));
        let (end_tx, end_rx) = oneshot::channel();

        let writer_cancel = cancel.clone();
        ctx.tasks.spawn("hub writer", async move {
            // A broken socket surfaces on the read side as well
            if let Err(e) = write_loop(writer, rx, writer_cancel).await {
                debug!(error = %e, "Write to hub failed");
            }
        });
        ctx.tasks.spawn(
            "hub reader",
            receive_loop(
                reader,
                ctx.clone(),
                peers.clone(),
                hub_username.clone(),
                cancel.clone(),
                end_tx,
            ),
        );

        let client = Client {
            ctx: ctx.clone(),
            hub_username,
            host: host.to_string(),
            port,
            join_order,
            peers,
            tx,
            cancel,
        };
        Ok((client, end_rx))
    }

    /// Send a chat line to the hub
    pub async fn send_chat(&self, text: &str) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::NotConnected);
        }

        let timestamp = Utc::now();
        let msg = Message::ChatMessage {
            username: Some(self.ctx.username.clone()),
            text: text.to_string(),
            timestamp: Some(timestamp),
        };
        encode_frame(&msg)?;
        self.tx.send(msg).await.map_err(|_| Error::NotConnected)?;

        self.ctx
            .transcript
            .record(EntryKind::ChatMessage, &self.ctx.username, text, timestamp);
        Ok(())
    }

    /// Drop the hub connection
    pub fn close(&self) {
        self.cancel.cancel();
    }

    pub fn hub_username(&self) -> &str {
        &self.hub_username
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn join_order(&self) -> f64 {
        self.join_order
    }

    /// Last peer list received from the hub
    pub async fn peer_list(&self) -> PeerList {
        self.peers.read().await.clone()
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Receive loop for the hub connection
async fn receive_loop(
    mut reader: OwnedReadHalf,
    ctx: Context,
    peers: Arc<RwLock<PeerList>>,
    hub_username: String,
    cancel: CancellationToken,
    end_tx: oneshot::Sender<LinkEnd>,
) {
    let end = loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break LinkEnd::Closed,
            frame = read_frame(&mut reader) => frame,
        };

        match frame {
            Ok(Message::HubShutdown { text }) => {
                info!(text = %text, "Hub is shutting down");
                ctx.transcript.system(text.clone());
                ctx.emit(NodeEvent::HubShutdown { text: text.clone() });
                break LinkEnd::HubShutdown(text);
            }
            Ok(msg) => dispatch(msg, &ctx, &peers, &hub_username).await,
            // Framing keeps the stream aligned, so a bad payload is skippable
            Err(e @ (Error::MalformedMessage(_) | Error::UnknownKind(_))) => {
                warn!(error = %e, "Skipping undecodable message from hub");
            }
            Err(_) if cancel.is_cancelled() => break LinkEnd::Closed,
            Err(Error::ConnectionClosed) => {
                warn!("Hub closed the connection");
                break LinkEnd::Lost("connection closed".into());
            }
            Err(e) => {
                warn!(error = %e, "Lost connection to hub");
                break LinkEnd::Lost(e.to_string());
            }
        }
    };

    cancel.cancel();
    debug!(end = ?end, "Hub receive loop finished");
    let _ = end_tx.send(end);
}

/// Handle one message from the hub
async fn dispatch(
    msg: Message,
    ctx: &Context,
    peers: &Arc<RwLock<PeerList>>,
    hub_username: &str,
) {
    match msg {
        Message::ChatMessage {
            username,
            text,
            timestamp,
        } => {
            let username = username.unwrap_or_else(|| "unknown".to_string());
            let timestamp = timestamp.unwrap_or_else(Utc::now);
            ctx.transcript
                .record(EntryKind::ChatMessage, &username, &text, timestamp);
            ctx.emit(NodeEvent::Chat {
                username,
                text,
                timestamp,
            });
        }
        Message::ServerMessage { text, timestamp } => {
            ctx.transcript
                .record(EntryKind::ServerMessage, hub_username, &text, timestamp);
            ctx.emit(NodeEvent::ServerChat {
                username: hub_username.to_string(),
                text,
                timestamp,
            });
        }
        Message::UserJoined {
            username,
            text,
            peer_list,
        } => {
            debug!(username = %username, peers = peer_list.len(), "Peer joined");
            *peers.write().await = peer_list;
            ctx.transcript.system(text.clone());
            ctx.emit(NodeEvent::PeerJoined { username, text });
        }
        Message::UserLeft {
            username,
            text,
            peer_list,
        } => {
            debug!(username = %username, peers = peer_list.len(), "Peer left");
            *peers.write().await = peer_list;
            ctx.transcript.system(text.clone());
            ctx.emit(NodeEvent::PeerLeft { username, text });
        }
        other => {
            debug!(kind = other.kind(), "Ignoring unexpected message");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::Server;

    const TIMEOUT: Duration = Duration::from_secs(2);

    async fn hub(name: &str, max: usize) -> (Server, Context) {
        let (ctx, _events) = Context::new(name);
        let server = Server::start(&ctx, "127.0.0.1", 0, max, TIMEOUT)
            .await
            .unwrap();
        (server, ctx)
    }

    #[tokio::test]
    async fn test_client_connect() {
        let (server, _hub_ctx) = hub("alice", 5).await;
        let (ctx, _events) = Context::new("bob");

        let (client, _link) = Client::connect(&ctx, "127.0.0.1", server.local_addr().port(), TIMEOUT)
            .await
            .unwrap();

        assert_eq!(client.hub_username(), "alice");
        let peers = client.peer_list().await;
        assert_eq!(peers.hub().map(|p| p.username.as_str()), Some("alice"));
        assert!(peers.contains("bob"));
        assert!(client.join_order() > 0.0);

        client.close();
        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_username_taken() {
        let (server, _hub_ctx) = hub("alice", 5).await;
        let (ctx, _events) = Context::new("alice");

        let result = Client::connect(&ctx, "127.0.0.1", server.local_addr().port(), TIMEOUT).await;
        assert!(matches!(result, Err(Error::UsernameTaken)));

        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_rejected_when_full() {
        let (server, _hub_ctx) = hub("alice", 1).await;
        let port = server.local_addr().port();

        let (bob_ctx, _bob_events) = Context::new("bob");
        let (_bob, _link) = Client::connect(&bob_ctx, "127.0.0.1", port, TIMEOUT)
            .await
            .unwrap();

        let (carol_ctx, _carol_events) = Context::new("carol");
        let result = Client::connect(&carol_ctx, "127.0.0.1", port, TIMEOUT).await;
        assert!(matches!(result, Err(Error::Rejected(reason)) if reason == "capacity reached"));

        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_refused_is_connection_failed() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let (ctx, _events) = Context::new("bob");
        let result = Client::connect(&ctx, "127.0.0.1", port, TIMEOUT).await;
        assert!(matches!(result, Err(Error::ConnectionFailed(_))));
    }

    #[tokio::test]
    async fn test_peer_list_follows_membership() {
        let (server, _hub_ctx) = hub("alice", 5).await;
        let port = server.local_addr().port();

        let (bob_ctx, mut bob_events) = Context::new("bob");
        let (bob, _bob_link) = Client::connect(&bob_ctx, "127.0.0.1", port, TIMEOUT)
            .await
            .unwrap();

        let (carol_ctx, _carol_events) = Context::new("carol");
        let (_carol, _carol_link) = Client::connect(&carol_ctx, "127.0.0.1", port, TIMEOUT)
            .await
            .unwrap();

        let event = timeout(TIMEOUT, bob_events.recv()).await.unwrap().unwrap();
        assert!(matches!(event, NodeEvent::PeerJoined { username, .. } if username == "carol"));

        let names: Vec<String> = bob
            .peer_list()
            .await
            .iter()
            .map(|p| p.username.clone())
            .collect();
        assert_eq!(names, vec!["alice", "bob", "carol"]);

        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_hub_goodbye_ends_link() {
        let (server, _hub_ctx) = hub("alice", 5).await;
        let (ctx, _events) = Context::new("bob");
        let (client, link) = Client::connect(&ctx, "127.0.0.1", server.local_addr().port(), TIMEOUT)
            .await
            .unwrap();

        server.shutdown().await;

        let end = timeout(TIMEOUT, link).await.unwrap().unwrap();
        assert!(matches!(end, LinkEnd::HubShutdown(_)));
        assert!(matches!(client.send_chat("anyone?").await, Err(Error::NotConnected)));
    }

    #[tokio::test]
    async fn test_close_is_not_a_loss() {
        let (server, _hub_ctx) = hub("alice", 5).await;
        let (ctx, _events) = Context::new("bob");
        let (client, link) = Client::connect(&ctx, "127.0.0.1", server.local_addr().port(), TIMEOUT)
            .await
            .unwrap();

        client.close();

        let end = timeout(TIMEOUT, link).await.unwrap().unwrap();
        assert_eq!(end, LinkEnd::Closed);
        server.shutdown().await;
    }
}
