//! TCP server for the hub role
//!
//! The hub accepts clients, runs the join handshake and relays every chat
//! line to all other clients. Membership changes are announced with the
//! freshly computed peer list so every client holds the same snapshot.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use hubchat_core::{join_order_now, EntryKind, PeerAddress, PeerList, PeerRecord};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{lookup_host, TcpListener, TcpSocket, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::context::Context;
use crate::error::{Error, Result};
use crate::event::NodeEvent;
use crate::frame::{encode_frame, read_frame, write_frame, write_loop};
use crate::protocol::{Message, CAPACITY_REACHED, HUB_CLOSING, USERNAME_IN_USE};

/// Outbound queue depth per session
const SESSION_QUEUE: usize = 256;

/// Pause after a failed accept so a persistent error does not spin
const ACCEPT_RETRY: Duration = Duration::from_millis(100);

/// Connected client as the hub sees it
#[derive(Debug, Clone, PartialEq)]
pub struct SessionInfo {
    pub username: String,
    pub addr: SocketAddr,
    pub join_order: f64,
}

struct Session {
    record: PeerRecord,
    addr: SocketAddr,
    tx: mpsc::Sender<Message>,
    cancel: CancellationToken,
}

/// Hub state shared across tasks
struct HubState {
    username: String,
    address: PeerAddress,
    max_connections: usize,
    sessions: HashMap<Uuid, Session>,
    shutting_down: bool,
}

impl HubState {
    fn peer_list(&self) -> PeerList {
        PeerList::from_records(
            PeerRecord::hub(&self.username, Some(self.address.clone())),
            self.sessions.values().map(|s| s.record.clone()),
        )
    }

    fn is_username_taken(&self, username: &str) -> bool {
        username == self.username
            || self
                .sessions
                .values()
                .any(|s| s.record.username == username)
    }

    fn is_full(&self) -> bool {
        self.sessions.len() >= self.max_connections
    }

    fn capacity_message(&self) -> String {
        format!(
            "connected clients: {}/{}",
            self.sessions.len(),
            self.max_connections
        )
    }

    /// Queue `msg` for every session except `except`. Returns the sessions
    /// whose queue refused it; the caller evicts them after the pass.
    fn fan_out(&self, msg: &Message, except: Option<Uuid>) -> Vec<Uuid> {
        self.sessions
            .iter()
            .filter(|(id, _)| except != Some(**id))
            .filter_map(|(id, session)| match session.tx.try_send(msg.clone()) {
                Ok(()) => None,
                Err(e) => {
                    debug!(username = %session.record.username, error = %e, "Failed to queue message for client");
                    Some(*id)
                }
            })
            .collect()
    }
}

/// Hub handle
pub(crate) struct Server {
    addr: SocketAddr,
    address: PeerAddress,
    state: Arc<RwLock<HubState>>,
    cancel: CancellationToken,
    ctx: Context,
}

/// Bind and listen on `host:port`
pub(crate) async fn listen(host: &str, port: u16, backlog: usize) -> Result<TcpListener> {
    let bind_error = |source: std::io::Error| Error::Bind {
        addr: format!("{}:{}", host, port),
        source,
    };

    let addrs: Vec<SocketAddr> = lookup_host((host, port)).await.map_err(bind_error)?.collect();
    let addr = addrs
        .iter()
        .find(|a| a.is_ipv4())
        .or_else(|| addrs.first())
        .copied()
        .ok_or_else(|| {
            bind_error(std::io::Error::new(
                std::io::ErrorKind::AddrNotAvailable,
                "host did not resolve",
            ))
        })?;

    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()
    } else {
        TcpSocket::new_v6()
    }
    .map_err(bind_error)?;
    socket.set_reuseaddr(true).map_err(bind_error)?;
    socket.bind(addr).map_err(bind_error)?;
    socket
        .listen(backlog.clamp(1, 1024) as u32)
        .map_err(bind_error)
}

impl Server {
    /// Start hosting on the given host and port
    pub async fn start(
        ctx: &Context,
        host: &str,
        port: u16,
        max_connections: usize,
        handshake_timeout: Duration,
    ) -> Result<Self> {
        if ctx.is_shutting_down() {
            return Err(Error::ShuttingDown);
        }

        let listener = listen(host, port, max_connections).await?;
        let addr = listener.local_addr()?;
        let address = PeerAddress::new(host, addr.port());

        info!(addr = %addr, max_connections, "Hub started");

        let state = Arc::new(RwLock::new(HubState {
            username: ctx.username.clone(),
            address: address.clone(),
            max_connections,
            sessions: HashMap::new(),
            shutting_down: false,
        }));
        let cancel = ctx.shutdown.child_token();

        ctx.tasks.spawn(
            "accept loop",
            accept_loop(
                listener,
                state.clone(),
                ctx.clone(),
                cancel.clone(),
                handshake_timeout,
            ),
        );

        ctx.transcript
            .system(format!("{} is hosting the chat on {}", ctx.username, address));
        ctx.emit(NodeEvent::Hosting {
            addr: address.clone(),
            max_connections,
        });

        Ok(Server {
            addr,
            address,
            state,
            cancel,
            ctx: ctx.clone(),
        })
    }

    /// Get the server's bound address
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Address advertised in the peer list
    pub fn address(&self) -> &PeerAddress {
        &self.address
    }

    /// Send a hub-authored line to every client
    pub async fn send_chat(&self, text: &str) -> Result<()> {
        let timestamp = Utc::now();
        let msg = Message::ServerMessage {
            text: text.to_string(),
            timestamp,
        };
        let failed = {
            let s = self.state.read().await;
            if s.sessions.is_empty() {
                return Err(Error::NoPeers);
            }
            encode_frame(&msg)?;
            s.fan_out(&msg, None)
        };

        self.ctx
            .transcript
            .record(EntryKind::ServerMessage, &self.ctx.username, text, timestamp);
        evict(&self.state, &self.ctx, failed).await;
        Ok(())
    }

    /// Connected clients, earliest first
    pub async fn sessions(&self) -> Vec<SessionInfo> {
        let s = self.state.read().await;
        let mut sessions: Vec<SessionInfo> = s
            .sessions
            .values()
            .map(|session| SessionInfo {
                username: session.record.username.clone(),
                addr: session.addr,
                join_order: session.record.join_order,
            })
            .collect();
        sessions.sort_by(|a, b| a.join_order.total_cmp(&b.join_order));
        sessions
    }

    /// Current authoritative peer list
    pub async fn peer_list(&self) -> PeerList {
        self.state.read().await.peer_list()
    }

    /// Say goodbye to every client and stop accepting
    pub async fn shutdown(&self) {
        let sessions: Vec<Session> = {
            let mut s = self.state.write().await;
            if s.shutting_down {
                return;
            }
            s.shutting_down = true;
            s.fan_out(
                &Message::HubShutdown {
                    text: HUB_CLOSING.to_string(),
                },
                None,
            );
            s.sessions.drain().map(|(_, session)| session).collect()
        };

        for session in &sessions {
            session.cancel.cancel();
        }
        self.cancel.cancel();

        info!(clients = sessions.len(), "Hub shut down");
    }
}

/// Accept incoming connections
async fn accept_loop(
    listener: TcpListener,
    state: Arc<RwLock<HubState>>,
    ctx: Context,
    cancel: CancellationToken,
    handshake_timeout: Duration,
) {
    loop {
        let (stream, addr) = tokio::select! {
            _ = cancel.cancelled() => {
                debug!("Accept loop shutting down");
                break;
            }
            result = listener.accept() => match result {
                Ok(conn) => conn,
                Err(e) => {
                    warn!(error = %e, "Accept failed");
                    tokio::time::sleep(ACCEPT_RETRY).await;
                    continue;
                }
            },
        };

        debug!(addr = %addr, "New connection");

        if state.read().await.is_full() {
            ctx.tasks.spawn(
                format!("reject {}", addr),
                reject_connection(stream, addr, ctx.clone(), handshake_timeout),
            );
            continue;
        }

        ctx.tasks.spawn(
            format!("session {}", addr),
            handle_connection(
                stream,
                addr,
                state.clone(),
                ctx.clone(),
                cancel.clone(),
                handshake_timeout,
            ),
        );
    }
}

/// Turn away a connection while the hub is full
async fn reject_connection(
    stream: TcpStream,
    addr: SocketAddr,
    ctx: Context,
    handshake_timeout: Duration,
) {
    warn!(addr = %addr, "Hub is full, rejecting connection");
    ctx.emit(NodeEvent::Rejected {
        addr: addr.to_string(),
    });

    let (mut reader, mut writer) = stream.into_split();

    // Consume the join request first so closing does not reset the reply
    let _ = timeout(handshake_timeout, read_frame(&mut reader)).await;

    let reply = Message::JoinRejected {
        reason: CAPACITY_REACHED.to_string(),
    };
    if let Err(e) = write_frame(&mut writer, &reply).await {
        debug!(addr = %addr, error = %e, "Failed to send rejection");
    }
    let _ = writer.shutdown().await;
}

/// Outcome of the admission check
enum Admission {
    Accepted {
        peer_list: PeerList,
        connected: usize,
        max: usize,
    },
    Refused(Option<Message>),
}

/// Handle a single client connection
async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    state: Arc<RwLock<HubState>>,
    ctx: Context,
    hub_cancel: CancellationToken,
    handshake_timeout: Duration,
) {
    let (mut reader, mut writer) = stream.into_split();

    // First message must be a join request
    let request = tokio::select! {
        _ = hub_cancel.cancelled() => return,
        request = timeout(handshake_timeout, read_frame(&mut reader)) => request,
    };
    let (username, join_order) = match request {
        Ok(Ok(Message::JoinRequest {
            username,
            join_order,
        })) => (username, join_order.unwrap_or_else(join_order_now)),
        Ok(Ok(other)) => {
            warn!(addr = %addr, kind = other.kind(), "Handshake failed: expected join_request");
            return;
        }
        Ok(Err(e)) => {
            warn!(addr = %addr, error = %e, "Handshake failed");
            return;
        }
        Err(_) => {
            warn!(addr = %addr, "Handshake timed out");
            return;
        }
    };

    let id = Uuid::new_v4();
    let (tx, rx) = mpsc::channel(SESSION_QUEUE);
    let session_cancel = hub_cancel.child_token();

    let admission = {
        let mut s = state.write().await;
        if s.shutting_down {
            Admission::Refused(None)
        } else if s.is_username_taken(&username) {
            Admission::Refused(Some(Message::Error {
                reason: USERNAME_IN_USE.to_string(),
            }))
        } else if s.is_full() {
            Admission::Refused(Some(Message::JoinRejected {
                reason: CAPACITY_REACHED.to_string(),
            }))
        } else {
            s.sessions.insert(
                id,
                Session {
                    record: PeerRecord::client(
                        &username,
                        join_order,
                        Some(PeerAddress::new(addr.ip().to_string(), addr.port())),
                    ),
                    addr,
                    tx: tx.clone(),
                    cancel: session_cancel.clone(),
                },
            );
            let peer_list = s.peer_list();

            // Queued under the lock so it precedes any broadcast
            let _ = tx.try_send(Message::JoinAccepted {
                hub_username: s.username.clone(),
                peer_list: peer_list.clone(),
                message: s.capacity_message(),
            });

            let text = format!("{} joined the chat", username);
            let failed = s.fan_out(
                &Message::UserJoined {
                    username: username.clone(),
                    text,
                    peer_list: peer_list.clone(),
                },
                Some(id),
            );
            let connected = s.sessions.len();
            let max = s.max_connections;
            drop(s);
            evict(&state, &ctx, failed).await;

            Admission::Accepted {
                peer_list,
                connected,
                max,
            }
        }
    };

    let (peer_list, connected, max) = match admission {
        Admission::Accepted {
            peer_list,
            connected,
            max,
        } => (peer_list, connected, max),
        Admission::Refused(reply) => {
            if let Some(reply) = reply {
                warn!(addr = %addr, username = %username, reason = reply.kind(), "Join refused");
                if let Err(e) = write_frame(&mut writer, &reply).await {
                    debug!(addr = %addr, error = %e, "Failed to send refusal");
                }
            }
            let _ = writer.shutdown().await;
            return;
        }
    };

    info!(addr = %addr, username = %username, peers = peer_list.len(), "Client joined");
    ctx.transcript
        .system(format!("{} joined the chat ({})", username, addr));
    ctx.emit(NodeEvent::PeerJoined {
        username: username.clone(),
        text: format!("{} connected ({})", username, addr),
    });
    ctx.emit(NodeEvent::ClientCount { connected, max });

    let writer_cancel = session_cancel.clone();
    ctx.tasks.spawn(format!("writer {}", username), async move {
        if let Err(e) = write_loop(writer, rx, writer_cancel.clone()).await {
            debug!(error = %e, "Write failed, dropping client");
            writer_cancel.cancel();
        }
    });

    receive_loop(&mut reader, id, &username, &state, &ctx, &session_cancel).await;
    evict(&state, &ctx, vec![id]).await;
}

/// Per-session receive loop
async fn receive_loop(
    reader: &mut OwnedReadHalf,
    id: Uuid,
    username: &str,
    state: &Arc<RwLock<HubState>>,
    ctx: &Context,
    cancel: &CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = read_frame(reader) => frame,
        };

        match frame {
            Ok(Message::ChatMessage { text, .. }) => {
                relay_chat(state, ctx, id, username, text).await;
            }
            Ok(other) => {
                debug!(username = %username, kind = other.kind(), "Ignoring unexpected message");
            }
            Err(Error::ConnectionClosed) => {
                debug!(username = %username, "Connection closed");
                break;
            }
            Err(e) => {
                warn!(username = %username, error = %e, "Read error");
                break;
            }
        }
    }
}

/// Stamp a client's line and pass it on to everyone else
async fn relay_chat(
    state: &Arc<RwLock<HubState>>,
    ctx: &Context,
    sender: Uuid,
    username: &str,
    text: String,
) {
    let timestamp = Utc::now();
    ctx.transcript
        .record(EntryKind::ChatMessage, username, &text, timestamp);
    ctx.emit(NodeEvent::Chat {
        username: username.to_string(),
        text: text.clone(),
        timestamp,
    });

    let msg = Message::ChatMessage {
        username: Some(username.to_string()),
        text,
        timestamp: Some(timestamp),
    };
    let failed = state.read().await.fan_out(&msg, Some(sender));
    evict(state, ctx, failed).await;
}

/// Remove sessions and announce the new peer list. Broadcast failures
/// found while announcing are evicted in the same pass.
async fn evict(state: &Arc<RwLock<HubState>>, ctx: &Context, ids: Vec<Uuid>) {
    let mut pending = ids;

    while let Some(id) = pending.pop() {
        let mut s = state.write().await;
        let Some(session) = s.sessions.remove(&id) else {
            continue;
        };
        session.cancel.cancel();

        // Quiet during teardown
        if s.shutting_down {
            continue;
        }

        let username = session.record.username;
        let text = format!("{} left the chat", username);
        let msg = Message::UserLeft {
            username: username.clone(),
            text: text.clone(),
            peer_list: s.peer_list(),
        };
        pending.extend(s.fan_out(&msg, None));
        let connected = s.sessions.len();
        let max = s.max_connections;
        drop(s);

        info!(username = %username, "Client left");
        ctx.transcript.system(text.clone());
        ctx.emit(NodeEvent::PeerLeft { username, text });
        ctx.emit(NodeEvent::ClientCount { connected, max });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpStream;

    const HANDSHAKE: Duration = Duration::from_secs(2);

    async fn start_hub(ctx: &Context, max: usize) -> Server {
        Server::start(ctx, "127.0.0.1", 0, max, HANDSHAKE).await.unwrap()
    }

    async fn join(addr: SocketAddr, username: &str, join_order: f64) -> (TcpStream, Message) {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let request = Message::JoinRequest {
            username: username.to_string(),
            join_order: Some(join_order),
        };
        write_frame(&mut stream, &request).await.unwrap();
        let reply = timeout(HANDSHAKE, read_frame(&mut stream))
            .await
            .unwrap()
            .unwrap();
        (stream, reply)
    }

    async fn next(stream: &mut TcpStream) -> Message {
        timeout(HANDSHAKE, read_frame(stream)).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_server_start() {
        let (ctx, _events) = Context::new("alice");
        let server = start_hub(&ctx, 5).await;

        assert!(server.local_addr().port() > 0);
        assert_eq!(server.address().port, server.local_addr().port());
        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_join_accepted_with_ordered_peer_list() {
        let (ctx, _events) = Context::new("alice");
        let server = start_hub(&ctx, 5).await;

        let (_bob, reply) = join(server.local_addr(), "bob", 1.0).await;
        assert!(matches!(reply, Message::JoinAccepted { .. }));

        let (_carol, reply) = join(server.local_addr(), "carol", 2.0).await;
        match reply {
            Message::JoinAccepted {
                hub_username,
                peer_list,
                message,
            } => {
                assert_eq!(hub_username, "alice");
                let names: Vec<&str> = peer_list.iter().map(|p| p.username.as_str()).collect();
                assert_eq!(names, vec!["alice", "bob", "carol"]);
                assert_eq!(message, "connected clients: 2/5");
            }
            other => panic!("unexpected reply {:?}", other),
        }

        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_username_conflicts_rejected() {
        let (ctx, _events) = Context::new("alice");
        let server = start_hub(&ctx, 5).await;

        let (_bob, _) = join(server.local_addr(), "bob", 1.0).await;

        let (_, reply) = join(server.local_addr(), "alice", 2.0).await;
        assert_eq!(
            reply,
            Message::Error {
                reason: USERNAME_IN_USE.to_string()
            }
        );

        let (_, reply) = join(server.local_addr(), "bob", 3.0).await;
        assert!(matches!(reply, Message::Error { .. }));
        assert_eq!(server.sessions().await.len(), 1);

        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_chat_not_echoed_to_sender() {
        let (ctx, _events) = Context::new("alice");
        let server = start_hub(&ctx, 5).await;

        let (mut bob, _) = join(server.local_addr(), "bob", 1.0).await;
        let (mut carol, _) = join(server.local_addr(), "carol", 2.0).await;
        assert!(matches!(next(&mut bob).await, Message::UserJoined { username, .. } if username == "carol"));

        let line = Message::ChatMessage {
            username: None,
            text: "hi all".to_string(),
            timestamp: None,
        };
        write_frame(&mut bob, &line).await.unwrap();

        match next(&mut carol).await {
            Message::ChatMessage {
                username,
                text,
                timestamp,
            } => {
                assert_eq!(username.as_deref(), Some("bob"));
                assert_eq!(text, "hi all");
                assert!(timestamp.is_some());
            }
            other => panic!("unexpected message {:?}", other),
        }

        // Bob's next frame is the hub's line, not his own
        server.send_chat("welcome").await.unwrap();
        assert!(matches!(next(&mut bob).await, Message::ServerMessage { text, .. } if text == "welcome"));

        let kinds: Vec<EntryKind> = ctx.transcript.entries().iter().map(|e| e.kind).collect();
        assert!(kinds.contains(&EntryKind::ChatMessage));
        assert!(kinds.contains(&EntryKind::ServerMessage));

        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_send_without_clients() {
        let (ctx, _events) = Context::new("alice");
        let server = start_hub(&ctx, 5).await;

        assert!(matches!(server.send_chat("anyone?").await, Err(Error::NoPeers)));
        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_capacity_rejection() {
        let (ctx, _events) = Context::new("alice");
        let server = start_hub(&ctx, 1).await;

        let (_bob, reply) = join(server.local_addr(), "bob", 1.0).await;
        assert!(matches!(reply, Message::JoinAccepted { .. }));

        let (_, reply) = join(server.local_addr(), "carol", 2.0).await;
        assert_eq!(
            reply,
            Message::JoinRejected {
                reason: CAPACITY_REACHED.to_string()
            }
        );

        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_leave_broadcasts_updated_list() {
        let (ctx, _events) = Context::new("alice");
        let server = start_hub(&ctx, 5).await;

        let (mut bob, _) = join(server.local_addr(), "bob", 1.0).await;
        let (carol, _) = join(server.local_addr(), "carol", 2.0).await;
        let _ = next(&mut bob).await; // carol joined

        drop(carol);

        match next(&mut bob).await {
            Message::UserLeft {
                username,
                peer_list,
                ..
            } => {
                assert_eq!(username, "carol");
                assert!(!peer_list.contains("carol"));
                assert_eq!(peer_list.len(), 2);
            }
            other => panic!("unexpected message {:?}", other),
        }

        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_says_goodbye() {
        let (ctx, _events) = Context::new("alice");
        let server = start_hub(&ctx, 5).await;

        let (mut bob, _) = join(server.local_addr(), "bob", 1.0).await;
        server.shutdown().await;

        assert_eq!(
            next(&mut bob).await,
            Message::HubShutdown {
                text: HUB_CLOSING.to_string()
            }
        );
        assert!(matches!(
            timeout(HANDSHAKE, read_frame(&mut bob)).await.unwrap(),
            Err(Error::ConnectionClosed)
        ));

        // Second call is a no-op
        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_non_join_first_frame_dropped() {
        let (ctx, _events) = Context::new("alice");
        let server = start_hub(&ctx, 5).await;

        let mut stream = TcpStream::connect(server.local_addr()).await.unwrap();
        let line = Message::ChatMessage {
            username: None,
            text: "let me in".to_string(),
            timestamp: None,
        };
        write_frame(&mut stream, &line).await.unwrap();

        let result = timeout(HANDSHAKE, read_frame(&mut stream)).await.unwrap();
        assert!(result.is_err());
        assert!(server.sessions().await.is_empty());

        server.shutdown().await;
    }
}
