//! Node actor
//!
//! A node starts unset, is told once to host or to join, and from then on
//! changes role only through failover: a client whose hub vanishes either
//! becomes the hub itself or rejoins whoever did.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use hubchat_core::{
    NodeConfig, PeerAddress, PeerList, SessionMode, Transcript, TranscriptHeader,
};
use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::info;

use crate::client::{Client, LinkEnd};
use crate::context::Context;
use crate::error::{Error, Result};
use crate::event::NodeEvent;
use crate::failover::{self, FailoverState};
use crate::server::{Server, SessionInfo};

/// Current role and the state that belongs to it
pub(crate) enum Role {
    Unset,
    Server(Server),
    Client(Client),
}

/// Which role a node currently plays
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleKind {
    Unset,
    Server,
    Client,
}

impl Role {
    fn kind(&self) -> RoleKind {
        match self {
            Role::Unset => RoleKind::Unset,
            Role::Server(_) => RoleKind::Server,
            Role::Client(_) => RoleKind::Client,
        }
    }
}

pub(crate) struct NodeInner {
    pub config: NodeConfig,
    pub ctx: Context,
    pub role: RwLock<Role>,
    pub failover: FailoverState,
    /// Set by the first `shutdown` call
    teardown: AtomicBool,
    stop_reason: Mutex<Option<String>>,
    /// Last role worth naming in the transcript header
    mode: Mutex<SessionMode>,
    started_at: DateTime<Utc>,
}

/// Chat node handle
#[derive(Clone)]
pub struct Node {
    pub(crate) inner: Arc<NodeInner>,
}

impl Node {
    /// Create an unset node. Status events arrive on the returned receiver.
    pub fn new(config: NodeConfig) -> (Self, mpsc::UnboundedReceiver<NodeEvent>) {
        let (ctx, events) = Context::new(config.username.clone());
        let inner = NodeInner {
            config,
            ctx,
            role: RwLock::new(Role::Unset),
            failover: FailoverState::default(),
            teardown: AtomicBool::new(false),
            stop_reason: Mutex::new(None),
            mode: Mutex::new(SessionMode::Offline),
            started_at: Utc::now(),
        };
        (
            Node {
                inner: Arc::new(inner),
            },
            events,
        )
    }

    pub fn username(&self) -> &str {
        &self.inner.ctx.username
    }

    pub fn config(&self) -> &NodeConfig {
        &self.inner.config
    }

    /// Host a new chat on `host:port`
    pub async fn start_server(&self, host: &str, port: u16) -> Result<SocketAddr> {
        let mut role = self.inner.role.write().await;
        self.ensure_unset(&role)?;

        let config = &self.inner.config;
        let server = Server::start(
            &self.inner.ctx,
            host,
            port,
            config.max_connections,
            config.handshake_timeout(),
        )
        .await?;

        let addr = server.local_addr();
        self.set_mode(SessionMode::Server);
        *role = Role::Server(server);
        Ok(addr)
    }

    /// Join the hub at `host:port`
    pub async fn connect(&self, host: &str, port: u16) -> Result<()> {
        let mut role = self.inner.role.write().await;
        self.ensure_unset(&role)?;

        let (client, link) = Client::connect(
            &self.inner.ctx,
            host,
            port,
            self.inner.config.connect_timeout(),
        )
        .await?;
        self.attach_client(&mut role, client, link, false);
        Ok(())
    }

    fn ensure_unset(&self, role: &Role) -> Result<()> {
        if self.is_shutting_down() {
            return Err(Error::ShuttingDown);
        }
        match role {
            Role::Unset => Ok(()),
            Role::Server(_) => Err(Error::AlreadyRunning("hub")),
            Role::Client(_) => Err(Error::AlreadyRunning("client")),
        }
    }

    /// Take over the hub role after promotion
    pub(crate) async fn install_server(&self, server: Server) -> Result<()> {
        let mut role = self.inner.role.write().await;
        if self.is_shutting_down() {
            server.shutdown().await;
            return Err(Error::ShuttingDown);
        }

        let port = server.local_addr().port();
        info!(port, "Promotion complete");
        self.inner
            .ctx
            .transcript
            .system(format!("Promoted to hub on port {}", port));
        self.inner.ctx.emit(NodeEvent::Promoted { port });

        self.set_mode(SessionMode::Server);
        *role = Role::Server(server);
        Ok(())
    }

    /// Adopt a hub connection made by the reconnect loop
    pub(crate) async fn install_client(
        &self,
        client: Client,
        link: oneshot::Receiver<LinkEnd>,
        reconnected: bool,
    ) -> Result<()> {
        let mut role = self.inner.role.write().await;
        if self.is_shutting_down() {
            client.close();
            return Err(Error::ShuttingDown);
        }
        self.attach_client(&mut role, client, link, reconnected);
        Ok(())
    }

    fn attach_client(
        &self,
        role: &mut Role,
        client: Client,
        link: oneshot::Receiver<LinkEnd>,
        reconnected: bool,
    ) {
        let ctx = &self.inner.ctx;
        let hub_username = client.hub_username().to_string();
        let addr = PeerAddress::new(client.host(), client.port());

        info!(hub = %hub_username, addr = %addr, reconnected, "Connected to hub");
        ctx.transcript
            .system(format!("Connected to {} at {}", hub_username, addr));
        if reconnected {
            ctx.emit(NodeEvent::Reconnected {
                hub_username: hub_username.clone(),
                port: addr.port,
            });
        } else {
            ctx.emit(NodeEvent::Connected {
                hub_username: hub_username.clone(),
                addr: addr.clone(),
            });
        }

        self.set_mode(SessionMode::Client {
            hub_username,
            host: addr.host,
            port: addr.port,
        });

        let node = self.clone();
        ctx.tasks.spawn("link watcher", async move {
            if let Ok(end) = link.await {
                failover::on_link_end(node, end).await;
            }
        });

        *role = Role::Client(client);
    }

    /// Send a chat line in whatever role the node holds
    pub async fn send(&self, text: &str) -> Result<()> {
        match &*self.inner.role.read().await {
            Role::Server(server) => server.send_chat(text).await,
            Role::Client(client) => client.send_chat(text).await,
            Role::Unset => Err(Error::NotConnected),
        }
    }

    /// Connected clients when hosting; empty otherwise
    pub async fn sessions(&self) -> Vec<SessionInfo> {
        match &*self.inner.role.read().await {
            Role::Server(server) => server.sessions().await,
            _ => Vec::new(),
        }
    }

    pub async fn role(&self) -> RoleKind {
        self.inner.role.read().await.kind()
    }

    /// Current peer list: authoritative on a hub, last received on a client
    pub async fn peer_list(&self) -> PeerList {
        match &*self.inner.role.read().await {
            Role::Server(server) => server.peer_list().await,
            Role::Client(client) => client.peer_list().await,
            Role::Unset => PeerList::new(),
        }
    }

    /// Name of the hub this node is connected to, or its own name if hosting
    pub async fn hub_username(&self) -> Option<String> {
        match &*self.inner.role.read().await {
            Role::Server(_) => Some(self.username().to_string()),
            Role::Client(client) => Some(client.hub_username().to_string()),
            Role::Unset => None,
        }
    }

    /// Listening address when hosting
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        match &*self.inner.role.read().await {
            Role::Server(server) => Some(server.local_addr()),
            _ => None,
        }
    }

    pub fn transcript(&self) -> Transcript {
        self.inner.ctx.transcript.clone()
    }

    pub fn transcript_header(&self) -> TranscriptHeader {
        TranscriptHeader {
            username: self.username().to_string(),
            started_at: self.inner.started_at,
            mode: self
                .inner
                .mode
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .clone(),
        }
    }

    fn set_mode(&self, mode: SessionMode) {
        *self
            .inner
            .mode
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = mode;
    }

    pub fn is_running(&self) -> bool {
        !self.is_shutting_down()
    }

    pub(crate) fn is_shutting_down(&self) -> bool {
        self.inner.teardown.load(Ordering::SeqCst) || self.inner.ctx.is_shutting_down()
    }

    /// Resolves once the node stops, whether by `shutdown` or a fatal error
    pub async fn stopped(&self) {
        self.inner.ctx.shutdown.cancelled().await;
    }

    /// Why the node stopped on its own, if it did
    pub fn stop_reason(&self) -> Option<String> {
        self.inner
            .stop_reason
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub(crate) fn set_stop_reason(&self, reason: String) {
        *self
            .inner
            .stop_reason
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(reason);
    }

    /// Stop every loop and close every connection. Later calls do nothing.
    pub async fn shutdown(&self) {
        if self.inner.teardown.swap(true, Ordering::SeqCst) {
            return;
        }

        info!(username = %self.username(), "Shutting down");
        self.inner.failover.reset();

        match &*self.inner.role.read().await {
            Role::Server(server) => server.shutdown().await,
            Role::Client(client) => client.close(),
            Role::Unset => {}
        }

        self.inner.ctx.shutdown.cancel();
        self.inner
            .ctx
            .tasks
            .join_all(self.inner.config.failover.task_join_timeout())
            .await;

        info!("Shutdown complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(username: &str) -> NodeConfig {
        NodeConfig {
            username: username.to_string(),
            ..NodeConfig::default()
        }
    }

    #[tokio::test]
    async fn test_send_while_unset() {
        let (node, _events) = Node::new(config("bob"));

        assert_eq!(node.role().await, RoleKind::Unset);
        assert!(matches!(node.send("hello").await, Err(Error::NotConnected)));
        assert!(node.peer_list().await.is_empty());
        assert!(node.hub_username().await.is_none());
    }

    #[tokio::test]
    async fn test_start_server_once() {
        let (node, mut events) = Node::new(config("alice"));

        let addr = node.start_server("127.0.0.1", 0).await.unwrap();
        assert_eq!(node.role().await, RoleKind::Server);
        assert_eq!(node.local_addr().await, Some(addr));
        assert!(matches!(events.recv().await, Some(NodeEvent::Hosting { .. })));

        assert!(matches!(
            node.start_server("127.0.0.1", 0).await,
            Err(Error::AlreadyRunning("hub"))
        ));
        assert!(matches!(
            node.send("anyone?").await,
            Err(Error::NoPeers)
        ));

        node.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let (node, mut events) = Node::new(config("alice"));
        node.start_server("127.0.0.1", 0).await.unwrap();
        let _ = events.recv().await;

        node.shutdown().await;
        assert!(!node.is_running());
        let entries = node.transcript().len();

        node.shutdown().await;
        assert_eq!(node.transcript().len(), entries);
        assert!(events.try_recv().is_err());
        assert!(node.stop_reason().is_none());
        assert_eq!(node.inner.ctx.tasks.running(), 0);
    }

    #[tokio::test]
    async fn test_no_role_after_shutdown() {
        let (node, _events) = Node::new(config("alice"));
        node.shutdown().await;

        assert!(matches!(
            node.start_server("127.0.0.1", 0).await,
            Err(Error::ShuttingDown)
        ));
        assert!(matches!(
            node.connect("127.0.0.1", 1).await,
            Err(Error::ShuttingDown)
        ));
        node.stopped().await;
    }

    #[tokio::test]
    async fn test_header_tracks_role() {
        let (hub, _hub_events) = Node::new(config("alice"));
        let addr = hub.start_server("127.0.0.1", 0).await.unwrap();
        assert_eq!(hub.transcript_header().mode, SessionMode::Server);

        let (client, _client_events) = Node::new(config("bob"));
        assert_eq!(client.transcript_header().mode, SessionMode::Offline);
        client.connect("127.0.0.1", addr.port()).await.unwrap();

        assert_eq!(
            client.transcript_header().mode,
            SessionMode::Client {
                hub_username: "alice".to_string(),
                host: "127.0.0.1".to_string(),
                port: addr.port(),
            }
        );
        assert_eq!(client.hub_username().await.as_deref(), Some("alice"));

        client.shutdown().await;
        hub.shutdown().await;
    }
}
