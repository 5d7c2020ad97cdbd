//! Failover coordinator
//!
//! Runs when a client loses its hub: every survivor waits a delay derived
//! from its rank in the last peer list, the earliest-joined client promotes
//! itself to hub, and everyone else reconnects to it with bounded backoff.
//! Nothing is negotiated; identical peer lists give identical decisions.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use hubchat_core::{
    candidate_ports, election_delay, election_id, next_candidate, Backoff, ElectionId,
    ElectionState, FailoverPhase, PeerList,
};
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, warn};

use crate::client::{Client, LinkEnd};
use crate::error::{Error, Result};
use crate::event::NodeEvent;
use crate::node::{Node, Role};
use crate::server::Server;

/// Election and promotion flags, each behind its own lock
#[derive(Debug, Default)]
pub(crate) struct FailoverState {
    election: Mutex<ElectionState>,
    promoting: Mutex<bool>,
}

impl FailoverState {
    fn election(&self) -> MutexGuard<'_, ElectionState> {
        self.election
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn promoting(&self) -> MutexGuard<'_, bool> {
        self.promoting
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn try_begin_election(&self, id: ElectionId) -> bool {
        self.election().try_begin(id)
    }

    pub fn finish_election(&self) {
        self.election().finish();
    }

    pub fn election_in_progress(&self) -> bool {
        self.election().is_in_progress()
    }

    pub fn try_begin_promotion(&self) -> bool {
        let mut promoting = self.promoting();
        if *promoting {
            return false;
        }
        *promoting = true;
        true
    }

    pub fn finish_promotion(&self) {
        *self.promoting() = false;
    }

    pub fn is_promoting(&self) -> bool {
        *self.promoting()
    }

    pub fn phase(&self) -> FailoverPhase {
        if self.is_promoting() {
            FailoverPhase::PromotionInProgress
        } else if self.election_in_progress() {
            FailoverPhase::ElectionInProgress
        } else {
            FailoverPhase::Idle
        }
    }

    /// Clear both flags
    pub fn reset(&self) {
        self.finish_election();
        self.finish_promotion();
    }
}

/// Where the lost hub was, and who was in the group
struct HubTarget {
    peers: PeerList,
    host: String,
    port: u16,
}

/// React to the end of a client link.
///
/// Boxed because the reconnect path spawns a new link watcher that calls
/// back into this function.
pub(crate) fn on_link_end(node: Node, end: LinkEnd) -> Pin<Box<dyn Future<Output = ()> + Send>> {
    Box::pin(async move {
        let reason = match end {
            LinkEnd::Closed => return,
            LinkEnd::HubShutdown(text) => format!("hub closed: {}", text),
            LinkEnd::Lost(reason) => reason,
        };

        if node.is_shutting_down() {
            debug!("Hub link ended during shutdown");
            return;
        }
        let failover = &node.inner.failover;
        if failover.is_promoting() || failover.election_in_progress() {
            debug!(phase = ?failover.phase(), "Failover already running");
            return;
        }

        warn!(reason = %reason, "Hub lost");
        node.inner
            .ctx
            .transcript
            .system("Hub disconnected, starting election");
        node.inner.ctx.emit(NodeEvent::HubLost { reason });

        start_election(node).await;
    })
}

/// Close the dead link, compute this node's standing and launch the timed
/// election in the background
async fn start_election(node: Node) {
    let (peers, join_order, host, port) = {
        let mut role = node.inner.role.write().await;
        let Role::Client(client) = &*role else {
            return;
        };
        client.close();
        let snapshot = (
            client.peer_list().await,
            client.join_order(),
            client.host().to_string(),
            client.port(),
        );
        *role = Role::Unset;
        snapshot
    };

    let username = node.username();
    let id = election_id(&peers, username, join_order);
    if !node.inner.failover.try_begin_election(id) {
        debug!("Election already in progress");
        return;
    }

    let delay = election_delay(&peers, username, &node.inner.config.failover);
    info!(id = %id, delay_secs = delay.as_secs_f64(), "Election started");
    node.inner
        .ctx
        .transcript
        .system(format!("Election started, waiting {:.2}s", delay.as_secs_f64()));
    node.inner
        .ctx
        .emit(NodeEvent::ElectionStarted { id, delay });

    let target = HubTarget { peers, host, port };
    let task_node = node.clone();
    node.inner
        .ctx
        .tasks
        .spawn("election", conduct_election(task_node, target, delay));
}

async fn conduct_election(node: Node, target: HubTarget, delay: Duration) {
    // Success paths clear the election flag themselves, before a new link
    // watcher can start the next election
    let outcome = run_election(&node, &target, delay).await;
    if outcome.is_err() {
        node.inner.failover.finish_election();
    }

    match outcome {
        Ok(()) => {}
        Err(Error::ShuttingDown) => debug!("Failover aborted by shutdown"),
        Err(e) if e.is_fatal() => halt(&node, e.to_string()),
        Err(e) => warn!(error = %e, "Election failed"),
    }
}

async fn run_election(node: &Node, target: &HubTarget, delay: Duration) -> Result<()> {
    pause(node, delay).await?;

    let ctx = &node.inner.ctx;
    match next_candidate(&target.peers) {
        Some(candidate) if candidate.username == node.username() => {
            info!("Elected as the new hub");
            ctx.transcript.system("Elected as the new hub");
            ctx.emit(NodeEvent::ElectionWon);
            promote(node, target).await
        }
        Some(candidate) => {
            info!(candidate = %candidate.username, "Another peer takes over the hub");
            ctx.transcript
                .system(format!("{} was elected as the new hub", candidate.username));
            ctx.emit(NodeEvent::ElectionLost {
                candidate: candidate.username.clone(),
            });
            pause(node, node.inner.config.failover.candidate_grace()).await?;
            reconnect(node, target).await
        }
        None => {
            // Nobody to hand the hub to; look for whoever comes up instead
            info!("No promotion candidate in the last peer list");
            reconnect(node, target).await
        }
    }
}

/// Wait for `duration`, checking for shutdown at poll-interval granularity
async fn pause(node: &Node, duration: Duration) -> Result<()> {
    let shutdown = &node.inner.ctx.shutdown;
    let poll = node.inner.config.failover.poll_interval();
    let deadline = Instant::now() + duration;

    loop {
        if node.is_shutting_down() {
            return Err(Error::ShuttingDown);
        }
        let now = Instant::now();
        if now >= deadline {
            return Ok(());
        }

        tokio::select! {
            _ = shutdown.cancelled() => return Err(Error::ShuttingDown),
            _ = sleep((deadline - now).min(poll)) => {}
        }
    }
}

/// Become the hub, at most once at a time
async fn promote(node: &Node, target: &HubTarget) -> Result<()> {
    if !node.inner.failover.try_begin_promotion() {
        debug!("Promotion already in progress");
        node.inner.failover.finish_election();
        return Ok(());
    }

    let result = bind_as_hub(node, target).await;
    node.inner.failover.finish_promotion();
    node.inner.failover.finish_election();
    result
}

async fn bind_as_hub(node: &Node, target: &HubTarget) -> Result<()> {
    let ctx = &node.inner.ctx;
    let config = &node.inner.config;

    info!("Promoting to hub");
    ctx.transcript.system("Promoting to hub");
    ctx.emit(NodeEvent::PromotionStarted);

    pause(node, config.failover.settle()).await?;

    let ports = candidate_ports(target.port, config.failover.port_span);
    for &port in &ports {
        if node.is_shutting_down() {
            return Err(Error::ShuttingDown);
        }

        match Server::start(
            ctx,
            &target.host,
            port,
            config.max_connections,
            config.handshake_timeout(),
        )
        .await
        {
            Ok(server) => return node.install_server(server).await,
            Err(Error::ShuttingDown) => return Err(Error::ShuttingDown),
            Err(e) => {
                warn!(port, error = %e, "Could not become hub on this port");
                ctx.emit(NodeEvent::BindFailed {
                    port,
                    reason: e.to_string(),
                });
            }
        }
    }

    Err(Error::PromotionExhausted {
        first: ports.first().copied().unwrap_or(target.port),
        last: ports.last().copied().unwrap_or(target.port),
    })
}

/// Rejoin whichever peer took over, trying every candidate port per round
async fn reconnect(node: &Node, target: &HubTarget) -> Result<()> {
    let ctx = &node.inner.ctx;
    let config = &node.inner.config;
    let attempts = config.failover.reconnect_attempts;
    let ports = candidate_ports(target.port, config.failover.port_span);
    let mut backoff = Backoff::new(&config.failover);

    for attempt in 1..=attempts {
        info!(attempt, max = attempts, "Reconnection attempt");
        ctx.emit(NodeEvent::ReconnectAttempt {
            attempt,
            max: attempts,
        });

        for &port in &ports {
            match Client::connect(ctx, &target.host, port, config.connect_timeout()).await {
                Ok((client, link)) => {
                    // Cleared first so a loss of the new hub can start a fresh election
                    node.inner.failover.finish_election();
                    return node.install_client(client, link, true).await;
                }
                Err(Error::ShuttingDown) => return Err(Error::ShuttingDown),
                Err(e) => debug!(port, error = %e, "Reconnect failed"),
            }
        }

        if attempt < attempts {
            pause(node, backoff.next_wait()).await?;
        }
    }

    Err(Error::ReconnectionExhausted(attempts))
}

/// Stop the node after an unrecoverable failover error
fn halt(node: &Node, reason: String) {
    error!(reason = %reason, "Failover exhausted, stopping node");
    node.inner
        .ctx
        .transcript
        .system(format!("Stopped: {}", reason));
    node.inner.ctx.emit(NodeEvent::Stopped {
        reason: reason.clone(),
    });
    node.set_stop_reason(reason);
    node.inner.ctx.shutdown.cancel();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ranked(position: usize) -> ElectionId {
        ElectionId::Ranked {
            position: Some(position),
            join_order: position as f64 + 1.0,
        }
    }

    #[test]
    fn test_flags_are_independent() {
        let state = FailoverState::default();
        assert_eq!(state.phase(), FailoverPhase::Idle);

        assert!(state.try_begin_election(ranked(0)));
        assert_eq!(state.phase(), FailoverPhase::ElectionInProgress);
        assert!(!state.try_begin_election(ranked(1)));

        assert!(state.try_begin_promotion());
        assert!(!state.try_begin_promotion());
        assert_eq!(state.phase(), FailoverPhase::PromotionInProgress);

        state.finish_promotion();
        assert!(state.election_in_progress());

        state.reset();
        assert_eq!(state.phase(), FailoverPhase::Idle);
    }

    #[tokio::test]
    async fn test_next_election_not_cleared_by_finished_one() {
        use hubchat_core::NodeConfig;

        let (alice, _alice_events) = Node::new(NodeConfig {
            username: "alice".to_string(),
            ..NodeConfig::default()
        });
        let addr = alice.start_server("127.0.0.1", 0).await.unwrap();

        let mut config = NodeConfig {
            username: "carol".to_string(),
            ..NodeConfig::default()
        };
        config.failover.base_delay_secs = 30.0;
        config.failover.task_join_timeout_secs = 1.0;
        let (carol, mut carol_events) = Node::new(config);

        // An election that ends by rejoining alice
        assert!(carol.inner.failover.try_begin_election(ranked(0)));
        let target = HubTarget {
            peers: PeerList::new(),
            host: "127.0.0.1".to_string(),
            port: addr.port(),
        };
        conduct_election(carol.clone(), target, Duration::ZERO).await;
        assert_eq!(carol.inner.failover.phase(), FailoverPhase::Idle);

        // Losing the new hub starts a fresh election that stays in progress
        alice.shutdown().await;
        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), carol_events.recv())
                .await
                .unwrap()
                .unwrap();
            if matches!(event, NodeEvent::ElectionStarted { .. }) {
                break;
            }
        }
        sleep(Duration::from_millis(100)).await;
        assert_eq!(
            carol.inner.failover.phase(),
            FailoverPhase::ElectionInProgress
        );

        carol.shutdown().await;
        assert_eq!(carol.inner.failover.phase(), FailoverPhase::Idle);
    }
}
