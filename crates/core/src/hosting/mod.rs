//! Hosting state for hub failover
//!
//! Pure bookkeeping behind the failover coordinator: the election record,
//! how long each peer waits before acting, the reconnect backoff schedule
//! and the ports a new hub may appear on. No I/O happens here.

use std::time::{Duration, Instant};

use crate::config::FailoverConfig;
use crate::models::PeerList;
use crate::registry::{rank, ElectionId};

/// Where the failover state machine currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailoverPhase {
    Idle,
    ElectionInProgress,
    PromotionInProgress,
}

/// Transient record of the election this node is running
#[derive(Debug, Clone, Default)]
pub struct ElectionState {
    in_progress: bool,
    my_election_id: Option<ElectionId>,
    started_at: Option<Instant>,
}

impl ElectionState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark an election as started. Returns false if one already runs.
    pub fn try_begin(&mut self, id: ElectionId) -> bool {
        if self.in_progress {
            return false;
        }

        self.in_progress = true;
        self.my_election_id = Some(id);
        self.started_at = Some(Instant::now());
        true
    }

    /// Clear the election record
    pub fn finish(&mut self) {
        self.in_progress = false;
        self.my_election_id = None;
        self.started_at = None;
    }

    pub fn is_in_progress(&self) -> bool {
        self.in_progress
    }

    pub fn my_election_id(&self) -> Option<ElectionId> {
        self.my_election_id
    }

    /// Time since the running election started
    pub fn elapsed(&self) -> Option<Duration> {
        self.started_at.map(|t| t.elapsed())
    }
}

/// How long `username` waits before checking whether it won.
///
/// The earliest-joined client waits least, so it gets first go at
/// promotion.
pub fn election_delay(peers: &PeerList, username: &str, config: &FailoverConfig) -> Duration {
    if peers.is_empty() {
        return Duration::from_secs_f64(config.empty_list_delay_secs);
    }

    match rank(peers, username) {
        Some(position) => Duration::from_secs_f64(
            config.base_delay_secs + position as f64 * config.rank_step_secs,
        ),
        None => Duration::from_secs_f64(config.unranked_delay_secs),
    }
}

/// Wait before reconnect attempt `attempt` (1-based):
/// `min(initial * factor^(attempt-1), cap)`
pub fn backoff_wait(attempt: u32, config: &FailoverConfig) -> Duration {
    let exponent = attempt.saturating_sub(1) as i32;
    let secs = config.backoff_initial_secs * config.backoff_factor.powi(exponent);
    Duration::from_secs_f64(secs.min(config.backoff_cap_secs))
}

/// Bounded exponential backoff between reconnect rounds
#[derive(Debug, Clone)]
pub struct Backoff {
    next_secs: f64,
    factor: f64,
    cap_secs: f64,
}

impl Backoff {
    pub fn new(config: &FailoverConfig) -> Self {
        Self {
            next_secs: config.backoff_initial_secs.min(config.backoff_cap_secs),
            factor: config.backoff_factor,
            cap_secs: config.backoff_cap_secs,
        }
    }

    /// Wait for the current round, then grow the next one
    pub fn next_wait(&mut self) -> Duration {
        let wait = Duration::from_secs_f64(self.next_secs);
        self.next_secs = (self.next_secs * self.factor).min(self.cap_secs);
        wait
    }
}

impl Iterator for Backoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        Some(self.next_wait())
    }
}

/// Ports a hub may be found on after failover: the original one first,
/// then `span` successors
pub fn candidate_ports(port: u16, span: u16) -> Vec<u16> {
    (0..=span).filter_map(|offset| port.checked_add(offset)).collect()
}
