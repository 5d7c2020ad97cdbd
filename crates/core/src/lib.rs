//! hubchat Core Library
//!
//! Peer model, deterministic election math, failover bookkeeping,
//! configuration and session transcripts. Nothing in here touches a socket.

pub mod config;
pub mod error;
pub mod hosting;
pub mod invariants;
pub mod models;
pub mod registry;
pub mod transcript;

pub use config::{FailoverConfig, NodeConfig};
pub use error::{Error, Result};
pub use hosting::*;
pub use models::*;
pub use registry::{election_id, next_candidate, rank, ElectionId};
pub use transcript::{SessionMode, Transcript, TranscriptHeader, TranscriptWriter};
