//! Data models for hubchat

mod message;
mod peer;

pub use message::*;
pub use peer::*;
