//! Node configuration
//!
//! Loaded from a TOML file. Every field has a default, so a partial file (or
//! no file at all) is fine.
//!
//! ```toml
//! host = "localhost"
//! port = 5555
//! max_connections = 5
//!
//! [failover]
//! settle_secs = 2.0
//! reconnect_attempts = 8
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Environment variable naming an explicit config file
pub const CONFIG_ENV: &str = "HUBCHAT_CONFIG";

/// Default host for both hosting and joining
pub const DEFAULT_HOST: &str = "localhost";

/// Default TCP port
pub const DEFAULT_PORT: u16 = 5555;

/// Default hub capacity
pub const DEFAULT_MAX_CONNECTIONS: usize = 5;

/// Top-level node configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Display name; normally asked for interactively
    pub username: String,
    pub host: String,
    pub port: u16,
    /// Maximum number of client sessions a hub admits
    pub max_connections: usize,
    /// Time a new connection has to send its join request
    pub handshake_timeout_secs: f64,
    /// Time a client waits for connect + join reply
    pub connect_timeout_secs: f64,
    /// Directory session transcripts are written to
    pub transcript_dir: PathBuf,
    pub failover: FailoverConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            username: String::new(),
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            handshake_timeout_secs: 10.0,
            connect_timeout_secs: 10.0,
            transcript_dir: PathBuf::from("chat_logs"),
            failover: FailoverConfig::default(),
        }
    }
}

/// Timing and retry knobs for election, promotion and reconnection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FailoverConfig {
    /// Wait before the first-ranked peer acts
    pub base_delay_secs: f64,
    /// Extra wait per rank position
    pub rank_step_secs: f64,
    /// Wait used when this node is missing from its own peer list
    pub unranked_delay_secs: f64,
    /// Wait used when no peer list was ever received
    pub empty_list_delay_secs: f64,
    /// Pause after winning, before binding, so the losers settle
    pub settle_secs: f64,
    /// Time the losers give the winner to come up
    pub candidate_grace_secs: f64,
    pub reconnect_attempts: u32,
    pub backoff_initial_secs: f64,
    pub backoff_factor: f64,
    pub backoff_cap_secs: f64,
    /// Ports tried after the original one (`port+1 ..= port+span`)
    pub port_span: u16,
    /// Granularity at which waits re-check their abort conditions
    pub poll_interval_ms: u64,
    /// Upper bound on waiting for each background task at shutdown
    pub task_join_timeout_secs: f64,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            base_delay_secs: 1.0,
            rank_step_secs: 1.0,
            unranked_delay_secs: 5.0,
            empty_list_delay_secs: 1.0,
            settle_secs: 2.0,
            candidate_grace_secs: 3.0,
            reconnect_attempts: 8,
            backoff_initial_secs: 2.0,
            backoff_factor: 1.2,
            backoff_cap_secs: 8.0,
            port_span: 5,
            poll_interval_ms: 100,
            task_join_timeout_secs: 3.0,
        }
    }
}

impl FailoverConfig {
    pub fn settle(&self) -> Duration {
        secs(self.settle_secs)
    }

    pub fn candidate_grace(&self) -> Duration {
        secs(self.candidate_grace_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn task_join_timeout(&self) -> Duration {
        secs(self.task_join_timeout_secs)
    }
}

impl NodeConfig {
    pub fn handshake_timeout(&self) -> Duration {
        secs(self.handshake_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        secs(self.connect_timeout_secs)
    }

    /// Parse a config from TOML text
    pub fn from_toml(text: &str) -> Result<Self> {
        let config: NodeConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a config file
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml(&text)
    }

    /// Load a config file, or return defaults if it is missing or unusable
    pub fn load_or_default(path: &Path) -> Self {
        if !path.exists() {
            return Self::default();
        }

        match Self::load(path) {
            Ok(config) => {
                tracing::debug!(path = %path.display(), "Loaded config");
                config
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Unusable config file, using defaults");
                Self::default()
            }
        }
    }

    /// Resolve the config from `HUBCHAT_CONFIG`, then the platform config
    /// directory, then built-in defaults
    pub fn from_env() -> Self {
        match Self::config_path() {
            Some(path) => Self::load_or_default(&path),
            None => Self::default(),
        }
    }

    fn config_path() -> Option<PathBuf> {
        if let Ok(path) = std::env::var(CONFIG_ENV) {
            return Some(PathBuf::from(path));
        }

        ProjectDirs::from("dev", "hubchat", "hubchat").map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Reject values the node cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.max_connections == 0 {
            return Err(Error::InvalidConfig("max_connections must be at least 1".into()));
        }
        if self.host.trim().is_empty() {
            return Err(Error::InvalidConfig("host must not be empty".into()));
        }
        let timings = [
            self.handshake_timeout_secs,
            self.connect_timeout_secs,
            self.failover.base_delay_secs,
            self.failover.rank_step_secs,
            self.failover.unranked_delay_secs,
            self.failover.empty_list_delay_secs,
            self.failover.settle_secs,
            self.failover.candidate_grace_secs,
            self.failover.backoff_initial_secs,
            self.failover.backoff_cap_secs,
            self.failover.task_join_timeout_secs,
        ];
        if timings.iter().any(|t| !t.is_finite() || *t < 0.0) {
            return Err(Error::InvalidConfig("timings must be non-negative seconds".into()));
        }
        if !self.failover.backoff_factor.is_finite() || self.failover.backoff_factor < 1.0 {
            return Err(Error::InvalidConfig("backoff_factor must be at least 1.0".into()));
        }
        Ok(())
    }
}

fn secs(value: f64) -> Duration {
    Duration::from_secs_f64(value.max(0.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = NodeConfig::default();
        assert_eq!(config.host, "localhost");
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.max_connections, 5);
        assert_eq!(config.handshake_timeout(), Duration::from_secs(10));
        assert_eq!(config.failover.reconnect_attempts, 8);
        assert_eq!(config.failover.port_span, 5);
        assert_eq!(config.failover.poll_interval(), Duration::from_millis(100));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = NodeConfig::from_toml(
            r#"
            port = 6000
            max_connections = 2

            [failover]
            settle_secs = 0.5
            "#,
        )
        .unwrap();

        assert_eq!(config.port, 6000);
        assert_eq!(config.max_connections, 2);
        assert_eq!(config.host, "localhost");
        assert_eq!(config.failover.settle(), Duration::from_millis(500));
        assert_eq!(config.failover.candidate_grace(), Duration::from_secs(3));
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let result = NodeConfig::from_toml("max_connections = 0");
        assert!(matches!(result, Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_load_or_default() {
        let dir = tempfile::tempdir().unwrap();

        let missing = dir.path().join("missing.toml");
        assert_eq!(NodeConfig::load_or_default(&missing), NodeConfig::default());

        let corrupt = dir.path().join("corrupt.toml");
        std::fs::write(&corrupt, "port = \"not a number\"").unwrap();
        assert_eq!(NodeConfig::load_or_default(&corrupt), NodeConfig::default());

        let good = dir.path().join("good.toml");
        std::fs::write(&good, "username = \"bob\"\nport = 7000\n").unwrap();
        let loaded = NodeConfig::load_or_default(&good);
        assert_eq!(loaded.username, "bob");
        assert_eq!(loaded.port, 7000);
    }
}
