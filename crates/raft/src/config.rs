//! Engine configuration.

use std::path::PathBuf;
use std::time::Duration;

use tessera_common::NodeId;

/// Configuration for one consensus engine instance.
///
/// # Examples
///
/// ```
/// use tessera_raft::EngineConfig;
///
/// let config = EngineConfig::new(1, "127.0.0.1:12000", "/var/lib/tessera/node1");
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Cluster-unique node identifier. Must be > 0.
    pub node_id: NodeId,

    /// Host:port the Raft gRPC transport binds to. This is also the
    /// address peers are told to reach this node at.
    pub bind_address: String,

    /// Directory holding `raft.db` and the `snapshots/` store.
    pub directory: PathBuf,

    /// Interval between logical ticks of the Raft clock.
    pub tick_interval: Duration,

    /// Ticks without leader contact before a follower starts an election.
    pub election_tick: usize,

    /// Ticks between leader heartbeats.
    pub heartbeat_tick: usize,

    /// Number of applied entries beyond the log head that triggers a
    /// snapshot and log compaction.
    pub snapshot_threshold: u64,

    /// How many finished snapshots to keep on disk.
    pub retain_snapshots: usize,
}

impl EngineConfig {
    /// Build a configuration with the default timing parameters.
    pub fn new(node_id: NodeId, bind_address: impl Into<String>, directory: impl Into<PathBuf>) -> Self {
        EngineConfig {
            node_id,
            bind_address: bind_address.into(),
            directory: directory.into(),
            tick_interval: Duration::from_millis(100),
            election_tick: 10,
            heartbeat_tick: 3,
            snapshot_threshold: 8192,
            retain_snapshots: 2,
        }
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns a description of the first invalid field.
    pub fn validate(&self) -> Result<(), String> {
        if self.node_id == 0 {
            return Err("node_id must be > 0".to_string());
        }
        if self.bind_address.is_empty() {
            return Err("bind_address cannot be empty".to_string());
        }
        if !self.bind_address.contains(':') {
            return Err("bind_address must contain a port (e.g. '127.0.0.1:12000')".to_string());
        }
        if self.election_tick <= self.heartbeat_tick {
            return Err(format!(
                "election_tick ({}) must be greater than heartbeat_tick ({})",
                self.election_tick, self.heartbeat_tick
            ));
        }
        if self.retain_snapshots == 0 {
            return Err("retain_snapshots must be at least 1".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::new(1, "127.0.0.1:12000", "/tmp/tessera");
        assert!(config.validate().is_ok());
        assert_eq!(config.retain_snapshots, 2);
        assert_eq!(config.tick_interval, Duration::from_millis(100));
    }

    #[test]
    fn test_zero_node_id_rejected() {
        let config = EngineConfig::new(0, "127.0.0.1:12000", "/tmp/tessera");
        assert!(config.validate().unwrap_err().contains("node_id"));
    }

    #[test]
    fn test_address_without_port_rejected() {
        let config = EngineConfig::new(1, "127.0.0.1", "/tmp/tessera");
        assert!(config.validate().unwrap_err().contains("port"));
    }

    #[test]
    fn test_election_tick_must_exceed_heartbeat() {
        let mut config = EngineConfig::new(1, "127.0.0.1:12000", "/tmp/tessera");
        config.election_tick = 3;
        config.heartbeat_tick = 3;
        assert!(config.validate().is_err());
    }
}
