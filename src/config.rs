use crate::error::{Error, Result};

use std::time::Duration;

/// Raft node configuration.
#[derive(Clone, Debug)]
pub struct Config {
    /// Time in follower state without leader contact before starting an
    /// election. The effective timeout is randomized in [timeout, 2·timeout).
    pub heartbeat_timeout: Duration,

    /// Time in candidate state without winning before restarting the
    /// election in a new term. Randomized like heartbeat_timeout.
    pub election_timeout: Duration,

    /// How long a leader may go without contacting a quorum before it steps
    /// down. Must not exceed election_timeout: a deposed leader has to
    /// notice before the cluster can elect a replacement.
    pub leader_lease_timeout: Duration,

    /// Maximum number of entries in a single AppendEntries request. Trades
    /// replication latency against round trips when a follower lags.
    pub max_append_entries: usize,

    /// How often to check whether a snapshot should be taken. The check is
    /// randomized up to 2x to stagger snapshots across nodes.
    pub snapshot_interval: Duration,

    /// Minimum number of log entries since the last snapshot before a new
    /// snapshot is taken, to avoid snapshotting an idle node.
    pub snapshot_threshold: u64,

    /// Number of log entries to retain past a snapshot, so that slow
    /// followers can catch up from the log rather than a snapshot ship.
    pub trailing_logs: u64,

    /// Allows a node with no peers to elect itself, for single-node
    /// clusters and bootstrap.
    pub enable_single_node: bool,

    /// Clears enable_single_node once elected, so a node later removed from
    /// the cluster can't elect itself into a split brain.
    pub disable_bootstrap_after_elect: bool,

    /// Shut the node down when it commits its own removal, rather than
    /// reverting to a voterless follower.
    pub shutdown_on_remove: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            heartbeat_timeout: Duration::from_millis(1000),
            election_timeout: Duration::from_millis(1000),
            leader_lease_timeout: Duration::from_millis(500),
            max_append_entries: 64,
            snapshot_interval: Duration::from_secs(120),
            snapshot_threshold: 8192,
            trailing_logs: 10240,
            enable_single_node: false,
            disable_bootstrap_after_elect: true,
            shutdown_on_remove: true,
        }
    }
}

impl Config {
    /// Validates the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.heartbeat_timeout < Duration::from_millis(5) {
            return Err(Error::Config("heartbeat timeout too low".into()));
        }
        if self.election_timeout < Duration::from_millis(5) {
            return Err(Error::Config("election timeout too low".into()));
        }
        if self.leader_lease_timeout < Duration::from_millis(5) {
            return Err(Error::Config("leader lease timeout too low".into()));
        }
        if self.leader_lease_timeout > self.election_timeout {
            return Err(Error::Config("leader lease timeout can't exceed election timeout".into()));
        }
        if self.max_append_entries == 0 || self.max_append_entries > 1024 {
            return Err(Error::Config("max append entries must be in 1..=1024".into()));
        }
        if self.snapshot_interval < Duration::from_millis(5) {
            return Err(Error::Config("snapshot interval too low".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_valid() {
        Config::default().validate().expect("default config must validate")
    }

    #[test]
    fn lease_must_fit_election() {
        let config = Config {
            leader_lease_timeout: Duration::from_secs(2),
            election_timeout: Duration::from_secs(1),
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_zero_batch() {
        let config = Config { max_append_entries: 0, ..Config::default() };
        assert!(config.validate().is_err());
    }
}
