use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};

/// The role a node is currently in. Shutdown is terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeState {
    Follower,
    Candidate,
    Leader,
    Shutdown,
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            NodeState::Follower => write!(f, "follower"),
            NodeState::Candidate => write!(f, "candidate"),
            NodeState::Leader => write!(f, "leader"),
            NodeState::Shutdown => write!(f, "shutdown"),
        }
    }
}

/// The in-memory cache of a node's consensus state, shared across the role
/// loop and the worker threads. Durable fields (the term; log and snapshot
/// positions) are written through to their stores before these caches are
/// updated, so any thread may read them without blocking on I/O.
#[derive(Default)]
pub(crate) struct RaftState {
    current_term: AtomicU64,
    commit_index: AtomicU64,
    last_applied: AtomicU64,
    last_log_index: AtomicU64,
    last_log_term: AtomicU64,
    last_snapshot_index: AtomicU64,
    last_snapshot_term: AtomicU64,
    state: AtomicU8,
}

impl RaftState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> NodeState {
        match self.state.load(Ordering::SeqCst) {
            0 => NodeState::Follower,
            1 => NodeState::Candidate,
            2 => NodeState::Leader,
            _ => NodeState::Shutdown,
        }
    }

    pub fn set_state(&self, state: NodeState) {
        let value = match state {
            NodeState::Follower => 0,
            NodeState::Candidate => 1,
            NodeState::Leader => 2,
            NodeState::Shutdown => 3,
        };
        self.state.store(value, Ordering::SeqCst);
    }

    pub fn current_term(&self) -> u64 {
        self.current_term.load(Ordering::SeqCst)
    }

    pub fn set_current_term(&self, term: u64) {
        self.current_term.store(term, Ordering::SeqCst)
    }

    pub fn commit_index(&self) -> u64 {
        self.commit_index.load(Ordering::SeqCst)
    }

    pub fn set_commit_index(&self, index: u64) {
        self.commit_index.store(index, Ordering::SeqCst)
    }

    pub fn last_applied(&self) -> u64 {
        self.last_applied.load(Ordering::SeqCst)
    }

    pub fn set_last_applied(&self, index: u64) {
        self.last_applied.store(index, Ordering::SeqCst)
    }

    pub fn last_log_index(&self) -> u64 {
        self.last_log_index.load(Ordering::SeqCst)
    }

    pub fn last_log_term(&self) -> u64 {
        self.last_log_term.load(Ordering::SeqCst)
    }

    pub fn set_last_log(&self, index: u64, term: u64) {
        self.last_log_index.store(index, Ordering::SeqCst);
        self.last_log_term.store(term, Ordering::SeqCst);
    }

    pub fn last_snapshot_index(&self) -> u64 {
        self.last_snapshot_index.load(Ordering::SeqCst)
    }

    pub fn last_snapshot_term(&self) -> u64 {
        self.last_snapshot_term.load(Ordering::SeqCst)
    }

    pub fn set_last_snapshot(&self, index: u64, term: u64) {
        self.last_snapshot_index.store(index, Ordering::SeqCst);
        self.last_snapshot_term.store(term, Ordering::SeqCst);
    }

    /// The last index in stable storage, from the log or the last snapshot.
    pub fn last_index(&self) -> u64 {
        std::cmp::max(self.last_log_index(), self.last_snapshot_index())
    }

    /// The last stored (index, term) pair, from the log if it extends past
    /// the last snapshot, otherwise from the snapshot.
    pub fn last_entry(&self) -> (u64, u64) {
        if self.last_log_index() >= self.last_snapshot_index() {
            (self.last_log_index(), self.last_log_term())
        } else {
            (self.last_snapshot_index(), self.last_snapshot_term())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_as_follower() {
        let state = RaftState::new();
        assert_eq!(state.state(), NodeState::Follower);
        assert_eq!(state.current_term(), 0);
        assert_eq!(state.last_entry(), (0, 0));
    }

    #[test]
    fn last_entry_prefers_log() {
        let state = RaftState::new();
        state.set_last_log(5, 2);
        state.set_last_snapshot(3, 1);
        assert_eq!(state.last_index(), 5);
        assert_eq!(state.last_entry(), (5, 2));
    }

    #[test]
    fn last_entry_falls_back_to_snapshot() {
        // After compaction the log can be empty while the snapshot covers
        // everything.
        let state = RaftState::new();
        state.set_last_snapshot(7, 3);
        assert_eq!(state.last_index(), 7);
        assert_eq!(state.last_entry(), (7, 3));
    }
}
