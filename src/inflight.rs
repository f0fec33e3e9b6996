use crate::error::Error;
use crate::future::LogFuture;
use crate::peer::Address;

use crossbeam_channel::Sender;
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::Mutex;

/// The leader's register of dispatched-but-uncommitted log entries. Each
/// entry tracks the peers that have replicated it; once a majority has
/// (counting the leader), the entry is committed and queued for the leader
/// loop, which learns of it via a coalesced pulse on the commit channel.
///
/// Commits are promoted strictly in index order. Replication workers report
/// acknowledgements from other threads, so the register is behind a mutex.
pub(crate) struct Inflight {
    commit_tx: Sender<()>,
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    /// Outstanding entries by index.
    operations: BTreeMap<u64, Entry>,
    /// Committed entries awaiting drain, in ascending index order.
    committed: VecDeque<LogFuture>,
}

struct Entry {
    future: LogFuture,
    /// Peers (and the leader) that have durably replicated the entry.
    votes: HashSet<Address>,
    quorum_size: usize,
}

impl Entry {
    fn is_committed(&self) -> bool {
        self.votes.len() >= self.quorum_size
    }
}

impl Inflight {
    /// Creates an empty register pulsing the given commit channel.
    pub fn new(commit_tx: Sender<()>) -> Self {
        Self { commit_tx, inner: Mutex::new(Inner::default()) }
    }

    /// Registers freshly dispatched entries, casting the leader's own vote
    /// for each. In a single-node cluster this commits them immediately.
    pub fn start_all(&self, futures: Vec<LogFuture>, quorum_size: usize, local: &str) {
        let mut inner = self.inner.lock().expect("lock poisoned");
        for future in futures {
            let mut votes = HashSet::new();
            votes.insert(local.to_string());
            let index = future.log.index;
            inner.operations.insert(index, Entry { future, votes, quorum_size });
        }
        self.promote(&mut inner);
    }

    /// Records that a peer has replicated everything up to and including
    /// match_index. Acknowledgements are prefixes of the log, so the vote
    /// applies to every outstanding entry at or below the index.
    pub fn commit(&self, peer: &str, match_index: u64) {
        let mut inner = self.inner.lock().expect("lock poisoned");
        for (_, entry) in inner.operations.range_mut(..=match_index) {
            entry.votes.insert(peer.to_string());
        }
        self.promote(&mut inner);
    }

    /// Drains the entries committed since the last drain, in ascending
    /// index order.
    pub fn committed(&self) -> Vec<LogFuture> {
        let mut inner = self.inner.lock().expect("lock poisoned");
        inner.committed.drain(..).collect()
    }

    /// Fails every outstanding entry (committed-but-undrained included)
    /// with the given error. Called on leader teardown.
    pub fn cancel(&self, err: Error) {
        let mut inner = self.inner.lock().expect("lock poisoned");
        for mut future in inner.committed.drain(..) {
            future.respond(Err(err.clone()));
        }
        for (_, mut entry) in std::mem::take(&mut inner.operations) {
            entry.future.respond(Err(err.clone()));
        }
    }

    /// Moves a committed prefix of the outstanding entries to the committed
    /// queue and pulses the commit channel if anything moved. Gating on the
    /// lowest outstanding entry keeps the reported order strictly
    /// ascending.
    fn promote(&self, inner: &mut Inner) {
        let mut advanced = false;
        while let Some((&index, entry)) = inner.operations.iter().next() {
            if !entry.is_committed() {
                break;
            }
            let entry = inner.operations.remove(&index).expect("entry must exist");
            inner.committed.push_back(entry.future);
            advanced = true;
        }
        if advanced {
            let _ = self.commit_tx.try_send(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::{Log, LogType};

    use crossbeam_channel::bounded;

    fn log_future(index: u64) -> LogFuture {
        let mut log = Log::new(LogType::Command, vec![index as u8]);
        log.index = index;
        log.term = 1;
        LogFuture::new(log).0
    }

    #[test]
    fn single_node_commits_immediately() {
        let (tx, rx) = bounded(1);
        let inflight = Inflight::new(tx);
        inflight.start_all(vec![log_future(1)], 1, "a:1");
        assert!(rx.try_recv().is_ok());
        assert_eq!(inflight.committed().len(), 1);
    }

    #[test]
    fn commits_at_quorum() {
        let (tx, rx) = bounded(1);
        let inflight = Inflight::new(tx);
        inflight.start_all(vec![log_future(1), log_future(2)], 2, "a:1");
        assert!(rx.try_recv().is_err());
        assert!(inflight.committed().is_empty());

        // One follower acks both entries; quorum of 2 out of 3 is reached.
        inflight.commit("b:2", 2);
        assert!(rx.try_recv().is_ok());
        let committed = inflight.committed();
        assert_eq!(committed.iter().map(|f| f.log.index).collect::<Vec<_>>(), vec![1, 2]);
    }

    #[test]
    fn duplicate_acks_do_not_count_twice() {
        let (tx, _rx) = bounded(1);
        let inflight = Inflight::new(tx);
        inflight.start_all(vec![log_future(1)], 3, "a:1");
        inflight.commit("b:2", 1);
        inflight.commit("b:2", 1);
        assert!(inflight.committed().is_empty());
        inflight.commit("c:3", 1);
        assert_eq!(inflight.committed().len(), 1);
    }

    #[test]
    fn commits_in_index_order() {
        let (tx, _rx) = bounded(1);
        let inflight = Inflight::new(tx);
        inflight.start_all(vec![log_future(1)], 2, "a:1");
        inflight.start_all(vec![log_future(2)], 2, "a:1");

        inflight.commit("b:2", 1);
        assert_eq!(inflight.committed().iter().map(|f| f.log.index).collect::<Vec<_>>(), vec![1]);
        inflight.commit("b:2", 2);
        assert_eq!(inflight.committed().iter().map(|f| f.log.index).collect::<Vec<_>>(), vec![2]);
    }

    #[test]
    fn cancel_fails_outstanding() {
        let (tx, _rx) = bounded(1);
        let inflight = Inflight::new(tx);
        let (mut future, handle) = LogFuture::new(Log::new(LogType::Command, vec![1]));
        future.log.index = 1;
        inflight.start_all(vec![future], 2, "a:1");
        inflight.cancel(Error::LeadershipLost);
        assert_eq!(handle.wait(), Err(Error::LeadershipLost));
    }
}
