use crate::error::{Error, Result};
use crate::fsm::FsmSnapshot;
use crate::log::Log;
use crate::peer::Address;

use crossbeam_channel::{bounded, Receiver, Sender};
use std::sync::{Arc, Mutex};

/// A one-shot handle to the result of an asynchronous Raft operation.
/// Waiting consumes the handle; dropping it abandons the result without
/// cancelling the operation.
pub struct OpFuture<T> {
    state: FutureState<T>,
}

enum FutureState<T> {
    /// The result is already known (e.g. the operation was rejected on
    /// submission).
    Ready(Result<T>),
    /// The result arrives on this channel.
    Pending(Receiver<Result<T>>),
}

impl<T> OpFuture<T> {
    /// Creates an already-resolved future.
    pub(crate) fn ready(result: Result<T>) -> Self {
        Self { state: FutureState::Ready(result) }
    }

    /// Blocks until the operation completes and returns its result. If the
    /// responder disappears without responding (only possible during node
    /// teardown), this resolves to Error::Shutdown.
    pub fn wait(self) -> Result<T> {
        match self.state {
            FutureState::Ready(result) => result,
            FutureState::Pending(rx) => rx.recv().unwrap_or(Err(Error::Shutdown)),
        }
    }
}

/// A future for a client Apply. Resolves to the FSM's response for the
/// command once it has been committed and applied.
pub type ApplyFuture = OpFuture<Vec<u8>>;

/// The responder half of an OpFuture. Responding is idempotent: only the
/// first respond() resolves the future.
pub(crate) struct Completer<T> {
    tx: Option<Sender<Result<T>>>,
}

impl<T> Completer<T> {
    /// Creates a completer and its future.
    pub fn new() -> (Self, OpFuture<T>) {
        let (tx, rx) = bounded(1);
        (Self { tx: Some(tx) }, OpFuture { state: FutureState::Pending(rx) })
    }

    /// Resolves the future, if it hasn't been resolved yet.
    pub fn respond(&mut self, result: Result<T>) {
        if let Some(tx) = self.tx.take() {
            // The waiter may have dropped its handle; that's fine.
            let _ = tx.send(result);
        }
    }

    /// Whether the future is still unresolved.
    pub fn is_pending(&self) -> bool {
        self.tx.is_some()
    }
}

/// A log entry in flight through consensus: the entry plus the responder
/// for the client future. The leader carries these from dispatch, through
/// the inflight register, to the FSM worker which resolves them.
pub(crate) struct LogFuture {
    pub log: Log,
    completer: Completer<Vec<u8>>,
}

impl LogFuture {
    pub fn new(log: Log) -> (Self, ApplyFuture) {
        let (completer, future) = Completer::new();
        (Self { log, completer }, future)
    }

    pub fn respond(&mut self, result: Result<Vec<u8>>) {
        self.completer.respond(result)
    }
}

/// A forced peer-set override (SetPeers).
pub(crate) struct PeerFuture {
    pub peers: Vec<Address>,
    completer: Completer<()>,
}

impl PeerFuture {
    pub fn new(peers: Vec<Address>) -> (Self, OpFuture<()>) {
        let (completer, future) = Completer::new();
        (Self { peers, completer }, future)
    }

    pub fn respond(&mut self, result: Result<()>) {
        self.completer.respond(result)
    }
}

/// A request to the FSM worker to restore from a stored snapshot.
pub(crate) struct RestoreRequest {
    pub id: String,
    completer: Completer<()>,
}

impl RestoreRequest {
    pub fn new(id: String) -> (Self, OpFuture<()>) {
        let (completer, future) = Completer::new();
        (Self { id, completer }, future)
    }

    pub fn respond(&mut self, result: Result<()>) {
        self.completer.respond(result)
    }
}

/// A request to the FSM worker for a snapshot handle.
pub(crate) struct SnapshotRequest {
    completer: Completer<SnapshotReply>,
}

/// The FSM worker's answer to a SnapshotRequest: the snapshot handle and
/// the point it covers.
pub(crate) struct SnapshotReply {
    pub index: u64,
    pub term: u64,
    pub peers: Vec<Address>,
    pub snapshot: Box<dyn FsmSnapshot>,
}

impl SnapshotRequest {
    pub fn new() -> (Self, OpFuture<SnapshotReply>) {
        let (completer, future) = Completer::new();
        (Self { completer }, future)
    }

    pub fn respond(&mut self, result: Result<SnapshotReply>) {
        self.completer.respond(result)
    }
}

/// A leadership verification in progress. Shared between the leader loop,
/// which registers it, and the per-follower heartbeat threads, which vote
/// on it. Once the votes decide the outcome, the future sends itself back
/// to the leader loop over its notify channel for a verdict.
pub(crate) struct VerifyState {
    /// Registry key, assigned by the leader loop. 0 until registered, which
    /// also marks the future as freshly submitted.
    pub id: u64,
    /// Successful heartbeat acknowledgements, including the leader itself.
    pub votes: usize,
    /// Votes needed; 0 until the verification is started.
    pub quorum_size: usize,
    /// Where to report the decided verification. Taken on first send.
    pub notify: Option<Sender<VerifyRef>>,
    completer: Completer<()>,
}

pub(crate) type VerifyRef = Arc<Mutex<VerifyState>>;

impl VerifyState {
    pub fn new() -> (VerifyRef, OpFuture<()>) {
        let (completer, future) = Completer::new();
        let state =
            Arc::new(Mutex::new(Self { id: 0, votes: 0, quorum_size: 0, notify: None, completer }));
        (state, future)
    }

    pub fn respond(&mut self, result: Result<()>) {
        self.completer.respond(result)
    }

    pub fn is_pending(&self) -> bool {
        self.completer.is_pending()
    }
}

/// Casts a vote on a verification. A follower acknowledgement counts
/// toward quorum; a failed one (stale term) decides the verification
/// immediately. Either way, once decided, the state is sent back to the
/// leader loop exactly once.
pub(crate) fn verify_vote(verify: &VerifyRef, leader_ok: bool) {
    let mut state = verify.lock().expect("lock poisoned");
    if state.notify.is_none() {
        return;
    }
    if leader_ok {
        state.votes += 1;
        if state.votes < state.quorum_size {
            return;
        }
    }
    if let Some(notify) = state.notify.take() {
        let _ = notify.send(verify.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;

    #[test]
    fn ready_future() {
        assert_eq!(OpFuture::ready(Err::<(), _>(Error::NotLeader)).wait(), Err(Error::NotLeader));
        assert_eq!(OpFuture::ready(Ok(7)).wait(), Ok(7));
    }

    #[test]
    fn respond_is_idempotent() {
        let (mut completer, future) = Completer::new();
        assert!(completer.is_pending());
        completer.respond(Ok(1));
        assert!(!completer.is_pending());
        completer.respond(Ok(2));
        assert_eq!(future.wait(), Ok(1));
    }

    #[test]
    fn dropped_completer_resolves_to_shutdown() {
        let (completer, future) = Completer::<()>::new();
        drop(completer);
        assert_eq!(future.wait(), Err(Error::Shutdown));
    }

    #[test]
    fn verify_votes_until_quorum() {
        let (verify, _future) = VerifyState::new();
        let (tx, rx) = unbounded();
        {
            let mut state = verify.lock().unwrap();
            state.votes = 1; // the leader's own vote
            state.quorum_size = 2;
            state.notify = Some(tx);
        }

        verify_vote(&verify, true);
        let decided = rx.recv().unwrap();
        assert_eq!(decided.lock().unwrap().votes, 2);

        // Further votes are ignored.
        verify_vote(&verify, true);
        assert!(rx.is_empty());
    }

    #[test]
    fn verify_failed_vote_decides() {
        let (verify, _future) = VerifyState::new();
        let (tx, rx) = unbounded();
        {
            let mut state = verify.lock().unwrap();
            state.votes = 1;
            state.quorum_size = 3;
            state.notify = Some(tx);
        }

        verify_vote(&verify, false);
        let decided = rx.recv().unwrap();
        assert!(decided.lock().unwrap().votes < 3);
    }
}
