use crate::config::Config;
use crate::error::{Error, Result};
use crate::fsm::Fsm;
use crate::future::{
    ApplyFuture, Completer, LogFuture, OpFuture, PeerFuture, RestoreRequest, SnapshotReply,
    SnapshotRequest, VerifyRef, VerifyState,
};
use crate::inflight::Inflight;
use crate::log::{Log, LogStore, LogType};
use crate::peer::{self, Address, PeerStore};
use crate::replication::{Replication, ReplicationHandle};
use crate::snapshot::SnapshotStore;
use crate::stable::{StableStore, KEY_CURRENT_TERM, KEY_LAST_VOTE_CAND, KEY_LAST_VOTE_TERM};
use crate::state::{NodeState, RaftState};
use crate::transport::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    Request, RequestVoteRequest, RequestVoteResponse, Response, Rpc, Transport,
};

use ::log::{debug, error, info, warn};
use crossbeam_channel::{after, bounded, never, select, unbounded, Receiver, Sender, TryRecvError};
use rand::Rng as _;
use std::collections::{BTreeMap, HashMap};
use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// The lease check re-arms no faster than this, to avoid busy-looping when
/// a follower's last contact sits right at the lease boundary.
const MIN_CHECK_INTERVAL: Duration = Duration::from_millis(10);

/// Returns a timer channel that fires after a randomized duration in
/// [timeout, 2·timeout), desynchronizing elections and periodic work
/// across nodes.
pub(crate) fn random_timeout(timeout: Duration) -> Receiver<Instant> {
    let millis = timeout.as_millis().max(1) as u64;
    let extra = rand::thread_rng().gen_range(0..millis);
    after(timeout + Duration::from_millis(extra))
}

/// Non-blocking pulse of a notification channel: if a pulse is already
/// pending, that's enough.
fn async_notify(tx: &Sender<()>) {
    let _ = tx.try_send(());
}

fn async_notify_bool(tx: &Sender<bool>, value: bool) {
    let _ = tx.try_send(value);
}

struct ShutdownState {
    done: bool,
    /// Dropping this closes the shutdown channel, which every worker
    /// observes as its exit signal.
    tx: Option<Sender<()>>,
}

/// Node internals shared by the role loop, the workers, and the public
/// handle. Durable writes go through the accessors here, which update the
/// in-memory cache only after the store accepts the write.
pub(crate) struct Shared {
    pub conf: Config,
    /// Cleared after election when disable_bootstrap_after_elect is set.
    pub enable_single_node: AtomicBool,
    pub state: RaftState,
    pub local_addr: Address,
    pub logs: Box<dyn LogStore>,
    pub stable: Box<dyn StableStore>,
    pub snapshots: Box<dyn SnapshotStore>,
    pub peer_store: Box<dyn PeerStore>,
    pub trans: Box<dyn Transport>,
    /// The known peers, excluding the local node.
    pub peers: RwLock<Vec<Address>>,
    leader: RwLock<Option<Address>>,
    last_contact: RwLock<Option<Instant>>,
    shutdown: Mutex<ShutdownState>,
    pub shutdown_rx: Receiver<()>,
    pub fsm_commit_tx: Sender<(Log, Option<LogFuture>)>,
    fsm_restore_tx: Sender<RestoreRequest>,
    fsm_snapshot_tx: Sender<SnapshotRequest>,
    leader_tx: Sender<bool>,
    leader_rx: Receiver<bool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Shared {
    /// Returns the current known leader, if any.
    pub fn leader(&self) -> Option<Address> {
        self.leader.read().expect("lock poisoned").clone()
    }

    pub fn set_leader(&self, leader: Option<Address>) {
        *self.leader.write().expect("lock poisoned") = leader;
    }

    /// Clears the leader if it is still the local node, keeping a leader
    /// learned from an RPC during teardown.
    fn clear_leader_if_self(&self) {
        let mut leader = self.leader.write().expect("lock poisoned");
        if leader.as_deref() == Some(self.local_addr.as_str()) {
            *leader = None;
        }
    }

    pub fn last_contact(&self) -> Option<Instant> {
        *self.last_contact.read().expect("lock poisoned")
    }

    pub fn set_last_contact(&self) {
        *self.last_contact.write().expect("lock poisoned") = Some(Instant::now());
    }

    /// Transitions to a new role. Any transition invalidates the known
    /// leader; it is re-set only after the transition when known.
    pub fn set_state(&self, state: NodeState) {
        self.set_leader(None);
        self.state.set_state(state);
    }

    /// Durably adopts a term. Losing the persisted term would allow double
    /// voting after a restart, so a write failure is fatal.
    pub fn set_current_term(&self, term: u64) {
        assert!(term >= self.state.current_term(), "current term regression");
        if let Err(err) = self.stable.set_u64(KEY_CURRENT_TERM, term) {
            panic!("failed to save current term: {err}");
        }
        self.state.set_current_term(term);
    }

    /// Durably records a vote. As with the term, a write failure is fatal.
    pub fn persist_vote(&self, term: u64, candidate: &[u8]) {
        if let Err(err) = self.stable.set_u64(KEY_LAST_VOTE_TERM, term) {
            panic!("failed to persist vote term: {err}");
        }
        if let Err(err) = self.stable.set(KEY_LAST_VOTE_CAND, candidate) {
            panic!("failed to persist vote candidate: {err}");
        }
    }

    /// The strict majority of the cluster, counting the local node.
    pub fn quorum_size(&self) -> usize {
        let peers = self.peers.read().expect("lock poisoned");
        (peers.len() + 1) / 2 + 1
    }

    fn describe(&self) -> String {
        format!("node at {} [{}]", self.local_addr, self.state.state())
    }

    /// Marks the node as shut down and signals every worker. Idempotent.
    fn shutdown(&self) {
        let mut guard = self.shutdown.lock().expect("lock poisoned");
        if !guard.done {
            guard.tx.take();
            guard.done = true;
            self.set_state(NodeState::Shutdown);
        }
    }

    fn is_shutdown(&self) -> bool {
        self.shutdown.lock().expect("lock poisoned").done
    }
}

/// The leader's working state: quorum tracking for dispatched entries,
/// per-follower replication, and outstanding leadership verifications.
/// Created on election, torn down on any exit from the leader role.
pub(crate) struct LeaderState {
    pub inflight: Arc<Inflight>,
    commit_rx: Receiver<()>,
    step_down_tx: Sender<()>,
    step_down_rx: Receiver<()>,
    pub repl: HashMap<Address, ReplicationHandle>,
    notify: HashMap<u64, VerifyRef>,
    next_verify_id: u64,
}

/// A handle to a running Raft node.
///
/// The node runs on background threads: a role loop driving the consensus
/// state machine, an FSM worker applying committed entries, a snapshot
/// worker compacting the log, and one replication worker per follower
/// while leading. The handle submits operations to those threads and
/// returns one-shot futures for their results.
pub struct Raft {
    shared: Arc<Shared>,
    apply_tx: Sender<LogFuture>,
    verify_tx: Sender<VerifyRef>,
    peer_tx: Sender<PeerFuture>,
    snapshot_tx: Sender<Completer<()>>,
}

impl Raft {
    /// Creates and starts a Raft node from the given collaborators,
    /// restoring any prior term, log, and snapshot state.
    pub fn new(
        conf: Config,
        mut fsm: Box<dyn Fsm>,
        logs: Box<dyn LogStore>,
        stable: Box<dyn StableStore>,
        snapshots: Box<dyn SnapshotStore>,
        peer_store: Box<dyn PeerStore>,
        trans: Box<dyn Transport>,
    ) -> Result<Raft> {
        conf.validate()?;

        let current_term = match stable.get_u64(KEY_CURRENT_TERM) {
            Ok(term) => term,
            Err(Error::NotFound) => 0,
            Err(err) => return Err(Error::Store(format!("failed to load current term: {err}"))),
        };
        let last_index = logs.last_index()?;
        let last_log = if last_index > 0 { Some(logs.get_log(last_index)?) } else { None };

        let local_addr = trans.local_addr();
        let peers = peer::exclude(&peer_store.peers()?, &local_addr);

        let (shutdown_tx, shutdown_rx) = bounded(1);
        let (fsm_commit_tx, fsm_commit_rx) = bounded(128);
        let (fsm_restore_tx, fsm_restore_rx) = bounded(0);
        let (fsm_snapshot_tx, fsm_snapshot_rx) = bounded(0);
        let (leader_tx, leader_rx) = bounded(1);

        let state = RaftState::new();
        state.set_current_term(current_term);
        if let Some(last_log) = &last_log {
            state.set_last_log(last_log.index, last_log.term);
        }

        let rpc_rx = trans.consumer();
        let shared = Arc::new(Shared {
            enable_single_node: AtomicBool::new(conf.enable_single_node),
            conf,
            state,
            local_addr,
            logs,
            stable,
            snapshots,
            peer_store,
            trans,
            peers: RwLock::new(peers),
            leader: RwLock::new(None),
            last_contact: RwLock::new(None),
            shutdown: Mutex::new(ShutdownState { done: false, tx: Some(shutdown_tx) }),
            shutdown_rx,
            fsm_commit_tx,
            fsm_restore_tx,
            fsm_snapshot_tx,
            leader_tx,
            leader_rx,
            handles: Mutex::new(Vec::new()),
        });

        restore_snapshot(&shared, fsm.as_mut())?;

        // Heartbeat fast-path: the transport may invoke the AppendEntries
        // handler directly, concurrently with the role loop, for
        // heartbeat-shaped requests.
        let weak = Arc::downgrade(&shared);
        shared.trans.set_heartbeat_handler(Box::new(move |rpc| {
            if let Some(shared) = weak.upgrade() {
                process_heartbeat(&shared, rpc);
            }
        }));

        let (apply_tx, apply_rx) = bounded(0);
        let (verify_tx, verify_rx) = unbounded();
        let (peer_tx, peer_rx) = bounded(0);
        let (snapshot_tx, snapshot_rx) = bounded(0);

        let node = RaftNode {
            shared: shared.clone(),
            rpc_rx,
            apply_rx,
            verify_rx,
            verify_tx: verify_tx.clone(),
            peer_rx,
        };
        let mut handles = vec![thread::spawn(move || node.run())];
        handles.push(thread::spawn({
            let shared = shared.clone();
            move || run_fsm(shared, fsm, fsm_commit_rx, fsm_restore_rx, fsm_snapshot_rx)
        }));
        handles.push(thread::spawn({
            let shared = shared.clone();
            move || run_snapshots(shared, snapshot_rx)
        }));
        shared.handles.lock().expect("lock poisoned").extend(handles);

        Ok(Raft { shared, apply_tx, verify_tx, peer_tx, snapshot_tx })
    }

    /// Applies a command to the replicated state machine. Leader only. The
    /// future resolves to the FSM's response once the command has been
    /// committed and applied. The timeout bounds enqueueing, not
    /// completion; an enqueued command is not cancelled.
    pub fn apply(&self, cmd: Vec<u8>, timeout: Option<Duration>) -> ApplyFuture {
        self.enqueue_log(Log::new(LogType::Command, cmd), timeout)
    }

    /// Resolves once every previously submitted command has been applied
    /// to the FSM. Leader only.
    pub fn barrier(&self, timeout: Option<Duration>) -> ApplyFuture {
        self.enqueue_log(Log::new(LogType::Barrier, Vec::new()), timeout)
    }

    /// Confirms the node is still the leader by a round of quorum
    /// heartbeats, for callers about to serve reads that must not be
    /// stale.
    pub fn verify_leader(&self) -> OpFuture<()> {
        if self.shared.is_shutdown() {
            return OpFuture::ready(Err(Error::Shutdown));
        }
        let (verify, future) = VerifyState::new();
        match self.verify_tx.send(verify) {
            Ok(()) => future,
            Err(_) => OpFuture::ready(Err(Error::Shutdown)),
        }
    }

    /// Adds a peer to the cluster through consensus. Leader only.
    pub fn add_peer(&self, peer: Address) -> ApplyFuture {
        let mut log = Log::new(LogType::AddPeer, Vec::new());
        log.peer = Some(peer);
        self.enqueue_log(log, None)
    }

    /// Removes a peer from the cluster through consensus. Leader only.
    /// Removing the leader itself makes it shut down or step down once the
    /// removal commits, per Config::shutdown_on_remove.
    pub fn remove_peer(&self, peer: Address) -> ApplyFuture {
        let mut log = Log::new(LogType::RemovePeer, Vec::new());
        log.peer = Some(peer);
        self.enqueue_log(log, None)
    }

    /// Forcibly replaces the peer set, bypassing consensus. Unsafe in the
    /// sense that it can cause split brain if misused; rejected on
    /// leaders.
    pub fn set_peers(&self, peers: Vec<Address>) -> OpFuture<()> {
        let (future, handle) = PeerFuture::new(peers);
        let shutdown_rx = self.shared.shutdown_rx.clone();
        select! {
            recv(shutdown_rx) -> _ => OpFuture::ready(Err(Error::Shutdown)),
            send(self.peer_tx, future) -> res => match res {
                Ok(()) => handle,
                Err(_) => OpFuture::ready(Err(Error::Shutdown)),
            },
        }
    }

    /// Forces a snapshot of the FSM and compacts the log.
    pub fn snapshot(&self) -> OpFuture<()> {
        let (completer, handle) = Completer::new();
        let shutdown_rx = self.shared.shutdown_rx.clone();
        select! {
            recv(shutdown_rx) -> _ => OpFuture::ready(Err(Error::Shutdown)),
            send(self.snapshot_tx, completer) -> res => match res {
                Ok(()) => handle,
                Err(_) => OpFuture::ready(Err(Error::Shutdown)),
            },
        }
    }

    /// Stops the node. Not graceful: in-flight operations fail with
    /// Error::Shutdown. Idempotent; the future waits for the background
    /// threads to exit.
    pub fn shutdown(&self) -> ShutdownFuture {
        self.shared.shutdown();
        ShutdownFuture { shared: self.shared.clone() }
    }

    /// The current cluster leader, if known.
    pub fn leader(&self) -> Option<Address> {
        self.shared.leader()
    }

    /// The node's current role.
    pub fn state(&self) -> NodeState {
        self.shared.state.state()
    }

    /// When a leader last contacted this node. Meaningful on followers.
    pub fn last_contact(&self) -> Option<Instant> {
        self.shared.last_contact()
    }

    /// The last index in stable storage, from the log or the last
    /// snapshot.
    pub fn last_index(&self) -> u64 {
        self.shared.state.last_index()
    }

    /// Notifies of leadership changes: true when this node becomes leader,
    /// false when it stops being one. Signals are dropped if nobody is
    /// receiving.
    pub fn leader_ch(&self) -> Receiver<bool> {
        self.shared.leader_rx.clone()
    }

    /// A map of internal counters, for debugging and operator visibility.
    pub fn stats(&self) -> BTreeMap<String, String> {
        let state = &self.shared.state;
        let mut stats = BTreeMap::new();
        stats.insert("state".to_string(), state.state().to_string());
        stats.insert("term".to_string(), state.current_term().to_string());
        stats.insert("last_log_index".to_string(), state.last_log_index().to_string());
        stats.insert("last_log_term".to_string(), state.last_log_term().to_string());
        stats.insert("commit_index".to_string(), state.commit_index().to_string());
        stats.insert("applied_index".to_string(), state.last_applied().to_string());
        stats.insert("fsm_pending".to_string(), self.shared.fsm_commit_tx.len().to_string());
        stats.insert("last_snapshot_index".to_string(), state.last_snapshot_index().to_string());
        stats.insert("last_snapshot_term".to_string(), state.last_snapshot_term().to_string());
        let peers = self.shared.peers.read().expect("lock poisoned");
        stats.insert("num_peers".to_string(), peers.len().to_string());
        let last_contact = match (self.shared.last_contact(), state.state()) {
            (_, NodeState::Leader) => "0".to_string(),
            (Some(instant), _) => format!("{:?}", instant.elapsed()),
            (None, _) => "never".to_string(),
        };
        stats.insert("last_contact".to_string(), last_contact);
        stats
    }

    fn enqueue_log(&self, log: Log, timeout: Option<Duration>) -> ApplyFuture {
        let (future, handle) = LogFuture::new(log);
        let timer = timeout.map(after).unwrap_or_else(never);
        let shutdown_rx = self.shared.shutdown_rx.clone();
        select! {
            recv(timer) -> _ => OpFuture::ready(Err(Error::EnqueueTimeout)),
            recv(shutdown_rx) -> _ => OpFuture::ready(Err(Error::Shutdown)),
            send(self.apply_tx, future) -> res => match res {
                Ok(()) => handle,
                Err(_) => OpFuture::ready(Err(Error::Shutdown)),
            },
        }
    }
}

impl std::fmt::Display for Raft {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.shared.describe())
    }
}

impl Drop for Raft {
    /// The handle owns the node: dropping it shuts the node down. The
    /// shutdown signal must precede the drop of the submission channels,
    /// which the workers treat as part of an orderly exit.
    fn drop(&mut self) {
        self.shared.shutdown();
    }
}

/// The future returned by Raft::shutdown. Waiting joins the node's
/// background threads.
pub struct ShutdownFuture {
    shared: Arc<Shared>,
}

impl ShutdownFuture {
    /// Blocks until all background threads have exited. Must not be called
    /// from an FSM or store callback, which runs on one of those threads.
    pub fn wait(self) {
        let handles: Vec<_> =
            std::mem::take(&mut *self.shared.handles.lock().expect("lock poisoned"));
        for handle in handles {
            let _ = handle.join();
        }
    }
}

/// The role loop: a single thread that owns role transitions and all
/// leader-side coordination, dispatching to one sub-loop per role.
struct RaftNode {
    shared: Arc<Shared>,
    rpc_rx: Receiver<Rpc>,
    apply_rx: Receiver<LogFuture>,
    verify_rx: Receiver<VerifyRef>,
    verify_tx: Sender<VerifyRef>,
    peer_rx: Receiver<PeerFuture>,
}

impl RaftNode {
    fn run(self) {
        loop {
            if let Err(TryRecvError::Disconnected) = self.shared.shutdown_rx.try_recv() {
                // Clear the leader to stop routing requests anywhere.
                self.shared.set_leader(None);
                return;
            }
            match self.shared.state.state() {
                NodeState::Follower => self.run_follower(),
                NodeState::Candidate => self.run_candidate(),
                NodeState::Leader => self.run_leader(),
                NodeState::Shutdown => {
                    self.shared.set_leader(None);
                    return;
                }
            }
        }
    }

    fn run_follower(&self) {
        info!("{} entering follower state", self.shared.describe());
        let rpc_rx = self.rpc_rx.clone();
        let apply_rx = self.apply_rx.clone();
        let verify_rx = self.verify_rx.clone();
        let peer_rx = self.peer_rx.clone();
        let shutdown_rx = self.shared.shutdown_rx.clone();

        let mut did_warn = false;
        let mut heartbeat_timer = random_timeout(self.shared.conf.heartbeat_timeout);
        loop {
            let timer = heartbeat_timer.clone();
            select! {
                recv(rpc_rx) -> msg => match msg {
                    Ok(rpc) => process_rpc(&self.shared, rpc),
                    Err(_) => return,
                },
                recv(apply_rx) -> msg => match msg {
                    Ok(mut future) => future.respond(Err(Error::NotLeader)),
                    Err(_) => return,
                },
                recv(verify_rx) -> msg => match msg {
                    Ok(verify) => {
                        verify.lock().expect("lock poisoned").respond(Err(Error::NotLeader))
                    }
                    Err(_) => return,
                },
                recv(peer_rx) -> msg => match msg {
                    Ok(future) => self.force_peers(future),
                    Err(_) => return,
                },
                recv(timer) -> _ => {
                    heartbeat_timer = random_timeout(self.shared.conf.heartbeat_timeout);

                    // If the leader has been in touch recently, keep waiting.
                    let contacted = self
                        .shared
                        .last_contact()
                        .map(|c| c.elapsed() < self.shared.conf.heartbeat_timeout)
                        .unwrap_or(false);
                    if contacted {
                        continue;
                    }

                    self.shared.set_leader(None);
                    let no_peers = self.shared.peers.read().expect("lock poisoned").is_empty();
                    if no_peers && !self.shared.enable_single_node.load(Ordering::SeqCst) {
                        if !did_warn {
                            warn!("no known peers and single-node mode disabled, aborting election");
                            did_warn = true;
                        }
                    } else {
                        warn!("heartbeat timeout reached, starting election");
                        self.shared.set_state(NodeState::Candidate);
                        return;
                    }
                },
                recv(shutdown_rx) -> _ => return,
            }
        }
    }

    fn run_candidate(&self) {
        info!("{} entering candidate state", self.shared.describe());
        let mut vote_rx = self.elect_self();
        let election_timer = random_timeout(self.shared.conf.election_timeout);

        let rpc_rx = self.rpc_rx.clone();
        let apply_rx = self.apply_rx.clone();
        let verify_rx = self.verify_rx.clone();
        let peer_rx = self.peer_rx.clone();
        let shutdown_rx = self.shared.shutdown_rx.clone();

        let mut granted_votes = 0;
        let votes_needed = self.shared.quorum_size();
        debug!("votes needed: {votes_needed}");

        while self.shared.state.state() == NodeState::Candidate {
            let votes = vote_rx.clone();
            select! {
                recv(rpc_rx) -> msg => match msg {
                    Ok(rpc) => process_rpc(&self.shared, rpc),
                    Err(_) => return,
                },
                recv(votes) -> msg => {
                    let Ok(vote) = msg else {
                        // All responses are in; wait out the election timer.
                        vote_rx = never();
                        continue;
                    };
                    // A newer term means this election is over.
                    if vote.term > self.shared.state.current_term() {
                        debug!("newer term discovered, falling back to follower");
                        self.shared.set_state(NodeState::Follower);
                        self.shared.set_current_term(vote.term);
                        return;
                    }
                    if vote.granted {
                        granted_votes += 1;
                        debug!("vote granted, tally: {granted_votes}");
                    }
                    if granted_votes >= votes_needed {
                        info!("election won, tally: {granted_votes}");
                        self.shared.set_state(NodeState::Leader);
                        self.shared.set_leader(Some(self.shared.local_addr.clone()));
                        return;
                    }
                },
                recv(apply_rx) -> msg => match msg {
                    Ok(mut future) => future.respond(Err(Error::NotLeader)),
                    Err(_) => return,
                },
                recv(verify_rx) -> msg => match msg {
                    Ok(verify) => {
                        verify.lock().expect("lock poisoned").respond(Err(Error::NotLeader))
                    }
                    Err(_) => return,
                },
                recv(peer_rx) -> msg => {
                    let Ok(future) = msg else { return };
                    self.force_peers(future);
                    // The new peer set changes the election maths.
                    self.shared.set_state(NodeState::Follower);
                    return;
                },
                recv(election_timer) -> _ => {
                    // Return to the outer loop, which restarts the election
                    // in a new term.
                    warn!("election timeout reached, restarting election");
                    return;
                },
                recv(shutdown_rx) -> _ => return,
            }
        }
    }

    /// Starts an election: increments the term, votes for ourself, and
    /// solicits votes from all peers. Responses (our own included) arrive
    /// on the returned channel.
    fn elect_self(&self) -> Receiver<RequestVoteResponse> {
        let peers = self.shared.peers.read().expect("lock poisoned").clone();
        let (vote_tx, vote_rx) = bounded(peers.len() + 1);

        self.shared.set_current_term(self.shared.state.current_term() + 1);
        let term = self.shared.state.current_term();
        info!("starting election for term {term}");

        let (last_log_index, last_log_term) = self.shared.state.last_entry();
        let request = RequestVoteRequest {
            term,
            candidate: self.shared.trans.encode_peer(&self.shared.local_addr),
            last_log_index,
            last_log_term,
        };

        for peer in peers {
            let shared = self.shared.clone();
            let request = request.clone();
            let vote_tx = vote_tx.clone();
            thread::spawn(move || {
                let response = match shared.trans.request_vote(&peer, request.clone()) {
                    Ok(response) => {
                        // A peer that doesn't know us either dropped us from
                        // the cluster or is misconfigured.
                        match peer::decode_peers(&response.peers, &*shared.trans) {
                            Ok(peer_set) if !peer::contains(&peer_set, &shared.local_addr) => {
                                warn!("remote peer {} does not consider us a peer", peer);
                            }
                            _ => {}
                        }
                        response
                    }
                    Err(err) => {
                        error!("failed to request vote from {}: {}", peer, err);
                        RequestVoteResponse {
                            term: request.term,
                            peers: Vec::new(),
                            granted: false,
                        }
                    }
                };
                let _ = vote_tx.send(response);
            });
        }

        // Persist our own vote before counting it.
        self.shared.persist_vote(term, &request.candidate);
        let _ = vote_tx.send(RequestVoteResponse { term, peers: Vec::new(), granted: true });
        vote_rx
    }

    fn run_leader(&self) {
        info!("{} entering leader state", self.shared.describe());
        async_notify_bool(&self.shared.leader_tx, true);

        let (commit_tx, commit_rx) = bounded(1);
        let (step_down_tx, step_down_rx) = bounded(1);
        let mut leader = LeaderState {
            inflight: Arc::new(Inflight::new(commit_tx)),
            commit_rx,
            step_down_tx,
            step_down_rx,
            repl: HashMap::new(),
            notify: HashMap::new(),
            next_verify_id: 1,
        };

        for peer in self.shared.peers.read().expect("lock poisoned").clone() {
            start_replication(&self.shared, &mut leader, peer);
        }

        // Dispatch an initial entry carrying the full peer set. It serves
        // as the current-term entry that unlocks commitment of earlier
        // terms, and bootstraps a common peer set across the cluster.
        let mut peer_set = vec![self.shared.local_addr.clone()];
        peer_set.extend(self.shared.peers.read().expect("lock poisoned").iter().cloned());
        let noop =
            Log::new(LogType::AddPeer, peer::encode_peers(&peer_set, &*self.shared.trans));
        let (noop_future, _) = LogFuture::new(noop);
        self.dispatch_logs(&mut leader, vec![noop_future]);

        if self.shared.conf.disable_bootstrap_after_elect
            && self.shared.enable_single_node.load(Ordering::SeqCst)
        {
            // A node removed from the cluster later must not be able to
            // elect itself into a split brain.
            info!("disabling single-node elections after initial bootstrap");
            self.shared.enable_single_node.store(false, Ordering::SeqCst);
        }

        self.leader_loop(&mut leader);

        // Teardown. Dropping the replication handles closes each worker's
        // stop channel.
        leader.repl.clear();
        leader.inflight.cancel(Error::LeadershipLost);
        for (_, verify) in leader.notify.drain() {
            verify.lock().expect("lock poisoned").respond(Err(Error::LeadershipLost));
        }
        // An RPC may have told us about the new leader already; only clear
        // the leader if it still points at us.
        self.shared.clear_leader_if_self();
        async_notify_bool(&self.shared.leader_tx, false);
    }

    fn leader_loop(&self, leader: &mut LeaderState) {
        let rpc_rx = self.rpc_rx.clone();
        let apply_rx = self.apply_rx.clone();
        let verify_rx = self.verify_rx.clone();
        let peer_rx = self.peer_rx.clone();
        let shutdown_rx = self.shared.shutdown_rx.clone();
        let commit_rx = leader.commit_rx.clone();
        let step_down_rx = leader.step_down_rx.clone();

        let mut lease = after(self.shared.conf.leader_lease_timeout);
        while self.shared.state.state() == NodeState::Leader {
            let lease_timer = lease.clone();
            select! {
                recv(rpc_rx) -> msg => match msg {
                    Ok(rpc) => process_rpc(&self.shared, rpc),
                    Err(_) => return,
                },
                recv(step_down_rx) -> _ => {
                    self.shared.set_state(NodeState::Follower);
                },
                recv(commit_rx) -> msg => {
                    if msg.is_err() {
                        return;
                    }
                    for future in leader.inflight.committed() {
                        let index = future.log.index;
                        self.shared.state.set_commit_index(index);
                        process_logs(&self.shared, index, Some(future), Some(&mut *leader));
                    }
                },
                recv(verify_rx) -> msg => match msg {
                    Ok(verify) => self.handle_verify(leader, verify),
                    Err(_) => return,
                },
                recv(peer_rx) -> msg => match msg {
                    Ok(mut future) => future.respond(Err(Error::Leader)),
                    Err(_) => return,
                },
                recv(apply_rx) -> msg => {
                    let Ok(first) = msg else { return };
                    // Group commit: batch whatever else is already queued.
                    let mut ready = vec![first];
                    for _ in 0..self.shared.conf.max_append_entries {
                        match apply_rx.try_recv() {
                            Ok(future) => ready.push(future),
                            Err(_) => break,
                        }
                    }

                    // Validate membership changes and apply them to the
                    // local peer set before commit, so a new peer starts
                    // catching up (and voting) immediately.
                    let mut dispatch = Vec::new();
                    for mut future in ready {
                        if matches!(future.log.log_type, LogType::AddPeer | LogType::RemovePeer) {
                            if !self.prepare_peer_change(&mut future) {
                                continue;
                            }
                            process_log(
                                &self.shared,
                                future.log.clone(),
                                None,
                                true,
                                Some(&mut *leader),
                            );
                        }
                        dispatch.push(future);
                    }
                    if !dispatch.is_empty() {
                        self.dispatch_logs(leader, dispatch);
                    }
                },
                recv(lease_timer) -> _ => {
                    let max_diff = self.check_leader_lease(leader);
                    // Re-check when the lease of the freshest follower
                    // would expire, bounded below to avoid busy looping.
                    let interval = std::cmp::max(
                        self.shared.conf.leader_lease_timeout.saturating_sub(max_diff),
                        MIN_CHECK_INTERVAL,
                    );
                    lease = after(interval);
                },
                recv(shutdown_rx) -> _ => return,
            }
        }
    }

    /// Validates an AddPeer/RemovePeer submission and encodes the
    /// resulting peer set into the entry. Returns false if the entry was
    /// rejected and its future responded to.
    fn prepare_peer_change(&self, future: &mut LogFuture) -> bool {
        let peer = future.log.peer.clone().expect("membership entry must carry a peer");
        let peers = self.shared.peers.read().expect("lock poisoned");
        let known = peer::contains(&peers, &peer) || peer == self.shared.local_addr;

        if future.log.log_type == LogType::AddPeer && known {
            future.respond(Err(Error::KnownPeer));
            return false;
        }
        if future.log.log_type == LogType::RemovePeer && !known {
            future.respond(Err(Error::UnknownPeer));
            return false;
        }

        let peer_set = if future.log.log_type == LogType::AddPeer {
            let mut set = vec![peer, self.shared.local_addr.clone()];
            set.extend(peers.iter().cloned());
            set
        } else {
            let mut set = vec![self.shared.local_addr.clone()];
            set.extend(peers.iter().cloned());
            peer::exclude(&set, &peer)
        };
        future.log.data = peer::encode_peers(&peer_set, &*self.shared.trans);
        true
    }

    /// Assigns indexes and the current term to a batch of entries, stores
    /// them, registers them inflight, and wakes the replication workers.
    fn dispatch_logs(&self, leader: &mut LeaderState, mut futures: Vec<LogFuture>) {
        let term = self.shared.state.current_term();
        let last_index = self.shared.state.last_index();

        for (offset, future) in futures.iter_mut().enumerate() {
            future.log.index = last_index + offset as u64 + 1;
            future.log.term = term;
        }
        let logs: Vec<Log> = futures.iter().map(|f| f.log.clone()).collect();

        // A leader that can't write its own log can't lead.
        if let Err(err) = self.shared.logs.store_logs(&logs) {
            error!("failed to commit logs: {err}");
            for mut future in futures {
                future.respond(Err(err.clone()));
            }
            self.shared.set_state(NodeState::Follower);
            return;
        }

        let count = futures.len() as u64;
        leader.inflight.start_all(futures, self.shared.quorum_size(), &self.shared.local_addr);
        self.shared.state.set_last_log(last_index + count, term);

        for repl in leader.repl.values() {
            async_notify(&repl.trigger_tx);
        }
    }

    /// Starts or finishes a leadership verification. Fresh futures
    /// (quorum_size 0) fan out to the replication workers; decided ones
    /// come back here for the verdict.
    fn handle_verify(&self, leader: &mut LeaderState, verify: VerifyRef) {
        let mut state = verify.lock().expect("lock poisoned");
        if state.quorum_size == 0 {
            // Just submitted: start the verification round.
            state.votes = 1;
            state.quorum_size = self.shared.quorum_size();
            if state.quorum_size == 1 {
                state.respond(Ok(()));
                return;
            }
            state.id = leader.next_verify_id;
            leader.next_verify_id += 1;
            state.notify = Some(self.verify_tx.clone());
            drop(state);

            leader.notify.insert(leader.next_verify_id - 1, verify.clone());
            for repl in leader.repl.values() {
                repl.pending_verify.lock().expect("lock poisoned").push(verify.clone());
                async_notify(&repl.notify_tx);
            }
        } else if !state.is_pending() {
            // Already failed by a previous teardown; drop the stale ref.
            let id = state.id;
            drop(state);
            leader.notify.remove(&id);
        } else if state.votes < state.quorum_size {
            // A quorum saw a newer term: someone else is leader now.
            warn!("new leader elected, stepping down");
            self.shared.set_state(NodeState::Follower);
            let id = state.id;
            state.respond(Err(Error::NotLeader));
            drop(state);
            leader.notify.remove(&id);
        } else {
            let id = state.id;
            state.respond(Ok(()));
            drop(state);
            leader.notify.remove(&id);
        }
    }

    /// Checks that a quorum has been contacted within the lease, stepping
    /// down otherwise. Returns the staleness of the freshest follower
    /// counted toward the quorum.
    fn check_leader_lease(&self, leader: &mut LeaderState) -> Duration {
        let lease_timeout = self.shared.conf.leader_lease_timeout;
        let now = Instant::now();

        // We can always contact ourself.
        let mut contacted = 1;
        let mut max_diff = Duration::ZERO;
        for (peer, repl) in &leader.repl {
            let last = *repl.last_contact.read().expect("lock poisoned");
            let diff = now.saturating_duration_since(last);
            if diff <= lease_timeout {
                contacted += 1;
                if diff > max_diff {
                    max_diff = diff;
                }
            } else if diff <= 3 * lease_timeout {
                warn!("failed to contact {} in {:?}", peer, diff);
            } else {
                debug!("failed to contact {} in {:?}", peer, diff);
            }
        }

        if contacted < self.shared.quorum_size() {
            warn!("failed to contact quorum of nodes, stepping down");
            self.shared.set_state(NodeState::Follower);
        }
        max_diff
    }

    /// Applies a forced peer-set override (follower/candidate only).
    fn force_peers(&self, mut future: PeerFuture) {
        *self.shared.peers.write().expect("lock poisoned") =
            peer::exclude(&future.peers, &self.shared.local_addr);
        let result = self.shared.peer_store.set_peers(&future.peers);
        future.respond(result);
    }
}

/// Spawns a replication worker (and its heartbeat sibling) for a peer.
pub(crate) fn start_replication(
    shared: &Arc<Shared>,
    leader: &mut LeaderState,
    peer: Address,
) {
    let last_index = shared.state.last_index();
    let (stop_tx, stop_rx) = bounded(1);
    let (trigger_tx, trigger_rx) = bounded(1);
    let (notify_tx, notify_rx) = bounded(1);
    let last_contact = Arc::new(RwLock::new(Instant::now()));
    let pending_verify = Arc::new(Mutex::new(Vec::new()));

    let handle = ReplicationHandle {
        peer: peer.clone(),
        stop_tx,
        trigger_tx,
        notify_tx,
        last_contact: last_contact.clone(),
        pending_verify: pending_verify.clone(),
    };
    let repl = Replication {
        shared: shared.clone(),
        inflight: leader.inflight.clone(),
        peer: peer.clone(),
        current_term: shared.state.current_term(),
        next_index: last_index + 1,
        match_index: 0,
        stop_rx,
        trigger_rx,
        notify_rx,
        step_down_tx: leader.step_down_tx.clone(),
        last_contact,
        pending_verify,
    };

    debug!("starting replication to {} (next: {})", peer, last_index + 1);
    let thread = thread::spawn(move || repl.run());
    shared.handles.lock().expect("lock poisoned").push(thread);
    async_notify(&handle.trigger_tx);
    leader.repl.insert(peer, handle);
}

/// Dispatches an inbound RPC to its handler and responds.
pub(crate) fn process_rpc(shared: &Arc<Shared>, rpc: Rpc) {
    match &rpc.request {
        Request::AppendEntries(request) => {
            let request = request.clone();
            let response = append_entries(shared, &request);
            rpc.respond(response.map(Response::AppendEntries));
        }
        Request::RequestVote(request) => {
            let request = request.clone();
            let response = request_vote(shared, &request);
            rpc.respond(response.map(Response::RequestVote));
        }
        Request::InstallSnapshot(request) => {
            let request = request.clone();
            let mut rpc = rpc;
            let response = match rpc.reader.take() {
                Some(mut reader) => install_snapshot(shared, &request, &mut reader),
                None => Err(Error::Transport("snapshot stream missing".into())),
            };
            rpc.respond(response.map(Response::InstallSnapshot));
        }
    }
}

/// The heartbeat fast-path entry point: invoked by the transport for
/// heartbeat-shaped AppendEntries, possibly concurrently with the role
/// loop.
pub(crate) fn process_heartbeat(shared: &Arc<Shared>, rpc: Rpc) {
    if shared.is_shutdown() {
        return;
    }
    if matches!(rpc.request, Request::AppendEntries(_)) {
        process_rpc(shared, rpc);
    } else {
        error!("expected heartbeat, got {:?}", rpc.request);
        rpc.respond(Err(Error::Transport("unexpected heartbeat command".into())));
    }
}

fn append_entries(
    shared: &Arc<Shared>,
    req: &AppendEntriesRequest,
) -> Result<AppendEntriesResponse> {
    let mut resp = AppendEntriesResponse {
        term: shared.state.current_term(),
        last_log: shared.state.last_index(),
        success: false,
    };

    // Ignore an older term.
    if req.term < shared.state.current_term() {
        return Ok(resp);
    }

    // A newer term, or any append at all while not a follower, makes us
    // one.
    if req.term > shared.state.current_term() || shared.state.state() != NodeState::Follower {
        shared.set_state(NodeState::Follower);
        shared.set_current_term(req.term);
        resp.term = req.term;
    }

    shared.set_leader(Some(shared.trans.decode_peer(&req.leader)?));

    // The entry preceding the batch must match our log.
    if req.prev_log_index > 0 {
        let (last_index, last_term) = shared.state.last_entry();
        let prev_log_term = if req.prev_log_index == last_index {
            last_term
        } else {
            match shared.logs.get_log(req.prev_log_index) {
                Ok(entry) => entry.term,
                Err(err) => {
                    warn!(
                        "failed to get previous log entry {}: {} (last: {})",
                        req.prev_log_index, err, last_index
                    );
                    return Ok(resp);
                }
            }
        };
        if req.prev_log_term != prev_log_term {
            warn!(
                "previous log term mismatch: ours {} remote {}",
                prev_log_term, req.prev_log_term
            );
            return Ok(resp);
        }
    }

    if !req.entries.is_empty() {
        let first = &req.entries[0];
        let last = req.entries.last().expect("entries are non-empty");

        // Delete any conflicting suffix before appending.
        let last_log_index = shared.state.last_log_index();
        if first.index <= last_log_index {
            warn!("clearing log suffix from {} to {}", first.index, last_log_index);
            if let Err(err) = shared.logs.delete_range(first.index, last_log_index) {
                error!("failed to clear log suffix: {err}");
                return Ok(resp);
            }
        }
        if let Err(err) = shared.logs.store_logs(&req.entries) {
            error!("failed to append to log: {err}");
            return Ok(resp);
        }
        shared.state.set_last_log(last.index, last.term);
    }

    // Advance our commit index to the leader's, within our log.
    if req.leader_commit_index > 0 && req.leader_commit_index > shared.state.commit_index() {
        let index = std::cmp::min(req.leader_commit_index, shared.state.last_index());
        shared.state.set_commit_index(index);
        process_logs(shared, index, None, None);
    }

    resp.success = true;
    shared.set_last_contact();
    Ok(resp)
}

fn request_vote(shared: &Arc<Shared>, req: &RequestVoteRequest) -> Result<RequestVoteResponse> {
    let peers = shared.peers.read().expect("lock poisoned").clone();
    let mut resp = RequestVoteResponse {
        term: shared.state.current_term(),
        peers: peer::encode_peers(&peers, &*shared.trans),
        granted: false,
    };
    let candidate = shared.trans.decode_peer(&req.candidate)?;

    // A current leader takes precedence over any candidate: a partitioned
    // node should not be able to disrupt a healthy cluster.
    if let Some(leader) = shared.leader() {
        warn!("rejecting vote from {} since we have a leader: {}", candidate, leader);
        return Ok(resp);
    }

    if req.term < shared.state.current_term() {
        return Ok(resp);
    }
    if req.term > shared.state.current_term() {
        shared.set_state(NodeState::Follower);
        shared.set_current_term(req.term);
        resp.term = req.term;
    }

    // At most one vote per term. A retry from the same candidate gets the
    // same answer.
    let last_vote_term = match shared.stable.get_u64(KEY_LAST_VOTE_TERM) {
        Ok(term) => Some(term),
        Err(Error::NotFound) => None,
        Err(err) => {
            error!("failed to get last vote term: {err}");
            return Ok(resp);
        }
    };
    let last_vote_cand = match shared.stable.get(KEY_LAST_VOTE_CAND) {
        Ok(cand) => Some(cand),
        Err(Error::NotFound) => None,
        Err(err) => {
            error!("failed to get last vote candidate: {err}");
            return Ok(resp);
        }
    };
    if last_vote_term == Some(req.term) {
        if let Some(last_vote_cand) = last_vote_cand {
            info!("duplicate vote request for term {}", req.term);
            if last_vote_cand == req.candidate {
                warn!("duplicate vote request from candidate {}", candidate);
                resp.granted = true;
            }
            return Ok(resp);
        }
    }

    // Reject candidates with less up-to-date logs.
    let (last_index, last_term) = shared.state.last_entry();
    if last_term > req.last_log_term {
        warn!(
            "rejecting vote from {} since our last term is greater ({} > {})",
            candidate, last_term, req.last_log_term
        );
        return Ok(resp);
    }
    if last_term == req.last_log_term && last_index > req.last_log_index {
        warn!(
            "rejecting vote from {} since our last index is greater ({} > {})",
            candidate, last_index, req.last_log_index
        );
        return Ok(resp);
    }

    // The vote must be durable before the response leaves.
    shared.persist_vote(req.term, &req.candidate);
    resp.granted = true;
    Ok(resp)
}

fn install_snapshot(
    shared: &Arc<Shared>,
    req: &InstallSnapshotRequest,
    reader: &mut (dyn Read + Send),
) -> Result<InstallSnapshotResponse> {
    let mut resp =
        InstallSnapshotResponse { term: shared.state.current_term(), success: false };

    if req.term < shared.state.current_term() {
        return Ok(resp);
    }
    if req.term > shared.state.current_term() {
        shared.set_state(NodeState::Follower);
        shared.set_current_term(req.term);
        resp.term = req.term;
    }

    shared.set_leader(Some(shared.trans.decode_peer(&req.leader)?));

    // Spill the stream into a local snapshot, demanding exactly the
    // advertised size.
    let mut sink = shared
        .snapshots
        .create(req.last_log_index, req.last_log_term, req.peers.clone())
        .map_err(|err| Error::Store(format!("failed to create snapshot: {err}")))?;
    let mut limited = (&mut *reader).take(req.size);
    let copied = match std::io::copy(&mut limited, &mut sink) {
        Ok(copied) => copied,
        Err(err) => {
            let _ = sink.cancel();
            error!("failed to copy snapshot: {err}");
            return Err(err.into());
        }
    };
    if copied != req.size {
        let _ = sink.cancel();
        error!("failed to receive whole snapshot: {}/{}", copied, req.size);
        return Err(Error::Transport("short read".into()));
    }
    let id = sink.id().to_string();
    sink.close()?;
    debug!("copied {} bytes to local snapshot {}", copied, id);

    // Hand the restore to the FSM worker and wait for it.
    let (restore, restore_future) = RestoreRequest::new(id);
    let shutdown_rx = shared.shutdown_rx.clone();
    select! {
        send(shared.fsm_restore_tx, restore) -> res => {
            if res.is_err() {
                return Err(Error::Shutdown);
            }
        },
        recv(shutdown_rx) -> _ => return Err(Error::Shutdown),
    }
    restore_future.wait()?;

    // The snapshot replaces the log up to its index.
    shared.state.set_last_applied(req.last_log_index);
    shared.state.set_last_snapshot(req.last_log_index, req.last_log_term);

    let peers = peer::decode_peers(&req.peers, &*shared.trans)?;
    *shared.peers.write().expect("lock poisoned") = peer::exclude(&peers, &shared.local_addr);
    if let Err(err) = shared.peer_store.set_peers(&peers) {
        error!("failed to store peer set: {err}");
    }

    if let Err(err) = compact_logs(shared, req.last_log_index) {
        error!("failed to compact logs: {err}");
    }

    info!("installed remote snapshot");
    resp.success = true;
    shared.set_last_contact();
    Ok(resp)
}

/// Forwards committed entries between last_applied and the given index to
/// the FSM worker, in order, and applies membership entries. The future,
/// if any, belongs to the entry at the target index.
pub(crate) fn process_logs(
    shared: &Arc<Shared>,
    index: u64,
    mut future: Option<LogFuture>,
    mut leader: Option<&mut LeaderState>,
) {
    let last_applied = shared.state.last_applied();
    if index <= last_applied {
        warn!("skipping application of old log {index}");
        return;
    }

    for idx in (last_applied + 1)..=index {
        let owned = future.as_ref().map(|f| f.log.index == idx).unwrap_or(false);
        if owned {
            let f = future.take().expect("future present");
            process_log(shared, f.log.clone(), Some(f), false, leader.as_mut().map(|l| &mut **l));
        } else {
            // A committed entry must exist; a log store that lost one
            // can't be recovered from.
            let log = match shared.logs.get_log(idx) {
                Ok(log) => log,
                Err(err) => panic!("failed to get log at {idx}: {err}"),
            };
            process_log(shared, log, None, false, leader.as_mut().map(|l| &mut **l));
        }
        shared.state.set_last_applied(idx);
    }
}

/// Processes a single committed (or, for membership entries on the
/// leader, about-to-be-dispatched) log entry.
pub(crate) fn process_log(
    shared: &Arc<Shared>,
    log: Log,
    future: Option<LogFuture>,
    precommit: bool,
    leader: Option<&mut LeaderState>,
) {
    match log.log_type {
        // Commands and barriers go to the FSM worker, which responds to
        // the future. Barriers aren't applied; the worker's serial order
        // is what they wait for.
        LogType::Command | LogType::Barrier => {
            let shutdown_rx = shared.shutdown_rx.clone();
            select! {
                send(shared.fsm_commit_tx, (log, future)) -> res => {
                    if let Err(err) = res {
                        if let (_, Some(mut f)) = err.into_inner() {
                            f.respond(Err(Error::Shutdown));
                        }
                    }
                },
                recv(shutdown_rx) -> _ => {
                    if let Some(mut f) = future {
                        f.respond(Err(Error::Shutdown));
                    }
                },
            }
            return;
        }

        LogType::AddPeer | LogType::RemovePeer => {
            let peers = match peer::decode_peers(&log.data, &*shared.trans) {
                Ok(peers) => peers,
                // The entry is committed; a payload we can't decode means
                // divergent state, not a recoverable error.
                Err(err) => panic!("failed to decode peer set at {}: {}", log.index, err),
            };
            debug!("updated peer set ({:?}): {:?}", log.log_type, peers);

            // If the new set no longer includes us, we've been removed.
            let remove_self = log.log_type == LogType::RemovePeer
                && !peer::contains(&peers, &shared.local_addr);
            if remove_self {
                shared.peers.write().expect("lock poisoned").clear();
                if let Err(err) = shared.peer_store.set_peers(&[shared.local_addr.clone()]) {
                    error!("failed to store peer set: {err}");
                }
            } else {
                *shared.peers.write().expect("lock poisoned") =
                    peer::exclude(&peers, &shared.local_addr);
                if let Err(err) = shared.peer_store.set_peers(&peers) {
                    error!("failed to store peer set: {err}");
                }
            }

            if let Some(leader) = leader {
                // Start replicating to new peers right away, so an added
                // peer can catch up and vote for its own addition.
                let current = shared.peers.read().expect("lock poisoned").clone();
                for peer in current {
                    if !leader.repl.contains_key(&peer) {
                        info!("added peer {}, starting replication", peer);
                        start_replication(shared, leader, peer);
                    }
                }

                // Stop replicating to removed peers, but only once the
                // removal entry itself has committed, and only after they
                // have received it.
                if !precommit {
                    let current = shared.peers.read().expect("lock poisoned").clone();
                    let stopped: Vec<Address> = leader
                        .repl
                        .keys()
                        .filter(|p| !peer::contains(&current, p))
                        .cloned()
                        .collect();
                    for peer in stopped {
                        info!("removed peer {}, stopping replication (index: {})", peer, log.index);
                        if let Some(handle) = leader.repl.remove(&peer) {
                            let _ = handle.stop_tx.send(log.index);
                        }
                    }
                }
            }

            if remove_self && !precommit {
                if shared.conf.shutdown_on_remove {
                    info!("removed ourself, shutting down");
                    shared.shutdown();
                } else {
                    info!("removed ourself, transitioning to follower");
                    shared.set_state(NodeState::Follower);
                }
            }
        }

        LogType::Noop => {}
    }

    if let Some(mut future) = future {
        if !precommit {
            future.respond(Ok(Vec::new()));
        }
    }
}

/// Deletes log entries made redundant by a snapshot, keeping
/// Config::trailing_logs entries behind the tail so slow followers can
/// catch up from the log.
fn compact_logs(shared: &Shared, snapshot_index: u64) -> Result<()> {
    let first_index = shared.logs.first_index()?;
    let last_log_index = shared.state.last_log_index();
    if last_log_index <= shared.conf.trailing_logs {
        return Ok(());
    }
    let max_index = std::cmp::min(snapshot_index, last_log_index - shared.conf.trailing_logs);
    if first_index > max_index {
        return Ok(());
    }
    info!("compacting logs from {} to {}", first_index, max_index);
    shared
        .logs
        .delete_range(first_index, max_index)
        .map_err(|err| Error::Store(format!("log compaction failed: {err}")))
}

/// Restores the newest restorable snapshot into the FSM at startup.
/// Errors only if snapshots exist but none can be restored.
fn restore_snapshot(shared: &Arc<Shared>, fsm: &mut dyn Fsm) -> Result<()> {
    let snapshots = shared.snapshots.list()?;
    let had_snapshots = !snapshots.is_empty();
    for meta in snapshots {
        let (meta, mut source) = match shared.snapshots.open(&meta.id) {
            Ok(opened) => opened,
            Err(err) => {
                error!("failed to open snapshot {}: {}", meta.id, err);
                continue;
            }
        };
        if let Err(err) = fsm.restore(&mut source) {
            error!("failed to restore snapshot {}: {}", meta.id, err);
            continue;
        }
        info!("restored from snapshot {}", meta.id);
        shared.state.set_last_applied(meta.index);
        shared.state.set_last_snapshot(meta.index, meta.term);
        return Ok(());
    }
    if had_snapshots {
        return Err(Error::Store("failed to load any existing snapshots".into()));
    }
    Ok(())
}

/// The FSM worker: the single thread through which every FSM call flows.
/// Applies committed entries in order, and serves snapshot and restore
/// requests between them.
fn run_fsm(
    shared: Arc<Shared>,
    mut fsm: Box<dyn Fsm>,
    commit_rx: Receiver<(Log, Option<LogFuture>)>,
    restore_rx: Receiver<RestoreRequest>,
    snapshot_rx: Receiver<SnapshotRequest>,
) {
    let shutdown_rx = shared.shutdown_rx.clone();
    // The point the FSM has reached, used to stamp snapshots.
    let mut last_index = shared.state.last_snapshot_index();
    let mut last_term = shared.state.last_snapshot_term();
    loop {
        select! {
            recv(restore_rx) -> msg => {
                let Ok(mut request) = msg else { return };
                let (meta, mut source) = match shared.snapshots.open(&request.id) {
                    Ok(opened) => opened,
                    Err(err) => {
                        request.respond(Err(Error::Store(format!(
                            "failed to open snapshot {}: {}", request.id, err
                        ))));
                        continue;
                    }
                };
                if let Err(err) = fsm.restore(&mut source) {
                    request.respond(Err(Error::Fsm(format!(
                        "failed to restore snapshot {}: {}", request.id, err
                    ))));
                    continue;
                }
                last_index = meta.index;
                last_term = meta.term;
                request.respond(Ok(()));
            },
            recv(snapshot_rx) -> msg => {
                let Ok(mut request) = msg else { return };
                let peers = match shared.peer_store.peers() {
                    Ok(peers) => peers,
                    Err(err) => {
                        request.respond(Err(err));
                        continue;
                    }
                };
                match fsm.snapshot() {
                    Ok(snapshot) => request.respond(Ok(SnapshotReply {
                        index: last_index,
                        term: last_term,
                        peers,
                        snapshot,
                    })),
                    Err(err) => request.respond(Err(err)),
                }
            },
            recv(commit_rx) -> msg => {
                let Ok((log, future)) = msg else { return };
                // Only commands touch the FSM; barriers just take their
                // place in line.
                let mut response = Ok(Vec::new());
                if log.log_type == LogType::Command {
                    response = fsm.apply(&log);
                }
                last_index = log.index;
                last_term = log.term;
                if let Some(mut future) = future {
                    future.respond(response);
                }
            },
            recv(shutdown_rx) -> _ => return,
        }
    }
}

/// The snapshot worker: takes periodic snapshots when enough log has
/// accumulated, and user-requested ones on demand.
fn run_snapshots(shared: Arc<Shared>, snapshot_rx: Receiver<Completer<()>>) {
    let shutdown_rx = shared.shutdown_rx.clone();
    loop {
        select! {
            recv(random_timeout(shared.conf.snapshot_interval)) -> _ => {
                if !should_snapshot(&shared) {
                    continue;
                }
                if let Err(err) = take_snapshot(&shared) {
                    error!("failed to take snapshot: {err}");
                }
            },
            recv(snapshot_rx) -> msg => {
                let Ok(mut completer) = msg else { return };
                // User-triggered: run regardless of the threshold.
                let result = take_snapshot(&shared);
                if let Err(err) = &result {
                    error!("failed to take snapshot: {err}");
                }
                completer.respond(result);
            },
            recv(shutdown_rx) -> _ => return,
        }
    }
}

/// Whether enough log has accumulated since the last snapshot.
fn should_snapshot(shared: &Shared) -> bool {
    let last_snapshot = shared.state.last_snapshot_index();
    let last_index = match shared.logs.last_index() {
        Ok(index) => index,
        Err(err) => {
            error!("failed to get last log index: {err}");
            return false;
        }
    };
    last_index.saturating_sub(last_snapshot) >= shared.conf.snapshot_threshold
}

/// Takes a snapshot: asks the FSM worker for a handle, persists it, and
/// compacts the log behind it.
fn take_snapshot(shared: &Shared) -> Result<()> {
    let (request, reply_future) = SnapshotRequest::new();
    let shutdown_rx = shared.shutdown_rx.clone();
    select! {
        send(shared.fsm_snapshot_tx, request) -> res => {
            if res.is_err() {
                return Err(Error::Shutdown);
            }
        },
        recv(shutdown_rx) -> _ => return Err(Error::Shutdown),
    }
    let reply = reply_future
        .wait()
        .map_err(|err| Error::Fsm(format!("failed to start snapshot: {err}")))?;

    info!("starting snapshot up to {}", reply.index);
    let peer_set = peer::encode_peers(&reply.peers, &*shared.trans);
    let mut sink = shared
        .snapshots
        .create(reply.index, reply.term, peer_set)
        .map_err(|err| Error::Store(format!("failed to create snapshot: {err}")))?;
    if let Err(err) = reply.snapshot.persist(&mut *sink) {
        let _ = sink.cancel();
        return Err(Error::Store(format!("failed to persist snapshot: {err}")));
    }
    sink.close().map_err(|err| Error::Store(format!("failed to close snapshot: {err}")))?;

    shared.state.set_last_snapshot(reply.index, reply.term);
    compact_logs(shared, reply.index)?;
    info!("snapshot to {} complete", reply.index);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fsm::tests::KvFsm;
    use crate::peer::StaticPeers;
    use crate::snapshot::MemSnapshotStore;
    use crate::store::MemStore;
    use crate::transport::MemTransport;

    use test_case::test_case;

    fn test_config() -> Config {
        Config {
            heartbeat_timeout: Duration::from_millis(50),
            election_timeout: Duration::from_millis(50),
            leader_lease_timeout: Duration::from_millis(50),
            snapshot_interval: Duration::from_secs(3600),
            enable_single_node: true,
            ..Config::default()
        }
    }

    fn wait_for(f: impl Fn() -> bool, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if f() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        f()
    }

    fn single_node(conf: Config, peers: Vec<Address>) -> (Raft, KvFsm) {
        let fsm = KvFsm::new();
        let (trans, _) = MemTransport::new("a:1".into());
        let raft = Raft::new(
            conf,
            Box::new(fsm.clone()),
            Box::new(MemStore::new()),
            Box::new(MemStore::new()),
            Box::new(MemSnapshotStore::new()),
            Box::new(StaticPeers::new(peers)),
            Box::new(trans),
        )
        .expect("raft must start");
        (raft, fsm)
    }

    /// Tests Shared::quorum_size() across cluster sizes.
    #[test_case(1 => 1)]
    #[test_case(2 => 2)]
    #[test_case(3 => 2)]
    #[test_case(4 => 3)]
    #[test_case(5 => 3)]
    #[test_case(6 => 4)]
    #[test_case(7 => 4)]
    #[test_case(8 => 5)]
    fn quorum_size(size: usize) -> usize {
        let conf = Config { enable_single_node: false, ..test_config() };
        let peers: Vec<Address> = (1..=size).map(|i| format!("node{i}:70{i:02}")).collect();
        let fsm = KvFsm::new();
        let (trans, _) = MemTransport::new(peers[0].clone());
        let raft = Raft::new(
            conf,
            Box::new(fsm),
            Box::new(MemStore::new()),
            Box::new(MemStore::new()),
            Box::new(MemSnapshotStore::new()),
            Box::new(StaticPeers::new(peers)),
            Box::new(trans),
        )
        .expect("raft must start");
        let quorum = raft.shared.quorum_size();
        raft.shutdown().wait();
        quorum
    }

    #[test]
    fn single_node_elects_and_applies() {
        let (raft, fsm) = single_node(test_config(), vec!["a:1".into()]);
        assert!(wait_for(|| raft.state() == NodeState::Leader, Duration::from_secs(2)));
        assert_eq!(raft.leader(), Some("a:1".to_string()));

        let response = raft.apply(b"key=value".to_vec(), None).wait().expect("apply must work");
        assert_eq!(response, b"key=value".to_vec());
        assert_eq!(fsm.get("key"), Some("value".to_string()));

        // Index 1 is the election's peer-set entry, index 2 the command.
        assert_eq!(raft.last_index(), 2);
        raft.shutdown().wait();
    }

    #[test]
    fn rejects_apply_when_not_leader() {
        let conf = Config { enable_single_node: false, ..test_config() };
        // The peer is unreachable, so no election can be won.
        let (raft, _) = single_node(conf, vec!["a:1".into(), "b:2".into()]);
        let result = raft.apply(b"nope".to_vec(), None).wait();
        assert_eq!(result, Err(Error::NotLeader));
        raft.shutdown().wait();
    }

    #[test]
    fn barrier_waits_for_applies() {
        let (raft, fsm) = single_node(test_config(), vec!["a:1".into()]);
        assert!(wait_for(|| raft.state() == NodeState::Leader, Duration::from_secs(2)));

        let mut futures = Vec::new();
        for i in 0..5 {
            futures.push(raft.apply(format!("k{i}=v{i}").into_bytes(), None));
        }
        raft.barrier(None).wait().expect("barrier must work");

        // Everything applied before the barrier resolved.
        assert_eq!(fsm.applied.lock().unwrap().len(), 5);
        for future in futures {
            future.wait().expect("apply must work");
        }
        raft.shutdown().wait();
    }

    #[test]
    fn verify_leader_on_single_node() {
        let (raft, _) = single_node(test_config(), vec!["a:1".into()]);
        assert!(wait_for(|| raft.state() == NodeState::Leader, Duration::from_secs(2)));
        raft.verify_leader().wait().expect("verification must pass");
        raft.shutdown().wait();
    }

    #[test]
    fn verify_leader_rejected_on_follower() {
        let conf = Config { enable_single_node: false, ..test_config() };
        let (raft, _) = single_node(conf, vec!["a:1".into(), "b:2".into()]);
        assert_eq!(raft.verify_leader().wait(), Err(Error::NotLeader));
        raft.shutdown().wait();
    }

    #[test]
    fn shutdown_is_idempotent() {
        let (raft, _) = single_node(test_config(), vec!["a:1".into()]);
        raft.shutdown().wait();
        raft.shutdown().wait();
        assert_eq!(raft.state(), NodeState::Shutdown);
        assert_eq!(raft.apply(b"late".to_vec(), None).wait(), Err(Error::Shutdown));
    }

    #[test]
    fn leader_ch_signals_acquisition() {
        let (raft, _) = single_node(test_config(), vec!["a:1".into()]);
        let leader_rx = raft.leader_ch();
        assert_eq!(leader_rx.recv_timeout(Duration::from_secs(2)), Ok(true));
        raft.shutdown().wait();
    }

    #[test]
    fn stats_reports_progress() {
        let (raft, _) = single_node(test_config(), vec!["a:1".into()]);
        assert!(wait_for(|| raft.state() == NodeState::Leader, Duration::from_secs(2)));
        raft.apply(b"k=v".to_vec(), None).wait().expect("apply must work");

        let stats = raft.stats();
        assert_eq!(stats["state"], "leader");
        assert_eq!(stats["num_peers"], "0");
        assert_eq!(stats["commit_index"], "2");
        assert_eq!(stats["last_contact"], "0");
        raft.shutdown().wait();
    }

    #[test]
    fn add_known_peer_is_rejected() {
        let (raft, _) = single_node(test_config(), vec!["a:1".into()]);
        assert!(wait_for(|| raft.state() == NodeState::Leader, Duration::from_secs(2)));
        assert_eq!(raft.add_peer("a:1".into()).wait(), Err(Error::KnownPeer));
        assert_eq!(raft.remove_peer("c:9".into()).wait(), Err(Error::UnknownPeer));
        raft.shutdown().wait();
    }

    #[test]
    fn forced_snapshot_compacts_log() {
        let conf = Config { trailing_logs: 0, ..test_config() };
        let (raft, fsm) = single_node(conf, vec!["a:1".into()]);
        assert!(wait_for(|| raft.state() == NodeState::Leader, Duration::from_secs(2)));

        for i in 0..10 {
            raft.apply(format!("k{i}=v{i}").into_bytes(), None).wait().expect("apply must work");
        }
        raft.snapshot().wait().expect("snapshot must work");

        let stats = raft.stats();
        assert_ne!(stats["last_snapshot_index"], "0");
        assert_eq!(fsm.get("k9"), Some("v9".to_string()));
        raft.shutdown().wait();
    }

    #[test]
    fn restart_restores_from_snapshot() {
        let conf = Config { trailing_logs: 0, ..test_config() };
        let logs = Arc::new(MemStore::new());
        let stable = Arc::new(MemStore::new());
        let snapshots = MemSnapshotStore::new();

        let fsm = KvFsm::new();
        let (trans, _) = MemTransport::new("a:1".into());
        let raft = Raft::new(
            conf.clone(),
            Box::new(fsm.clone()),
            Box::new(SharedStore(logs.clone())),
            Box::new(SharedStore(stable.clone())),
            Box::new(snapshots.clone()),
            Box::new(StaticPeers::new(vec!["a:1".into()])),
            Box::new(trans),
        )
        .expect("raft must start");
        assert!(wait_for(|| raft.state() == NodeState::Leader, Duration::from_secs(2)));
        raft.apply(b"durable=yes".to_vec(), None).wait().expect("apply must work");
        raft.snapshot().wait().expect("snapshot must work");
        raft.shutdown().wait();

        // A new node over the same stores picks up where we left off.
        let fsm2 = KvFsm::new();
        let (trans2, _) = MemTransport::new("a:1".into());
        let raft2 = Raft::new(
            conf,
            Box::new(fsm2.clone()),
            Box::new(SharedStore(logs)),
            Box::new(SharedStore(stable)),
            Box::new(snapshots),
            Box::new(StaticPeers::new(vec!["a:1".into()])),
            Box::new(trans2),
        )
        .expect("raft must restart");
        assert_eq!(fsm2.get("durable"), Some("yes".to_string()));
        assert!(wait_for(|| raft2.state() == NodeState::Leader, Duration::from_secs(2)));
        raft2.shutdown().wait();
    }

    /// Lets two nodes share one MemStore across restarts.
    struct SharedStore(Arc<MemStore>);

    impl LogStore for SharedStore {
        fn first_index(&self) -> Result<u64> {
            self.0.first_index()
        }
        fn last_index(&self) -> Result<u64> {
            self.0.last_index()
        }
        fn get_log(&self, index: u64) -> Result<Log> {
            self.0.get_log(index)
        }
        fn store_logs(&self, logs: &[Log]) -> Result<()> {
            self.0.store_logs(logs)
        }
        fn delete_range(&self, min: u64, max: u64) -> Result<()> {
            self.0.delete_range(min, max)
        }
    }

    impl StableStore for SharedStore {
        fn set(&self, key: &[u8], value: &[u8]) -> Result<()> {
            self.0.set(key, value)
        }
        fn get(&self, key: &[u8]) -> Result<Vec<u8>> {
            StableStore::get(&*self.0, key)
        }
        fn set_u64(&self, key: &[u8], value: u64) -> Result<()> {
            self.0.set_u64(key, value)
        }
        fn get_u64(&self, key: &[u8]) -> Result<u64> {
            self.0.get_u64(key)
        }
    }
}
