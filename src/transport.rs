use crate::error::{Error, Result};
use crate::log::Log;
use crate::peer::Address;

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use serde_derive::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Read;
use std::sync::{Arc, RwLock};
use std::time::Duration;

/// A leader's request to append entries to a follower's log. With no
/// entries it doubles as a heartbeat.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    /// The leader's term.
    pub term: u64,
    /// The leader's encoded address, so the follower can record it.
    pub leader: Vec<u8>,
    /// The index of the entry immediately preceding entries, or 0 when
    /// replicating from the start of the log.
    pub prev_log_index: u64,
    /// The term of the entry at prev_log_index.
    pub prev_log_term: u64,
    /// The entries to append. Empty for heartbeats.
    pub entries: Vec<Log>,
    /// The leader's commit index.
    pub leader_commit_index: u64,
}

impl AppendEntriesRequest {
    /// Whether this request is a pure heartbeat: nothing to verify against
    /// the log and nothing to commit. Only such requests may be dispatched
    /// through the heartbeat fast-path, which runs the handler outside the
    /// main loop.
    pub fn is_heartbeat(&self) -> bool {
        self.prev_log_index == 0
            && self.prev_log_term == 0
            && self.entries.is_empty()
            && self.leader_commit_index == 0
    }
}

/// A follower's response to an AppendEntries request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    /// The responder's term, for the leader to detect deposition.
    pub term: u64,
    /// The responder's last log index at entry, a hint for the leader.
    pub last_log: u64,
    /// Whether the entries were appended.
    pub success: bool,
}

/// A candidate's request for a vote.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RequestVoteRequest {
    /// The candidate's term.
    pub term: u64,
    /// The candidate's encoded address.
    pub candidate: Vec<u8>,
    /// The index of the candidate's last log entry.
    pub last_log_index: u64,
    /// The term of the candidate's last log entry.
    pub last_log_term: u64,
}

/// A response to a vote request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RequestVoteResponse {
    /// The responder's term.
    pub term: u64,
    /// The responder's encoded peer set, letting the candidate warn about
    /// cluster configuration mismatches.
    pub peers: Vec<u8>,
    /// Whether the vote was granted.
    pub granted: bool,
}

/// A leader's request to install a snapshot on a follower that has fallen
/// behind its first retained log entry. The snapshot contents follow as a
/// byte stream of exactly size bytes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InstallSnapshotRequest {
    /// The leader's term.
    pub term: u64,
    /// The leader's encoded address.
    pub leader: Vec<u8>,
    /// The index of the last entry covered by the snapshot.
    pub last_log_index: u64,
    /// The term of the last entry covered by the snapshot.
    pub last_log_term: u64,
    /// The encoded peer set captured in the snapshot.
    pub peers: Vec<u8>,
    /// The snapshot size in bytes.
    pub size: u64,
}

/// A response to a snapshot installation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InstallSnapshotResponse {
    /// The responder's term.
    pub term: u64,
    /// Whether the snapshot was installed.
    pub success: bool,
}

/// An RPC request.
#[derive(Debug)]
pub enum Request {
    AppendEntries(AppendEntriesRequest),
    RequestVote(RequestVoteRequest),
    InstallSnapshot(InstallSnapshotRequest),
}

/// An RPC response.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Response {
    AppendEntries(AppendEntriesResponse),
    RequestVote(RequestVoteResponse),
    InstallSnapshot(InstallSnapshotResponse),
}

/// An inbound RPC: a request, an optional byte stream (snapshot
/// installs), and a one-shot response channel.
pub struct Rpc {
    /// The request.
    pub request: Request,
    /// The snapshot byte stream, for InstallSnapshot requests.
    pub reader: Option<Box<dyn Read + Send>>,
    tx: Sender<Result<Response>>,
}

impl Rpc {
    /// Creates an RPC and the receiver for its response.
    pub fn new(
        request: Request,
        reader: Option<Box<dyn Read + Send>>,
    ) -> (Self, Receiver<Result<Response>>) {
        let (tx, rx) = bounded(1);
        (Self { request, reader, tx }, rx)
    }

    /// Responds to the RPC. The caller may have gone away (e.g. timed
    /// out), in which case the response is dropped.
    pub fn respond(self, response: Result<Response>) {
        let _ = self.tx.send(response);
    }
}

/// Unreliable point-to-point RPC between nodes. Requests may fail or time
/// out at any point; the consensus layer retries where needed.
pub trait Transport: Send + Sync {
    /// Returns the channel on which inbound RPCs are delivered.
    fn consumer(&self) -> Receiver<Rpc>;

    /// The local node address.
    fn local_addr(&self) -> Address;

    /// Encodes a peer address for the wire and for membership entries.
    fn encode_peer(&self, addr: &str) -> Vec<u8>;

    /// Decodes a peer address.
    fn decode_peer(&self, data: &[u8]) -> Result<Address>;

    /// Sends an AppendEntries request and waits for the response.
    fn append_entries(
        &self,
        target: &str,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse>;

    /// Sends a RequestVote request and waits for the response.
    fn request_vote(&self, target: &str, request: RequestVoteRequest)
        -> Result<RequestVoteResponse>;

    /// Sends an InstallSnapshot request, streaming the snapshot contents,
    /// and waits for the response.
    fn install_snapshot(
        &self,
        target: &str,
        request: InstallSnapshotRequest,
        snapshot: Box<dyn Read + Send>,
    ) -> Result<InstallSnapshotResponse>;

    /// Installs a handler invoked for heartbeat-shaped AppendEntries
    /// requests instead of the consumer channel, avoiding head-of-line
    /// blocking behind bulk replication. The handler may be invoked from
    /// any thread, concurrently with consumer processing.
    fn set_heartbeat_handler(&self, handler: Box<dyn Fn(Rpc) + Send + Sync>);
}

type HeartbeatHandler = Arc<RwLock<Option<Box<dyn Fn(Rpc) + Send + Sync>>>>;

struct MemPeer {
    tx: Sender<Rpc>,
    heartbeat: HeartbeatHandler,
}

/// An in-process transport connecting nodes over channels, for tests and
/// single-process clusters. Peers are wired explicitly with connect();
/// disconnect() simulates a network partition. Clones share the underlying
/// links, so a test can keep one clone for fault injection while the node
/// owns another.
#[derive(Clone)]
pub struct MemTransport {
    local: Address,
    tx: Sender<Rpc>,
    rx: Receiver<Rpc>,
    peers: Arc<RwLock<HashMap<Address, MemPeer>>>,
    heartbeat: HeartbeatHandler,
    timeout: Duration,
}

impl MemTransport {
    /// Creates a transport for the given local address. Also returns the
    /// consumer channel for convenience.
    pub fn new(local: Address) -> (Self, Receiver<Rpc>) {
        let (tx, rx) = unbounded();
        let trans = Self {
            local,
            tx,
            rx: rx.clone(),
            peers: Arc::new(RwLock::new(HashMap::new())),
            heartbeat: Arc::new(RwLock::new(None)),
            timeout: Duration::from_millis(500),
        };
        (trans, rx)
    }

    /// Makes the given transport reachable from this one. One-directional;
    /// call both ways for a full link.
    pub fn connect(&self, peer: &MemTransport) {
        let mut peers = self.peers.write().expect("lock poisoned");
        peers.insert(
            peer.local.clone(),
            MemPeer { tx: peer.tx.clone(), heartbeat: peer.heartbeat.clone() },
        );
    }

    /// Makes the given address unreachable, as a partition would.
    pub fn disconnect(&self, addr: &str) {
        self.peers.write().expect("lock poisoned").remove(addr);
    }

    /// Makes all addresses unreachable.
    pub fn disconnect_all(&self) {
        self.peers.write().expect("lock poisoned").clear();
    }

    fn send(
        &self,
        target: &str,
        request: Request,
        reader: Option<Box<dyn Read + Send>>,
    ) -> Result<Response> {
        let (rpc_tx, heartbeat) = {
            let peers = self.peers.read()?;
            let peer = peers
                .get(target)
                .ok_or_else(|| Error::Transport(format!("peer {target} unreachable")))?;
            (peer.tx.clone(), peer.heartbeat.clone())
        };

        // Heartbeats go straight to the fast-path handler when the peer has
        // one installed, bypassing its consumer queue.
        let fast_path = matches!(&request, Request::AppendEntries(req) if req.is_heartbeat());
        let (rpc, rx) = Rpc::new(request, reader);
        if fast_path {
            let handler = heartbeat.read()?;
            if let Some(handler) = handler.as_ref() {
                handler(rpc);
                return rx
                    .recv_timeout(self.timeout)
                    .map_err(|_| Error::Transport(format!("rpc to {target} timed out")))?;
            }
        }

        rpc_tx
            .send_timeout(rpc, self.timeout)
            .map_err(|_| Error::Transport(format!("peer {target} not accepting rpcs")))?;
        rx.recv_timeout(self.timeout)
            .map_err(|_| Error::Transport(format!("rpc to {target} timed out")))?
    }
}

impl Transport for MemTransport {
    fn consumer(&self) -> Receiver<Rpc> {
        self.rx.clone()
    }

    fn local_addr(&self) -> Address {
        self.local.clone()
    }

    fn encode_peer(&self, addr: &str) -> Vec<u8> {
        bincode::serialize(addr).expect("address must encode")
    }

    fn decode_peer(&self, data: &[u8]) -> Result<Address> {
        Ok(bincode::deserialize(data)?)
    }

    fn append_entries(
        &self,
        target: &str,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse> {
        match self.send(target, Request::AppendEntries(request), None)? {
            Response::AppendEntries(resp) => Ok(resp),
            resp => Err(Error::Transport(format!("unexpected response {resp:?}"))),
        }
    }

    fn request_vote(
        &self,
        target: &str,
        request: RequestVoteRequest,
    ) -> Result<RequestVoteResponse> {
        match self.send(target, Request::RequestVote(request), None)? {
            Response::RequestVote(resp) => Ok(resp),
            resp => Err(Error::Transport(format!("unexpected response {resp:?}"))),
        }
    }

    fn install_snapshot(
        &self,
        target: &str,
        request: InstallSnapshotRequest,
        snapshot: Box<dyn Read + Send>,
    ) -> Result<InstallSnapshotResponse> {
        match self.send(target, Request::InstallSnapshot(request), Some(snapshot))? {
            Response::InstallSnapshot(resp) => Ok(resp),
            resp => Err(Error::Transport(format!("unexpected response {resp:?}"))),
        }
    }

    fn set_heartbeat_handler(&self, handler: Box<dyn Fn(Rpc) + Send + Sync>) {
        *self.heartbeat.write().expect("lock poisoned") = Some(handler);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn heartbeat_request(term: u64) -> AppendEntriesRequest {
        AppendEntriesRequest {
            term,
            leader: Vec::new(),
            prev_log_index: 0,
            prev_log_term: 0,
            entries: Vec::new(),
            leader_commit_index: 0,
        }
    }

    #[test]
    fn request_response() {
        let (a, _) = MemTransport::new("a:1".into());
        let (b, b_rx) = MemTransport::new("b:2".into());
        a.connect(&b);

        let responder = thread::spawn(move || {
            let rpc = b_rx.recv().unwrap();
            let Request::AppendEntries(req) = &rpc.request else { panic!("wrong request") };
            let term = req.term;
            rpc.respond(Ok(Response::AppendEntries(AppendEntriesResponse {
                term,
                last_log: 7,
                success: true,
            })));
        });

        let resp = a.append_entries("b:2", heartbeat_request(3)).unwrap();
        assert!(resp.success);
        assert_eq!(resp.last_log, 7);
        responder.join().unwrap();
    }

    #[test]
    fn unreachable_peer_errors() {
        let (a, _) = MemTransport::new("a:1".into());
        assert!(a.append_entries("b:2", heartbeat_request(1)).is_err());
    }

    #[test]
    fn disconnect_partitions() {
        let (a, _) = MemTransport::new("a:1".into());
        let (b, _b_rx) = MemTransport::new("b:2".into());
        a.connect(&b);
        a.disconnect("b:2");
        assert!(a.append_entries("b:2", heartbeat_request(1)).is_err());
    }

    #[test]
    fn heartbeat_fast_path() {
        let (a, _) = MemTransport::new("a:1".into());
        let (b, b_rx) = MemTransport::new("b:2".into());
        a.connect(&b);

        b.set_heartbeat_handler(Box::new(|rpc: Rpc| {
            let Request::AppendEntries(req) = &rpc.request else { panic!("wrong request") };
            assert!(req.is_heartbeat());
            let term = req.term;
            rpc.respond(Ok(Response::AppendEntries(AppendEntriesResponse {
                term,
                last_log: 0,
                success: true,
            })));
        }));

        // The heartbeat is served by the handler without a consumer running.
        let resp = a.append_entries("b:2", heartbeat_request(2)).unwrap();
        assert!(resp.success);
        assert!(b_rx.is_empty());
    }

    #[test]
    fn peer_encoding_roundtrip() {
        let (a, _) = MemTransport::new("a:1".into());
        let encoded = a.encode_peer("c:3");
        assert_eq!(a.decode_peer(&encoded).unwrap(), "c:3".to_string());
    }
}
