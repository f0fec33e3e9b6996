//! A Raft distributed consensus implementation.
//!
//! Raft maintains a totally-ordered, durable log of commands that a
//! cluster of nodes applies in lockstep to a user-supplied deterministic
//! state machine, tolerating the failure of any minority of nodes. See
//! "In Search of an Understandable Consensus Algorithm" (Ongaro and
//! Ousterhout) for the algorithm itself.
//!
//! The crate provides the consensus core as [`Raft`], parameterized over
//! collaborator traits for everything with a deployment-specific answer:
//! log storage ([`LogStore`]), term/vote storage ([`StableStore`]),
//! snapshots ([`SnapshotStore`]), networking ([`Transport`]), cluster
//! membership persistence ([`PeerStore`]), and the state machine itself
//! ([`Fsm`]). In-memory implementations of each are included for tests
//! and experimentation.

#![warn(clippy::all)]

mod config;
mod error;
mod fsm;
mod future;
mod inflight;
mod log;
mod peer;
mod raft;
mod replication;
mod snapshot;
mod stable;
mod state;
mod store;
mod transport;

pub use config::Config;
pub use error::{Error, Result};
pub use fsm::{Fsm, FsmSnapshot};
pub use future::{ApplyFuture, OpFuture};
pub use log::{Log, LogStore, LogType};
pub use peer::{Address, PeerStore, StaticPeers};
pub use raft::{Raft, ShutdownFuture};
pub use snapshot::{MemSnapshotStore, SnapshotMeta, SnapshotSink, SnapshotStore};
pub use stable::StableStore;
pub use state::NodeState;
pub use store::MemStore;
pub use transport::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    MemTransport, Request, RequestVoteRequest, RequestVoteResponse, Response, Rpc, Transport,
};
