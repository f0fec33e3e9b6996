use crate::error::Result;
use crate::peer::Address;

use serde_derive::{Deserialize, Serialize};

/// A log entry type.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogType {
    /// A state machine command, applied by the FSM.
    Command,
    /// A no-op, used to disambiguate entries from previous terms.
    Noop,
    /// A peer addition. The data holds the encoded new peer set.
    AddPeer,
    /// A peer removal. The data holds the encoded new peer set.
    RemovePeer,
    /// A barrier. Not applied to the FSM; its future completes once every
    /// earlier command has been applied.
    Barrier,
}

/// A replicated log entry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Log {
    /// The entry index. 1-based and contiguous.
    pub index: u64,
    /// The term in which the entry was appended.
    pub term: u64,
    /// The entry type.
    pub log_type: LogType,
    /// The command payload, or the encoded peer set for membership entries.
    pub data: Vec<u8>,
    /// The peer being added or removed. Only set on membership entries
    /// between submission and dispatch, before the peer set is encoded into
    /// data; never replicated.
    #[serde(skip)]
    pub peer: Option<Address>,
}

impl Log {
    /// Creates a new entry of the given type, with no index or term. The
    /// leader assigns those at dispatch.
    pub fn new(log_type: LogType, data: Vec<u8>) -> Self {
        Self { index: 0, term: 0, log_type, data, peer: None }
    }
}

/// Durable, index-addressable log entry storage. Entry indexes are 1-based,
/// to match Raft semantics. Implementations must be safe to share across
/// threads: the leader's replication workers read entries concurrently with
/// the main loop appending them.
pub trait LogStore: Send + Sync {
    /// Returns the first index in the log, or 0 if the log is empty.
    fn first_index(&self) -> Result<u64>;

    /// Returns the last index in the log, or 0 if the log is empty.
    fn last_index(&self) -> Result<u64>;

    /// Fetches the entry at an index. Returns Error::NotFound if it does
    /// not exist (never stored, or compacted away).
    fn get_log(&self, index: u64) -> Result<Log>;

    /// Durably stores a batch of entries. Entries must be contiguous with
    /// the existing log.
    fn store_logs(&self, logs: &[Log]) -> Result<()>;

    /// Deletes all entries in the inclusive range [min, max]. Used both for
    /// suffix truncation on conflict and for compaction after a snapshot.
    fn delete_range(&self, min: u64, max: u64) -> Result<()>;
}
