use crate::error::Result;
use crate::log::Log;
use crate::snapshot::SnapshotSink;

use std::io::Read;

/// A user-supplied deterministic state machine. The committed log is the
/// authoritative history; the FSM is its materialization. All calls are made
/// from a single worker thread, in commit order, exactly once per entry.
///
/// Determinism matters: every node applies the same entries in the same
/// order, and the cluster diverges if two nodes compute different results.
pub trait Fsm: Send {
    /// Applies a committed Command entry, returning an opaque response that
    /// is handed to the client future on the proposing node. Errors are
    /// also handed to the future; the entry still counts as applied.
    fn apply(&mut self, log: &Log) -> Result<Vec<u8>>;

    /// Returns a point-in-time snapshot handle. Must be cheap: apply() is
    /// paused while this runs. The heavy work belongs in persist().
    fn snapshot(&mut self) -> Result<Box<dyn FsmSnapshot>>;

    /// Replaces the entire state machine from a snapshot.
    fn restore(&mut self, source: &mut dyn Read) -> Result<()>;
}

/// A point-in-time snapshot of an FSM, produced by Fsm::snapshot and
/// written out by the snapshot worker. Dropped when no longer needed.
pub trait FsmSnapshot: Send {
    /// Writes the snapshot to the sink. Must not close or cancel it; the
    /// caller does, based on the result.
    fn persist(&self, sink: &mut dyn SnapshotSink) -> Result<()>;
}
