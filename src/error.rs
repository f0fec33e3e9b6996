use serde_derive::{Deserialize, Serialize};

/// A crate result, with a raft Error.
pub type Result<T> = std::result::Result<T, Error>;

/// A raft error. Consensus errors (the first group) are sentinels that
/// callers are expected to match on; the remaining variants carry failures
/// forwarded from collaborators (stores, transports, the state machine).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Error {
    /// The operation can't be performed on a leader node.
    Leader,
    /// The operation must be performed on the leader node.
    NotLeader,
    /// Leadership was lost while the operation was in flight.
    LeadershipLost,
    /// The node has been shut down.
    Shutdown,
    /// The operation timed out before it could be enqueued.
    EnqueueTimeout,
    /// The peer is already a cluster member.
    KnownPeer,
    /// The peer is not a cluster member.
    UnknownPeer,
    /// A store key or log entry does not exist.
    NotFound,
    /// An invalid configuration.
    Config(String),
    /// A storage or encoding failure.
    Store(String),
    /// A transport failure.
    Transport(String),
    /// A state machine apply/restore failure.
    Fsm(String),
    /// An internal invariant violation.
    Internal(String),
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::Leader => write!(f, "node is the leader"),
            Error::NotLeader => write!(f, "node is not the leader"),
            Error::LeadershipLost => write!(f, "leadership lost while committing log"),
            Error::Shutdown => write!(f, "raft is already shutdown"),
            Error::EnqueueTimeout => write!(f, "timed out enqueuing operation"),
            Error::KnownPeer => write!(f, "peer already known"),
            Error::UnknownPeer => write!(f, "peer is unknown"),
            // The literal "not found", for stores that still compare strings.
            Error::NotFound => write!(f, "not found"),
            Error::Config(s)
            | Error::Store(s)
            | Error::Transport(s)
            | Error::Fsm(s)
            | Error::Internal(s) => write!(f, "{s}"),
        }
    }
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Error::Store(err.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Store(err.to_string())
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Error::Internal(err.to_string())
    }
}

impl<T> From<crossbeam_channel::SendError<T>> for Error {
    fn from(err: crossbeam_channel::SendError<T>) -> Self {
        Error::Internal(err.to_string())
    }
}

impl From<crossbeam_channel::RecvError> for Error {
    fn from(err: crossbeam_channel::RecvError) -> Self {
        Error::Internal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_display() {
        // Persistent stores predating the NotFound variant match on the
        // rendered message, so it must stay exactly "not found".
        assert_eq!(Error::NotFound.to_string(), "not found");
    }
}
