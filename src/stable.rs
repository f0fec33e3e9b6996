use crate::error::Result;

/// Durable key-value storage for small consensus-critical state: the
/// current term and the vote. Writes must be flushed before returning, since
/// the node acknowledges votes and adopts terms only after persisting them.
pub trait StableStore: Send + Sync {
    /// Sets a key to a value.
    fn set(&self, key: &[u8], value: &[u8]) -> Result<()>;

    /// Gets a value. Returns Error::NotFound if the key has never been set.
    fn get(&self, key: &[u8]) -> Result<Vec<u8>>;

    /// Sets a key to a u64 value.
    fn set_u64(&self, key: &[u8], value: u64) -> Result<()>;

    /// Gets a u64 value. Returns Error::NotFound if the key has never been
    /// set.
    fn get_u64(&self, key: &[u8]) -> Result<u64>;
}

/// The current term.
pub const KEY_CURRENT_TERM: &[u8] = b"CurrentTerm";
/// The term we last voted in.
pub const KEY_LAST_VOTE_TERM: &[u8] = b"LastVoteTerm";
/// The candidate we last voted for.
pub const KEY_LAST_VOTE_CAND: &[u8] = b"LastVoteCand";
