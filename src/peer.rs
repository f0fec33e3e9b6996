use crate::error::Result;
use crate::transport::Transport;

use std::sync::RwLock;

/// A peer network address, e.g. "127.0.0.1:7000". Addresses identify nodes:
/// two nodes are the same node iff their addresses are equal.
pub type Address = String;

/// Durable storage for the known peer set, so that membership survives
/// restarts. The stored set includes the local node.
pub trait PeerStore: Send + Sync {
    /// Returns the stored peer set.
    fn peers(&self) -> Result<Vec<Address>>;

    /// Replaces the stored peer set.
    fn set_peers(&self, peers: &[Address]) -> Result<()>;
}

/// An in-memory peer store, for testing and for clusters whose membership
/// is managed out of band.
#[derive(Default)]
pub struct StaticPeers {
    peers: RwLock<Vec<Address>>,
}

impl StaticPeers {
    /// Creates a peer store with the given initial peers.
    pub fn new(peers: Vec<Address>) -> Self {
        Self { peers: RwLock::new(peers) }
    }
}

impl PeerStore for StaticPeers {
    fn peers(&self) -> Result<Vec<Address>> {
        Ok(self.peers.read()?.clone())
    }

    fn set_peers(&self, peers: &[Address]) -> Result<()> {
        *self.peers.write()? = peers.to_vec();
        Ok(())
    }
}

/// Encodes a peer set for storage in a membership log entry, using the
/// transport's address encoding for each peer.
pub fn encode_peers(peers: &[Address], trans: &dyn Transport) -> Vec<u8> {
    let encoded: Vec<Vec<u8>> = peers.iter().map(|p| trans.encode_peer(p)).collect();
    bincode::serialize(&encoded).expect("peer set must encode")
}

/// Decodes a peer set from a membership log entry.
pub fn decode_peers(data: &[u8], trans: &dyn Transport) -> Result<Vec<Address>> {
    let encoded: Vec<Vec<u8>> = bincode::deserialize(data)?;
    encoded.iter().map(|p| trans.decode_peer(p)).collect()
}

/// Returns whether the peer set contains the given address.
pub fn contains(peers: &[Address], peer: &str) -> bool {
    peers.iter().any(|p| p == peer)
}

/// Returns the peer set without the given address.
pub fn exclude(peers: &[Address], peer: &str) -> Vec<Address> {
    peers.iter().filter(|p| *p != peer).cloned().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemTransport;

    #[test]
    fn contains_and_exclude() {
        let peers = vec!["a:1".to_string(), "b:2".to_string()];
        assert!(contains(&peers, "a:1"));
        assert!(!contains(&peers, "c:3"));
        assert_eq!(exclude(&peers, "a:1"), vec!["b:2".to_string()]);
        assert_eq!(exclude(&peers, "c:3"), peers);
    }

    #[test]
    fn encode_decode_roundtrip() {
        let (trans, _rx) = MemTransport::new("a:1".into());
        let peers = vec!["a:1".to_string(), "b:2".to_string(), "c:3".to_string()];
        let data = encode_peers(&peers, &trans);
        assert_eq!(decode_peers(&data, &trans).unwrap(), peers);
    }

    #[test]
    fn static_peers() {
        let store = StaticPeers::new(vec!["a:1".to_string()]);
        assert_eq!(store.peers().unwrap(), vec!["a:1".to_string()]);
        store.set_peers(&["a:1".to_string(), "b:2".to_string()]).unwrap();
        assert_eq!(store.peers().unwrap().len(), 2);
    }
}
