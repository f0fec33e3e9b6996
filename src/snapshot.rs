use crate::error::{Error, Result};

use serde_derive::{Deserialize, Serialize};
use std::io::{Read, Write};
use std::sync::{Arc, RwLock};

/// Metadata for a stored snapshot.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SnapshotMeta {
    /// An opaque store-assigned snapshot ID.
    pub id: String,
    /// The index of the last log entry covered by the snapshot.
    pub index: u64,
    /// The term of the last log entry covered by the snapshot.
    pub term: u64,
    /// The encoded peer set at the time the snapshot was taken.
    pub peers: Vec<u8>,
    /// The snapshot size in bytes.
    pub size: u64,
}

/// A sink for writing out a new snapshot. The snapshot only becomes visible
/// to list() and open() once close() succeeds; cancel() discards it.
pub trait SnapshotSink: Write + Send {
    /// The ID the snapshot will have once closed.
    fn id(&self) -> &str;

    /// Finalizes and publishes the snapshot.
    fn close(self: Box<Self>) -> Result<()>;

    /// Discards the partially-written snapshot.
    fn cancel(self: Box<Self>) -> Result<()>;
}

/// Persistent snapshot storage.
pub trait SnapshotStore: Send + Sync {
    /// Starts a new snapshot at the given index and term, with the encoded
    /// peer set captured at that point.
    fn create(&self, index: u64, term: u64, peers: Vec<u8>) -> Result<Box<dyn SnapshotSink>>;

    /// Lists available snapshots, newest first.
    fn list(&self) -> Result<Vec<SnapshotMeta>>;

    /// Opens a snapshot for reading.
    fn open(&self, id: &str) -> Result<(SnapshotMeta, Box<dyn Read + Send>)>;
}

/// An in-memory snapshot store, for testing and ephemeral clusters.
#[derive(Clone, Default)]
pub struct MemSnapshotStore {
    inner: Arc<RwLock<MemSnapshots>>,
}

#[derive(Default)]
struct MemSnapshots {
    /// Completed snapshots, oldest first.
    snapshots: Vec<(SnapshotMeta, Vec<u8>)>,
    /// Snapshot ID sequence number.
    sequence: u64,
}

impl MemSnapshotStore {
    /// Creates a new empty snapshot store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl SnapshotStore for MemSnapshotStore {
    fn create(&self, index: u64, term: u64, peers: Vec<u8>) -> Result<Box<dyn SnapshotSink>> {
        let mut inner = self.inner.write()?;
        inner.sequence += 1;
        let id = format!("{}-{}-{}", term, index, inner.sequence);
        let meta = SnapshotMeta { id, index, term, peers, size: 0 };
        Ok(Box::new(MemSnapshotSink { store: self.inner.clone(), meta, data: Vec::new() }))
    }

    fn list(&self) -> Result<Vec<SnapshotMeta>> {
        let inner = self.inner.read()?;
        Ok(inner.snapshots.iter().rev().map(|(meta, _)| meta.clone()).collect())
    }

    fn open(&self, id: &str) -> Result<(SnapshotMeta, Box<dyn Read + Send>)> {
        let inner = self.inner.read()?;
        for (meta, data) in &inner.snapshots {
            if meta.id == id {
                return Ok((meta.clone(), Box::new(std::io::Cursor::new(data.clone()))));
            }
        }
        Err(Error::NotFound)
    }
}

struct MemSnapshotSink {
    store: Arc<RwLock<MemSnapshots>>,
    meta: SnapshotMeta,
    data: Vec<u8>,
}

impl Write for MemSnapshotSink {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.data.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl SnapshotSink for MemSnapshotSink {
    fn id(&self) -> &str {
        &self.meta.id
    }

    fn close(mut self: Box<Self>) -> Result<()> {
        self.meta.size = self.data.len() as u64;
        let mut inner = self.store.write()?;
        inner.snapshots.push((self.meta, self.data));
        Ok(())
    }

    fn cancel(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_close_open() {
        let store = MemSnapshotStore::new();
        let mut sink = store.create(3, 2, vec![0xff]).unwrap();
        sink.write_all(b"snapshot data").unwrap();
        let id = sink.id().to_string();
        sink.close().unwrap();

        let (meta, mut source) = store.open(&id).unwrap();
        assert_eq!(meta.index, 3);
        assert_eq!(meta.term, 2);
        assert_eq!(meta.size, 13);

        let mut data = Vec::new();
        source.read_to_end(&mut data).unwrap();
        assert_eq!(data, b"snapshot data");
    }

    #[test]
    fn list_newest_first() {
        let store = MemSnapshotStore::new();
        for index in 1..=3 {
            let sink = store.create(index, 1, Vec::new()).unwrap();
            sink.close().unwrap();
        }
        let list = store.list().unwrap();
        assert_eq!(list.len(), 3);
        assert_eq!(list[0].index, 3);
        assert_eq!(list[2].index, 1);
    }

    #[test]
    fn cancel_discards() {
        let store = MemSnapshotStore::new();
        let mut sink = store.create(1, 1, Vec::new()).unwrap();
        sink.write_all(b"partial").unwrap();
        sink.cancel().unwrap();
        assert!(store.list().unwrap().is_empty());
    }
}
