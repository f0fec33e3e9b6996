use crate::error::{Error, Result};
use crate::log::{Log, LogStore};
use crate::stable::StableStore;

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

/// An in-memory log and stable store, for testing and ephemeral clusters.
#[derive(Default)]
pub struct MemStore {
    inner: RwLock<Inner>,
}

#[derive(Default)]
struct Inner {
    logs: BTreeMap<u64, Log>,
    kv: HashMap<Vec<u8>, Vec<u8>>,
}

impl MemStore {
    /// Creates a new empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl LogStore for MemStore {
    fn first_index(&self) -> Result<u64> {
        let inner = self.inner.read()?;
        Ok(inner.logs.keys().next().copied().unwrap_or(0))
    }

    fn last_index(&self) -> Result<u64> {
        let inner = self.inner.read()?;
        Ok(inner.logs.keys().next_back().copied().unwrap_or(0))
    }

    fn get_log(&self, index: u64) -> Result<Log> {
        let inner = self.inner.read()?;
        inner.logs.get(&index).cloned().ok_or(Error::NotFound)
    }

    fn store_logs(&self, logs: &[Log]) -> Result<()> {
        let mut inner = self.inner.write()?;
        for log in logs {
            inner.logs.insert(log.index, log.clone());
        }
        Ok(())
    }

    fn delete_range(&self, min: u64, max: u64) -> Result<()> {
        let mut inner = self.inner.write()?;
        for index in min..=max {
            inner.logs.remove(&index);
        }
        Ok(())
    }
}

impl StableStore for MemStore {
    fn set(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let mut inner = self.inner.write()?;
        inner.kv.insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn get(&self, key: &[u8]) -> Result<Vec<u8>> {
        let inner = self.inner.read()?;
        inner.kv.get(key).cloned().ok_or(Error::NotFound)
    }

    fn set_u64(&self, key: &[u8], value: u64) -> Result<()> {
        self.set(key, &value.to_be_bytes())
    }

    fn get_u64(&self, key: &[u8]) -> Result<u64> {
        let value = StableStore::get(self, key)?;
        let bytes: [u8; 8] =
            value.try_into().map_err(|_| Error::Store("invalid u64 value".into()))?;
        Ok(u64::from_be_bytes(bytes))
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use crate::log::LogType;

    fn entry(index: u64, term: u64) -> Log {
        Log { index, term, log_type: LogType::Command, data: vec![index as u8], peer: None }
    }

    /// A conformance suite that any LogStore + StableStore implementation
    /// should pass. Persistent stores reuse it via setup().
    pub trait TestSuite<S: LogStore + StableStore> {
        fn setup() -> S;

        fn test() {
            Self::test_empty();
            Self::test_store_and_get();
            Self::test_delete_range();
            Self::test_stable();
        }

        fn test_empty() {
            let s = Self::setup();
            assert_eq!(s.first_index().unwrap(), 0);
            assert_eq!(s.last_index().unwrap(), 0);
            assert_eq!(s.get_log(1), Err(Error::NotFound));
        }

        fn test_store_and_get() {
            let s = Self::setup();
            s.store_logs(&[entry(1, 1), entry(2, 1), entry(3, 2)]).unwrap();
            assert_eq!(s.first_index().unwrap(), 1);
            assert_eq!(s.last_index().unwrap(), 3);
            assert_eq!(s.get_log(2).unwrap(), entry(2, 1));
            assert_eq!(s.get_log(4), Err(Error::NotFound));

            // Overwriting an uncommitted suffix entry replaces it.
            s.store_logs(&[entry(3, 3)]).unwrap();
            assert_eq!(s.get_log(3).unwrap().term, 3);
        }

        fn test_delete_range() {
            let s = Self::setup();
            s.store_logs(&(1..=5).map(|i| entry(i, 1)).collect::<Vec<_>>()).unwrap();

            // Compaction from the front.
            s.delete_range(1, 3).unwrap();
            assert_eq!(s.first_index().unwrap(), 4);
            assert_eq!(s.last_index().unwrap(), 5);
            assert_eq!(s.get_log(3), Err(Error::NotFound));

            // Suffix truncation.
            s.delete_range(5, 5).unwrap();
            assert_eq!(s.last_index().unwrap(), 4);
        }

        fn test_stable() {
            let s = Self::setup();
            assert_eq!(StableStore::get(&s, b"missing"), Err(Error::NotFound));
            assert_eq!(s.get_u64(b"missing"), Err(Error::NotFound));

            s.set(b"cand", b"127.0.0.1:7000").unwrap();
            assert_eq!(StableStore::get(&s, b"cand").unwrap(), b"127.0.0.1:7000".to_vec());

            s.set_u64(b"term", 42).unwrap();
            assert_eq!(s.get_u64(b"term").unwrap(), 42);
            s.set_u64(b"term", 43).unwrap();
            assert_eq!(s.get_u64(b"term").unwrap(), 43);
        }
    }

    struct MemSuite;

    impl TestSuite<MemStore> for MemSuite {
        fn setup() -> MemStore {
            MemStore::new()
        }
    }

    #[test]
    fn suite() {
        MemSuite::test()
    }
}
