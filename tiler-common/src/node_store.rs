//! Disk-backed LRU-ish cache of serialized node payloads, shared by every
//! worker thread between processing rounds. Spilling is explicit and
//! byte-budgeted rather than left to the allocator: the NodeStore is the
//! one place that decides which nodes are "hot" right now.

use crate::geometry::name::NodeName;
use crate::lru_cache::lru::Lru;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

struct Inner {
    lru: Lru<NodeName, Vec<u8>>,
    bytes_in_memory: usize,
}

/// Backing store for serialized node payloads.
///
/// `get`/`put`/`remove` are safe to call from any worker thread: the
/// dispatcher guarantees a node is never concurrently owned by two workers,
/// so the only contention here is on the bookkeeping mutex itself, not on
/// logical node ownership.
pub struct NodeStore {
    inner: Mutex<Inner>,
    working_dir: PathBuf,
}

impl NodeStore {
    pub fn new(working_dir: impl Into<PathBuf>) -> Self {
        NodeStore {
            inner: Mutex::new(Inner {
                lru: Lru::new(),
                bytes_in_memory: 0,
            }),
            working_dir: working_dir.into(),
        }
    }

    fn spill_path(&self, name: &NodeName) -> PathBuf {
        name.sharded_path(&self.working_dir, "bin")
    }

    /// Stores `bytes` under `name`, marking it most-recently-used.
    pub fn put(&self, name: NodeName, bytes: Vec<u8>) {
        let mut inner = self.inner.lock().unwrap();
        inner.bytes_in_memory += bytes.len();
        if let Some(old) = inner.lru.insert(name, bytes) {
            inner.bytes_in_memory -= old.len();
        }
    }

    /// Returns the bytes stored under `name`, marking it most-recently-used.
    /// Falls back to disk (and re-admits the result to the in-memory LRU)
    /// if the entry had previously been spilled.
    pub fn get(&self, name: &NodeName) -> io::Result<Option<Vec<u8>>> {
        {
            let mut inner = self.inner.lock().unwrap();
            if let Some(bytes) = inner.lru.touch(name) {
                return Ok(Some(bytes.clone()));
            }
        }
        let path = self.spill_path(name);
        if !path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(&path)?;
        let mut inner = self.inner.lock().unwrap();
        inner.bytes_in_memory += bytes.len();
        inner.lru.insert(name.clone(), bytes.clone());
        Ok(Some(bytes))
    }

    /// Drops `name` from both memory and disk.
    pub fn remove(&self, name: &NodeName) -> io::Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(bytes) = inner.lru.remove(name) {
            inner.bytes_in_memory -= bytes.len();
        }
        drop(inner);
        let path = self.spill_path(name);
        if path.exists() {
            fs::remove_file(&path)?;
        }
        Ok(())
    }

    /// While the in-memory byte counter exceeds `max_bytes`, spills the
    /// least-recently-used entry to its sharded path under `working_dir`.
    pub fn control_memory(&self, max_bytes: usize) -> io::Result<()> {
        loop {
            let victim = {
                let inner = self.inner.lock().unwrap();
                if inner.bytes_in_memory <= max_bytes {
                    return Ok(());
                }
                inner.lru.iter().next().map(|(k, _)| k.clone())
            };
            let Some(name) = victim else {
                return Ok(());
            };
            let bytes = {
                let mut inner = self.inner.lock().unwrap();
                inner.lru.remove(&name)
            };
            let Some(bytes) = bytes else { continue };
            {
                let mut inner = self.inner.lock().unwrap();
                inner.bytes_in_memory -= bytes.len();
            }
            let path = self.spill_path(&name);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&path, &bytes)?;
        }
    }

    pub fn bytes_in_memory(&self) -> usize {
        self.inner.lock().unwrap().bytes_in_memory
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_then_get_is_byte_identical() {
        let dir = tempdir();
        let store = NodeStore::new(dir.path());
        let name = NodeName::from_digits(&[1, 2, 3]);
        store.put(name.clone(), vec![1, 2, 3, 4]);
        assert_eq!(store.get(&name).unwrap(), Some(vec![1, 2, 3, 4]));
    }

    #[test]
    fn get_after_spill_returns_same_bytes() {
        let dir = tempdir();
        let store = NodeStore::new(dir.path());
        let name = NodeName::from_digits(&[4, 5]);
        store.put(name.clone(), vec![9; 100]);
        store.control_memory(0).unwrap();
        assert_eq!(store.bytes_in_memory(), 0);
        assert_eq!(store.get(&name).unwrap(), Some(vec![9; 100]));
    }

    #[test]
    fn remove_clears_memory_and_disk() {
        let dir = tempdir();
        let store = NodeStore::new(dir.path());
        let name = NodeName::from_digits(&[7]);
        store.put(name.clone(), vec![1]);
        store.control_memory(0).unwrap();
        store.remove(&name).unwrap();
        assert_eq!(store.get(&name).unwrap(), None);
    }

    fn tempdir() -> TempDir {
        TempDir::new()
    }

    struct TempDir(PathBuf);

    impl TempDir {
        fn new() -> Self {
            let mut path = std::env::temp_dir();
            path.push(format!("tiler-test-{}", std::process::id()));
            path.push(format!("{:p}", &path as *const _));
            fs::create_dir_all(&path).unwrap();
            TempDir(path)
        }

        fn path(&self) -> &Path {
            &self.0
        }
    }

    impl Drop for TempDir {
        fn drop(&mut self) {
            let _ = fs::remove_dir_all(&self.0);
        }
    }
}
