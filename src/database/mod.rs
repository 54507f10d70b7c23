//! Embedded ordered key-value store.
//!
//! Thin wrapper around `sled` exposing the handful of operations the
//! chain store and UTXO index need: point reads and writes, atomic
//! batches, and forward-ordered prefix scans.

use std::path::Path;
use std::thread;
use std::time::Duration;

pub use sled::Batch;
use sled::{Db, IVec};

use crate::error::{Error, Result};

/// How long to back off before retrying an open that lost the lock race.
const LOCK_RETRY_DELAY: Duration = Duration::from_millis(500);

pub struct Store {
    db: Db,
}

impl Store {
    /// Does a database already exist at `path`? Probes the engine's
    /// on-disk artifact rather than opening it.
    pub fn exists(path: &Path) -> bool {
        path.join("db").is_file()
    }

    /// Open (or create) the store at `path`.
    ///
    /// A lock held by a dead process is released by the engine's own
    /// recovery on open; a lock held by a live process makes the first
    /// attempt fail, so retry once and then surface `DbLocked`.
    pub fn open(path: &Path) -> Result<Self> {
        match sled::open(path) {
            Ok(db) => Ok(Self { db }),
            Err(first) if is_lock_error(&first) => {
                log::warn!("database at {} is locked, retrying once", path.display());
                thread::sleep(LOCK_RETRY_DELAY);
                match sled::open(path) {
                    Ok(db) => Ok(Self { db }),
                    Err(second) if is_lock_error(&second) => Err(Error::DbLocked),
                    Err(second) => Err(second.into()),
                }
            }
            Err(err) => Err(err.into()),
        }
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<IVec>> {
        Ok(self.db.get(key)?)
    }

    pub fn contains(&self, key: &[u8]) -> Result<bool> {
        Ok(self.db.contains_key(key)?)
    }

    pub fn insert(&self, key: &[u8], value: Vec<u8>) -> Result<()> {
        self.db.insert(key, value)?;
        Ok(())
    }

    pub fn remove(&self, key: &[u8]) -> Result<()> {
        self.db.remove(key)?;
        Ok(())
    }

    /// Apply a batch of writes atomically.
    pub fn apply_batch(&self, batch: Batch) -> Result<()> {
        self.db.apply_batch(batch)?;
        Ok(())
    }

    /// Forward-ordered scan over every key starting with `prefix`.
    pub fn scan_prefix(
        &self,
        prefix: &[u8],
    ) -> impl Iterator<Item = Result<(IVec, IVec)>> {
        self.db.scan_prefix(prefix).map(|kv| kv.map_err(Error::from))
    }

    /// Flush dirty buffers to disk. Called on shutdown.
    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}

fn is_lock_error(err: &sled::Error) -> bool {
    matches!(err, sled::Error::Io(io) if io.kind() == std::io::ErrorKind::WouldBlock)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn exists_probe_tracks_creation() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("blocks_test");
        assert!(!Store::exists(&path));
        let store = Store::open(&path).unwrap();
        store.insert(b"k", b"v".to_vec()).unwrap();
        store.flush().unwrap();
        assert!(Store::exists(&path));
    }

    #[test]
    fn prefix_scan_is_ordered_and_scoped() {
        let dir = TempDir::new().unwrap();
        let store = Store::open(&dir.path().join("db")).unwrap();
        store.insert(b"utxo-b", vec![2]).unwrap();
        store.insert(b"utxo-a", vec![1]).unwrap();
        store.insert(b"lh", vec![9]).unwrap();

        let keys: Vec<Vec<u8>> = store
            .scan_prefix(b"utxo-")
            .map(|kv| kv.unwrap().0.to_vec())
            .collect();
        assert_eq!(keys, vec![b"utxo-a".to_vec(), b"utxo-b".to_vec()]);
    }

    #[test]
    fn batch_applies_atomically() {
        let dir = TempDir::new().unwrap();
        let store = Store::open(&dir.path().join("db")).unwrap();
        let mut batch = Batch::default();
        batch.insert(b"a".as_slice(), b"1".as_slice());
        batch.insert(b"b".as_slice(), b"2".as_slice());
        store.apply_batch(batch).unwrap();
        assert!(store.contains(b"a").unwrap());
        assert!(store.contains(b"b").unwrap());
    }
}
