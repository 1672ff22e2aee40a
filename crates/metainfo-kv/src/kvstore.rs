//! Key-value store contract and the in-memory backend.
//!
//! The contract is deliberately small: point get/put/delete, an ordered key scan
//! starting at a given key, and close. Pointer listing on the coordinator side is
//! built entirely on top of `list`.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use crate::error::KvError;

/// Key type for the KV store.
pub type Key = Vec<u8>;
/// Value type for the KV store.
pub type Value = Vec<u8>;

/// Ordered key-value store used to persist pointer metadata.
///
/// Implementations must be safe to share between threads. Keys are ordered
/// lexicographically by their raw bytes.
pub trait KvStore: Send + Sync {
    /// Get the value stored under `key`. Fails with `KeyNotFound` if absent.
    fn get(&self, key: &[u8]) -> Result<Value, KvError>;

    /// Put a key-value pair. Overwrites any existing value.
    fn put(&self, key: Key, value: Value) -> Result<(), KvError>;

    /// Delete a key. Returns Ok(()) even if the key didn't exist.
    fn delete(&self, key: &[u8]) -> Result<(), KvError>;

    /// List keys greater than or equal to `start` in ascending order.
    ///
    /// `start = None` begins at the first key. `limit = 0` returns every key.
    fn list(&self, start: Option<&[u8]>, limit: usize) -> Result<Vec<Key>, KvError>;

    /// Close the store. Every later call fails with `KvError::Closed`.
    fn close(&self) -> Result<(), KvError>;
}

pub(crate) fn check_key(key: &[u8]) -> Result<(), KvError> {
    if key.is_empty() {
        return Err(KvError::EmptyKey);
    }
    Ok(())
}

pub(crate) fn scan_keys(
    data: &BTreeMap<Key, Value>,
    start: Option<&[u8]>,
    limit: usize,
) -> Vec<Key> {
    let lower = match start {
        Some(s) => Bound::Included(s.to_vec()),
        None => Bound::Unbounded,
    };
    let iter = data
        .range::<Vec<u8>, _>((lower, Bound::Unbounded))
        .map(|(k, _)| k.clone());
    if limit == 0 {
        iter.collect()
    } else {
        iter.take(limit).collect()
    }
}

/// In-memory KV store backed by a BTreeMap. Thread-safe via RwLock.
///
/// Does not persist data across restarts; see [`crate::FileKvStore`] for that.
pub struct MemoryKvStore {
    data: Arc<RwLock<BTreeMap<Key, Value>>>,
    closed: AtomicBool,
}

impl MemoryKvStore {
    /// Creates a new empty in-memory KV store.
    pub fn new() -> Self {
        Self {
            data: Arc::new(RwLock::new(BTreeMap::new())),
            closed: AtomicBool::new(false),
        }
    }

    /// Number of stored keys.
    pub fn len(&self) -> Result<usize, KvError> {
        self.ensure_open()?;
        let data = self
            .data
            .read()
            .map_err(|e| KvError::Poisoned(e.to_string()))?;
        Ok(data.len())
    }

    /// Returns true if the store holds no keys.
    pub fn is_empty(&self) -> Result<bool, KvError> {
        Ok(self.len()? == 0)
    }

    fn ensure_open(&self) -> Result<(), KvError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(KvError::Closed);
        }
        Ok(())
    }
}

impl Default for MemoryKvStore {
    fn default() -> Self {
        Self::new()
    }
}

impl KvStore for MemoryKvStore {
    fn get(&self, key: &[u8]) -> Result<Value, KvError> {
        self.ensure_open()?;
        check_key(key)?;
        let data = self
            .data
            .read()
            .map_err(|e| KvError::Poisoned(e.to_string()))?;
        data.get(key)
            .cloned()
            .ok_or_else(|| KvError::KeyNotFound(key.to_vec()))
    }

    fn put(&self, key: Key, value: Value) -> Result<(), KvError> {
        self.ensure_open()?;
        check_key(&key)?;
        let mut data = self
            .data
            .write()
            .map_err(|e| KvError::Poisoned(e.to_string()))?;
        data.insert(key, value);
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<(), KvError> {
        self.ensure_open()?;
        check_key(key)?;
        let mut data = self
            .data
            .write()
            .map_err(|e| KvError::Poisoned(e.to_string()))?;
        data.remove(key);
        Ok(())
    }

    fn list(&self, start: Option<&[u8]>, limit: usize) -> Result<Vec<Key>, KvError> {
        self.ensure_open()?;
        let data = self
            .data
            .read()
            .map_err(|e| KvError::Poisoned(e.to_string()))?;
        Ok(scan_keys(&data, start, limit))
    }

    fn close(&self) -> Result<(), KvError> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}
