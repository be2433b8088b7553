//! Storage boundary for channel logs.
//!
//! The log layer only needs an ordered key-value store with prefix scans.
//! [`MemStore`] is the in-memory implementation used by default and in
//! tests; durable backends can plug in through [`KvStore`] without the log
//! layer changing.

use std::{
    collections::BTreeMap,
    fmt,
    sync::{Arc, Mutex},
};

/// Error from the storage backend.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The backend failed on a read or write.
    #[error("storage i/o: {0}")]
    Io(#[from] std::io::Error),
    /// A stored record could not be decoded.
    #[error("corrupt record: {0}")]
    Corrupt(String),
}

/// Ordered key-value store.
///
/// Keys are opaque byte strings ordered lexicographically. Implementations
/// must be safe to share across tasks; a store belongs to a single client
/// at a time.
pub trait KvStore: Send + Sync + fmt::Debug + 'static {
    /// Store `value` under `key`, replacing any previous value.
    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError>;

    /// Get the value stored under `key`.
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError>;

    /// All records whose key starts with `prefix`, in key order.
    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError>;
}

/// In-memory [`KvStore`] backed by a [`BTreeMap`].
#[derive(Debug, Clone, Default)]
pub struct MemStore {
    inner: Arc<Mutex<BTreeMap<Vec<u8>, Vec<u8>>>>,
}

impl MemStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvStore for MemStore {
    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("poisoned");
        inner.insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let inner = self.inner.lock().expect("poisoned");
        Ok(inner.get(key).cloned())
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
        let inner = self.inner.lock().expect("poisoned");
        Ok(inner
            .range(prefix.to_vec()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_get_scan() {
        let store = MemStore::new();
        store.put(b"log/a/0", b"zero").unwrap();
        store.put(b"log/a/1", b"one").unwrap();
        store.put(b"log/b/0", b"other").unwrap();

        assert_eq!(store.get(b"log/a/0").unwrap().as_deref(), Some(&b"zero"[..]));
        assert_eq!(store.get(b"log/a/2").unwrap(), None);

        let scanned = store.scan_prefix(b"log/a/").unwrap();
        assert_eq!(scanned.len(), 2);
        assert_eq!(scanned[0].1, b"zero");
        assert_eq!(scanned[1].1, b"one");
    }

    #[test]
    fn scan_is_key_ordered() {
        let store = MemStore::new();
        store.put(b"k/02", b"b").unwrap();
        store.put(b"k/01", b"a").unwrap();
        store.put(b"k/10", b"c").unwrap();
        let keys: Vec<_> = store
            .scan_prefix(b"k/")
            .unwrap()
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        assert_eq!(keys, vec![b"k/01".to_vec(), b"k/02".to_vec(), b"k/10".to_vec()]);
    }
}
