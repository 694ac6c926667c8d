//! # Local Store
//!
//! The node-local key → bytes mapping. Every connection handler on a node
//! shares one `LocalStore`; it is backed by a sharded concurrent map so
//! handlers never wait on a single global lock.
//!
//! Values are immutable `Arc<[u8]>` buffers. A PUT replaces the whole slot, so
//! a reader racing a writer on the same key sees either the old buffer or the
//! new one, never a mix of both.

use std::sync::Arc;

use dashmap::DashMap;

/// Concurrent in-memory object map.
#[derive(Debug, Default)]
pub struct LocalStore {
    objects: DashMap<String, Arc<[u8]>>,
}

impl LocalStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `payload` under `key`, returning the value it replaced.
    pub fn put(&self, key: impl Into<String>, payload: impl Into<Arc<[u8]>>) -> Option<Arc<[u8]>> {
        self.objects.insert(key.into(), payload.into())
    }

    /// Fetch the current buffer for `key`.
    ///
    /// The returned `Arc` stays valid after the shard lock is released, so the
    /// caller can write it to a socket without blocking other handlers.
    pub fn get(&self, key: &str) -> Option<Arc<[u8]>> {
        self.objects.get(key).map(|entry| Arc::clone(entry.value()))
    }

    /// Remove `key`. Returns whether it was present.
    pub fn delete(&self, key: &str) -> bool {
        self.objects.remove(key).is_some()
    }

    /// Every key currently stored, in no particular order.
    pub fn list_local(&self) -> Vec<String> {
        self.objects.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.objects.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Sum of stored payload sizes.
    pub fn total_bytes(&self) -> usize {
        self.objects.iter().map(|entry| entry.value().len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_get() {
        let store = LocalStore::new();
        assert!(store.put("a", vec![1u8, 2, 3]).is_none());
        assert_eq!(store.get("a").as_deref(), Some(&[1u8, 2, 3][..]));
        assert!(store.get("missing").is_none());
    }

    #[test]
    fn test_overwrite_returns_previous() {
        let store = LocalStore::new();
        store.put("a", vec![1u8]);
        let previous = store.put("a", vec![2u8]).unwrap();
        assert_eq!(&previous[..], &[1u8]);
        assert_eq!(store.get("a").as_deref(), Some(&[2u8][..]));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_delete_is_idempotent() {
        let store = LocalStore::new();
        store.put("a", Vec::<u8>::new());
        assert!(store.contains("a"));
        assert!(store.delete("a"));
        assert!(!store.delete("a"));
        assert!(store.is_empty());
    }

    #[test]
    fn test_list_and_sizes() {
        let store = LocalStore::new();
        store.put("x", vec![0u8; 10]);
        store.put("y", vec![0u8; 5]);
        let mut keys = store.list_local();
        keys.sort();
        assert_eq!(keys, vec!["x", "y"]);
        assert_eq!(store.total_bytes(), 15);
    }

    #[test]
    fn test_reader_keeps_old_buffer_across_overwrite() {
        let store = LocalStore::new();
        store.put("k", vec![1u8; 4]);
        let held = store.get("k").unwrap();
        store.put("k", vec![2u8; 8]);
        assert_eq!(&held[..], &[1u8; 4]);
        assert_eq!(store.get("k").unwrap().len(), 8);
    }

    #[test]
    fn test_concurrent_distinct_keys() {
        let store = Arc::new(LocalStore::new());
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    for i in 0..100 {
                        store.put(format!("t{}-{}", t, i), vec![t as u8]);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(store.len(), 800);
    }
}
