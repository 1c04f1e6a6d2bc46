//! Chunk cache: an LRU cache keyed by SHA-256 hashes of script source.
//!
//! The cache stores the engine's dumped bytecode indexed by a 32-byte SHA-256
//! digest of the corresponding source text, so spawning the same source many
//! times skips recompilation. Each runtime owns its own instance; nothing is
//! process-global.
//!
//! # Thread safety
//!
//! [`ChunkCache`] wraps its inner LRU cache in a `Mutex` so the spawn path
//! can be used from any thread.

use std::num::NonZeroUsize;
use std::sync::Mutex;

use lru::LruCache;
use sha2::{Digest, Sha256};

/// A 32-byte SHA-256 digest used as a cache key.
pub type ChunkKey = [u8; 32];

/// Compute the SHA-256 hash of `source` bytes and return it as a [`ChunkKey`].
pub fn chunk_key(source: &str) -> ChunkKey {
    let mut hasher = Sha256::new();
    hasher.update(source.as_bytes());
    hasher.finalize().into()
}

/// LRU cache mapping [`ChunkKey`] → dumped bytecode.
pub struct ChunkCache {
    inner: Mutex<LruCache<ChunkKey, Vec<u8>>>,
    capacity: usize,
}

impl ChunkCache {
    /// Create a cache holding at most `capacity` entries.
    ///
    /// `capacity` is clamped to a minimum of `1`; passing `0` is safe and
    /// behaves as though `capacity == 1`.
    pub fn new(capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity.max(1)).expect("capacity >= 1");
        Self {
            inner: Mutex::new(LruCache::new(cap)),
            capacity: capacity.max(1),
        }
    }

    /// Look up `key`, promoting the entry on a hit.
    pub fn get(&self, key: &ChunkKey) -> Option<Vec<u8>> {
        self.inner
            .lock()
            .expect("ChunkCache mutex poisoned")
            .get(key)
            .cloned()
    }

    /// Insert `key` → `bytecode`, evicting the least-recently-used entry if
    /// the cache is full.
    pub fn insert(&self, key: ChunkKey, bytecode: Vec<u8>) {
        self.inner
            .lock()
            .expect("ChunkCache mutex poisoned")
            .put(key, bytecode);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("ChunkCache mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_key_is_deterministic() {
        let a = chunk_key("send c 1");
        let b = chunk_key("send c 1");
        assert_eq!(a, b, "same input must always produce the same key");
        assert_ne!(a, chunk_key("send c 2"));
    }

    #[test]
    fn test_get_returns_none_on_miss() {
        let cache = ChunkCache::new(8);
        assert_eq!(cache.get(&chunk_key("missing")), None);
    }

    #[test]
    fn test_insert_then_get() {
        let cache = ChunkCache::new(8);
        let key = chunk_key("recv c");
        cache.insert(key, vec![1, 2, 3]);
        assert_eq!(cache.get(&key), Some(vec![1, 2, 3]));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_lru_eviction() {
        let cache = ChunkCache::new(2);
        let a = chunk_key("a");
        let b = chunk_key("b");
        let c = chunk_key("c");
        cache.insert(a, vec![1]);
        cache.insert(b, vec![2]);
        let _ = cache.get(&a); // b becomes least recently used
        cache.insert(c, vec![3]);
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get(&b), None, "b should have been evicted");
        assert!(cache.get(&a).is_some());
        assert!(cache.get(&c).is_some());
    }

    #[test]
    fn test_capacity_zero_treated_as_one() {
        let cache = ChunkCache::new(0);
        assert_eq!(cache.capacity(), 1);
        cache.insert(chunk_key("x"), vec![0]);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_overwrite_same_key_keeps_len() {
        let cache = ChunkCache::new(4);
        let key = chunk_key("same");
        cache.insert(key, vec![1]);
        cache.insert(key, vec![2]);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(&key), Some(vec![2]));
    }
}
