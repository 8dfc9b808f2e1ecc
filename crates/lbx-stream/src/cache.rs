//! In-memory cache of decrypted chunks and whole objects.
//!
//! Bounded by entry count and, optionally, by total plaintext bytes.
//! Eviction takes the oldest-inserted chunk entry first; whole-object
//! entries are evicted only once no chunk entries remain.

use std::collections::{BTreeMap, HashMap};
use std::time::Instant;

use bytes::Bytes;
use lbx_core::config::CacheConfig;
use lbx_core::ObjectId;
use parking_lot::Mutex;
use tracing::debug;

/// What a cache entry holds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheKey {
    /// One decrypted chunk of a chunked object
    Chunk { object: ObjectId, index: u32 },
    /// A whole decrypted object
    Object(ObjectId),
}

impl CacheKey {
    pub fn chunk(object: ObjectId, index: u32) -> Self {
        CacheKey::Chunk { object, index }
    }

    pub fn object(&self) -> ObjectId {
        match self {
            CacheKey::Chunk { object, .. } => *object,
            CacheKey::Object(object) => *object,
        }
    }

    fn is_whole_object(&self) -> bool {
        matches!(self, CacheKey::Object(_))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub entries: usize,
    pub bytes: u64,
}

struct Entry {
    data: Bytes,
    seq: u64,
    touched: Instant,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<CacheKey, Entry>,
    // Insertion order per class, oldest first
    chunk_order: BTreeMap<u64, CacheKey>,
    object_order: BTreeMap<u64, CacheKey>,
    next_seq: u64,
    // Bumped by `remove_object`; loads started earlier must not repopulate
    generations: HashMap<ObjectId, u64>,
    bytes: u64,
    hits: u64,
    misses: u64,
    evictions: u64,
}

impl Inner {
    fn order_for(&mut self, key: &CacheKey) -> &mut BTreeMap<u64, CacheKey> {
        if key.is_whole_object() {
            &mut self.object_order
        } else {
            &mut self.chunk_order
        }
    }

    fn remove(&mut self, key: &CacheKey) -> Option<Entry> {
        let entry = self.entries.remove(key)?;
        self.order_for(key).remove(&entry.seq);
        self.bytes -= entry.data.len() as u64;
        Some(entry)
    }

    fn evict_one(&mut self) -> bool {
        let victim = self
            .chunk_order
            .first_key_value()
            .or_else(|| self.object_order.first_key_value())
            .map(|(_, key)| *key);
        match victim {
            Some(key) => {
                self.remove(&key);
                self.evictions += 1;
                debug!(?key, "cache entry evicted");
                true
            }
            None => false,
        }
    }
}

/// Shared, thread-safe decrypted-plaintext cache.
pub struct ChunkCache {
    inner: Mutex<Inner>,
    max_entries: usize,
    max_bytes: Option<u64>,
}

impl std::fmt::Debug for ChunkCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkCache")
            .field("max_entries", &self.max_entries)
            .field("max_bytes", &self.max_bytes)
            .field("stats", &self.stats())
            .finish()
    }
}

impl ChunkCache {
    pub fn new(max_entries: usize, max_bytes: Option<u64>) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            max_entries,
            max_bytes,
        }
    }

    pub fn from_config(cfg: &CacheConfig) -> Self {
        Self::new(cfg.max_entries, cfg.max_bytes)
    }

    pub fn get(&self, key: &CacheKey) -> Option<Bytes> {
        let mut inner = self.inner.lock();
        match inner.entries.get_mut(key) {
            Some(entry) => {
                entry.touched = Instant::now();
                let data = entry.data.clone();
                inner.hits += 1;
                Some(data)
            }
            None => {
                inner.misses += 1;
                None
            }
        }
    }

    /// Insert or replace an entry, evicting as needed.
    ///
    /// Returns `false` when the entry cannot fit at all (zero capacity, or
    /// larger than the byte bound); nothing is evicted in that case.
    pub fn put(&self, key: CacheKey, data: Bytes) -> bool {
        self.insert(key, data, None)
    }

    /// Removal generation of `object`; see [`put_if_current`](Self::put_if_current).
    pub fn generation(&self, object: &ObjectId) -> u64 {
        self.inner
            .lock()
            .generations
            .get(object)
            .copied()
            .unwrap_or(0)
    }

    /// [`put`](Self::put), unless `remove_object` ran for the key's object
    /// since `generation` was read.
    pub fn put_if_current(&self, key: CacheKey, data: Bytes, generation: u64) -> bool {
        self.insert(key, data, Some(generation))
    }

    fn insert(&self, key: CacheKey, data: Bytes, generation: Option<u64>) -> bool {
        let size = data.len() as u64;
        if self.max_entries == 0 || self.max_bytes.is_some_and(|max| size > max) {
            debug!(?key, bytes = size, "entry too large to cache");
            return false;
        }

        let mut inner = self.inner.lock();
        if let Some(expected) = generation {
            let current = inner.generations.get(&key.object()).copied().unwrap_or(0);
            if current != expected {
                debug!(?key, "object removed while loading, not cached");
                return false;
            }
        }
        inner.remove(&key);
        while inner.entries.len() >= self.max_entries
            || self
                .max_bytes
                .is_some_and(|max| inner.bytes + size > max)
        {
            if !inner.evict_one() {
                break;
            }
        }

        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.order_for(&key).insert(seq, key);
        inner.bytes += size;
        inner.entries.insert(
            key,
            Entry {
                data,
                seq,
                touched: Instant::now(),
            },
        );
        true
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.inner.lock().entries.contains_key(key)
    }

    pub fn remove(&self, key: &CacheKey) -> Option<Bytes> {
        self.inner.lock().remove(key).map(|entry| entry.data)
    }

    /// Drop every entry belonging to `object`. Returns how many were removed.
    ///
    /// Loads of `object` already running when this is called will not
    /// repopulate the cache through [`put_if_current`](Self::put_if_current).
    pub fn remove_object(&self, object: &ObjectId) -> usize {
        let mut inner = self.inner.lock();
        *inner.generations.entry(*object).or_insert(0) += 1;
        let keys: Vec<CacheKey> = inner
            .entries
            .keys()
            .filter(|key| key.object() == *object)
            .copied()
            .collect();
        for key in &keys {
            inner.remove(key);
        }
        keys.len()
    }

    /// Time since `key` was last read or written.
    pub fn idle_for(&self, key: &CacheKey) -> Option<std::time::Duration> {
        self.inner
            .lock()
            .entries
            .get(key)
            .map(|entry| entry.touched.elapsed())
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.chunk_order.clear();
        inner.object_order.clear();
        inner.bytes = 0;
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        CacheStats {
            hits: inner.hits,
            misses: inner.misses,
            evictions: inner.evictions,
            entries: inner.entries.len(),
            bytes: inner.bytes,
        }
    }
}
