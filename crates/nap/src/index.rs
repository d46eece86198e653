// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The backing index the cache sits in front of.

use std::sync::Arc;

use bytes::Bytes;
use hashbrown::HashMap;
use parking_lot::RwLock;
use xxhash_rust::xxh3::xxh3_64;

/// A key-value index that owns the authoritative copy of every key.
///
/// [`Nap`](crate::Nap) forwards operations on cold keys to the backing index unchanged and writes
/// hot keys back into it when their epoch retires. Implementations must be safe to call from every
/// worker thread and from the cache's rotation thread at the same time.
///
/// # Examples
///
/// ```
/// use bytes::Bytes;
/// use nap::{BackingIndex, MemoryIndex};
///
/// let index = MemoryIndex::new();
/// index.put(b"key", b"value", false);
/// assert_eq!(index.get(b"key"), Some(Bytes::from_static(b"value")));
///
/// index.del(b"key");
/// assert_eq!(index.get(b"key"), None);
/// ```
pub trait BackingIndex: Send + Sync + 'static {
    /// Stores `value` under `key`.
    ///
    /// `is_update` tells the index whether the caller believes the key already exists, which lets
    /// indexes that distinguish inserts from updates skip a lookup. The cache always passes `true`
    /// when writing back hot keys.
    fn put(&self, key: &[u8], value: &[u8], is_update: bool);

    /// Returns the value stored under `key`, if any.
    fn get(&self, key: &[u8]) -> Option<Bytes>;

    /// Removes `key`. Removing an absent key is not an error.
    fn del(&self, key: &[u8]);
}

impl<T: BackingIndex + ?Sized> BackingIndex for Arc<T> {
    fn put(&self, key: &[u8], value: &[u8], is_update: bool) {
        (**self).put(key, value, is_update);
    }

    fn get(&self, key: &[u8]) -> Option<Bytes> {
        (**self).get(key)
    }

    fn del(&self, key: &[u8]) {
        (**self).del(key);
    }
}

/// Cache line size for shard alignment.
const CACHE_LINE_SIZE: usize = 64;

const DEFAULT_SHARDS: usize = 64;

/// One independently locked part of a [`MemoryIndex`].
///
/// Aligned to the CPU cache line, with explicit padding so that the lock of the next shard resides
/// on a different line.
#[repr(align(64))]
#[derive(Debug)]
struct IndexShard {
    map: RwLock<HashMap<Vec<u8>, Bytes>>,
    _pad: [u8; CACHE_LINE_SIZE],
}

impl IndexShard {
    fn new() -> Self {
        Self {
            map: RwLock::new(HashMap::new()),
            _pad: [0; CACHE_LINE_SIZE],
        }
    }
}

/// A sharded in-memory [`BackingIndex`].
///
/// Useful as a reference implementation and for exercising the cache without an external store.
/// Keys are spread over independently locked shards by hash.
#[derive(Debug)]
pub struct MemoryIndex {
    shards: Box<[IndexShard]>,
}

impl MemoryIndex {
    /// Creates an empty index with the default number of shards.
    #[must_use]
    pub fn new() -> Self {
        Self::with_shards(DEFAULT_SHARDS)
    }

    /// Creates an empty index with `shards` shards.
    ///
    /// # Panics
    ///
    /// Panics if `shards` is zero.
    #[must_use]
    pub fn with_shards(shards: usize) -> Self {
        assert!(shards > 0, "a memory index needs at least one shard");
        Self {
            shards: (0..shards).map(|_| IndexShard::new()).collect(),
        }
    }

    /// Returns the number of keys stored.
    ///
    /// Takes every shard's read lock in turn.
    #[must_use]
    pub fn len(&self) -> usize {
        self.shards.iter().map(|shard| shard.map.read().len()).sum()
    }

    /// Returns `true` if no key is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.shards.iter().all(|shard| shard.map.read().is_empty())
    }

    fn shard(&self, key: &[u8]) -> &IndexShard {
        #[expect(clippy::cast_possible_truncation, reason = "the remainder is below the shard count")]
        let index = (xxh3_64(key) % self.shards.len() as u64) as usize;
        &self.shards[index]
    }
}

impl Default for MemoryIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl BackingIndex for MemoryIndex {
    fn put(&self, key: &[u8], value: &[u8], _is_update: bool) {
        self.shard(key)
            .map
            .write()
            .insert(key.to_vec(), Bytes::copy_from_slice(value));
    }

    fn get(&self, key: &[u8]) -> Option<Bytes> {
        self.shard(key).map.read().get(key).cloned()
    }

    fn del(&self, key: &[u8]) {
        self.shard(key).map.write().remove(key);
    }
}
