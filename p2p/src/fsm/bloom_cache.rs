//! Bloom filter / merkle block cache.
use std::collections::BTreeMap;
use std::rc::Rc;

use spv_common::bitcoin::consensus::Encodable;
use spv_common::block::{Height, MerkleBlock};

/// Something that can be cached and whose size counts against a cache budget.
#[allow(clippy::len_without_is_empty)]
pub trait Filter: Eq + PartialEq {
    /// Length in bytes of the cached value.
    fn len(&self) -> usize;
}

impl Filter for Rc<MerkleBlock> {
    fn len(&self) -> usize {
        self.consensus_encode(&mut Vec::new()).unwrap()
    }
}

impl Filter for MerkleBlock {
    fn len(&self) -> usize {
        self.consensus_encode(&mut Vec::new()).unwrap()
    }
}

/// An in-memory, byte-size-bounded cache of merkle blocks, keyed by height.
/// Evicts the oldest entry whenever a push would exceed `capacity`.
#[derive(Debug)]
pub struct FilterCache<T: Filter> {
    cache: BTreeMap<Height, T>,
    size: usize,
    capacity: usize,
}

impl<T: Filter> Default for FilterCache<T> {
    fn default() -> Self {
        Self {
            cache: BTreeMap::new(),
            size: 0,
            capacity: 0,
        }
    }
}

impl<T: Filter> FilterCache<T> {
    /// Create a new cache with the given capacity, in bytes.
    pub fn new(capacity: usize) -> Self {
        Self {
            cache: BTreeMap::new(),
            size: 0,
            capacity,
        }
    }

    /// Total size, in bytes, of the cached entries.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Cache capacity, in bytes.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of entries in the cache.
    pub fn len(&self) -> usize {
        self.cache.len()
    }

    /// Whether the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    /// Insert an entry, evicting the oldest entries until back under capacity.
    /// Returns `false` without inserting if the entry alone exceeds capacity.
    pub fn push(&mut self, height: Height, filter: T) -> bool {
        assert!(self.size <= self.capacity);
        let size = filter.len();
        if size > self.capacity {
            return false;
        }

        self.cache.insert(height, filter);
        self.size += size;

        while self.size > self.capacity {
            if let Some(height) = self.cache.keys().cloned().next() {
                if let Some(filter) = self.cache.remove(&height) {
                    self.size -= filter.len();
                }
            }
        }
        true
    }

    /// Lowest cached height.
    pub fn start(&self) -> Option<Height> {
        self.cache.keys().next().copied()
    }

    /// Highest cached height.
    pub fn end(&self) -> Option<Height> {
        self.cache.keys().next_back().copied()
    }

    /// Iterate over cached entries, in height order.
    pub fn iter(&self) -> impl Iterator<Item = (&Height, &T)> {
        self.cache.iter()
    }

    /// Iterate over cached heights.
    pub fn heights(&self) -> impl Iterator<Item = Height> + '_ {
        self.cache.keys().copied()
    }

    /// Get the cached entry at `height`, if any.
    pub fn get(&self, height: &Height) -> Option<&T> {
        self.cache.get(height)
    }

    /// Drop every cached entry above `height`.
    pub fn rollback(&mut self, height: Height) {
        while let Some(h) = self.end() {
            if h > height {
                if let Some(k) = self.cache.keys().cloned().next_back() {
                    if let Some(filter) = self.cache.remove(&k) {
                        self.size -= filter.len();
                    }
                }
            } else {
                break;
            }
        }
    }
}
