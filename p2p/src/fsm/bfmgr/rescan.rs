//! Blockchain (re-)scanning for matching bloom filters.

use std::collections::BTreeSet;
use std::ops::RangeInclusive;
use std::rc::Rc;

use spv_common::bitcoin::{Script, Txid};
use spv_common::block::tree::BlockReader;
use spv_common::block::{BlockHash, Height, MerkleBlock};
use spv_common::collections::{HashMap, HashSet};

use super::{Event, FilterCache, HeightIterator};

/// Bloom filter (re)scan state.
#[derive(Debug, Default)]
pub struct Rescan {
    /// Whether a rescan is currently in progress.
    pub active: bool,
    /// Current height up to which merkle blocks have been scanned.
    /// Always between `start` and `end`.
    pub current: Height,
    /// Start height of the rescan.
    pub start: Height,
    /// End height of the rescan. If `None`, keeps scanning new blocks until stopped.
    pub end: Option<Height>,
    /// Merkle block cache.
    pub cache: FilterCache<Rc<MerkleBlock>>,
    /// Scripts to watch for.
    pub watch: HashSet<Script>,
    /// Transactions being watched, by the scripts that would confirm them.
    pub transactions: HashMap<Txid, HashSet<Script>>,

    /// Heights requested and not yet received.
    requested: BTreeSet<Height>,
    /// Received merkle blocks waiting to be matched, in height order.
    received: HashMap<Height, (Rc<MerkleBlock>, BlockHash, bool)>,
}

impl Rescan {
    /// Create a new rescan state with the given merkle block cache capacity, in bytes.
    pub fn new(cache: usize) -> Self {
        let cache = FilterCache::new(cache);

        Self {
            cache,
            ..Self::default()
        }
    }

    /// Start or restart a rescan. Resets the request state.
    pub fn restart(&mut self, start: Height, end: Option<Height>) {
        self.active = true;
        self.start = start;
        self.current = start;
        self.end = end;
        self.requested.clear();
    }

    /// Human-readable rescan progress, for logging.
    pub fn info(&self) -> String {
        format!(
            "rescan current = {}, watch = {}, txs = {}, merkle block queue = {}, requested = {}",
            self.current,
            self.watch.len(),
            self.transactions.len(),
            self.received.len(),
            self.requested.len()
        )
    }

    /// Clear requested heights, allowing requests to be re-issued.
    pub fn reset(&mut self) {
        self.requested.clear();
    }

    /// Roll the cache back to `to`, dropping anything cached above it.
    pub fn rollback(&mut self, to: Height) {
        self.cache.rollback(to)
    }

    /// Record a received merkle block. Returns `true` if it had been requested.
    pub fn received(&mut self, height: Height, merkle_block: MerkleBlock, block_hash: BlockHash) -> bool {
        let requested = self.requested.remove(&height);
        if requested {
            // Reference-counted since the same block can live in both the
            // cache and the processing queue at once.
            let merkle_block = Rc::new(merkle_block);

            self.cache.push(height, merkle_block.clone());
            self.received.insert(height, (merkle_block, block_hash, false));
        }
        requested
    }

    /// Process merkle blocks in the queue that are next in line by height,
    /// matching them against the watch-list and emitting the corresponding events.
    pub fn process(&mut self) -> (Vec<(Height, BlockHash)>, Vec<Event>, Height) {
        let mut events = Vec::new();
        let mut block_matches = Vec::new();
        let mut current = self.current;
        let old = current;

        while let Some((merkle_block, block_hash, cached)) = self.received.remove(&current) {
            let mut matches = Vec::new();
            let mut indexes = Vec::new();
            let _ = merkle_block.extract_matches(&mut matches, &mut indexes);
            let matched = !matches.is_empty();

            if matched {
                block_matches.push((current, block_hash));
            }
            let merkle_block = merkle_block.as_ref().clone();
            events.push(Event::MerkleBlockProcessed {
                height: current,
                matches,
                matched,
                cached,
                merkle_block,
            });
            current += 1;
        }
        self.current = current;

        if let Some(stop) = self.end {
            if self.current == stop {
                self.active = false;
                events.push(Event::MerkleBlockRescanStopped { height: stop });
            }
        }

        (block_matches, events, current - old)
    }

    /// Given a range of heights, return the sub-ranges that still need to be
    /// requested from peers, skipping heights already cached, requested, or
    /// queued for processing.
    pub fn requests<T: BlockReader>(
        &mut self,
        range: RangeInclusive<Height>,
        tree: &T,
    ) -> Vec<RangeInclusive<Height>> {
        if range.is_empty() {
            return vec![];
        }
        for height in range.clone() {
            if let Some(merkle_block) = self.cache.get(&height) {
                if let Some(header) = tree.get_block_by_height(height) {
                    let block_hash = header.block_hash();
                    self.received.insert(height, (merkle_block.clone(), block_hash, true));
                }
            }
        }
        let mut skip: BTreeSet<Height> = BTreeSet::new();
        skip.extend(self.received.keys().cloned());
        skip.extend(&self.requested);

        let mut ranges: Vec<RangeInclusive<Height>> = Vec::new();
        for height in range.collect::<BTreeSet<_>>().difference(&skip) {
            if let Some(r) = ranges.last_mut() {
                if *height == r.end() + 1 {
                    *r = *r.start()..=r.end() + 1;
                    continue;
                }
            }
            ranges.push(*height..=*height);
        }

        // Limit the requested ranges to a manageable chunk size per `getdata`.
        let ranges: Vec<RangeInclusive<Height>> = ranges
            .into_iter()
            .flat_map(|r| HeightIterator {
                start: *r.start(),
                stop: *r.end(),
                step: 25_000 as Height,
            })
            .collect();

        for range in &ranges {
            self.requested.extend(range.clone());
        }
        ranges
    }
}
