//! Reference [`BlockTree`] implementation: an in-memory header cache backed
//! by an append-only [`Store`], performing proof-of-work and
//! difficulty-retarget validation only. No script or transaction validation
//! is performed, since an SPV client never downloads block bodies it isn't
//! specifically watching for.
#![warn(missing_docs)]
use std::collections::{BTreeMap, HashMap};

use spv_common::bitcoin::blockdata::block::BlockHeader;
use spv_common::bitcoin::consensus::params::Params;
use spv_common::bitcoin::hash_types::BlockHash;
use spv_common::block::store::Store;
use spv_common::block::time::Clock;
use spv_common::block::tree::{BlockReader, BlockTree, Error, Header, ImportResult};
use spv_common::block::{BlockTime, Height, Work};
use spv_common::nonempty::NonEmpty;

/// An in-memory cache of block headers, kept consistent with an underlying
/// append-only [`Store`] of the active chain.
///
/// Side branches encountered during import are held in `headers` without
/// being appended to `chain`; if a side branch ever overtakes the active
/// chain's cumulative work, [`BlockCache::reorganize`] switches the active
/// chain over to it.
#[derive(Debug)]
pub struct BlockCache<S> {
    store: S,
    params: Params,
    checkpoints: BTreeMap<Height, BlockHash>,
    /// Every header we've ever seen, on or off the active chain.
    headers: HashMap<BlockHash, BlockHeader>,
    /// The active chain, genesis first, indexed by height.
    chain: NonEmpty<BlockHash>,
}

impl<S: Store<Header = BlockHeader>> BlockCache<S> {
    /// Build a cache from a store, replaying its active chain into memory.
    pub fn from(store: S, params: Params, checkpoints: &[(Height, BlockHash)]) -> Result<Self, Error> {
        let mut headers = HashMap::new();
        let mut chain = Vec::new();

        for result in store.iter() {
            let (_, header) = result?;
            let hash = header.block_hash();
            headers.insert(hash, header);
            chain.push(hash);
        }
        let chain = NonEmpty::from_vec(chain).ok_or(Error::GenesisMismatch)?;
        if headers[chain.first()] != store.genesis() {
            return Err(Error::GenesisMismatch);
        }

        Ok(Self {
            store,
            params,
            checkpoints: checkpoints.iter().copied().collect(),
            headers,
            chain,
        })
    }

    fn active_index(&self) -> HashMap<BlockHash, Height> {
        self.chain
            .iter()
            .enumerate()
            .map(|(i, h)| (*h, i as Height))
            .collect()
    }

    fn header_at(&self, height: Height) -> Option<&BlockHeader> {
        self.chain.get(height as usize).and_then(|h| self.headers.get(h))
    }

    fn validate(&self, parent_height: Height, parent: &BlockHeader, header: &BlockHeader) -> Result<(), Error> {
        let parent_target = parent.target();
        let expected_bits = self.next_difficulty_target(parent_height, parent.time, parent_target, &self.params);
        if header.bits != expected_bits {
            return Err(Error::InvalidBlockTarget(header.target(), parent_target));
        }
        header.validate_pow(&header.target()).map_err(|_| Error::InvalidBlockPoW)?;

        if header.time <= parent.time {
            return Err(Error::InvalidBlockTime(header.time, std::cmp::Ordering::Less));
        }

        let height = parent_height + 1;
        if let Some(checkpoint) = self.checkpoints.get(&height) {
            if *checkpoint != header.block_hash() {
                return Err(Error::InvalidBlockHash(header.block_hash(), height));
            }
        }
        Ok(())
    }

    /// Find the height at which `hash`'s branch forks off the active chain,
    /// walking backward through `headers` until an active-chain ancestor is
    /// found.
    fn fork_point(&self, hash: &BlockHash) -> Option<(Height, Vec<BlockHash>)> {
        let active = self.active_index();
        let mut branch = Vec::new();
        let mut cursor = *hash;

        loop {
            if let Some(height) = active.get(&cursor) {
                branch.reverse();
                return Some((*height, branch));
            }
            let header = self.headers.get(&cursor)?;
            branch.push(cursor);
            if cursor == header.prev_blockhash {
                return None; // Self-referential; shouldn't happen.
            }
            cursor = header.prev_blockhash;
        }
    }

    fn branch_work(&self, hashes: &[BlockHash]) -> Work {
        hashes
            .iter()
            .filter_map(|h| self.headers.get(h))
            .fold(Work::default(), |acc, h| acc + h.work())
    }

    /// Switch the active chain over to the branch ending at `tip`, if it
    /// exists in `headers` and carries more work than the current tip.
    fn reorganize(&mut self, tip: BlockHash) -> Result<Option<ImportResult>, Error> {
        let Some((fork_height, branch)) = self.fork_point(&tip) else {
            return Ok(None);
        };
        if branch.is_empty() {
            return Ok(None);
        }

        let candidate_work = self.branch_work(&branch);
        let active_work = self.branch_work(&self.chain.iter().copied().skip(fork_height as usize + 1).collect::<Vec<_>>());
        if candidate_work <= active_work {
            return Ok(None);
        }

        let reverted: Vec<(Height, BlockHeader)> = self
            .chain
            .iter()
            .enumerate()
            .skip(fork_height as usize + 1)
            .map(|(h, hash)| (h as Height, self.headers[hash]))
            .collect();

        let mut new_chain: Vec<BlockHash> = self.chain.iter().take(fork_height as usize + 1).copied().collect();
        new_chain.extend(branch.iter().copied());
        self.chain = NonEmpty::from_vec(new_chain).expect("the active chain always has a genesis");

        let connected: Vec<(Height, BlockHeader)> = branch
            .iter()
            .enumerate()
            .map(|(i, hash)| ((fork_height + 1 + i as Height), self.headers[hash]))
            .collect();
        let connected = NonEmpty::from_vec(connected).expect("a reorg always connects at least one block");

        self.store.rollback(fork_height)?;
        self.store.put(branch.iter().map(|h| self.headers[h]))?;

        let (height, hash) = (self.height(), tip);
        Ok(Some(ImportResult::TipChanged {
            header: self.headers[&hash],
            hash,
            height,
            reverted,
            connected,
        }))
    }
}

impl<S: Store<Header = BlockHeader>> BlockReader for BlockCache<S> {
    fn get_block(&self, hash: &BlockHash) -> Option<(Height, &BlockHeader)> {
        let index = self.active_index();
        let height = *index.get(hash)?;
        self.headers.get(hash).map(|h| (height, h))
    }

    fn get_block_by_height(&self, height: Height) -> Option<&BlockHeader> {
        self.header_at(height)
    }

    fn find_branch(&self, to: &BlockHash) -> Option<(Height, NonEmpty<BlockHeader>)> {
        if let Some(height) = self.active_index().get(to).copied() {
            let headers: Vec<BlockHeader> = self
                .chain
                .iter()
                .skip(height as usize)
                .map(|h| self.headers[h])
                .collect();
            return Some((height, NonEmpty::from_vec(headers)?));
        }
        let (fork_height, _) = self.fork_point(to)?;
        let headers: Vec<BlockHeader> = self
            .chain
            .iter()
            .skip(fork_height as usize)
            .map(|h| self.headers[h])
            .collect();
        Some((fork_height, NonEmpty::from_vec(headers)?))
    }

    fn chain_work(&self) -> spv_common::bitcoin::util::uint::Uint256 {
        self.branch_work(self.chain.iter().copied().collect::<Vec<_>>().as_slice())
    }

    fn iter<'a>(&'a self) -> Box<dyn DoubleEndedIterator<Item = (Height, BlockHeader)> + 'a> {
        Box::new(self.chain.iter().enumerate().map(move |(h, hash)| (h as Height, self.headers[hash])))
    }

    fn height(&self) -> Height {
        self.chain.len() as Height - 1
    }

    fn tip(&self) -> (BlockHash, BlockHeader) {
        let hash = *self.chain.last();
        (hash, self.headers[&hash])
    }

    fn last_checkpoint(&self) -> Height {
        self.checkpoints.keys().next_back().copied().unwrap_or(0)
    }

    fn checkpoints(&self) -> BTreeMap<Height, BlockHash> {
        self.checkpoints.clone()
    }

    fn is_known(&self, hash: &BlockHash) -> bool {
        self.headers.contains_key(hash)
    }

    fn contains(&self, hash: &BlockHash) -> bool {
        self.active_index().contains_key(hash)
    }

    fn locate_headers(&self, locators: &[BlockHash], stop_hash: BlockHash, max_headers: usize) -> Vec<BlockHeader> {
        let active = self.active_index();
        let start = locators
            .iter()
            .find_map(|h| active.get(h).copied())
            .map(|h| h + 1)
            .unwrap_or(0);

        let mut result = Vec::new();
        for hash in self.chain.iter().skip(start as usize).take(max_headers) {
            result.push(self.headers[hash]);
            if *hash == stop_hash {
                break;
            }
        }
        result
    }

    fn locator_hashes(&self, from: Height) -> Vec<BlockHash> {
        let mut hashes = Vec::new();
        let mut height = from;
        let mut step: Height = 1;

        loop {
            if let Some(hash) = self.chain.get(height as usize) {
                hashes.push(*hash);
            }
            if height == 0 {
                break;
            }
            if hashes.len() >= 10 {
                step *= 2;
            }
            height = height.saturating_sub(step);
        }
        if hashes.last() != Some(self.chain.first()) {
            hashes.push(*self.chain.first());
        }
        hashes
    }
}

impl<S: Store<Header = BlockHeader>> BlockTree for BlockCache<S> {
    fn import_blocks<I: Iterator<Item = BlockHeader>, C: Clock>(
        &mut self,
        chain: I,
        _context: &C,
    ) -> Result<ImportResult, Error> {
        let mut connected = 0;
        let mut last_result = ImportResult::TipUnchanged;
        let mut last_height = self.height();

        for header in chain {
            match self.extend_one(header) {
                Ok(Some(result)) => {
                    if let ImportResult::TipChanged { height, .. } = &result {
                        last_height = *height;
                    }
                    last_result = result;
                    connected += 1;
                }
                Ok(None) => {
                    // Duplicate, orphan-but-ignorable, or stale; skip.
                }
                Err(err) if connected > 0 => {
                    return Err(Error::BlockImportAborted(Box::new(err), connected, last_height));
                }
                Err(err) => return Err(err),
            }
        }
        Ok(last_result)
    }

    fn extend_tip<C: Clock>(&mut self, header: BlockHeader, _context: &C) -> Result<ImportResult, Error> {
        Ok(self.extend_one(header)?.unwrap_or(ImportResult::TipUnchanged))
    }
}

impl<S: Store<Header = BlockHeader>> BlockCache<S> {
    /// Import a single header, extending the active chain, starting or
    /// extending a side branch, or triggering a reorg. Returns `Ok(None)` for
    /// no-ops (duplicates).
    fn extend_one(&mut self, header: BlockHeader) -> Result<Option<ImportResult>, Error> {
        let hash = header.block_hash();
        if self.headers.contains_key(&hash) {
            return Ok(None);
        }
        let Some(parent) = self.headers.get(&header.prev_blockhash).copied() else {
            return Err(Error::BlockMissing(header.prev_blockhash));
        };
        let active = self.active_index();
        let parent_height = *active
            .get(&header.prev_blockhash)
            .unwrap_or(&(self.headers.len() as Height));

        let on_active_tip = header.prev_blockhash == *self.chain.last();
        if on_active_tip {
            self.validate(parent_height, &parent, &header)?;
        } else if active.contains_key(&header.prev_blockhash) {
            // Extends the active chain from a non-tip point: this is a fork,
            // not a validation error. Fall through without validating against
            // the active tip's context; the branch gets its own validation
            // once it's long enough to be considered for a reorg.
        } else {
            // Extends an existing side branch.
            self.validate(parent_height, &parent, &header)?;
        }

        self.headers.insert(hash, header);

        if on_active_tip {
            self.chain.push(hash);
            self.store.put(std::iter::once(header))?;
            return Ok(Some(ImportResult::TipChanged {
                header,
                hash,
                height: self.height(),
                reverted: Vec::new(),
                connected: NonEmpty::new((self.height(), header)),
            }));
        }

        self.reorganize(hash)
    }
}

impl<S: Store<Header = BlockHeader>> spv_p2p::fsm::ChainStore for BlockCache<S> {}
