//! Header-chain generators.
use bitcoin::blockdata::block::BlockHeader;
use bitcoin::hash_types::{BlockHash, TxMerkleNode};

/// Difficulty bits low enough that any nonce satisfies proof-of-work,
/// matching the `regtest` network's minimum difficulty.
pub const EASY_BITS: u32 = 0x207fffff;

/// A deterministic, network-independent genesis header for tests.
pub fn genesis(time: u32) -> BlockHeader {
    BlockHeader {
        version: 1,
        prev_blockhash: BlockHash::default(),
        merkle_root: TxMerkleNode::default(),
        time,
        bits: EASY_BITS,
        nonce: 0,
    }
}

/// Extend `parent` with `n` headers, spaced a random 1-600 seconds apart and
/// always mined at [`EASY_BITS`] so proof-of-work validation always succeeds.
pub fn next_headers(rng: &fastrand::Rng, parent: &BlockHeader, n: usize) -> Vec<BlockHeader> {
    let mut headers = Vec::with_capacity(n);
    let mut prev = parent.block_hash();
    let mut time = parent.time;

    for _ in 0..n {
        time += 1 + rng.u32(0..600);
        let header = BlockHeader {
            version: 1,
            prev_blockhash: prev,
            merkle_root: TxMerkleNode::default(),
            time,
            bits: EASY_BITS,
            nonce: 0,
        };
        prev = header.block_hash();
        headers.push(header);
    }
    headers
}

/// Build a full `n`-block chain (genesis included) from a fixed seed, for
/// tests that want reproducible fixtures across runs.
pub fn chain(seed: u64, n: usize) -> Vec<BlockHeader> {
    let rng = fastrand::Rng::with_seed(seed);
    let genesis = genesis(1_600_000_000);
    let mut headers = vec![genesis];
    headers.extend(next_headers(&rng, &genesis, n.saturating_sub(1)));
    headers
}
