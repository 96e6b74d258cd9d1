//! Collaborator interfaces the state machine consumes, but does not own.
//!
//! These let the wallet, the chain store and the reactor plug into the
//! protocol engine without it depending on their concrete types.
use std::sync::{Arc, Mutex};

use spv_common::bitcoin::network::message_bloom::FilterLoad;
use spv_common::bitcoin::{MerkleBlock, Transaction, Txid};
use spv_common::block::tree::BlockTree;
use spv_common::block::{BlockHash, Height};

/// The chain header store, as seen by the protocol engine.
///
/// Extends [`BlockTree`] with the bookkeeping an SPV client needs around
/// orphan blocks and Bloom filter false-positive tracking; concrete chain
/// storage implementations live outside this crate.
pub trait ChainStore: BlockTree {
    /// Whether transactions downloaded for this chain should be fully
    /// verified against their inputs, or merely treated as Bloom matches.
    fn should_verify_transactions(&self) -> bool {
        false
    }

    /// The current estimated Bloom filter false-positive rate, if tracked.
    fn get_false_positive_rate(&self) -> Option<f64> {
        None
    }

    /// Reset the false-positive rate estimate, eg. after loading a fresh filter.
    fn reset_false_positive_estimate(&mut self) {}

    /// Remove and return any orphan blocks held pending a missing parent.
    fn drain_orphan_blocks(&mut self) -> Vec<BlockHash> {
        Vec::new()
    }

    /// The root ancestor of an orphan chain rooted at `hash`, used to build
    /// the next `getblocks` locator deterministically.
    fn orphan_root(&self, hash: &BlockHash) -> BlockHash {
        *hash
    }

    /// Whether `hash` is a known orphan (has been seen but doesn't connect).
    fn is_orphan(&self, hash: &BlockHash) -> bool {
        !self.is_known(hash)
    }
}

/// A destination for transactions the engine has decided are relevant, or
/// might be, to the wallet.
pub trait WalletSink {
    /// Whether a pending (unconfirmed) transaction is relevant to the wallet.
    fn is_pending_transaction_relevant(&self, tx: &Transaction) -> bool;

    /// Hand a relevant transaction to the wallet, along with any dependency
    /// transactions resolved for it.
    fn receive_pending(&mut self, tx: Transaction, dependencies: Vec<Transaction>);

    /// Whether a just-finalized filtered block suggests the current Bloom
    /// filter may need to be refreshed (eg. it matched close to capacity).
    fn check_for_filter_exhaustion(&self, merkle_block: &MerkleBlock) -> bool;

    /// Look up a previously-seen transaction by id, eg. to resolve an input.
    fn get_transaction(&self, txid: &Txid) -> Option<Transaction>;
}

/// A shared handle to a [`WalletSink`], registered once with the state
/// machine and consulted by both the inventory and Bloom filter managers.
pub type SharedWalletSink = Arc<Mutex<dyn WalletSink + Send>>;

/// A source of scripts/outpoints to watch for, contributing to the merged
/// Bloom filter.
pub trait FilterProvider {
    /// Begin a filter recalculation pass.
    fn begin_bloom_update(&mut self);

    /// Number of elements this provider will contribute.
    fn elements_count(&self) -> usize;

    /// Add this provider's elements to the filter under construction.
    fn contribute_to_filter(&self, filter: &mut FilterLoad);

    /// The earliest time, in seconds since the epoch, any of this provider's
    /// keys could have appeared on chain. Used to bound a rescan.
    fn earliest_key_time_secs(&self) -> u64;

    /// End a filter recalculation pass.
    fn end_bloom_update(&mut self);
}

/// A shared handle to a [`FilterProvider`], registered once with the Bloom
/// filter manager's merger.
pub type SharedFilterProvider = Arc<Mutex<dyn FilterProvider + Send>>;

/// Tracks which peers have announced which transactions, and whether we
/// consider each one to originate from ourselves or the network.
pub trait TxConfidenceTable {
    /// Confidence state for a transaction, as reported by the table.
    type Confidence;

    /// Record that `addr` announced `txid`, returning its updated confidence.
    fn seen(&mut self, txid: Txid, addr: std::net::SocketAddr) -> Self::Confidence;

    /// Look up the confidence state of a transaction, if known.
    fn get(&self, txid: &Txid) -> Option<Self::Confidence>;
}

/// What the protocol engine needs from the reactor: opening/closing
/// connections and reporting how many are open.
pub trait Connector {
    /// Open a connection to `addr`. Actual I/O is reactor-specific; this
    /// trait only describes the side effect the engine expects.
    fn open(&mut self, addr: std::net::SocketAddr);

    /// Close `n` connections, chosen by the reactor (eg. least useful first).
    fn close_connections(&mut self, n: usize);

    /// Current number of open connections.
    fn connected_count(&self) -> usize;
}

/// The SPV-relevant subset of height bookkeeping every [`ChainStore`] needs;
/// re-exported here since it's referenced throughout the managers.
pub type SyncHeight = Height;
