//! A blocking facade over a running reactor.
//!
//! The protocol engine itself only exchanges [`Command`]s and [`Event`]s
//! through channels; [`Handle`] wraps the request/response half of that
//! exchange so library users get a call-and-wait API instead of juggling
//! channels directly.
use std::ops::Bound;
use std::sync::Arc;

use crossbeam_channel as chan;

use spv_common::bitcoin::network::address::Address;
use spv_common::bitcoin::network::constants::ServiceFlags;
use spv_common::bitcoin::network::message_bloom::FilterLoad;
use spv_common::bitcoin::{BlockHeader, Transaction, Txid};
use spv_common::block::tree::{self, ImportResult};
use spv_common::block::{BlockHash, Height};

use spv_p2p::fsm::{Command, Event, Peer};

use crate::Error;

/// Wakes the reactor's poll loop from another thread, so a freshly-sent
/// command is acted on without waiting out the current poll timeout.
pub type Waker = Arc<dyn Fn() -> Result<(), Error> + Send + Sync>;

/// A handle to a running reactor: send it commands, and listen for the
/// events it emits.
#[derive(Clone)]
pub struct Handle {
    commands: chan::Sender<Command>,
    events: chan::Receiver<Event>,
    waker: Waker,
}

impl Handle {
    /// Wrap an existing command/event channel pair with a waker.
    pub fn new(commands: chan::Sender<Command>, events: chan::Receiver<Event>, waker: Waker) -> Self {
        Self { commands, events, waker }
    }

    /// The channel on which the reactor publishes protocol events. Cloning a
    /// `Handle` clones this receiver too, so every clone sees every event.
    pub fn events(&self) -> &chan::Receiver<Event> {
        &self.events
    }

    fn send(&self, command: Command) -> Result<(), Error> {
        self.commands.send(command)?;
        self.waker.as_ref()()
    }

    /// Get the active chain's tip.
    pub fn get_tip(&self) -> Result<(Height, BlockHeader), Error> {
        let (tx, rx) = chan::bounded(1);
        self.send(Command::GetTip(tx))?;
        Ok(rx.recv()?)
    }

    /// Get the header at the given height on the active chain, if any.
    pub fn get_block_by_height(&self, height: Height) -> Result<Option<BlockHeader>, Error> {
        let (tx, rx) = chan::bounded(1);
        self.send(Command::GetBlockByHeight(height, tx))?;
        Ok(rx.recv()?)
    }

    /// Request a full block from peers, by hash.
    pub fn get_block(&self, hash: BlockHash) -> Result<(), Error> {
        self.send(Command::GetBlock(hash))
    }

    /// List connected peers offering at least the given services.
    pub fn get_peers(&self, required: ServiceFlags) -> Result<Vec<Peer>, Error> {
        let (tx, rx) = chan::bounded(1);
        self.send(Command::GetPeers(required, tx))?;
        Ok(rx.recv()?)
    }

    /// Start a Bloom-filtered merkle-block rescan between two heights.
    pub fn rescan(&self, from: Bound<Height>, to: Bound<Height>) -> Result<(), Error> {
        self.send(Command::Rescan { from, to })
    }

    /// Connect to a peer.
    pub fn connect(&self, addr: std::net::SocketAddr) -> Result<(), Error> {
        self.send(Command::Connect(addr))
    }

    /// Disconnect from a peer.
    pub fn disconnect(&self, addr: std::net::SocketAddr) -> Result<(), Error> {
        self.send(Command::Disconnect(addr))
    }

    /// Import headers directly into the block store, bypassing peer sync.
    pub fn import_headers(&self, headers: Vec<BlockHeader>) -> Result<Result<ImportResult, tree::Error>, Error> {
        let (tx, rx) = chan::bounded(1);
        self.send(Command::ImportHeaders(headers, tx))?;
        Ok(rx.recv()?)
    }

    /// Import addresses into the address book.
    pub fn import_addresses(&self, addrs: Vec<Address>) -> Result<(), Error> {
        self.send(Command::ImportAddresses(addrs))
    }

    /// Submit a transaction to the network, announcing it to at least
    /// `min_peers` peers beyond the one it's first handed to.
    pub fn submit_transaction(&self, transaction: Transaction, min_peers: usize) -> Result<(), Error> {
        self.send(Command::SubmitTransaction(transaction, min_peers))
    }

    /// Look up a previously submitted transaction, by id.
    pub fn get_submitted_transaction(&self, txid: Txid) -> Result<Option<Transaction>, Error> {
        let (tx, rx) = chan::bounded(1);
        self.send(Command::GetSubmittedTransaction(txid, tx))?;
        Ok(rx.recv()?)
    }

    /// Load a Bloom filter onto every connected peer.
    pub fn load_bloom_filter(&self, filter: FilterLoad, query_mempool: bool) -> Result<(), Error> {
        self.send(Command::LoadBloomFilter(filter, query_mempool))
    }

    /// Clear every connected peer's Bloom filter.
    pub fn clear_bloom_filter(&self) -> Result<(), Error> {
        self.send(Command::BloomFilterClear)
    }

    /// Ask the reactor to disconnect every peer and stop. Returns once the
    /// command is sent; join the handle returned by [`crate::spawn`] to wait
    /// for the reactor thread to actually exit.
    pub fn shutdown(&self) -> Result<(), Error> {
        self.send(Command::Shutdown)
    }
}
