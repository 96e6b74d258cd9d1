//! Inventory, transaction, and transaction-dependency download handling.
use std::collections::{HashMap, HashSet};

use spv_common::bitcoin::network::message_blockdata::Inventory;
use spv_common::bitcoin::{BlockHash, Transaction, Txid};
use spv_common::block::time::{Clock, LocalDuration};
use spv_common::block::Height;

use super::event::TxStatus;
use super::output::Outbox;
use super::traits::{SharedWalletSink, TxConfidenceTable};
use super::{Event, PeerId};

/// How long to wait for a `getdata` reply before considering it lost.
pub const REQUEST_TIMEOUT: LocalDuration = LocalDuration::from_secs(30);
/// Maximum number of transaction downloads allowed in flight per peer.
pub const MAX_PENDING_TX_DOWNLOADS: usize = 5_000;

/// A block download requested outside of the normal sync flow (eg. via a
/// user-level `getBlock` call).
#[derive(Debug, Clone, Copy)]
struct PendingBlock {
    requested_at: spv_common::block::time::LocalTime,
}

/// A recursive dependency download in progress for a broadcast/received tx.
#[derive(Debug)]
struct DependencyDownload {
    root: Txid,
    tx: Transaction,
    peer: PeerId,
    depth: usize,
    max_depth: usize,
    pending: HashSet<Txid>,
    resolved: Vec<Transaction>,
}

/// Tracks, per txid, which peer announced it first. Only the first-seen
/// announcement of a transaction triggers a `getdata` request; later
/// announcements of the same txid from other peers are assumed redundant.
#[derive(Debug, Default)]
struct ConfidenceTable {
    first_seen: HashMap<Txid, PeerId>,
}

impl TxConfidenceTable for ConfidenceTable {
    type Confidence = PeerId;

    fn seen(&mut self, txid: Txid, addr: PeerId) -> PeerId {
        *self.first_seen.entry(txid).or_insert(addr)
    }

    fn get(&self, txid: &Txid) -> Option<PeerId> {
        self.first_seen.get(txid).copied()
    }
}

/// Tracks inventory announcements, in-flight transaction/block downloads, and
/// the mempool of transactions we've broadcast or received.
#[derive(Debug)]
pub struct InventoryManager<C> {
    clock: C,
    /// Blocks explicitly requested and awaiting arrival.
    pub received: HashMap<BlockHash, Height>,
    /// Blocks still to be downloaded to catch up to a peer's claimed height.
    pub remaining: HashSet<BlockHash>,
    /// Transactions broadcast by us or received from the network, kept until
    /// confirmed, by txid.
    pub mempool: HashMap<Txid, Transaction>,
    /// Per-tx download/confidence status.
    status: HashMap<Txid, TxStatus>,
    /// Transactions requested via `getdata` and not yet received.
    pending_tx_downloads: HashMap<Txid, spv_common::block::time::LocalTime>,
    /// Blocks requested via `getdata` and not yet received.
    pending_block_downloads: HashMap<BlockHash, PendingBlock>,
    /// Recursive dependency downloads keyed by root txid.
    dependencies: HashMap<Txid, DependencyDownload>,
    /// Peers we can currently relay inventory to.
    connected: HashSet<PeerId>,
    /// First-seen peer per announced txid.
    confidence: ConfidenceTable,
    /// Wallets to offer received transactions to.
    wallet_sinks: Vec<SharedWalletSink>,
    /// The currently-elected download peer, if any.
    download_peer: Option<PeerId>,
    /// Whether we're currently downloading full block bodies.
    downloading_bodies: bool,
    outbox: Outbox,
}

impl<C> Iterator for InventoryManager<C> {
    type Item = super::output::Io;

    fn next(&mut self) -> Option<Self::Item> {
        self.outbox.next()
    }
}

impl<C: Clock> InventoryManager<C> {
    /// Create a new inventory manager.
    pub fn new(clock: C) -> Self {
        Self {
            clock,
            received: HashMap::new(),
            remaining: HashSet::new(),
            mempool: HashMap::new(),
            status: HashMap::new(),
            pending_tx_downloads: HashMap::new(),
            pending_block_downloads: HashMap::new(),
            dependencies: HashMap::new(),
            connected: HashSet::new(),
            confidence: ConfidenceTable::default(),
            wallet_sinks: Vec::new(),
            download_peer: None,
            downloading_bodies: false,
            outbox: Outbox::default(),
        }
    }

    /// Called once at startup.
    pub fn initialize(&mut self) {}

    /// Register a wallet sink to offer received transactions to.
    pub fn register_wallet_sink(&mut self, sink: SharedWalletSink) {
        self.wallet_sinks.push(sink);
    }

    /// Request a specific block by hash.
    pub fn get_block(&mut self, hash: BlockHash) {
        self.remaining.insert(hash);
    }

    /// Announce a transaction to every connected peer, adding it to the
    /// mempool. Returns the peers it was announced to.
    pub fn announce(&mut self, tx: Transaction) -> Vec<PeerId> {
        let txid = tx.txid();
        self.status.entry(txid).or_insert(TxStatus::Unconfirmed);
        self.mempool.insert(txid, tx);

        let peers: Vec<PeerId> = self.connected.iter().copied().collect();
        for peer in &peers {
            self.outbox.inv(*peer, vec![Inventory::Transaction(txid)]);
        }
        peers
    }

    /// Look up a transaction we've broadcast or received, by id.
    pub fn get_submitted_tx(&self, txid: Txid) -> Option<Transaction> {
        self.mempool.get(&txid).cloned()
    }

    /// Process an `inv` message: partition into tx/block/unknown, request new
    /// transactions subject to the pending-downloads cap, and request
    /// outstanding blocks from the download peer.
    fn handle_inv(&mut self, from: PeerId, inventory: Vec<Inventory>, is_download_peer: bool, downloading_bodies: bool) {
        let mut tx_inv = Vec::new();
        let mut block_inv = Vec::new();

        for item in &inventory {
            match item {
                Inventory::Transaction(txid) => tx_inv.push(*txid),
                Inventory::Block(hash) => block_inv.push(*hash),
                Inventory::WitnessTransaction(txid) => tx_inv.push(*txid),
                Inventory::WitnessBlock(hash) => block_inv.push(*hash),
                _ => {}
            }
        }

        if block_inv.len() == 1 && tx_inv.is_empty() {
            log::debug!(target: "p2p", "Chain tip tickle from {}", from);
        }

        let mut getdata = Vec::new();
        for txid in tx_inv {
            if self.confidence.seen(txid, from) != from {
                continue;
            }
            if self.status.contains_key(&txid) || self.pending_tx_downloads.contains_key(&txid) {
                continue;
            }
            if self.pending_tx_downloads.len() >= MAX_PENDING_TX_DOWNLOADS {
                self.outbox.disconnect(from, super::DisconnectReason::PeerMisbehaving("too many pending tx downloads"));
                return;
            }
            self.pending_tx_downloads.insert(txid, self.clock.local_time());
            getdata.push(Inventory::Transaction(txid));
        }

        if is_download_peer && downloading_bodies {
            for hash in block_inv {
                if self.pending_block_downloads.contains_key(&hash) {
                    continue;
                }
                self.pending_block_downloads.insert(hash, PendingBlock { requested_at: self.clock.local_time() });
                getdata.push(Inventory::Block(hash));
            }
        }

        if !getdata.is_empty() {
            self.outbox.get_data(from, getdata);
        }
    }

    /// Process a `notfound`: cancel any pending request whose hash is listed.
    fn handle_notfound(&mut self, inventory: Vec<Inventory>) {
        for item in inventory {
            match item {
                Inventory::Transaction(txid) | Inventory::WitnessTransaction(txid) => {
                    self.pending_tx_downloads.remove(&txid);
                    for dep in self.dependencies.values_mut() {
                        dep.pending.remove(&txid);
                    }
                }
                Inventory::Block(hash) | Inventory::WitnessBlock(hash) => {
                    self.pending_block_downloads.remove(&hash);
                }
                _ => {}
            }
        }
        self.drain_completed_dependencies();
    }

    /// Process a received transaction: basic shape validation, confidence
    /// update, dependency resolution and download kickoff.
    fn handle_tx(&mut self, tx: Transaction) {
        if tx.input.is_empty() || tx.output.is_empty() {
            log::debug!(target: "p2p", "Dropping malformed transaction {}", tx.txid());
            return;
        }
        let txid = tx.txid();
        self.pending_tx_downloads.remove(&txid);
        self.status.insert(txid, TxStatus::Unconfirmed);

        for dep in self.dependencies.values_mut() {
            if dep.pending.remove(&txid) {
                dep.resolved.push(tx.clone());
            }
        }
        self.drain_completed_dependencies();

        self.mempool.insert(txid, tx.clone());

        let relevant = self
            .wallet_sinks
            .iter()
            .any(|sink| sink.lock().unwrap().is_pending_transaction_relevant(&tx));
        if relevant {
            self.outbox.event(Event::ReceivedMatchedTx { transaction: tx });
        }
    }

    /// Kick off a recursive dependency download for `tx`, to depth `max_depth`.
    pub fn download_dependencies(&mut self, peer: PeerId, tx: &Transaction, max_depth: usize) {
        if max_depth == 0 {
            return;
        }
        let root = tx.txid();
        let inputs: HashSet<Txid> = tx.input.iter().map(|i| i.previous_output.txid).collect();
        if inputs.is_empty() {
            return;
        }

        let getdata = inputs.iter().map(|txid| Inventory::Transaction(*txid)).collect();
        self.outbox.get_data(peer, getdata);

        self.dependencies.insert(
            root,
            DependencyDownload {
                root,
                tx: tx.clone(),
                peer,
                depth: 1,
                max_depth,
                pending: inputs,
                resolved: Vec::new(),
            },
        );
    }

    /// Deliver fully-resolved dependency downloads to registered wallet
    /// sinks, recursing into the resolved transactions' own inputs until
    /// `max_depth` is reached.
    fn drain_completed_dependencies(&mut self) {
        let done: Vec<Txid> = self
            .dependencies
            .iter()
            .filter(|(_, d)| d.pending.is_empty())
            .map(|(root, _)| *root)
            .collect();

        for root in done {
            let Some(mut dep) = self.dependencies.remove(&root) else { continue };
            dep.resolved.sort_by_key(|t| t.txid());
            dep.resolved.dedup_by_key(|t| t.txid());

            let seen: HashSet<Txid> = std::iter::once(dep.root)
                .chain(dep.resolved.iter().map(|t| t.txid()))
                .collect();
            let next: HashSet<Txid> = if dep.depth < dep.max_depth {
                dep.resolved
                    .iter()
                    .flat_map(|t| t.input.iter().map(|i| i.previous_output.txid))
                    .filter(|txid| !seen.contains(txid))
                    .collect()
            } else {
                HashSet::new()
            };

            if next.is_empty() {
                log::debug!(
                    target: "p2p",
                    "Dependency download for {} resolved {} transaction(s) at depth {}/{}",
                    dep.root, dep.resolved.len(), dep.depth, dep.max_depth,
                );
                for sink in self.wallet_sinks.iter() {
                    sink.lock().unwrap().receive_pending(dep.tx.clone(), dep.resolved.clone());
                }
            } else {
                let getdata = next.iter().map(|txid| Inventory::Transaction(*txid)).collect();
                self.outbox.get_data(dep.peer, getdata);
                dep.depth += 1;
                dep.pending = next;
                self.dependencies.insert(root, dep);
            }
        }
    }

    /// Process an event relevant to inventory/transaction handling.
    pub fn received_event(&mut self, event: Event) {
        match event {
            Event::MessageReceived { from, message } => match message.as_ref() {
                spv_common::bitcoin::network::message::NetworkMessage::Inv(inventory) => {
                    let is_download_peer = self.download_peer == Some(from);
                    self.handle_inv(from, inventory.clone(), is_download_peer, self.downloading_bodies);
                }
                spv_common::bitcoin::network::message::NetworkMessage::NotFound(inventory) => {
                    self.handle_notfound(inventory.clone());
                }
                spv_common::bitcoin::network::message::NetworkMessage::Tx(tx) => {
                    self.handle_tx(tx.clone());
                }
                _ => {}
            },
            Event::PeerNegotiated { addr, .. } => {
                self.connected.insert(addr);
            }
            Event::PeerDisconnected { addr, .. } => {
                self.connected.remove(&addr);
            }
            Event::DownloadPeerChanged { addr } => {
                self.download_peer = addr;
            }
            Event::BodyDownloadStateChanged { downloading_bodies } => {
                self.downloading_bodies = downloading_bodies;
            }
            _ => {}
        }
    }

    /// A timer fired; re-request anything that's taken too long.
    pub fn timer_expired(&mut self) {
        let now = self.clock.local_time();
        self.pending_tx_downloads.retain(|_, sent_at| now.duration_since(*sent_at) < REQUEST_TIMEOUT * 4);
        self.pending_block_downloads.retain(|_, req| now.duration_since(req.requested_at) < REQUEST_TIMEOUT * 4);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::super::output::Io;
    use super::super::traits::WalletSink;
    use super::super::Link;
    use spv_common::bitcoin::network::message::NetworkMessage;
    use std::sync::{Arc, Mutex};

    struct AlwaysRelevant;

    impl WalletSink for AlwaysRelevant {
        fn is_pending_transaction_relevant(&self, _tx: &Transaction) -> bool {
            true
        }

        fn receive_pending(&mut self, _tx: Transaction, _dependencies: Vec<Transaction>) {}

        fn check_for_filter_exhaustion(&self, _merkle_block: &spv_common::bitcoin::MerkleBlock) -> bool {
            false
        }

        fn get_transaction(&self, _txid: &Txid) -> Option<Transaction> {
            None
        }
    }

    fn dummy_tx(nonce: u32) -> Transaction {
        use spv_common::bitcoin::blockdata::script::Script;
        use spv_common::bitcoin::blockdata::transaction::{OutPoint, TxIn, TxOut};
        use spv_common::bitcoin::blockdata::witness::Witness;

        Transaction {
            version: 1,
            lock_time: spv_common::bitcoin::PackedLockTime(0),
            input: vec![TxIn {
                previous_output: OutPoint::null(),
                script_sig: Script::new(),
                sequence: spv_common::bitcoin::Sequence(nonce),
                witness: Witness::default(),
            }],
            output: vec![TxOut { value: 1000, script_pubkey: Script::new() }],
        }
    }

    // Announcing a transaction adds it to the mempool and announces it to
    // every connected peer.
    #[test]
    fn test_announce_adds_to_mempool_and_notifies_connected_peers() {
        let mut mgr: InventoryManager<()> = InventoryManager::new(());
        let peer: PeerId = "1.1.1.1:8333".parse().unwrap();
        mgr.received_event(Event::PeerNegotiated {
            addr: peer,
            link: Link::Outbound,
            services: spv_common::bitcoin::network::constants::ServiceFlags::NETWORK,
            persistent: false,
            height: 0,
            receiver: spv_common::bitcoin::network::address::Address::new(
                &peer,
                spv_common::bitcoin::network::constants::ServiceFlags::NONE,
            ),
            user_agent: String::new(),
            version: 70016,
            relay: true,
        });

        let tx = dummy_tx(1);
        let txid = tx.txid();
        let announced_to = mgr.announce(tx);

        assert_eq!(announced_to, vec![peer]);
        assert!(mgr.mempool.contains_key(&txid));
        let outputs: Vec<Io> = mgr.by_ref().collect();
        assert!(outputs
            .iter()
            .any(|io| matches!(io, Io::Write(a, NetworkMessage::Inv(inv)) if *a == peer && inv.contains(&Inventory::Transaction(txid)))));
    }

    // An unseen transaction announced via `inv` is requested with `getdata`;
    // a transaction already in the mempool is not re-requested.
    #[test]
    fn test_handle_inv_requests_unseen_tx_only() {
        let mut mgr: InventoryManager<()> = InventoryManager::new(());
        let peer: PeerId = "2.2.2.2:8333".parse().unwrap();
        let known = dummy_tx(1);
        let known_id = known.txid();
        mgr.announce(known);
        mgr.by_ref().for_each(drop);

        let unseen_id = dummy_tx(2).txid();
        mgr.handle_inv(peer, vec![Inventory::Transaction(known_id), Inventory::Transaction(unseen_id)], false, false);

        let outputs: Vec<Io> = mgr.by_ref().collect();
        let requested: Vec<_> = outputs
            .iter()
            .filter_map(|io| match io {
                Io::Write(_, NetworkMessage::GetData(items)) => Some(items.clone()),
                _ => None,
            })
            .flatten()
            .collect();
        assert_eq!(requested, vec![Inventory::Transaction(unseen_id)]);
    }

    // A received transaction updates status, joins the mempool, and emits a
    // `ReceivedMatchedTx` event.
    #[test]
    fn test_handle_tx_emits_matched_event() {
        let mut mgr: InventoryManager<()> = InventoryManager::new(());
        mgr.register_wallet_sink(Arc::new(Mutex::new(AlwaysRelevant)));
        let tx = dummy_tx(3);
        let txid = tx.txid();

        mgr.received_event(Event::MessageReceived {
            from: "3.3.3.3:8333".parse().unwrap(),
            message: std::sync::Arc::new(NetworkMessage::Tx(tx)),
        });

        assert!(mgr.mempool.contains_key(&txid));
        let outputs: Vec<Io> = mgr.by_ref().collect();
        assert!(outputs.iter().any(|io| matches!(
            io,
            Io::Event(Event::ReceivedMatchedTx { transaction }) if transaction.txid() == txid
        )));
    }
}
