//! Bloom filter manager.
//!
//! Manages BIP 37 bloom filter delivery to peers and the merkle-block-based
//! rescan used to retrieve confirmations for watched scripts.
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::ops::{Bound, RangeInclusive};

use spv_common::bitcoin_hashes::Hash;
use thiserror::Error;

mod rescan;
use super::bloom_cache::FilterCache;
use super::output::{Io, Outbox};
use super::traits::{SharedFilterProvider, SharedWalletSink};
use super::Event;
use super::{DisconnectReason, Link, Locators, PeerId};

use spv_common::bitcoin::network::constants::ServiceFlags;
use spv_common::bitcoin::network::message::NetworkMessage;
use spv_common::bitcoin::network::message_blockdata::Inventory;
use spv_common::bitcoin::network::message_bloom::FilterLoad;
use spv_common::bitcoin::Txid;
use spv_common::block::time::{Clock, LocalDuration, LocalTime};
use spv_common::block::tree::{BlockReader, BlockTree};
use spv_common::block::{BlockHash, Height};
use spv_common::collections::{AddressBook, HashMap};
use spv_common::source;
use rescan::Rescan;

/// Idle timeout, after which the manager re-arms its timer.
pub const IDLE_TIMEOUT: LocalDuration = LocalDuration::from_secs(60);
/// How long to wait for a `getdata` request for merkle blocks to be fulfilled.
pub const REQUEST_TIMEOUT: LocalDuration = LocalDuration::from_secs(30);
/// Services required from peers we load bloom filters onto.
pub const REQUIRED_SERVICES: ServiceFlags = ServiceFlags::BLOOM;
/// Default merkle block cache capacity, in bytes.
pub const DEFAULT_FILTER_CACHE_SIZE: usize = 1024 * 1024 * 4;

/// Bloom-filter-specific peer state.
#[derive(Debug, Clone)]
pub struct Peer {
    has_filter: bool,
}

/// What to do when a pending request times out.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum OnTimeout {
    /// Disconnect the peer.
    Disconnect,
    /// Do nothing; the peer likely just doesn't have the data.
    Ignore,
    /// Retry against a different peer, up to `n` more times.
    #[allow(dead_code)]
    Retry(usize),
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct GetBlocks {
    locators: Locators,
    sent_at: LocalTime,
    on_timeout: OnTimeout,
}

/// An error from attempting to request merkle blocks.
#[derive(Error, Debug)]
pub enum GetMerkleBlocksError {
    /// The specified range is invalid, eg. it is empty or out of bounds.
    #[error("the specified range is invalid")]
    InvalidRange,
    /// Not connected to any peer with bloom filter support.
    #[error("not connected to any peer with bloom filters support")]
    NotConnected,
}

/// What to do with a recalculated merged filter.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FilterUpdateMode {
    /// Send the filter only if its contents changed.
    SendIfChanged,
    /// Send the filter unconditionally; it's grown enough to risk leaking
    /// privacy if peers keep matching against the stale one.
    ForceSendForRefresh,
    /// Don't send; nothing changed.
    DontSend,
}

/// Manages bloom filter delivery and merkle-block-based rescans.
#[derive(Debug)]
pub struct BloomManager<C> {
    /// Rescan state.
    pub rescan: Rescan,

    clock: C,
    /// Peers known to support BIP 37.
    peers: AddressBook<PeerId, Peer>,
    /// The last time we idled.
    last_idle: Option<LocalTime>,
    /// State-machine output.
    outbox: Outbox,
    /// Merkle block requests in flight, by peer.
    blocks_inflight: HashMap<PeerId, GetBlocks>,
    /// How long to wait for a response from a peer.
    request_timeout: LocalDuration,
    /// Transaction ids matched by a rescan, awaiting full delivery.
    matches: VecDeque<Txid>,
    /// Wallets consulted for filter exhaustion.
    wallet_sinks: Vec<SharedWalletSink>,
    /// Sources of elements contributed to the merged filter.
    filter_providers: Vec<SharedFilterProvider>,
    /// Element count of the filter the last time it was rebuilt.
    last_filter_elements: usize,
    /// Whether we're waiting for a fresh filter to be loaded before resuming
    /// a scan stashed after detecting filter exhaustion.
    awaiting_fresh_filter: bool,
    /// The scan range stashed while awaiting a fresh filter.
    stashed_scan: Option<RangeInclusive<Height>>,
}

impl<C> Iterator for BloomManager<C> {
    type Item = Io;

    fn next(&mut self) -> Option<Self::Item> {
        self.outbox.next()
    }
}

impl<C: Clock> BloomManager<C> {
    /// Create a new bloom manager.
    pub fn new(clock: C) -> Self {
        Self {
            rescan: Rescan::new(DEFAULT_FILTER_CACHE_SIZE),
            clock,
            peers: AddressBook::new(),
            last_idle: None,
            outbox: Outbox::default(),
            blocks_inflight: HashMap::new(),
            request_timeout: REQUEST_TIMEOUT,
            matches: VecDeque::new(),
            wallet_sinks: Vec::new(),
            filter_providers: Vec::new(),
            last_filter_elements: 0,
            awaiting_fresh_filter: false,
            stashed_scan: None,
        }
    }

    /// Register a wallet sink, consulted to detect filter exhaustion.
    pub fn register_wallet_sink(&mut self, sink: SharedWalletSink) {
        self.wallet_sinks.push(sink);
    }

    /// Register a filter provider, consulted when merging a fresh filter.
    pub fn register_filter_provider(&mut self, provider: SharedFilterProvider) {
        self.filter_providers.push(provider);
    }

    /// Merge every registered provider's elements into `filter`, returning
    /// the merged filter along with how urgently it should be sent: unchanged
    /// filters are suppressed, and a tenfold growth in watched elements (or
    /// the first time any elements are contributed) forces an unconditional
    /// send, since a stale filter held past that point starts leaking privacy
    /// as false-positive rates drift from what peers expect.
    pub fn rebuild_filter(&mut self, mut filter: FilterLoad) -> (FilterLoad, FilterUpdateMode) {
        if self.filter_providers.is_empty() {
            return (filter, FilterUpdateMode::SendIfChanged);
        }

        for provider in &self.filter_providers {
            provider.lock().unwrap().begin_bloom_update();
        }
        let total_elements: usize = self
            .filter_providers
            .iter()
            .map(|p| p.lock().unwrap().elements_count())
            .sum();
        for provider in &self.filter_providers {
            provider.lock().unwrap().contribute_to_filter(&mut filter);
        }
        for provider in &self.filter_providers {
            provider.lock().unwrap().end_bloom_update();
        }

        let mode = if self.last_filter_elements == 0 && total_elements > 0 {
            FilterUpdateMode::ForceSendForRefresh
        } else if self.last_filter_elements > 0 && total_elements >= self.last_filter_elements.saturating_mul(10) {
            FilterUpdateMode::ForceSendForRefresh
        } else if total_elements != self.last_filter_elements {
            FilterUpdateMode::SendIfChanged
        } else {
            FilterUpdateMode::DontSend
        };

        self.last_filter_elements = total_elements;
        (filter, mode)
    }

    /// The earliest time any registered filter provider's keys could have
    /// appeared on chain, used to bound a rescan's starting height.
    pub fn earliest_key_time(&self) -> Option<u64> {
        self.filter_providers
            .iter()
            .map(|p| p.lock().unwrap().earliest_key_time_secs())
            .min()
    }

    /// Re-arm the idle timer if it has elapsed.
    pub fn idle<T: BlockReader>(&mut self, tree: &T) {
        let _ = tree;
        let now = self.clock.local_time();

        if now - self.last_idle.unwrap_or_default() >= IDLE_TIMEOUT {
            self.last_idle = Some(now);
            self.outbox.set_timer(IDLE_TIMEOUT);
        }
    }

    /// Initialize the bloom manager.
    pub fn initialize<T: BlockReader>(&mut self, tree: &T) {
        self.idle(tree);
    }

    /// Process an event from the state machine.
    pub fn received_event<T: BlockTree>(&mut self, event: Event, tree: &mut T) {
        match event {
            Event::PeerNegotiated {
                addr,
                link,
                services,
                height,
                ..
            } => {
                self.peer_negotiated(addr, height, services, link, tree);
            }
            Event::PeerDisconnected { addr, .. } => {
                self.unregister(&addr);
            }
            Event::ReceivedMerkleBlock { height, merkle_block } => {
                self.received_merkle_block(height, merkle_block, tree);
            }
            Event::LoadBloomFilter { peers, filter, all } => {
                if all {
                    self.send_bloom_filter_all_connected(filter, peers);
                } else if let Some(peer) = peers.first() {
                    self.outbox.send_bloom_filter_load(peer, filter);
                }

                if self.awaiting_fresh_filter {
                    self.awaiting_fresh_filter = false;
                    if let Some(range) = self.stashed_scan.take() {
                        if let Err(err) = self.get_merkle_blocks(range, tree) {
                            log::debug!(
                                target: "p2p",
                                "Failed to replay stashed merkle block scan: {}",
                                err,
                            );
                        }
                    }
                }
            }
            Event::MessageReceived { from, message } => match message.as_ref() {
                NetworkMessage::MerkleBlock(block) => {
                    let _ = from;
                    if let Some((height, _)) = tree.get_block(&block.header.block_hash()) {
                        self.outbox.event(Event::ReceivedMerkleBlock {
                            height,
                            merkle_block: block.clone(),
                        });
                    }
                }
                NetworkMessage::Tx(tx) => {
                    let txid = tx.txid();
                    if self.matches.contains(&txid) {
                        self.matches.pop_front();
                    }
                    self.outbox.event(Event::ReceivedMatchedTx {
                        transaction: tx.to_owned(),
                    });
                }
                _ => {}
            },
            _ => {}
        }
    }

    /// Remove a peer from bloom-filter tracking.
    fn unregister(&mut self, id: &PeerId) {
        self.peers.remove(id);
    }

    /// Called when a peer finishes the handshake.
    fn peer_negotiated<T: BlockReader>(
        &mut self,
        addr: PeerId,
        height: Height,
        services: ServiceFlags,
        link: Link,
        tree: &T,
    ) {
        let _ = (tree, height);
        if link.is_outbound() && !services.has(REQUIRED_SERVICES) {
            return;
        }
        self.register(addr);
    }

    /// Register a peer as a bloom-filter candidate.
    fn register(&mut self, addr: PeerId) {
        self.peers.insert(addr, Peer { has_filter: false });
    }

    /// Send a bloom filter to every connected, bloom-capable peer.
    pub fn send_bloom_filter_all_connected(&mut self, filter: FilterLoad, peers: Vec<PeerId>) {
        for peer in peers.iter() {
            self.outbox.send_bloom_filter_load(peer, filter.clone());
            if let Some(p) = self.peers.get_mut(peer) {
                p.has_filter = true;
            }
        }
    }

    /// Clear every connected peer's previously-loaded bloom filter.
    pub fn send_bloom_filter_clear(&mut self) {
        let addrs: Vec<PeerId> = self.peers.keys().copied().collect();
        for addr in addrs {
            self.outbox.filter_clear(addr);
            if let Some(p) = self.peers.get_mut(&addr) {
                p.has_filter = false;
            }
        }
    }

    /// Peers that don't yet have a bloom filter loaded.
    pub fn get_peers_not_filter_loaded(&mut self) -> Vec<SocketAddr> {
        self.peers
            .iter()
            .filter(|(_, peer)| !peer.has_filter)
            .map(|(addr, _)| *addr)
            .collect()
    }

    /// A timer has expired; fail or retry any requests that have timed out.
    pub fn timer_expired<T: BlockReader>(&mut self, _tree: &T) {
        let local_time = self.clock.local_time();
        let timeout = self.request_timeout;
        let timed_out: Vec<(PeerId, OnTimeout)> = self
            .blocks_inflight
            .iter()
            .filter_map(|(peer, req)| {
                if local_time - req.sent_at >= timeout {
                    Some((*peer, req.on_timeout))
                } else {
                    None
                }
            })
            .collect();

        for (peer, on_timeout) in timed_out {
            self.blocks_inflight.remove(&peer);

            match on_timeout {
                OnTimeout::Ignore => {}
                OnTimeout::Retry(0) | OnTimeout::Disconnect => {
                    self.outbox
                        .disconnect(peer, DisconnectReason::PeerTimeout("getmerkleblocks"));
                }
                OnTimeout::Retry(_n) => {}
            }
        }
    }

    /// Request the mempool contents from a bloom-filtered peer.
    pub fn get_mempool(&mut self) {
        if let Some((addr, _)) = self.peers.sample() {
            let addr = *addr;
            self.outbox.get_mempool(&addr);
        }
    }

    /// Request merkle blocks covering `range`, splitting the work across
    /// bloom-filter peers that don't already have a request in flight.
    pub fn get_merkle_blocks<T: BlockReader>(
        &mut self,
        range: RangeInclusive<Height>,
        tree: &T,
    ) -> Result<(), GetMerkleBlocksError> {
        if self.peers.is_empty() {
            return Err(GetMerkleBlocksError::NotConnected);
        }
        if range.is_empty() {
            return Err(GetMerkleBlocksError::InvalidRange);
        }
        assert!(*range.end() <= tree.height());

        let inflight = &self.blocks_inflight;
        let candidates: Vec<PeerId> = self
            .peers
            .iter()
            .filter(|(addr, _)| !inflight.contains_key(addr))
            .map(|(addr, _)| *addr)
            .collect();

        if candidates.is_empty() {
            return Err(GetMerkleBlocksError::NotConnected);
        }

        let requests = self.rescan.requests(range, tree);
        let mut cursor = 0;

        for range in requests {
            let peer = candidates[cursor % candidates.len()];
            cursor += 1;

            let timeout = self.request_timeout;

            log::debug!(
                target: "p2p",
                "Requested merkle block(s) in range {} to {} from peer {}",
                range.start(),
                range.end(),
                peer,
            );

            let locators: Vec<BlockHash> = tree
                .range(*range.start()..*range.end() + 1)
                .map(|(_height, blockhash)| blockhash)
                .collect();
            let block_request: Vec<Inventory> = locators
                .iter()
                .map(|block| Inventory::FilteredBlock(*block))
                .collect();
            let sent_at = self.clock.local_time();
            let req = GetBlocks {
                locators: (locators, BlockHash::all_zeros()),
                sent_at,
                on_timeout: OnTimeout::Ignore,
            };
            self.outbox.get_data(peer, block_request);
            // A ping/pong roundtrip demarcates the end of the filtered block's
            // tx stream, since `merkleblock`/`tx` replies carry no count.
            self.outbox.ping(peer, fastrand::u64(..));
            self.outbox.set_timer(timeout);
            self.blocks_inflight.insert(peer, req);
        }
        self.rescan.reset();

        Ok(())
    }

    /// Called when a merkle block is received from a peer.
    pub fn received_merkle_block<T: BlockTree>(&mut self, height: Height, merkle_block: spv_common::bitcoin::MerkleBlock, tree: &mut T) {
        let block_hash = merkle_block.header.block_hash();
        self.rescan.received(height, merkle_block.clone(), block_hash);

        if !self.awaiting_fresh_filter
            && self
                .wallet_sinks
                .iter()
                .any(|sink| sink.lock().unwrap().check_for_filter_exhaustion(&merkle_block))
        {
            self.awaiting_fresh_filter = true;
            let stop = self.rescan.end.unwrap_or_else(|| tree.height());
            self.stashed_scan = Some(self.rescan.current..=stop);

            // Ping the peer supplying filtered blocks so the matching pong
            // demarcates where the stale-filter tx stream ends.
            if let Some(peer) = self.blocks_inflight.keys().next().copied() {
                self.outbox.ping(peer, fastrand::u64(..));
            }
            log::debug!(
                target: "p2p",
                "Bloom filter exhausted at height {}, awaiting refresh",
                height,
            );
        }

        // Matched heights are surfaced via `MerkleBlockProcessed`; the
        // inventory manager observes that event to fetch full blocks.
        let (_matches, events, _) = self.rescan.process();
        for event in events {
            self.outbox.event(event);
        }
    }

    /// Start (or restart) a merkle-block rescan over `start..=end`.
    pub fn merkle_scan<T: BlockReader>(&mut self, start: Bound<Height>, end: Bound<Height>, tree: &T) {
        self.rescan.restart(
            match start {
                Bound::Unbounded => tree.height() + 1,
                Bound::Included(h) => h,
                Bound::Excluded(h) => h + 1,
            },
            match end {
                Bound::Unbounded => None,
                Bound::Included(h) => Some(h),
                Bound::Excluded(h) => Some(h - 1),
            },
        );

        self.outbox.event(Event::MerkleBlockRescanStarted {
            start: self.rescan.start,
            stop: self.rescan.end,
        });

        let height = tree.height();
        let start = self.rescan.start;
        let stop = self.rescan.end.map(|h| Height::min(h, height)).unwrap_or(height);
        let range = start..=stop;

        match self.get_merkle_blocks(range, tree) {
            Ok(()) => {}
            Err(GetMerkleBlocksError::NotConnected) => {}
            Err(err) => panic!("{}: error fetching merkle blocks: {}", source!(), err),
        }
    }
}

/// Iterator splitting a height range into fixed-size sub-ranges.
struct HeightIterator {
    start: Height,
    stop: Height,
    step: Height,
}

impl Iterator for HeightIterator {
    type Item = RangeInclusive<Height>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.start <= self.stop {
            let start = self.start;
            let stop = self.stop.min(start + self.step - 1);

            self.start = stop + 1;

            Some(start..=stop)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spv_chain::BlockCache;
    use spv_common::block::store::Memory;
    use spv_common::network::Network;

    fn tree_with(n: usize) -> BlockCache<Memory<spv_common::bitcoin::BlockHeader>> {
        let headers = spv_testutil::block::chain(3, n);
        let store = Memory::new(spv_common::nonempty::NonEmpty::from_vec(headers).unwrap());
        BlockCache::from(store, Network::Regtest.params(), &[]).unwrap()
    }

    fn negotiated(addr: PeerId) -> Event {
        Event::PeerNegotiated {
            addr,
            link: Link::Outbound,
            services: REQUIRED_SERVICES,
            persistent: false,
            height: 0,
            receiver: spv_common::bitcoin::network::address::Address::new(&addr, ServiceFlags::NONE),
            user_agent: String::new(),
            version: 70016,
            relay: true,
        }
    }

    fn filter() -> FilterLoad {
        FilterLoad {
            filter: vec![0u8; 8],
            hash_funcs: 3,
            tweak: 0,
            flags: 0,
        }
    }

    // A bloom-capable peer that negotiates is registered as a filter
    // candidate, and shows up as not-yet-filter-loaded.
    #[test]
    fn test_bloom_capable_peer_registered_on_negotiation() {
        let mut mgr: BloomManager<()> = BloomManager::new(());
        let peer: PeerId = "1.1.1.1:8333".parse().unwrap();
        let mut tree = tree_with(1);

        mgr.received_event(negotiated(peer), &mut tree);

        assert_eq!(mgr.get_peers_not_filter_loaded(), vec![peer]);
    }

    // Sending a filter to all connected peers marks them as loaded and
    // queues a `filterload` message to each.
    #[test]
    fn test_send_filter_marks_peers_loaded() {
        let mut mgr: BloomManager<()> = BloomManager::new(());
        let peer: PeerId = "2.2.2.2:8333".parse().unwrap();
        let mut tree = tree_with(1);
        mgr.received_event(negotiated(peer), &mut tree);

        mgr.send_bloom_filter_all_connected(filter(), vec![peer]);

        assert!(mgr.get_peers_not_filter_loaded().is_empty());
        let outputs: Vec<Io> = mgr.by_ref().collect();
        assert!(outputs
            .iter()
            .any(|io| matches!(io, Io::Write(a, NetworkMessage::FilterLoad(_)) if *a == peer)));
    }

    // Clearing filters after having loaded one resets every peer back to
    // not-loaded.
    #[test]
    fn test_clear_filter_resets_peers() {
        let mut mgr: BloomManager<()> = BloomManager::new(());
        let peer: PeerId = "3.3.3.3:8333".parse().unwrap();
        let mut tree = tree_with(1);
        mgr.received_event(negotiated(peer), &mut tree);
        mgr.send_bloom_filter_all_connected(filter(), vec![peer]);
        mgr.by_ref().for_each(drop);

        mgr.send_bloom_filter_clear();

        assert_eq!(mgr.get_peers_not_filter_loaded(), vec![peer]);
    }

    // A peer without bloom support is never registered as a candidate.
    #[test]
    fn test_outbound_peer_without_bloom_support_not_registered() {
        let mut mgr: BloomManager<()> = BloomManager::new(());
        let peer: PeerId = "4.4.4.4:8333".parse().unwrap();
        let mut tree = tree_with(1);

        mgr.received_event(
            Event::PeerNegotiated {
                addr: peer,
                link: Link::Outbound,
                services: ServiceFlags::NONE,
                persistent: false,
                height: 0,
                receiver: spv_common::bitcoin::network::address::Address::new(&peer, ServiceFlags::NONE),
                user_agent: String::new(),
                version: 70016,
                relay: true,
            },
            &mut tree,
        );

        assert!(mgr.get_peers_not_filter_loaded().is_empty());
    }
}
