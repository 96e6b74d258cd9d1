//! Block header chain synchronization.
//!
//! Downloads headers from a single elected peer, switching from header-only
//! mode to body download once the chain catches up to a configured
//! fast-catchup time.
use spv_common::bitcoin::consensus::params::Params;
use spv_common::bitcoin::BlockHash;
use spv_common::block::time::{Clock, LocalDuration};
use spv_common::block::tree::{BlockReader, BlockTree};
use spv_common::block::{BlockTime, Height};

use super::output::Outbox;
use super::{Event, Locators, PeerId};

/// Maximum number of headers requested per `getheaders`.
pub const MAX_MESSAGE_HEADERS: usize = 2000;
/// How long to wait for a `headers`/`block` reply before re-requesting.
pub const REQUEST_TIMEOUT: LocalDuration = LocalDuration::from_secs(30);

/// Sync manager configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Maximum headers requested per message.
    pub max_message_headers: usize,
    /// Timeout before a pending request is retried.
    pub request_timeout: LocalDuration,
    /// Consensus parameters, used for difficulty validation by the block tree.
    pub params: Params,
    /// If set, headers before this time are downloaded without bodies.
    pub fast_catchup_time: Option<BlockTime>,
}

/// A download in flight.
#[derive(Debug, Clone, Copy)]
struct Request {
    peer: PeerId,
    sent_at: spv_common::block::time::LocalTime,
}

/// Drives block header (and, after fast-catchup, body) download from a single
/// elected sync peer.
#[derive(Debug)]
pub struct SyncManager<C> {
    config: Config,
    clock: C,
    /// Whether we've switched from header-only to body download.
    downloading_bodies: bool,
    /// The peer currently supplying headers/blocks.
    sync_peer: Option<PeerId>,
    /// Highest height claimed by any negotiated peer so far.
    peer_height: Height,
    /// `(locator tip, stop hash)` of the last `getblocks`/`getheaders` sent,
    /// to suppress duplicate requests.
    last_request: Option<Locators>,
    inflight: Option<Request>,
    outbox: Outbox,
}

impl<C> Iterator for SyncManager<C> {
    type Item = super::output::Io;

    fn next(&mut self) -> Option<Self::Item> {
        self.outbox.next()
    }
}

impl<C: Clock> SyncManager<C> {
    /// Create a new sync manager.
    pub fn new(config: Config, clock: C) -> Self {
        Self {
            config,
            clock,
            downloading_bodies: false,
            sync_peer: None,
            peer_height: 0,
            last_request: None,
            inflight: None,
            outbox: Outbox::default(),
        }
    }

    /// Whether we're downloading full bodies (vs. headers only).
    pub fn downloading_bodies(&self) -> bool {
        self.downloading_bodies
    }

    /// The height of our best known block.
    pub fn best_height<T: BlockReader>(&self, tree: &T) -> Height {
        tree.height()
    }

    /// Called once at startup.
    pub fn initialize<T: BlockReader>(&mut self, tree: &T) {
        self.downloading_bodies = self.is_caught_up(tree);
        self.outbox.event(Event::BodyDownloadStateChanged {
            downloading_bodies: self.downloading_bodies,
        });
    }

    fn is_caught_up<T: BlockReader>(&self, tree: &T) -> bool {
        match self.config.fast_catchup_time {
            Some(catchup) => {
                let (_, header) = tree.best_block();
                header.time >= catchup
            }
            None => true,
        }
    }

    /// Request headers or blocks from `peer`, starting at the tree's tip.
    fn request<T: BlockReader>(&mut self, peer: PeerId, tree: &T, stop_hash: BlockHash) {
        let locators = (tree.locator_hashes(tree.height()), stop_hash);

        if self.last_request.as_ref() == Some(&locators) {
            return;
        }
        self.last_request = Some(locators.clone());

        if self.downloading_bodies {
            self.outbox.message(
                peer,
                spv_common::bitcoin::network::message::NetworkMessage::GetBlocks(
                    spv_common::bitcoin::network::message_blockdata::GetBlocksMessage {
                        version: super::PROTOCOL_VERSION,
                        locator_hashes: locators.0,
                        stop_hash: locators.1,
                    },
                ),
            );
        } else {
            self.outbox.get_headers(peer, locators);
        }
        self.inflight = Some(Request {
            peer,
            sent_at: self.clock.local_time(),
        });
        self.outbox.set_timer(self.config.request_timeout);
    }

    /// Import a batch of headers received from a peer, handling the
    /// header-only-to-body switchover.
    ///
    /// If a fast-catchup time is configured and we're still headers-only, any
    /// header in the batch at or past that time, and everything after it, is
    /// cut from this import: headers never carry bodies, so once we cross the
    /// catchup boundary the remainder of the batch must be re-fetched as
    /// blocks via `getblocks` instead.
    pub fn import_headers<T: BlockTree>(
        &mut self,
        from: PeerId,
        mut headers: Vec<spv_common::bitcoin::BlockHeader>,
        tree: &mut T,
    ) {
        self.inflight = None;
        if headers.is_empty() {
            return;
        }

        let mut switched = false;
        if !self.downloading_bodies {
            if let Some(catchup) = self.config.fast_catchup_time {
                if let Some(cutoff) = headers.iter().position(|h| h.time >= catchup) {
                    headers.truncate(cutoff);
                    switched = true;
                }
            }
        }

        if headers.is_empty() {
            if switched {
                self.downloading_bodies = true;
                self.last_request = None;
                self.outbox.event(Event::BodyDownloadStateChanged { downloading_bodies: true });
                self.request(from, tree, BlockHash::default());
            }
            return;
        }

        match tree.import_blocks(headers.into_iter(), &self.clock) {
            Ok(spv_common::block::tree::ImportResult::TipChanged {
                hash,
                height,
                connected,
                reverted,
                header,
            }) => {
                self.outbox.event(Event::BlockHeadersImported {
                    hash,
                    height,
                    connected,
                    reverted,
                    reorg: false,
                });
                let _ = header;

                if switched || (!self.downloading_bodies && self.is_caught_up(tree)) {
                    self.downloading_bodies = true;
                    self.last_request = None;
                    self.outbox.event(Event::BodyDownloadStateChanged { downloading_bodies: true });
                    self.request(from, tree, BlockHash::default());
                } else {
                    self.request(from, tree, BlockHash::default());
                }
            }
            Ok(spv_common::block::tree::ImportResult::TipUnchanged) => {
                if tree.height() >= self.peer_height {
                    self.outbox.event(Event::BlockHeadersSynced {
                        height: tree.height(),
                        hash: tree.tip().0,
                    });
                }
            }
            Err(error) => {
                log::warn!(target: "p2p", "Failed to import headers: {}", error);
            }
        }
    }

    /// Process an event relevant to chain synchronization.
    pub fn received_event<T: BlockTree>(&mut self, event: Event, tree: &mut T) {
        match event {
            Event::PeerNegotiated { addr, height, .. } => {
                if self.sync_peer.is_none() {
                    self.sync_peer = Some(addr);
                }
                self.peer_height = self.peer_height.max(height);
                self.request(addr, tree, BlockHash::default());
            }
            Event::PeerDisconnected { addr, .. } => {
                if self.sync_peer == Some(addr) {
                    self.sync_peer = None;
                    self.last_request = None;
                    self.inflight = None;
                }
            }
            Event::MessageReceived { from, message } => {
                if let spv_common::bitcoin::network::message::NetworkMessage::Headers(headers) =
                    message.as_ref()
                {
                    let headers = headers.iter().map(|h| h.header).collect();
                    self.import_headers(from, headers, tree);
                }
            }
            _ => {}
        }
    }

    /// A timer fired; re-issue any request that hasn't been answered in time.
    pub fn timer_expired<T: BlockReader>(&mut self, tree: &T) {
        let Some(req) = self.inflight else {
            return;
        };
        let now = self.clock.local_time();
        if now.duration_since(req.sent_at) >= self.config.request_timeout {
            self.last_request = None;
            self.request(req.peer, tree, BlockHash::default());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::super::output::Io;
    use super::super::Link;
    use spv_chain::BlockCache;
    use spv_common::block::store::Memory;
    use spv_common::block::tree::BlockTree;
    use spv_common::network::Network;

    fn tree_with(n: usize) -> BlockCache<Memory<spv_common::bitcoin::BlockHeader>> {
        let headers = spv_testutil::block::chain(7, n);
        let store = Memory::new(spv_common::nonempty::NonEmpty::from_vec(headers).unwrap());
        BlockCache::from(store, Network::Regtest.params(), &[]).unwrap()
    }

    fn config() -> Config {
        Config {
            max_message_headers: MAX_MESSAGE_HEADERS,
            request_timeout: REQUEST_TIMEOUT,
            params: Network::Regtest.params(),
            fast_catchup_time: None,
        }
    }

    // Without a fast-catchup time, the sync manager starts in body-download
    // mode immediately; headers-only mode is only entered when a catchup
    // time lies in the future of the tree's tip.
    #[test]
    fn test_initialize_without_fast_catchup_downloads_bodies() {
        let tree = tree_with(3);
        let mut mgr: SyncManager<()> = SyncManager::new(config(), ());
        mgr.initialize(&tree);
        assert!(mgr.downloading_bodies());
    }

    #[test]
    fn test_initialize_with_future_catchup_stays_headers_only() {
        let tree = tree_with(3);
        let (_, tip) = tree.tip();
        let mut cfg = config();
        cfg.fast_catchup_time = Some(tip.time + 1_000_000);
        let mut mgr: SyncManager<()> = SyncManager::new(cfg, ());
        mgr.initialize(&tree);
        assert!(!mgr.downloading_bodies());
    }

    // A peer negotiating claims a height; the sync manager adopts it as the
    // sync peer and immediately issues a request.
    #[test]
    fn test_peer_negotiated_becomes_sync_peer_and_requests() {
        let mut tree = tree_with(3);
        let mut mgr: SyncManager<()> = SyncManager::new(config(), ());
        let peer: PeerId = "1.2.3.4:8333".parse().unwrap();

        mgr.received_event(
            Event::PeerNegotiated {
                addr: peer,
                link: Link::Outbound,
                services: spv_common::bitcoin::network::constants::ServiceFlags::NETWORK,
                persistent: false,
                height: 100,
                receiver: spv_common::bitcoin::network::address::Address::new(
                    &peer,
                    spv_common::bitcoin::network::constants::ServiceFlags::NONE,
                ),
                user_agent: String::new(),
                version: 70016,
                relay: true,
            },
            &mut tree,
        );

        let requested: Vec<Io> = mgr.by_ref().collect();
        assert!(requested
            .iter()
            .any(|io| matches!(io, Io::Write(a, spv_common::bitcoin::network::message::NetworkMessage::GetBlocks(_)) if *a == peer)));
    }

    // Disconnecting the current sync peer clears it and any in-flight
    // request, so a future peer negotiation can take over.
    #[test]
    fn test_sync_peer_disconnect_clears_state() {
        let mut mgr: SyncManager<()> = SyncManager::new(config(), ());
        let peer: PeerId = "5.6.7.8:8333".parse().unwrap();
        mgr.sync_peer = Some(peer);
        mgr.inflight = Some(Request { peer, sent_at: spv_common::block::time::LocalTime::from_millis(0) });

        mgr.received_event(
            Event::PeerDisconnected { addr: peer, reason: spv_net::Disconnect::Command },
            &mut tree_with(1),
        );

        assert_eq!(mgr.sync_peer, None);
        assert!(mgr.inflight.is_none());
    }
}
