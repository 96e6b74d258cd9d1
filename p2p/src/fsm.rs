//! Bitcoin protocol state machine.
#![warn(missing_docs)]
use crossbeam_channel as chan;
use log::*;

pub mod bloom_cache;
pub mod codec;
pub mod event;
pub mod output;
pub mod traits;

// Sub-protocols.
mod addrmgr;
mod backoff;
mod bfmgr;
mod broadcastmgr;
mod invmgr;
mod peermgr;
mod pingmgr;
mod syncmgr;

#[cfg(test)]
mod tests;

use addrmgr::AddressManager;
use bfmgr::BloomManager;
use broadcastmgr::BroadcastManager;
use invmgr::InventoryManager;
use output::Outbox;
use peermgr::PeerManager;
use pingmgr::PingManager;
use syncmgr::SyncManager;

pub use event::Event;
pub use spv_net::Link;
pub use traits::{
    ChainStore, Connector, FilterProvider, SharedFilterProvider, SharedWalletSink,
    TxConfidenceTable, WalletSink,
};

use std::collections::HashSet;
use std::fmt::{self, Debug};
use std::net;
use std::ops::Bound;
use std::sync::Arc;

use spv_common::bitcoin::consensus::encode;
use spv_common::bitcoin::network::address::Address;
use spv_common::bitcoin::network::constants::ServiceFlags;
use spv_common::bitcoin::network::message::NetworkMessage;
use spv_common::bitcoin::network::message_network::VersionMessage;
use spv_common::bitcoin::{BlockHeader, Txid};
use spv_common::block::time::{AdjustedClock, LocalDuration, LocalTime};
use spv_common::block::tree::{self, BlockReader, ImportResult};
use spv_common::block::{BlockHash, Height, Transaction};
use spv_common::network;
use spv_common::p2p::peer;

use thiserror::Error;

/// Peer-to-peer protocol version.
pub const PROTOCOL_VERSION: u32 = 70016;
/// Minimum supported peer protocol version.
pub const MIN_PROTOCOL_VERSION: u32 = 70012;
/// User agent included in `version` messages.
pub const USER_AGENT: &str = "/spv-core:0.1.0/";

/// Block locators. Consists of starting hashes and a stop hash.
type Locators = (Vec<BlockHash>, BlockHash);

/// Output of a state transition.
pub type Io = spv_net::Io<NetworkMessage, Event, DisconnectReason>;

/// Identifies a peer.
pub type PeerId = net::SocketAddr;

/// Disconnect reason.
#[derive(Debug, Clone)]
pub enum DisconnectReason {
    /// Peer is misbehaving.
    PeerMisbehaving(&'static str),
    /// Peer protocol version is too old or too recent.
    PeerProtocolVersion(u32),
    /// Peer doesn't have the required services.
    PeerServices(ServiceFlags),
    /// Peer chain is too far behind.
    PeerHeight(Height),
    /// Peer magic is invalid.
    PeerMagic(u32),
    /// Peer timed out.
    PeerTimeout(&'static str),
    /// Connection to self was detected.
    SelfConnection,
    /// Inbound connection limit reached.
    ConnectionLimit,
    /// Error trying to decode incoming message.
    DecodeError(Arc<encode::Error>),
    /// Peer was forced to disconnect by external command.
    Command,
    /// Peer was disconnected for another reason.
    Other(&'static str),
}

impl DisconnectReason {
    /// Check whether the disconnect reason is transient, ie. may no longer
    /// be applicable after some time.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::ConnectionLimit | Self::PeerTimeout(_) | Self::PeerHeight(_))
    }
}

impl From<DisconnectReason> for spv_net::Disconnect<DisconnectReason> {
    fn from(reason: DisconnectReason) -> Self {
        Self::StateMachine(reason)
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PeerMisbehaving(reason) => write!(f, "peer misbehaving: {}", reason),
            Self::PeerProtocolVersion(_) => write!(f, "peer protocol version mismatch"),
            Self::PeerServices(_) => write!(f, "peer doesn't have the required services"),
            Self::PeerHeight(_) => write!(f, "peer is too far behind"),
            Self::PeerMagic(magic) => write!(f, "received message with invalid magic: {}", magic),
            Self::PeerTimeout(s) => write!(f, "peer timed out: {:?}", s),
            Self::SelfConnection => write!(f, "detected self-connection"),
            Self::ConnectionLimit => write!(f, "inbound connection limit reached"),
            Self::DecodeError(err) => write!(f, "message decode error: {}", err),
            Self::Command => write!(f, "received external command"),
            Self::Other(reason) => write!(f, "{}", reason),
        }
    }
}

/// A remote peer, as seen by the client.
#[derive(Debug, Clone)]
pub struct Peer {
    /// Peer address.
    pub addr: net::SocketAddr,
    /// Connection link.
    pub link: Link,
    /// Connected since this time.
    pub since: LocalTime,
    /// The peer's best height.
    pub height: Height,
    /// The peer's services.
    pub services: ServiceFlags,
    /// Whether this peer relays transactions.
    pub relay: bool,
    /// Round-trip latency, if known.
    pub latency: LocalDuration,
}

impl Peer {
    /// Check if this is an outbound peer.
    pub fn is_outbound(&self) -> bool {
        self.link.is_outbound()
    }
}

/// A command or request that can be sent to the protocol.
#[derive(Clone)]
pub enum Command {
    /// Get block header at height.
    GetBlockByHeight(Height, chan::Sender<Option<BlockHeader>>),
    /// Get a block from the active chain, by requesting it from peers.
    GetBlock(BlockHash),
    /// Get connected peers matching a service filter.
    GetPeers(ServiceFlags, chan::Sender<Vec<Peer>>),
    /// Get the tip of the active chain.
    GetTip(chan::Sender<(Height, BlockHeader)>),
    /// Rescan the chain for matching scripts, via a bloom-filtered
    /// merkle-block scan.
    Rescan {
        /// Start scan from this height. If unbounded, start at the current height.
        from: Bound<Height>,
        /// Stop scanning at this height. If unbounded, don't stop scanning.
        to: Bound<Height>,
    },
    /// Connect to a peer.
    Connect(net::SocketAddr),
    /// Disconnect from a peer.
    Disconnect(net::SocketAddr),
    /// Import headers directly into the block store.
    ImportHeaders(
        Vec<BlockHeader>,
        chan::Sender<Result<ImportResult, tree::Error>>,
    ),
    /// Import addresses into the address book.
    ImportAddresses(Vec<Address>),
    /// Submit a transaction to the network.
    SubmitTransaction(Transaction, usize),
    /// Get a previously submitted transaction.
    GetSubmittedTransaction(Txid, chan::Sender<Option<Transaction>>),
    /// Load a bloom filter onto every connected peer.
    LoadBloomFilter(spv_common::bitcoin::network::message_bloom::FilterLoad, bool),
    /// Clear every connected peer's bloom filter.
    BloomFilterClear,
    /// Stop the reactor: disconnect every peer and return from its run loop.
    /// Handled by the reactor directly, never reaches [`StateMachine::command`].
    Shutdown,
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::GetBlockByHeight(height, _) => write!(f, "GetBlockByHeight({})", height),
            Self::GetBlock(hash) => write!(f, "GetBlock({})", hash),
            Self::GetPeers(flags, _) => write!(f, "GetPeers({})", flags),
            Self::GetTip(_) => write!(f, "GetTip"),
            Self::Rescan { from, to } => write!(f, "Rescan({:?}, {:?})", from, to),
            Self::Connect(addr) => write!(f, "Connect({})", addr),
            Self::Disconnect(addr) => write!(f, "Disconnect({})", addr),
            Self::ImportHeaders(_headers, _) => write!(f, "ImportHeaders(..)"),
            Self::ImportAddresses(addrs) => write!(f, "ImportAddresses({:?})", addrs),
            Self::SubmitTransaction(tx, min) => write!(f, "SubmitTransaction({}, min={})", tx.txid(), min),
            Self::GetSubmittedTransaction(txid, _) => write!(f, "GetSubmittedTransaction({})", txid),
            Self::LoadBloomFilter(_, query_mempool) => write!(f, "LoadBloomFilter(query_mempool={})", query_mempool),
            Self::BloomFilterClear => write!(f, "BloomFilterClear"),
            Self::Shutdown => write!(f, "Shutdown"),
        }
    }
}

/// A generic error resulting from processing a [`Command`].
#[derive(Error, Debug)]
pub enum CommandError {
    /// Not connected to any peer with the required services.
    #[error("not connected to any peer with the required services")]
    NotConnected,
}

/// Holds functions that are used to hook into or alter protocol behavior.
#[derive(Clone)]
pub struct Hooks {
    /// Called when we receive a message from a peer.
    /// If an error is returned, the message is not further processed.
    pub on_message: Arc<dyn Fn(PeerId, &NetworkMessage, &Outbox) -> Result<(), &'static str> + Send + Sync>,
    /// Called when a `version` message is received.
    /// If an error is returned, the peer is dropped, and the error is logged.
    pub on_version: Arc<dyn Fn(PeerId, &VersionMessage) -> Result<(), &'static str> + Send + Sync>,
}

impl Default for Hooks {
    fn default() -> Self {
        Self {
            on_message: Arc::new(|_, _, _| Ok(())),
            on_version: Arc::new(|_, _| Ok(())),
        }
    }
}

impl fmt::Debug for Hooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hooks").finish()
    }
}

///////////////////////////////////////////////////////////////////////////////////////////////

/// Configured limits.
#[derive(Debug, Clone)]
pub struct Limits {
    /// Target outbound peer connections.
    pub target_connections: usize,
    /// Maximum inbound peer connections.
    pub max_inbound_peers: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            target_connections: peermgr::TARGET_OUTBOUND_PEERS,
            max_inbound_peers: peermgr::MAX_INBOUND_PEERS,
        }
    }
}

/// State machine configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Bitcoin network we are connected to.
    pub network: network::Network,
    /// Peers to connect to.
    pub connect: Vec<net::SocketAddr>,
    /// Supported communication domains.
    pub domains: Vec<spv_common::p2p::Domain>,
    /// Required peer services.
    pub required_services: ServiceFlags,
    /// Peer whitelist. Peers in this list are trusted by default.
    pub whitelist: Whitelist,
    /// Our protocol version.
    pub protocol_version: u32,
    /// Minimum protocol version accepted from peers.
    pub min_required_protocol_version: u32,
    /// Our user agent.
    pub user_agent: &'static str,
    /// Ping timeout, after which remotes are disconnected.
    pub ping_timeout: LocalDuration,
    /// Minimum number of peers required to consider a broadcast complete,
    /// beyond the one it was handed to directly. `0` derives
    /// `ceil(0.8 * target_connections)`.
    pub min_broadcast_connections: usize,
    /// Number of levels of unconfirmed dependency to download for a matched
    /// transaction. `0` disables dependency download.
    pub download_tx_dependency_depth: usize,
    /// If set, the connection driver dials `127.0.0.1` on the network's
    /// default port before falling back to discovery, on the first run.
    pub prefer_localhost: bool,
    /// Whether to accept peers that advertise a zero best height.
    pub allow_empty_peer_chain: bool,
    /// State machine event hooks.
    pub hooks: Hooks,
    /// Configured limits.
    pub limits: Limits,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            network: network::Network::default(),
            connect: Vec::new(),
            domains: spv_common::p2p::Domain::all(),
            required_services: ServiceFlags::NETWORK,
            whitelist: Whitelist::default(),
            protocol_version: PROTOCOL_VERSION,
            min_required_protocol_version: MIN_PROTOCOL_VERSION,
            ping_timeout: pingmgr::PING_TIMEOUT,
            user_agent: USER_AGENT,
            min_broadcast_connections: 0,
            download_tx_dependency_depth: 2,
            prefer_localhost: false,
            allow_empty_peer_chain: false,
            hooks: Hooks::default(),
            limits: Limits::default(),
        }
    }
}

impl Config {
    /// Construct a new configuration.
    pub fn from(network: network::Network, connect: Vec<net::SocketAddr>) -> Self {
        Self {
            network,
            connect,
            ..Self::default()
        }
    }

    /// Get the listen port.
    pub fn port(&self) -> u16 {
        self.network.port()
    }

    /// The effective minimum broadcast connection count, deriving the
    /// default from [`Limits::target_connections`] if unset.
    fn min_broadcast_connections(&self) -> usize {
        if self.min_broadcast_connections == 0 {
            ((self.limits.target_connections as f64 * 0.8).ceil() as usize).max(1)
        } else {
            self.min_broadcast_connections
        }
    }
}

/// Peer whitelist.
#[derive(Debug, Clone, Default)]
pub struct Whitelist {
    /// Trusted addresses.
    addr: HashSet<net::IpAddr>,
    /// Trusted user-agents.
    user_agent: HashSet<String>,
}

impl Whitelist {
    #[allow(dead_code)]
    fn contains(&self, addr: &net::IpAddr, user_agent: &str) -> bool {
        self.addr.contains(addr) || self.user_agent.contains(user_agent)
    }
}

/// An instance of the Bitcoin P2P network protocol. Parametrized over the
/// chain store and the known-address store.
#[derive(Debug)]
pub struct StateMachine<T, P, C> {
    /// Chain header store.
    tree: T,
    /// Bitcoin network we're connecting to.
    network: network::Network,
    /// Peer address manager.
    addrmgr: AddressManager<P, C>,
    /// Blockchain synchronization manager.
    syncmgr: SyncManager<C>,
    /// Ping manager.
    pingmgr: PingManager<C>,
    /// Bloom filter manager.
    bfmgr: BloomManager<C>,
    /// Peer manager.
    peermgr: PeerManager<C>,
    /// Inventory manager.
    invmgr: InventoryManager<C>,
    /// Transaction broadcast manager.
    broadcastmgr: BroadcastManager,
    /// Network-adjusted clock.
    clock: C,
    /// Last time a periodic status line was logged.
    #[allow(dead_code)]
    last_tick: LocalTime,
    /// Outbound I/O. Used to communicate protocol events with a reactor.
    outbox: Outbox,
    /// State machine event hooks.
    hooks: Hooks,
    /// Minimum peers (beyond the first) needed for a broadcast to succeed.
    min_broadcast_connections: usize,
    /// Dependency download depth for matched transactions.
    download_tx_dependency_depth: usize,
}

impl<T: ChainStore, P: peer::Store, C: AdjustedClock<PeerId>> StateMachine<T, P, C> {
    /// Construct a new protocol instance.
    pub fn new(tree: T, peers: P, clock: C, config: Config) -> Self {
        let min_broadcast_connections = config.min_broadcast_connections();
        let Config {
            network,
            connect,
            domains,
            whitelist,
            protocol_version,
            min_required_protocol_version,
            ping_timeout,
            user_agent,
            required_services,
            download_tx_dependency_depth,
            allow_empty_peer_chain,
            hooks,
            limits,
            ..
        } = config;

        let outbox = Outbox::default();
        let syncmgr = SyncManager::new(
            syncmgr::Config {
                max_message_headers: syncmgr::MAX_MESSAGE_HEADERS,
                request_timeout: syncmgr::REQUEST_TIMEOUT,
                params: network.params(),
                fast_catchup_time: None,
            },
            clock.clone(),
        );
        let pingmgr = PingManager::new(clock.clone());
        let peermgr = PeerManager::new(
            peermgr::Config {
                protocol_version,
                min_required_version: min_required_protocol_version,
                target_outbound_peers: limits.target_connections,
                max_inbound_peers: limits.max_inbound_peers,
                required_services,
                domains: domains.clone(),
                persistent: connect,
                allow_empty_peer_chain,
            },
            clock.clone(),
        );
        let _ = (whitelist, ping_timeout, user_agent);
        let addrmgr = AddressManager::new(
            addrmgr::Config {
                required_services,
                domains,
            },
            peers,
            clock.clone(),
        );
        let invmgr = InventoryManager::new(clock.clone());
        let bfmgr = BloomManager::new(clock.clone());
        let broadcastmgr = BroadcastManager::new();

        Self {
            tree,
            network,
            clock,
            addrmgr,
            syncmgr,
            pingmgr,
            bfmgr,
            peermgr,
            invmgr,
            broadcastmgr,
            last_tick: LocalTime::default(),
            outbox,
            hooks,
            min_broadcast_connections,
            download_tx_dependency_depth,
        }
    }

    /// Disconnect a peer.
    pub fn disconnect(&mut self, addr: PeerId, reason: DisconnectReason) {
        self.peermgr.disconnect(addr, reason);
    }

    /// Feed observed wire-frame byte counts into the stall detector. Called
    /// by the reactor, which sees raw socket reads that the parsed
    /// [`Event::MessageReceived`] stream does not carry.
    pub fn record_received(&mut self, addr: &PeerId, bytes: usize) {
        self.peermgr.record_received(addr, bytes);
    }

    /// Register a wallet sink, consulted by the inventory manager to decide
    /// which received transactions are relevant, and by the Bloom filter
    /// manager to detect filter exhaustion.
    pub fn register_wallet_sink(&mut self, sink: traits::SharedWalletSink) {
        self.invmgr.register_wallet_sink(sink.clone());
        self.bfmgr.register_wallet_sink(sink);
    }

    /// Register a filter provider, consulted when merging a fresh Bloom
    /// filter in response to [`Command::LoadBloomFilter`].
    pub fn register_filter_provider(&mut self, provider: traits::SharedFilterProvider) {
        self.bfmgr.register_filter_provider(provider);
    }

    /// Create a draining iterator over the protocol outputs.
    pub fn drain(&mut self) -> Box<dyn Iterator<Item = Io> + '_> {
        Box::new(std::iter::from_fn(|| self.next()))
    }
}

impl<T: ChainStore, P: peer::Store, C: AdjustedClock<PeerId>> Iterator for StateMachine<T, P, C> {
    type Item = Io;

    fn next(&mut self) -> Option<Io> {
        let next = self
            .outbox
            .next()
            .or_else(|| self.peermgr.next())
            .or_else(|| self.syncmgr.next())
            .or_else(|| self.invmgr.next())
            .or_else(|| self.pingmgr.next())
            .or_else(|| self.addrmgr.next())
            .or_else(|| self.bfmgr.next())
            .or_else(|| self.broadcastmgr.next());

        match next {
            Some(Io::Event(e)) => {
                self.event(e.clone());
                Some(Io::Event(e))
            }
            other => other,
        }
    }
}

impl<T: ChainStore, P: peer::Store, C: AdjustedClock<PeerId>> StateMachine<T, P, C> {
    /// Propagate an event internally to the sub-systems.
    pub fn event(&mut self, e: Event) {
        self.pingmgr.received_event(e.clone());
        self.invmgr.received_event(e.clone());
        self.syncmgr.received_event(e.clone(), &mut self.tree);
        self.addrmgr.received_event(e.clone());
        self.bfmgr.received_event(e.clone(), &mut self.tree);
        self.broadcastmgr.received_event(e.clone());
        self.peermgr.received_event(&e);

        if let Event::ReceivedMatchedTx { transaction } = &e {
            if self.download_tx_dependency_depth > 0 {
                if let Some(peer) = self.peermgr.download_peer().or_else(|| self.peermgr.negotiated(Link::Outbound).next().map(|(a, _)| *a)) {
                    self.invmgr
                        .download_dependencies(peer, transaction, self.download_tx_dependency_depth);
                }
            }
        }
    }

    /// Process a user command.
    pub fn command(&mut self, cmd: Command) {
        debug!(target: "p2p", "Received command: {:?}", cmd);

        match cmd {
            Command::GetBlock(hash) => {
                self.invmgr.get_block(hash);
            }
            Command::GetBlockByHeight(height, reply) => {
                let header = self.tree.get_block_by_height(height).copied();
                reply.send(header).ok();
            }
            Command::GetPeers(services, reply) => {
                let peers: Vec<Peer> = self
                    .peermgr
                    .peers()
                    .filter(|(_, p)| p.is_ready() && p.services.has(services))
                    .map(|(addr, p)| Peer {
                        addr: *addr,
                        link: p.link,
                        since: p.since,
                        height: p.height,
                        services: p.services,
                        relay: p.relay,
                        latency: self.pingmgr.peers.get(addr).and_then(|pp| pp.latency()).unwrap_or(LocalDuration::from_secs(0)),
                    })
                    .collect();
                reply.send(peers).ok();
            }
            Command::Connect(addr) => {
                self.peermgr.whitelist(addr);
                self.peermgr.connect(&addr);
            }
            Command::Disconnect(addr) => {
                self.peermgr.disconnect(addr, DisconnectReason::Command);
            }
            Command::ImportHeaders(headers, reply) => {
                match self.tree.import_blocks(headers.into_iter(), &self.clock) {
                    Ok(result) => {
                        reply.send(Ok(result)).ok();
                    }
                    Err(err) => {
                        reply.send(Err(err)).ok();
                    }
                }
            }
            Command::ImportAddresses(addrs) => {
                self.addrmgr.insert(
                    addrs.into_iter().map(|a| (spv_common::block::BlockTime::default(), a)),
                    peer::Source::Imported,
                );
            }
            Command::GetTip(reply) => {
                let (_, header) = self.tree.tip();
                let height = self.tree.height();
                reply.send((height, header)).ok();
            }
            Command::SubmitTransaction(tx, min_connections) => {
                self.broadcastmgr.broadcast(tx, min_connections.max(self.min_broadcast_connections));
            }
            Command::GetSubmittedTransaction(txid, reply) => {
                let tx = self.invmgr.get_submitted_tx(txid);
                reply.send(tx).ok();
            }
            Command::Rescan { from, to } => {
                self.bfmgr.merkle_scan(from, to, &self.tree);
            }
            Command::LoadBloomFilter(filter, query_mempool) => {
                let (filter, mode) = self.bfmgr.rebuild_filter(filter);
                if !matches!(mode, bfmgr::FilterUpdateMode::DontSend) {
                    let peers: Vec<PeerId> = self.peermgr.negotiated(Link::Outbound).chain(self.peermgr.negotiated(Link::Inbound)).map(|(a, _)| *a).collect();
                    self.event(Event::LoadBloomFilter { peers, filter, all: true });
                    if query_mempool {
                        self.bfmgr.get_mempool();
                    }
                }
            }
            Command::BloomFilterClear => {
                self.bfmgr.send_bloom_filter_clear();
            }
            Command::Shutdown => {
                // Intercepted by the reactor before it reaches here; a no-op
                // if the state machine is ever driven without one.
            }
        }
    }
}

impl<T: ChainStore, P: peer::Store, C: AdjustedClock<PeerId>> spv_net::StateMachine for StateMachine<T, P, C> {
    type Message = NetworkMessage;
    type Event = Event;
    type DisconnectReason = DisconnectReason;

    fn initialize(&mut self, time: LocalTime) {
        self.clock.set(time);
        self.outbox.event(Event::Initializing);
        self.addrmgr.initialize();
        self.syncmgr.initialize(&self.tree);
        self.peermgr.initialize(&mut self.addrmgr);
        self.bfmgr.initialize(&self.tree);
        self.broadcastmgr.initialize();
        self.outbox.event(Event::Ready {
            tip: self.tree.height(),
            time,
        });
    }

    fn message_received(&mut self, addr: &net::SocketAddr, msg: std::borrow::Cow<NetworkMessage>) {
        let addr = *addr;
        let msg = msg.into_owned();

        if !self.peermgr.is_connected(&addr) {
            debug!(target: "p2p", "Received {:?} from unknown peer {}", msg.cmd(), addr);
            return;
        }

        if let Err(err) = (self.hooks.on_message)(addr, &msg, &self.outbox) {
            debug!(target: "p2p", "Message {:?} from {} dropped by user hook: {}", msg.cmd(), addr, err);
            return;
        }

        // Nb. We only send this message internally, hence we don't push it to our outbox.
        self.event(Event::MessageReceived {
            from: addr,
            message: Arc::new(msg),
        });
    }

    fn attempted(&mut self, addr: &net::SocketAddr) {
        self.peermgr.peer_attempted(addr);
    }

    fn connected(&mut self, addr: net::SocketAddr, local_addr: &net::SocketAddr, link: Link) {
        self.peermgr.peer_connected(addr, *local_addr, link);
    }

    fn disconnected(&mut self, addr: &net::SocketAddr, reason: spv_net::Disconnect<DisconnectReason>) {
        self.peermgr.peer_disconnected(addr);
        let _ = reason;
    }

    fn tick(&mut self, local_time: LocalTime) {
        trace!("Received tick");
        self.clock.set(local_time);
    }

    fn timer_expired(&mut self) {
        trace!("Received wake");

        self.invmgr.timer_expired();
        self.syncmgr.timer_expired(&self.tree);
        self.pingmgr.timer_expired();
        self.addrmgr.timer_expired();
        self.peermgr.timer_expired(&mut self.addrmgr);
        self.bfmgr.timer_expired(&self.tree);
        self.broadcastmgr.timer_expired();

        let local_time = self.clock.local_time();
        if local_time.duration_since(self.last_tick) >= LocalDuration::from_secs(10) {
            let (tip, _) = self.tree.tip();
            let height = self.tree.height();
            let best = self.syncmgr.best_height(&self.tree);
            let sync = if best > 0 { height as f64 / best as f64 * 100. } else { 0. };
            let outbound = self.peermgr.negotiated(Link::Outbound).count();
            let inbound = self.peermgr.negotiated(Link::Inbound).count();
            let connecting = self.peermgr.connecting().count();
            let addresses = self.addrmgr.len();

            log::info!(
                target: "p2p",
                "tip = {}, headers = {}/{} ({:.1}%), inbound = {}, outbound = {}, connecting = {}, addresses = {}",
                tip, height, best, sync, inbound, outbound, connecting, addresses,
            );
            log::info!(
                target: "p2p",
                "inventory block queue = {}, requested = {}, mempool = {}",
                self.invmgr.received.len(),
                self.invmgr.remaining.len(),
                self.invmgr.mempool.len(),
            );

            self.last_tick = local_time;
        }
    }
}
