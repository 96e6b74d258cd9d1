//! Peer connection manager: handshake, pool bookkeeping, download-peer
//! election and the stall detector.
use std::collections::HashMap;

use spv_common::bitcoin::network::constants::ServiceFlags;
use spv_common::bitcoin::network::message::NetworkMessage;
use spv_common::block::time::{Clock, LocalDuration, LocalTime};
use spv_common::block::Height;
use spv_common::p2p::Domain;

use super::output::{version_message, Outbox, REQUIRED_SERVICES};
use super::{DisconnectReason, Event, Link, PeerId};

/// Default number of outbound connections to maintain.
pub const TARGET_OUTBOUND_PEERS: usize = 8;
/// Default maximum number of inbound connections accepted.
pub const MAX_INBOUND_PEERS: usize = 16;
/// How long to wait for a handshake to complete before disconnecting.
pub const HANDSHAKE_TIMEOUT: LocalDuration = LocalDuration::from_secs(30);
/// How long after a download peer is (re-)elected before the stall detector
/// starts counting samples against it.
pub const STALL_WARMUP: LocalDuration = LocalDuration::from_secs(15);
/// Width of the sliding window the stall detector averages throughput over.
pub const STALL_WINDOW_SECS: u64 = 10;
/// Minimum bytes/sec from the download peer before it's considered stalled.
pub const STALL_MIN_BYTES_PER_SEC: usize = 1600;
/// Number of stall-triggered disconnects allowed before the detector gives up.
pub const STALL_DISCONNECTS_ALLOWED: usize = 3;

/// Handshake progress for a single peer, per spec: `OPEN -> OUTGOING_VERSION_SENT
/// -> BOTH_VERSIONS_EXCHANGED -> READY -> CLOSED`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    /// Transport connected, our version not yet sent.
    Open,
    /// We've sent our version, awaiting the peer's.
    VersionSent,
    /// Both versions exchanged, awaiting the final verack.
    VersionsExchanged,
    /// Handshake complete; peer is fully usable.
    Ready,
}

/// A tracked peer connection.
#[derive(Debug, Clone)]
pub struct PeerInfo {
    /// Connection direction.
    pub link: Link,
    /// Handshake progress.
    pub state: HandshakeState,
    /// Whether this peer was configured manually and should always be retried.
    pub persistent: bool,
    /// Services the peer advertises, once known.
    pub services: ServiceFlags,
    /// Best height the peer claims, once known.
    pub height: Height,
    /// Negotiated protocol version, once known.
    pub version: u32,
    /// Whether the peer relays unconfirmed transactions to us.
    pub relay: bool,
    /// Time the connection was established.
    pub since: LocalTime,
    /// Bytes received from this peer since the last stall sample.
    bytes_since_sample: usize,
}

impl PeerInfo {
    fn new(link: Link, persistent: bool, since: LocalTime) -> Self {
        Self {
            link,
            state: HandshakeState::Open,
            persistent,
            services: ServiceFlags::NONE,
            height: 0,
            version: 0,
            relay: true,
            since,
            bytes_since_sample: 0,
        }
    }

    /// Whether the peer has completed the handshake.
    pub fn is_ready(&self) -> bool {
        matches!(self.state, HandshakeState::Ready)
    }
}

/// Peer manager configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Our protocol version.
    pub protocol_version: u32,
    /// Minimum protocol version we accept from peers.
    pub min_required_version: u32,
    /// Target number of outbound connections.
    pub target_outbound_peers: usize,
    /// Maximum number of inbound connections.
    pub max_inbound_peers: usize,
    /// Services we require from outbound peers.
    pub required_services: ServiceFlags,
    /// Domains (IPv4/IPv6) we'll accept connections from.
    pub domains: Vec<Domain>,
    /// Addresses that should always be connected to and never dropped.
    pub persistent: Vec<PeerId>,
    /// Whether to accept peers that advertise a zero best height, ie. an
    /// apparently empty chain.
    pub allow_empty_peer_chain: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            protocol_version: super::PROTOCOL_VERSION,
            min_required_version: 70001,
            target_outbound_peers: TARGET_OUTBOUND_PEERS,
            max_inbound_peers: MAX_INBOUND_PEERS,
            required_services: REQUIRED_SERVICES,
            domains: Domain::all(),
            persistent: Vec::new(),
            allow_empty_peer_chain: false,
        }
    }
}

/// One sample in the stall detector's sliding window.
#[derive(Debug, Clone, Copy)]
struct Sample {
    time: LocalTime,
    bytes: usize,
}

/// Tracks throughput from the current download peer and disconnects it if it
/// stalls, per spec.
#[derive(Debug, Default)]
struct StallDetector {
    elected_at: Option<LocalTime>,
    window: Vec<Sample>,
    stalls_remaining: usize,
}

impl StallDetector {
    fn new() -> Self {
        Self {
            elected_at: None,
            window: Vec::new(),
            stalls_remaining: STALL_DISCONNECTS_ALLOWED,
        }
    }

    fn reset(&mut self, now: LocalTime) {
        self.elected_at = Some(now);
        self.window.clear();
    }

    fn sample(&mut self, now: LocalTime, bytes: usize) -> bool {
        let Some(elected_at) = self.elected_at else {
            return false;
        };
        if self.stalls_remaining == 0 {
            return false;
        }
        if now.duration_since(elected_at) < STALL_WARMUP {
            return false;
        }
        self.window.push(Sample { time: now, bytes });
        self.window
            .retain(|s| now.duration_since(s.time) <= LocalDuration::from_secs(STALL_WINDOW_SECS));

        if self.window.len() < STALL_WINDOW_SECS as usize {
            return false;
        }
        let total: usize = self.window.iter().map(|s| s.bytes).sum();
        let mean = total / self.window.len();

        if mean < STALL_MIN_BYTES_PER_SEC {
            self.stalls_remaining -= 1;
            self.window.clear();
            true
        } else {
            false
        }
    }
}

/// Manages the set of peer connections, the handshake protocol and
/// download-peer election.
#[derive(Debug)]
pub struct PeerManager<C> {
    /// Configuration.
    pub config: Config,
    clock: C,
    peers: HashMap<PeerId, PeerInfo>,
    connecting: std::collections::HashSet<PeerId>,
    whitelist: std::collections::HashSet<PeerId>,
    download_peer: Option<PeerId>,
    stall: StallDetector,
    outbox: Outbox,
}

impl<C> Iterator for PeerManager<C> {
    type Item = super::output::Io;

    fn next(&mut self) -> Option<Self::Item> {
        self.outbox.next()
    }
}

impl<C: Clock> PeerManager<C> {
    /// Create a new peer manager.
    pub fn new(config: Config, clock: C) -> Self {
        Self {
            config,
            clock,
            peers: HashMap::new(),
            connecting: std::collections::HashSet::new(),
            whitelist: std::collections::HashSet::new(),
            download_peer: None,
            stall: StallDetector::new(),
            outbox: Outbox::default(),
        }
    }

    /// All tracked peers, ready or not.
    pub fn peers(&self) -> impl Iterator<Item = (&PeerId, &PeerInfo)> {
        self.peers.iter()
    }

    /// Peers that have completed the handshake, optionally restricted to a link direction.
    pub fn negotiated(&self, link: Link) -> impl Iterator<Item = (&PeerId, &PeerInfo)> {
        self.peers
            .iter()
            .filter(move |(_, p)| p.is_ready() && p.link == link)
    }

    /// Addresses currently mid-connect, not yet negotiated.
    pub fn connecting(&self) -> impl Iterator<Item = &PeerId> {
        self.connecting.iter()
    }

    /// Whether we're connected (ready) to the given peer.
    pub fn is_connected(&self, addr: &PeerId) -> bool {
        self.peers.get(addr).map(|p| p.is_ready()).unwrap_or(false)
    }

    /// The current download peer, if one has been elected.
    pub fn download_peer(&self) -> Option<PeerId> {
        self.download_peer
    }

    /// Mark `addr` as trusted, so it's always a candidate for manual connection.
    pub fn whitelist(&mut self, addr: PeerId) {
        self.whitelist.insert(addr);
    }

    /// Queue a connection attempt to `addr`.
    pub fn connect(&mut self, addr: &PeerId) {
        self.connecting.insert(*addr);
        self.outbox.connect(*addr);
    }

    /// Queue a disconnection.
    pub fn disconnect(&mut self, addr: PeerId, reason: DisconnectReason) {
        self.outbox.disconnect(addr, reason);
    }

    /// Called once at startup: connect to persistent peers, then fill the
    /// remaining slots from the address book.
    pub fn initialize<P, CC>(&mut self, addrmgr: &mut super::addrmgr::AddressManager<P, CC>)
    where
        P: spv_common::p2p::peer::Store,
        CC: Clock,
    {
        for addr in self.config.persistent.clone() {
            self.connect(&addr);
        }
        self.fill_from(addrmgr);
    }

    /// Run the connection driver: if we're under our target outbound count,
    /// pop candidates from the address book until we're not (or it's empty).
    fn fill_from<P, CC>(&mut self, addrmgr: &mut super::addrmgr::AddressManager<P, CC>)
    where
        P: spv_common::p2p::peer::Store,
        CC: Clock,
    {
        while self.peers.len() + self.connecting.len() < self.config.target_outbound_peers {
            match addrmgr.sample(self.config.required_services) {
                Some(addr) => self.connect(&addr),
                None => break,
            }
        }
    }

    /// A TCP connection to `addr` was established.
    pub fn peer_connected(&mut self, addr: PeerId, local_addr: std::net::SocketAddr, link: Link) {
        self.connecting.remove(&addr);

        let now = self.clock.local_time();
        let persistent = self.config.persistent.contains(&addr);
        self.peers.insert(addr, PeerInfo::new(link, persistent, now));

        let nonce = fastrand::u64(..);
        let version = version_message(addr, local_addr, nonce, 0, now.as_secs() as i64);
        self.outbox.version(addr, version);
        if let Some(peer) = self.peers.get_mut(&addr) {
            peer.state = HandshakeState::VersionSent;
        }
        self.outbox.set_timer(HANDSHAKE_TIMEOUT);
    }

    /// A connection attempt to `addr` failed before completing.
    pub fn peer_attempted(&mut self, addr: &PeerId) {
        self.connecting.remove(addr);
    }

    /// Process a version message received from a peer mid-handshake.
    pub fn received_version(
        &mut self,
        addr: &PeerId,
        services: ServiceFlags,
        height: i32,
        version: u32,
        relay: bool,
    ) {
        let Some(peer) = self.peers.get_mut(addr) else {
            return;
        };
        if !matches!(peer.state, HandshakeState::VersionSent | HandshakeState::Open) {
            self.disconnect(*addr, DisconnectReason::PeerMisbehaving("unexpected version"));
            return;
        }
        if height < 0 {
            self.disconnect(*addr, DisconnectReason::PeerMisbehaving("negative height"));
            return;
        }
        if height == 0 && !self.config.allow_empty_peer_chain {
            self.disconnect(*addr, DisconnectReason::PeerMisbehaving("empty peer chain not allowed"));
            return;
        }
        if !services.has(self.config.required_services) {
            self.disconnect(*addr, DisconnectReason::PeerMisbehaving("missing required services"));
            return;
        }

        peer.services = services;
        peer.height = height as Height;
        peer.version = version;
        peer.relay = relay;
        peer.state = HandshakeState::VersionsExchanged;

        // BIP155: advertise support for `addrv2` before completing the handshake.
        self.outbox.message(*addr, NetworkMessage::SendAddrV2);
        self.outbox.verack(*addr);
    }

    /// Process a verack received from a peer mid-handshake.
    pub fn received_verack(&mut self, addr: &PeerId) {
        let ready = {
            let Some(peer) = self.peers.get_mut(addr) else {
                return;
            };
            if !matches!(peer.state, HandshakeState::VersionsExchanged) {
                None
            } else if peer.version < self.config.min_required_version {
                self.disconnect(*addr, DisconnectReason::PeerMisbehaving("protocol version too old"));
                return;
            } else {
                peer.state = HandshakeState::Ready;
                Some((peer.link, peer.services, peer.height, peer.version, peer.relay, peer.persistent))
            }
        };

        if let Some((link, services, height, version, relay, persistent)) = ready {
            self.outbox.event(Event::PeerNegotiated {
                addr: *addr,
                link,
                services,
                persistent,
                height,
                receiver: spv_common::bitcoin::network::address::Address::new(
                    addr,
                    services,
                ),
                user_agent: String::new(),
                version,
                relay,
            });

            if self.download_peer.is_none() {
                self.elect_download_peer();
            }
        }
    }

    /// A peer disconnected, for whatever reason.
    pub fn peer_disconnected(&mut self, addr: &PeerId) {
        self.peers.remove(addr);
        self.connecting.remove(addr);

        if self.download_peer.as_ref() == Some(addr) {
            self.download_peer = None;
            self.outbox.event(Event::DownloadPeerChanged { addr: None });
            self.elect_download_peer();
        }
    }

    /// Record bytes received from `addr`, feeding the stall detector if it's
    /// the current download peer. Called by the reactor, which sees raw wire
    /// frame lengths that the parsed [`Event::MessageReceived`] does not carry.
    pub fn record_received(&mut self, addr: &PeerId, bytes: usize) {
        if let Some(peer) = self.peers.get_mut(addr) {
            peer.bytes_since_sample += bytes;
        }
        if self.download_peer.as_ref() == Some(addr) {
            let now = self.clock.local_time();
            if let Some(peer) = self.peers.get_mut(addr) {
                let sample = std::mem::take(&mut peer.bytes_since_sample);
                if self.stall.sample(now, sample) {
                    self.disconnect(*addr, DisconnectReason::PeerTimeout("stalled"));
                }
            }
        }
    }

    /// Re-run download-peer election: the mode of connected peers' best
    /// heights, ties broken by picking the highest, selected uniformly among
    /// remaining candidates.
    pub fn elect_download_peer(&mut self) {
        let candidates: Vec<(PeerId, Height)> = self
            .peers
            .iter()
            .filter(|(_, p)| p.is_ready() && p.version >= self.config.min_required_version)
            .map(|(addr, p)| (*addr, p.height))
            .collect();

        if candidates.is_empty() {
            return;
        }

        let mut counts: HashMap<Height, usize> = HashMap::new();
        for (_, height) in &candidates {
            *counts.entry(*height).or_insert(0) += 1;
        }
        let max_count = counts.values().copied().max().unwrap_or(0);
        let best_height = counts
            .iter()
            .filter(|(_, count)| **count == max_count)
            .map(|(height, _)| *height)
            .max()
            .unwrap_or(0);

        let elected: Vec<PeerId> = candidates
            .into_iter()
            .filter(|(_, height)| *height == best_height)
            .map(|(addr, _)| addr)
            .collect();

        if let Some(addr) = elected.get(fastrand::usize(..elected.len().max(1))) {
            self.download_peer = Some(*addr);
            let now = self.clock.local_time();
            self.stall.reset(now);
            self.outbox.event(Event::PeerHeightUpdated { height: best_height });
            self.outbox.event(Event::DownloadPeerChanged { addr: Some(*addr) });
        }
    }

    /// A timer fired: disconnect stuck handshakes, then re-run the connection
    /// driver if we're short of our target.
    pub fn timer_expired<P, CC>(&mut self, addrmgr: &mut super::addrmgr::AddressManager<P, CC>)
    where
        P: spv_common::p2p::peer::Store,
        CC: Clock,
    {
        let now = self.clock.local_time();
        let stuck: Vec<PeerId> = self
            .peers
            .iter()
            .filter(|(_, p)| !p.is_ready() && now.duration_since(p.since) >= HANDSHAKE_TIMEOUT)
            .map(|(addr, _)| *addr)
            .collect();

        for addr in stuck {
            self.disconnect(addr, DisconnectReason::PeerTimeout("handshake"));
        }
        self.fill_from(addrmgr);
    }

    /// Process an event from the state machine relevant to peer bookkeeping.
    pub fn received_event(&mut self, event: &Event) {
        match event {
            Event::PeerConnected { addr, local_addr, link } => {
                self.peer_connected(*addr, *local_addr, *link);
            }
            Event::PeerDisconnected { addr, .. } => self.peer_disconnected(addr),
            Event::PeerConnectionFailed { addr, .. } => self.peer_attempted(addr),
            Event::MessageReceived { from, message } => match message.as_ref() {
                spv_common::bitcoin::network::message::NetworkMessage::Version(v) => {
                    self.received_version(from, v.services, v.start_height, v.version, v.relay);
                }
                spv_common::bitcoin::network::message::NetworkMessage::Verack => {
                    self.received_verack(from);
                }
                _ => {}
            },
            _ => {}
        }
    }
}
