//! Peer address book types.
use std::net;

use bitcoin::network::address::Address;
use bitcoin::network::constants::ServiceFlags;

use crate::block::time::LocalTime;

/// How an address was discovered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    /// Address came from a DNS seed.
    Dns,
    /// Address was imported manually, eg. via the command-line.
    Imported,
    /// Address was received via an `addr`/`addrv2` message from a peer.
    Peer(net::SocketAddr),
}

/// An address we know about, along with bookkeeping used to decide whether
/// and when to attempt a connection to it.
#[derive(Debug, Clone)]
pub struct KnownAddress {
    /// The network address.
    pub address: Address,
    /// How we learned about this address.
    pub source: Source,
    /// Last time this address was used to successfully connect and handshake.
    pub last_success: Option<LocalTime>,
    /// Last time we tried connecting to this address.
    pub last_attempt: Option<LocalTime>,
    /// Last time this address sent us something.
    pub last_active: Option<LocalTime>,
}

impl KnownAddress {
    /// Create a new known address from the given source.
    pub fn new(address: Address, source: Source) -> Self {
        Self { address, source, last_success: None, last_attempt: None, last_active: None }
    }

    /// The services this address claims to support.
    pub fn services(&self) -> ServiceFlags {
        self.address.services
    }
}

/// A store of peer addresses.
pub trait Store {
    /// Iterator over the addresses in the store.
    type Iter: Iterator<Item = (net::SocketAddr, KnownAddress)>;

    /// Get a known address.
    fn get(&self, ip: &net::IpAddr) -> Option<&KnownAddress>;
    /// Insert an address into the store. Returns `true` if it wasn't already present.
    fn insert(&mut self, ip: net::SocketAddr, ka: KnownAddress) -> bool;
    /// Remove an address from the store.
    fn remove(&mut self, ip: &net::IpAddr) -> Option<KnownAddress>;
    /// Iterate over all addresses, consuming the store.
    fn iter(&self) -> Self::Iter;
    /// Number of addresses in the store.
    fn len(&self) -> usize;
    /// Whether the store has no addresses.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
    /// Mark an address as successfully contacted at the given time.
    fn mark_success(&mut self, ip: net::SocketAddr, time: LocalTime);
    /// Mark an address as attempted at the given time.
    fn mark_attempt(&mut self, ip: net::SocketAddr, time: LocalTime);
    /// Mark an address as active at the given time, e.g. on message receipt.
    fn mark_active(&mut self, ip: net::SocketAddr, time: LocalTime);
}
