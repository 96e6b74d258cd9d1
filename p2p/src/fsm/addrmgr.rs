//! Address manager.
//!
//! Tracks known peer addresses and decides, via per-address exponential
//! backoff, which one is next in line to be dialed.
use std::net;

use spv_common::bitcoin::network::address::Address;
use spv_common::bitcoin::network::constants::ServiceFlags;
use spv_common::block::time::{Clock, LocalTime};
use spv_common::block::BlockTime;
use spv_common::collections::{group_key, HashMap};
use spv_common::p2p::peer::{KnownAddress, Source, Store};
use spv_common::p2p::Domain;

use super::backoff::Backoff;
use super::output::{Io, Outbox};
use super::Event;

/// Address manager configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Services a candidate address must advertise to be sampled.
    pub required_services: ServiceFlags,
    /// Address domains (IPv4/IPv6) we're willing to dial.
    pub domains: Vec<Domain>,
}

/// Tracks known peer addresses and dials candidates in backoff order.
#[derive(Debug)]
pub struct AddressManager<P, C> {
    cfg: Config,
    peers: P,
    clock: C,
    backoff: HashMap<net::IpAddr, Backoff>,
    /// The subnet group of the most recently sampled address, used to avoid
    /// repeatedly dialing addresses from the same network block.
    last_group: Option<net::IpAddr>,
    outbox: Outbox,
}

impl<P, C> Iterator for AddressManager<P, C> {
    type Item = Io;

    fn next(&mut self) -> Option<Self::Item> {
        self.outbox.next()
    }
}

impl<P: Store, C: Clock> AddressManager<P, C> {
    /// Create a new address manager.
    pub fn new(cfg: Config, peers: P, clock: C) -> Self {
        Self {
            cfg,
            peers,
            clock,
            backoff: HashMap::new(),
            last_group: None,
            outbox: Outbox::default(),
        }
    }

    /// Initialize the address manager.
    pub fn initialize(&mut self) {}

    /// Number of known addresses.
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    /// Whether any addresses are known.
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Insert newly-learned addresses into the store.
    pub fn insert(&mut self, addrs: impl Iterator<Item = (BlockTime, Address)>, source: Source) {
        let mut inserted = 0;
        for (_time, address) in addrs {
            if !self.is_candidate_domain(&address) {
                continue;
            }
            if let Ok(sockaddr) = address_to_socket(&address) {
                if self.peers.insert(sockaddr, KnownAddress::new(address, source)) {
                    inserted += 1;
                }
            }
        }
        if inserted > 0 {
            log::debug!(target: "p2p", "Inserted {} new address(es)", inserted);
        }
    }

    fn is_candidate_domain(&self, address: &Address) -> bool {
        address
            .socket_addr()
            .map(|a| self.cfg.domains.contains(&Domain::for_address(&a.ip())))
            .unwrap_or(false)
    }

    /// Pick the next candidate address whose backoff has elapsed, preferring
    /// one from a different subnet than the last address we sampled.
    pub fn sample(&mut self, services: ServiceFlags) -> Option<net::SocketAddr> {
        let now = self.clock.local_time();
        let required = self.cfg.required_services | services;

        let mut candidates: Vec<(net::SocketAddr, KnownAddress)> = self
            .peers
            .iter()
            .filter(|(addr, ka)| {
                self.cfg.domains.contains(&Domain::for_address(&addr.ip()))
                    && ka.services().has(required)
                    && self.ready(&addr.ip(), now)
            })
            .collect();

        if candidates.is_empty() {
            self.outbox.event(Event::AddressBookExhausted);
            return None;
        }

        // Prefer a candidate outside the last group we sampled from.
        let diverse = self
            .last_group
            .and_then(|last| candidates.iter().position(|(a, _)| group_key(&a.ip()) != last));

        let index = diverse.unwrap_or(0);
        let (addr, _) = candidates.swap_remove(index);

        self.last_group = Some(group_key(&addr.ip()));
        Some(addr)
    }

    fn ready(&self, ip: &net::IpAddr, now: LocalTime) -> bool {
        match self.backoff.get(ip) {
            Some(backoff) => match self.peers.get(ip).and_then(|ka| ka.last_attempt) {
                Some(last) => now.duration_since(last) >= backoff.delay(),
                None => true,
            },
            None => true,
        }
    }

    /// Record that we're attempting to dial `addr`.
    pub fn record_attempt(&mut self, addr: net::SocketAddr) {
        let now = self.clock.local_time();
        self.peers.mark_attempt(addr, now);
        self.backoff.entry(addr.ip()).or_insert_with(Backoff::peer);
    }

    /// Record a successful connection and handshake with `addr`.
    pub fn record_success(&mut self, addr: net::SocketAddr) {
        let now = self.clock.local_time();
        self.peers.mark_success(addr, now);
        self.backoff.entry(addr.ip()).or_insert_with(Backoff::peer).succeed();
    }

    /// Record a failed connection attempt or a disconnect for `addr`.
    pub fn record_failure(&mut self, addr: net::SocketAddr) {
        self.backoff.entry(addr.ip()).or_insert_with(Backoff::peer).fail();
    }

    /// Process an event from the state machine.
    pub fn received_event(&mut self, event: Event) {
        match event {
            Event::PeerConnecting { addr, .. } => self.record_attempt(addr),
            Event::PeerNegotiated { addr, .. } => self.record_success(addr),
            Event::PeerConnectionFailed { addr, .. } => self.record_failure(addr),
            Event::PeerDisconnected { addr, .. } => self.record_failure(addr),
            Event::MessageReceived { from, .. } => {
                let now = self.clock.local_time();
                self.peers.mark_active(from, now);
            }
            _ => {}
        }
    }

    /// A timer has expired.
    pub fn timer_expired(&mut self) {}
}

fn address_to_socket(address: &Address) -> Result<net::SocketAddr, std::io::Error> {
    address
        .socket_addr()
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "invalid address"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use spv_common::p2p::peer::Store as _;
    use std::collections::HashMap as StdHashMap;

    #[derive(Default)]
    struct MemoryStore(StdHashMap<net::IpAddr, (net::SocketAddr, KnownAddress)>);

    struct MemoryIter(std::vec::IntoIter<(net::SocketAddr, KnownAddress)>);

    impl Iterator for MemoryIter {
        type Item = (net::SocketAddr, KnownAddress);
        fn next(&mut self) -> Option<Self::Item> {
            self.0.next()
        }
    }

    impl Store for MemoryStore {
        type Iter = MemoryIter;

        fn get(&self, ip: &net::IpAddr) -> Option<&KnownAddress> {
            self.0.get(ip).map(|(_, ka)| ka)
        }
        fn insert(&mut self, ip: net::SocketAddr, ka: KnownAddress) -> bool {
            self.0.insert(ip.ip(), (ip, ka)).is_none()
        }
        fn remove(&mut self, ip: &net::IpAddr) -> Option<KnownAddress> {
            self.0.remove(ip).map(|(_, ka)| ka)
        }
        fn iter(&self) -> Self::Iter {
            MemoryIter(self.0.values().cloned().collect::<Vec<_>>().into_iter())
        }
        fn len(&self) -> usize {
            self.0.len()
        }
        fn mark_success(&mut self, ip: net::SocketAddr, time: LocalTime) {
            if let Some((_, ka)) = self.0.get_mut(&ip.ip()) {
                ka.last_success = Some(time);
            }
        }
        fn mark_attempt(&mut self, ip: net::SocketAddr, time: LocalTime) {
            if let Some((_, ka)) = self.0.get_mut(&ip.ip()) {
                ka.last_attempt = Some(time);
            }
        }
        fn mark_active(&mut self, ip: net::SocketAddr, time: LocalTime) {
            if let Some((_, ka)) = self.0.get_mut(&ip.ip()) {
                ka.last_active = Some(time);
            }
        }
    }

    #[test]
    fn test_sample_respects_required_services() {
        let cfg = Config {
            required_services: ServiceFlags::NETWORK,
            domains: Domain::all(),
        };
        let mut mgr = AddressManager::new(cfg, MemoryStore::default(), ());

        let addr: net::SocketAddr = "1.2.3.4:8333".parse().unwrap();
        let address = Address::new(&addr, ServiceFlags::NONE);
        mgr.insert(std::iter::once((0, address)), Source::Dns);

        assert!(mgr.sample(ServiceFlags::NETWORK).is_none());
    }
}
