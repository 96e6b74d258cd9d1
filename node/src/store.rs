//! A peer address book persisted as JSON between runs.
use std::collections::HashMap;
use std::fs::File;
use std::io;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::path::Path;

use serde::{Deserialize, Serialize};

use spv_common::bitcoin::network::address::Address;
use spv_common::bitcoin::network::constants::ServiceFlags;
use spv_common::block::time::LocalTime;
use spv_common::p2p::peer::{KnownAddress, Source, Store};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Record {
    addr: SocketAddr,
    services: u64,
}

/// An in-memory, JSON-backed peer address book.
#[derive(Debug, Default)]
pub struct AddressBook {
    addrs: HashMap<IpAddr, KnownAddress>,
}

impl AddressBook {
    /// Load the address book from `path`, or start empty if it doesn't exist.
    pub fn load(path: impl AsRef<Path>) -> io::Result<Self> {
        let file = match File::open(path) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(err) => return Err(err),
        };
        let records: Vec<Record> =
            serde_json::from_reader(file).map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;

        let mut book = Self::default();
        for record in records {
            let address = Address::new(&record.addr, ServiceFlags::from(record.services));
            book.insert(record.addr, KnownAddress::new(address, Source::Imported));
        }
        Ok(book)
    }

    /// Persist the address book to `path` as JSON.
    pub fn save(&self, path: impl AsRef<Path>) -> io::Result<()> {
        let records: Vec<Record> = self
            .addrs
            .values()
            .filter_map(|ka| ka.address.socket_addr().ok().map(|addr| Record { addr, services: ka.services().to_u64() }))
            .collect();
        let file = File::create(path)?;
        serde_json::to_writer_pretty(file, &records).map_err(|err| io::Error::new(io::ErrorKind::Other, err))
    }

    /// Build an address book from a fixed set of peers, bypassing discovery.
    pub fn from(connect: &[SocketAddr]) -> Self {
        let mut book = Self::default();
        for addr in connect {
            let address = Address::new(addr, ServiceFlags::NONE);
            book.insert(*addr, KnownAddress::new(address, Source::Imported));
        }
        book
    }

    /// Resolve a set of DNS seeds into an address book, at the network's
    /// default port.
    pub fn bootstrap(seeds: &[&str], port: u16) -> io::Result<Self> {
        let mut book = Self::default();
        for seed in seeds {
            let resolved = match (*seed, port).to_socket_addrs() {
                Ok(addrs) => addrs,
                Err(err) => {
                    log::warn!(target: "node", "failed to resolve seed {}: {}", seed, err);
                    continue;
                }
            };
            for addr in resolved {
                let address = Address::new(&addr, ServiceFlags::NONE);
                book.insert(addr, KnownAddress::new(address, Source::Dns));
            }
        }
        Ok(book)
    }
}

impl Store for AddressBook {
    type Iter = std::vec::IntoIter<(SocketAddr, KnownAddress)>;

    fn get(&self, ip: &IpAddr) -> Option<&KnownAddress> {
        self.addrs.get(ip)
    }

    fn insert(&mut self, ip: SocketAddr, ka: KnownAddress) -> bool {
        self.addrs.insert(ip.ip(), ka).is_none()
    }

    fn remove(&mut self, ip: &IpAddr) -> Option<KnownAddress> {
        self.addrs.remove(ip)
    }

    fn iter(&self) -> Self::Iter {
        self.addrs
            .iter()
            .filter_map(|(ip, ka)| ka.address.socket_addr().ok().map(|addr| (addr, ka.clone())).or_else(|| {
                Some((SocketAddr::new(*ip, 0), ka.clone()))
            }))
            .collect::<Vec<_>>()
            .into_iter()
    }

    fn len(&self) -> usize {
        self.addrs.len()
    }

    fn mark_success(&mut self, ip: SocketAddr, time: LocalTime) {
        if let Some(ka) = self.addrs.get_mut(&ip.ip()) {
            ka.last_success = Some(time);
        }
    }

    fn mark_attempt(&mut self, ip: SocketAddr, time: LocalTime) {
        if let Some(ka) = self.addrs.get_mut(&ip.ip()) {
            ka.last_attempt = Some(time);
        }
    }

    fn mark_active(&mut self, ip: SocketAddr, time: LocalTime) {
        if let Some(ka) = self.addrs.get_mut(&ip.ip()) {
            ka.last_active = Some(time);
        }
    }
}
