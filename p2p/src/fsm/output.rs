//! Helpers to construct and queue state machine outputs.
//!
//! Every sub-manager holds its own [`Outbox`], which is simply a queue of
//! [`Io`] values with convenience constructors for the handful of messages
//! each manager is allowed to emit. The top-level state machine drains each
//! manager's outbox in turn (see [`crate::fsm::StateMachine::next`]).
use std::collections::VecDeque;
use std::net;

use spv_common::bitcoin::network::address::Address;
use spv_common::bitcoin::network::constants::ServiceFlags;
use spv_common::bitcoin::network::message::NetworkMessage;
use spv_common::bitcoin::network::message_blockdata::Inventory;
use spv_common::bitcoin::network::message_bloom::FilterLoad;
use spv_common::bitcoin::network::message_network::VersionMessage;
use spv_common::block::time::LocalDuration;

use super::{DisconnectReason, Event, PeerId, PROTOCOL_VERSION, USER_AGENT};

/// A state machine output. See [`spv_net::Io`] for the generic shape.
pub type Io = spv_net::Io<NetworkMessage, Event, DisconnectReason>;

/// A queue of pending outputs, with helpers for the messages a manager needs
/// to send. Implements [`Iterator`] so it can be drained in FIFO order.
#[derive(Debug, Default)]
pub struct Outbox {
    outbox: VecDeque<Io>,
}

impl Iterator for Outbox {
    type Item = Io;

    fn next(&mut self) -> Option<Self::Item> {
        self.outbox.pop_front()
    }
}

impl Outbox {
    /// Push a raw message destined for a specific peer.
    pub fn message(&mut self, addr: PeerId, message: NetworkMessage) {
        self.outbox.push_back(Io::Write(addr, message));
    }

    /// Queue an outbound connection attempt.
    pub fn connect(&mut self, addr: PeerId) {
        self.outbox.push_back(Io::Connect(addr));
    }

    /// Queue a disconnection, with a reason recorded for logging and for any
    /// backoff decisions made downstream.
    pub fn disconnect(&mut self, addr: PeerId, reason: DisconnectReason) {
        self.outbox.push_back(Io::Disconnect(addr, reason.into()));
    }

    /// Queue a timer to fire after `duration` has elapsed.
    pub fn set_timer(&mut self, duration: LocalDuration) {
        self.outbox.push_back(Io::SetTimer(duration));
    }

    /// Queue an event for the client (and other sub-managers) to observe.
    pub fn event(&mut self, event: Event) {
        self.outbox.push_back(Io::Event(event));
    }

    /// Send our version message to a newly-connected peer.
    pub fn version(&mut self, addr: PeerId, msg: VersionMessage) {
        self.message(addr, NetworkMessage::Version(msg));
    }

    /// Acknowledge a peer's version message.
    pub fn verack(&mut self, addr: PeerId) {
        self.message(addr, NetworkMessage::Verack);
    }

    /// Request a set of inventory items from a peer.
    pub fn get_data(&mut self, addr: PeerId, inventory: Vec<Inventory>) {
        self.message(addr, NetworkMessage::GetData(inventory));
    }

    /// Announce inventory items to a peer.
    pub fn inv(&mut self, addr: PeerId, inventory: Vec<Inventory>) {
        self.message(addr, NetworkMessage::Inv(inventory));
    }

    /// Request headers from a peer, given block locators.
    pub fn get_headers(&mut self, addr: PeerId, locators: (Vec<spv_common::block::BlockHash>, spv_common::block::BlockHash)) {
        self.message(
            addr,
            NetworkMessage::GetHeaders(spv_common::bitcoin::network::message_blockdata::GetHeadersMessage {
                version: PROTOCOL_VERSION,
                locator_hashes: locators.0,
                stop_hash: locators.1,
            }),
        );
    }

    /// Load a bloom filter onto a single peer.
    pub fn send_bloom_filter_load(&mut self, addr: &PeerId, filter: FilterLoad) {
        self.message(*addr, NetworkMessage::FilterLoad(filter));
    }

    /// Clear a peer's previously-loaded bloom filter.
    pub fn filter_clear(&mut self, addr: PeerId) {
        self.message(addr, NetworkMessage::FilterClear);
    }

    /// Request the peer's mempool contents.
    pub fn get_mempool(&mut self, addr: &PeerId) {
        self.message(*addr, NetworkMessage::MemPool);
    }

    /// Send a ping to a peer, expecting a matching pong.
    pub fn ping(&mut self, addr: PeerId, nonce: u64) {
        self.message(addr, NetworkMessage::Ping(nonce));
    }

    /// Reply to a peer's ping.
    pub fn pong(&mut self, addr: PeerId, nonce: u64) {
        self.message(addr, NetworkMessage::Pong(nonce));
    }

    /// Advertise our own address to a peer.
    pub fn addr(&mut self, addr: PeerId, addrs: Vec<(u32, Address)>) {
        self.message(addr, NetworkMessage::Addr(addrs));
    }

    /// Request addresses from a peer.
    pub fn get_addr(&mut self, addr: PeerId) {
        self.message(addr, NetworkMessage::GetAddr);
    }

    /// Broadcast a transaction to a peer.
    pub fn tx(&mut self, addr: PeerId, tx: spv_common::block::Transaction) {
        self.message(addr, NetworkMessage::Tx(tx));
    }
}

/// Services this client always requires from outbound peers.
pub const REQUIRED_SERVICES: ServiceFlags = ServiceFlags::NETWORK;

/// Build a version message announcing our capabilities to a newly-dialed peer.
pub fn version_message(
    addr: net::SocketAddr,
    local_addr: net::SocketAddr,
    nonce: u64,
    start_height: i32,
    timestamp: i64,
) -> VersionMessage {
    VersionMessage {
        version: PROTOCOL_VERSION,
        services: REQUIRED_SERVICES,
        timestamp,
        receiver: Address::new(&addr, ServiceFlags::NONE),
        sender: Address::new(&local_addr, REQUIRED_SERVICES),
        nonce,
        user_agent: USER_AGENT.to_owned(),
        start_height,
        relay: false,
    }
}
