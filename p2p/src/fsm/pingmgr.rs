//! Ping/pong keep-alive and round-trip-time tracking.
use std::collections::{HashMap, VecDeque};

use spv_common::block::time::{Clock, LocalDuration, LocalTime};

use super::output::Outbox;
use super::{DisconnectReason, Event, PeerId};

/// Interval between pings sent to an idle peer.
pub const PING_INTERVAL: LocalDuration = LocalDuration::from_mins(2);
/// How long to wait for a pong before considering the ping lost.
pub const PING_TIMEOUT: LocalDuration = LocalDuration::from_secs(30);
/// Number of outstanding, unanswered pings before a peer is disconnected.
pub const MAX_OUTSTANDING_PINGS: usize = 50;
/// Size of the moving-average round-trip-time window.
const RTT_WINDOW: usize = 20;

/// Per-peer ping state.
#[derive(Debug, Default)]
pub struct Peer {
    /// Pings sent and not yet answered, oldest first: `(nonce, sent_at)`.
    outstanding: VecDeque<(u64, LocalTime)>,
    /// Recent round-trip times, used to compute a moving average.
    rtts: VecDeque<LocalDuration>,
    last_ping: Option<LocalTime>,
}

impl Peer {
    /// The average round-trip time over the last [`RTT_WINDOW`] samples.
    pub fn latency(&self) -> Option<LocalDuration> {
        if self.rtts.is_empty() {
            return None;
        }
        let total: u64 = self.rtts.iter().map(|d| d.as_millis()).sum();
        Some(LocalDuration::from_millis(total / self.rtts.len() as u64))
    }
}

/// Sends periodic pings to idle peers and disconnects those that stop
/// answering.
#[derive(Debug)]
pub struct PingManager<C> {
    clock: C,
    /// Per-peer ping state.
    pub peers: HashMap<PeerId, Peer>,
    outbox: Outbox,
}

impl<C> Iterator for PingManager<C> {
    type Item = super::output::Io;

    fn next(&mut self) -> Option<Self::Item> {
        self.outbox.next()
    }
}

impl<C: Clock> PingManager<C> {
    /// Create a new ping manager.
    pub fn new(clock: C) -> Self {
        Self {
            clock,
            peers: HashMap::new(),
            outbox: Outbox::default(),
        }
    }

    /// Send a ping to `addr` with a random nonce.
    pub fn ping(&mut self, addr: PeerId) {
        let nonce = fastrand::u64(..);
        let now = self.clock.local_time();
        let peer = self.peers.entry(addr).or_default();
        peer.outstanding.push_back((nonce, now));
        peer.last_ping = Some(now);

        self.outbox.ping(addr, nonce);
    }

    /// Process an event relevant to keep-alive tracking.
    pub fn received_event(&mut self, event: Event) {
        match event {
            Event::PeerNegotiated { addr, .. } => {
                self.peers.entry(addr).or_default();
            }
            Event::PeerDisconnected { addr, .. } => {
                self.peers.remove(&addr);
            }
            Event::MessageReceived { from, message } => match message.as_ref() {
                spv_common::bitcoin::network::message::NetworkMessage::Ping(nonce) => {
                    self.outbox.pong(from, *nonce);
                }
                spv_common::bitcoin::network::message::NetworkMessage::Pong(nonce) => {
                    self.handle_pong(from, *nonce);
                }
                _ => {}
            },
            _ => {}
        }
    }

    fn handle_pong(&mut self, from: PeerId, nonce: u64) {
        let now = self.clock.local_time();
        let Some(peer) = self.peers.get_mut(&from) else {
            return;
        };
        if let Some(pos) = peer.outstanding.iter().position(|(n, _)| *n == nonce) {
            let (_, sent_at) = peer.outstanding.remove(pos).expect("position was just found");
            peer.rtts.push_back(now.duration_since(sent_at));
            while peer.rtts.len() > RTT_WINDOW {
                peer.rtts.pop_front();
            }
        }
    }

    /// A timer fired: ping idle peers and disconnect any with too many
    /// outstanding, unanswered pings.
    pub fn timer_expired(&mut self) {
        let now = self.clock.local_time();
        let mut to_ping = Vec::new();
        let mut to_disconnect = Vec::new();

        for (addr, peer) in self.peers.iter() {
            if peer.outstanding.len() >= MAX_OUTSTANDING_PINGS {
                to_disconnect.push(*addr);
                continue;
            }
            let due = peer
                .last_ping
                .map(|last| now.duration_since(last) >= PING_INTERVAL)
                .unwrap_or(true);
            if due {
                to_ping.push(*addr);
            }
        }

        for addr in to_disconnect {
            self.outbox.disconnect(addr, DisconnectReason::PeerTimeout("too many outstanding pings"));
        }
        for addr in to_ping {
            self.ping(addr);
        }
    }
}
