//! Transaction broadcast coordination.
//!
//! Tracks in-flight broadcasts and decides, from `inv`/`getdata`/`reject`
//! traffic, whether a broadcast has propagated widely enough to report
//! success.
use std::collections::{HashMap, HashSet};

use spv_common::bitcoin::network::message_blockdata::Inventory;
use spv_common::bitcoin::{Transaction, Txid};

use super::output::Outbox;
use super::{Event, PeerId};

/// A transaction broadcast in progress.
#[derive(Debug)]
struct Broadcast {
    tx: Transaction,
    /// Minimum number of additional peers that must re-announce the
    /// transaction before the broadcast is considered successful.
    min_connections: usize,
    /// Peer we're waiting on a `getdata` from, having sent it an `inv`.
    announced_to: HashSet<PeerId>,
    /// Peers that re-announced the transaction back to us.
    confirmed_by: HashSet<PeerId>,
    done: bool,
}

/// Coordinates transaction broadcasts across the connected peer set.
#[derive(Debug, Default)]
pub struct BroadcastManager {
    pending: HashMap<Txid, Broadcast>,
    connected: HashSet<PeerId>,
    outbox: Outbox,
}

impl Iterator for BroadcastManager {
    type Item = super::output::Io;

    fn next(&mut self) -> Option<Self::Item> {
        self.outbox.next()
    }
}

impl BroadcastManager {
    /// Create a new broadcast manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Called once at startup.
    pub fn initialize(&mut self) {}

    /// Start broadcasting `tx`, requiring at least `min_connections` peers
    /// (beyond the one we hand it to directly) to re-announce it before the
    /// broadcast is considered successful.
    pub fn broadcast(&mut self, tx: Transaction, min_connections: usize) {
        let txid = tx.txid();
        if self.connected.is_empty() {
            log::debug!(target: "p2p", "Deferring broadcast of {}: no connected peers", txid);
        }

        let announce_to: Vec<PeerId> = self.connected.iter().copied().take(1).collect();
        for peer in &announce_to {
            self.outbox.inv(*peer, vec![Inventory::Transaction(txid)]);
        }

        self.pending.insert(
            txid,
            Broadcast {
                tx,
                min_connections: min_connections.max(1),
                announced_to: announce_to.into_iter().collect(),
                confirmed_by: HashSet::new(),
                done: false,
            },
        );
    }

    /// A peer requested the transaction via `getdata`; send it.
    fn handle_getdata(&mut self, from: PeerId, inventory: &[Inventory]) {
        for item in inventory {
            if let Inventory::Transaction(txid) = item {
                if let Some(broadcast) = self.pending.get(txid) {
                    if broadcast.announced_to.contains(&from) {
                        self.outbox.tx(from, broadcast.tx.clone());
                    }
                }
            }
        }
    }

    /// A peer re-announced a transaction back to us.
    fn handle_inv(&mut self, from: PeerId, inventory: &[Inventory]) {
        for item in inventory {
            if let Inventory::Transaction(txid) = item {
                if let Some(broadcast) = self.pending.get_mut(txid) {
                    if broadcast.done {
                        continue;
                    }
                    broadcast.confirmed_by.insert(from);
                    if broadcast.confirmed_by.len() + 1 >= broadcast.min_connections {
                        broadcast.done = true;
                        self.outbox.event(Event::TxStatusChanged {
                            txid: *txid,
                            status: super::event::TxStatus::Acknowledged { peer: from },
                        });
                    }
                }
            }
        }
    }

    /// A peer rejected a transaction we broadcast.
    fn handle_reject(&mut self, txid: Txid) {
        self.pending.remove(&txid);
        self.outbox.event(Event::Error {
            error: std::sync::Arc::new(std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("broadcast of {} was rejected", txid),
            )),
        });
    }

    /// Process an event relevant to broadcast coordination.
    pub fn received_event(&mut self, event: Event) {
        match event {
            Event::PeerNegotiated { addr, .. } => {
                self.connected.insert(addr);
            }
            Event::PeerDisconnected { addr, .. } => {
                self.connected.remove(&addr);
            }
            Event::MessageReceived { from, message } => match message.as_ref() {
                spv_common::bitcoin::network::message::NetworkMessage::GetData(inventory) => {
                    self.handle_getdata(from, inventory);
                }
                spv_common::bitcoin::network::message::NetworkMessage::Inv(inventory) => {
                    self.handle_inv(from, inventory);
                }
                spv_common::bitcoin::network::message::NetworkMessage::Reject(reject) => {
                    self.handle_reject(Txid::from(reject.hash));
                }
                _ => {}
            },
            _ => {}
        }
    }

    /// A timer fired; retry any broadcast still without enough connected peers.
    pub fn timer_expired(&mut self) {
        let stalled: Vec<Txid> = self
            .pending
            .iter()
            .filter(|(_, b)| !b.done && b.announced_to.is_empty() && !self.connected.is_empty())
            .map(|(txid, _)| *txid)
            .collect();

        for txid in stalled {
            if let Some(broadcast) = self.pending.get_mut(&txid) {
                if let Some(peer) = self.connected.iter().next().copied() {
                    self.outbox.inv(peer, vec![Inventory::Transaction(txid)]);
                    broadcast.announced_to.insert(peer);
                }
            }
        }
    }
}
