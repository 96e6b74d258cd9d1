//! State machine events.
use std::sync::Arc;
use std::{error, fmt, net};

use spv_common::bitcoin::network::address::Address;
use spv_common::bitcoin::network::constants::ServiceFlags;
use spv_common::bitcoin::network::message::NetworkMessage;
use spv_common::bitcoin::network::message_bloom::FilterLoad;
use spv_common::bitcoin::{MerkleBlock, Transaction, Txid};
use spv_common::block::{BlockHash, BlockHeader, Height};
use spv_common::nonempty::NonEmpty;
use spv_common::p2p::peer::Source;
use spv_net::Disconnect;

use crate::fsm;
use crate::fsm::{Link, LocalTime, PeerId};

/// Event emitted by the state machine, for consumption by the client or tests.
#[derive(Debug, Clone)]
pub enum Event {
    /// The node is initializing its state machine and about to start network activity.
    Initializing,
    /// Ready to process peer events and start receiving commands.
    Ready {
        /// The tip of the block header chain.
        tip: Height,
        /// Local time.
        time: LocalTime,
    },
    /// A bloom filter was loaded to a peer.
    PeerLoadedBloomFilter {
        /// The filter loaded to the peer.
        filter: FilterLoad,
        /// Peer address.
        peer: PeerId,
    },
    /// A bloom filter should be loaded to one or all connected peers. Routed
    /// through the event pipeline so that hooks observe it uniformly.
    LoadBloomFilter {
        /// Candidate peers to load the filter onto.
        peers: Vec<PeerId>,
        /// The filter to load.
        filter: FilterLoad,
        /// Whether to load onto every connected peer, or only `peers[0]`.
        all: bool,
    },
    /// Peer connected. Fired when the physical TCP/IP connection is established.
    /// Use [`Event::PeerNegotiated`] to know when the handshake has completed.
    PeerConnected {
        /// Peer address.
        addr: PeerId,
        /// Local address.
        local_addr: net::SocketAddr,
        /// Connection link.
        link: Link,
    },
    /// Outbound peer connection initiated.
    PeerConnecting {
        /// Peer address.
        addr: PeerId,
        /// Address source.
        source: Source,
        /// Peer services.
        services: ServiceFlags,
    },
    /// Peer disconnected after successful connection.
    PeerDisconnected {
        /// Peer address.
        addr: PeerId,
        /// Reason for disconnection.
        reason: spv_net::Disconnect<fsm::DisconnectReason>,
    },
    /// Peer timed out while waiting for a response. Usually leads to a disconnect.
    PeerTimedOut {
        /// Peer address.
        addr: PeerId,
    },
    /// Connection was never established and timed out or failed.
    PeerConnectionFailed {
        /// Peer address.
        addr: PeerId,
        /// Connection error.
        error: Arc<std::io::Error>,
    },
    /// Peer handshake completed. The peer connection is fully functional from this point.
    PeerNegotiated {
        /// Peer address.
        addr: PeerId,
        /// Connection link.
        link: Link,
        /// Peer services.
        services: ServiceFlags,
        /// Whether this is a persistent (manually-configured) peer.
        persistent: bool,
        /// Peer height.
        height: Height,
        /// Address of our node, as seen by the remote peer.
        receiver: Address,
        /// Peer user agent.
        user_agent: String,
        /// Negotiated protocol version.
        version: u32,
        /// Whether the peer relays transactions.
        relay: bool,
    },
    /// The best known height amongst connected peers has been updated.
    PeerHeightUpdated {
        /// Best block height known.
        height: Height,
    },
    /// The elected download peer changed, eg. after an election or a
    /// disconnection.
    DownloadPeerChanged {
        /// The newly-elected download peer, if any.
        addr: Option<PeerId>,
    },
    /// Whether we're downloading full block bodies, rather than headers
    /// only, has changed.
    BodyDownloadStateChanged {
        /// The new state.
        downloading_bodies: bool,
    },
    /// A peer misbehaved and may be disconnected as a result.
    PeerMisbehaved {
        /// Peer address.
        addr: PeerId,
        /// Reason for the misbehavior.
        reason: &'static str,
    },
    /// A block header was added to the main chain.
    BlockConnected {
        /// Block header.
        header: BlockHeader,
        /// Height of the block.
        height: Height,
    },
    /// A block header was reverted from the main chain, due to a re-org.
    BlockDisconnected {
        /// Header of the block.
        header: BlockHeader,
        /// Height the block held when it was part of the main chain.
        height: Height,
    },
    /// A merkle block was received from the network and decoded.
    ReceivedMerkleBlock {
        /// Block height.
        height: Height,
        /// The merkle block.
        merkle_block: MerkleBlock,
    },
    /// A merkle block finished being processed against the active watch-list.
    MerkleBlockProcessed {
        /// Block height.
        height: Height,
        /// Matched transaction ids and their merkle positions.
        matches: Vec<Txid>,
        /// Whether any transaction matched the watch-list.
        matched: bool,
        /// Whether the merkle block was served from the local cache.
        cached: bool,
        /// The merkle block.
        merkle_block: MerkleBlock,
    },
    /// A full block, downloaded in response to a match, has been processed.
    BlockProcessed {
        /// The block height.
        height: Height,
        /// Number of matched transactions extracted from the block.
        matched: usize,
    },
    /// Block header chain is in sync with the network.
    BlockHeadersSynced {
        /// Block height.
        height: Height,
        /// Chain tip hash.
        hash: BlockHash,
    },
    /// Block headers imported, either fetched from peers or imported by the user.
    BlockHeadersImported {
        /// New tip hash.
        hash: BlockHash,
        /// New tip height.
        height: Height,
        /// Block headers connected to the active chain.
        connected: NonEmpty<(Height, BlockHeader)>,
        /// Block headers reverted from the active chain.
        reverted: Vec<(Height, BlockHeader)>,
        /// Set if this import triggered a chain reorganization.
        reorg: bool,
    },
    /// A merkle block rescan has started.
    MerkleBlockRescanStarted {
        /// Start height.
        start: Height,
        /// End height, if bounded.
        stop: Option<Height>,
    },
    /// A merkle block rescan has stopped.
    MerkleBlockRescanStopped {
        /// Height at which the rescan stopped.
        height: Height,
    },
    /// The status of a transaction has changed.
    TxStatusChanged {
        /// The transaction id.
        txid: Txid,
        /// The new transaction status.
        status: TxStatus,
    },
    /// A matched transaction was received, independent of a merkle block scan.
    ReceivedMatchedTx {
        /// The transaction.
        transaction: Transaction,
    },
    /// A gossip message was received from a peer.
    MessageReceived {
        /// Peer that sent the message.
        from: PeerId,
        /// Message payload.
        message: Arc<NetworkMessage>,
    },
    /// The address book has been exhausted; more candidates are needed.
    AddressBookExhausted,
    /// An error occurred that doesn't warrant tearing down the state machine.
    Error {
        /// Error source.
        error: Arc<dyn error::Error + 'static + Sync + Send>,
    },
}

impl fmt::Display for Event {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Initializing => write!(fmt, "Initializing peer-to-peer system.."),
            Self::Ready { .. } => write!(fmt, "Ready to process events and commands"),
            Self::PeerLoadedBloomFilter { peer, .. } => {
                write!(fmt, "Bloom filter loaded to peer {}", peer)
            }
            Self::LoadBloomFilter { peers, all, .. } => {
                write!(fmt, "Loading bloom filter to {} peer(s) (all={})", peers.len(), all)
            }
            Self::PeerConnected { addr, link, .. } => {
                write!(fmt, "Peer {} connected ({:?})", addr, link)
            }
            Self::PeerConnecting { addr, .. } => write!(fmt, "Connecting to peer {}", addr),
            Self::PeerDisconnected { addr, reason } => {
                write!(fmt, "Disconnected from {} ({})", addr, reason)
            }
            Self::PeerTimedOut { addr } => write!(fmt, "Peer {} timed out", addr),
            Self::PeerConnectionFailed { addr, error } => {
                write!(fmt, "Connection attempt to {} failed with {}", addr, error)
            }
            Self::PeerNegotiated { addr, height, services, .. } => write!(
                fmt,
                "Peer {} negotiated with services {} and height {}",
                addr, services, height
            ),
            Self::PeerHeightUpdated { height } => write!(fmt, "Peer height updated to {}", height),
            Self::DownloadPeerChanged { addr: Some(addr) } => {
                write!(fmt, "Download peer elected: {}", addr)
            }
            Self::DownloadPeerChanged { addr: None } => write!(fmt, "Download peer cleared"),
            Self::BodyDownloadStateChanged { downloading_bodies } => write!(
                fmt,
                "Body download state changed (downloading_bodies={})",
                downloading_bodies
            ),
            Self::PeerMisbehaved { addr, reason } => write!(fmt, "Peer {} misbehaved: {}", addr, reason),
            Self::BlockConnected { header, height } => {
                write!(fmt, "Block {} connected at height {}", header.block_hash(), height)
            }
            Self::BlockDisconnected { header, height } => {
                write!(fmt, "Block {} disconnected at height {}", header.block_hash(), height)
            }
            Self::ReceivedMerkleBlock { height, .. } => {
                write!(fmt, "Merkle block received at height {}", height)
            }
            Self::MerkleBlockProcessed { height, matched, .. } => {
                write!(fmt, "Merkle block processed at height {} (matched={})", height, matched)
            }
            Self::BlockProcessed { height, matched } => {
                write!(fmt, "Block processed at height {} ({} matches)", height, matched)
            }
            Self::BlockHeadersSynced { height, hash } => {
                write!(fmt, "Chain in sync with network at height {} ({})", height, hash)
            }
            Self::BlockHeadersImported { hash, height, reorg, .. } => write!(
                fmt,
                "Chain tip updated to {} at height {} (reorg={})",
                hash, height, reorg
            ),
            Self::MerkleBlockRescanStarted { start, stop: Some(stop) } => {
                write!(fmt, "Rescan started from height {} to {}", start, stop)
            }
            Self::MerkleBlockRescanStarted { start, stop: None } => {
                write!(fmt, "Rescan started from height {}", start)
            }
            Self::MerkleBlockRescanStopped { height } => {
                write!(fmt, "Rescan stopped at height {}", height)
            }
            Self::TxStatusChanged { txid, status } => {
                write!(fmt, "Transaction {} status changed: {}", txid, status)
            }
            Self::ReceivedMatchedTx { transaction } => {
                write!(fmt, "Received matched transaction {}", transaction.txid())
            }
            Self::MessageReceived { from, message } => {
                write!(fmt, "Message `{}` received from {}", message.cmd(), from)
            }
            Self::AddressBookExhausted => {
                write!(fmt, "Address book exhausted, fetching new addresses from peers")
            }
            Self::Error { error } => write!(fmt, "Error: {}", error),
        }
    }
}

/// Transaction status, as tracked by the state machine's confidence table.
#[derive(Debug, Clone, PartialOrd, Ord, PartialEq, Eq)]
pub enum TxStatus {
    /// The transaction has been broadcast but not yet acknowledged.
    Unconfirmed,
    /// Transaction was acknowledged by a peer, eg. requested via `getdata`.
    Acknowledged {
        /// Peer acknowledging the transaction.
        peer: net::SocketAddr,
    },
    /// Transaction was included in a block, found via a merkle block scan.
    Confirmed {
        /// Height at which it was included.
        height: Height,
        /// Hash of the block in which it was included.
        block: BlockHash,
    },
    /// A previously-confirmed transaction was reverted due to a re-org.
    Reverted {
        /// The reverted transaction.
        transaction: Transaction,
    },
    /// Transaction was replaced by another, eg. via RBF, and will probably
    /// never be included in a block.
    Stale {
        /// Transaction replacing the given transaction.
        replaced_by: Txid,
        /// Block of the replacing transaction, if known.
        block: BlockHash,
    },
}

impl fmt::Display for TxStatus {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unconfirmed => write!(fmt, "transaction is unconfirmed"),
            Self::Acknowledged { peer } => write!(fmt, "transaction was acknowledged by peer {}", peer),
            Self::Confirmed { height, block } => {
                write!(fmt, "transaction was included in block {} at height {}", block, height)
            }
            Self::Reverted { transaction } => {
                write!(fmt, "transaction {} has been reverted", transaction.txid())
            }
            Self::Stale { replaced_by, block } => {
                write!(fmt, "transaction was replaced by {} in block {}", replaced_by, block)
            }
        }
    }
}
