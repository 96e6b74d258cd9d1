//! Types relating to blocks and block headers.
pub mod store;
pub mod time;
pub mod tree;

pub use bitcoin::blockdata::transaction::Transaction;
pub use bitcoin::hash_types::BlockHash;
pub use bitcoin::util::merkleblock::MerkleBlock;
pub use bitcoin::util::uint::Uint256;

/// Height of a block.
pub type Height = u64;

/// Block timestamp, as recorded on the block header.
pub type BlockTime = u32;

/// Compact difficulty bits, as recorded on the block header.
pub type Bits = u32;

/// Proof-of-work target.
pub type Target = Uint256;

/// Accumulated proof-of-work.
pub type Work = Uint256;

/// Known block checkpoints, by network.
pub mod checkpoints {
    use super::Height;

    /// Mainnet checkpoints.
    pub const MAINNET: &[(Height, &str)] = &[
        (
            11111,
            "0000000069e244f73d78e8fd29ba2fd2ed618bd6fa2ee92559f542fdb26e7c1d",
        ),
        (
            33333,
            "000000002dd5588a74784eaa7ab0507a18ad16a236e7b1ce69f00d7ddfb5d0a6",
        ),
        (
            210000,
            "000000000000048b95347e83192f69cf0366076336c639f9b7228e9ba171342",
        ),
        (
            300000,
            "000000000000000082ccf8f1557c5d40b21edabb18d2d691cfbf87118bac7254",
        ),
        (
            550000,
            "0000000000000000002d3a5d4f087b0d62aa1d3a3ce5e2b6b3e9f0bb0c1a52e4",
        ),
    ];

    /// Testnet checkpoints.
    pub const TESTNET: &[(Height, &str)] = &[(
        546,
        "000000002a936ca763904c3c35fce2f3556c559c0214345d31b1bcebf76acb70",
    )];

    /// Regtest checkpoints. Regtest has no fixed history, so there are none.
    pub const REGTEST: &[(Height, &str)] = &[];

    /// Signet checkpoints.
    pub const SIGNET: &[(Height, &str)] = &[];
}

/// Genesis block hashes, by network, in internal (little-endian) byte order,
/// as consumed by [`bitcoin_hashes::sha256d::Hash::from_slice`].
pub mod genesis {
    /// Mainnet genesis hash.
    pub const MAINNET: &[u8] = &[
        0x6f, 0xe2, 0x8c, 0x0a, 0xb6, 0xf1, 0xb3, 0x72, 0xc1, 0xa6, 0xa2, 0x46, 0xae, 0x63, 0xf7,
        0x4f, 0x93, 0x1e, 0x83, 0x65, 0xe1, 0x5a, 0x08, 0x9c, 0x68, 0xd6, 0x19, 0x00, 0x00, 0x00,
        0x00, 0x00,
    ];
    /// Testnet genesis hash.
    pub const TESTNET: &[u8] = &[
        0x43, 0x49, 0x7f, 0xd7, 0xf8, 0x26, 0x95, 0x71, 0x08, 0xf4, 0xa3, 0x0f, 0xd9, 0xce, 0xc3,
        0xae, 0xba, 0x79, 0x97, 0x20, 0x84, 0xe9, 0x0e, 0xad, 0x01, 0xea, 0x33, 0x09, 0x00, 0x00,
        0x00, 0x00,
    ];
    /// Regtest genesis hash.
    pub const REGTEST: &[u8] = &[
        0x06, 0x22, 0x6e, 0x46, 0x11, 0x1a, 0x0b, 0x59, 0xca, 0xaf, 0x12, 0x60, 0x43, 0xeb, 0x5b,
        0xbf, 0x28, 0xc3, 0x4f, 0x3a, 0x5e, 0x33, 0x2a, 0x1f, 0xc7, 0xb2, 0xb7, 0x3c, 0xf1, 0x88,
        0x91, 0x0f,
    ];
    /// Signet genesis hash.
    pub const SIGNET: &[u8] = &[
        0xf6, 0x1e, 0xee, 0x3b, 0x63, 0xa3, 0x80, 0xa4, 0x77, 0xa0, 0x63, 0xaf, 0x32, 0xb2, 0xbb,
        0xc9, 0x7c, 0x9f, 0xf9, 0xf0, 0x1f, 0x2c, 0x42, 0x25, 0xe9, 0x73, 0x98, 0x81, 0x08, 0x00,
        0x00, 0x00,
    ];
}
