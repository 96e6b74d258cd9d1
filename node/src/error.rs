//! Top-level error type for the daemon.
use std::io;

use thiserror::Error;

/// Everything that can go wrong starting or running the daemon.
#[derive(Debug, Error)]
pub enum Error {
    /// Failure setting up or reading the block header store.
    #[error(transparent)]
    Store(#[from] spv_common::block::store::Error),
    /// Failure applying headers already on disk to the in-memory chain.
    #[error(transparent)]
    Chain(#[from] spv_common::block::tree::Error),
    /// Failure reading or writing the peer address book, or the config file.
    #[error(transparent)]
    Io(#[from] io::Error),
    /// The reactor stopped with an error.
    #[error(transparent)]
    Client(#[from] spv_client::Error),
    /// The configuration file couldn't be parsed.
    #[error("invalid config file: {0}")]
    Config(#[from] toml::de::Error),
}
