//! Core types shared across the workspace: blocks, networks, and peer addressing.
#![warn(missing_docs)]

pub use bitcoin;
pub use bitcoin_hashes;
pub use nonempty;

pub mod block;
pub mod bloom;
pub mod collections;
pub mod network;
pub mod p2p;

/// Expands to the current file and line, for use in panic/log messages that
/// want to point back at the call site without a full backtrace.
#[macro_export]
macro_rules! source {
    () => {
        concat!(file!(), ":", line!())
    };
}
