//! Storage for bloom filter privacy segments.
use bitcoin::consensus::encode;

pub mod cache;
/// File-backed segment storage.
pub mod io;
/// In-memory segment storage, used in tests.
pub mod memory;

pub use io::File;
pub use memory::Memory;

use thiserror::Error;

/// A filter storage error.
#[derive(Debug, Error)]
pub enum Error {
    /// An I/O error.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    /// An error decoding a stored filter segment.
    #[error("error decoding filter segment: {0}")]
    Decoding(#[from] encode::Error),
    /// A data-corruption error.
    #[error("error: the store data is corrupt")]
    Corruption,
    /// Operation was interrupted.
    #[error("the operation was interrupted")]
    Interrupted,
}

/// Represents objects that can store bloom filter privacy segments.
pub trait Store {
    /// The type used in the store.
    type PrivacySegment: Sized;
    /// The default (unset) segment.
    fn default(&self) -> Self::PrivacySegment;
    /// Append a batch of consecutive segments to the end of the store.
    fn put<I: Iterator<Item = Self::PrivacySegment>>(&mut self, segments: I) -> Result<u32, Error>;
    /// Get the segment with the given id.
    fn get(&self, segment_id: u32) -> Result<Self::PrivacySegment, Error>;
    /// Synchronize the changes to disk.
    fn sync(&mut self) -> Result<(), Error>;
    /// Iterate over all segments in the store.
    fn iter(&self) -> Box<dyn Iterator<Item = Result<(u32, Self::PrivacySegment), Error>>>;
    /// Return the number of segments in the store.
    fn len(&self) -> Result<usize, Error>;
    /// Check the store integrity.
    fn check(&self) -> Result<(), Error>;
    /// Heal data corruption.
    fn heal(&self) -> Result<(), Error>;
}
