//! BIP37 bloom filters.
//!
//! Modern `bitcoin` crate releases dropped support for constructing and
//! matching BIP37 filters, since full nodes increasingly reject `filterload`
//! messages. An SPV client that wants filtered blocks still needs to build
//! one, so this module vendors the construction here.
use std::convert::TryInto;
use std::f32::consts::LN_2;
use std::io;

use bitcoin::consensus::{encode, Decodable, Encodable};
use murmur3::murmur3_32;

/// Persisted privacy-segment filter caches.
pub mod store;

/// `ln(2)^2`, used when sizing a filter for a target false-positive rate.
pub const LN2_SQUARED: f32 = std::f32::consts::LN_2 * std::f32::consts::LN_2;
/// Maximum number of hash functions a filter may use.
pub const MAX_FILTER_HASH_FUNCS: u32 = 50;
/// Maximum filter size, in bytes.
pub const MAX_FILTER_SIZE: u32 = 36_000;
/// Minimum number of hash functions a filter may use.
pub const MIN_HASH_FUNCS: u32 = 1;

/// How a filter is updated when used to match transaction outputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BloomFlags {
    /// Never update the filter.
    None = 0,
    /// Add outpoints of all matching outputs.
    All = 1,
    /// Only add outpoints for matching P2PK/P2PKH/multisig outputs.
    P2PubkeyOnly = 2,
}

impl From<u8> for BloomFlags {
    fn from(value: u8) -> Self {
        match value {
            1 => Self::All,
            2 => Self::P2PubkeyOnly,
            _ => Self::None,
        }
    }
}

/// A BIP37 bloom filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BloomFilter {
    /// The filter bit field.
    pub content: Vec<u8>,
    /// Number of hash functions to apply per element.
    pub hashes: u32,
    /// Nonce mixed into every hash to prevent filter-matching attacks.
    pub tweak: u32,
    /// How the filter should be updated on a match.
    pub flags: u8,
}

impl BloomFilter {
    /// Create a filter sized for `elements` items at the given false-positive rate.
    pub fn new(elements: u32, false_positive_rate: f64, tweak: u32, flags: u8) -> Self {
        let size = -1.0 / LN2_SQUARED as f64 * elements as f64 * f64::ln(false_positive_rate);
        let mut filter_size = (size / 8.0).floor();

        let max = MAX_FILTER_SIZE * 8;
        if filter_size > max as f64 {
            filter_size = max as f64;
        }
        let content = vec![0u8; filter_size as usize];

        let mut nhashes = content.len() as f32 * 8.0 / elements as f32 * LN_2;
        if nhashes > MAX_FILTER_HASH_FUNCS as f32 {
            nhashes = MAX_FILTER_HASH_FUNCS as f32;
        }
        if nhashes < MIN_HASH_FUNCS as f32 {
            nhashes = MIN_HASH_FUNCS as f32;
        }

        Self { content, hashes: nhashes as u32, tweak, flags }
    }

    /// An empty filter with a random tweak, sized to hold a modest watch-list.
    pub fn unset(flags: u8) -> Self {
        Self {
            content: vec![0u8; 512],
            hashes: 6,
            tweak: fastrand::u32(..),
            flags,
        }
    }

    fn hash(&self, n: u32, data: &[u8]) -> u32 {
        let mut cursor = io::Cursor::new(data);
        let seed = (n as u64 * 0xFBA4_C795 + self.tweak as u64) as u32;
        let x = murmur3_32(&mut cursor, seed).expect("hashing an in-memory buffer cannot fail");
        let modulus: u32 = (self.content.len() * 8).try_into().unwrap();
        x % modulus
    }

    /// Insert an element into the filter.
    pub fn insert(&mut self, data: &[u8]) {
        for i in 0..self.hashes {
            let index = self.hash(i, data);
            let bit = 1 << (7 & index);
            self.content[index as usize >> 3] |= bit;
        }
    }

    /// Check whether an element may be in the filter. False positives are
    /// expected; false negatives never occur.
    pub fn contains(&self, data: &[u8]) -> bool {
        if self.hashes == 0 || self.content.is_empty() {
            return false;
        }
        for i in 0..self.hashes {
            let index = self.hash(i, data) as usize;
            if self.content[index >> 3] & (1 << (7 & index)) == 0 {
                return false;
            }
        }
        true
    }
}

impl Default for BloomFilter {
    fn default() -> Self {
        Self::unset(BloomFlags::None as u8)
    }
}

impl Encodable for BloomFilter {
    fn consensus_encode<W: io::Write + ?Sized>(&self, w: &mut W) -> Result<usize, io::Error> {
        let mut len = 0;
        len += self.content.consensus_encode(w)?;
        len += self.hashes.consensus_encode(w)?;
        len += self.tweak.consensus_encode(w)?;
        len += self.flags.consensus_encode(w)?;
        Ok(len)
    }
}

impl Decodable for BloomFilter {
    fn consensus_decode<R: io::Read + ?Sized>(r: &mut R) -> Result<Self, encode::Error> {
        let content: Vec<u8> = Decodable::consensus_decode(r)?;
        let hashes: u32 = Decodable::consensus_decode(r)?;
        let tweak: u32 = Decodable::consensus_decode(r)?;
        let flags: u8 = Decodable::consensus_decode(r)?;
        Ok(Self { content, hashes, tweak, flags })
    }
}

/// Number of hash functions a filter should use for the given parameters.
pub fn hash_funcs(elements: u32, false_positive_rate: f64) -> u32 {
    let size = filter_size(elements, false_positive_rate);
    let n = size as f64 * 8.0 / elements as f64 * LN_2 as f64;
    u32::max(MIN_HASH_FUNCS, u32::min(n as u32, MAX_FILTER_HASH_FUNCS))
}

/// Filter size, in bytes, for the given parameters.
pub fn filter_size(elements: u32, false_positive_rate: f64) -> u32 {
    let bits = -1.0 / LN2_SQUARED as f64 * elements as f64 * false_positive_rate.ln();
    let max_bits = MAX_FILTER_SIZE * 8;
    u32::min(bits as u32, max_bits) / 8
}

#[cfg(test)]
mod tests {
    use bitcoin::hashes::hex::FromHex;

    use super::*;

    #[test]
    fn test_bloom_insert_and_match() {
        let mut watched = Vec::from_hex("84487d5b5448dcb272921965eebb266728b25853").unwrap();
        let mut filter = BloomFilter::new(2, 0.001, 123_123, 1);

        filter.insert(&watched);

        assert!(filter.contains(&watched));
        assert!(!filter.contains(&Vec::from_hex("deadbeef").unwrap()));

        watched.push(0xef);
        assert!(!filter.contains(&watched));
    }

    #[test]
    fn test_bloom_round_trips_through_encoding() {
        let mut filter = BloomFilter::new(10, 0.01, 5, 0);
        filter.insert(&[1, 2, 3, 4]);

        let mut buf = Vec::new();
        filter.consensus_encode(&mut buf).unwrap();

        let decoded = BloomFilter::consensus_decode(&mut buf.as_slice()).unwrap();
        assert_eq!(filter, decoded);
    }
}
