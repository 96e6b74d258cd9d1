//! Wire codec: frames `NetworkMessage`s for reading off a byte stream and
//! encodes them for writing. Tolerates garbage preceding a message by
//! resyncing on the network magic, so `client::blockfile` can scan recorded
//! block files that interleave unrelated bytes between messages.
use std::io;

use spv_common::bitcoin::consensus::encode::{self, Decodable, Encodable};
use spv_common::bitcoin::network::constants::Network as WireNetwork;
use spv_common::bitcoin::network::message::{NetworkMessage, RawNetworkMessage};

use thiserror::Error;

/// Maximum allowed payload size for a single message, matching Bitcoin
/// Core's network-protocol limit.
pub const MAX_PAYLOAD_SIZE: usize = 32 * 1024 * 1024;

/// Size of a message header: magic(4) + command(12) + length(4) + checksum(4).
const HEADER_SIZE: usize = 24;

/// An error decoding a message off the wire. Every variant is fatal for the
/// connection it occurred on.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// The payload length exceeds [`MAX_PAYLOAD_SIZE`].
    #[error("oversized payload: {0} bytes")]
    Oversized(usize),
    /// The underlying consensus decoder failed (includes checksum mismatches).
    #[error("decode error: {0}")]
    Consensus(#[from] encode::Error),
}

/// Frames `NetworkMessage`s to/from a byte stream for a fixed network magic.
#[derive(Debug, Clone, Copy)]
pub struct Codec {
    magic: u32,
}

impl Codec {
    /// Create a codec for the given network.
    pub fn new(network: WireNetwork) -> Self {
        Self { magic: network.magic() }
    }

    /// Encode a message onto the end of `buf`.
    pub fn encode(&self, message: NetworkMessage, buf: &mut Vec<u8>) -> Result<(), encode::Error> {
        RawNetworkMessage { magic: self.magic, payload: message }.consensus_encode(buf)?;
        Ok(())
    }

    /// Attempt to decode one message from the front of `buf`. Returns
    /// `Ok(None)` if `buf` doesn't yet hold a complete message. On success,
    /// or on an unrecoverable decode error, the consumed bytes (including any
    /// skipped resync garbage) are drained from `buf`.
    pub fn decode(&mut self, buf: &mut Vec<u8>) -> Result<Option<NetworkMessage>, DecodeError> {
        let mut skipped = 0;
        while buf.len() >= 4 {
            let candidate = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
            if candidate == self.magic {
                break;
            }
            buf.remove(0);
            skipped += 1;
        }
        if skipped > 0 {
            log::debug!(target: "p2p", "Resynced past {} byte(s) of invalid magic", skipped);
        }
        if buf.len() < HEADER_SIZE {
            return Ok(None);
        }

        let length = u32::from_le_bytes([buf[16], buf[17], buf[18], buf[19]]) as usize;
        if length > MAX_PAYLOAD_SIZE {
            buf.drain(..4);
            return Err(DecodeError::Oversized(length));
        }
        if buf.len() < HEADER_SIZE + length {
            return Ok(None);
        }

        let frame_len = HEADER_SIZE + length;
        let mut cursor = io::Cursor::new(&buf[..frame_len]);
        let result = RawNetworkMessage::consensus_decode(&mut cursor);
        buf.drain(..frame_len);

        match result {
            Ok(raw) => Ok(Some(raw.payload)),
            Err(err) => Err(DecodeError::Consensus(err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spv_common::bitcoin::network::constants::Network;

    #[test]
    fn test_encode_decode_round_trip() {
        let mut codec = Codec::new(Network::Regtest);
        let mut buf = Vec::new();
        codec.encode(NetworkMessage::Verack, &mut buf).unwrap();

        let decoded = codec.decode(&mut buf).unwrap();
        assert_eq!(decoded, Some(NetworkMessage::Verack));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_incomplete_returns_none() {
        let mut codec = Codec::new(Network::Regtest);
        let mut buf = Vec::new();
        codec.encode(NetworkMessage::Verack, &mut buf).unwrap();
        buf.truncate(buf.len() - 1);

        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_decode_resyncs_past_garbage() {
        let mut codec = Codec::new(Network::Regtest);
        let mut buf = vec![0xde, 0xad, 0xbe, 0xef, 0x01];
        codec.encode(NetworkMessage::Ping(42), &mut buf).unwrap();

        let decoded = codec.decode(&mut buf).unwrap();
        assert_eq!(decoded, Some(NetworkMessage::Ping(42)));
    }
}
