//! A minimal reader for `blk*.dat`-style recorded message files.
//!
//! This is ambient tooling, not a first-class part of the reactor: it reuses
//! [`Codec`]'s resync mode to scan a file of raw network messages, skipping
//! over any interleaved bytes, and performs no handshake or validation of
//! its own. Handy for replaying a capture into tests without standing up a
//! socket.
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use spv_common::bitcoin::network::message::NetworkMessage;
use spv_common::network::Network;

use spv_p2p::fsm::codec::Codec;

/// Reads [`NetworkMessage`]s out of a flat file, one at a time.
pub struct Reader {
    file: File,
    codec: Codec,
    buf: Vec<u8>,
    eof: bool,
}

impl Reader {
    /// Open a message file for the given network.
    pub fn open(path: impl AsRef<Path>, network: Network) -> io::Result<Self> {
        Ok(Self {
            file: File::open(path)?,
            codec: Codec::new(network.into()),
            buf: Vec::new(),
            eof: false,
        })
    }

    /// Read the next message from the file, or `None` once it's exhausted.
    /// A message that fails to decode is treated as fatal, matching the
    /// codec's semantics over a live connection.
    pub fn next(&mut self) -> io::Result<Option<NetworkMessage>> {
        let mut chunk = [0u8; 64 * 1024];

        loop {
            match self.codec.decode(&mut self.buf) {
                Ok(Some(message)) => return Ok(Some(message)),
                Ok(None) => {}
                Err(err) => return Err(io::Error::new(io::ErrorKind::InvalidData, err)),
            }
            if self.eof {
                return Ok(None);
            }
            let n = self.file.read(&mut chunk)?;
            if n == 0 {
                self.eof = true;
                continue;
            }
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_reads_messages_interleaved_with_garbage() {
        let mut path = std::env::temp_dir();
        path.push(format!("spv-client-blockfile-test-{}", std::process::id()));

        let mut bytes = Vec::new();
        let write_codec = Codec::new(Network::Regtest.into());
        write_codec.encode(NetworkMessage::Verack, &mut bytes).unwrap();
        bytes.splice(0..0, [0xde, 0xad, 0xbe, 0xef]);
        write_codec.encode(NetworkMessage::Ping(7), &mut bytes).unwrap();

        {
            let mut file = File::create(&path).unwrap();
            file.write_all(&bytes).unwrap();
        }

        let mut reader = Reader::open(&path, Network::Regtest).unwrap();
        assert_eq!(reader.next().unwrap(), Some(NetworkMessage::Verack));
        assert_eq!(reader.next().unwrap(), Some(NetworkMessage::Ping(7)));
        assert_eq!(reader.next().unwrap(), None);

        std::fs::remove_file(&path).unwrap();
    }
}
