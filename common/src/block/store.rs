//! Persistent storage for block headers.
use std::collections::VecDeque;
use std::fs;
use std::io::{self, Read, Seek, Write};
use std::iter;
use std::mem;
use std::path::Path;

use bitcoin::blockdata::block::BlockHeader;
use bitcoin::consensus::{encode, Decodable, Encodable};

use crate::block::Height;

/// A block storage error.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An I/O error.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    /// An error decoding a stored header.
    #[error("error decoding header: {0}")]
    Decoding(#[from] encode::Error),
    /// A data-corruption error.
    #[error("error: the store data is corrupt")]
    Corruption,
    /// The operation was interrupted.
    #[error("the operation was interrupted")]
    Interrupted,
}

/// Append-only storage for a chain of block headers, anchored at a genesis.
pub trait Store {
    /// The header type stored.
    type Header: Sized;

    /// The genesis header.
    fn genesis(&self) -> Self::Header;
    /// Append a batch of consecutive headers to the end of the store.
    fn put<I: Iterator<Item = Self::Header>>(&mut self, headers: I) -> Result<Height, Error>;
    /// Get the header at the given height.
    fn get(&self, height: Height) -> Result<Self::Header, Error>;
    /// Roll back the store to the given height, discarding anything after it.
    fn rollback(&mut self, height: Height) -> Result<(), Error>;
    /// Synchronize changes to disk.
    fn sync(&mut self) -> Result<(), Error>;
    /// Iterate over all headers in the store, from genesis.
    fn iter(&self) -> Box<dyn Iterator<Item = Result<(Height, Self::Header), Error>>>;
    /// Return the number of headers in the store, including genesis.
    fn len(&self) -> Result<usize, Error>;
    /// Whether the store is empty save for genesis.
    fn is_empty(&self) -> Result<bool, Error> {
        self.len().map(|n| n <= 1)
    }
    /// Return the height of the store tip.
    fn height(&self) -> Result<Height, Error> {
        self.len().map(|n| n as Height - 1)
    }
    /// Check the store integrity.
    fn check(&self) -> Result<(), Error>;
    /// Attempt to heal data corruption.
    fn heal(&self) -> Result<(), Error>;
}

fn put<H: Encodable, S: Seek + Write, I: Iterator<Item = H>>(
    mut stream: S,
    headers: I,
) -> Result<Height, Error> {
    let mut pos = stream.seek(io::SeekFrom::End(0))?;
    let size = mem::size_of::<H>();

    for header in headers {
        pos += header.consensus_encode(&mut stream)? as u64;
    }
    Ok(pos / size as u64)
}

fn get<H: Decodable, S: Seek + Read>(mut stream: S, ix: u64) -> Result<H, Error> {
    let size = mem::size_of::<H>();
    let mut buf = vec![0; size];

    stream.seek(io::SeekFrom::Start(ix * size as u64))?;
    stream.read_exact(&mut buf)?;

    H::consensus_decode(&mut buf.as_slice()).map_err(Error::from)
}

/// Reads headers from a file in batches.
#[derive(Debug)]
struct FileReader<H> {
    file: fs::File,
    queue: VecDeque<H>,
    index: u64,
}

impl<H: Decodable> FileReader<H> {
    const BATCH_SIZE: usize = 64;

    fn new(file: fs::File) -> Self {
        Self { file, queue: VecDeque::new(), index: 0 }
    }

    fn next(&mut self) -> Result<Option<H>, Error> {
        let size = mem::size_of::<H>();

        if self.queue.is_empty() {
            let mut buf = vec![0; size * Self::BATCH_SIZE];
            let from = self.file.seek(io::SeekFrom::Start(self.index))?;

            match self.file.read_exact(&mut buf) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => {
                    self.file.seek(io::SeekFrom::Start(from))?;
                    let n = self.file.read_to_end(&mut buf)?;
                    buf.truncate(n);
                }
                Err(err) => return Err(err.into()),
            }
            self.index += buf.len() as u64;

            let items = buf.len() / size;
            let mut cursor = io::Cursor::new(buf);
            let mut item = vec![0; size];

            for _ in 0..items {
                cursor.read_exact(&mut item)?;
                self.queue.push_back(H::consensus_decode(&mut item.as_slice())?);
            }
        }
        Ok(self.queue.pop_front())
    }
}

/// An iterator over headers in a file, starting from the given height.
#[derive(Debug)]
pub struct Iter<H> {
    height: Height,
    file: FileReader<H>,
}

impl<H: Decodable> Iter<H> {
    fn new(file: fs::File, height: Height) -> Self {
        Self { file: FileReader::new(file), height }
    }
}

impl<H: Decodable> Iterator for Iter<H> {
    type Item = Result<(Height, H), Error>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.file.next() {
            Err(Error::Io(err)) if err.kind() == io::ErrorKind::UnexpectedEof => None,
            Err(err) => Some(Err(err)),
            Ok(Some(h)) => {
                self.height += 1;
                Some(Ok((self.height, h)))
            }
            Ok(None) => None,
        }
    }
}

/// A header store backed by a single append-only file.
#[derive(Debug)]
pub struct File<H> {
    file: fs::File,
    genesis: H,
}

impl<H> File<H> {
    /// Open an existing file store, or create it, at the given path.
    pub fn open<P: AsRef<Path>>(path: P, genesis: H) -> io::Result<Self> {
        fs::OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(path)
            .map(|file| Self { file, genesis })
    }

    /// Create a new file store at the given path. Errors if it already exists.
    pub fn create<P: AsRef<Path>>(path: P, genesis: H) -> Result<Self, Error> {
        let file = fs::OpenOptions::new()
            .create_new(true)
            .read(true)
            .write(true)
            .open(path)?;
        Ok(Self { file, genesis })
    }
}

impl<H: 'static + Clone + Encodable + Decodable> Store for File<H> {
    type Header = H;

    fn genesis(&self) -> H {
        self.genesis.clone()
    }

    fn put<I: Iterator<Item = Self::Header>>(&mut self, headers: I) -> Result<Height, Error> {
        self::put(&mut self.file, headers)
    }

    fn get(&self, height: Height) -> Result<H, Error> {
        if let Some(ix) = height.checked_sub(1) {
            let mut file = self.file.try_clone()?;
            get(&mut file, ix)
        } else {
            Ok(self.genesis.clone())
        }
    }

    fn rollback(&mut self, height: Height) -> Result<(), Error> {
        let size = mem::size_of::<H>() as u64;
        self.file.set_len(height.saturating_sub(1) * size)?;
        self.file.seek(io::SeekFrom::End(0))?;
        Ok(())
    }

    fn sync(&mut self) -> Result<(), Error> {
        self.file.sync_data().map_err(Error::from)
    }

    fn iter(&self) -> Box<dyn Iterator<Item = Result<(Height, H), Error>>> {
        match self.file.try_clone() {
            Ok(file) => Box::new(iter::once(Ok((0, self.genesis.clone()))).chain(Iter::new(file, 0))),
            Err(err) => Box::new(iter::once(Err(Error::Io(err)))),
        }
    }

    fn len(&self) -> Result<usize, Error> {
        let meta = self.file.metadata()?;
        let len = meta.len();
        let size = mem::size_of::<H>();

        if len as usize % size != 0 {
            return Err(Error::Corruption);
        }
        Ok(len as usize / size + 1)
    }

    fn check(&self) -> Result<(), Error> {
        self.len().map(|_| ())
    }

    fn heal(&self) -> Result<(), Error> {
        let meta = self.file.metadata()?;
        let len = meta.len();
        let size = mem::size_of::<H>() as u64;

        let extraneous = len % size;
        if extraneous != 0 {
            self.file.set_len(len - extraneous)?;
        }
        Ok(())
    }
}

/// An in-memory header store, used in tests.
#[derive(Debug, Clone)]
pub struct Memory<H>(nonempty::NonEmpty<H>);

impl<H> Memory<H> {
    /// Create a new in-memory store from a non-empty chain of headers.
    pub fn new(chain: nonempty::NonEmpty<H>) -> Self {
        Self(chain)
    }
}

impl Store for Memory<BlockHeader> {
    type Header = BlockHeader;

    fn genesis(&self) -> BlockHeader {
        *self.0.first()
    }

    fn put<I: Iterator<Item = Self::Header>>(&mut self, headers: I) -> Result<Height, Error> {
        self.0.tail.extend(headers);
        Ok(self.0.len() as Height - 1)
    }

    fn get(&self, height: Height) -> Result<BlockHeader, Error> {
        self.0
            .get(height as usize)
            .copied()
            .ok_or_else(|| Error::Io(io::Error::new(io::ErrorKind::UnexpectedEof, "unexpected end of file")))
    }

    fn rollback(&mut self, height: Height) -> Result<(), Error> {
        self.0.tail.truncate(height as usize);
        Ok(())
    }

    fn sync(&mut self) -> Result<(), Error> {
        Ok(())
    }

    fn iter(&self) -> Box<dyn Iterator<Item = Result<(Height, BlockHeader), Error>>> {
        Box::new(self.0.clone().into_iter().enumerate().map(|(i, h)| Ok((i as Height, h))))
    }

    fn len(&self) -> Result<usize, Error> {
        Ok(self.0.len())
    }

    fn check(&self) -> Result<(), Error> {
        Ok(())
    }

    fn heal(&self) -> Result<(), Error> {
        Ok(())
    }
}
