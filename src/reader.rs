// Lengths and offsets come from the archive itself, so a corrupt archive surfaces as an IO error
#![expect(clippy::cast_possible_truncation)]

use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::Path;

use bytes::Bytes;
use flate2::read::GzDecoder;

use crate::header::{HEADER_SIZE, MAX_INITIAL_BYTES};
use crate::{Compression, DirEntry, Directory, Header, MosaicError, MosaicResult, TileId};

/// Maximum depth of nested leaf directories followed when looking up a tile.
const MAX_LEAF_DEPTH: u8 = 4;

/// Blocking reader for archives produced by [`PmTilesWriter`](crate::PmTilesWriter).
#[derive(Debug)]
pub struct PmTilesReader<R> {
    source: R,
    header: Header,
    root_directory: Directory,
}

impl PmTilesReader<BufReader<File>> {
    /// Opens an archive on disk.
    pub fn open<P: AsRef<Path>>(path: P) -> MosaicResult<Self> {
        Self::try_from_source(BufReader::new(File::open(path)?))
    }
}

impl<R: Read + Seek> PmTilesReader<R> {
    /// Reads and validates the header and root directory.
    pub fn try_from_source(mut source: R) -> MosaicResult<Self> {
        let mut initial_bytes = Vec::with_capacity(MAX_INITIAL_BYTES);
        source
            .by_ref()
            .take(MAX_INITIAL_BYTES as u64)
            .read_to_end(&mut initial_bytes)?;
        if initial_bytes.len() < HEADER_SIZE {
            return Err(MosaicError::InvalidHeader);
        }
        let mut initial_bytes = Bytes::from(initial_bytes);
        let header = Header::try_from_bytes(initial_bytes.split_to(HEADER_SIZE))?;

        let root_start = (header.root_offset as usize)
            .checked_sub(HEADER_SIZE)
            .ok_or(MosaicError::InvalidHeader)?;
        let root_end = root_start + header.root_length as usize;
        if root_end > initial_bytes.len() {
            return Err(MosaicError::InvalidHeader);
        }
        let root_directory =
            Self::read_compressed_directory(header.internal_compression, &initial_bytes[root_start..root_end])?;

        Ok(Self {
            source,
            header,
            root_directory,
        })
    }

    /// Access header information.
    pub fn get_header(&self) -> &Header {
        &self.header
    }

    /// Root directory as stored in the archive.
    pub fn get_root_directory(&self) -> &Directory {
        &self.root_directory
    }

    /// Fetches the raw bytes of a tile, or `None` if the archive does not contain it.
    pub fn get_tile<Id: Into<TileId>>(&mut self, tile_id: Id) -> MosaicResult<Option<Bytes>> {
        let Some(entry) = self.find_tile_entry(tile_id.into())? else {
            return Ok(None);
        };
        let offset = self.header.data_offset + entry.offset;
        Ok(Some(self.read_exact(offset, entry.length as usize)?))
    }

    /// Decompressed metadata JSON.
    pub fn get_metadata(&mut self) -> MosaicResult<String> {
        let metadata = self.read_exact(
            self.header.metadata_offset,
            self.header.metadata_length as usize,
        )?;
        let decompressed = decompress(self.header.internal_compression, &metadata)?;
        String::from_utf8(decompressed).map_err(|_| MosaicError::InvalidHeader)
    }

    fn find_tile_entry(&mut self, tile_id: TileId) -> MosaicResult<Option<DirEntry>> {
        let mut entry = self.root_directory.find_tile_id(tile_id).cloned();
        let mut depth = 0;
        while let Some(leaf) = entry.as_ref().filter(|e| e.is_leaf()) {
            if depth > MAX_LEAF_DEPTH {
                return Ok(None);
            }
            let offset = self.header.leaf_offset + leaf.offset;
            let length = leaf.length as usize;
            let dir = self.read_directory(offset, length)?;
            entry = dir.find_tile_id(tile_id).cloned();
            depth += 1;
        }
        Ok(entry)
    }

    fn read_directory(&mut self, offset: u64, length: usize) -> MosaicResult<Directory> {
        let data = self.read_exact(offset, length)?;
        Self::read_compressed_directory(self.header.internal_compression, &data)
    }

    fn read_compressed_directory(compression: Compression, bytes: &[u8]) -> MosaicResult<Directory> {
        let decompressed = decompress(compression, bytes)?;
        Directory::try_from(decompressed.as_slice())
    }

    fn read_exact(&mut self, offset: u64, length: usize) -> MosaicResult<Bytes> {
        let mut buf = vec![0; length];
        self.source.seek(SeekFrom::Start(offset))?;
        self.source.read_exact(&mut buf)?;
        Ok(Bytes::from(buf))
    }
}

fn decompress(compression: Compression, bytes: &[u8]) -> MosaicResult<Vec<u8>> {
    match compression {
        Compression::None => Ok(bytes.to_vec()),
        Compression::Gzip => {
            let mut decompressed = Vec::with_capacity(bytes.len() * 2);
            GzDecoder::new(bytes).read_to_end(&mut decompressed)?;
            Ok(decompressed)
        }
        v => Err(MosaicError::UnsupportedCompression(v)),
    }
}
