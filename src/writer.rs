use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::{self, BufWriter, Seek, Write};
use std::num::NonZeroU64;
use std::path::Path;

use countio::Counter;
use flate2::write::GzEncoder;
use twox_hash::XxHash3_64;

use crate::directory::{DirEntry, Directory};
use crate::header::{HEADER_SIZE, MAX_INITIAL_BYTES};
use crate::{BoundingBox, Compression, Header, MosaicError, MosaicResult, TileId, TileType};

/// Largest gzipped root directory that fits behind the header in the reserved space.
pub const MAX_ROOT_DIR_BYTES: usize = MAX_INITIAL_BYTES - HEADER_SIZE;

/// Entries per leaf directory on the first attempt to fit the root.
const INITIAL_LEAF_SIZE: usize = 4096;

/// Archive-wide header fields chosen by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArchiveHeader {
    /// Encoding of every tile.
    pub tile_type: TileType,
    /// Compression of every tile.
    pub tile_compression: Compression,
}

/// Descriptive metadata stored as gzipped `TileJSON`.
#[derive(Debug, Clone, PartialEq)]
pub struct ArchiveMetadata {
    /// Archive name, usually the collection.
    pub name: String,
    /// Human readable summary of the zoom bands.
    pub description: String,
    /// Area the archive covers.
    pub bounds: BoundingBox,
    /// Lowest zoom with tiles.
    pub min_zoom: u8,
    /// Highest zoom with tiles.
    pub max_zoom: u8,
}

/// Destination of rendered tiles.
///
/// Tiles may arrive in any order. `finalize` consumes the sink, so it runs at most once.
pub trait ArchiveSink {
    /// Stores one tile. Each tile id may be written once.
    fn write(&mut self, tile_id: TileId, data: &[u8]) -> MosaicResult<()>;

    /// Writes directories, metadata and header.
    fn finalize(self, header: ArchiveHeader, metadata: ArchiveMetadata) -> MosaicResult<()>;
}

/// Streaming `PMTiles` v3 writer.
///
/// Layout on disk:
/// ```text
/// +--------+----------------+-----------+----------+------------------+
/// | Header | Root Directory | Tile Data | Metadata | Leaf Directories |
/// +--------+----------------+-----------+----------+------------------+
/// ```
/// The first 16 KiB are reserved up front, tile data is appended as it arrives,
/// and header plus root directory are written last. Until then the header is zeroed.
pub struct PmTilesWriter<W: Write + Seek> {
    out: Counter<BufWriter<W>>,
    entries: Vec<DirEntry>,
    written_ids: HashSet<u64>,
    contents: HashMap<u64, (u64, u32)>,
    n_addressed_tiles: u64,
    max_root_bytes: usize,
}

impl PmTilesWriter<File> {
    /// Creates (or truncates) the archive file at `path`.
    pub fn create<P: AsRef<Path>>(path: P) -> MosaicResult<Self> {
        Self::new(File::create(path)?)
    }
}

impl<W: Write + Seek> PmTilesWriter<W> {
    /// Wraps any seekable output.
    pub fn new(output: W) -> MosaicResult<Self> {
        let mut out = BufWriter::new(output);
        // Reserve space for header and root directory
        out.write_all(&[0u8; MAX_INITIAL_BYTES])?;
        Ok(Self {
            out: Counter::new(out),
            entries: Vec::new(),
            written_ids: HashSet::new(),
            contents: HashMap::new(),
            n_addressed_tiles: 0,
            max_root_bytes: MAX_ROOT_DIR_BYTES,
        })
    }

    #[cfg(test)]
    pub(crate) fn with_max_root_bytes(mut self, max_root_bytes: usize) -> Self {
        self.max_root_bytes = max_root_bytes;
        self
    }

    /// Number of tiles written so far.
    #[must_use]
    pub fn tiles_written(&self) -> u64 {
        self.n_addressed_tiles
    }

    /// Number of distinct payloads stored so far.
    #[must_use]
    pub fn tile_contents(&self) -> usize {
        self.contents.len()
    }

    /// Adds a tile. Payloads already stored are referenced instead of written again.
    pub fn add_tile(&mut self, tile_id: TileId, data: &[u8]) -> MosaicResult<()> {
        if data.is_empty() {
            return Err(MosaicError::EmptyTile);
        }
        let id = tile_id.value();
        if !self.written_ids.insert(id) {
            return Err(MosaicError::DuplicateTile(id));
        }
        let length = u32::try_from(data.len()).map_err(|_| {
            io::Error::new(io::ErrorKind::InvalidInput, "tile larger than 4 GiB")
        })?;

        let hash = XxHash3_64::oneshot(data);
        let (offset, length) = match self.contents.get(&hash) {
            Some(&(offset, stored_len)) if stored_len == length => (offset, length),
            _ => {
                let offset = self.out.writer_bytes() as u64;
                self.out.write_all(data)?;
                self.contents.insert(hash, (offset, length));
                (offset, length)
            }
        };

        self.entries.push(DirEntry {
            tile_id: id,
            offset,
            length,
            run_length: 1,
        });
        self.n_addressed_tiles += 1;
        Ok(())
    }

    #[expect(clippy::cast_possible_truncation)]
    pub fn finish(mut self, header: ArchiveHeader, metadata: &ArchiveMetadata) -> MosaicResult<()> {
        let data_length = self.out.writer_bytes() as u64;

        self.entries.sort_unstable_by_key(|e| e.tile_id);
        let entries = merge_runs(std::mem::take(&mut self.entries));
        let n_tile_entries = entries.len() as u64;

        let (root_dir, leaves) = optimize_directories(entries, self.max_root_bytes)?;

        // Metadata follows tile data
        let metadata_json = serde_json::to_vec(&tilejson_for(header.tile_type, metadata))?;
        let metadata_length = {
            let mut encoder = GzEncoder::new(&mut self.out, flate2::Compression::default());
            encoder.write_all(&metadata_json)?;
            encoder.finish()?;
            self.out.writer_bytes() as u64 - data_length
        };
        self.out.write_all(&leaves)?;

        let mut root_buf = Vec::new();
        root_dir.write_compressed_to(&mut root_buf, Compression::Gzip)?;

        let mut pm_header = Header::new(header.tile_type, header.tile_compression);
        let data_offset = MAX_INITIAL_BYTES as u64;
        pm_header.root_offset = HEADER_SIZE as u64;
        pm_header.root_length = root_buf.len() as u64;
        pm_header.data_offset = data_offset;
        pm_header.data_length = data_length;
        pm_header.metadata_offset = data_offset + data_length;
        pm_header.metadata_length = metadata_length;
        pm_header.leaf_offset = pm_header.metadata_offset + metadata_length;
        pm_header.leaf_length = leaves.len() as u64;
        pm_header.n_addressed_tiles = NonZeroU64::new(self.n_addressed_tiles);
        pm_header.n_tile_entries = NonZeroU64::new(n_tile_entries);
        pm_header.n_tile_contents = NonZeroU64::new(self.contents.len() as u64);
        // Tiles arrive in completion order, not tile id order
        pm_header.clustered = false;
        pm_header.min_zoom = metadata.min_zoom;
        pm_header.max_zoom = metadata.max_zoom;
        let bounds = metadata.bounds;
        pm_header.min_longitude = bounds.min_lon as f32;
        pm_header.min_latitude = bounds.min_lat as f32;
        pm_header.max_longitude = bounds.max_lon as f32;
        pm_header.max_latitude = bounds.max_lat as f32;
        let (center_lon, center_lat) = bounds.center();
        pm_header.center_longitude = center_lon as f32;
        pm_header.center_latitude = center_lat as f32;
        pm_header.center_zoom = metadata.min_zoom;

        // Pop back to the beginning now that we have the header offsets
        let mut out = self.out.into_inner();
        out.rewind()?;
        pm_header.write_to(&mut out)?;
        out.write_all(&root_buf)?;
        out.flush()?;

        log::debug!(
            "Archive finalized: {} tiles, {n_tile_entries} entries, {} contents, root {} bytes, leaves {} bytes",
            self.n_addressed_tiles,
            self.contents.len(),
            root_buf.len(),
            leaves.len()
        );
        Ok(())
    }
}

impl<W: Write + Seek> ArchiveSink for PmTilesWriter<W> {
    fn write(&mut self, tile_id: TileId, data: &[u8]) -> MosaicResult<()> {
        self.add_tile(tile_id, data)
    }

    fn finalize(self, header: ArchiveHeader, metadata: ArchiveMetadata) -> MosaicResult<()> {
        self.finish(header, &metadata)
    }
}

impl Directory {
    /// Writes the directory compressed, returning the number of bytes written.
    pub(crate) fn write_compressed_to<W: Write>(
        &self,
        writer: W,
        compression: Compression,
    ) -> MosaicResult<usize> {
        let mut counter = Counter::new(writer);
        match compression {
            Compression::Gzip => {
                let mut encoder = GzEncoder::new(&mut counter, flate2::Compression::default());
                self.write_to(&mut encoder)?;
                encoder.finish()?;
            }
            Compression::None => self.write_to(&mut counter)?,
            v => return Err(MosaicError::UnsupportedCompression(v)),
        }
        counter.flush()?;
        Ok(counter.writer_bytes())
    }
}

/// Collapses consecutive tile ids sharing one payload into a single run.
fn merge_runs(sorted: Vec<DirEntry>) -> Vec<DirEntry> {
    let mut merged: Vec<DirEntry> = Vec::with_capacity(sorted.len());
    for entry in sorted {
        if let Some(last) = merged.last_mut()
            && last.offset == entry.offset
            && last.length == entry.length
            && last.run_length < u32::MAX
            && entry.tile_id == last.tile_id + u64::from(last.run_length)
        {
            last.run_length += 1;
            continue;
        }
        merged.push(entry);
    }
    merged
}

/// Splits entries into a root directory and serialized leaf directories.
///
/// The root alone is used while its gzipped form fits `max_root_bytes`. Otherwise
/// entries are chunked into leaves, growing the chunk size by 20% until the root of
/// leaf pointers fits.
pub(crate) fn optimize_directories(
    entries: Vec<DirEntry>,
    max_root_bytes: usize,
) -> MosaicResult<(Directory, Vec<u8>)> {
    let root = Directory::from_entries(entries);
    if root.write_compressed_to(io::sink(), Compression::Gzip)? <= max_root_bytes {
        return Ok((root, Vec::new()));
    }

    let entries = root.entries();
    let mut leaf_size = INITIAL_LEAF_SIZE;
    loop {
        let (root_dir, leaves) = build_leaves(entries, leaf_size)?;
        if root_dir.write_compressed_to(io::sink(), Compression::Gzip)? <= max_root_bytes {
            return Ok((root_dir, leaves));
        }
        if leaf_size >= entries.len() {
            return Err(MosaicError::RootDirectoryTooLarge(max_root_bytes));
        }
        #[expect(
            clippy::cast_possible_truncation,
            clippy::cast_sign_loss,
            clippy::cast_precision_loss
        )]
        let next = (leaf_size as f64 * 1.2) as usize;
        leaf_size = next.max(leaf_size + 1);
    }
}

fn build_leaves(entries: &[DirEntry], leaf_size: usize) -> MosaicResult<(Directory, Vec<u8>)> {
    let mut root = Directory::with_capacity(entries.len().div_ceil(leaf_size));
    let mut leaves = Vec::new();
    for chunk in entries.chunks(leaf_size) {
        let offset = leaves.len() as u64;
        let length = Directory::from_entries(chunk.to_vec())
            .write_compressed_to(&mut leaves, Compression::Gzip)?;
        root.push(DirEntry {
            tile_id: chunk[0].tile_id,
            offset,
            length: u32::try_from(length).map_err(|_| MosaicError::InvalidEntry)?,
            run_length: 0,
        });
    }
    Ok((root, leaves))
}

fn tilejson_for(tile_type: TileType, metadata: &ArchiveMetadata) -> tilejson::TileJSON {
    let bounds = metadata.bounds;
    let (center_lon, center_lat) = bounds.center();
    let mut tj = tilejson::tilejson! {
        tiles: vec![],
        name: metadata.name.clone(),
        description: metadata.description.clone(),
        minzoom: metadata.min_zoom,
        maxzoom: metadata.max_zoom,
        bounds: tilejson::Bounds::new(bounds.min_lon, bounds.min_lat, bounds.max_lon, bounds.max_lat),
        center: tilejson::Center::new(center_lon, center_lat, metadata.min_zoom),
    };
    tj.other.insert(
        "format".to_string(),
        serde_json::Value::String(tile_type.name().to_string()),
    );
    tj
}
