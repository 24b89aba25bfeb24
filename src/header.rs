//! `PMTiles` v3 header encoding and decoding.

use std::io::Write;
use std::num::NonZeroU64;
use std::panic::catch_unwind;

use bytes::{Buf, Bytes};

use crate::{MosaicError, MosaicResult};

/// Space reserved at the start of the archive for the header and root directory.
pub const MAX_INITIAL_BYTES: usize = 16_384;
/// Size of the fixed `PMTiles` v3 header.
pub const HEADER_SIZE: usize = 127;

/// `PMTiles` v3 header.
#[derive(Debug, Clone, PartialEq)]
pub struct Header {
    pub(crate) version: u8,
    pub(crate) root_offset: u64,
    pub(crate) root_length: u64,
    pub(crate) metadata_offset: u64,
    pub(crate) metadata_length: u64,
    pub(crate) leaf_offset: u64,
    pub(crate) leaf_length: u64,
    pub(crate) data_offset: u64,
    pub(crate) data_length: u64,
    pub(crate) n_addressed_tiles: Option<NonZeroU64>,
    pub(crate) n_tile_entries: Option<NonZeroU64>,
    pub(crate) n_tile_contents: Option<NonZeroU64>,
    pub(crate) clustered: bool,
    pub(crate) internal_compression: Compression,
    /// Compression of every tile.
    pub tile_compression: Compression,
    /// Encoding of every tile.
    pub tile_type: TileType,
    /// Lowest zoom with tiles.
    pub min_zoom: u8,
    /// Highest zoom with tiles.
    pub max_zoom: u8,
    /// West edge in degrees.
    pub min_longitude: f32,
    /// South edge.
    pub min_latitude: f32,
    /// East edge.
    pub max_longitude: f32,
    /// North edge.
    pub max_latitude: f32,
    /// Suggested initial view.
    pub center_zoom: u8,
    /// Center longitude.
    pub center_longitude: f32,
    /// Center latitude.
    pub center_latitude: f32,
}

/// Compression of tiles or internal structures.
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub enum Compression {
    /// Not declared by the writer.
    Unknown,
    /// Stored as is.
    None,
    /// Gzip.
    Gzip,
    /// Brotli.
    Brotli,
    /// Zstandard.
    Zstd,
}

impl From<Compression> for u8 {
    fn from(value: Compression) -> Self {
        match value {
            Compression::Unknown => 0,
            Compression::None => 1,
            Compression::Gzip => 2,
            Compression::Brotli => 3,
            Compression::Zstd => 4,
        }
    }
}

impl TryFrom<u8> for Compression {
    type Error = MosaicError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Compression::Unknown),
            1 => Ok(Compression::None),
            2 => Ok(Compression::Gzip),
            3 => Ok(Compression::Brotli),
            4 => Ok(Compression::Zstd),
            _ => Err(MosaicError::InvalidCompression),
        }
    }
}

/// Type of the tiles stored in an archive.
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub enum TileType {
    /// Not declared by the writer.
    Unknown,
    /// Mapbox vector tiles.
    Mvt,
    /// PNG images.
    Png,
    /// JPEG images.
    Jpeg,
    /// WebP images.
    Webp,
    /// AVIF images.
    Avif,
}

impl TileType {
    /// Short lowercase name, as used in `TileJSON` and logs.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            TileType::Mvt => "mvt",
            TileType::Png => "png",
            TileType::Webp => "webp",
            TileType::Jpeg => "jpg",
            TileType::Avif => "avif",
            TileType::Unknown => "unknown",
        }
    }
}

impl From<TileType> for u8 {
    fn from(value: TileType) -> Self {
        match value {
            TileType::Unknown => 0,
            TileType::Mvt => 1,
            TileType::Png => 2,
            TileType::Jpeg => 3,
            TileType::Webp => 4,
            TileType::Avif => 5,
        }
    }
}

impl TryFrom<u8> for TileType {
    type Error = MosaicError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(TileType::Unknown),
            1 => Ok(TileType::Mvt),
            2 => Ok(TileType::Png),
            3 => Ok(TileType::Jpeg),
            4 => Ok(TileType::Webp),
            5 => Ok(TileType::Avif),
            _ => Err(MosaicError::InvalidTileType),
        }
    }
}

static V3_MAGIC: &str = "PMTiles";
static V2_MAGIC: &str = "PM";

impl Header {
    /// Empty v3 header for a new archive. Offsets and counts are filled in on finalize.
    #[must_use]
    pub(crate) fn new(tile_type: TileType, tile_compression: Compression) -> Self {
        Self {
            version: 3,
            root_offset: HEADER_SIZE as u64,
            root_length: 0,
            metadata_offset: 0,
            metadata_length: 0,
            leaf_offset: 0,
            leaf_length: 0,
            data_offset: MAX_INITIAL_BYTES as u64,
            data_length: 0,
            n_addressed_tiles: None,
            n_tile_entries: None,
            n_tile_contents: None,
            clustered: false,
            internal_compression: Compression::Gzip,
            tile_compression,
            tile_type,
            min_zoom: 0,
            max_zoom: 0,
            min_longitude: -180.0,
            min_latitude: -85.0,
            max_longitude: 180.0,
            max_latitude: 85.0,
            center_zoom: 0,
            center_longitude: 0.0,
            center_latitude: 0.0,
        }
    }

    /// `PMTiles` format version, always 3.
    #[must_use]
    pub fn spec_version(&self) -> u8 {
        self.version
    }

    /// Number of tiles addressed by the archive, counting run-length repeats.
    #[must_use]
    pub fn addressed_tiles(&self) -> u64 {
        self.n_addressed_tiles.map_or(0, NonZeroU64::get)
    }

    /// Number of directory entries.
    #[must_use]
    pub fn tile_entries(&self) -> u64 {
        self.n_tile_entries.map_or(0, NonZeroU64::get)
    }

    /// Number of distinct tile payloads.
    #[must_use]
    pub fn tile_contents(&self) -> u64 {
        self.n_tile_contents.map_or(0, NonZeroU64::get)
    }

    /// Whether tile data is ordered by tile id.
    #[must_use]
    pub fn is_clustered(&self) -> bool {
        self.clustered
    }

    /// Compression of directories and metadata.
    #[must_use]
    pub fn internal_compression(&self) -> Compression {
        self.internal_compression
    }

    /// Bounds as `TileJSON` bounds.
    #[must_use]
    pub fn get_bounds(&self) -> tilejson::Bounds {
        tilejson::Bounds::new(
            f64::from(self.min_longitude),
            f64::from(self.min_latitude),
            f64::from(self.max_longitude),
            f64::from(self.max_latitude),
        )
    }

    /// Center as `TileJSON` center.
    #[must_use]
    pub fn get_center(&self) -> tilejson::Center {
        tilejson::Center::new(
            f64::from(self.center_longitude),
            f64::from(self.center_latitude),
            self.center_zoom,
        )
    }

    #[expect(clippy::cast_precision_loss)]
    fn read_coordinate_part<B: Buf>(mut buf: B) -> f32 {
        buf.get_i32_le() as f32 / 10_000_000.
    }

    #[expect(clippy::cast_possible_truncation)]
    fn coordinate_part(value: f32) -> i32 {
        (f64::from(value) * 10_000_000.0).round() as i32
    }

    /// Parses the first [`HEADER_SIZE`] bytes of an archive.
    pub fn try_from_bytes(mut bytes: Bytes) -> MosaicResult<Self> {
        let magic_bytes = bytes.split_to(V3_MAGIC.len().min(bytes.len()));

        // Assert magic
        if magic_bytes != V3_MAGIC {
            return Err(if magic_bytes.starts_with(V2_MAGIC.as_bytes()) {
                MosaicError::UnsupportedPmTilesVersion
            } else {
                MosaicError::InvalidMagicNumber
            });
        }

        // Wrap the panics that are possible in `get_u*_le` calls. (Panic occurs if the buffer is exhausted.)
        catch_unwind(move || {
            Ok(Self {
                version: bytes.get_u8(),
                root_offset: bytes.get_u64_le(),
                root_length: bytes.get_u64_le(),
                metadata_offset: bytes.get_u64_le(),
                metadata_length: bytes.get_u64_le(),
                leaf_offset: bytes.get_u64_le(),
                leaf_length: bytes.get_u64_le(),
                data_offset: bytes.get_u64_le(),
                data_length: bytes.get_u64_le(),
                n_addressed_tiles: NonZeroU64::new(bytes.get_u64_le()),
                n_tile_entries: NonZeroU64::new(bytes.get_u64_le()),
                n_tile_contents: NonZeroU64::new(bytes.get_u64_le()),
                clustered: bytes.get_u8() == 1,
                internal_compression: bytes.get_u8().try_into()?,
                tile_compression: bytes.get_u8().try_into()?,
                tile_type: bytes.get_u8().try_into()?,
                min_zoom: bytes.get_u8(),
                max_zoom: bytes.get_u8(),
                min_longitude: Self::read_coordinate_part(&mut bytes),
                min_latitude: Self::read_coordinate_part(&mut bytes),
                max_longitude: Self::read_coordinate_part(&mut bytes),
                max_latitude: Self::read_coordinate_part(&mut bytes),
                center_zoom: bytes.get_u8(),
                center_longitude: Self::read_coordinate_part(&mut bytes),
                center_latitude: Self::read_coordinate_part(&mut bytes),
            })
        })
        .map_err(|_| MosaicError::InvalidHeader)?
    }

    /// Serializes the header into exactly [`HEADER_SIZE`] bytes.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> std::io::Result<()> {
        let mut buf = Vec::with_capacity(HEADER_SIZE);
        buf.extend_from_slice(V3_MAGIC.as_bytes());
        buf.push(self.version);
        for value in [
            self.root_offset,
            self.root_length,
            self.metadata_offset,
            self.metadata_length,
            self.leaf_offset,
            self.leaf_length,
            self.data_offset,
            self.data_length,
            self.addressed_tiles(),
            self.tile_entries(),
            self.tile_contents(),
        ] {
            buf.extend_from_slice(&value.to_le_bytes());
        }
        buf.push(u8::from(self.clustered));
        buf.push(self.internal_compression.into());
        buf.push(self.tile_compression.into());
        buf.push(self.tile_type.into());
        buf.push(self.min_zoom);
        buf.push(self.max_zoom);
        for value in [
            self.min_longitude,
            self.min_latitude,
            self.max_longitude,
            self.max_latitude,
        ] {
            buf.extend_from_slice(&Self::coordinate_part(value).to_le_bytes());
        }
        buf.push(self.center_zoom);
        buf.extend_from_slice(&Self::coordinate_part(self.center_longitude).to_le_bytes());
        buf.extend_from_slice(&Self::coordinate_part(self.center_latitude).to_le_bytes());
        debug_assert_eq!(buf.len(), HEADER_SIZE);
        writer.write_all(&buf)
    }
}
