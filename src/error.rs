//! Error type shared by every stage of archive generation.

use thiserror::Error;

use crate::Compression;
use crate::raster::RasterError;

/// A specialized [`Result`] type for mosaic generation.
pub type MosaicResult<T> = Result<T, MosaicError>;

/// Errors that can occur while generating a mosaic archive.
#[derive(Debug, Error)]
pub enum MosaicError {
    /// A coordinate outside the tile grid of its zoom.
    #[error("Invalid tile coordinate {z}/{x}/{y}")]
    InvalidTileCoord {
        /// Zoom level.
        z: u8,
        /// Column.
        x: u32,
        /// Row.
        y: u32,
    },
    /// A tile id beyond the last tile of [`MAX_ZOOM`](crate::MAX_ZOOM).
    #[error("Invalid tile id {0}")]
    InvalidTileId(u64),
    /// Malformed or out-of-range bounding box.
    #[error("Invalid bounding box: {0}")]
    InvalidBoundingBox(String),
    /// A footprint whose geometry cannot be indexed.
    #[error("Invalid geometry for footprint {id}: {reason}")]
    InvalidGeometry {
        /// Catalog item id.
        id: String,
        /// What is wrong with it.
        reason: String,
    },
    /// The catalog returned nothing to render for the collection.
    #[error("No footprints found for collection {0}")]
    NoFootprints(String),
    /// The footprint catalog could not be read.
    #[error("Catalog query failed: {0}")]
    Catalog(String),
    /// Settings rejected before any tile is rendered.
    #[error("Invalid configuration: {0}")]
    Config(String),
    /// The run was interrupted before every selected tile was rendered.
    #[error("Run was cancelled after {processed} of {total} tiles")]
    Cancelled {
        /// Tiles rendered before the interruption.
        processed: u64,
        /// Tiles selected for the run.
        total: u64,
    },
    /// The sink received the same tile id twice.
    #[error("Tile {0} was already written to the archive")]
    DuplicateTile(u64),
    /// Tiles must carry data.
    #[error("A tile must have at least 1 byte of data")]
    EmptyTile,
    /// Too many distinct runs of tile ids for the root directory.
    #[error("Root directory does not fit in {0} bytes")]
    RootDirectoryTooLarge(usize),
    /// The file does not start with the `PMTiles` magic.
    #[error("Invalid magic number")]
    InvalidMagicNumber,
    /// Only version 3 archives are read.
    #[error("Invalid PMTiles version")]
    UnsupportedPmTilesVersion,
    /// Unknown compression byte.
    #[error("Invalid compression")]
    InvalidCompression,
    /// Internal compression the reader cannot undo.
    #[error("Unsupported compression {0:?}")]
    UnsupportedCompression(Compression),
    /// A directory entry that does not decode.
    #[error("Invalid PMTiles entry")]
    InvalidEntry,
    /// Truncated or inconsistent header.
    #[error("Invalid header")]
    InvalidHeader,
    /// Unknown tile type byte.
    #[error("Invalid tile type")]
    InvalidTileType,
    /// A tile request kept failing after every retry.
    #[error("Fetching {url} failed after {attempts} attempt(s)")]
    FetchFailed {
        /// Requested URL.
        url: String,
        /// Requests made, including the first.
        attempts: u32,
    },
    /// Local file I/O.
    #[error("IO Error {0}")]
    Io(#[from] std::io::Error),
    /// Raster source failure that escaped the fallback path.
    #[error(transparent)]
    Raster(#[from] RasterError),
    /// Image decoding or encoding.
    #[error(transparent)]
    Image(#[from] image::ImageError),
    /// Catalog or metadata JSON.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    /// HTTP client setup or transport.
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    /// Object storage upload.
    #[cfg(feature = "upload")]
    #[error(transparent)]
    ObjectStore(#[from] object_store::Error),
    /// `PgSTAC` query.
    #[cfg(feature = "pgstac")]
    #[error(transparent)]
    Sql(#[from] sqlx::Error),
}
