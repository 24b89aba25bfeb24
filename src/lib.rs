#![forbid(unsafe_code)]
//! Generate a single `PMTiles` archive summarizing an imagery collection: coverage masks
//! at coarse zooms and imagery tiles at fine zooms.

mod tile;
pub use tile::{MAX_ZOOM, TileCoord, TileId};

mod bbox;
pub use bbox::{BoundingBox, TileRange};

mod header;
pub use crate::header::{Compression, Header, TileType};

mod directory;
pub use directory::{DirEntry, Directory};

mod error;
pub use error::{MosaicError, MosaicResult};

mod writer;
pub use writer::{ArchiveHeader, ArchiveMetadata, ArchiveSink, PmTilesWriter};

mod reader;
pub use reader::PmTilesReader;

mod index;
pub use index::SpatialIndex;

pub mod footprint;
pub use footprint::{Footprint, FootprintSet};

pub mod select;
pub use select::{TileJob, TileSelector};

pub mod encode;
pub use encode::TileFormat;

pub mod coverage;
pub mod raster;
pub mod cache;
pub mod fetch;
pub mod mosaic;
pub mod render;
pub mod engine;
pub mod catalog;
pub mod pipeline;
pub use pipeline::{Pipeline, PipelineConfig, RunSummary};

#[cfg(feature = "upload")]
pub mod upload;
