//! Tile image encoding.

use std::fmt::{Display, Formatter};
use std::str::FromStr;

use bytes::Bytes;
use image::codecs::png::{CompressionType, FilterType, PngEncoder};
use image::codecs::webp::WebPEncoder;
use image::{ExtendedColorType, ImageEncoder, RgbaImage};

use crate::{MosaicError, MosaicResult, TileType};

/// Image format of rendered tiles.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum TileFormat {
    /// Lossless PNG.
    #[default]
    Png,
    /// Lossless WebP.
    Webp,
}

impl TileFormat {
    /// Matching archive tile type.
    #[must_use]
    pub fn tile_type(self) -> TileType {
        match self {
            TileFormat::Png => TileType::Png,
            TileFormat::Webp => TileType::Webp,
        }
    }
}

impl Display for TileFormat {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.tile_type().name())
    }
}

impl FromStr for TileFormat {
    type Err = MosaicError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "png" => Ok(TileFormat::Png),
            "webp" => Ok(TileFormat::Webp),
            other => Err(MosaicError::Config(format!("unsupported tile format {other}"))),
        }
    }
}

/// Encodes an RGBA tile.
pub fn encode_rgba(image: &RgbaImage, format: TileFormat) -> MosaicResult<Bytes> {
    let mut buffer: Vec<u8> = Vec::new();
    match format {
        TileFormat::Png => {
            PngEncoder::new_with_quality(&mut buffer, CompressionType::Default, FilterType::Adaptive)
                .write_image(
                    image.as_raw(),
                    image.width(),
                    image.height(),
                    ExtendedColorType::Rgba8,
                )?;
        }
        TileFormat::Webp => {
            WebPEncoder::new_lossless(&mut buffer).write_image(
                image.as_raw(),
                image.width(),
                image.height(),
                ExtendedColorType::Rgba8,
            )?;
        }
    }
    Ok(Bytes::from(buffer))
}
