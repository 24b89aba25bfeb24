//! Raster windows read from imagery sources.
//!
//! [`RasterSource`] opens a source by URL; the returned [`RasterHandle`] reports its
//! band count and reads the pixels covering one output tile together with a
//! validity mask. [`TileDirSource`] reads a local `<root>/<z>/<x>/<y>.<ext>` image
//! pyramid.

use std::future::Future;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView};
use thiserror::Error;

use crate::TileCoord;

/// Failure to open or read an imagery source.
#[derive(Debug, Error)]
pub enum RasterError {
    /// Nothing at this URL.
    #[error("Raster source {0} not found")]
    NotFound(String),
    /// The source exists but cannot be read as imagery.
    #[error("Unsupported raster source {url}: {reason}")]
    Format { url: String, reason: String },
    /// Reading failed, possibly only this time.
    #[error("IO error reading {url}: {source}")]
    Io {
        url: String,
        #[source]
        source: std::io::Error,
    },
}

impl RasterError {
    /// Only I/O failures may succeed on a later attempt.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, RasterError::Io { .. })
    }
}

/// Pixels of one tile-sized window, band-interleaved, plus a per-pixel validity mask.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PixelWindow {
    /// Pixels per row.
    pub width: u32,
    /// Rows.
    pub height: u32,
    /// Values per pixel.
    pub bands: usize,
    /// `width * height * bands` values, row-major.
    pub data: Vec<u8>,
    /// One flag per pixel.
    pub valid: Vec<bool>,
}

impl PixelWindow {
    /// A window where no pixel is valid.
    #[must_use]
    pub fn empty(width: u32, height: u32, bands: usize) -> Self {
        let n = width as usize * height as usize;
        Self {
            width,
            height,
            bands,
            data: vec![0; n * bands],
            valid: vec![false; n],
        }
    }

    /// Out-of-range pixels are invalid.
    #[must_use]
    pub fn is_valid(&self, x: u32, y: u32) -> bool {
        self.valid
            .get(self.index(x, y))
            .copied()
            .unwrap_or(false)
    }

    /// Band values of one pixel.
    #[must_use]
    pub fn pixel(&self, x: u32, y: u32) -> &[u8] {
        let start = self.index(x, y) * self.bands;
        self.data.get(start..start + self.bands).unwrap_or(&[])
    }

    /// At least one pixel is valid.
    #[must_use]
    pub fn has_valid_pixels(&self) -> bool {
        self.valid.iter().any(|v| *v)
    }

    fn index(&self, x: u32, y: u32) -> usize {
        y as usize * self.width as usize + x as usize
    }
}

/// An opened imagery source.
pub trait RasterHandle: Send + Sync {
    /// Number of colour bands, excluding any alpha or mask band.
    fn band_count(&self) -> usize;

    /// Reads `bands` (1-based) for the area of `coord`, resampled to `size` x `size`.
    fn read_tile(
        &self,
        coord: TileCoord,
        bands: &[usize],
        size: u32,
    ) -> impl Future<Output = Result<PixelWindow, RasterError>> + Send;
}

/// Opens imagery sources by URL.
pub trait RasterSource: Send + Sync {
    /// Opened source.
    type Handle: RasterHandle + 'static;

    /// Opens `url`. Only [`RasterError::Io`] is worth retrying.
    fn open(&self, url: &str) -> impl Future<Output = Result<Self::Handle, RasterError>> + Send;
}

/// Image extensions looked up for each tile, in order.
const TILE_EXTENSIONS: [&str; 4] = ["png", "webp", "jpg", "jpeg"];

/// Reads imagery from local `<root>/<z>/<x>/<y>.<ext>` tile pyramids.
///
/// URLs are directory paths, optionally prefixed with `file://`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TileDirSource;

/// An opened tile pyramid.
#[derive(Debug, Clone)]
pub struct TileDirHandle {
    url: String,
    root: PathBuf,
    band_count: usize,
}

impl RasterSource for TileDirSource {
    type Handle = TileDirHandle;

    async fn open(&self, url: &str) -> Result<TileDirHandle, RasterError> {
        let root = PathBuf::from(url.strip_prefix("file://").unwrap_or(url));
        match tokio::fs::metadata(&root).await {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => {
                return Err(RasterError::Format {
                    url: url.to_string(),
                    reason: "not a directory".to_string(),
                });
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(RasterError::NotFound(url.to_string()));
            }
            Err(source) => {
                return Err(RasterError::Io {
                    url: url.to_string(),
                    source,
                });
            }
        }

        let Some(sample) = first_tile(&root).await.map_err(|source| RasterError::Io {
            url: url.to_string(),
            source,
        })?
        else {
            return Err(RasterError::Format {
                url: url.to_string(),
                reason: "no tiles found".to_string(),
            });
        };
        let image = decode(url, &read_file(url, &sample).await?)?;
        let band_count = color_bands(&image);
        log::debug!("Opened tile pyramid {url} with {band_count} band(s)");

        Ok(TileDirHandle {
            url: url.to_string(),
            root,
            band_count,
        })
    }
}

impl RasterHandle for TileDirHandle {
    fn band_count(&self) -> usize {
        self.band_count
    }

    async fn read_tile(
        &self,
        coord: TileCoord,
        bands: &[usize],
        size: u32,
    ) -> Result<PixelWindow, RasterError> {
        if let Some(&band) = bands.iter().find(|&&b| b == 0 || b > self.band_count) {
            return Err(RasterError::Format {
                url: self.url.clone(),
                reason: format!("band {band} not in 1..={}", self.band_count),
            });
        }

        let Some(bytes) = self.find_tile(coord).await? else {
            return Ok(PixelWindow::empty(size, size, bands.len()));
        };
        let mut image = decode(&self.url, &bytes)?;
        if image.dimensions() != (size, size) {
            image = image.resize_exact(size, size, FilterType::Triangle);
        }
        let has_alpha = image.color().has_alpha();
        let rgba = image.to_rgba8();

        let mut window = PixelWindow::empty(size, size, bands.len());
        for (i, pixel) in rgba.pixels().enumerate() {
            window.valid[i] = !has_alpha || pixel.0[3] > 0;
            for (j, band) in bands.iter().enumerate() {
                window.data[i * bands.len() + j] = pixel.0[band - 1];
            }
        }
        Ok(window)
    }
}

impl TileDirHandle {
    async fn find_tile(&self, coord: TileCoord) -> Result<Option<Vec<u8>>, RasterError> {
        let dir = self
            .root
            .join(coord.z().to_string())
            .join(coord.x().to_string());
        for ext in TILE_EXTENSIONS {
            let path = dir.join(format!("{}.{ext}", coord.y()));
            match tokio::fs::read(&path).await {
                Ok(bytes) => return Ok(Some(bytes)),
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(source) => {
                    return Err(RasterError::Io {
                        url: self.url.clone(),
                        source,
                    });
                }
            }
        }
        Ok(None)
    }
}

/// Any tile of the lowest zoom level present, used to read the band layout.
async fn first_tile(root: &Path) -> std::io::Result<Option<PathBuf>> {
    let mut zooms = numeric_entries(root).await?;
    zooms.sort_unstable_by_key(|(n, _)| *n);
    for (_, zoom_dir) in zooms {
        for (_, x_dir) in numeric_entries(&zoom_dir).await? {
            let mut files = tokio::fs::read_dir(&x_dir).await?;
            while let Some(entry) = files.next_entry().await? {
                let path = entry.path();
                let known = path
                    .extension()
                    .and_then(|e| e.to_str())
                    .is_some_and(|e| TILE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()));
                if known {
                    return Ok(Some(path));
                }
            }
        }
    }
    Ok(None)
}

async fn numeric_entries(dir: &Path) -> std::io::Result<Vec<(u32, PathBuf)>> {
    let mut result = Vec::new();
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        if let Some(n) = entry.file_name().to_str().and_then(|s| s.parse::<u32>().ok()) {
            result.push((n, entry.path()));
        }
    }
    Ok(result)
}

async fn read_file(url: &str, path: &Path) -> Result<Vec<u8>, RasterError> {
    tokio::fs::read(path).await.map_err(|source| RasterError::Io {
        url: url.to_string(),
        source,
    })
}

fn decode(url: &str, bytes: &[u8]) -> Result<DynamicImage, RasterError> {
    image::load_from_memory(bytes).map_err(|e| RasterError::Format {
        url: url.to_string(),
        reason: e.to_string(),
    })
}

fn color_bands(image: &DynamicImage) -> usize {
    let color = image.color();
    usize::from(color.channel_count()) - usize::from(color.has_alpha())
}

#[cfg(test)]
pub(crate) mod tests {
    use image::{Rgb, RgbImage, Rgba, RgbaImage};

    use super::*;

    /// Writes an image at `<root>/<z>/<x>/<y>.png`.
    pub(crate) fn write_tile(root: &Path, coord: TileCoord, image: &DynamicImage) {
        let dir = root.join(coord.z().to_string()).join(coord.x().to_string());
        std::fs::create_dir_all(&dir).unwrap();
        image.save(dir.join(format!("{}.png", coord.y()))).unwrap();
    }

    fn coord() -> TileCoord {
        TileCoord::new(3, 4, 2).unwrap()
    }

    #[tokio::test]
    async fn open_missing_directory() {
        let err = TileDirSource.open("/definitely/not/here").await.unwrap_err();
        assert!(matches!(err, RasterError::NotFound(_)));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn open_empty_directory_is_format_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = TileDirSource
            .open(dir.path().to_str().unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, RasterError::Format { .. }));
    }

    #[tokio::test]
    async fn rgb_pyramid_reads_bands() {
        let dir = tempfile::tempdir().unwrap();
        let image = RgbImage::from_pixel(8, 8, Rgb([10, 20, 30]));
        write_tile(dir.path(), coord(), &DynamicImage::ImageRgb8(image));

        let url = format!("file://{}", dir.path().display());
        let handle = TileDirSource.open(&url).await.unwrap();
        assert_eq!(handle.band_count(), 3);

        // Stored at 8 px, read back at 16 px
        let window = handle.read_tile(coord(), &[1, 2, 3], 16).await.unwrap();
        assert_eq!(window.width, 16);
        assert!(window.valid.iter().all(|v| *v));
        assert_eq!(window.pixel(5, 5), &[10, 20, 30]);

        let window = handle.read_tile(coord(), &[3], 16).await.unwrap();
        assert_eq!(window.pixel(0, 0), &[30]);
    }

    #[tokio::test]
    async fn alpha_becomes_validity_and_missing_tiles_are_empty() {
        let dir = tempfile::tempdir().unwrap();
        let mut image = RgbaImage::from_pixel(4, 4, Rgba([1, 2, 3, 255]));
        image.put_pixel(0, 0, Rgba([0, 0, 0, 0]));
        write_tile(dir.path(), coord(), &DynamicImage::ImageRgba8(image));

        let handle = TileDirSource.open(dir.path().to_str().unwrap()).await.unwrap();
        assert_eq!(handle.band_count(), 3);
        let window = handle.read_tile(coord(), &[1, 2, 3], 4).await.unwrap();
        assert!(!window.is_valid(0, 0));
        assert!(window.is_valid(1, 0));

        let other = TileCoord::new(3, 5, 2).unwrap();
        let window = handle.read_tile(other, &[1, 2, 3], 4).await.unwrap();
        assert!(!window.has_valid_pixels());

        let err = handle.read_tile(coord(), &[4], 4).await.unwrap_err();
        assert!(matches!(err, RasterError::Format { .. }));
    }
}
