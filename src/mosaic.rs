//! Direct-mosaic imagery strategy: composite tiles from the footprints' own rasters.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use image::{Rgba, RgbaImage};
use tokio_util::sync::CancellationToken;

use crate::cache::{CacheStats, RenderCache};
use crate::encode::{TileFormat, encode_rgba};
use crate::fetch::RetryPolicy;
use crate::footprint::FootprintSet;
use crate::raster::{PixelWindow, RasterHandle, RasterSource};
use crate::render::ImageryStrategy;
use crate::select::TileJob;
use crate::{MosaicError, MosaicResult};

/// Sources composited into one tile unless configured otherwise.
pub const DEFAULT_MAX_SOURCES: usize = 5;
/// RGB.
pub const DEFAULT_EXPECTED_BANDS: usize = 3;

/// Which rasters take part in a mosaic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MosaicConfig {
    /// Upper bound of usable sources composited into one tile.
    pub max_sources: usize,
    /// Sources with any other band count are ignored.
    pub expected_bands: usize,
}

impl Default for MosaicConfig {
    fn default() -> Self {
        Self {
            max_sources: DEFAULT_MAX_SOURCES,
            expected_bands: DEFAULT_EXPECTED_BANDS,
        }
    }
}

impl MosaicConfig {
    /// Rejects a zero source limit and band counts an RGBA tile cannot hold.
    pub fn validate(&self) -> MosaicResult<()> {
        if self.max_sources == 0 {
            return Err(MosaicError::Config("max sources per tile must be positive".into()));
        }
        if !(1..=4).contains(&self.expected_bands) {
            return Err(MosaicError::Config(format!(
                "expected band count {} not in 1..=4",
                self.expected_bands
            )));
        }
        Ok(())
    }
}

/// Reads each candidate's raster for the tile and keeps the highest-priority valid pixel.
///
/// Newer footprints win over older ones. Sources that fail to open or read are
/// remembered in the [`RenderCache`] and never touched again during the run.
pub struct DirectMosaic<S: RasterSource> {
    source: S,
    footprints: Arc<FootprintSet>,
    cache: Arc<RenderCache<S::Handle>>,
    config: MosaicConfig,
    tile_size: u32,
    format: TileFormat,
    policy: RetryPolicy,
    cancel: CancellationToken,
}

impl<S: RasterSource> DirectMosaic<S> {
    /// Mosaics `tile_size` tiles from `source`. Retries are off until [`Self::with_retry`].
    #[must_use]
    pub fn new(
        source: S,
        footprints: Arc<FootprintSet>,
        cache: Arc<RenderCache<S::Handle>>,
        config: MosaicConfig,
        tile_size: u32,
        format: TileFormat,
    ) -> Self {
        Self {
            source,
            footprints,
            cache,
            config,
            tile_size,
            format,
            policy: RetryPolicy::default(),
            cancel: CancellationToken::new(),
        }
    }

    /// Retry policy for transient open and read failures, interrupted by `cancel`.
    #[must_use]
    pub fn with_retry(mut self, policy: RetryPolicy, cancel: CancellationToken) -> Self {
        self.policy = policy;
        self.cancel = cancel;
        self
    }

    /// Band counts, failures and open readers seen so far.
    #[must_use]
    pub fn cache(&self) -> &RenderCache<S::Handle> {
        &self.cache
    }

    /// Source URLs of the candidates, newest first. Ties keep catalog order.
    fn prioritized<'a>(&'a self, candidates: &[usize]) -> Vec<&'a str> {
        let mut ranked: Vec<_> = candidates
            .iter()
            .filter_map(|&i| self.footprints.get(i))
            .filter(|f| f.source.is_some())
            .collect();
        // None sorts before Some, so descending order puts undated footprints last
        ranked.sort_by(|a, b| b.datetime.cmp(&a.datetime));

        let mut seen = HashSet::new();
        ranked
            .into_iter()
            .filter_map(|f| f.source.as_deref())
            .filter(|url| seen.insert(*url))
            .collect()
    }

    async fn usable_sources<'u>(&self, urls: &[&'u str]) -> Vec<(&'u str, Arc<S::Handle>)> {
        let mut usable = Vec::new();
        for &url in urls {
            if usable.len() >= self.config.max_sources {
                break;
            }
            if self.cache.is_failed(url) {
                continue;
            }
            let handle = match self.cache.band_count(url) {
                Some(bands) if bands != self.config.expected_bands => continue,
                Some(_) => match self.cache.reader(url).await {
                    Some(handle) => Some(handle),
                    None => self.open(url).await,
                },
                None => {
                    let Some(handle) = self.open(url).await else {
                        continue;
                    };
                    let bands = handle.band_count();
                    self.cache.record_band_count(url, bands);
                    if bands != self.config.expected_bands {
                        log::debug!(
                            "Ignoring {url}: {bands} band(s), expected {}",
                            self.config.expected_bands
                        );
                        self.cache.invalidate_reader(url).await;
                        continue;
                    }
                    Some(handle)
                }
            };
            if let Some(handle) = handle {
                usable.push((url, handle));
            }
        }
        usable
    }

    /// Opens `url`, retrying I/O failures. Any other failure marks it failed at once.
    async fn open(&self, url: &str) -> Option<Arc<S::Handle>> {
        let attempts = self.policy.attempts();
        for attempt in 0..attempts {
            if attempt > 0 && !self.policy.wait(attempt, &self.cancel).await {
                return None;
            }
            match self.source.open(url).await {
                Ok(handle) => {
                    let handle = Arc::new(handle);
                    self.cache.insert_reader(url, Arc::clone(&handle)).await;
                    return Some(handle);
                }
                Err(e) if e.is_transient() => {
                    log::warn!("Opening {url} failed (attempt {}/{attempts}): {e}", attempt + 1);
                }
                Err(e) => {
                    log::warn!("Cannot use {url}: {e}");
                    break;
                }
            }
        }
        self.cache.mark_failed(url);
        None
    }

    async fn read_windows(&self, job: &TileJob, sources: Vec<(&str, Arc<S::Handle>)>) -> Vec<PixelWindow> {
        let bands: Vec<usize> = (1..=self.config.expected_bands).collect();
        let mut windows = Vec::with_capacity(sources.len());
        for (url, handle) in sources {
            match self.read_window(url, &handle, job, &bands).await {
                Some(window) => {
                    if window.has_valid_pixels() {
                        windows.push(window);
                    }
                }
                None => {
                    self.cache.mark_failed(url);
                    self.cache.invalidate_reader(url).await;
                }
            }
        }
        windows
    }

    /// Reads the tile window of `url`, retrying I/O failures like [`Self::open`].
    async fn read_window(
        &self,
        url: &str,
        handle: &S::Handle,
        job: &TileJob,
        bands: &[usize],
    ) -> Option<PixelWindow> {
        let attempts = self.policy.attempts();
        for attempt in 0..attempts {
            if attempt > 0 && !self.policy.wait(attempt, &self.cancel).await {
                return None;
            }
            match handle.read_tile(job.coord, bands, self.tile_size).await {
                Ok(window) if window.width == self.tile_size && window.height == self.tile_size => {
                    return Some(window);
                }
                Ok(window) => {
                    log::warn!(
                        "Reading {url} for {} failed: window is {}x{}",
                        job.coord,
                        window.width,
                        window.height
                    );
                    return None;
                }
                Err(e) if e.is_transient() => {
                    log::warn!(
                        "Reading {url} for {} failed (attempt {}/{attempts}): {e}",
                        job.coord,
                        attempt + 1
                    );
                }
                Err(e) => {
                    log::warn!("Reading {url} for {} failed: {e}", job.coord);
                    return None;
                }
            }
        }
        None
    }

    /// The first valid pixel of `windows`, in order, wins.
    fn composite(&self, windows: &[PixelWindow]) -> Option<RgbaImage> {
        if windows.is_empty() {
            return None;
        }
        let mut image = RgbaImage::new(self.tile_size, self.tile_size);
        let mut any = false;
        for (x, y, pixel) in image.enumerate_pixels_mut() {
            if let Some(window) = windows.iter().find(|w| w.is_valid(x, y)) {
                *pixel = opaque(window.pixel(x, y));
                any = true;
            }
        }
        any.then_some(image)
    }
}

fn opaque(bands: &[u8]) -> Rgba<u8> {
    match *bands {
        [r, g, b, ..] => Rgba([r, g, b, 255]),
        [grey, ..] => Rgba([grey, grey, grey, 255]),
        [] => Rgba([0, 0, 0, 0]),
    }
}

#[async_trait]
impl<S: RasterSource> ImageryStrategy for DirectMosaic<S> {
    async fn render(&self, job: &TileJob) -> MosaicResult<Option<Bytes>> {
        let urls = self.prioritized(&job.candidates);
        if urls.is_empty() {
            return Ok(None);
        }
        let sources = self.usable_sources(&urls).await;
        if sources.is_empty() {
            log::debug!("No usable sources for {}", job.coord);
            return Ok(None);
        }
        let windows = self.read_windows(job, sources).await;
        match self.composite(&windows) {
            Some(image) => encode_rgba(&image, self.format).map(Some),
            None => Ok(None),
        }
    }

    fn cache_stats(&self) -> Option<CacheStats> {
        Some(self.cache.stats())
    }
}
