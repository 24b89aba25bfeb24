//! Drives a whole run: select tiles per zoom, render them concurrently, archive the results.

use std::fmt::{Display, Formatter};
use std::pin::pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::cache::CacheStats;
use crate::coverage::{CoverageRenderer, DEFAULT_COVERAGE_COLOR, DEFAULT_TILE_SIZE, MAX_TILE_SIZE};
use crate::encode::TileFormat;
use crate::engine::{BandRenderer, Engine};
use crate::fetch::{
    DEFAULT_HTTP_TIMEOUT, DEFAULT_RETRIES, DEFAULT_RETRY_DELAY, FetchStats, RetryPolicy,
    UrlTemplate,
};
use crate::footprint::{Footprint, FootprintSet};
use crate::mosaic::MosaicConfig;
use crate::render::{ImageryStrategy, RenderOrigin, RenderPolicy, RenderResult, RenderStrategy, TileRenderer};
use crate::select::TileSelector;
use crate::writer::{ArchiveHeader, ArchiveMetadata, ArchiveSink};
use crate::{BoundingBox, Compression, MosaicError, MosaicResult, SpatialIndex};

/// OpenAerialMap.
pub const DEFAULT_COLLECTION: &str = "openaerialmap";
/// 16 threads times a batch factor of 5.
pub const DEFAULT_CONCURRENCY: usize = 80;
/// Tiles between progress lines.
pub const DEFAULT_LOG_EVERY: u64 = 500;

/// Remote tile service settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchConfig {
    /// Where tiles are fetched from.
    pub template: UrlTemplate,
    /// Per request.
    pub timeout: Duration,
    /// Retries after a failed request.
    pub retries: u32,
    /// Backoff unit between retries.
    pub retry_delay: Duration,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            template: UrlTemplate::default(),
            timeout: DEFAULT_HTTP_TIMEOUT,
            retries: DEFAULT_RETRIES,
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }
}

impl FetchConfig {
    /// Retry settings shared by fetches and raster reads.
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            retries: self.retries,
            base_delay: self.retry_delay,
        }
    }
}

/// Everything a run needs besides its footprints and collaborators.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    /// Collection name, used in tile URLs and archive metadata.
    pub collection: String,
    /// Area to render.
    pub bbox: BoundingBox,
    /// Zoom bands and their strategies.
    pub policy: RenderPolicy,
    /// Maximum number of tiles rendered at once.
    pub concurrency: usize,
    /// Tile edge in pixels, at most [`MAX_TILE_SIZE`].
    pub tile_size: u32,
    /// Encoding of every tile, coverage and imagery alike.
    pub format: TileFormat,
    /// RGBA fill of covered pixels.
    pub coverage_color: [u8; 4],
    /// Progress is logged every this many tiles.
    pub log_every: u64,
    /// Remote fetch settings.
    pub fetch: FetchConfig,
    /// Direct mosaic settings.
    pub mosaic: MosaicConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            collection: DEFAULT_COLLECTION.to_string(),
            bbox: BoundingBox::WORLD,
            policy: RenderPolicy::default(),
            concurrency: DEFAULT_CONCURRENCY,
            tile_size: DEFAULT_TILE_SIZE,
            format: TileFormat::default(),
            coverage_color: DEFAULT_COVERAGE_COLOR,
            log_every: DEFAULT_LOG_EVERY,
            fetch: FetchConfig::default(),
            mosaic: MosaicConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Rejects settings that would fail or misbehave mid-run.
    pub fn validate(&self) -> MosaicResult<()> {
        if self.collection.is_empty() {
            return Err(MosaicError::Config("collection name is empty".into()));
        }
        if self.concurrency == 0 {
            return Err(MosaicError::Config("concurrency must be positive".into()));
        }
        if !(1..=MAX_TILE_SIZE).contains(&self.tile_size) {
            return Err(MosaicError::Config(format!(
                "tile size {} not in 1..={MAX_TILE_SIZE}",
                self.tile_size
            )));
        }
        if self.log_every == 0 {
            return Err(MosaicError::Config("progress interval must be positive".into()));
        }
        self.bbox.validate()?;
        // Re-check bands in case the policy was assembled by hand
        RenderPolicy::new(self.policy.bands().to_vec())?;
        if self.policy.uses(RenderStrategy::DirectMosaic) {
            self.mosaic.validate()?;
        }
        Ok(())
    }

    /// Human readable summary of the zoom bands, stored in the archive metadata.
    #[must_use]
    pub fn description(&self) -> String {
        let bands: Vec<_> = self
            .policy
            .bands()
            .iter()
            .map(|b| {
                let label = match b.strategy {
                    RenderStrategy::Coverage => "coverage",
                    RenderStrategy::RemoteFetch | RenderStrategy::DirectMosaic => "tiles",
                };
                format!("{label} z{}-{}", b.min_zoom, b.max_zoom)
            })
            .collect();
        format!("Global mosaic ({}) from {}", bands.join("; "), self.collection)
    }
}

/// Totals of a finished run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunSummary {
    /// Tiles selected across all zooms.
    pub total: u64,
    /// Render results received.
    pub processed: u64,
    /// Tiles written to the sink.
    pub written: u64,
    /// Results without data.
    pub skipped: u64,
    /// Tiles with imagery.
    pub imagery: u64,
    /// Imagery tiles replaced by coverage.
    pub fallbacks: u64,
    /// Wall time of the run.
    pub elapsed: Duration,
    /// Most renders that ran at once.
    pub peak_in_flight: usize,
    /// Submission stopped early. The archive is incomplete.
    pub cancelled: bool,
    /// Present when direct mosaicking was configured.
    pub cache: Option<CacheStats>,
    /// Present when remote fetching was configured.
    pub fetch: Option<FetchStats>,
}

impl Display for RunSummary {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "Processed {}/{} tiles in {:.1}s{}",
            self.processed,
            self.total,
            self.elapsed.as_secs_f64(),
            if self.cancelled { " (cancelled)" } else { "" }
        )?;
        writeln!(
            f,
            "  written: {}, skipped: {}, imagery: {}, coverage fallbacks: {}",
            self.written, self.skipped, self.imagery, self.fallbacks
        )?;
        write!(f, "  peak in-flight renders: {}", self.peak_in_flight)?;
        if let Some(fetch) = &self.fetch {
            write!(
                f,
                "\n  fetch: {} requests, {} retries, {} not found, {} failed",
                fetch.requests, fetch.retries, fetch.not_found, fetch.failures
            )?;
        }
        if let Some(cache) = &self.cache {
            write!(
                f,
                "\n  cache: {} hits, {} misses, {} inspections, {} known sources, {} failed sources",
                cache.hits, cache.misses, cache.inspections, cache.known_sources, cache.failed_sources
            )?;
        }
        Ok(())
    }
}

struct Progress {
    summary: RunSummary,
    started: Instant,
    log_every: u64,
}

impl Progress {
    fn new(total: u64, log_every: u64) -> Self {
        Self {
            summary: RunSummary {
                total,
                ..RunSummary::default()
            },
            started: Instant::now(),
            log_every,
        }
    }

    fn record(&mut self, result: &RenderResult) {
        let s = &mut self.summary;
        s.processed += 1;
        if result.data.is_some() {
            s.written += 1;
        } else {
            s.skipped += 1;
        }
        match result.origin {
            RenderOrigin::Imagery => s.imagery += 1,
            RenderOrigin::Fallback => s.fallbacks += 1,
            RenderOrigin::Coverage => {}
        }
        if s.processed % self.log_every == 0 {
            self.log();
        }
    }

    #[expect(clippy::cast_precision_loss)]
    fn log(&self) {
        let s = &self.summary;
        let elapsed = self.started.elapsed();
        let percent = if s.total == 0 {
            100.0
        } else {
            s.processed as f64 * 100.0 / s.total as f64
        };
        let eta = if s.processed == 0 {
            Duration::ZERO
        } else {
            elapsed.mul_f64(s.total.saturating_sub(s.processed) as f64 / s.processed as f64)
        };
        log::info!(
            "Progress: {}/{} ({percent:.1}%), written {}, skipped {}, elapsed {:.0}s, ETA {:.0}s",
            s.processed,
            s.total,
            s.written,
            s.skipped,
            elapsed.as_secs_f64(),
            eta.as_secs_f64()
        );
    }

    fn finish(mut self) -> RunSummary {
        self.summary.elapsed = self.started.elapsed();
        self.summary
    }
}

/// One mosaic generation run.
///
/// Zoom bands are rendered in increasing zoom order, each zoom streamed through the
/// [`Engine`] into the sink. The sink is finalized exactly once, also after cancellation.
pub struct Pipeline {
    config: PipelineConfig,
    footprints: Arc<FootprintSet>,
    index: SpatialIndex,
    renderer: TileRenderer,
    cancel: CancellationToken,
}

impl Pipeline {
    /// Validates the configuration and indexes the footprints.
    pub fn new(config: PipelineConfig, footprints: Vec<Footprint>) -> MosaicResult<Self> {
        config.validate()?;
        if footprints.is_empty() {
            return Err(MosaicError::NoFootprints(config.collection.clone()));
        }
        let footprints = Arc::new(FootprintSet::new(footprints));
        let index = SpatialIndex::build(footprints.geometries());
        log::info!("Indexed {} footprints", index.len());

        let coverage = CoverageRenderer::new(config.tile_size, config.coverage_color, config.format);
        let renderer = TileRenderer::new(coverage, Arc::clone(&footprints));
        Ok(Self {
            config,
            footprints,
            index,
            renderer,
            cancel: CancellationToken::new(),
        })
    }

    /// Registers the imagery strategy used by bands of `kind`.
    #[must_use]
    pub fn with_strategy(mut self, kind: RenderStrategy, strategy: Arc<dyn ImageryStrategy>) -> Self {
        self.renderer = self.renderer.with_strategy(kind, strategy);
        self
    }

    /// Stops job submission once `cancel` fires. In-flight tiles still finish.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Validated settings of the run.
    #[must_use]
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// The loaded footprints, shareable with imagery strategies.
    #[must_use]
    pub fn footprints(&self) -> &Arc<FootprintSet> {
        &self.footprints
    }

    /// Number of selected tiles for every zoom of the policy.
    pub fn count_tiles(&self) -> MosaicResult<Vec<(u8, u64)>> {
        let mut counts = Vec::new();
        for band in self.config.policy.bands() {
            for zoom in band.zooms() {
                let n = TileSelector::new(&self.index, &self.config.bbox, zoom)?.count();
                counts.push((zoom, n as u64));
            }
        }
        Ok(counts)
    }

    /// Header fields for the configured tile format.
    #[must_use]
    pub fn archive_header(&self) -> ArchiveHeader {
        ArchiveHeader {
            tile_type: self.config.format.tile_type(),
            tile_compression: Compression::None,
        }
    }

    /// Name, description, bounds and zoom range of the archive.
    #[must_use]
    pub fn archive_metadata(&self) -> ArchiveMetadata {
        ArchiveMetadata {
            name: self.config.collection.clone(),
            description: self.config.description(),
            bounds: self.config.bbox,
            min_zoom: self.config.policy.min_zoom(),
            max_zoom: self.config.policy.max_zoom(),
        }
    }

    /// Renders every selected tile into `sink` and finalizes it.
    pub async fn run<S: ArchiveSink>(self, mut sink: S) -> MosaicResult<RunSummary> {
        for band in self.config.policy.bands() {
            if !self.renderer.supports(band.strategy) {
                return Err(MosaicError::Config(format!(
                    "zooms {}-{} use the {} strategy, which is not configured",
                    band.min_zoom, band.max_zoom, band.strategy
                )));
            }
        }

        let counts = self.count_tiles()?;
        let total: u64 = counts.iter().map(|(_, n)| n).sum();
        for (zoom, n) in &counts {
            log::info!("Zoom {zoom}: {n} tiles");
        }
        log::info!(
            "Rendering {total} tiles of {} with concurrency {}",
            self.config.collection,
            self.config.concurrency
        );

        let header = self.archive_header();
        let metadata = self.archive_metadata();
        let renderer = Arc::new(self.renderer);
        let engine = Engine::new(self.config.concurrency);
        let mut progress = Progress::new(total, self.config.log_every);

        'bands: for band in self.config.policy.bands() {
            let band_renderer = Arc::new(BandRenderer::new(Arc::clone(&renderer), band.strategy));
            for zoom in band.zooms() {
                if self.cancel.is_cancelled() {
                    break 'bands;
                }
                log::info!("Rendering zoom {zoom} with {}", band.strategy);
                let cancel = self.cancel.clone();
                let jobs = TileSelector::new(&self.index, &self.config.bbox, zoom)?
                    .take_while(move |_| !cancel.is_cancelled());
                let mut results = pin!(engine.run(Arc::clone(&band_renderer), jobs));
                while let Some(result) = results.next().await {
                    if let Some(data) = &result.data {
                        sink.write(result.tile_id, data)?;
                    }
                    progress.record(&result);
                }
                progress.log();
            }
        }

        let cancelled = self.cancel.is_cancelled();
        if cancelled {
            log::warn!("Run cancelled, finalizing the tiles written so far");
        }
        sink.finalize(header, metadata)?;

        let mut summary = progress.finish();
        summary.cancelled = cancelled;
        summary.peak_in_flight = engine.stats().peak();
        summary.cache = renderer.cache_stats();
        summary.fetch = renderer.fetch_stats();
        log::info!("{summary}");
        Ok(summary)
    }
}
