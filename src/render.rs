//! Per-zoom render strategies and the coverage fallback contract.

use std::collections::HashMap;
use std::fmt::{Display, Formatter};
use std::ops::RangeInclusive;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::cache::CacheStats;
use crate::coverage::CoverageRenderer;
use crate::fetch::FetchStats;
use crate::footprint::FootprintSet;
use crate::select::TileJob;
use crate::tile::MAX_ZOOM;
use crate::{MosaicError, MosaicResult, TileCoord, TileId};

/// A way to produce imagery for a tile.
///
/// `Ok(Some)` is imagery, `Ok(None)` means there is no imagery for the tile, and
/// `Err` is a failure. Both of the latter degrade to coverage in [`TileRenderer`].
#[async_trait]
pub trait ImageryStrategy: Send + Sync {
    /// Imagery for `job`, encoded in the configured tile format.
    async fn render(&self, job: &TileJob) -> MosaicResult<Option<Bytes>>;

    /// Remote fetch counters, if the strategy fetches.
    fn fetch_stats(&self) -> Option<FetchStats> {
        None
    }

    /// Render cache counters, if the strategy keeps one.
    fn cache_stats(&self) -> Option<CacheStats> {
        None
    }
}

/// How the tiles of a zoom band are rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RenderStrategy {
    /// Coverage mask only.
    Coverage,
    /// Tiles downloaded from a tile service.
    RemoteFetch,
    /// Tiles composited from the footprints' rasters.
    DirectMosaic,
}

impl Display for RenderStrategy {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            RenderStrategy::Coverage => "coverage",
            RenderStrategy::RemoteFetch => "fetch",
            RenderStrategy::DirectMosaic => "mosaic",
        })
    }
}

impl FromStr for RenderStrategy {
    type Err = MosaicError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "coverage" => Ok(RenderStrategy::Coverage),
            "fetch" | "remote-fetch" => Ok(RenderStrategy::RemoteFetch),
            "mosaic" | "direct-mosaic" => Ok(RenderStrategy::DirectMosaic),
            other => Err(MosaicError::Config(format!("unknown render strategy {other}"))),
        }
    }
}

/// A contiguous, inclusive zoom range rendered with one strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ZoomBand {
    /// Lowest zoom of the band.
    pub min_zoom: u8,
    /// Highest zoom of the band.
    pub max_zoom: u8,
    /// How tiles of the band are rendered.
    pub strategy: RenderStrategy,
}

impl ZoomBand {
    /// Band from `min_zoom` to `max_zoom`, both included.
    #[must_use]
    pub fn new(min_zoom: u8, max_zoom: u8, strategy: RenderStrategy) -> Self {
        Self {
            min_zoom,
            max_zoom,
            strategy,
        }
    }

    /// Zooms covered by the band.
    #[must_use]
    pub fn zooms(&self) -> RangeInclusive<u8> {
        self.min_zoom..=self.max_zoom
    }
}

/// Maps zoom bands to render strategies.
///
/// Bands are sorted by zoom, non-empty and never overlap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderPolicy {
    bands: Vec<ZoomBand>,
}

impl Default for RenderPolicy {
    /// Coverage for zooms 0 to 10, remote-fetched imagery for 11 to 14.
    fn default() -> Self {
        Self {
            bands: vec![
                ZoomBand::new(0, 10, RenderStrategy::Coverage),
                ZoomBand::new(11, 14, RenderStrategy::RemoteFetch),
            ],
        }
    }
}

impl RenderPolicy {
    /// Fails on empty, inverted or overlapping bands, or zooms past [`MAX_ZOOM`](crate::MAX_ZOOM).
    pub fn new(mut bands: Vec<ZoomBand>) -> MosaicResult<Self> {
        if bands.is_empty() {
            return Err(MosaicError::Config("render policy has no zoom bands".into()));
        }
        bands.sort_by_key(|b| b.min_zoom);
        for band in &bands {
            if band.min_zoom > band.max_zoom {
                return Err(MosaicError::Config(format!(
                    "zoom band {}-{} is empty",
                    band.min_zoom, band.max_zoom
                )));
            }
            if band.max_zoom > MAX_ZOOM {
                return Err(MosaicError::Config(format!(
                    "zoom {} exceeds the maximum of {MAX_ZOOM}",
                    band.max_zoom
                )));
            }
        }
        for pair in bands.windows(2) {
            if pair[1].min_zoom <= pair[0].max_zoom {
                return Err(MosaicError::Config(format!(
                    "zoom bands {}-{} and {}-{} overlap",
                    pair[0].min_zoom, pair[0].max_zoom, pair[1].min_zoom, pair[1].max_zoom
                )));
            }
        }
        Ok(Self { bands })
    }

    /// Coverage below `split_zoom`, `imagery` from `split_zoom` up.
    ///
    /// Either band is left out when the split falls outside `min_zoom..=max_zoom`.
    pub fn hybrid(
        min_zoom: u8,
        split_zoom: u8,
        max_zoom: u8,
        imagery: RenderStrategy,
    ) -> MosaicResult<Self> {
        if min_zoom > max_zoom {
            return Err(MosaicError::Config(format!(
                "min zoom {min_zoom} is above max zoom {max_zoom}"
            )));
        }
        let mut bands = Vec::with_capacity(2);
        if split_zoom > min_zoom {
            bands.push(ZoomBand::new(
                min_zoom,
                (split_zoom - 1).min(max_zoom),
                RenderStrategy::Coverage,
            ));
        }
        if split_zoom <= max_zoom {
            bands.push(ZoomBand::new(split_zoom.max(min_zoom), max_zoom, imagery));
        }
        Self::new(bands)
    }

    /// Bands sorted by zoom.
    #[must_use]
    pub fn bands(&self) -> &[ZoomBand] {
        &self.bands
    }

    /// Lowest zoom of any band.
    #[must_use]
    pub fn min_zoom(&self) -> u8 {
        self.bands.first().map_or(0, |b| b.min_zoom)
    }

    /// Highest zoom of any band.
    #[must_use]
    pub fn max_zoom(&self) -> u8 {
        self.bands.last().map_or(0, |b| b.max_zoom)
    }

    /// `None` outside every band.
    #[must_use]
    pub fn strategy_for(&self, zoom: u8) -> Option<RenderStrategy> {
        self.bands
            .iter()
            .find(|b| b.zooms().contains(&zoom))
            .map(|b| b.strategy)
    }

    /// Whether any band renders with `strategy`.
    #[must_use]
    pub fn uses(&self, strategy: RenderStrategy) -> bool {
        self.bands.iter().any(|b| b.strategy == strategy)
    }
}

/// Where the bytes of a [`RenderResult`] came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RenderOrigin {
    /// Coverage band.
    Coverage,
    /// Imagery returned by a strategy.
    Imagery,
    /// Coverage rendered because imagery was absent or failed.
    Fallback,
}

/// Outcome of rendering one tile. `data == None` means nothing is written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderResult {
    /// Rendered tile.
    pub coord: TileCoord,
    /// Hilbert id of `coord`.
    pub tile_id: TileId,
    /// Encoded tile.
    pub data: Option<Bytes>,
    /// Where `data` came from.
    pub origin: RenderOrigin,
}

impl RenderResult {
    /// Result for `coord`, deriving its tile id.
    #[must_use]
    pub fn new(coord: TileCoord, data: Option<Bytes>, origin: RenderOrigin) -> Self {
        Self {
            coord,
            tile_id: coord.into(),
            data,
            origin,
        }
    }

    /// Nothing to write.
    #[must_use]
    pub fn is_skip(&self) -> bool {
        self.data.is_none()
    }
}

/// Renders jobs with the strategy of their zoom band, degrading to coverage.
pub struct TileRenderer {
    coverage: CoverageRenderer,
    footprints: Arc<FootprintSet>,
    strategies: HashMap<RenderStrategy, Arc<dyn ImageryStrategy>>,
}

impl TileRenderer {
    /// Renders coverage only until strategies are registered.
    #[must_use]
    pub fn new(coverage: CoverageRenderer, footprints: Arc<FootprintSet>) -> Self {
        Self {
            coverage,
            footprints,
            strategies: HashMap::new(),
        }
    }

    /// Registers the implementation used for `kind`.
    #[must_use]
    pub fn with_strategy(mut self, kind: RenderStrategy, strategy: Arc<dyn ImageryStrategy>) -> Self {
        self.strategies.insert(kind, strategy);
        self
    }

    /// Coverage is always available; other strategies only once registered.
    #[must_use]
    pub fn supports(&self, kind: RenderStrategy) -> bool {
        kind == RenderStrategy::Coverage || self.strategies.contains_key(&kind)
    }

    /// Counters of the registered remote fetch strategy.
    #[must_use]
    pub fn fetch_stats(&self) -> Option<FetchStats> {
        self.strategies.values().find_map(|s| s.fetch_stats())
    }

    /// Counters of the registered direct mosaic strategy.
    #[must_use]
    pub fn cache_stats(&self) -> Option<CacheStats> {
        self.strategies.values().find_map(|s| s.cache_stats())
    }

    /// Renders `job`. Never drops it: every failure becomes coverage or an explicit skip.
    pub async fn render(&self, job: &TileJob, kind: RenderStrategy) -> RenderResult {
        if kind == RenderStrategy::Coverage {
            return self.render_coverage(job, RenderOrigin::Coverage);
        }
        let Some(strategy) = self.strategies.get(&kind) else {
            log::warn!("No {kind} strategy registered, rendering coverage for {}", job.coord);
            return self.render_coverage(job, RenderOrigin::Fallback);
        };
        match strategy.render(job).await {
            Ok(Some(data)) => RenderResult::new(job.coord, Some(data), RenderOrigin::Imagery),
            Ok(None) => {
                log::debug!("No imagery for {}, using coverage", job.coord);
                self.render_coverage(job, RenderOrigin::Fallback)
            }
            Err(e) => {
                log::warn!("Imagery for {} failed, using coverage: {e}", job.coord);
                self.render_coverage(job, RenderOrigin::Fallback)
            }
        }
    }

    /// Coverage of the job's candidates. An encoding failure is logged and skipped.
    #[must_use]
    pub fn render_coverage(&self, job: &TileJob, origin: RenderOrigin) -> RenderResult {
        let geometries = self.footprints.candidate_geometries(&job.candidates);
        match self.coverage.render(job.coord, geometries) {
            Ok(data) => RenderResult::new(job.coord, data, origin),
            Err(e) => {
                log::error!("Coverage for {} failed, skipping tile: {e}", job.coord);
                RenderResult::new(job.coord, None, origin)
            }
        }
    }
}
