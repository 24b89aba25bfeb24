//! Coverage masks: flat translucent tiles showing where footprints exist.
//!
//! Rasterization uses "all touched" semantics. A pixel is covered when the footprint
//! intersects the pixel square, computed as the union of an even-odd fill sampled at
//! pixel centres and a grid traversal of every boundary segment. Tiny footprints stay
//! visible at coarse zooms this way.

use std::borrow::Cow;
use std::panic::catch_unwind;

use bytes::Bytes;
use geo::{BooleanOps, BoundingRect, Coord, LineString, MultiPolygon, Polygon, Rect, Simplify};
use image::{Rgba, RgbaImage};

use crate::encode::{TileFormat, encode_rgba};
use crate::{MosaicResult, TileCoord};

/// Default tile edge length in pixels.
pub const DEFAULT_TILE_SIZE: u32 = 256;

/// Largest accepted tile edge length in pixels.
pub const MAX_TILE_SIZE: u32 = 4096;

/// Grey at 40% opacity.
pub const DEFAULT_COVERAGE_COLOR: [u8; 4] = [128, 128, 128, 102];

/// Renders coverage tiles. Pure: holds configuration only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoverageRenderer {
    tile_size: u32,
    color: [u8; 4],
    format: TileFormat,
}

impl Default for CoverageRenderer {
    fn default() -> Self {
        Self::new(DEFAULT_TILE_SIZE, DEFAULT_COVERAGE_COLOR, TileFormat::Png)
    }
}

impl CoverageRenderer {
    /// Renders `tile_size` tiles filled with `color` where covered.
    #[must_use]
    pub fn new(tile_size: u32, color: [u8; 4], format: TileFormat) -> Self {
        Self {
            tile_size,
            color,
            format,
        }
    }

    /// Tile edge length in pixels.
    #[must_use]
    pub fn tile_size(&self) -> u32 {
        self.tile_size
    }

    /// Encoding of rendered tiles.
    #[must_use]
    pub fn format(&self) -> TileFormat {
        self.format
    }

    /// Renders and encodes the coverage of `geometries` on `coord`.
    ///
    /// Returns `None` when no pixel is covered.
    pub fn render<'a, I>(&self, coord: TileCoord, geometries: I) -> MosaicResult<Option<Bytes>>
    where
        I: IntoIterator<Item = &'a MultiPolygon<f64>>,
    {
        match self.rasterize(coord, geometries) {
            Some(image) => encode_rgba(&image, self.format).map(Some),
            None => Ok(None),
        }
    }

    /// Paints covered pixels with the coverage colour, leaving the rest transparent.
    #[must_use]
    pub fn rasterize<'a, I>(&self, coord: TileCoord, geometries: I) -> Option<RgbaImage>
    where
        I: IntoIterator<Item = &'a MultiPolygon<f64>>,
    {
        let mask = self.coverage_mask(coord, geometries);
        if mask.is_empty() {
            return None;
        }
        let color = Rgba(self.color);
        Some(RgbaImage::from_fn(self.tile_size, self.tile_size, |x, y| {
            if mask.is_covered(x, y) {
                color
            } else {
                Rgba([0, 0, 0, 0])
            }
        }))
    }

    /// Computes which pixels of `coord` the geometries touch.
    #[must_use]
    pub fn coverage_mask<'a, I>(&self, coord: TileCoord, geometries: I) -> CoverageMask
    where
        I: IntoIterator<Item = &'a MultiPolygon<f64>>,
    {
        let mut mask = CoverageMask::new(self.tile_size);
        if self.tile_size == 0 {
            return mask;
        }
        let (west, south, east, north) = coord.bounds();
        let tile_rect = Rect::new(
            Coord { x: west, y: south },
            Coord { x: east, y: north },
        );
        let tile_area = MultiPolygon::new(vec![tile_rect.to_polygon()]);
        // Half a pixel, in degrees of longitude at this zoom
        let tolerance = (east - west) / f64::from(self.tile_size) / 2.0;

        for geometry in geometries {
            let Some(envelope) = geometry.bounding_rect() else {
                continue;
            };
            let (min, max) = (envelope.min(), envelope.max());
            if max.x < west || min.x > east || max.y < south || min.y > north {
                continue;
            }
            let inside = min.x >= west && max.x <= east && min.y >= south && max.y <= north;
            let refined = if inside {
                Cow::Borrowed(geometry)
            } else {
                Cow::Owned(clip(geometry, &tile_area))
            };

            for polygon in &refined.0 {
                let simplified = polygon.simplify(&tolerance);
                // Douglas-Peucker may collapse tiny rings; those keep their original outline
                let polygon = if simplified.exterior().0.len() < 4 {
                    polygon
                } else {
                    &simplified
                };
                let rings = project_rings(coord, polygon, self.tile_size);
                mask.fill_even_odd(&rings);
                for ring in &rings {
                    for pair in ring.windows(2) {
                        mask.trace_segment(pair[0], pair[1]);
                    }
                }
            }
        }
        mask
    }
}

/// Clips to the tile. Boolean ops can panic on degenerate input, in which case the
/// unclipped geometry is rasterized; pixels outside the tile are discarded anyway.
fn clip(geometry: &MultiPolygon<f64>, tile_area: &MultiPolygon<f64>) -> MultiPolygon<f64> {
    catch_unwind(|| geometry.intersection(tile_area)).unwrap_or_else(|_| {
        log::warn!("Clipping a footprint to its tile failed, using the unclipped outline");
        geometry.clone()
    })
}

fn project_rings(coord: TileCoord, polygon: &Polygon<f64>, size: u32) -> Vec<Vec<(f64, f64)>> {
    std::iter::once(polygon.exterior())
        .chain(polygon.interiors())
        .map(|ring: &LineString<f64>| {
            ring.coords()
                .map(|c| coord.project(c.x, c.y, size))
                .collect()
        })
        .collect()
}

/// Per-pixel coverage of one tile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoverageMask {
    size: u32,
    pixels: Vec<bool>,
}

impl CoverageMask {
    fn new(size: u32) -> Self {
        let n = size as usize;
        Self {
            size,
            pixels: vec![false; n * n],
        }
    }

    /// Edge length in pixels.
    #[must_use]
    pub fn size(&self) -> u32 {
        self.size
    }

    /// Whether pixel `(x, y)` is covered. Pixels outside the tile never are.
    #[must_use]
    pub fn is_covered(&self, x: u32, y: u32) -> bool {
        x < self.size
            && y < self.size
            && self.pixels[y as usize * self.size as usize + x as usize]
    }

    /// Number of covered pixels.
    #[must_use]
    pub fn covered(&self) -> usize {
        self.pixels.iter().filter(|p| **p).count()
    }

    /// No pixel is covered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        !self.pixels.iter().any(|p| *p)
    }

    fn mark(&mut self, x: i64, y: i64) {
        let size = i64::from(self.size);
        if (0..size).contains(&x) && (0..size).contains(&y) {
            #[expect(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
            let idx = (y * size + x) as usize;
            self.pixels[idx] = true;
        }
    }

    /// Scanline even-odd fill of one polygon (exterior and holes together), sampled at
    /// pixel centres.
    #[expect(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
    fn fill_even_odd(&mut self, rings: &[Vec<(f64, f64)>]) {
        let size = f64::from(self.size);
        let (min_y, max_y) = rings
            .iter()
            .flatten()
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), p| {
                (lo.min(p.1), hi.max(p.1))
            });
        if !min_y.is_finite() || !max_y.is_finite() {
            return;
        }
        let first_row = (min_y - 0.5).floor().max(0.0) as i64;
        let last_row = max_y.ceil().min(size - 1.0) as i64;

        let mut crossings = Vec::new();
        for row in first_row..=last_row {
            let y = row as f64 + 0.5;
            crossings.clear();
            for ring in rings {
                for pair in ring.windows(2) {
                    let (a, b) = (pair[0], pair[1]);
                    if (a.1 <= y) != (b.1 <= y) {
                        crossings.push(a.0 + (y - a.1) * (b.0 - a.0) / (b.1 - a.1));
                    }
                }
            }
            crossings.sort_by(f64::total_cmp);
            for span in crossings.chunks_exact(2) {
                let start = (span[0] - 0.5).ceil().max(0.0) as i64;
                let end = (span[1] - 0.5).ceil().min(size) as i64;
                for x in start..end {
                    self.mark(x, row);
                }
            }
        }
    }

    /// Marks every pixel the segment passes through.
    #[expect(clippy::cast_possible_truncation)]
    fn trace_segment(&mut self, a: (f64, f64), b: (f64, f64)) {
        let size = f64::from(self.size);
        let Some((a, b)) = clip_segment(a, b, size) else {
            return;
        };
        let cell = |v: f64| v.floor().clamp(0.0, size - 1.0) as i64;
        let (mut cx, mut cy) = (cell(a.0), cell(a.1));
        let (ex, ey) = (cell(b.0), cell(b.1));
        let (dx, dy) = (b.0 - a.0, b.1 - a.1);

        let step_x = if dx > 0.0 { 1 } else { -1 };
        let step_y = if dy > 0.0 { 1 } else { -1 };
        let delta_x = if dx == 0.0 { f64::INFINITY } else { 1.0 / dx.abs() };
        let delta_y = if dy == 0.0 { f64::INFINITY } else { 1.0 / dy.abs() };
        let mut t_x = boundary_distance(a.0, cx, dx);
        let mut t_y = boundary_distance(a.1, cy, dy);

        self.mark(cx, cy);
        let steps = (ex - cx).abs() + (ey - cy).abs();
        for _ in 0..steps {
            if t_x < t_y {
                cx += step_x;
                t_x += delta_x;
            } else {
                cy += step_y;
                t_y += delta_y;
            }
            self.mark(cx, cy);
        }
    }
}

/// Parametric distance along the segment to the next cell boundary on one axis.
#[expect(clippy::cast_precision_loss)]
fn boundary_distance(start: f64, cell: i64, delta: f64) -> f64 {
    if delta > 0.0 {
        (cell as f64 + 1.0 - start) / delta
    } else if delta < 0.0 {
        (cell as f64 - start) / delta
    } else {
        f64::INFINITY
    }
}

/// Liang-Barsky clip of a segment to `[0, size] x [0, size]`.
fn clip_segment(a: (f64, f64), b: (f64, f64), size: f64) -> Option<((f64, f64), (f64, f64))> {
    let (dx, dy) = (b.0 - a.0, b.1 - a.1);
    let mut t0 = 0.0_f64;
    let mut t1 = 1.0_f64;
    for (p, q) in [(-dx, a.0), (dx, size - a.0), (-dy, a.1), (dy, size - a.1)] {
        if p == 0.0 {
            if q < 0.0 {
                return None;
            }
            continue;
        }
        let r = q / p;
        if p < 0.0 {
            if r > t1 {
                return None;
            }
            t0 = t0.max(r);
        } else {
            if r < t0 {
                return None;
            }
            t1 = t1.min(r);
        }
    }
    Some((
        (a.0 + t0 * dx, a.1 + t0 * dy),
        (a.0 + t1 * dx, a.1 + t1 * dy),
    ))
}

#[cfg(test)]
mod tests {
    use geo::{LineString, Polygon, coord};
    use image::{ImageFormat, load_from_memory_with_format};

    use super::*;

    fn rect(w: f64, s: f64, e: f64, n: f64) -> MultiPolygon<f64> {
        let r = Rect::new(coord! { x: w, y: s }, coord! { x: e, y: n });
        MultiPolygon::new(vec![r.to_polygon()])
    }

    fn tile(z: u8, x: u32, y: u32) -> TileCoord {
        TileCoord::new(z, x, y).unwrap()
    }

    #[test]
    fn footprint_covering_tile_fills_it() {
        let renderer = CoverageRenderer::default();
        let coord = tile(4, 8, 7);
        let (w, s, e, n) = coord.bounds();
        let geom = rect(w - 1.0, s - 1.0, e + 1.0, n + 1.0);
        let mask = renderer.coverage_mask(coord, [&geom]);
        assert_eq!(mask.covered(), 256 * 256);
    }

    #[test]
    fn tiny_footprint_stays_visible() {
        let renderer = CoverageRenderer::default();
        let geom = rect(10.0, 10.0, 10.0001, 10.0001);
        let mask = renderer.coverage_mask(tile(0, 0, 0), [&geom]);
        assert!(mask.covered() >= 1);
        assert!(mask.covered() <= 4);
        assert!(renderer.render(tile(0, 0, 0), [&geom]).unwrap().is_some());
    }

    #[test]
    fn footprint_elsewhere_is_absent() {
        let renderer = CoverageRenderer::default();
        let geom = rect(100.0, 10.0, 101.0, 11.0);
        assert!(renderer.render(tile(3, 0, 3), [&geom]).unwrap().is_none());
        assert!(renderer.render(tile(3, 0, 3), []).unwrap().is_none());
    }

    #[test]
    fn partial_overlap_is_clipped_to_the_tile() {
        let renderer = CoverageRenderer::new(64, DEFAULT_COVERAGE_COLOR, TileFormat::Png);
        let coord = tile(2, 2, 1);
        let (w, s, e, n) = coord.bounds();
        // Western half of the tile, extending far to the west
        let mid = f64::midpoint(w, e);
        let geom = rect(w - 50.0, s, mid, n);
        let mask = renderer.coverage_mask(coord, [&geom]);
        assert!(mask.is_covered(0, 32));
        assert!(mask.is_covered(31, 32));
        assert!(!mask.is_covered(40, 32));
        assert!(!mask.is_covered(63, 0));
    }

    #[test]
    fn holes_are_respected() {
        let renderer = CoverageRenderer::new(64, DEFAULT_COVERAGE_COLOR, TileFormat::Png);
        let coord = tile(0, 0, 0);
        let exterior = LineString::from(vec![
            (-120.0, -60.0),
            (120.0, -60.0),
            (120.0, 60.0),
            (-120.0, 60.0),
            (-120.0, -60.0),
        ]);
        let hole = LineString::from(vec![
            (-60.0, -30.0),
            (60.0, -30.0),
            (60.0, 30.0),
            (-60.0, 30.0),
            (-60.0, -30.0),
        ]);
        let geom = MultiPolygon::new(vec![Polygon::new(exterior, vec![hole])]);
        let mask = renderer.coverage_mask(coord, [&geom]);
        // Centre of the tile sits inside the hole
        assert!(!mask.is_covered(32, 32));
        // Between the hole and the outer ring
        let (px, py) = coord.project(-90.0, 0.0, 64);
        #[expect(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let (px, py) = (px as u32, py as u32);
        assert!(mask.is_covered(px, py));
    }

    #[test]
    fn painted_with_coverage_color() {
        let color = [10, 20, 30, 40];
        let renderer = CoverageRenderer::new(32, color, TileFormat::Png);
        let geom = rect(-170.0, -80.0, -100.0, 80.0);
        let bytes = renderer.render(tile(0, 0, 0), [&geom]).unwrap().unwrap();
        let img = load_from_memory_with_format(&bytes, ImageFormat::Png)
            .unwrap()
            .to_rgba8();
        assert_eq!(img.get_pixel(2, 16).0, color);
        assert_eq!(img.get_pixel(30, 16).0[3], 0);
    }

    #[test]
    fn rendering_is_deterministic() {
        let renderer = CoverageRenderer::default();
        let geoms = [rect(-5.0, 3.0, 2.0, 9.0), rect(4.0, -2.0, 4.5, -1.5)];
        let a = renderer.render(tile(5, 15, 15), &geoms).unwrap();
        let b = renderer.render(tile(5, 15, 15), &geoms).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn diagonal_segment_touches_every_crossed_pixel() {
        let mut mask = CoverageMask::new(4);
        mask.trace_segment((0.5, 0.5), (3.5, 3.5));
        for i in 0..4 {
            assert!(mask.is_covered(i, i));
        }
        mask.trace_segment((-10.0, 2.5), (-1.0, 2.5));
        assert!(!mask.is_covered(0, 2));
    }
}
