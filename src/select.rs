//! Per-zoom selection of the tiles worth rendering.

use crate::bbox::TileRange;
use crate::{BoundingBox, MosaicResult, SpatialIndex, TileCoord};

/// A tile to render and the footprints that may cover it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TileJob {
    /// Tile to render.
    pub coord: TileCoord,
    /// Ascending footprint indices, never empty when produced by [`TileSelector`].
    pub candidates: Vec<usize>,
}

/// Lazily yields a [`TileJob`] for every tile of one zoom that has candidate footprints.
///
/// Tiles without candidates are dropped here and never reach a renderer.
pub struct TileSelector<'a> {
    index: &'a SpatialIndex,
    tiles: TileRange,
}

impl<'a> TileSelector<'a> {
    /// Tiles of `zoom` intersecting `bbox`.
    pub fn new(index: &'a SpatialIndex, bbox: &BoundingBox, zoom: u8) -> MosaicResult<Self> {
        Ok(Self {
            index,
            tiles: bbox.tiles(zoom)?,
        })
    }
}

impl Iterator for TileSelector<'_> {
    type Item = TileJob;

    fn next(&mut self) -> Option<Self::Item> {
        for coord in self.tiles.by_ref() {
            let (west, south, east, north) = coord.bounds();
            let candidates = self.index.query(west, south, east, north);
            if !candidates.is_empty() {
                return Some(TileJob { coord, candidates });
            }
        }
        None
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, self.tiles.size_hint().1)
    }
}

#[cfg(test)]
mod tests {
    use geo::{MultiPolygon, Rect, coord};

    use super::*;

    fn square(x: f64, y: f64, size: f64) -> MultiPolygon<f64> {
        let rect = Rect::new(coord! { x: x, y: y }, coord! { x: x + size, y: y + size });
        MultiPolygon::new(vec![rect.to_polygon()])
    }

    #[test]
    fn selects_only_covered_tiles() {
        let geoms = vec![square(1.0, 1.0, 0.5), square(-100.0, 40.0, 1.0)];
        let index = SpatialIndex::build(&geoms);
        let jobs: Vec<_> = TileSelector::new(&index, &BoundingBox::WORLD, 1)
            .unwrap()
            .collect();
        let coords: Vec<_> = jobs.iter().map(|j| (j.coord.x(), j.coord.y())).collect();
        // Western and eastern halves of the northern hemisphere
        assert_eq!(coords, vec![(0, 0), (1, 0)]);
        assert_eq!(jobs[0].candidates, vec![1]);
        assert_eq!(jobs[1].candidates, vec![0]);
    }

    #[test]
    fn every_job_matches_index_query() {
        let geoms = vec![square(-10.0, 5.0, 3.0), square(2.0, 20.0, 0.01)];
        let index = SpatialIndex::build(&geoms);
        let bbox = BoundingBox::from_wsen(-20.0, 0.0, 10.0, 30.0).unwrap();
        for zoom in 3..8 {
            let selected: Vec<_> = TileSelector::new(&index, &bbox, zoom).unwrap().collect();
            let expected: Vec<_> = bbox
                .tiles(zoom)
                .unwrap()
                .filter_map(|coord| {
                    let (w, s, e, n) = coord.bounds();
                    let candidates = index.query(w, s, e, n);
                    (!candidates.is_empty()).then_some(TileJob { coord, candidates })
                })
                .collect();
            assert_eq!(selected, expected);
            assert!(selected.iter().all(|j| !j.candidates.is_empty()));
        }
    }

    #[test]
    fn selection_is_repeatable() {
        let geoms = vec![square(-10.0, 5.0, 3.0)];
        let index = SpatialIndex::build(&geoms);
        let bbox = BoundingBox::from_wsen(-20.0, 0.0, 10.0, 30.0).unwrap();
        let first: Vec<_> = TileSelector::new(&index, &bbox, 6).unwrap().collect();
        let second: Vec<_> = TileSelector::new(&index, &bbox, 6).unwrap().collect();
        assert_eq!(first, second);
    }

    #[test]
    fn no_footprints_no_jobs() {
        let index = SpatialIndex::build(&Vec::<MultiPolygon<f64>>::new());
        assert_eq!(
            TileSelector::new(&index, &BoundingBox::WORLD, 4).unwrap().count(),
            0
        );
    }
}
