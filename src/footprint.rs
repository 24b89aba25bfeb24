//! Imagery footprints loaded from a catalog.

use chrono::{DateTime, Utc};
use geo::{BoundingRect, Geometry, MultiPolygon};

use crate::{MosaicError, MosaicResult};

/// One imagery item: where it is, where to read it, and when it was captured.
#[derive(Debug, Clone, PartialEq)]
pub struct Footprint {
    /// Catalog item id.
    pub id: String,
    /// Lon/lat outline in WGS84.
    pub geometry: MultiPolygon<f64>,
    /// Raster URL used by the direct mosaic strategy.
    pub source: Option<String>,
    /// Capture or last update time. Newer imagery wins in a mosaic.
    pub datetime: Option<DateTime<Utc>>,
}

impl Footprint {
    /// Builds a footprint from any polygonal geometry.
    ///
    /// # Errors
    ///
    /// Fails for non-polygonal or empty geometries.
    pub fn new(
        id: impl Into<String>,
        geometry: Geometry<f64>,
        source: Option<String>,
        datetime: Option<DateTime<Utc>>,
    ) -> MosaicResult<Self> {
        let id = id.into();
        let geometry = match geometry {
            Geometry::Polygon(p) => MultiPolygon::new(vec![p]),
            Geometry::MultiPolygon(mp) => mp,
            Geometry::Rect(r) => MultiPolygon::new(vec![r.to_polygon()]),
            other => {
                return Err(MosaicError::InvalidGeometry {
                    id,
                    reason: format!("expected a polygon, got {}", geometry_kind(&other)),
                });
            }
        };
        if geometry.bounding_rect().is_none() {
            return Err(MosaicError::InvalidGeometry {
                id,
                reason: "empty geometry".to_string(),
            });
        }
        Ok(Self {
            id,
            geometry,
            source,
            datetime,
        })
    }

    /// Envelope as `(west, south, east, north)`.
    #[must_use]
    pub fn envelope(&self) -> Option<(f64, f64, f64, f64)> {
        self.geometry
            .bounding_rect()
            .map(|r| (r.min().x, r.min().y, r.max().x, r.max().y))
    }
}

fn geometry_kind(geometry: &Geometry<f64>) -> &'static str {
    match geometry {
        Geometry::Point(_) => "Point",
        Geometry::Line(_) => "Line",
        Geometry::LineString(_) => "LineString",
        Geometry::Polygon(_) => "Polygon",
        Geometry::MultiPoint(_) => "MultiPoint",
        Geometry::MultiLineString(_) => "MultiLineString",
        Geometry::MultiPolygon(_) => "MultiPolygon",
        Geometry::GeometryCollection(_) => "GeometryCollection",
        Geometry::Rect(_) => "Rect",
        Geometry::Triangle(_) => "Triangle",
    }
}

/// All footprints of a run, in catalog order. Immutable once loaded.
#[derive(Debug, Clone, Default)]
pub struct FootprintSet {
    footprints: Vec<Footprint>,
}

impl FootprintSet {
    /// Keeps catalog order.
    #[must_use]
    pub fn new(footprints: Vec<Footprint>) -> Self {
        Self { footprints }
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.footprints.len()
    }

    /// No entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.footprints.is_empty()
    }

    /// Footprint at a spatial index position.
    #[must_use]
    pub fn get(&self, index: usize) -> Option<&Footprint> {
        self.footprints.get(index)
    }

    /// Footprints in catalog order.
    pub fn iter(&self) -> impl Iterator<Item = &Footprint> {
        self.footprints.iter()
    }

    /// Geometries in index order, as expected by [`SpatialIndex::build`](crate::SpatialIndex::build).
    #[must_use]
    pub fn geometries(&self) -> Vec<&MultiPolygon<f64>> {
        self.footprints.iter().map(|f| &f.geometry).collect()
    }

    /// Geometries of the given candidate indices. Unknown indices are ignored.
    pub fn candidate_geometries<'a>(
        &'a self,
        candidates: &'a [usize],
    ) -> impl Iterator<Item = &'a MultiPolygon<f64>> + 'a {
        candidates
            .iter()
            .filter_map(|&i| self.footprints.get(i))
            .map(|f| &f.geometry)
    }
}

#[cfg(test)]
mod tests {
    use geo::{Point, Rect, coord};

    use super::*;

    #[test]
    fn normalizes_polygons() {
        let rect = Rect::new(coord! { x: 0.0, y: 0.0 }, coord! { x: 1.0, y: 2.0 });
        let fp = Footprint::new("a", Geometry::Rect(rect), None, None).unwrap();
        assert_eq!(fp.geometry.0.len(), 1);
        assert_eq!(fp.envelope(), Some((0.0, 0.0, 1.0, 2.0)));
    }

    #[test]
    fn rejects_points() {
        let err = Footprint::new("p", Geometry::Point(Point::new(1.0, 1.0)), None, None)
            .unwrap_err();
        assert!(matches!(err, MosaicError::InvalidGeometry { id, .. } if id == "p"));
    }

    #[test]
    fn rejects_empty() {
        let err =
            Footprint::new("e", Geometry::MultiPolygon(MultiPolygon::new(vec![])), None, None)
                .unwrap_err();
        assert!(matches!(err, MosaicError::InvalidGeometry { .. }));
    }

    #[test]
    fn candidate_geometries_skip_unknown() {
        let rect = Rect::new(coord! { x: 0.0, y: 0.0 }, coord! { x: 1.0, y: 1.0 });
        let set = FootprintSet::new(vec![
            Footprint::new("a", Geometry::Rect(rect), None, None).unwrap(),
        ]);
        assert_eq!(set.candidate_geometries(&[0, 7]).count(), 1);
    }
}
