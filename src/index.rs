use geo::{BoundingRect, MultiPolygon};
use rstar::primitives::{GeomWithData, Rectangle};
use rstar::{AABB, RTree};

type IndexedEnvelope = GeomWithData<Rectangle<[f64; 2]>, usize>;

/// R-tree over footprint envelopes, answering "which footprints may touch this rectangle".
///
/// Results are a superset: envelopes are compared, not geometries.
#[derive(Debug)]
pub struct SpatialIndex {
    tree: RTree<IndexedEnvelope>,
}

impl SpatialIndex {
    /// Bulk-loads the envelopes of `geometries`; the position in the slice is the returned index.
    ///
    /// Geometries without an envelope (empty) are never returned.
    pub fn build<'a, I>(geometries: I) -> Self
    where
        I: IntoIterator<Item = &'a MultiPolygon<f64>>,
    {
        let envelopes = geometries
            .into_iter()
            .enumerate()
            .filter_map(|(i, geom)| {
                let rect = geom.bounding_rect()?;
                let corners = Rectangle::from_corners(
                    [rect.min().x, rect.min().y],
                    [rect.max().x, rect.max().y],
                );
                Some(GeomWithData::new(corners, i))
            })
            .collect();
        Self {
            tree: RTree::bulk_load(envelopes),
        }
    }

    /// Number of indexed envelopes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tree.size()
    }

    /// No footprint is indexed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tree.size() == 0
    }

    /// Ascending indices of footprints whose envelope intersects the rectangle.
    #[must_use]
    pub fn query(&self, west: f64, south: f64, east: f64, north: f64) -> Vec<usize> {
        let envelope = AABB::from_corners([west, south], [east, north]);
        let mut hits: Vec<usize> = self
            .tree
            .locate_in_envelope_intersecting(&envelope)
            .map(|item| item.data)
            .collect();
        hits.sort_unstable();
        hits
    }
}
