//! Bounding box and lazy tile enumeration.

use std::str::FromStr;

use crate::tile::{MAX_LATITUDE, TileCoord};
use crate::{MosaicError, MosaicResult};

/// Nudge applied to the eastern and southern edges so that a bbox edge lying exactly
/// on a tile boundary does not pull in the neighbouring tile.
const EDGE_EPSILON: f64 = 1e-9;

/// A geographic bounding box in WGS84 coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    /// Maximum latitude (north) in degrees (-90 to 90)
    pub max_lat: f64,
    /// Maximum longitude (east) in degrees (-180 to 180)
    pub max_lon: f64,
    /// Minimum latitude (south) in degrees (-90 to 90)
    pub min_lat: f64,
    /// Minimum longitude (west) in degrees (-180 to 180)
    pub min_lon: f64,
}

impl BoundingBox {
    /// The whole Web Mercator world.
    pub const WORLD: Self = Self {
        max_lat: MAX_LATITUDE,
        max_lon: 180.0,
        min_lat: -MAX_LATITUDE,
        min_lon: -180.0,
    };

    /// Creates a bounding box from North, East, South, West coordinates.
    #[must_use]
    pub fn from_nesw(north: f64, east: f64, south: f64, west: f64) -> Self {
        Self {
            max_lat: north,
            max_lon: east,
            min_lat: south,
            min_lon: west,
        }
    }

    /// Creates a validated bounding box from West, South, East, North coordinates.
    pub fn from_wsen(west: f64, south: f64, east: f64, north: f64) -> MosaicResult<Self> {
        let bbox = Self::from_nesw(north, east, south, west);
        bbox.validate()?;
        Ok(bbox)
    }

    /// Checks that the corners are finite, ordered and within WGS84 limits.
    pub fn validate(&self) -> MosaicResult<()> {
        let values = [self.min_lon, self.min_lat, self.max_lon, self.max_lat];
        if values.iter().any(|v| !v.is_finite()) {
            return Err(MosaicError::InvalidBoundingBox(format!("{self}")));
        }
        if self.min_lon > self.max_lon || self.min_lat > self.max_lat {
            return Err(MosaicError::InvalidBoundingBox(format!(
                "{self}: minimum exceeds maximum"
            )));
        }
        if self.min_lon < -180.0 || self.max_lon > 180.0 || self.min_lat < -90.0 || self.max_lat > 90.0
        {
            return Err(MosaicError::InvalidBoundingBox(format!(
                "{self}: outside of WGS84 range"
            )));
        }
        Ok(())
    }

    /// Returns true if the rectangle `(west, south, east, north)` intersects this box.
    #[must_use]
    pub fn intersects(&self, west: f64, south: f64, east: f64, north: f64) -> bool {
        west <= self.max_lon && east >= self.min_lon && south <= self.max_lat && north >= self.min_lat
    }

    /// Longitude and latitude of the centre.
    #[must_use]
    pub fn center(&self) -> (f64, f64) {
        (
            f64::midpoint(self.min_lon, self.max_lon),
            f64::midpoint(self.min_lat, self.max_lat),
        )
    }

    /// Lazily enumerates all tiles at `zoom` that intersect the box, row by row.
    ///
    /// # Errors
    ///
    /// Returns an error if the zoom level is out of range or a corner is not finite.
    pub fn tiles(&self, zoom: u8) -> MosaicResult<TileRange> {
        // min_lat/max_lat need to be swapped because y increases southward
        let min_tile = TileCoord::from_lon_lat_zoom(self.min_lon, self.max_lat, zoom)?;
        let east = (self.max_lon - EDGE_EPSILON).max(self.min_lon);
        let south = (self.min_lat + EDGE_EPSILON).min(self.max_lat);
        let max_tile = TileCoord::from_lon_lat_zoom(east, south, zoom)?;
        Ok(TileRange {
            z: zoom,
            min_x: min_tile.x(),
            max_x: max_tile.x(),
            max_y: max_tile.y(),
            next_x: min_tile.x(),
            next_y: min_tile.y(),
        })
    }
}

impl std::fmt::Display for BoundingBox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{},{},{},{}",
            self.min_lon, self.min_lat, self.max_lon, self.max_lat
        )
    }
}

impl FromStr for BoundingBox {
    type Err = MosaicError;

    /// Parses `west,south,east,north`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts = s
            .split(',')
            .map(|p| p.trim().parse::<f64>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| MosaicError::InvalidBoundingBox(format!("{s}: {e}")))?;
        let [west, south, east, north] = parts[..] else {
            return Err(MosaicError::InvalidBoundingBox(format!(
                "{s}: expected west,south,east,north"
            )));
        };
        Self::from_wsen(west, south, east, north)
    }
}

/// Iterator over the tiles of one zoom level inside a bounding box.
///
/// Holds only the current cursor, never the tile list.
#[derive(Debug, Clone)]
pub struct TileRange {
    z: u8,
    min_x: u32,
    max_x: u32,
    max_y: u32,
    next_x: u32,
    next_y: u32,
}

impl TileRange {
    /// Zoom level of this range.
    #[must_use]
    pub fn zoom(&self) -> u8 {
        self.z
    }
}

impl Iterator for TileRange {
    type Item = TileCoord;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next_y > self.max_y {
            return None;
        }
        let coord = TileCoord::new(self.z, self.next_x, self.next_y).ok()?;
        if self.next_x == self.max_x {
            self.next_x = self.min_x;
            self.next_y += 1;
        } else {
            self.next_x += 1;
        }
        Some(coord)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        if self.next_y > self.max_y {
            return (0, Some(0));
        }
        let width = u64::from(self.max_x - self.min_x) + 1;
        let full_rows = u64::from(self.max_y - self.next_y);
        let current_row = u64::from(self.max_x - self.next_x) + 1;
        let remaining = full_rows * width + current_row;
        let remaining = usize::try_from(remaining).unwrap_or(usize::MAX);
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for TileRange {}
