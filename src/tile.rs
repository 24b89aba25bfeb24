use std::f64::consts::PI;
use std::fmt::{Display, Formatter};

use crate::{MosaicError, MosaicResult};

/// Maximum zoom level a tile id can address.
pub const MAX_ZOOM: u8 = 31;

/// Latitude limit of the Web Mercator projection, in degrees.
pub const MAX_LATITUDE: f64 = 85.051_128_779_806_59;

/// Number of tile ids used by all zoom levels below the index.
const PYRAMID_SIZE_BY_ZOOM: [u64; 32] = {
    let mut sizes = [0_u64; 32];
    let mut z = 1;
    while z < 32 {
        sizes[z] = sizes[z - 1] + (1_u64 << (2 * (z - 1)));
        z += 1;
    }
    sizes
};

/// Largest valid tile id (last tile of zoom 31).
pub const MAX_TILE_ID: u64 = PYRAMID_SIZE_BY_ZOOM[31] + (1_u64 << 62) - 1;

/// A `z/x/y` tile of the Web Mercator pyramid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TileCoord {
    z: u8,
    x: u32,
    y: u32,
}

impl TileCoord {
    /// Creates a tile coordinate, validating that `x` and `y` fit the zoom level.
    pub fn new(z: u8, x: u32, y: u32) -> MosaicResult<Self> {
        if z > MAX_ZOOM || u64::from(x) >= 1_u64 << z || u64::from(y) >= 1_u64 << z {
            return Err(MosaicError::InvalidTileCoord { z, x, y });
        }
        Ok(Self { z, x, y })
    }

    /// Tile containing the given position at the given zoom.
    ///
    /// Positions outside the projection are clamped onto the pyramid's edge tiles.
    pub fn from_lon_lat_zoom(lon: f64, lat: f64, z: u8) -> MosaicResult<Self> {
        if !lon.is_finite() || !lat.is_finite() {
            return Err(MosaicError::InvalidBoundingBox(format!(
                "non-finite position {lon},{lat}"
            )));
        }
        if z > MAX_ZOOM {
            return Err(MosaicError::InvalidTileCoord { z, x: 0, y: 0 });
        }
        let n = tiles_per_side(z);
        let max_index = n - 1.0;
        let x = (lon_to_unit(lon) * n).floor().clamp(0.0, max_index);
        let y = (lat_to_unit(lat) * n).floor().clamp(0.0, max_index);
        #[expect(clippy::cast_possible_truncation)]
        Self::new(z, x as u32, y as u32)
    }

    /// Zoom level.
    #[must_use]
    pub fn z(&self) -> u8 {
        self.z
    }

    /// Column, increasing eastwards.
    #[must_use]
    pub fn x(&self) -> u32 {
        self.x
    }

    /// Row, increasing southwards.
    #[must_use]
    pub fn y(&self) -> u32 {
        self.y
    }

    /// Geographic bounds as `(west, south, east, north)` in degrees.
    #[must_use]
    pub fn bounds(&self) -> (f64, f64, f64, f64) {
        let n = tiles_per_side(self.z);
        let west = f64::from(self.x) / n * 360.0 - 180.0;
        let east = f64::from(self.x + 1) / n * 360.0 - 180.0;
        let north = unit_to_lat(f64::from(self.y) / n);
        let south = unit_to_lat(f64::from(self.y + 1) / n);
        (west, south, east, north)
    }

    /// Projects a position into this tile's pixel space for a square tile of `size` pixels.
    ///
    /// The tile's north-west corner is `(0, 0)`; the south-east corner is `(size, size)`.
    #[must_use]
    pub fn project(&self, lon: f64, lat: f64, size: u32) -> (f64, f64) {
        let n = tiles_per_side(self.z);
        let size = f64::from(size);
        let px = (lon_to_unit(lon) * n - f64::from(self.x)) * size;
        let py = (lat_to_unit(lat) * n - f64::from(self.y)) * size;
        (px, py)
    }
}

impl Display for TileCoord {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.z, self.x, self.y)
    }
}

/// A `PMTiles` v3 tile id: position along the Hilbert curve, offset by all lower zoom levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TileId(u64);

impl TileId {
    /// Wraps a raw tile id, validating its range.
    pub fn new(id: u64) -> MosaicResult<Self> {
        if id > MAX_TILE_ID {
            return Err(MosaicError::InvalidTileId(id));
        }
        Ok(Self(id))
    }

    /// Raw tile id.
    #[must_use]
    pub fn value(self) -> u64 {
        self.0
    }
}

impl From<TileCoord> for TileId {
    fn from(coord: TileCoord) -> Self {
        let TileCoord { z, x, y } = coord;
        if z == 0 {
            return Self(0);
        }
        let base_id = PYRAMID_SIZE_BY_ZOOM[usize::from(z)];
        let tile_id: u64 = fast_hilbert::xy2h(x, y, z);
        Self(base_id + tile_id)
    }
}

impl From<TileId> for TileCoord {
    fn from(id: TileId) -> Self {
        let id = id.value();
        let z = PYRAMID_SIZE_BY_ZOOM
            .iter()
            .rposition(|&base| base <= id)
            .unwrap_or(0);
        let base_id = PYRAMID_SIZE_BY_ZOOM[z];
        #[expect(clippy::cast_possible_truncation)]
        let z = z as u8;
        let (x, y) = fast_hilbert::h2xy::<u32>(id - base_id, z);
        Self { z, x, y }
    }
}

impl Display for TileId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

fn tiles_per_side(z: u8) -> f64 {
    (1_u64 << z) as f64
}

/// Longitude to `[0, 1]` across the projection, west to east.
fn lon_to_unit(lon: f64) -> f64 {
    (lon + 180.0) / 360.0
}

/// Latitude to `[0, 1]` across the projection, north to south.
fn lat_to_unit(lat: f64) -> f64 {
    let lat = lat.clamp(-MAX_LATITUDE, MAX_LATITUDE).to_radians();
    (1.0 - (lat.tan() + 1.0 / lat.cos()).ln() / PI) / 2.0
}

fn unit_to_lat(unit: f64) -> f64 {
    (PI * (1.0 - 2.0 * unit)).sinh().atan().to_degrees()
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn id(z: u8, x: u32, y: u32) -> u64 {
        TileId::from(TileCoord::new(z, x, y).unwrap()).value()
    }

    #[test]
    fn test_tile_id() {
        assert_eq!(id(0, 0, 0), 0);
        assert_eq!(id(1, 1, 0), 4);
        assert_eq!(id(2, 1, 3), 11);
        assert_eq!(id(3, 3, 0), 26);
    }

    #[rstest]
    #[case(0, 0, 0)]
    #[case(5, 10, 10)]
    #[case(14, 8_000, 5_555)]
    #[case(20, 1_048_575, 0)]
    fn tile_id_inverts(#[case] z: u8, #[case] x: u32, #[case] y: u32) {
        let coord = TileCoord::new(z, x, y).unwrap();
        let back = TileCoord::from(TileId::new(TileId::from(coord).value()).unwrap());
        assert_eq!(coord, back);
    }

    #[test]
    fn ids_are_contiguous_per_zoom() {
        let last_z1 = (0..2)
            .flat_map(|x| (0..2).map(move |y| id(1, x, y)))
            .max()
            .unwrap();
        let first_z2 = (0..4)
            .flat_map(|x| (0..4).map(move |y| id(2, x, y)))
            .min()
            .unwrap();
        assert_eq!(last_z1 + 1, first_z2);
    }

    #[test]
    fn rejects_out_of_range() {
        assert!(TileCoord::new(1, 2, 0).is_err());
        assert!(TileCoord::new(32, 0, 0).is_err());
        assert!(TileId::new(MAX_TILE_ID + 1).is_err());
    }

    #[test]
    fn bounds_of_root_tile() {
        let (w, s, e, n) = TileCoord::new(0, 0, 0).unwrap().bounds();
        assert!((w + 180.0).abs() < 1e-9);
        assert!((e - 180.0).abs() < 1e-9);
        assert!((n - MAX_LATITUDE).abs() < 1e-9);
        assert!((s + MAX_LATITUDE).abs() < 1e-9);
    }

    #[test]
    fn from_lon_lat_clamps_to_pyramid() {
        let t = TileCoord::from_lon_lat_zoom(180.0, -90.0, 3).unwrap();
        assert_eq!((t.x(), t.y()), (7, 7));
        let t = TileCoord::from_lon_lat_zoom(-180.0, 90.0, 3).unwrap();
        assert_eq!((t.x(), t.y()), (0, 0));
    }

    #[test]
    fn project_corners() {
        let coord = TileCoord::new(5, 10, 10).unwrap();
        let (w, s, e, n) = coord.bounds();
        let (x0, y0) = coord.project(w, n, 256);
        let (x1, y1) = coord.project(e, s, 256);
        assert!(x0.abs() < 1e-6 && y0.abs() < 1e-6);
        assert!((x1 - 256.0).abs() < 1e-6 && (y1 - 256.0).abs() < 1e-6);
    }
}
