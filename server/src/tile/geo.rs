//! Slippy-tile geometry: tile-to-lon/lat bounds and WGS84 -> EPSG:3857
//! projection, used to build WMS `BBOX` parameters for a block of tiles.
//!
//! Implemented directly (the spherical-mercator formulas are a few lines
//! and stable) rather than pulling in a full GIS stack for two functions.

use std::f64::consts::PI;

/// Lon/lat bounds of a single tile, west/south/east/north, in degrees.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LonLatBounds {
    pub west: f64,
    pub south: f64,
    pub east: f64,
    pub north: f64,
}

/// Standard slippy-map tile -> WGS84 bounds conversion.
pub fn tile_bounds(z: u32, x: u32, y: u32) -> LonLatBounds {
    let n = 2f64.powi(z as i32);
    let lon_west = x as f64 / n * 360.0 - 180.0;
    let lon_east = (x as f64 + 1.0) / n * 360.0 - 180.0;
    let lat_north = lat_from_tile_y(y as f64, n);
    let lat_south = lat_from_tile_y(y as f64 + 1.0, n);
    LonLatBounds {
        west: lon_west,
        south: lat_south,
        east: lon_east,
        north: lat_north,
    }
}

fn lat_from_tile_y(y: f64, n: f64) -> f64 {
    let rad = PI * (1.0 - 2.0 * y / n);
    rad.sinh().atan().to_degrees()
}

/// Project a WGS84 lon/lat point (degrees) to EPSG:3857 meters.
pub fn wgs84_to_web_mercator(lon: f64, lat: f64) -> (f64, f64) {
    const EARTH_RADIUS_M: f64 = 6_378_137.0;
    let x = lon.to_radians() * EARTH_RADIUS_M;
    let lat_rad = lat.to_radians();
    let y = EARTH_RADIUS_M * ((PI / 4.0 + lat_rad / 2.0).tan()).ln();
    (x, y)
}

/// Bounding box of a block spanning tiles `(xB..xB+n-1, yB..yB+n-1)` at
/// zoom `z`, transformed to EPSG:3857 meters: `(south, west, north, east)`
/// matching the WMS `BBOX=south,west,north,east` parameter order this
/// proxy's upstream expects.
pub fn block_bounds_web_mercator(z: u32, x_block: u32, y_block: u32, n: u32) -> (f64, f64, f64, f64) {
    let top_left = tile_bounds(z, x_block, y_block);
    let bottom_right = tile_bounds(z, x_block + n - 1, y_block + n - 1);

    let (west_m, north_m) = wgs84_to_web_mercator(top_left.west, top_left.north);
    let (east_m, south_m) = wgs84_to_web_mercator(bottom_right.east, bottom_right.south);

    (south_m, west_m, north_m, east_m)
}
