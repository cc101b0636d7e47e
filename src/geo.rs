//! Geodesy helpers
//!
//! Spherical-earth approximations are accurate to well under a meter at
//! city scale, which is far below the accuracy of any modality we fuse.

use serde::{Deserialize, Serialize};

use crate::types::GeoPoint;

/// Mean earth radius (meters)
pub const EARTH_RADIUS_M: f64 = 6_371_008.8;

/// Approximate meters per degree of latitude
pub const METERS_PER_DEG_LAT: f64 = 111_195.0;

/// Great-circle distance between two points (meters)
pub fn haversine_m(a: GeoPoint, b: GeoPoint) -> f64 {
    let (lat1, lat2) = (a.lat.to_radians(), b.lat.to_radians());
    let dlat = lat2 - lat1;
    let dlon = (b.lon - a.lon).to_radians();

    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * h.sqrt().min(1.0).asin()
}

/// Point reached by travelling `distance_m` from `origin` along `bearing_deg`
pub fn destination(origin: GeoPoint, bearing_deg: f64, distance_m: f64) -> GeoPoint {
    let delta = distance_m / EARTH_RADIUS_M;
    let theta = bearing_deg.to_radians();
    let lat1 = origin.lat.to_radians();
    let lon1 = origin.lon.to_radians();

    let lat2 = (lat1.sin() * delta.cos() + lat1.cos() * delta.sin() * theta.cos()).asin();
    let lon2 = lon1
        + (theta.sin() * delta.sin() * lat1.cos()).atan2(delta.cos() - lat1.sin() * lat2.sin());

    GeoPoint::new(lat2.to_degrees(), normalize_lon(lon2.to_degrees()))
}

/// Wrap a longitude into [-180, 180)
pub fn normalize_lon(lon: f64) -> f64 {
    let wrapped = (lon + 180.0).rem_euclid(360.0) - 180.0;
    if wrapped == -180.0 && lon > 0.0 {
        180.0
    } else {
        wrapped
    }
}

/// Cell of a regular lat/lon grid
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GridCell {
    pub row: i64,
    pub col: i64,
}

impl GridCell {
    pub fn of(point: GeoPoint, cell_deg: f64) -> Self {
        Self {
            row: (point.lat / cell_deg).floor() as i64,
            col: (point.lon / cell_deg).floor() as i64,
        }
    }

    /// Chebyshev distance in cells
    pub fn ring_distance(&self, other: &GridCell) -> i64 {
        (self.row - other.row).abs().max((self.col - other.col).abs())
    }

    /// All cells within `k` rings of this one, including itself
    pub fn neighborhood(&self, k: i64) -> impl Iterator<Item = GridCell> + '_ {
        (-k..=k).flat_map(move |dr| {
            (-k..=k).map(move |dc| GridCell {
                row: self.row + dr,
                col: self.col + dc,
            })
        })
    }

    /// Stable 64-bit hash, identical across processes and platforms
    pub fn stable_hash(&self) -> u64 {
        splitmix64(splitmix64(self.row as u64) ^ (self.col as u64))
    }
}

/// Number of grid rings needed to cover `radius_m` around a point at `lat`
pub fn rings_for_radius(radius_m: f64, lat: f64, cell_deg: f64) -> i64 {
    // Longitude cells shrink with latitude; size the ring for the narrower axis.
    let cos_lat = lat.to_radians().cos().abs().max(0.01);
    let cell_m = cell_deg * METERS_PER_DEG_LAT * cos_lat;
    ((radius_m / cell_m).ceil().max(0.0) as i64).saturating_add(1)
}

fn splitmix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9E37_79B9_7F4A_7C15);
    x = (x ^ (x >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    x ^ (x >> 31)
}
