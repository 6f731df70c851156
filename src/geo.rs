//! Great-circle geometry on the WGS-84 sphere.
//!
//! The geospatial index itself lives in PostGIS; this module holds the pure
//! distance math used to order matches and to sanity-check radii on the Rust
//! side.

use serde::{Deserialize, Serialize};

/// Mean Earth radius in meters (WGS-84 sphere).
pub const EARTH_RADIUS_M: f64 = 6_371_008.8;

/// A WGS-84 coordinate pair.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl GeoPoint {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        GeoPoint {
            latitude,
            longitude,
        }
    }

    /// True when both coordinates are inside their valid WGS-84 ranges.
    pub fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && (-90.0..=90.0).contains(&self.latitude)
            && (-180.0..=180.0).contains(&self.longitude)
    }
}

/// Haversine great-circle distance between two points, in meters.
pub fn haversine_m(a: GeoPoint, b: GeoPoint) -> f64 {
    let lat_a = a.latitude.to_radians();
    let lat_b = b.latitude.to_radians();
    let d_lat = (b.latitude - a.latitude).to_radians();
    let d_lng = (b.longitude - a.longitude).to_radians();

    let h = (d_lat / 2.0).sin().powi(2) + lat_a.cos() * lat_b.cos() * (d_lng / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * h.sqrt().asin()
}

/// True when `point` lies within `radius_m` meters of `center`.
pub fn within_radius(center: GeoPoint, point: GeoPoint, radius_m: f64) -> bool {
    haversine_m(center, point) <= radius_m
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_distance() {
        let p = GeoPoint::new(34.0164, -118.4951);
        assert_eq!(haversine_m(p, p), 0.0);
    }

    #[test]
    fn test_known_distance_santa_monica() {
        // Two points ~15 m apart on the Santa Monica beach path.
        let a = GeoPoint::new(34.0164, -118.4951);
        let b = GeoPoint::new(34.01641, -118.49509);
        let d = haversine_m(a, b);
        assert!(d < 100.0, "expected < 100 m, got {d}");
        assert!(within_radius(a, b, 100.0));
    }

    #[test]
    fn test_hemisphere_scale_distance() {
        // London to New York is roughly 5 570 km.
        let london = GeoPoint::new(51.5074, -0.1278);
        let new_york = GeoPoint::new(40.7128, -74.0060);
        let d = haversine_m(london, new_york);
        assert!((5_500_000.0..5_650_000.0).contains(&d), "got {d}");
    }

    #[test]
    fn test_symmetry() {
        let a = GeoPoint::new(10.0, 20.0);
        let b = GeoPoint::new(-33.9, 151.2);
        assert!((haversine_m(a, b) - haversine_m(b, a)).abs() < 1e-6);
    }

    #[test]
    fn test_coordinate_validation() {
        assert!(GeoPoint::new(90.0, 180.0).is_valid());
        assert!(!GeoPoint::new(90.1, 0.0).is_valid());
        assert!(!GeoPoint::new(0.0, -180.5).is_valid());
        assert!(!GeoPoint::new(f64::NAN, 0.0).is_valid());
    }
}
