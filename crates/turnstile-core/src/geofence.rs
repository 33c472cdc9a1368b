//! Optional premises check based on great-circle distance.

use crate::types::GeoPoint;
use serde::Deserialize;

/// Mean Earth radius in meters.
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Haversine distance between two points, in meters.
pub fn haversine_distance(a: GeoPoint, b: GeoPoint) -> f64 {
    let lat1 = a.latitude.to_radians();
    let lat2 = b.latitude.to_radians();
    let d_lat = lat2 - lat1;
    let d_lon = (b.longitude - a.longitude).to_radians();

    let h = (d_lat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (d_lon / 2.0).sin().powi(2);
    let c = 2.0 * h.sqrt().atan2((1.0 - h).sqrt());
    EARTH_RADIUS_M * c
}

/// Circular premises around a reference point.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct Geofence {
    pub latitude: f64,
    pub longitude: f64,
    pub radius_m: f64,
}

impl Geofence {
    pub fn center(&self) -> GeoPoint {
        GeoPoint {
            latitude: self.latitude,
            longitude: self.longitude,
        }
    }

    /// A scan with no reported location is never inside.
    pub fn contains(&self, location: Option<GeoPoint>) -> bool {
        match location {
            Some(point) => haversine_distance(self.center(), point) <= self.radius_m,
            None => false,
        }
    }
}
