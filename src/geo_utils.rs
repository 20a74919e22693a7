//! Geographic utilities: great-circle distance and path length.

use geo::{Distance, Haversine, Point};

use crate::{GpsPoint, LngLat};

/// Mean Earth radius used for meter/degree conversions.
const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Calculate haversine distance between two GPS points in meters.
pub fn haversine_distance(p1: &GpsPoint, p2: &GpsPoint) -> f64 {
    let point1 = Point::new(p1.longitude, p1.latitude);
    let point2 = Point::new(p2.longitude, p2.latitude);
    Haversine::distance(point1, point2)
}

/// Total length of a `[lng, lat]` polyline in meters.
pub fn polyline_length(coords: &[LngLat]) -> f64 {
    coords
        .windows(2)
        .map(|w| haversine_distance(&GpsPoint::from_lng_lat(w[0]), &GpsPoint::from_lng_lat(w[1])))
        .sum()
}

/// Approximate a distance in meters as degrees of latitude.
///
/// Used to size search envelopes; exact filtering is done with
/// [`haversine_distance`] afterwards.
pub fn meters_to_degrees(meters: f64) -> f64 {
    (meters / EARTH_RADIUS_M).to_degrees()
}
