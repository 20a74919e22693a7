//! # Routing Service
//!
//! Contract for the remote routing / map-matching service, plus the
//! response shapes it returns. Coordinates are `[longitude, latitude]`
//! throughout, matching the wire format.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::LngLat;

/// Route line geometry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RouteGeometry {
    pub coordinates: Vec<LngLat>,
}

/// A route returned by the routing service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Route {
    pub geometry: RouteGeometry,
    /// Seconds
    pub duration: f64,
    /// Meters
    pub distance: f64,
}

impl Route {
    pub fn coordinates(&self) -> &[LngLat] {
        &self.geometry.coordinates
    }
}

/// Directions response: alternatives from origin to destination, best first.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Directions {
    #[serde(default)]
    pub routes: Vec<Route>,
}

impl Directions {
    pub fn primary(&self) -> Option<&Route> {
        self.routes.first()
    }
}

/// Map-matching response: candidate canonical routes for a raw trace.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MatchedRoutes {
    #[serde(default)]
    pub matchings: Vec<Route>,
}

impl MatchedRoutes {
    pub fn best(&self) -> Option<&Route> {
        self.matchings.first()
    }
}

/// Remote routing service.
#[async_trait]
pub trait RoutingService: Send + Sync {
    /// Turn-by-turn alternatives between two points.
    async fn directions(&self, origin: LngLat, destination: LngLat) -> Result<Directions>;

    /// Snap an ordered raw trace onto the road/path network.
    async fn match_route(&self, coordinates: &[LngLat]) -> Result<MatchedRoutes>;
}

/// Uniformly sample a trace down to at most `max_points`, always keeping
/// the first and last coordinates.
pub fn downsample(coordinates: &[LngLat], max_points: usize) -> Vec<LngLat> {
    let n = coordinates.len();
    if n <= max_points || max_points < 2 {
        return coordinates.to_vec();
    }

    let step = (n - 1) as f64 / (max_points - 1) as f64;
    (0..max_points)
        .map(|i| coordinates[((i as f64 * step).round() as usize).min(n - 1)])
        .collect()
}
