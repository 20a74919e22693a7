//! # Ride Tracker
//!
//! Ride lifecycle and live location tracking for scooter rentals.
//!
//! This library provides:
//! - A ride state machine (start, trace accumulation, finish, resume)
//! - Route reconciliation of the raw trace through a map-matching service
//! - Scooter selection with directions and a proximity ("nearby") signal
//! - Permission-gated position subscriptions
//!
//! External systems (geolocation, routing, persistence, user notices) are
//! traits; the crate ships an in-memory store and optional adapters.
//!
//! ## Features
//!
//! - **`http`** - Mapbox routing client and PostgREST store client
//! - **`persistence`** - SQLite-backed local store
//! - **`full`** - Enable all features
//!
//! ## Quick Start
//!
//! ```rust
//! use ride_tracker::{GpsPoint, geo_utils::haversine_distance};
//!
//! let rider = GpsPoint::new(37.7800, -122.4000);
//! let scooter = GpsPoint::new(37.7805, -122.4000);
//! assert!(haversine_distance(&rider, &scooter) < 100.0);
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// Unified error handling
pub mod error;
pub use error::{OptionExt, Result, RideError};

// User-visible notices
pub mod notice;
pub use notice::{CollectingNotifier, LogNotifier, Notice, Notifier};

// Thresholds and adapter settings
pub mod config;
pub use config::{RideConfig, RoutingConfig, StoreConfig};

// Geographic utilities (distance, path length)
pub mod geo_utils;

// Permission gate and position subscriptions
pub mod location;
pub use location::{
    GeolocationSource, LocationFeed, PermissionGate, PermissionState, PermissionStatus,
    PositionWatch,
};

// Store contract and in-memory store
pub mod store;
pub use store::{Filter, MemoryStore, PersistenceStore};

// Routing contract
pub mod routing;
pub use routing::{Directions, MatchedRoutes, Route, RouteGeometry, RoutingService};

// Ride lifecycle state machine
pub mod ride;
pub use ride::{Clock, RideSession, RideState};

// Proximity to the selected scooter
pub mod proximity;
pub use proximity::ProximityMonitor;

// Scooter selection and directions
pub mod scooter;
pub use scooter::{DirectionsOutcome, DirectionsTicket, ScooterSelection, SelectionUpdate};

// Explicit owner of all ride/scooter state
pub mod controller;
pub use controller::{Collaborators, RideController};

// HTTP adapters (routing and store)
#[cfg(feature = "http")]
pub mod http;
#[cfg(feature = "http")]
pub use http::{MapboxRouting, RestStore};

// SQLite-backed local store
#[cfg(feature = "persistence")]
pub mod persistence;
#[cfg(feature = "persistence")]
pub use persistence::SqliteStore;

/// Initialize logging for Android.
#[cfg(target_os = "android")]
pub fn init_logging() {
    use android_logger::Config;
    use log::LevelFilter;

    android_logger::init_once(
        Config::default()
            .with_max_level(LevelFilter::Debug)
            .with_tag("RideTracker"),
    );
}

/// No-op on non-Android platforms; the host installs its own logger.
#[cfg(not(target_os = "android"))]
pub fn init_logging() {}

// ============================================================================
// Core Types
// ============================================================================

/// A `[longitude, latitude]` pair, the wire order used by routing and store.
pub type LngLat = [f64; 2];

/// A GPS coordinate with latitude and longitude.
///
/// # Example
/// ```
/// use ride_tracker::GpsPoint;
/// let point = GpsPoint::new(37.7749, -122.4194); // San Francisco
/// assert_eq!(point.to_lng_lat(), [-122.4194, 37.7749]);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GpsPoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl GpsPoint {
    /// Create a new GPS point.
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    pub fn from_lng_lat(coord: LngLat) -> Self {
        Self::new(coord[1], coord[0])
    }

    pub fn to_lng_lat(&self) -> LngLat {
        [self.longitude, self.latitude]
    }

    /// Check if the point has valid coordinates.
    pub fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && self.latitude >= -90.0
            && self.latitude <= 90.0
            && self.longitude >= -180.0
            && self.longitude <= 180.0
    }
}

/// A ride record as stored in the `rides` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ride {
    pub id: i64,
    pub user_id: String,
    pub scooter_id: i64,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    /// Seconds, set at finish
    #[serde(rename = "routeDuration", default, skip_serializing_if = "Option::is_none")]
    pub route_duration: Option<f64>,
    /// Meters, set at finish
    #[serde(rename = "routeDistance", default, skip_serializing_if = "Option::is_none")]
    pub route_distance: Option<f64>,
    #[serde(rename = "routeCoords", default, skip_serializing_if = "Option::is_none")]
    pub route_coords: Option<Vec<LngLat>>,
}

impl Ride {
    pub fn is_finished(&self) -> bool {
        self.finished_at.is_some()
    }
}

/// Insert payload for a new ride. `finished_at` stays null.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NewRide {
    pub user_id: String,
    pub scooter_id: i64,
    pub started_at: DateTime<Utc>,
}

/// Update payload written once, when a ride finishes.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RideFinish {
    pub finished_at: DateTime<Utc>,
    #[serde(rename = "routeDuration")]
    pub route_duration: f64,
    #[serde(rename = "routeDistance")]
    pub route_distance: f64,
    #[serde(rename = "routeCoords")]
    pub route_coords: Vec<LngLat>,
}

impl RideFinish {
    /// Finish payload taken from a matched route.
    pub fn from_route(route: &Route, finished_at: DateTime<Utc>) -> Self {
        Self {
            finished_at,
            route_duration: route.duration,
            route_distance: route.distance,
            route_coords: route.geometry.coordinates.clone(),
        }
    }

    /// Apply this payload to a ride record.
    pub fn apply_to(&self, ride: &mut Ride) {
        ride.finished_at = Some(self.finished_at);
        ride.route_duration = Some(self.route_duration);
        ride.route_distance = Some(self.route_distance);
        ride.route_coords = Some(self.route_coords.clone());
    }
}

/// A rentable scooter, as returned by the nearby search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scooter {
    pub id: i64,
    pub lat: f64,
    pub long: f64,
    /// Distance from the device when found by the nearby search
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dist_meters: Option<f64>,
}

impl Scooter {
    pub fn new(id: i64, lat: f64, long: f64) -> Self {
        Self {
            id,
            lat,
            long,
            dist_meters: None,
        }
    }

    pub fn location(&self) -> GpsPoint {
        GpsPoint::new(self.lat, self.long)
    }
}

// ============================================================================
// Tests
// ============================================================================
