//! Shared fakes for the integration tests.
//!
//! Every collaborator is scriptable and records how it was called, so the
//! tests can assert on traffic as well as on state.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::mpsc::{self, UnboundedSender};

use ride_tracker::geo_utils::haversine_distance;
use ride_tracker::store::StoreCall;
use ride_tracker::{
    CollectingNotifier, Collaborators, Directions, Filter, GeolocationSource, GpsPoint,
    LocationFeed, LngLat, MatchedRoutes, MemoryStore, PermissionStatus, PersistenceStore,
    PositionWatch, Result, RideConfig, RideController, RideError, Route, RouteGeometry,
    RoutingService,
};

pub const USER_ID: &str = "8a1c-rider";

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

// ============================================================================
// Geolocation
// ============================================================================

struct WatchEntry {
    distance_interval_m: f64,
    sender: UnboundedSender<GpsPoint>,
}

/// Geolocation source that hands out channel-backed watches.
pub struct FakeGeolocation {
    status: Mutex<PermissionStatus>,
    position: Mutex<GpsPoint>,
    watches: Mutex<Vec<WatchEntry>>,
    released: Arc<AtomicUsize>,
    permission_requests: AtomicUsize,
}

impl FakeGeolocation {
    pub fn new(status: PermissionStatus, position: GpsPoint) -> Self {
        Self {
            status: Mutex::new(status),
            position: Mutex::new(position),
            watches: Mutex::new(Vec::new()),
            released: Arc::new(AtomicUsize::new(0)),
            permission_requests: AtomicUsize::new(0),
        }
    }

    pub fn set_position(&self, position: GpsPoint) {
        *self.position.lock().unwrap() = position;
    }

    /// Deliver a sample to every watch whose consumer is still listening.
    pub fn push(&self, sample: GpsPoint) -> usize {
        self.watches
            .lock()
            .unwrap()
            .iter()
            .filter(|entry| entry.sender.send(sample).is_ok())
            .count()
    }

    /// Deliver a sample to watches created with the given interval only.
    pub fn push_to(&self, distance_interval_m: f64, sample: GpsPoint) -> usize {
        self.watches
            .lock()
            .unwrap()
            .iter()
            .filter(|entry| entry.distance_interval_m == distance_interval_m)
            .filter(|entry| entry.sender.send(sample).is_ok())
            .count()
    }

    /// Intervals of all watches not yet released.
    pub fn live_watches(&self) -> Vec<f64> {
        self.watches
            .lock()
            .unwrap()
            .iter()
            .filter(|entry| !entry.sender.is_closed())
            .map(|entry| entry.distance_interval_m)
            .collect()
    }

    pub fn watches_created(&self) -> usize {
        self.watches.lock().unwrap().len()
    }

    pub fn releases(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }

    pub fn permission_requests(&self) -> usize {
        self.permission_requests.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GeolocationSource for FakeGeolocation {
    async fn request_permission(&self) -> Result<PermissionStatus> {
        self.permission_requests.fetch_add(1, Ordering::SeqCst);
        Ok(*self.status.lock().unwrap())
    }

    async fn current_position(&self) -> Result<GpsPoint> {
        Ok(*self.position.lock().unwrap())
    }

    async fn watch(&self, distance_interval_m: f64) -> Result<PositionWatch> {
        let (tx, rx) = mpsc::unbounded_channel();
        let released = Arc::clone(&self.released);
        self.watches.lock().unwrap().push(WatchEntry {
            distance_interval_m,
            sender: tx,
        });
        Ok(PositionWatch::new(rx, move || {
            released.fetch_add(1, Ordering::SeqCst);
        }))
    }
}

// ============================================================================
// Routing
// ============================================================================

/// Routing service with scripted matchings.
///
/// Directions are computed from the request: a straight line from origin to
/// destination, so each outcome identifies its destination.
#[derive(Default)]
pub struct ScriptedRouting {
    matchings: Mutex<VecDeque<Result<MatchedRoutes>>>,
    match_requests: Mutex<Vec<Vec<LngLat>>>,
    directions_requests: Mutex<Vec<(LngLat, LngLat)>>,
    fail_directions: AtomicBool,
}

impl ScriptedRouting {
    pub fn push_matching(&self, response: Result<MatchedRoutes>) {
        self.matchings.lock().unwrap().push_back(response);
    }

    pub fn fail_directions(&self, fail: bool) {
        self.fail_directions.store(fail, Ordering::SeqCst);
    }

    pub fn match_requests(&self) -> Vec<Vec<LngLat>> {
        self.match_requests.lock().unwrap().clone()
    }

    pub fn directions_requests(&self) -> Vec<(LngLat, LngLat)> {
        self.directions_requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl RoutingService for ScriptedRouting {
    async fn directions(&self, origin: LngLat, destination: LngLat) -> Result<Directions> {
        self.directions_requests
            .lock()
            .unwrap()
            .push((origin, destination));
        if self.fail_directions.load(Ordering::SeqCst) {
            return Err(RideError::RoutingService {
                message: "No route found".to_string(),
                status_code: Some(422),
            });
        }
        let distance = haversine_distance(
            &GpsPoint::from_lng_lat(origin),
            &GpsPoint::from_lng_lat(destination),
        );
        Ok(Directions {
            routes: vec![route(vec![origin, destination], distance / 4.0, distance)],
        })
    }

    async fn match_route(&self, coordinates: &[LngLat]) -> Result<MatchedRoutes> {
        self.match_requests.lock().unwrap().push(coordinates.to_vec());
        self.matchings
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(RideError::routing("no scripted matching")))
    }
}

pub fn route(coordinates: Vec<LngLat>, duration: f64, distance: f64) -> Route {
    Route {
        geometry: RouteGeometry { coordinates },
        duration,
        distance,
    }
}

pub fn matching(coordinates: Vec<LngLat>, duration: f64, distance: f64) -> MatchedRoutes {
    MatchedRoutes {
        matchings: vec![route(coordinates, duration, distance)],
    }
}

// ============================================================================
// Store
// ============================================================================

/// In-memory store whose operations can be switched to fail.
#[derive(Default)]
pub struct FlakyStore {
    pub inner: MemoryStore,
    pub fail_insert: AtomicBool,
    pub fail_update: AtomicBool,
    pub fail_select: AtomicBool,
    pub fail_procedure: AtomicBool,
}

impl FlakyStore {
    pub fn calls(&self) -> Vec<StoreCall> {
        self.inner.calls()
    }

    pub fn records(&self, table: &str) -> Vec<Value> {
        self.inner.records(table)
    }

    pub fn inserts(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, StoreCall::Insert { .. }))
            .count()
    }

    pub fn updates(&self) -> Vec<(Value, i64)> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                StoreCall::Update { patch, id, .. } => Some((patch, id)),
                _ => None,
            })
            .collect()
    }

    fn check(flag: &AtomicBool, what: &str) -> Result<()> {
        if flag.load(Ordering::SeqCst) {
            Err(RideError::persistence(format!("{} unavailable", what)))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl PersistenceStore for FlakyStore {
    async fn insert(&self, table: &str, record: Value) -> Result<Value> {
        Self::check(&self.fail_insert, "insert")?;
        self.inner.insert(table, record).await
    }

    async fn update(&self, table: &str, patch: Value, id: i64) -> Result<()> {
        Self::check(&self.fail_update, "update")?;
        self.inner.update(table, patch, id).await
    }

    async fn select_one(&self, table: &str, filters: &[Filter]) -> Result<Option<Value>> {
        Self::check(&self.fail_select, "select")?;
        self.inner.select_one(table, filters).await
    }

    async fn call_procedure(&self, name: &str, args: Value) -> Result<Vec<Value>> {
        Self::check(&self.fail_procedure, "procedure")?;
        self.inner.call_procedure(name, args).await
    }
}

// ============================================================================
// Harness
// ============================================================================

pub struct Harness {
    pub controller: RideController,
    pub store: Arc<FlakyStore>,
    pub routing: Arc<ScriptedRouting>,
    pub geo: Arc<FakeGeolocation>,
    pub notifier: Arc<CollectingNotifier>,
}

impl Harness {
    pub fn new(status: PermissionStatus) -> Self {
        Self::with_store(status, FlakyStore::default())
    }

    pub fn with_store(status: PermissionStatus, store: FlakyStore) -> Self {
        init_logging();
        let store = Arc::new(store);
        let routing = Arc::new(ScriptedRouting::default());
        let geo = Arc::new(FakeGeolocation::new(status, GpsPoint::new(37.7800, -122.4000)));
        let notifier = Arc::new(CollectingNotifier::new());

        let collaborators = Collaborators {
            store: store.clone(),
            routing: routing.clone(),
            location: LocationFeed::new(geo.clone()),
            notifier: notifier.clone(),
        };
        let controller = RideController::new(USER_ID, collaborators, &RideConfig::default())
            .expect("default config is valid");

        Self {
            controller,
            store,
            routing,
            geo,
            notifier,
        }
    }

    /// Freeze the ride clock at `at` (RFC 3339).
    pub fn fix_clock(&mut self, at: &str) -> DateTime<Utc> {
        let now = at.parse::<DateTime<Utc>>().expect("valid timestamp");
        self.controller
            .ride_mut()
            .set_clock(Arc::new(move || now));
        now
    }
}
