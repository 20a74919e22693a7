//! # Ride Session
//!
//! The ride lifecycle state machine.
//!
//! ```text
//!            start / resume              finish (ok)
//!   Idle ────────────────────▶ Active ───────────────▶ Finalizing ──▶ Idle
//!                                 ▲                        │
//!                                 └──── finish (failed) ───┘
//! ```
//!
//! While a ride is active every position sample from the trace watch is
//! appended to an in-memory trace, untouched. Finishing sends that trace to
//! the map-matching service, takes the best matching and writes it onto the
//! ride record together with `finished_at`. If either call fails the ride
//! goes back to `Active` with the trace intact, so finishing can be retried.
//!
//! Only one ride per rider may be open at a time. The store does not enforce
//! this; `start` refuses while a ride is active and `resume` reattaches to
//! an open ride instead of inserting a new one.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};

use crate::controller::Collaborators;
use crate::error::{OptionExt, RideError, Result};
use crate::geo_utils::polyline_length;
use crate::location::{LocationFeed, PositionWatch};
use crate::notice::{Notice, Notifier};
use crate::routing::RoutingService;
use crate::store::{Filter, PersistenceStore, RIDES_TABLE};
use crate::{GpsPoint, LngLat, NewRide, Ride, RideConfig, RideFinish};

/// Map matching needs at least two points to produce a line.
pub const MIN_MATCH_POINTS: usize = 2;

/// Source of "now" for ride timestamps.
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Lifecycle state of the ride session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RideState {
    /// No ride in progress
    Idle,
    /// Ride in progress, trace accumulating
    Active,
    /// Reconciling and persisting the trace
    Finalizing,
}

/// Owner of the current ride, its raw trace and its trace subscription.
pub struct RideSession {
    user_id: String,
    store: Arc<dyn PersistenceStore>,
    routing: Arc<dyn RoutingService>,
    location: LocationFeed,
    notifier: Arc<dyn Notifier>,
    trace_displacement_m: f64,
    clock: Clock,

    state: RideState,
    ride: Option<Ride>,
    /// Raw `[lng, lat]` samples in arrival order
    trace: Vec<LngLat>,
    /// Matched geometry shown while the finish is being persisted
    matched: Option<Vec<LngLat>>,
    watch: Option<PositionWatch>,
    resume_attempted: bool,
}

impl RideSession {
    pub fn new(user_id: impl Into<String>, collaborators: &Collaborators, config: &RideConfig) -> Self {
        Self {
            user_id: user_id.into(),
            store: Arc::clone(&collaborators.store),
            routing: Arc::clone(&collaborators.routing),
            location: collaborators.location.clone(),
            notifier: Arc::clone(&collaborators.notifier),
            trace_displacement_m: config.trace_displacement_m,
            clock: Arc::new(Utc::now),
            state: RideState::Idle,
            ride: None,
            trace: Vec::new(),
            matched: None,
            watch: None,
            resume_attempted: false,
        }
    }

    /// Replace the clock used for `started_at` / `finished_at`.
    pub fn set_clock(&mut self, clock: Clock) {
        self.clock = clock;
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn state(&self) -> RideState {
        self.state
    }

    /// The ride in progress, if any.
    pub fn ride(&self) -> Option<&Ride> {
        self.ride.as_ref()
    }

    /// Raw trace recorded since the ride started (or was resumed).
    pub fn trace(&self) -> &[LngLat] {
        &self.trace
    }

    /// Route to display: the matched geometry once available, otherwise
    /// the raw trace.
    pub fn route(&self) -> &[LngLat] {
        self.matched.as_deref().unwrap_or(self.trace.as_slice())
    }

    /// Whether a live trace subscription is attached.
    pub fn is_tracking(&self) -> bool {
        self.watch.as_ref().is_some_and(|w| !w.is_removed())
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Reattach to a ride left open by an earlier mount.
    ///
    /// Looks up the rider's ride with a null `finished_at`. When found, the
    /// session goes straight to `Active` with an empty trace; samples from
    /// before the resume point are not recovered. Only the first call per
    /// session queries the store.
    pub async fn resume(&mut self) -> Result<Option<Ride>> {
        if self.resume_attempted || self.state != RideState::Idle {
            return Ok(self.ride.clone());
        }
        self.resume_attempted = true;

        let filters = [
            Filter::eq("user_id", self.user_id.as_str()),
            Filter::is_null("finished_at"),
        ];
        let found = match self.store.select_one(RIDES_TABLE, &filters).await {
            Ok(found) => found,
            Err(e) => return Err(self.fail("Failed to load your active ride", e)),
        };
        let Some(record) = found else {
            debug!("[RideSession] No open ride for {}", self.user_id);
            return Ok(None);
        };
        let ride: Ride = match serde_json::from_value(record) {
            Ok(ride) => ride,
            Err(e) => return Err(self.fail("Failed to load your active ride", e.into())),
        };

        info!(
            "[RideSession] Resuming ride {} on scooter {} (started {})",
            ride.id, ride.scooter_id, ride.started_at
        );
        self.enter_active(ride.clone()).await;
        Ok(Some(ride))
    }

    /// Start a ride on `scooter_id`.
    ///
    /// Fails with `Conflict` while another ride is in progress, leaving it
    /// untouched. A store failure leaves the session `Idle`.
    pub async fn start(&mut self, scooter_id: i64) -> Result<Ride> {
        if self.state != RideState::Idle {
            warn!(
                "[RideSession] Start on scooter {} refused, ride already {:?}",
                scooter_id, self.state
            );
            let err = RideError::conflict("Cannot start a new ride while another one is in progress");
            self.notifier.notify(Notice::new(
                "Cannot start a new ride while another one is in progress",
            ));
            return Err(err);
        }

        let new_ride = NewRide {
            user_id: self.user_id.clone(),
            scooter_id,
            started_at: (self.clock)(),
        };
        let ride = match self.insert_ride(&new_ride).await {
            Ok(ride) => ride,
            Err(e) => return Err(self.fail("Failed to start the ride", e)),
        };

        info!("[RideSession] Started ride {} on scooter {}", ride.id, scooter_id);
        self.enter_active(ride.clone()).await;
        Ok(ride)
    }

    async fn insert_ride(&self, new_ride: &NewRide) -> Result<Ride> {
        let record = serde_json::to_value(new_ride)?;
        let stored = self.store.insert(RIDES_TABLE, record).await?;
        Ok(serde_json::from_value(stored)?)
    }

    /// Finish the ride in progress.
    ///
    /// A no-op returning `Ok(None)` when no ride is in progress. Otherwise
    /// the trace is matched, the best matching is persisted and the finished
    /// ride is returned. On failure the session rolls back to `Active` and
    /// keeps the trace.
    pub async fn finish(&mut self) -> Result<Option<Ride>> {
        let ride_id = match (&self.ride, self.state) {
            (Some(ride), RideState::Active | RideState::Finalizing) => ride.id,
            _ => {
                debug!("[RideSession] Finish with no ride in progress, ignoring");
                return Ok(None);
            }
        };

        if self.trace.len() < MIN_MATCH_POINTS {
            let err = RideError::validation(format!(
                "ride {} has {} recorded positions, at least {} required",
                ride_id,
                self.trace.len(),
                MIN_MATCH_POINTS
            ));
            return Err(self.fail("Failed to finish the ride", err));
        }

        self.state = RideState::Finalizing;
        info!(
            "[RideSession] Finishing ride {} with {} trace points ({:.0}m raw)",
            ride_id,
            self.trace.len(),
            polyline_length(&self.trace)
        );

        match self.reconcile(ride_id).await {
            Ok(finish) => {
                let mut ride = self.ride.take();
                if let Some(ref mut ride) = ride {
                    finish.apply_to(ride);
                }
                self.trace = finish.route_coords;
                self.matched = None;
                self.state = RideState::Idle;
                self.release_tracking();
                info!(
                    "[RideSession] Ride {} finished: {:.0}m in {:.0}s",
                    ride_id, finish.route_distance, finish.route_duration
                );
                Ok(ride)
            }
            Err(e) => {
                self.matched = None;
                self.state = RideState::Active;
                Err(self.fail("Failed to finish the ride", e))
            }
        }
    }

    /// Match the trace and persist the result onto ride `ride_id`.
    async fn reconcile(&mut self, ride_id: i64) -> Result<RideFinish> {
        let matched = self.routing.match_route(&self.trace).await?;
        let route = matched
            .best()
            .ok_or_routing("no matching route for the recorded trace")?;
        debug!(
            "[RideSession] Matched {} trace points onto {} route points",
            self.trace.len(),
            route.coordinates().len()
        );

        let finish = RideFinish::from_route(route, (self.clock)());
        self.matched = Some(finish.route_coords.clone());

        let patch = serde_json::to_value(&finish)?;
        self.store.update(RIDES_TABLE, patch, ride_id).await?;
        Ok(finish)
    }

    // ========================================================================
    // Trace Accumulation
    // ========================================================================

    /// Append one position sample to the trace. Ignored unless `Active`.
    pub fn record_sample(&mut self, sample: GpsPoint) -> bool {
        if self.state != RideState::Active {
            return false;
        }
        self.trace.push(sample.to_lng_lat());
        true
    }

    /// Record every sample already delivered on the trace watch.
    pub fn poll_trace(&mut self) -> usize {
        let mut recorded = 0;
        while self.state == RideState::Active {
            let Some(sample) = self.watch.as_mut().and_then(PositionWatch::try_next) else {
                break;
            };
            self.record_sample(sample);
            recorded += 1;
        }
        recorded
    }

    /// Wait for the next sample on the trace watch and record it.
    ///
    /// Returns `None` when there is no live watch.
    pub async fn next_sample(&mut self) -> Option<GpsPoint> {
        let sample = self.watch.as_mut()?.next().await?;
        self.record_sample(sample);
        Some(sample)
    }

    // ========================================================================
    // Subscriptions
    // ========================================================================

    async fn enter_active(&mut self, ride: Ride) {
        self.ride = Some(ride);
        self.trace.clear();
        self.matched = None;
        self.state = RideState::Active;
        self.attach_tracking().await;
    }

    /// Re-establish the trace watch for the current state.
    ///
    /// The previous watch is always released first. A new one is attached
    /// only while `Active` and location access is granted.
    pub async fn attach_tracking(&mut self) {
        self.release_tracking();
        if self.state != RideState::Active {
            return;
        }
        if !self.location.gate().is_granted() {
            debug!("[RideSession] Location not granted, trace watch not attached");
            return;
        }
        match self.location.subscribe(self.trace_displacement_m).await {
            Ok(watch) => self.watch = Some(watch),
            Err(e) => warn!("[RideSession] Failed to attach trace watch: {}", e),
        }
    }

    /// Release the trace watch, if any.
    pub fn release_tracking(&mut self) {
        if let Some(mut watch) = self.watch.take() {
            watch.remove();
        }
    }

    /// Release the trace watch and allow the next mount to look up an open
    /// ride again.
    pub fn unmount(&mut self) {
        self.release_tracking();
        self.resume_attempted = false;
    }

    fn fail(&self, title: &str, err: RideError) -> RideError {
        warn!(
            "[RideSession] {}: {} (retriable: {})",
            title,
            err,
            err.is_retriable()
        );
        self.notifier
            .notify(Notice::with_message(title, err.to_string()));
        err
    }
}

impl fmt::Debug for RideSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RideSession")
            .field("user_id", &self.user_id)
            .field("state", &self.state)
            .field("ride", &self.ride)
            .field("trace_len", &self.trace.len())
            .field("tracking", &self.is_tracking())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::location::{GeolocationSource, PermissionStatus};
    use crate::notice::CollectingNotifier;
    use crate::routing::{Directions, MatchedRoutes, Route, RouteGeometry};
    use crate::store::{MemoryStore, StoreCall};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;
    use tokio::sync::mpsc::UnboundedSender;

    struct StubRouting {
        matched: Mutex<Option<Result<MatchedRoutes>>>,
    }

    #[async_trait]
    impl RoutingService for StubRouting {
        async fn directions(&self, _origin: LngLat, _destination: LngLat) -> Result<Directions> {
            Ok(Directions::default())
        }

        async fn match_route(&self, _coordinates: &[LngLat]) -> Result<MatchedRoutes> {
            self.matched
                .lock()
                .unwrap()
                .take()
                .unwrap_or_else(|| Err(RideError::routing("no scripted response")))
        }
    }

    #[derive(Default)]
    struct StubLocation {
        senders: Mutex<Vec<UnboundedSender<GpsPoint>>>,
    }

    #[async_trait]
    impl GeolocationSource for StubLocation {
        async fn request_permission(&self) -> Result<PermissionStatus> {
            Ok(PermissionStatus::Granted)
        }

        async fn current_position(&self) -> Result<GpsPoint> {
            Ok(GpsPoint::new(37.78, -122.40))
        }

        async fn watch(&self, _distance_interval_m: f64) -> Result<PositionWatch> {
            let (tx, watch) = PositionWatch::channel();
            self.senders.lock().unwrap().push(tx);
            Ok(watch)
        }
    }

    struct Fixture {
        session: RideSession,
        store: Arc<MemoryStore>,
        routing: Arc<StubRouting>,
        location: Arc<StubLocation>,
        notifier: Arc<CollectingNotifier>,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let routing = Arc::new(StubRouting {
            matched: Mutex::new(None),
        });
        let location = Arc::new(StubLocation::default());
        let notifier = Arc::new(CollectingNotifier::new());
        let feed = LocationFeed::new(location.clone());
        feed.request_access(notifier.as_ref()).await;

        let collaborators = Collaborators {
            store: store.clone(),
            routing: routing.clone(),
            location: feed,
            notifier: notifier.clone(),
        };
        let session = RideSession::new("rider-1", &collaborators, &RideConfig::default());
        Fixture {
            session,
            store,
            routing,
            location,
            notifier,
        }
    }

    fn matched(coords: Vec<LngLat>, duration: f64, distance: f64) -> MatchedRoutes {
        MatchedRoutes {
            matchings: vec![Route {
                geometry: RouteGeometry { coordinates: coords },
                duration,
                distance,
            }],
        }
    }

    #[tokio::test]
    async fn test_start_attaches_trace_watch() {
        let mut f = fixture().await;
        let ride = f.session.start(7).await.unwrap();

        assert_eq!(ride.scooter_id, 7);
        assert_eq!(ride.user_id, "rider-1");
        assert_eq!(f.session.state(), RideState::Active);
        assert!(f.session.is_tracking());
        assert_eq!(f.location.senders.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_samples_recorded_in_order() {
        let mut f = fixture().await;
        f.session.start(7).await.unwrap();

        let tx = f.location.senders.lock().unwrap()[0].clone();
        let sent = [37.78, 37.781, 37.782, 37.783];
        for lat in sent {
            tx.send(GpsPoint::new(lat, -122.40)).unwrap();
        }
        assert_eq!(f.session.poll_trace(), 4);
        let lats: Vec<f64> = f.session.trace().iter().map(|c| c[1]).collect();
        assert_eq!(lats, sent);
        assert_eq!(f.session.route(), f.session.trace());
    }

    #[tokio::test]
    async fn test_samples_ignored_when_idle() {
        let mut f = fixture().await;
        assert!(!f.session.record_sample(GpsPoint::new(37.78, -122.40)));
        assert!(f.session.trace().is_empty());
    }

    #[tokio::test]
    async fn test_finish_requires_two_points() {
        let mut f = fixture().await;
        f.session.start(7).await.unwrap();
        f.session.record_sample(GpsPoint::new(37.78, -122.40));

        let err = f.session.finish().await.unwrap_err();
        assert!(matches!(err, RideError::Validation { .. }));
        assert_eq!(f.session.state(), RideState::Active);
        assert_eq!(f.session.trace().len(), 1);
        assert_eq!(f.notifier.titles(), vec!["Failed to finish the ride"]);
    }

    #[tokio::test]
    async fn test_finish_without_matchings_rolls_back() {
        let mut f = fixture().await;
        f.session.start(7).await.unwrap();
        f.session.record_sample(GpsPoint::new(37.78, -122.40));
        f.session.record_sample(GpsPoint::new(37.79, -122.42));
        *f.routing.matched.lock().unwrap() = Some(Ok(MatchedRoutes::default()));

        let err = f.session.finish().await.unwrap_err();
        assert!(matches!(err, RideError::RoutingService { .. }));
        assert_eq!(f.session.state(), RideState::Active);
        assert_eq!(f.session.trace().len(), 2);
        // No update was attempted
        assert!(!f
            .store
            .calls()
            .iter()
            .any(|c| matches!(c, StoreCall::Update { .. })));
    }

    #[tokio::test]
    async fn test_finish_success_releases_watch() {
        let mut f = fixture().await;
        f.session.start(7).await.unwrap();
        f.session.record_sample(GpsPoint::new(37.78, -122.40));
        f.session.record_sample(GpsPoint::new(37.79, -122.42));
        let geometry = vec![[-122.40, 37.78], [-122.42, 37.79]];
        *f.routing.matched.lock().unwrap() = Some(Ok(matched(geometry.clone(), 120.0, 450.0)));

        let ride = f.session.finish().await.unwrap().unwrap();
        assert!(ride.is_finished());
        assert_eq!(ride.route_coords, Some(geometry.clone()));
        assert_eq!(f.session.state(), RideState::Idle);
        assert!(f.session.ride().is_none());
        assert!(!f.session.is_tracking());
        assert_eq!(f.session.route(), geometry.as_slice());

        let stored = f.store.records(RIDES_TABLE);
        assert_eq!(stored[0]["routeDistance"], json!(450.0));
    }

    #[tokio::test]
    async fn test_resume_only_queries_once() {
        let mut f = fixture().await;
        assert_eq!(f.session.resume().await.unwrap(), None);
        assert_eq!(f.session.resume().await.unwrap(), None);

        let lookups = f
            .store
            .calls()
            .iter()
            .filter(|c| matches!(c, StoreCall::SelectOne { .. }))
            .count();
        assert_eq!(lookups, 1);
    }
}
