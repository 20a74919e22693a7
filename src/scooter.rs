//! # Scooter Selection
//!
//! Holds the list of nearby scooters, the one the rider selected, the
//! directions towards it and the proximity monitor watching it.
//!
//! ## Selection epochs
//!
//! Every call to [`ScooterSelection::select`] bumps a monotonically
//! increasing epoch. The directions fetch for a selection is handed out as a
//! detached [`DirectionsTicket`] stamped with that epoch, so the caller may
//! run it concurrently with later selections. When the outcome comes back,
//! [`ScooterSelection::apply_directions`] only accepts it if its epoch is
//! still current; anything older is reported as [`SelectionUpdate::Stale`]
//! and dropped.

use std::fmt;
use std::sync::Arc;

use log::{debug, info, warn};
use serde_json::json;

use crate::controller::Collaborators;
use crate::error::{RideError, Result};
use crate::location::LocationFeed;
use crate::notice::{Notice, Notifier};
use crate::proximity::ProximityMonitor;
use crate::routing::{Directions, RoutingService};
use crate::store::{PersistenceStore, NEARBY_SCOOTERS};
use crate::{GpsPoint, LngLat, RideConfig, Scooter};

/// Pending directions fetch for one selection epoch.
pub struct DirectionsTicket {
    epoch: u64,
    destination: GpsPoint,
    routing: Arc<dyn RoutingService>,
    location: LocationFeed,
}

impl DirectionsTicket {
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn destination(&self) -> GpsPoint {
        self.destination
    }

    /// Fetch directions from the current device position to the scooter.
    ///
    /// Owns everything it needs, so it can be spawned or raced freely.
    pub async fn fetch(self) -> DirectionsOutcome {
        let result = match self.location.current_position().await {
            Ok(origin) => {
                self.routing
                    .directions(origin.to_lng_lat(), self.destination.to_lng_lat())
                    .await
            }
            Err(e) => Err(e),
        };
        DirectionsOutcome {
            epoch: self.epoch,
            result,
        }
    }
}

impl fmt::Debug for DirectionsTicket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DirectionsTicket")
            .field("epoch", &self.epoch)
            .field("destination", &self.destination)
            .finish()
    }
}

/// Result of a [`DirectionsTicket`], tagged with its selection epoch.
#[derive(Debug, Clone)]
pub struct DirectionsOutcome {
    pub epoch: u64,
    pub result: Result<Directions>,
}

/// What happened to a directions outcome handed back to the selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionUpdate {
    /// The outcome belonged to the current selection and was stored
    Applied,
    /// A newer selection superseded it; it was discarded
    Stale,
}

/// Scooter list, current selection, directions and proximity.
pub struct ScooterSelection {
    store: Arc<dyn PersistenceStore>,
    routing: Arc<dyn RoutingService>,
    location: LocationFeed,
    notifier: Arc<dyn Notifier>,
    proximity_displacement_m: f64,
    search_radius_m: f64,

    nearby_scooters: Vec<Scooter>,
    selected: Option<Scooter>,
    epoch: u64,
    direction: Option<Directions>,
    proximity: ProximityMonitor,
}

impl ScooterSelection {
    pub fn new(collaborators: &Collaborators, config: &RideConfig) -> Self {
        Self {
            store: Arc::clone(&collaborators.store),
            routing: Arc::clone(&collaborators.routing),
            location: collaborators.location.clone(),
            notifier: Arc::clone(&collaborators.notifier),
            proximity_displacement_m: config.proximity_displacement_m,
            search_radius_m: config.search_radius_m,
            nearby_scooters: Vec::new(),
            selected: None,
            epoch: 0,
            direction: None,
            proximity: ProximityMonitor::new(config.nearby_threshold_m),
        }
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn nearby_scooters(&self) -> &[Scooter] {
        &self.nearby_scooters
    }

    pub fn selected(&self) -> Option<&Scooter> {
        self.selected.as_ref()
    }

    /// Current selection epoch. Starts at 0 and grows with every selection.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn direction(&self) -> Option<&Directions> {
        self.direction.as_ref()
    }

    /// Geometry of the primary route towards the selected scooter.
    pub fn direction_coordinates(&self) -> Option<&[LngLat]> {
        self.direction
            .as_ref()
            .and_then(Directions::primary)
            .map(|route| route.coordinates())
    }

    /// Duration of the primary route in seconds.
    pub fn duration(&self) -> Option<f64> {
        self.direction.as_ref()?.primary().map(|r| r.duration)
    }

    /// Distance of the primary route in meters.
    pub fn distance(&self) -> Option<f64> {
        self.direction.as_ref()?.primary().map(|r| r.distance)
    }

    pub fn is_nearby(&self) -> bool {
        self.proximity.is_nearby()
    }

    pub fn proximity(&self) -> &ProximityMonitor {
        &self.proximity
    }

    // ========================================================================
    // Nearby Search
    // ========================================================================

    /// Load scooters around the current device position.
    pub async fn fetch_nearby(&mut self) -> Result<&[Scooter]> {
        let origin = match self.location.current_position().await {
            Ok(origin) => origin,
            Err(e) => return Err(self.fail("Failed to fetch scooters", e)),
        };

        let args = json!({
            "lat": origin.latitude,
            "long": origin.longitude,
            "max_dist_meters": self.search_radius_m,
        });
        let records = match self.store.call_procedure(NEARBY_SCOOTERS, args).await {
            Ok(records) => records,
            Err(e) => return Err(self.fail("Failed to fetch scooters", e)),
        };
        let scooters = match records
            .into_iter()
            .map(serde_json::from_value)
            .collect::<std::result::Result<Vec<Scooter>, _>>()
        {
            Ok(scooters) => scooters,
            Err(e) => return Err(self.fail("Failed to fetch scooters", e.into())),
        };

        info!(
            "[ScooterSelection] {} scooters within {:.0}m",
            scooters.len(),
            self.search_radius_m
        );
        self.nearby_scooters = scooters;
        Ok(&self.nearby_scooters)
    }

    // ========================================================================
    // Selection
    // ========================================================================

    /// Change the selected scooter.
    ///
    /// The previous proximity watch is released before anything else. With
    /// a scooter, nearby resets, a fresh proximity watch is attached (when
    /// location access allows) and a ticket for the directions fetch is
    /// returned. With `None`, directions and nearby are cleared and no
    /// fetch is needed.
    pub async fn select(&mut self, scooter: Option<Scooter>) -> Option<DirectionsTicket> {
        let Some(scooter) = scooter else {
            self.clear();
            return None;
        };

        self.epoch += 1;
        self.proximity.clear();
        self.direction = None;

        let destination = scooter.location();
        info!(
            "[ScooterSelection] Selected scooter {} (epoch {})",
            scooter.id, self.epoch
        );
        self.selected = Some(scooter);

        let watch = if self.location.gate().is_granted() {
            match self.location.subscribe(self.proximity_displacement_m).await {
                Ok(watch) => Some(watch),
                Err(e) => {
                    warn!("[ScooterSelection] Failed to attach proximity watch: {}", e);
                    None
                }
            }
        } else {
            None
        };
        self.proximity.retarget(destination, watch);

        Some(DirectionsTicket {
            epoch: self.epoch,
            destination,
            routing: Arc::clone(&self.routing),
            location: self.location.clone(),
        })
    }

    /// Hand back the outcome of a directions ticket.
    ///
    /// Outcomes from superseded selections are discarded, errors included.
    /// A failure for the current selection raises a notice and is returned.
    pub fn apply_directions(&mut self, outcome: DirectionsOutcome) -> Result<SelectionUpdate> {
        if outcome.epoch != self.epoch || self.selected.is_none() {
            debug!(
                "[ScooterSelection] Discarding directions for epoch {} (current {})",
                outcome.epoch, self.epoch
            );
            return Ok(SelectionUpdate::Stale);
        }

        match outcome.result {
            Ok(directions) => {
                if let Some(route) = directions.primary() {
                    debug!(
                        "[ScooterSelection] Directions: {:.0}m, {:.0}s",
                        route.distance, route.duration
                    );
                }
                self.direction = Some(directions);
                Ok(SelectionUpdate::Applied)
            }
            Err(e) => Err(self.fail("Failed to fetch directions", e)),
        }
    }

    /// Select a scooter and fetch its directions in one step.
    pub async fn select_and_route(&mut self, scooter: Option<Scooter>) -> Result<SelectionUpdate> {
        match self.select(scooter).await {
            Some(ticket) => {
                let outcome = ticket.fetch().await;
                self.apply_directions(outcome)
            }
            None => Ok(SelectionUpdate::Applied),
        }
    }

    // ========================================================================
    // Proximity
    // ========================================================================

    /// Evaluate every proximity sample already delivered.
    pub fn poll_proximity(&mut self) -> bool {
        self.proximity.poll()
    }

    /// Wait for the next proximity sample and evaluate it.
    pub async fn next_proximity(&mut self) -> Option<bool> {
        self.proximity.next().await
    }

    /// Feed a position sample from outside the proximity watch.
    pub fn observe(&mut self, sample: GpsPoint) -> bool {
        self.proximity.observe(sample)
    }

    /// Drop the selection, its directions and its proximity watch.
    ///
    /// Any directions fetch still in flight becomes stale.
    pub fn clear(&mut self) {
        self.epoch += 1;
        self.proximity.clear();
        self.direction = None;
        if let Some(previous) = self.selected.take() {
            debug!(
                "[ScooterSelection] Cleared selection of scooter {} (epoch {})",
                previous.id, self.epoch
            );
        }
    }

    fn fail(&self, title: &str, err: RideError) -> RideError {
        warn!("[ScooterSelection] {}: {}", title, err);
        self.notifier
            .notify(Notice::with_message(title, err.to_string()));
        err
    }
}

impl fmt::Debug for ScooterSelection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScooterSelection")
            .field("selected", &self.selected)
            .field("epoch", &self.epoch)
            .field("nearby", &self.proximity.is_nearby())
            .field("scooters", &self.nearby_scooters.len())
            .finish()
    }
}
