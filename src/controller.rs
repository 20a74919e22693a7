//! # Ride Controller
//!
//! Explicit owner of everything the app keeps about the rider: the shared
//! permission gate, the ride session and the scooter selection. Hosts
//! construct one per signed-in rider and pass it by reference to whatever
//! layer needs it.
//!
//! Mount order matters: permission first, so the resumed ride can attach its
//! trace watch and the nearby search has a position to search from.

use std::fmt;
use std::sync::Arc;

use log::{debug, info};

use crate::error::Result;
use crate::location::{LocationFeed, PermissionState};
use crate::notice::Notifier;
use crate::ride::RideSession;
use crate::routing::RoutingService;
use crate::scooter::ScooterSelection;
use crate::store::PersistenceStore;
use crate::RideConfig;

/// External systems the core talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub store: Arc<dyn PersistenceStore>,
    pub routing: Arc<dyn RoutingService>,
    pub location: LocationFeed,
    pub notifier: Arc<dyn Notifier>,
}

impl fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collaborators")
            .field("location", &self.location)
            .finish_non_exhaustive()
    }
}

/// Ride and scooter state for one rider.
#[derive(Debug)]
pub struct RideController {
    collaborators: Collaborators,
    ride: RideSession,
    scooters: ScooterSelection,
    mounted: bool,
}

impl RideController {
    /// Build a controller for `user_id`. Fails on invalid configuration.
    pub fn new(
        user_id: impl Into<String>,
        collaborators: Collaborators,
        config: &RideConfig,
    ) -> Result<Self> {
        config.validate()?;
        let ride = RideSession::new(user_id, &collaborators, config);
        let scooters = ScooterSelection::new(&collaborators, config);
        Ok(Self {
            collaborators,
            ride,
            scooters,
            mounted: false,
        })
    }

    pub fn ride(&self) -> &RideSession {
        &self.ride
    }

    pub fn ride_mut(&mut self) -> &mut RideSession {
        &mut self.ride
    }

    pub fn scooters(&self) -> &ScooterSelection {
        &self.scooters
    }

    pub fn scooters_mut(&mut self) -> &mut ScooterSelection {
        &mut self.scooters
    }

    pub fn permission(&self) -> PermissionState {
        self.collaborators.location.permission()
    }

    pub fn is_mounted(&self) -> bool {
        self.mounted
    }

    /// Run the mount sequence once: ask for location access, reattach to an
    /// open ride, then load nearby scooters if location is available.
    ///
    /// Failures have already been surfaced as notices by the component that
    /// hit them, so mounting itself does not fail.
    pub async fn mount(&mut self) -> PermissionState {
        if self.mounted {
            return self.permission();
        }
        self.mounted = true;

        let permission = self
            .collaborators
            .location
            .request_access(self.collaborators.notifier.as_ref())
            .await;

        if let Ok(Some(ride)) = self.ride.resume().await {
            info!("[RideController] Reattached to ride {}", ride.id);
        }
        if !self.ride.is_tracking() {
            self.ride.attach_tracking().await;
        }

        if permission == PermissionState::Granted {
            // Errors are surfaced as notices by the selection itself
            let _ = self.scooters.fetch_nearby().await;
        }

        debug!("[RideController] Mounted with permission {:?}", permission);
        permission
    }

    /// Release every subscription and drop the scooter selection.
    ///
    /// The ride in progress is kept; the next mount reattaches its trace
    /// watch. No samples are consumed in between.
    pub fn unmount(&mut self) {
        self.ride.unmount();
        self.scooters.clear();
        self.mounted = false;
        debug!("[RideController] Unmounted");
    }

    /// Drain pending samples on both watches.
    ///
    /// Returns the number of trace samples recorded and the nearby flag.
    pub fn pump(&mut self) -> (usize, bool) {
        let recorded = self.ride.poll_trace();
        let nearby = self.scooters.poll_proximity();
        (recorded, nearby)
    }
}
