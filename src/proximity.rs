//! Proximity to the selected scooter.
//!
//! The monitor owns its own position watch while a target is set. Each
//! sample is compared with the target by great-circle distance and the
//! nearby flag latches on the first sample inside the threshold. Only a new
//! target (or clearing it) resets the flag.

use log::{debug, info};

use crate::geo_utils::haversine_distance;
use crate::location::PositionWatch;
use crate::GpsPoint;

/// Latching "nearby" detector for one target at a time.
#[derive(Debug)]
pub struct ProximityMonitor {
    threshold_m: f64,
    target: Option<GpsPoint>,
    watch: Option<PositionWatch>,
    nearby: bool,
    last_distance_m: Option<f64>,
    samples_evaluated: u64,
}

impl ProximityMonitor {
    pub fn new(threshold_m: f64) -> Self {
        Self {
            threshold_m,
            target: None,
            watch: None,
            nearby: false,
            last_distance_m: None,
            samples_evaluated: 0,
        }
    }

    pub fn threshold_m(&self) -> f64 {
        self.threshold_m
    }

    pub fn target(&self) -> Option<GpsPoint> {
        self.target
    }

    pub fn is_nearby(&self) -> bool {
        self.nearby
    }

    pub fn is_watching(&self) -> bool {
        self.watch.as_ref().is_some_and(|w| !w.is_removed())
    }

    /// Distance computed from the most recent sample for the current target.
    pub fn last_distance_m(&self) -> Option<f64> {
        self.last_distance_m
    }

    /// Number of distance computations for the current target.
    pub fn samples_evaluated(&self) -> u64 {
        self.samples_evaluated
    }

    /// Point the monitor at a new target.
    ///
    /// The previous watch is released before anything else happens, and the
    /// nearby flag starts over. `watch` may be `None` when location access
    /// is unavailable; samples can still be fed through [`observe`](Self::observe).
    pub fn retarget(&mut self, target: GpsPoint, watch: Option<PositionWatch>) {
        self.release();
        self.target = Some(target);
        self.watch = watch;
        debug!(
            "[ProximityMonitor] Watching ({:.5}, {:.5}), threshold {:.0}m",
            target.latitude, target.longitude, self.threshold_m
        );
    }

    /// Drop the target and release the watch.
    pub fn clear(&mut self) {
        self.release();
        self.target = None;
    }

    fn release(&mut self) {
        if let Some(mut watch) = self.watch.take() {
            watch.remove();
        }
        self.nearby = false;
        self.last_distance_m = None;
        self.samples_evaluated = 0;
    }

    /// Evaluate one position sample. Returns the nearby flag.
    ///
    /// Without a target the sample is ignored, and so are samples with
    /// out-of-range or non-finite coordinates.
    pub fn observe(&mut self, sample: GpsPoint) -> bool {
        let Some(target) = self.target else {
            return false;
        };
        if !sample.is_valid() {
            debug!(
                "[ProximityMonitor] Ignoring invalid sample ({}, {})",
                sample.latitude, sample.longitude
            );
            return self.nearby;
        }

        let distance = haversine_distance(&sample, &target);
        self.last_distance_m = Some(distance);
        self.samples_evaluated += 1;

        if distance < self.threshold_m && !self.nearby {
            info!(
                "[ProximityMonitor] Within {:.0}m of target ({:.1}m)",
                self.threshold_m, distance
            );
            self.nearby = true;
        }
        self.nearby
    }

    /// Evaluate every sample already delivered on the watch.
    pub fn poll(&mut self) -> bool {
        while let Some(sample) = self.watch.as_mut().and_then(PositionWatch::try_next) {
            self.observe(sample);
        }
        self.nearby
    }

    /// Wait for the next sample on the watch and evaluate it.
    ///
    /// Returns `None` when there is no live watch.
    pub async fn next(&mut self) -> Option<bool> {
        let sample = self.watch.as_mut()?.next().await?;
        Some(self.observe(sample))
    }
}
