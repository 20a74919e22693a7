//! # Location
//!
//! Permission-gated access to the device position.
//!
//! The platform geolocation API is abstracted behind [`GeolocationSource`].
//! Every consumer goes through a [`LocationFeed`], which refuses to subscribe
//! until the shared [`PermissionGate`] reports a grant.
//!
//! A subscription is a [`PositionWatch`]: an ordered stream of samples plus
//! a release hook. Releasing is synchronous and idempotent, and a released
//! watch never yields again, even if the producer had already queued more
//! samples.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, info, warn};
use tokio::sync::mpsc;

use crate::error::{RideError, Result};
use crate::notice::{Notice, Notifier};
use crate::GpsPoint;

// ============================================================================
// Platform Contract
// ============================================================================

/// Outcome of a platform permission prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionStatus {
    Granted,
    Denied,
}

/// Platform geolocation API.
#[async_trait]
pub trait GeolocationSource: Send + Sync {
    /// Ask for foreground location access.
    async fn request_permission(&self) -> Result<PermissionStatus>;

    /// One-shot position fix.
    async fn current_position(&self) -> Result<GpsPoint>;

    /// Start delivering samples whenever the device moves at least
    /// `distance_interval_m` meters.
    async fn watch(&self, distance_interval_m: f64) -> Result<PositionWatch>;
}

// ============================================================================
// Subscription Handle
// ============================================================================

type ReleaseHook = Box<dyn FnOnce() + Send>;

/// Live subscription to position samples.
///
/// Dropping the watch releases it.
pub struct PositionWatch {
    samples: mpsc::UnboundedReceiver<GpsPoint>,
    release: Option<ReleaseHook>,
    removed: bool,
}

impl PositionWatch {
    /// Wrap a sample receiver. `release` runs exactly once, on the first
    /// call to [`remove`](Self::remove) or on drop.
    pub fn new(
        samples: mpsc::UnboundedReceiver<GpsPoint>,
        release: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            samples,
            release: Some(Box::new(release)),
            removed: false,
        }
    }

    /// Create a watch together with the sender a producer pushes samples into.
    pub fn channel() -> (mpsc::UnboundedSender<GpsPoint>, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            tx,
            Self {
                samples: rx,
                release: None,
                removed: false,
            },
        )
    }

    /// Release the subscription. Safe to call any number of times.
    pub fn remove(&mut self) {
        if self.removed {
            return;
        }
        self.removed = true;
        self.samples.close();
        if let Some(release) = self.release.take() {
            release();
        }
    }

    pub fn is_removed(&self) -> bool {
        self.removed
    }

    /// Next already-delivered sample, without waiting.
    pub fn try_next(&mut self) -> Option<GpsPoint> {
        if self.removed {
            return None;
        }
        self.samples.try_recv().ok()
    }

    /// Wait for the next sample. Returns `None` once removed or when the
    /// producer has gone away.
    pub async fn next(&mut self) -> Option<GpsPoint> {
        if self.removed {
            return None;
        }
        self.samples.recv().await
    }
}

impl Drop for PositionWatch {
    fn drop(&mut self) {
        self.remove();
    }
}

impl fmt::Debug for PositionWatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PositionWatch")
            .field("removed", &self.removed)
            .finish()
    }
}

// ============================================================================
// Permission Gate
// ============================================================================

const STATE_UNKNOWN: u8 = 0;
const STATE_GRANTED: u8 = 1;
const STATE_DENIED: u8 = 2;

/// Whether location access has been granted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionState {
    /// Not asked yet in this mount
    Unknown,
    Granted,
    Denied,
}

/// Process-wide permission flag shared by every location consumer.
///
/// Clones share the same state.
#[derive(Debug, Clone, Default)]
pub struct PermissionGate {
    state: Arc<AtomicU8>,
}

impl PermissionGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> PermissionState {
        match self.state.load(Ordering::Acquire) {
            STATE_GRANTED => PermissionState::Granted,
            STATE_DENIED => PermissionState::Denied,
            _ => PermissionState::Unknown,
        }
    }

    pub fn is_granted(&self) -> bool {
        self.state() == PermissionState::Granted
    }

    fn set(&self, state: PermissionState) {
        let raw = match state {
            PermissionState::Unknown => STATE_UNKNOWN,
            PermissionState::Granted => STATE_GRANTED,
            PermissionState::Denied => STATE_DENIED,
        };
        self.state.store(raw, Ordering::Release);
    }
}

// ============================================================================
// Location Feed
// ============================================================================

/// Geolocation source paired with the permission gate that guards it.
#[derive(Clone)]
pub struct LocationFeed {
    source: Arc<dyn GeolocationSource>,
    gate: PermissionGate,
}

impl LocationFeed {
    pub fn new(source: Arc<dyn GeolocationSource>) -> Self {
        Self {
            source,
            gate: PermissionGate::new(),
        }
    }

    pub fn gate(&self) -> &PermissionGate {
        &self.gate
    }

    pub fn permission(&self) -> PermissionState {
        self.gate.state()
    }

    /// Prompt for foreground location access and record the answer.
    ///
    /// Denial (or a failing prompt) raises a notice and is never retried.
    pub async fn request_access(&self, notifier: &dyn Notifier) -> PermissionState {
        let status = match self.source.request_permission().await {
            Ok(status) => status,
            Err(e) => {
                warn!("[LocationFeed] Permission request failed: {}", e);
                PermissionStatus::Denied
            }
        };

        match status {
            PermissionStatus::Granted => {
                info!("[LocationFeed] Location permission granted");
                self.gate.set(PermissionState::Granted);
            }
            PermissionStatus::Denied => {
                info!("[LocationFeed] Location permission denied");
                self.gate.set(PermissionState::Denied);
                notifier.notify(Notice::with_message(
                    "Permission Denied",
                    "Location permission is required to track your ride.",
                ));
            }
        }
        self.gate.state()
    }

    fn ensure_granted(&self) -> Result<()> {
        if self.gate.is_granted() {
            Ok(())
        } else {
            Err(RideError::PermissionDenied)
        }
    }

    /// Subscribe to position samples. Requires a prior grant.
    pub async fn subscribe(&self, min_displacement_m: f64) -> Result<PositionWatch> {
        self.ensure_granted()?;
        debug!(
            "[LocationFeed] Subscribing with {:.0}m displacement interval",
            min_displacement_m
        );
        self.source.watch(min_displacement_m).await
    }

    /// One-shot position fix. Requires a prior grant.
    pub async fn current_position(&self) -> Result<GpsPoint> {
        self.ensure_granted()?;
        self.source.current_position().await
    }
}

impl fmt::Debug for LocationFeed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocationFeed")
            .field("permission", &self.gate.state())
            .finish()
    }
}
