//! Runtime configuration.
//!
//! Every threshold the ride and scooter logic depends on lives here, so
//! hosts can tune them without touching code. Defaults match what the app
//! ships with.

use serde::{Deserialize, Serialize};

use crate::error::{RideError, Result};

/// Configuration for ride tracking and scooter proximity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RideConfig {
    /// Minimum displacement between trace samples while a ride is active.
    /// Default: 30.0 meters
    pub trace_displacement_m: f64,

    /// Minimum displacement between samples while watching a selected scooter.
    /// Default: 10.0 meters
    pub proximity_displacement_m: f64,

    /// Great-circle distance below which the rider counts as near the
    /// selected scooter. Default: 100.0 meters
    pub nearby_threshold_m: f64,

    /// Maximum distance passed to the nearby-scooter search.
    /// Default: 50_000.0 meters
    pub search_radius_m: f64,

    pub routing: RoutingConfig,

    pub store: StoreConfig,
}

impl Default for RideConfig {
    fn default() -> Self {
        Self {
            trace_displacement_m: 30.0,
            proximity_displacement_m: 10.0,
            nearby_threshold_m: 100.0,
            search_radius_m: 50_000.0,
            routing: RoutingConfig::default(),
            store: StoreConfig::default(),
        }
    }
}

/// Routing service settings (used by the HTTP adapter).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    pub base_url: String,
    /// Routing profile, e.g. "cycling", "walking", "driving"
    pub profile: String,
    pub access_token: String,
    pub timeout_secs: u64,
    /// Map matching rejects longer inputs; traces are downsampled to fit.
    /// Default: 100
    pub max_match_coordinates: usize,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.mapbox.com".to_string(),
            profile: "cycling".to_string(),
            access_token: String::new(),
            timeout_secs: 30,
            max_match_coordinates: 100,
        }
    }
}

/// Remote store settings (used by the HTTP adapter).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Project URL, e.g. "https://xyz.supabase.co"
    pub base_url: String,
    pub api_key: String,
    /// Bearer token of the signed-in user, if any. Falls back to `api_key`.
    pub access_token: Option<String>,
    pub timeout_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            api_key: String::new(),
            access_token: None,
            timeout_secs: 30,
        }
    }
}

impl RideConfig {
    /// Parse configuration from JSON. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: RideConfig = serde_json::from_str(json)
            .map_err(|e| RideError::config(format!("invalid config JSON: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Check that every threshold is usable.
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("trace_displacement_m", self.trace_displacement_m),
            ("proximity_displacement_m", self.proximity_displacement_m),
            ("nearby_threshold_m", self.nearby_threshold_m),
            ("search_radius_m", self.search_radius_m),
        ];
        for (name, value) in positive {
            if !value.is_finite() || value <= 0.0 {
                return Err(RideError::config(format!(
                    "{} must be a positive number, got {}",
                    name, value
                )));
            }
        }
        if self.routing.max_match_coordinates < 2 {
            return Err(RideError::config(
                "routing.max_match_coordinates must be at least 2",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = RideConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.nearby_threshold_m, 100.0);
        assert_eq!(config.routing.profile, "cycling");
    }

    #[test]
    fn test_from_json_partial() {
        let config =
            RideConfig::from_json(r#"{"nearby_threshold_m": 25.0, "routing": {"profile": "walking"}}"#)
                .unwrap();
        assert_eq!(config.nearby_threshold_m, 25.0);
        assert_eq!(config.routing.profile, "walking");
        // Untouched fields keep defaults
        assert_eq!(config.trace_displacement_m, 30.0);
        assert_eq!(config.routing.max_match_coordinates, 100);
    }

    #[test]
    fn test_rejects_non_positive_threshold() {
        let err = RideConfig::from_json(r#"{"search_radius_m": 0}"#).unwrap_err();
        assert!(matches!(err, RideError::Config { .. }));
        assert!(err.to_string().contains("search_radius_m"));
    }

    #[test]
    fn test_rejects_malformed_json() {
        assert!(matches!(
            RideConfig::from_json("{not json"),
            Err(RideError::Config { .. })
        ));
    }
}
