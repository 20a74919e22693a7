//! Unified error handling for the ride-tracker library.
//!
//! Every failure at an external boundary (permission prompt, store call,
//! routing call) is mapped onto one of these variants. Components turn them
//! into user-visible [`Notice`](crate::notice::Notice)s and return them, so
//! nothing escapes as a panic.

use thiserror::Error;

/// Unified error type for ride-tracker operations.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RideError {
    /// Location access was refused. Needs a fresh user grant.
    #[error("Location permission denied")]
    PermissionDenied,

    /// A ride is already in progress for this identity
    #[error("Conflict: {message}")]
    Conflict { message: String },

    /// Store call failed (insert, update, lookup or procedure)
    #[error("Persistence error: {message}")]
    Persistence { message: String },

    /// Directions or map-matching call failed
    #[error("{}", routing_message(.message, .status_code))]
    RoutingService {
        message: String,
        status_code: Option<u16>,
    },

    /// Degenerate input rejected before reaching a collaborator
    #[error("Validation error: {message}")]
    Validation { message: String },

    /// Configuration error
    #[error("Configuration error: {message}")]
    Config { message: String },
}

fn routing_message(message: &str, status_code: &Option<u16>) -> String {
    match status_code {
        Some(code) => format!("Routing service error ({}): {}", code, message),
        None => format!("Routing service error: {}", message),
    }
}

impl RideError {
    pub fn conflict(message: impl Into<String>) -> Self {
        RideError::Conflict {
            message: message.into(),
        }
    }

    pub fn persistence(message: impl Into<String>) -> Self {
        RideError::Persistence {
            message: message.into(),
        }
    }

    pub fn routing(message: impl Into<String>) -> Self {
        RideError::RoutingService {
            message: message.into(),
            status_code: None,
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        RideError::Validation {
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        RideError::Config {
            message: message.into(),
        }
    }

    /// Whether a new user-initiated action may succeed.
    ///
    /// Nothing is retried automatically. Permission denial and bad
    /// configuration stay failed until something outside the core changes.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            RideError::Persistence { .. }
                | RideError::RoutingService { .. }
                | RideError::Conflict { .. }
        )
    }
}

impl From<serde_json::Error> for RideError {
    fn from(e: serde_json::Error) -> Self {
        RideError::persistence(format!("malformed record: {}", e))
    }
}

#[cfg(feature = "persistence")]
impl From<rusqlite::Error> for RideError {
    fn from(e: rusqlite::Error) -> Self {
        RideError::persistence(format!("sqlite: {}", e))
    }
}

/// Result type alias for ride-tracker operations.
pub type Result<T> = std::result::Result<T, RideError>;

/// Extension trait for converting Option to RideError.
pub trait OptionExt<T> {
    /// Convert Option to Result with a routing service error.
    fn ok_or_routing(self, message: &str) -> Result<T>;
}

impl<T> OptionExt<T> for Option<T> {
    fn ok_or_routing(self, message: &str) -> Result<T> {
        self.ok_or_else(|| RideError::routing(message))
    }
}
