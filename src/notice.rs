//! User-visible notices.
//!
//! The core never renders anything itself. Failures that the rider should
//! see are handed to a [`Notifier`] supplied by the host.

use log::warn;
use std::sync::Mutex;

/// A short alert shown to the rider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub title: String,
    pub message: Option<String>,
}

impl Notice {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            message: None,
        }
    }

    pub fn with_message(title: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            message: Some(message.into()),
        }
    }
}

/// Sink for user-visible notices.
pub trait Notifier: Send + Sync {
    fn notify(&self, notice: Notice);
}

/// Notifier that only writes to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, notice: Notice) {
        match notice.message {
            Some(message) => warn!("[Notice] {}: {}", notice.title, message),
            None => warn!("[Notice] {}", notice.title),
        }
    }
}

/// Notifier that keeps every notice it receives.
///
/// Useful for hosts that poll for alerts, and for tests.
#[derive(Debug, Default)]
pub struct CollectingNotifier {
    notices: Mutex<Vec<Notice>>,
}

impl CollectingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take all notices collected so far.
    pub fn take(&self) -> Vec<Notice> {
        match self.notices.lock() {
            Ok(mut notices) => std::mem::take(&mut *notices),
            Err(_) => Vec::new(),
        }
    }

    /// Titles of the notices collected so far, oldest first.
    pub fn titles(&self) -> Vec<String> {
        match self.notices.lock() {
            Ok(notices) => notices.iter().map(|n| n.title.clone()).collect(),
            Err(_) => Vec::new(),
        }
    }
}

impl Notifier for CollectingNotifier {
    fn notify(&self, notice: Notice) {
        if let Ok(mut notices) = self.notices.lock() {
            notices.push(notice);
        }
    }
}
