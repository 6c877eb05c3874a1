//! Connection health as an explicit value.
//!
//! `ConnectionHealth` is a plain snapshot; `HealthTracker` is the single cell the
//! resilience manager writes after every store operation. Callers construct the tracker
//! and hand it to whichever managers should share it.

use std::sync::RwLock;

use serde::Serialize;
use time::OffsetDateTime;

use crate::util::lock::{rw_read, rw_write};

const SOURCE: &str = "resilience::health";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ConnectionHealth {
    pub is_healthy: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_failure_at: Option<OffsetDateTime>,
    pub consecutive_failures: u32,
}

impl ConnectionHealth {
    pub const fn healthy() -> Self {
        Self {
            is_healthy: true,
            last_failure_at: None,
            consecutive_failures: 0,
        }
    }

    /// Health after one more transient failure observed at `at`.
    pub fn with_failure(self, at: OffsetDateTime) -> Self {
        Self {
            is_healthy: false,
            last_failure_at: Some(at),
            consecutive_failures: self.consecutive_failures.saturating_add(1),
        }
    }

    /// Health after a successful operation: fully reset.
    pub fn with_success(self) -> Self {
        Self::healthy()
    }
}

impl Default for ConnectionHealth {
    fn default() -> Self {
        Self::healthy()
    }
}

/// Shared health cell. Writes are last-writer-wins; no reader ever observes a torn value.
#[derive(Debug, Default)]
pub struct HealthTracker {
    state: RwLock<ConnectionHealth>,
}

impl HealthTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> ConnectionHealth {
        *rw_read(&self.state, SOURCE, "snapshot")
    }

    pub fn record_failure(&self, at: OffsetDateTime) -> ConnectionHealth {
        let mut state = rw_write(&self.state, SOURCE, "record_failure");
        *state = state.with_failure(at);
        *state
    }

    /// Returns `(previous, current)` so callers can log a recovery transition.
    pub fn record_success(&self) -> (ConnectionHealth, ConnectionHealth) {
        let mut state = rw_write(&self.state, SOURCE, "record_success");
        let previous = *state;
        *state = previous.with_success();
        (previous, *state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failures_accumulate_and_success_resets() {
        let tracker = HealthTracker::new();
        let now = OffsetDateTime::now_utc();

        tracker.record_failure(now);
        let after = tracker.record_failure(now);
        assert!(!after.is_healthy);
        assert_eq!(after.consecutive_failures, 2);
        assert_eq!(after.last_failure_at, Some(now));

        let (previous, current) = tracker.record_success();
        assert!(!previous.is_healthy);
        assert!(current.is_healthy);
        assert_eq!(current.consecutive_failures, 0);
        assert_eq!(current.last_failure_at, None);
        assert_eq!(tracker.snapshot(), current);
    }

    #[test]
    fn serializes_failure_time_as_rfc3339() {
        let health = ConnectionHealth::healthy();
        let json = serde_json::to_value(health).expect("serialize health");
        assert_eq!(json["is_healthy"], true);
        assert!(json["last_failure_at"].is_null());
    }
}
