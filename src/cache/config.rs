//! Coherence configuration.
//!
//! Controls entry validity, the post-mutation grace period and transport selection via
//! the `[coherence]` section of `gazette.toml`.

use std::num::NonZeroUsize;
use std::time::Duration;

use serde::Deserialize;

const DEFAULT_VALIDITY_WINDOW_MS: u64 = 30_000;
const DEFAULT_GRACE_PERIOD_MS: u64 = 175;
const DEFAULT_CHANNEL_CAPACITY: usize = 256;
const DEFAULT_STORAGE_QUOTA_BYTES: usize = 5 * 1024 * 1024;

/// Lowest grace period the orchestrator accepts.
pub const MIN_GRACE_PERIOD_MS: u64 = 150;
/// Highest grace period the orchestrator accepts.
pub const MAX_GRACE_PERIOD_MS: u64 = 200;

/// Which primitive carries invalidation messages between contexts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// In-process broadcast channel shared by every context of the origin.
    Broadcast,
    /// Shared origin storage with change notifications.
    Storage,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Broadcast => "broadcast",
            Self::Storage => "storage",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CoherenceConfig {
    /// Age after which a cached entry is stale regardless of tokens.
    pub validity_window_ms: u64,
    /// Wait between broadcasting a mutation and re-fetching.
    pub grace_period_ms: u64,
    /// Preferred transport; storage is used when broadcast is unavailable.
    pub transport: TransportKind,
    /// Capacity of the broadcast channel before slow receivers lag.
    pub channel_capacity: usize,
    /// Byte quota of the shared origin storage.
    pub storage_quota_bytes: usize,
    /// Re-fetch as soon as a remote invalidation is applied.
    pub eager_refresh: bool,
}

impl Default for CoherenceConfig {
    fn default() -> Self {
        Self {
            validity_window_ms: DEFAULT_VALIDITY_WINDOW_MS,
            grace_period_ms: DEFAULT_GRACE_PERIOD_MS,
            transport: TransportKind::Broadcast,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            storage_quota_bytes: DEFAULT_STORAGE_QUOTA_BYTES,
            eager_refresh: true,
        }
    }
}

impl From<&crate::config::CoherenceSettings> for CoherenceConfig {
    fn from(settings: &crate::config::CoherenceSettings) -> Self {
        Self {
            validity_window_ms: settings.validity_window_ms,
            grace_period_ms: settings.grace_period_ms,
            transport: settings.transport,
            channel_capacity: settings.channel_capacity.get(),
            storage_quota_bytes: settings.storage_quota_bytes,
            eager_refresh: settings.eager_refresh,
        }
    }
}

impl CoherenceConfig {
    pub fn validity_window(&self) -> Duration {
        Duration::from_millis(self.validity_window_ms)
    }

    /// Grace period, clamped into the accepted range.
    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(
            self.grace_period_ms
                .clamp(MIN_GRACE_PERIOD_MS, MAX_GRACE_PERIOD_MS),
        )
    }

    /// Returns the channel capacity as NonZeroUsize, clamping to 1 if zero.
    pub fn channel_capacity_non_zero(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.channel_capacity).unwrap_or(NonZeroUsize::MIN)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_values() {
        let config = CoherenceConfig::default();
        assert_eq!(config.validity_window(), Duration::from_secs(30));
        assert_eq!(config.grace_period(), Duration::from_millis(175));
        assert_eq!(config.transport, TransportKind::Broadcast);
        assert_eq!(config.channel_capacity, 256);
        assert!(config.eager_refresh);
    }

    #[test]
    fn grace_period_is_clamped() {
        let short = CoherenceConfig {
            grace_period_ms: 10,
            ..Default::default()
        };
        assert_eq!(short.grace_period(), Duration::from_millis(150));

        let long = CoherenceConfig {
            grace_period_ms: 5_000,
            ..Default::default()
        };
        assert_eq!(long.grace_period(), Duration::from_millis(200));
    }

    #[test]
    fn non_zero_clamps_to_min() {
        let config = CoherenceConfig {
            channel_capacity: 0,
            ..Default::default()
        };
        assert_eq!(config.channel_capacity_non_zero().get(), 1);
    }

    #[test]
    fn transport_kind_deserializes_snake_case() {
        let kind: TransportKind = serde_json::from_str("\"storage\"").expect("parse kind");
        assert_eq!(kind, TransportKind::Storage);
        assert_eq!(kind.as_str(), "storage");
    }
}
