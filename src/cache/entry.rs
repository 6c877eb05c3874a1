//! Cached collection entries and their lifecycle states.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use super::events::VersionToken;

/// Lifecycle of a context's cached entry.
///
/// `Cold -> Fetching -> Fresh | Cold`, `Fresh -> Stale` on expiry, accepted
/// invalidation, focus regain or flush, `Stale -> Fetching` on the next read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryState {
    Cold,
    Fetching,
    Fresh,
    Stale,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry<T> {
    pub key: String,
    pub value: T,
    pub version_token: VersionToken,
    #[serde(with = "time::serde::rfc3339")]
    pub fetched_at: OffsetDateTime,
    /// Served from a last-known-good copy while the source was unreachable.
    #[serde(default)]
    pub fallback: bool,
}

impl<T> CacheEntry<T> {
    pub fn new(
        key: impl Into<String>,
        value: T,
        version_token: VersionToken,
        fetched_at: OffsetDateTime,
    ) -> Self {
        Self {
            key: key.into(),
            value,
            version_token,
            fetched_at,
            fallback: false,
        }
    }

    pub fn from_fallback(mut self, fallback: bool) -> Self {
        self.fallback = fallback;
        self
    }

    /// Older than the validity window at `now`.
    pub fn is_expired(&self, now: OffsetDateTime, window: Duration) -> bool {
        now - self.fetched_at > window
    }

    /// Fetched before the context adopted `token`.
    pub fn is_behind(&self, token: VersionToken) -> bool {
        self.version_token < token
    }

    /// Fallback copies never count as current.
    pub fn is_stale(&self, now: OffsetDateTime, window: Duration, token: VersionToken) -> bool {
        self.fallback || self.is_expired(now, window) || self.is_behind(token)
    }
}

#[cfg(test)]
mod tests {
    use time::macros::datetime;

    use super::*;

    #[test]
    fn staleness_by_age_and_token() {
        let fetched_at = datetime!(2024-01-01 00:00:00 UTC);
        let entry = CacheEntry::new("articles", vec![1, 2], VersionToken::new(5), fetched_at);
        let window = Duration::from_secs(30);

        assert!(!entry.is_stale(fetched_at + Duration::from_secs(30), window, VersionToken::new(5)));
        assert!(entry.is_stale(fetched_at + Duration::from_secs(31), window, VersionToken::new(5)));
        assert!(entry.is_stale(fetched_at, window, VersionToken::new(6)));
        assert!(!entry.is_behind(VersionToken::new(4)));

        let fallback = entry.from_fallback(true);
        assert!(fallback.is_stale(fetched_at, window, VersionToken::new(5)));
    }
}
