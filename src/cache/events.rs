//! Version tokens and invalidation messages.
//!
//! Messages are delivered at-least-once and unordered; receivers decide what to apply
//! purely by comparing tokens.

use std::fmt;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

/// Monotonic, timestamp-derived collection version.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct VersionToken(i64);

impl VersionToken {
    pub const ZERO: Self = Self(0);

    pub const fn new(value: i64) -> Self {
        Self(value)
    }

    pub const fn get(self) -> i64 {
        self.0
    }

    /// Next token after `self`: `max(self + 1, now_millis, committed)`.
    ///
    /// Strictly greater than `self` and never behind a version the store already committed.
    pub fn advance(self, now_millis: i64, committed: Option<VersionToken>) -> Self {
        let floor = self.0.saturating_add(1).max(now_millis);
        Self(committed.map_or(floor, |committed| floor.max(committed.0)))
    }
}

impl fmt::Display for VersionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of one browsing context (tab, window, client process).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContextId(Uuid);

impl ContextId {
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    pub const fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    pub const fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Created,
    Updated,
    Deleted,
    /// Collection-wide invalidation without a specific entity.
    Invalidated,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Updated => "updated",
            Self::Deleted => "deleted",
            Self::Invalidated => "invalidated",
        }
    }
}

/// Notice that a committed change made cached copies of `collection` obsolete.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvalidationMessage {
    pub collection: String,
    pub kind: MessageKind,
    pub entity_id: Option<Uuid>,
    pub version_token: VersionToken,
    pub origin_context_id: ContextId,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

impl InvalidationMessage {
    pub fn new(
        collection: impl Into<String>,
        kind: MessageKind,
        entity_id: Option<Uuid>,
        version_token: VersionToken,
        origin_context_id: ContextId,
    ) -> Self {
        Self {
            collection: collection.into(),
            kind,
            entity_id,
            version_token,
            origin_context_id,
            timestamp: OffsetDateTime::now_utc(),
        }
    }
}
