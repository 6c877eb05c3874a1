//! Per-context coherent cache.
//!
//! One [`CoherentCache`] lives in each context for each collection it displays. It owns
//! the context's cached entry and adopted version token, publishes invalidations after
//! local mutations and applies invalidations from other contexts by token comparison.

use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use futures::StreamExt;
use metrics::counter;
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::resilience::{
    CancelToken, Classify, FailureClass, Fallback, ResilienceError, ResilienceManager,
    ValueSource,
};
use crate::util::lock::mutex_lock;

use super::clock::Clock;
use super::config::{CoherenceConfig, TransportKind};
use super::entry::{CacheEntry, EntryState};
use super::events::{ContextId, InvalidationMessage, MessageKind, VersionToken};
use super::keys::{snapshot_key, version_key};
use super::registry::{ChangeNotice, ChangeReason, SubscriberRegistry, SubscriptionId};
use super::store::ContextStore;
use super::transport::PubSub;

const SOURCE: &str = "cache::context";
const METRIC_INVALIDATION_TOTAL: &str = "gazette_coherence_invalidation_total";
const METRIC_IGNORED_TOTAL: &str = "gazette_coherence_message_ignored_total";
const METRIC_DELIVERY_FAILED_TOTAL: &str = "gazette_coherence_delivery_failed_total";

/// Collection contents plus the version the source committed them at, when it knows.
#[derive(Debug, Clone, PartialEq)]
pub struct Fetched<T> {
    pub value: T,
    pub version: Option<VersionToken>,
    /// `false` when the source answered with a last-known-good copy.
    pub live: bool,
}

impl<T> Fetched<T> {
    pub fn new(value: T, version: Option<VersionToken>) -> Self {
        Self {
            value,
            version,
            live: true,
        }
    }

    /// A copy the source kept from before it became unreachable.
    pub fn fallback(value: T, version: Option<VersionToken>) -> Self {
        Self {
            value,
            version,
            live: false,
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SourceError {
    #[error("source unavailable: {0}")]
    Unavailable(String),
    #[error("source rejected the request: {0}")]
    Rejected(String),
}

impl Classify for SourceError {
    fn class(&self) -> FailureClass {
        match self {
            Self::Unavailable(_) => FailureClass::Transient,
            Self::Rejected(_) => FailureClass::Permanent,
        }
    }
}

/// Where a context loads a collection from.
#[async_trait]
pub trait CollectionSource<T>: Send + Sync {
    /// One attempt at loading the collection. Retrying is the caller's job.
    async fn fetch(&self) -> Result<Fetched<T>, SourceError>;

    /// Last-known-good copy to serve when fetching stays impossible and smart fallback
    /// is enabled.
    fn fallback(&self) -> Option<Fetched<T>> {
        None
    }
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error(transparent)]
    Fetch(#[from] ResilienceError<SourceError>),
}

impl Classify for CacheError {
    fn class(&self) -> FailureClass {
        match self {
            Self::Fetch(err) => err.class(),
        }
    }
}

/// What a context did with an incoming message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageDisposition {
    Applied,
    OwnOrigin,
    NotNewer,
    OtherCollection,
}

impl MessageDisposition {
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied)
    }

    fn as_str(&self) -> &'static str {
        match self {
            Self::Applied => "applied",
            Self::OwnOrigin => "own_origin",
            Self::NotNewer => "not_newer",
            Self::OtherCollection => "other_collection",
        }
    }
}

/// Why a context is invalidating its own entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Invalidation {
    pub kind: MessageKind,
    pub entity_id: Option<Uuid>,
    /// Version the store reported for the change, if any.
    pub committed_version: Option<VersionToken>,
}

impl Invalidation {
    pub fn new(kind: MessageKind) -> Self {
        Self {
            kind,
            entity_id: None,
            committed_version: None,
        }
    }

    pub fn entity(mut self, id: Option<Uuid>) -> Self {
        self.entity_id = id;
        self
    }

    pub fn committed(mut self, version: Option<VersionToken>) -> Self {
        self.committed_version = version;
        self
    }
}

/// Everything a context shares with the rest of the process.
#[derive(Clone)]
pub struct ContextParts {
    pub id: ContextId,
    pub transport: Arc<dyn PubSub>,
    pub store: Arc<dyn ContextStore>,
    pub resilience: Arc<ResilienceManager>,
    pub clock: Arc<dyn Clock>,
    pub config: CoherenceConfig,
}

struct ContextState<T> {
    entry: Option<CacheEntry<T>>,
    token: VersionToken,
    in_flight: u32,
    flushed: bool,
}

pub struct CoherentCache<T> {
    collection: String,
    id: ContextId,
    config: CoherenceConfig,
    source: Arc<dyn CollectionSource<T>>,
    resilience: Arc<ResilienceManager>,
    transport: Arc<dyn PubSub>,
    store: Arc<dyn ContextStore>,
    clock: Arc<dyn Clock>,
    subscribers: SubscriberRegistry,
    state: Mutex<ContextState<T>>,
}

impl<T> CoherentCache<T>
where
    T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Open the cache for `collection`, restoring the persisted token and snapshot.
    pub fn open(
        collection: impl Into<String>,
        source: Arc<dyn CollectionSource<T>>,
        parts: ContextParts,
    ) -> Self {
        let collection = collection.into();
        let token = restore_token(parts.store.as_ref(), &collection);
        let entry = restore_snapshot::<T>(parts.store.as_ref(), &collection);

        debug!(
            %collection,
            context = %parts.id,
            transport = parts.transport.kind().as_str(),
            version_token = %token,
            restored_entry = entry.is_some(),
            "Coherent cache opened"
        );

        Self {
            collection,
            id: parts.id,
            config: parts.config,
            source,
            resilience: parts.resilience,
            transport: parts.transport,
            store: parts.store,
            clock: parts.clock,
            subscribers: SubscriberRegistry::new(),
            state: Mutex::new(ContextState {
                entry,
                token,
                in_flight: 0,
                flushed: false,
            }),
        }
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn context_id(&self) -> ContextId {
        self.id
    }

    pub fn transport_kind(&self) -> TransportKind {
        self.transport.kind()
    }

    /// Adopted version token.
    pub fn token(&self) -> VersionToken {
        self.lock("token").token
    }

    pub fn entry(&self) -> Option<CacheEntry<T>> {
        self.lock("entry").entry.clone()
    }

    /// Whether the current entry is a fallback copy rather than live data.
    pub fn serving_fallback(&self) -> bool {
        self.lock("serving_fallback")
            .entry
            .as_ref()
            .is_some_and(|entry| entry.fallback)
    }

    pub fn state(&self) -> EntryState {
        let now = self.clock.now();
        let state = self.lock("state");
        if state.in_flight > 0 {
            return EntryState::Fetching;
        }
        match &state.entry {
            None => EntryState::Cold,
            Some(entry)
                if state.flushed
                    || entry.is_stale(now, self.config.validity_window(), state.token) =>
            {
                EntryState::Stale
            }
            Some(_) => EntryState::Fresh,
        }
    }

    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&ChangeNotice) + Send + Sync + 'static,
    {
        self.subscribers.subscribe(callback)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.subscribers.unsubscribe(id)
    }

    /// Serve the entry when fresh, otherwise fetch it first. Stale data is never returned.
    pub async fn read(&self, cancel: &CancelToken) -> Result<T, CacheError> {
        if let Some(value) = self.fresh_value() {
            return Ok(value);
        }
        self.refresh(cancel).await
    }

    /// Fetch through the resilience manager regardless of the current state.
    ///
    /// Data whose fetch started before the token advanced is stored under the older
    /// token, so it is stale on arrival.
    #[instrument(skip_all, fields(collection = %self.collection, context = %self.id))]
    pub async fn refresh(&self, cancel: &CancelToken) -> Result<T, CacheError> {
        let started = {
            let mut state = self.lock("refresh");
            state.in_flight += 1;
            state.token
        };

        let label = format!("{}.fetch", self.collection);
        let fallback = match self.source.fallback() {
            Some(copy) => Fallback::Value(Fetched { live: false, ..copy }),
            None => Fallback::None,
        };
        let result = self
            .resilience
            .with_retry(&label, fallback, cancel, || self.source.fetch())
            .await;

        let now = self.clock.now();
        let mut state = self.lock("refresh");
        state.in_flight = state.in_flight.saturating_sub(1);

        let guarded = match result {
            Ok(guarded) => guarded,
            Err(err) => {
                state.entry = None;
                self.forget_snapshot();
                warn!(error = %err, "Collection fetch failed, entry dropped");
                return Err(err.into());
            }
        };

        let served_live = guarded.source == ValueSource::Live;
        let Fetched {
            value,
            version,
            live,
        } = guarded.value;
        let live = live && served_live;
        // A fallback copy keeps its own version and never moves the token.
        let stamp = if live {
            version.map_or(started, |version| version.max(started))
        } else {
            version.unwrap_or(VersionToken::ZERO)
        };
        if live
            && let Some(version) = version
            && version > state.token
        {
            state.token = version;
            self.persist_token(version);
        }
        if !live {
            warn!(
                fetched_token = %stamp,
                current_token = %state.token,
                "Source served a fallback copy; entry kept stale"
            );
        }

        let entry = CacheEntry::new(self.collection.clone(), value.clone(), stamp, now)
            .from_fallback(!live);
        if entry.is_behind(state.token) {
            debug!(
                fetched_token = %stamp,
                current_token = %state.token,
                "Fetched data superseded while in flight"
            );
        }
        self.persist_snapshot(&entry);
        state.entry = Some(entry);
        state.flushed = false;

        debug!(
            version_token = %state.token,
            attempts = guarded.attempts,
            "Collection refreshed"
        );
        Ok(value)
    }

    /// Drop the local entry, advance the token and tell every other context.
    ///
    /// Delivery failures are logged and swallowed; the returned message is what was sent.
    pub fn invalidate(&self, reason: Invalidation) -> InvalidationMessage {
        let now_millis = self.clock.now_millis();
        let token = {
            let mut state = self.lock("invalidate");
            state.entry = None;
            state.flushed = false;
            state.token = state.token.advance(now_millis, reason.committed_version);
            self.persist_token(state.token);
            self.forget_snapshot();
            state.token
        };

        let message = InvalidationMessage::new(
            self.collection.clone(),
            reason.kind,
            reason.entity_id,
            token,
            self.id,
        );

        counter!(METRIC_INVALIDATION_TOTAL, "kind" => reason.kind.as_str()).increment(1);
        info!(
            collection = %self.collection,
            context = %self.id,
            kind = reason.kind.as_str(),
            entity_id = ?reason.entity_id,
            version_token = %token,
            "Cache invalidated"
        );

        self.deliver(&message);
        self.subscribers.notify(&ChangeNotice {
            collection: self.collection.clone(),
            reason: ChangeReason::Local(reason.kind),
            entity_id: reason.entity_id,
            version_token: token,
        });
        message
    }

    /// Apply another context's invalidation when it carries a newer token.
    pub fn on_message(&self, message: &InvalidationMessage) -> MessageDisposition {
        let disposition = self.apply_message(message);
        if !disposition.is_applied() {
            counter!(METRIC_IGNORED_TOTAL, "reason" => disposition.as_str()).increment(1);
            debug!(
                collection = %message.collection,
                context = %self.id,
                version_token = %message.version_token,
                reason = disposition.as_str(),
                "Invalidation message ignored"
            );
            return disposition;
        }

        info!(
            collection = %self.collection,
            context = %self.id,
            origin = %message.origin_context_id,
            kind = message.kind.as_str(),
            version_token = %message.version_token,
            "Remote invalidation applied"
        );
        self.subscribers.notify(&ChangeNotice {
            collection: self.collection.clone(),
            reason: ChangeReason::Remote(message.kind),
            entity_id: message.entity_id,
            version_token: message.version_token,
        });
        disposition
    }

    /// Whether the local entry can be served without talking to the source.
    pub fn check_consistency(&self) -> bool {
        let now = self.clock.now();
        let token = {
            let state = self.lock("check_consistency");
            let Some(entry) = state.entry.as_ref() else {
                return false;
            };
            if state.flushed || entry.is_stale(now, self.config.validity_window(), state.token) {
                return false;
            }
            state.token
        };

        match self.transport.sync_marker(&self.collection) {
            Some(marker) if marker > token => {
                debug!(
                    collection = %self.collection,
                    context = %self.id,
                    marker = %marker,
                    version_token = %token,
                    "Sync marker ahead of adopted token"
                );
                // A marker ahead of us stands for a message this context missed.
                let mut state = self.lock("check_consistency");
                if marker > state.token {
                    state.token = marker;
                    self.persist_token(marker);
                }
                false
            }
            _ => true,
        }
    }

    /// Revalidate on focus regain. Returns whether a refresh happened.
    pub async fn on_focus(&self, cancel: &CancelToken) -> Result<bool, CacheError> {
        if self.check_consistency() {
            return Ok(false);
        }
        self.refresh(cancel).await.map(|_| true)
    }

    /// Revalidate when the context becomes visible again.
    pub async fn on_visibility(
        &self,
        visible: bool,
        cancel: &CancelToken,
    ) -> Result<bool, CacheError> {
        if !visible {
            return Ok(false);
        }
        self.on_focus(cancel).await
    }

    /// Mark the entry stale so the next read fetches.
    pub fn flush(&self) {
        let token = {
            let mut state = self.lock("flush");
            state.flushed = true;
            state.token
        };
        self.subscribers.notify(&ChangeNotice {
            collection: self.collection.clone(),
            reason: ChangeReason::Flushed,
            entity_id: None,
            version_token: token,
        });
    }

    /// Feed transport messages into [`Self::on_message`] until `cancel` fires.
    ///
    /// The subscription is taken before this returns, so nothing published afterwards is
    /// missed.
    pub fn spawn_listener(self: &Arc<Self>, cancel: CancelToken) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        let mut messages = self.transport.subscribe(&self.collection);

        tokio::spawn(async move {
            loop {
                let message = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    next = messages.next() => match next {
                        Some(message) => message,
                        None => break,
                    },
                };

                if cache.on_message(&message).is_applied()
                    && cache.config.eager_refresh
                    && let Err(err) = cache.refresh(&cancel).await
                {
                    warn!(
                        collection = %cache.collection,
                        context = %cache.id,
                        error = %err,
                        "Refresh after remote invalidation failed"
                    );
                }
            }
            debug!(collection = %cache.collection, context = %cache.id, "Listener stopped");
        })
    }

    fn apply_message(&self, message: &InvalidationMessage) -> MessageDisposition {
        if message.collection != self.collection {
            return MessageDisposition::OtherCollection;
        }
        if message.origin_context_id == self.id {
            return MessageDisposition::OwnOrigin;
        }

        let mut state = self.lock("on_message");
        if message.version_token <= state.token {
            return MessageDisposition::NotNewer;
        }
        state.entry = None;
        state.flushed = false;
        state.token = message.version_token;
        self.persist_token(state.token);
        self.forget_snapshot();
        MessageDisposition::Applied
    }

    fn fresh_value(&self) -> Option<T> {
        let now = self.clock.now();
        let state = self.lock("read");
        let entry = state.entry.as_ref()?;
        if state.flushed || entry.is_stale(now, self.config.validity_window(), state.token) {
            return None;
        }
        Some(entry.value.clone())
    }

    fn deliver(&self, message: &InvalidationMessage) -> bool {
        match self.transport.publish(message) {
            Ok(()) => true,
            Err(err) => {
                counter!(
                    METRIC_DELIVERY_FAILED_TOTAL,
                    "transport" => self.transport.kind().as_str()
                )
                .increment(1);
                warn!(
                    collection = %self.collection,
                    context = %self.id,
                    version_token = %message.version_token,
                    error = %err,
                    "Invalidation delivery failed"
                );
                false
            }
        }
    }

    fn persist_token(&self, token: VersionToken) {
        if let Err(err) = self
            .store
            .set(&version_key(&self.collection), &token.get().to_string())
        {
            warn!(collection = %self.collection, error = %err, "Version token not persisted");
        }
    }

    fn persist_snapshot(&self, entry: &CacheEntry<T>) {
        let result = serde_json::to_string(entry)
            .map_err(|err| err.to_string())
            .and_then(|payload| {
                self.store
                    .set(&snapshot_key(&self.collection), &payload)
                    .map_err(|err| err.to_string())
            });
        if let Err(err) = result {
            warn!(collection = %self.collection, error = %err, "Cache snapshot not persisted");
        }
    }

    fn forget_snapshot(&self) {
        if let Err(err) = self.store.remove(&snapshot_key(&self.collection)) {
            warn!(collection = %self.collection, error = %err, "Cache snapshot not removed");
        }
    }

    fn lock(&self, op: &'static str) -> MutexGuard<'_, ContextState<T>> {
        mutex_lock(&self.state, SOURCE, op)
    }
}

fn restore_token(store: &dyn ContextStore, collection: &str) -> VersionToken {
    match store.get(&version_key(collection)) {
        Ok(Some(raw)) => raw.parse::<i64>().map(VersionToken::new).unwrap_or_else(|err| {
            warn!(%collection, error = %err, "Persisted version token unreadable");
            VersionToken::ZERO
        }),
        Ok(None) => VersionToken::ZERO,
        Err(err) => {
            warn!(%collection, error = %err, "Persisted version token unavailable");
            VersionToken::ZERO
        }
    }
}

fn restore_snapshot<T: DeserializeOwned>(
    store: &dyn ContextStore,
    collection: &str,
) -> Option<CacheEntry<T>> {
    let raw = match store.get(&snapshot_key(collection)) {
        Ok(raw) => raw?,
        Err(err) => {
            warn!(%collection, error = %err, "Cache snapshot unavailable");
            return None;
        }
    };
    serde_json::from_str(&raw)
        .map_err(|err| warn!(%collection, error = %err, "Cache snapshot unreadable"))
        .ok()
}
