//! Invalidation transports.
//!
//! Contexts talk through one [`PubSub`] seam. Two implementations exist:
//!
//! - [`BroadcastTransport`]: an origin-scoped [`InvalidationHub`] built on a tokio
//!   broadcast channel. Slow receivers lag and lose messages; the validity window heals.
//! - [`StorageTransport`]: writes each message into [`OriginStorage`] under one key per
//!   collection; other contexts turn the storage change back into a message.
//!
//! [`Origin::transport_for`] picks one and falls back to storage when the origin has no
//! broadcast hub.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, RwLock};

use async_stream::stream;
use futures::{Stream, StreamExt};
use thiserror::Error;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, warn};

use crate::util::lock::{rw_read, rw_write};

use super::config::{CoherenceConfig, TransportKind};
use super::events::{ContextId, InvalidationMessage, VersionToken};
use super::keys::coherence_key;
use super::store::{OriginStorage, StoreError};

const SOURCE: &str = "cache::transport";

pub type MessageStream = Pin<Box<dyn Stream<Item = InvalidationMessage> + Send>>;

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("invalidation hub is closed")]
    HubClosed,
    #[error(transparent)]
    Storage(#[from] StoreError),
    #[error("invalidation message could not be encoded: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Publish/subscribe seam between contexts of one origin.
pub trait PubSub: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Hand `message` to every other context. Delivery is best-effort.
    fn publish(&self, message: &InvalidationMessage) -> Result<(), DeliveryError>;

    /// Messages for `collection` published after this call.
    fn subscribe(&self, collection: &str) -> MessageStream;

    /// Highest token any context has published for `collection`, when known.
    fn sync_marker(&self, collection: &str) -> Option<VersionToken>;
}

/// Origin-wide broadcast channel for invalidation messages.
pub struct InvalidationHub {
    sender: broadcast::Sender<InvalidationMessage>,
    markers: RwLock<HashMap<String, VersionToken>>,
    closed: RwLock<bool>,
}

impl InvalidationHub {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            markers: RwLock::new(HashMap::new()),
            closed: RwLock::new(false),
        }
    }

    pub fn from_config(config: &CoherenceConfig) -> Self {
        Self::new(config.channel_capacity_non_zero().get())
    }

    /// Broadcast `message`. Having no listeners is not a failure.
    pub fn publish(&self, message: &InvalidationMessage) -> Result<usize, DeliveryError> {
        if *rw_read(&self.closed, SOURCE, "publish") {
            return Err(DeliveryError::HubClosed);
        }

        {
            let mut markers = rw_write(&self.markers, SOURCE, "publish");
            let marker = markers.entry(message.collection.clone()).or_default();
            if message.version_token > *marker {
                *marker = message.version_token;
            }
        }

        match self.sender.send(message.clone()) {
            Ok(receivers) => Ok(receivers),
            Err(_) => {
                debug!(
                    collection = %message.collection,
                    version_token = %message.version_token,
                    "invalidation broadcast had no listeners"
                );
                Ok(0)
            }
        }
    }

    pub fn receiver(&self) -> broadcast::Receiver<InvalidationMessage> {
        self.sender.subscribe()
    }

    /// Stream of every message, dropping whatever a lagging receiver missed.
    pub fn stream(&self) -> MessageStream {
        let mut receiver = self.receiver();
        Box::pin(stream! {
            loop {
                match receiver.recv().await {
                    Ok(message) => yield message,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "invalidation receiver lagged, messages dropped");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }

    pub fn marker(&self, collection: &str) -> Option<VersionToken> {
        rw_read(&self.markers, SOURCE, "marker")
            .get(collection)
            .copied()
    }

    /// Refuse further publications. Existing receivers drain what was already sent.
    pub fn close(&self) {
        *rw_write(&self.closed, SOURCE, "close") = true;
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for InvalidationHub {
    fn default() -> Self {
        Self::from_config(&CoherenceConfig::default())
    }
}

pub struct BroadcastTransport {
    hub: Arc<InvalidationHub>,
}

impl BroadcastTransport {
    pub fn new(hub: Arc<InvalidationHub>) -> Self {
        Self { hub }
    }
}

impl PubSub for BroadcastTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Broadcast
    }

    fn publish(&self, message: &InvalidationMessage) -> Result<(), DeliveryError> {
        self.hub.publish(message).map(|_| ())
    }

    fn subscribe(&self, collection: &str) -> MessageStream {
        let collection = collection.to_string();
        let mut messages = self.hub.stream();
        Box::pin(stream! {
            while let Some(message) = messages.next().await {
                if message.collection == collection {
                    yield message;
                }
            }
        })
    }

    fn sync_marker(&self, collection: &str) -> Option<VersionToken> {
        self.hub.marker(collection)
    }
}

pub struct StorageTransport {
    storage: Arc<OriginStorage>,
    context: ContextId,
}

impl StorageTransport {
    pub fn new(storage: Arc<OriginStorage>, context: ContextId) -> Self {
        Self { storage, context }
    }
}

impl PubSub for StorageTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Storage
    }

    /// The record only ever moves forward: a message older than the stored one is not
    /// written, so the record doubles as the sync marker.
    fn publish(&self, message: &InvalidationMessage) -> Result<(), DeliveryError> {
        let payload = serde_json::to_string(message)?;
        let key = coherence_key(&message.collection);
        let written = self.storage.write_if(self.context, &key, &payload, |current| {
            current
                .and_then(decode_token)
                .is_none_or(|stored| stored < message.version_token)
        })?;
        if !written {
            debug!(
                %key,
                version_token = %message.version_token,
                "coherence record already newer, message not written"
            );
        }
        Ok(())
    }

    fn subscribe(&self, collection: &str) -> MessageStream {
        let key = coherence_key(collection);
        let own = self.context;
        let mut changes = self.storage.subscribe();
        Box::pin(stream! {
            loop {
                let change = match changes.recv().await {
                    Ok(change) => change,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "storage change listener lagged, messages dropped");
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                };
                if change.writer == own || change.key != key {
                    continue;
                }
                let Some(payload) = change.new_value else {
                    continue;
                };
                match serde_json::from_str::<InvalidationMessage>(&payload) {
                    Ok(message) => yield message,
                    Err(err) => warn!(key = %change.key, error = %err, "unreadable coherence record"),
                }
            }
        })
    }

    fn sync_marker(&self, collection: &str) -> Option<VersionToken> {
        let payload = self.storage.read(&coherence_key(collection))?;
        decode_token(&payload)
    }
}

fn decode_token(payload: &str) -> Option<VersionToken> {
    serde_json::from_str::<InvalidationMessage>(payload)
        .ok()
        .map(|message| message.version_token)
}

/// Shared environment of every context loaded from one origin.
#[derive(Clone)]
pub struct Origin {
    hub: Option<Arc<InvalidationHub>>,
    storage: Arc<OriginStorage>,
}

impl Origin {
    pub fn new(hub: Option<Arc<InvalidationHub>>, storage: Arc<OriginStorage>) -> Self {
        Self { hub, storage }
    }

    pub fn from_config(config: &CoherenceConfig) -> Self {
        Self::new(
            Some(Arc::new(InvalidationHub::from_config(config))),
            Arc::new(OriginStorage::new(Some(config.storage_quota_bytes))),
        )
    }

    /// An origin without a broadcast primitive.
    pub fn storage_only(storage: Arc<OriginStorage>) -> Self {
        Self::new(None, storage)
    }

    pub fn hub(&self) -> Option<&Arc<InvalidationHub>> {
        self.hub.as_ref()
    }

    pub fn storage(&self) -> &Arc<OriginStorage> {
        &self.storage
    }

    /// Transport for `context`, preferring `kind` when the origin supports it.
    pub fn transport_for(&self, kind: TransportKind, context: ContextId) -> Arc<dyn PubSub> {
        match (kind, &self.hub) {
            (TransportKind::Broadcast, Some(hub)) => Arc::new(BroadcastTransport::new(hub.clone())),
            (TransportKind::Broadcast, None) => {
                warn!(%context, "broadcast transport unavailable, falling back to storage");
                Arc::new(StorageTransport::new(self.storage.clone(), context))
            }
            (TransportKind::Storage, _) => {
                Arc::new(StorageTransport::new(self.storage.clone(), context))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;
    use crate::cache::events::MessageKind;

    fn message(collection: &str, token: i64, origin: ContextId) -> InvalidationMessage {
        InvalidationMessage::new(
            collection,
            MessageKind::Updated,
            Some(Uuid::new_v4()),
            VersionToken::new(token),
            origin,
        )
    }

    #[tokio::test]
    async fn broadcast_filters_by_collection_and_tracks_marker() {
        let hub = Arc::new(InvalidationHub::new(16));
        let transport = BroadcastTransport::new(hub.clone());
        let mut articles = transport.subscribe("articles");
        let origin = ContextId::random();

        transport.publish(&message("categories", 3, origin)).expect("publish");
        transport.publish(&message("articles", 7, origin)).expect("publish");

        let received = articles.next().await.expect("message");
        assert_eq!(received.collection, "articles");
        assert_eq!(received.version_token, VersionToken::new(7));
        assert_eq!(transport.sync_marker("articles"), Some(VersionToken::new(7)));
        assert_eq!(transport.sync_marker("categories"), Some(VersionToken::new(3)));
    }

    #[test]
    fn closed_hub_reports_delivery_failure() {
        let hub = InvalidationHub::new(4);
        hub.close();
        let err = hub
            .publish(&message("articles", 1, ContextId::random()))
            .expect_err("closed");
        assert!(matches!(err, DeliveryError::HubClosed));
        assert_eq!(hub.marker("articles"), None);
    }

    #[tokio::test]
    async fn storage_transport_skips_own_writes() {
        let storage = Arc::new(OriginStorage::default());
        let a = ContextId::random();
        let b = ContextId::random();
        let transport_a = StorageTransport::new(storage.clone(), a);
        let transport_b = StorageTransport::new(storage.clone(), b);
        let mut seen_by_a = transport_a.subscribe("articles");
        let mut seen_by_b = transport_b.subscribe("articles");

        transport_a.publish(&message("articles", 11, a)).expect("publish");
        transport_b.publish(&message("articles", 12, b)).expect("publish");

        assert_eq!(seen_by_b.next().await.expect("b sees a").version_token.get(), 11);
        assert_eq!(seen_by_a.next().await.expect("a sees b").version_token.get(), 12);
        assert_eq!(transport_a.sync_marker("articles"), Some(VersionToken::new(12)));
    }

    #[test]
    fn storage_marker_never_moves_backwards() {
        let storage = Arc::new(OriginStorage::default());
        let a = ContextId::random();
        let b = ContextId::random();
        let transport_a = StorageTransport::new(storage.clone(), a);
        let transport_b = StorageTransport::new(storage.clone(), b);
        let mut changes = storage.subscribe();

        transport_a.publish(&message("articles", 12, a)).expect("publish");
        transport_b.publish(&message("articles", 11, b)).expect("late lower publish");

        assert_eq!(transport_a.sync_marker("articles"), Some(VersionToken::new(12)));
        assert_eq!(transport_b.sync_marker("articles"), Some(VersionToken::new(12)));
        assert_eq!(changes.try_recv().expect("first write").writer, a);
        assert!(changes.try_recv().is_err());
    }

    #[test]
    fn storage_quota_failure_is_a_delivery_error() {
        let storage = Arc::new(OriginStorage::new(Some(16)));
        let transport = StorageTransport::new(storage, ContextId::random());
        let err = transport
            .publish(&message("articles", 1, ContextId::random()))
            .expect_err("quota");
        assert!(matches!(err, DeliveryError::Storage(StoreError::QuotaExceeded { .. })));
    }

    #[test]
    fn origin_without_hub_falls_back_to_storage() {
        let origin = Origin::storage_only(Arc::new(OriginStorage::default()));
        let transport = origin.transport_for(TransportKind::Broadcast, ContextId::random());
        assert_eq!(transport.kind(), TransportKind::Storage);

        let origin = Origin::from_config(&CoherenceConfig::default());
        let transport = origin.transport_for(TransportKind::Broadcast, ContextId::random());
        assert_eq!(transport.kind(), TransportKind::Broadcast);
    }
}
