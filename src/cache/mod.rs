//! Cross-context cache coherence.
//!
//! Each context keeps a [`CoherentCache`] per collection. Mutations advance a
//! monotonic [`VersionToken`] and broadcast an [`InvalidationMessage`] over a
//! [`PubSub`] transport; receivers drop their entry only for strictly newer tokens,
//! which makes delivery safe to repeat and reorder.
//!
//! ## Configuration
//!
//! ```toml
//! [coherence]
//! validity_window_ms = 30000
//! grace_period_ms = 175
//! transport = "broadcast"
//! ```

mod clock;
mod config;
mod context;
mod entry;
mod events;
mod keys;
mod orchestrator;
mod registry;
mod store;
mod transport;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{CoherenceConfig, MAX_GRACE_PERIOD_MS, MIN_GRACE_PERIOD_MS, TransportKind};
pub use context::{
    CacheError, CoherentCache, CollectionSource, ContextParts, Fetched, Invalidation,
    MessageDisposition, SourceError,
};
pub use entry::{CacheEntry, EntryState};
pub use events::{ContextId, InvalidationMessage, MessageKind, VersionToken};
pub use keys::{coherence_key, snapshot_key, version_key};
pub use orchestrator::{
    Committed, ConsistencyOrchestrator, Convergence, MutationError, MutationOutcome,
};
pub use registry::{ChangeNotice, ChangeReason, SubscriberRegistry, SubscriptionId};
pub use store::{ContextStore, MemoryContextStore, OriginStorage, StorageChange, StoreError};
pub use transport::{
    BroadcastTransport, DeliveryError, InvalidationHub, MessageStream, Origin, PubSub,
    StorageTransport,
};
