//! Subscriber registry.
//!
//! Views register a callback when they mount and drop it on teardown. Callbacks run
//! outside the registry lock, so a callback may subscribe or unsubscribe.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use uuid::Uuid;

use crate::util::lock::{rw_read, rw_write};

use super::events::{MessageKind, VersionToken};

const SOURCE: &str = "cache::registry";

/// Why subscribers are being told to re-render.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "origin", content = "kind", rename_all = "snake_case")]
pub enum ChangeReason {
    /// This context invalidated after its own mutation.
    Local(MessageKind),
    /// Another context's invalidation was accepted.
    Remote(MessageKind),
    /// The entry was explicitly flushed.
    Flushed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChangeNotice {
    pub collection: String,
    pub reason: ChangeReason,
    pub entity_id: Option<Uuid>,
    pub version_token: VersionToken,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriptionId(u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

type Callback = Arc<dyn Fn(&ChangeNotice) + Send + Sync>;

pub struct SubscriberRegistry {
    next_id: AtomicU64,
    subscribers: RwLock<BTreeMap<SubscriptionId, Callback>>,
}

impl SubscriberRegistry {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            subscribers: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&ChangeNotice) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        rw_write(&self.subscribers, SOURCE, "subscribe").insert(id, Arc::new(callback));
        id
    }

    /// Returns whether the id was registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        rw_write(&self.subscribers, SOURCE, "unsubscribe")
            .remove(&id)
            .is_some()
    }

    /// Invoke every callback in registration order. Returns how many ran.
    pub fn notify(&self, notice: &ChangeNotice) -> usize {
        let callbacks: Vec<Callback> = rw_read(&self.subscribers, SOURCE, "notify")
            .values()
            .cloned()
            .collect();
        for callback in &callbacks {
            callback(notice);
        }
        callbacks.len()
    }

    pub fn len(&self) -> usize {
        rw_read(&self.subscribers, SOURCE, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        rw_write(&self.subscribers, SOURCE, "clear").clear();
    }
}

impl Default for SubscriberRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    fn notice() -> ChangeNotice {
        ChangeNotice {
            collection: "articles".into(),
            reason: ChangeReason::Remote(MessageKind::Created),
            entity_id: None,
            version_token: VersionToken::new(6),
        }
    }

    #[test]
    fn notify_reaches_every_subscriber_until_unsubscribed() {
        let registry = SubscriberRegistry::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let first = {
            let seen = seen.clone();
            registry.subscribe(move |n: &ChangeNotice| {
                seen.lock().expect("seen").push(("first", n.version_token))
            })
        };
        {
            let seen = seen.clone();
            registry.subscribe(move |n: &ChangeNotice| {
                seen.lock().expect("seen").push(("second", n.version_token))
            });
        }

        assert_eq!(registry.notify(&notice()), 2);
        assert!(registry.unsubscribe(first));
        assert!(!registry.unsubscribe(first));
        assert_eq!(registry.notify(&notice()), 1);

        let seen = seen.lock().expect("seen");
        assert_eq!(
            *seen,
            vec![
                ("first", VersionToken::new(6)),
                ("second", VersionToken::new(6)),
                ("second", VersionToken::new(6)),
            ]
        );
    }

    #[test]
    fn callback_may_unsubscribe_itself() {
        let registry = Arc::new(SubscriberRegistry::new());
        let slot: Arc<Mutex<Option<SubscriptionId>>> = Arc::new(Mutex::new(None));

        let id = {
            let registry_in_cb = Arc::downgrade(&registry);
            let slot = slot.clone();
            registry.subscribe(move |_: &ChangeNotice| {
                if let (Some(registry), Some(id)) =
                    (registry_in_cb.upgrade(), *slot.lock().expect("slot"))
                {
                    registry.unsubscribe(id);
                }
            })
        };
        *slot.lock().expect("slot") = Some(id);

        registry.notify(&notice());
        assert!(registry.is_empty());
    }
}
