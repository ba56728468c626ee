//! Thread-safe subscriber registry keyed by project identity.
//!
//! Copy-on-write: writers clone the map under the lock and swap it in;
//! readers take an `Arc` to the current map and iterate it lock-free. A
//! snapshot never changes after it is taken.

use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};

use tracing::{debug, info};

use ktrigger_core::Subscriber;

type SubscriberMap = BTreeMap<String, Arc<Subscriber>>;

/// Registry of active subscribers. Cheap to clone; clones share state.
#[derive(Clone, Default)]
pub struct SubscriberRegistry {
    current: Arc<RwLock<Arc<SubscriberMap>>>,
}

impl SubscriberRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the subscriber for its project. Returns the
    /// replaced entry, if any.
    pub fn add(&self, subscriber: Subscriber) -> Option<Arc<Subscriber>> {
        let project = subscriber.project.clone();
        let replaced = self.update(|map| map.insert(project.clone(), Arc::new(subscriber)));
        debug!(project = %project, replaced = replaced.is_some(), "subscriber registered");
        replaced
    }

    /// Remove the subscriber for `project`. No-op when absent.
    pub fn remove(&self, project: &str) -> Option<Arc<Subscriber>> {
        let removed = self.update(|map| map.remove(project));
        if removed.is_some() {
            debug!(project = %project, "subscriber unregistered");
        }
        removed
    }

    /// Replace the whole registry contents. Later duplicates win.
    pub fn replace_all(&self, subscribers: impl IntoIterator<Item = Subscriber>) {
        let map: SubscriberMap = subscribers
            .into_iter()
            .map(|s| (s.project.clone(), Arc::new(s)))
            .collect();
        let count = map.len();
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(map);
        info!(subscribers = count, "subscriber registry replaced");
    }

    /// Point-in-time view, safe to iterate while writers proceed.
    pub fn snapshot(&self) -> RegistrySnapshot {
        RegistrySnapshot {
            map: self.current.read().unwrap_or_else(PoisonError::into_inner).clone(),
        }
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn update<R>(&self, f: impl FnOnce(&mut SubscriberMap) -> R) -> R {
        let mut guard = self.current.write().unwrap_or_else(PoisonError::into_inner);
        let mut next = SubscriberMap::clone(&guard);
        let result = f(&mut next);
        *guard = Arc::new(next);
        result
    }
}

/// Immutable view of the registry at one point in time.
#[derive(Clone, Default)]
pub struct RegistrySnapshot {
    map: Arc<SubscriberMap>,
}

impl RegistrySnapshot {
    /// Build a snapshot directly from a list, e.g. for matching in tests.
    pub fn from_subscribers(subscribers: impl IntoIterator<Item = Subscriber>) -> Self {
        Self {
            map: Arc::new(
                subscribers
                    .into_iter()
                    .map(|s| (s.project.clone(), Arc::new(s)))
                    .collect(),
            ),
        }
    }

    pub fn get(&self, project: &str) -> Option<&Arc<Subscriber>> {
        self.map.get(project)
    }

    pub fn contains(&self, project: &str) -> bool {
        self.map.contains_key(project)
    }

    /// Subscribers in project order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<Subscriber>> {
        self.map.values()
    }

    pub fn projects(&self) -> impl Iterator<Item = &str> {
        self.map.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}
