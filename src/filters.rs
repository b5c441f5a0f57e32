use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use smallvec::SmallVec;
use tracing::trace;

use crate::identity::{FilterKey, Identity};

/// Listener registration id, shared with [`crate::listeners::ListenerRegistry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(pub u64);

type Subscribers = SmallVec<[ListenerId; 2]>;

/// Tracks which listeners are scoped to a particular target.
///
/// Keyed by filter key first so eviction of an identity is a single removal.
#[derive(Debug, Default)]
pub struct FilterRegistry {
    by_key: Mutex<HashMap<FilterKey, HashMap<String, Subscribers>>>,
}

impl FilterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<FilterKey, HashMap<String, Subscribers>>> {
        self.by_key.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn subscribe(&self, event: &str, key: FilterKey, listener: ListenerId) {
        let mut map = self.lock();
        let subscribers = map.entry(key).or_default().entry(event.to_string()).or_default();
        if !subscribers.contains(&listener) {
            subscribers.push(listener);
        }
    }

    /// Drops one listener's subscription. Returns false if it was already gone.
    pub fn unsubscribe(&self, event: &str, key: FilterKey, listener: ListenerId) -> bool {
        let mut map = self.lock();
        let Some(events) = map.get_mut(&key) else {
            return false;
        };
        let Some(subscribers) = events.get_mut(event) else {
            return false;
        };
        let before = subscribers.len();
        subscribers.retain(|id| *id != listener);
        let removed = subscribers.len() != before;
        if subscribers.is_empty() {
            events.remove(event);
        }
        if events.is_empty() {
            map.remove(&key);
        }
        removed
    }

    /// Cheap check for call sites: does anyone care about `event` for this target?
    pub fn is_subscribed(&self, event: &str, key: FilterKey) -> bool {
        self.lock()
            .get(&key)
            .and_then(|events| events.get(event))
            .is_some_and(|subscribers| !subscribers.is_empty())
    }

    pub fn contains(&self, event: &str, key: FilterKey, listener: ListenerId) -> bool {
        self.lock()
            .get(&key)
            .and_then(|events| events.get(event))
            .is_some_and(|subscribers| subscribers.contains(&listener))
    }

    /// Removes every subscription scoped to `identity`, across all event names.
    pub fn clear_all(&self, identity: Identity) -> usize {
        let removed = self
            .lock()
            .remove(&FilterKey::Object(identity))
            .map(|events| events.values().map(|subscribers| subscribers.len()).sum())
            .unwrap_or(0);
        if removed > 0 {
            trace!(%identity, removed, "cleared filtered subscriptions");
        }
        removed
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscriptions_are_scoped_per_target() {
        let registry = FilterRegistry::new();
        let a = FilterKey::Object(Identity::mobile(0xA0));
        let b = FilterKey::Object(Identity::mobile(0xB0));
        registry.subscribe("damage", a, ListenerId(1));
        assert!(registry.is_subscribed("damage", a));
        assert!(!registry.is_subscribed("damage", b));
        assert!(!registry.is_subscribed("activate", a));
    }

    #[test]
    fn clear_all_sweeps_every_event_for_identity() {
        let registry = FilterRegistry::new();
        let target = Identity::object(0x10);
        let other = Identity::object(0x20);
        registry.subscribe("damage", target.into(), ListenerId(1));
        registry.subscribe("activate", target.into(), ListenerId(2));
        registry.subscribe("damage", other.into(), ListenerId(3));
        registry.subscribe("skillRaised", FilterKey::Value(4), ListenerId(4));

        assert_eq!(registry.clear_all(target), 2);
        assert!(!registry.is_subscribed("damage", target.into()));
        assert!(!registry.is_subscribed("activate", target.into()));
        assert!(registry.is_subscribed("damage", other.into()));
        assert!(registry.is_subscribed("skillRaised", FilterKey::Value(4)));
        assert_eq!(registry.clear_all(target), 0);
    }

    #[test]
    fn unsubscribe_prunes_empty_entries() {
        let registry = FilterRegistry::new();
        let key = FilterKey::Value(9);
        registry.subscribe("skillRaised", key, ListenerId(5));
        registry.subscribe("skillRaised", key, ListenerId(5));
        assert!(registry.unsubscribe("skillRaised", key, ListenerId(5)));
        assert!(!registry.unsubscribe("skillRaised", key, ListenerId(5)));
        assert!(registry.is_empty());
    }
}
