use std::collections::HashMap;
use std::sync::Arc;

use tracing::trace;

use crate::filters::{FilterRegistry, ListenerId};
use crate::identity::FilterKey;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ListenerOptions {
    /// Higher runs first. Equal priorities run in registration order.
    pub priority: i64,
    /// Restricts the listener to events carrying this key.
    pub filter: Option<FilterKey>,
}

impl ListenerOptions {
    pub fn filtered(filter: impl Into<FilterKey>) -> Self {
        Self { filter: Some(filter.into()), ..Self::default() }
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }
}

#[derive(Debug, Clone)]
struct Listener<C> {
    id: ListenerId,
    callback: C,
    priority: i64,
    filter: Option<FilterKey>,
}

/// Per-event ordered callback lists.
///
/// Object-filtered listeners are mirrored into the shared [`FilterRegistry`]; once the cache
/// evicts their target the mirror entry is gone and the listener never matches again.
pub struct ListenerRegistry<C> {
    events: HashMap<String, Vec<Listener<C>>>,
    filters: Arc<FilterRegistry>,
    next_id: u64,
}

impl<C: Clone> ListenerRegistry<C> {
    pub fn new(filters: Arc<FilterRegistry>) -> Self {
        Self { events: HashMap::new(), filters, next_id: 1 }
    }

    pub fn register(&mut self, event: &str, callback: C, options: ListenerOptions) -> ListenerId {
        let id = ListenerId(self.next_id);
        self.next_id += 1;
        if let Some(key) = options.filter {
            self.filters.subscribe(event, key, id);
        }
        let listeners = self.events.entry(event.to_string()).or_default();
        let position = listeners.partition_point(|existing| existing.priority >= options.priority);
        listeners.insert(position, Listener { id, callback, priority: options.priority, filter: options.filter });
        trace!(
            event,
            listener = id.0,
            priority = options.priority,
            filtered = options.filter.is_some(),
            "registered listener"
        );
        id
    }

    pub fn unregister(&mut self, event: &str, id: ListenerId) -> bool {
        self.remove_where(event, |listener| listener.id == id) > 0
    }

    /// Removes every listener for `event` whose callback satisfies `matches`.
    pub fn unregister_where(&mut self, event: &str, matches: impl Fn(&C) -> bool) -> usize {
        self.remove_where(event, |listener| matches(&listener.callback))
    }

    fn remove_where(&mut self, event: &str, matches: impl Fn(&Listener<C>) -> bool) -> usize {
        let Some(listeners) = self.events.get_mut(event) else {
            return 0;
        };
        let mut removed = 0;
        let filters = &self.filters;
        listeners.retain(|listener| {
            if !matches(listener) {
                return true;
            }
            if let Some(key) = listener.filter {
                filters.unsubscribe(event, key, listener.id);
            }
            removed += 1;
            false
        });
        if listeners.is_empty() {
            self.events.remove(event);
        }
        removed
    }

    pub fn is_registered(&self, event: &str, id: ListenerId) -> bool {
        self.any_live(event, |listener| listener.id == id)
    }

    pub fn is_registered_where(&self, event: &str, matches: impl Fn(&C) -> bool) -> bool {
        self.any_live(event, |listener| matches(&listener.callback))
    }

    /// True when at least one live listener exists for `event`.
    pub fn is_event_enabled(&self, event: &str) -> bool {
        self.any_live(event, |_| true)
    }

    fn any_live(&self, event: &str, matches: impl Fn(&Listener<C>) -> bool) -> bool {
        self.events.get(event).is_some_and(|listeners| {
            listeners.iter().any(|listener| matches(listener) && self.is_live(event, listener))
        })
    }

    fn is_live(&self, event: &str, listener: &Listener<C>) -> bool {
        match listener.filter {
            Some(key @ FilterKey::Object(_)) => self.filters.contains(event, key, listener.id),
            _ => true,
        }
    }

    /// Listeners that should see an event, in call order.
    ///
    /// Unfiltered listeners always match; filtered ones only when the event carries the same
    /// key. Listeners whose object filter was evicted are dropped here.
    pub fn snapshot(&mut self, event: &str, filter: Option<FilterKey>) -> Vec<(ListenerId, C)> {
        let Some(listeners) = self.events.get(event) else {
            return Vec::new();
        };
        let stale: Vec<ListenerId> = listeners
            .iter()
            .filter(|listener| !self.is_live(event, listener))
            .map(|listener| listener.id)
            .collect();
        if !stale.is_empty() {
            trace!(event, pruned = stale.len(), "pruning listeners for evicted targets");
            self.remove_where(event, |listener| stale.contains(&listener.id));
        }
        self.events
            .get(event)
            .map(|listeners| {
                listeners
                    .iter()
                    .filter(|listener| listener.filter.is_none() || listener.filter == filter)
                    .map(|listener| (listener.id, listener.callback.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn listener_count(&self, event: &str) -> usize {
        self.events.get(event).map_or(0, Vec::len)
    }

    pub fn clear(&mut self) {
        for (event, listeners) in self.events.drain() {
            for listener in listeners {
                if let Some(key) = listener.filter {
                    self.filters.unsubscribe(&event, key, listener.id);
                }
            }
        }
    }

    pub fn filters(&self) -> &Arc<FilterRegistry> {
        &self.filters
    }
}
