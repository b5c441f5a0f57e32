use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, trace};

use crate::filters::FilterRegistry;
use crate::identity::{Identity, ObjectKind};

struct HandleInner {
    identity: Identity,
    type_name: String,
    valid: AtomicBool,
}

/// Script-visible wrapper bound to one live native object.
///
/// Clones share the same binding; equality is binding identity, not identity value,
/// so a handle created after an evict never compares equal to the stale one.
#[derive(Clone)]
pub struct ScriptHandle {
    inner: Arc<HandleInner>,
}

impl ScriptHandle {
    pub fn new(identity: Identity) -> Self {
        Self::with_type(identity, identity.kind().label())
    }

    pub fn with_type(identity: Identity, type_name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                identity,
                type_name: type_name.into(),
                valid: AtomicBool::new(true),
            }),
        }
    }

    pub fn identity(&self) -> Identity {
        self.inner.identity
    }

    pub fn type_name(&self) -> &str {
        &self.inner.type_name
    }

    /// False once the native object has been destroyed.
    pub fn is_valid(&self) -> bool {
        self.inner.valid.load(Ordering::Acquire)
    }

    pub fn ptr_eq(&self, other: &ScriptHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn invalidate(&self) {
        self.inner.valid.store(false, Ordering::Release);
    }
}

impl PartialEq for ScriptHandle {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl Eq for ScriptHandle {}

impl fmt::Debug for ScriptHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptHandle")
            .field("identity", &self.inner.identity)
            .field("type", &self.inner.type_name)
            .field("valid", &self.is_valid())
            .finish()
    }
}

/// Identity -> handle cache. Eviction is the only removal path.
pub struct HandleCache {
    entries: Mutex<HashMap<Identity, ScriptHandle>>,
    filters: Arc<FilterRegistry>,
}

impl HandleCache {
    pub fn new(filters: Arc<FilterRegistry>) -> Self {
        Self { entries: Mutex::new(HashMap::new()), filters }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Identity, ScriptHandle>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the cached handle for `identity`, building one with `factory` on a miss.
    ///
    /// The factory runs under the cache lock and must not call back into the cache.
    pub fn resolve<F>(&self, identity: Identity, factory: F) -> ScriptHandle
    where
        F: FnOnce() -> ScriptHandle,
    {
        let mut entries = self.lock();
        if let Some(existing) = entries.get(&identity) {
            if existing.is_valid() {
                return existing.clone();
            }
            debug!(%identity, "replacing invalidated handle left in cache");
        }
        let handle = factory();
        if handle.identity() != identity {
            debug!(%identity, built = %handle.identity(), "handle factory returned a different identity");
        }
        entries.insert(identity, handle.clone());
        trace!(%identity, "cached new script handle");
        handle
    }

    /// Resolves with the default handle factory for the identity's kind.
    pub fn resolve_default(&self, identity: Identity) -> ScriptHandle {
        self.resolve(identity, || ScriptHandle::new(identity))
    }

    pub fn get(&self, identity: Identity) -> Option<ScriptHandle> {
        self.lock().get(&identity).cloned()
    }

    /// Drops the binding for a native object that is about to be freed.
    ///
    /// Filtered subscriptions for the identity are cleared in the same critical section.
    /// Absent identities are tolerated: the host may reuse a slot before a late evict lands.
    pub fn evict(&self, identity: Identity) -> bool {
        let mut entries = self.lock();
        let removed = entries.remove(&identity);
        let cleared = self.filters.clear_all(identity);
        drop(entries);
        match removed {
            Some(handle) => {
                handle.invalidate();
                trace!(%identity, cleared, "evicted script handle");
                true
            }
            None => {
                debug!(%identity, cleared, "evict for identity with no cached handle");
                false
            }
        }
    }

    pub fn contains(&self, identity: Identity) -> bool {
        self.lock().contains_key(&identity)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn count_kind(&self, kind: ObjectKind) -> usize {
        self.lock().keys().filter(|identity| identity.kind() == kind).count()
    }

    /// Invalidates and drops every handle. Used on bridge teardown.
    pub fn clear(&self) {
        let mut entries = self.lock();
        for (identity, handle) in entries.drain() {
            handle.invalidate();
            self.filters.clear_all(identity);
        }
    }

    pub fn filters(&self) -> &Arc<FilterRegistry> {
        &self.filters
    }
}
