use std::cell::Cell;
use std::fmt;
use std::marker::PhantomData;

thread_local! {
    static CURRENT_ROLE: Cell<Option<ThreadRole>> = const { Cell::new(None) };
}

/// Which side of the bridge a thread plays. Assigned once when the worker starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ThreadRole {
    /// Owns the script runtime; the only thread allowed to run listeners and timers.
    Main,
    /// Streams/loads data; may only queue events.
    Background,
}

impl ThreadRole {
    /// Role tagged on the calling thread, if any.
    pub fn current() -> Option<ThreadRole> {
        CURRENT_ROLE.with(Cell::get)
    }

    /// Tags the calling thread until the guard drops.
    pub fn assign(self) -> RoleGuard {
        let previous = CURRENT_ROLE.with(|slot| slot.replace(Some(self)));
        RoleGuard { previous, _not_send: PhantomData }
    }

    pub fn label(self) -> &'static str {
        match self {
            ThreadRole::Main => "main",
            ThreadRole::Background => "background",
        }
    }
}

impl fmt::Display for ThreadRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Restores the thread's previous role on drop. Pinned to the thread that created it.
#[must_use = "the role is cleared as soon as the guard is dropped"]
pub struct RoleGuard {
    previous: Option<ThreadRole>,
    _not_send: PhantomData<*const ()>,
}

impl Drop for RoleGuard {
    fn drop(&mut self) {
        let previous = self.previous;
        CURRENT_ROLE.with(|slot| slot.set(previous));
    }
}

/// Name used in diagnostics for the calling thread.
pub(crate) fn current_thread_label() -> String {
    let thread = std::thread::current();
    match thread.name() {
        Some(name) => name.to_string(),
        None => format!("{:?}", thread.id()),
    }
}
