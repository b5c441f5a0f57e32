use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};

use tracing::{debug, error, trace, warn};

use crate::error::{DispatchError, ListenerFailure};
use crate::events::{Event, Payload, Response};
use crate::handle_cache::HandleCache;
use crate::identity::FilterKey;
use crate::queue::BackgroundQueue;
use crate::thread_role::{current_thread_label, ThreadRole};

/// Result of running one event's listeners.
#[derive(Debug, Clone, Default)]
pub struct Invocation {
    /// Payload as the listeners left it.
    pub response: Payload,
    /// Listeners that raised errors. The rest still ran.
    pub failures: Vec<ListenerFailure>,
}

impl Invocation {
    pub fn completed(response: Payload) -> Self {
        Self { response, failures: Vec::new() }
    }
}

/// The subsystem that owns per-event listener lists and calls them in order.
///
/// Only ever driven from the main thread, but it is stored behind the dispatcher
/// which both threads share, hence `Send`.
pub trait ListenerInvoker: Send {
    /// Fast path: false lets the dispatcher skip building the payload.
    fn is_event_enabled(&self, _event: &str) -> bool {
        true
    }

    fn invoke(&mut self, event: &str, payload: Payload, filter: Option<FilterKey>) -> Invocation;
}

#[derive(Debug, Default)]
struct Counters {
    dispatched: AtomicU64,
    queued: AtomicU64,
    skipped: AtomicU64,
    deferred: AtomicU64,
    listener_failures: AtomicU64,
    rejected: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub dispatched: u64,
    pub queued: u64,
    pub skipped: u64,
    pub deferred: u64,
    pub listener_failures: u64,
    pub rejected: u64,
}

/// Single entry point for native call sites. Shared by both threads through an `Arc`.
pub struct Dispatcher {
    queue: BackgroundQueue,
    /// Main-thread submits made while a listener was running.
    deferred: BackgroundQueue,
    cache: Arc<HandleCache>,
    invoker: Mutex<Box<dyn ListenerInvoker>>,
    counters: Counters,
}

impl Dispatcher {
    pub fn new(cache: Arc<HandleCache>, invoker: Box<dyn ListenerInvoker>, queue_warn_threshold: usize) -> Self {
        Self {
            queue: BackgroundQueue::new(queue_warn_threshold),
            deferred: BackgroundQueue::default(),
            cache,
            invoker: Mutex::new(invoker),
            counters: Counters::default(),
        }
    }

    /// Routes an event according to the calling thread's role.
    ///
    /// Main thread: drains queued background events, then runs this one and returns its
    /// response. Background thread: queues and returns [`Response::Queued`]. Anything else
    /// is rejected and the event is dropped.
    pub fn submit(&self, event: Event) -> Result<Response, DispatchError> {
        match ThreadRole::current() {
            Some(ThreadRole::Main) => Ok(self.submit_on_main(event)),
            Some(ThreadRole::Background) => {
                trace!(event = %event.name(), "queued background event");
                self.queue.enqueue(event);
                self.counters.queued.fetch_add(1, Ordering::Relaxed);
                Ok(Response::Queued)
            }
            None => {
                let thread = current_thread_label();
                error!(event = %event.name(), %thread, "event submitted from a thread with no bridge role; dropped");
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                Err(DispatchError::ThreadingViolation { operation: "submit", thread })
            }
        }
    }

    /// Runs every queued background event, oldest first. Main thread only.
    pub fn drain(&self) -> Result<usize, DispatchError> {
        self.require_main("drain")?;
        match self.try_lock_invoker() {
            Some(mut invoker) => Ok(self.drain_locked(invoker.as_mut())),
            // Re-entered from a listener; the outer dispatch drains when it finishes.
            None => Ok(0),
        }
    }

    pub fn pending(&self) -> usize {
        self.queue.len() + self.deferred.len()
    }

    pub fn stats(&self) -> DispatchStats {
        let c = &self.counters;
        DispatchStats {
            dispatched: c.dispatched.load(Ordering::Relaxed),
            queued: c.queued.load(Ordering::Relaxed),
            skipped: c.skipped.load(Ordering::Relaxed),
            deferred: c.deferred.load(Ordering::Relaxed),
            listener_failures: c.listener_failures.load(Ordering::Relaxed),
            rejected: c.rejected.load(Ordering::Relaxed),
        }
    }

    pub fn cache(&self) -> &Arc<HandleCache> {
        &self.cache
    }

    /// Drops queued events without running them. Used when tearing down.
    pub(crate) fn discard_pending(&self) -> usize {
        self.queue.discard() + self.deferred.discard()
    }

    pub(crate) fn require_main(&self, operation: &'static str) -> Result<(), DispatchError> {
        match ThreadRole::current() {
            Some(ThreadRole::Main) => Ok(()),
            Some(ThreadRole::Background) => {
                error!(operation, "main-thread operation attempted from background thread");
                Err(DispatchError::WrongThread { operation })
            }
            None => {
                let thread = current_thread_label();
                error!(operation, %thread, "bridge operation from a thread with no bridge role");
                Err(DispatchError::ThreadingViolation { operation, thread })
            }
        }
    }

    fn submit_on_main(&self, event: Event) -> Response {
        let Some(mut invoker) = self.try_lock_invoker() else {
            // A listener is still running for an earlier event. Run this one after it.
            debug!(event = %event.name(), "nested submit deferred until current event completes");
            self.deferred.enqueue(event);
            self.counters.deferred.fetch_add(1, Ordering::Relaxed);
            return Response::Deferred;
        };
        self.drain_locked(invoker.as_mut());
        let response = self.dispatch_locked(invoker.as_mut(), event);
        self.run_deferred(invoker.as_mut());
        self.drain_locked(invoker.as_mut());
        response
    }

    fn try_lock_invoker(&self) -> Option<MutexGuard<'_, Box<dyn ListenerInvoker>>> {
        match self.invoker.try_lock() {
            Ok(guard) => Some(guard),
            Err(TryLockError::Poisoned(poisoned)) => {
                warn!("listener invoker lock poisoned by an earlier panic; continuing");
                Some(poisoned.into_inner())
            }
            Err(TryLockError::WouldBlock) => None,
        }
    }

    fn drain_locked(&self, invoker: &mut dyn ListenerInvoker) -> usize {
        let drained = self.queue.drain_with(|event| {
            self.dispatch_locked(&mut *invoker, event);
            self.run_deferred(&mut *invoker);
        });
        if drained > 0 {
            trace!(drained, "drained background events");
        }
        drained
    }

    /// Runs nested submits in order, including any they submit in turn.
    fn run_deferred(&self, invoker: &mut dyn ListenerInvoker) {
        while let Some(event) = self.deferred.pop() {
            self.dispatch_locked(&mut *invoker, event);
        }
    }

    fn dispatch_locked(&self, invoker: &mut dyn ListenerInvoker, event: Event) -> Response {
        if !invoker.is_event_enabled(event.name()) {
            self.counters.skipped.fetch_add(1, Ordering::Relaxed);
            return Response::Skipped;
        }
        let (name, filter, payload) = event.build(&self.cache);
        let Invocation { response, failures } = invoker.invoke(&name, payload, filter);
        self.counters.dispatched.fetch_add(1, Ordering::Relaxed);
        for failure in failures {
            self.counters.listener_failures.fetch_add(1, Ordering::Relaxed);
            warn!(
                event = %failure.event,
                listener = %failure.listener,
                error = %failure.message,
                "event listener failed"
            );
        }
        Response::Completed(response)
    }
}
