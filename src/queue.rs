use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::warn;

use crate::events::Event;

/// Locked FIFO the background thread pushes into and the main thread drains.
#[derive(Debug)]
pub struct BackgroundQueue {
    events: Mutex<VecDeque<Event>>,
    warn_threshold: usize,
}

impl Default for BackgroundQueue {
    fn default() -> Self {
        Self::new(0)
    }
}

impl BackgroundQueue {
    /// `warn_threshold` of zero disables the backlog warning.
    pub fn new(warn_threshold: usize) -> Self {
        Self { events: Mutex::new(VecDeque::new()), warn_threshold }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<Event>> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn enqueue(&self, event: Event) {
        let mut events = self.lock();
        events.push_back(event);
        let len = events.len();
        if self.warn_threshold > 0 && len == self.warn_threshold {
            warn!(len, "background event backlog reached warning threshold; is the main thread ticking?");
        }
    }

    /// Pops the oldest event. The lock is released before the caller dispatches it,
    /// so the background side never waits on listener execution.
    pub fn pop(&self) -> Option<Event> {
        self.lock().pop_front()
    }

    /// Hands the events queued at the time of the call to `dispatch`, oldest first.
    ///
    /// Events enqueued while draining wait for the next drain, so a busy producer cannot
    /// hold the main thread here.
    pub fn drain_with(&self, mut dispatch: impl FnMut(Event)) -> usize {
        let batch = self.len();
        let mut drained = 0;
        while drained < batch {
            let Some(event) = self.pop() else {
                break;
            };
            dispatch(event);
            drained += 1;
        }
        drained
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Drops pending events without dispatching them.
    pub fn discard(&self) -> usize {
        let mut events = self.lock();
        let count = events.len();
        events.clear();
        count
    }
}
