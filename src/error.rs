use std::fmt;

/// Misuse of the bridge's threading contract. Always a programming error.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// A thread with no assigned role tried to touch the bridge.
    #[error("{operation} called from unrecognised thread '{thread}'")]
    ThreadingViolation {
        /// Bridge operation that was attempted.
        operation: &'static str,
        /// Name or id of the offending thread.
        thread: String,
    },

    /// A main-thread-only operation was attempted from the background thread.
    #[error("{operation} is main-thread only but was called from the background thread")]
    WrongThread {
        /// Bridge operation that was attempted.
        operation: &'static str,
    },
}

/// Rejected timer requests.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TimerError {
    #[error("timer delay must not be negative (got {0})")]
    NegativeDelay(f64),

    #[error("repeating timers need a positive period (got {0})")]
    NonPositivePeriod(f64),

    #[error("timer due time must be finite (got {0})")]
    NonFiniteTime(f64),
}

/// A listener that raised an error while handling an event.
#[derive(Debug, Clone, PartialEq)]
pub struct ListenerFailure {
    pub event: String,
    pub listener: String,
    pub message: String,
}

impl ListenerFailure {
    pub fn new(event: impl Into<String>, listener: impl Into<String>, message: impl Into<String>) -> Self {
        Self { event: event.into(), listener: listener.into(), message: message.into() }
    }
}

impl fmt::Display for ListenerFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener '{}' for '{}' failed: {}", self.listener, self.event, self.message)
    }
}
