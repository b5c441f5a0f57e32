pub mod bridge;
pub mod cli;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod filters;
pub mod handle_cache;
pub mod host;
pub mod identity;
pub mod listeners;
pub mod logging;
pub mod queue;
pub mod scripts;
pub mod thread_role;
pub mod timers;

pub use bridge::{Bridge, BridgeServices, FrameInput, FrameReport};
pub use dispatcher::{Dispatcher, Invocation, ListenerInvoker};
pub use error::{DispatchError, ListenerFailure, TimerError};
pub use events::{BuiltinEvent, Event, Payload, Response};
pub use handle_cache::{HandleCache, ScriptHandle};
pub use identity::{FilterKey, Identity, ObjectKind};
pub use thread_role::{RoleGuard, ThreadRole};
pub use timers::{ClockDomain, Repeat, SharedTimers, TimerId};
