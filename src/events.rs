use std::borrow::Cow;
use std::fmt;

use rhai::{Dynamic, Map, FLOAT};

use crate::handle_cache::HandleCache;
use crate::identity::FilterKey;

/// Key/value table handed to listeners.
pub type Payload = Map;

pub type PayloadBuilder = Box<dyn FnOnce(&HandleCache) -> Payload + Send>;

/// One native notification. Owned by its creator until submitted, then by the dispatcher.
///
/// The payload is only built once dispatch proceeds, so call sites pay nothing when no
/// listener is registered.
pub struct Event {
    name: Cow<'static, str>,
    filter: Option<FilterKey>,
    build: PayloadBuilder,
}

impl Event {
    pub fn new<F>(name: impl Into<Cow<'static, str>>, build: F) -> Self
    where
        F: FnOnce(&HandleCache) -> Payload + Send + 'static,
    {
        Self { name: name.into(), filter: None, build: Box::new(build) }
    }

    pub fn filtered<F>(name: impl Into<Cow<'static, str>>, key: impl Into<FilterKey>, build: F) -> Self
    where
        F: FnOnce(&HandleCache) -> Payload + Send + 'static,
    {
        Self { name: name.into(), filter: Some(key.into()), build: Box::new(build) }
    }

    /// Event with an empty payload.
    pub fn generic(name: impl Into<Cow<'static, str>>) -> Self {
        Self::new(name, |_| Payload::new())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn filter(&self) -> Option<FilterKey> {
        self.filter
    }

    /// Consumes the event, producing its routed parts.
    pub(crate) fn build(self, cache: &HandleCache) -> (Cow<'static, str>, Option<FilterKey>, Payload) {
        let mut payload = (self.build)(cache);
        payload.entry("eventType".into()).or_insert_with(|| Dynamic::from(self.name.to_string()));
        (self.name, self.filter, payload)
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event").field("name", &self.name).field("filter", &self.filter).finish_non_exhaustive()
    }
}

/// What a submit produced. Flags such as `block` are interpreted by each call site.
#[derive(Debug, Clone)]
pub enum Response {
    /// Submitted from the background thread; runs on the main thread later.
    Queued,
    /// No listener was registered, the payload was never built.
    Skipped,
    /// Submitted while another event was dispatching; runs right after it.
    Deferred,
    /// Listeners ran; the payload as they left it.
    Completed(Payload),
}

impl Response {
    pub fn payload(&self) -> Option<&Payload> {
        match self {
            Response::Completed(payload) => Some(payload),
            _ => None,
        }
    }

    pub fn into_payload(self) -> Option<Payload> {
        match self {
            Response::Completed(payload) => Some(payload),
            _ => None,
        }
    }

    pub fn is_neutral(&self) -> bool {
        !matches!(self, Response::Completed(_))
    }

    /// True only when listeners set `key` to boolean true.
    pub fn flag(&self, key: &str) -> bool {
        self.payload().and_then(|payload| payload.get(key)).and_then(|value| value.as_bool().ok()).unwrap_or(false)
    }
}

/// Notifications the bridge raises on its own.
#[derive(Debug, Clone, PartialEq)]
pub enum BuiltinEvent {
    Initialized,
    EnterFrame { delta: f32, menu_mode: bool },
    Simulate { delta: f32, timestamp: f64 },
    MenuEnter,
    MenuExit,
    CellChanged { cell: String, previous: Option<String> },
    Loaded { new_game: bool },
}

impl BuiltinEvent {
    pub fn name(&self) -> &'static str {
        match self {
            BuiltinEvent::Initialized => "initialized",
            BuiltinEvent::EnterFrame { .. } => "enterFrame",
            BuiltinEvent::Simulate { .. } => "simulate",
            BuiltinEvent::MenuEnter => "menuEnter",
            BuiltinEvent::MenuExit => "menuExit",
            BuiltinEvent::CellChanged { .. } => "cellChanged",
            BuiltinEvent::Loaded { .. } => "loaded",
        }
    }

    pub fn menu_state(menu_mode: bool) -> Self {
        if menu_mode {
            BuiltinEvent::MenuEnter
        } else {
            BuiltinEvent::MenuExit
        }
    }

    pub fn into_event(self) -> Event {
        let name = self.name();
        Event::new(name, move |_| {
            let mut payload = Payload::new();
            match self {
                BuiltinEvent::Initialized | BuiltinEvent::MenuEnter | BuiltinEvent::MenuExit => {}
                BuiltinEvent::EnterFrame { delta, menu_mode } => {
                    payload.insert("delta".into(), Dynamic::from(delta as FLOAT));
                    payload.insert("menuMode".into(), Dynamic::from(menu_mode));
                }
                BuiltinEvent::Simulate { delta, timestamp } => {
                    payload.insert("delta".into(), Dynamic::from(delta as FLOAT));
                    payload.insert("timestamp".into(), Dynamic::from(timestamp as FLOAT));
                }
                BuiltinEvent::CellChanged { cell, previous } => {
                    payload.insert("cell".into(), Dynamic::from(cell));
                    payload.insert("previousCell".into(), previous.map(Dynamic::from).unwrap_or(Dynamic::UNIT));
                }
                BuiltinEvent::Loaded { new_game } => {
                    payload.insert("newGame".into(), Dynamic::from(new_game));
                }
            }
            payload
        })
    }
}

impl fmt::Display for BuiltinEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BuiltinEvent::EnterFrame { delta, menu_mode } => {
                write!(f, "enterFrame delta={delta:.4} menuMode={menu_mode}")
            }
            BuiltinEvent::Simulate { delta, timestamp } => {
                write!(f, "simulate delta={delta:.4} timestamp={timestamp:.3}")
            }
            BuiltinEvent::CellChanged { cell, previous } => {
                write!(f, "cellChanged cell={cell} previous={}", previous.as_deref().unwrap_or("-"))
            }
            BuiltinEvent::Loaded { new_game } => write!(f, "loaded newGame={new_game}"),
            other => f.write_str(other.name()),
        }
    }
}
