use std::sync::Arc;

use anyhow::{bail, Result};
use tracing::{debug, info};

use crate::config::BridgeConfig;
use crate::dispatcher::{Dispatcher, ListenerInvoker};
use crate::error::{DispatchError, TimerError};
use crate::events::{BuiltinEvent, Event, Response};
use crate::filters::FilterRegistry;
use crate::handle_cache::{HandleCache, ScriptHandle};
use crate::identity::Identity;
use crate::thread_role::ThreadRole;
use crate::timers::{ClockDomain, Repeat, SharedTimers, TickReport, TimerCallback, TimerId};

/// Services the listener subsystem is built against.
#[derive(Clone)]
pub struct BridgeServices {
    pub cache: Arc<HandleCache>,
    pub filters: Arc<FilterRegistry>,
    pub timers: SharedTimers,
}

impl BridgeServices {
    fn new(game_timestamp: f64) -> Self {
        let filters = Arc::new(FilterRegistry::new());
        let cache = Arc::new(HandleCache::new(Arc::clone(&filters)));
        Self { cache, filters, timers: SharedTimers::new(game_timestamp) }
    }
}

/// What the host reports once per frame.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FrameInput {
    /// Seconds since the previous frame.
    pub delta: f32,
    /// World calendar time, in game hours.
    pub timestamp: f64,
    /// World simulation is running (not paused, not in a menu).
    pub simulating: bool,
    pub menu_mode: bool,
    pub cell: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameReport {
    pub drained: usize,
    pub timers: TickReport,
    pub events: usize,
}

/// The bridge context: owns the services and hands the dispatcher to other threads.
///
/// Lives on the main thread. Background threads only ever see [`Bridge::dispatcher`].
pub struct Bridge {
    services: BridgeServices,
    dispatcher: Arc<Dispatcher>,
    builtin_events: bool,
    menu_mode: bool,
    cell: Option<String>,
}

impl Bridge {
    /// Builds the services, lets `make_invoker` construct the listener subsystem against
    /// them and fires `initialized`. Must run on the main thread.
    pub fn init<F>(config: &BridgeConfig, make_invoker: F) -> Result<Self>
    where
        F: FnOnce(&BridgeServices) -> Result<Box<dyn ListenerInvoker>>,
    {
        if ThreadRole::current() != Some(ThreadRole::Main) {
            bail!(
                "Bridge::init must run on the main thread (current role: {})",
                ThreadRole::current().map_or("none", ThreadRole::label)
            );
        }
        let services = BridgeServices::new(0.0);
        let invoker = make_invoker(&services)?;
        let dispatcher =
            Arc::new(Dispatcher::new(Arc::clone(&services.cache), invoker, config.events.queue_warn_threshold));
        let bridge =
            Self { services, dispatcher, builtin_events: config.events.builtin_events, menu_mode: false, cell: None };
        bridge.submit(BuiltinEvent::Initialized.into_event())?;
        info!(builtin_events = bridge.builtin_events, "script bridge initialised");
        Ok(bridge)
    }

    /// Runs what is still queued, then drops timers and every cached handle.
    pub fn teardown(self) -> Result<usize, DispatchError> {
        self.dispatcher.require_main("teardown")?;
        let drained = self.dispatcher.drain()?;
        let discarded = self.dispatcher.discard_pending();
        self.services.timers.clear_all(0.0);
        self.services.cache.clear();
        self.services.filters.clear();
        info!(drained, discarded, "script bridge torn down");
        Ok(drained)
    }

    pub fn submit(&self, event: Event) -> Result<Response, DispatchError> {
        self.dispatcher.submit(event)
    }

    pub fn resolve(&self, identity: Identity) -> ScriptHandle {
        self.services.cache.resolve_default(identity)
    }

    pub fn resolve_with<F>(&self, identity: Identity, factory: F) -> ScriptHandle
    where
        F: FnOnce() -> ScriptHandle,
    {
        self.services.cache.resolve(identity, factory)
    }

    /// The host is about to free the object behind `identity`. Every destruction path must
    /// end up here, whatever the object kind.
    pub fn notify_destroying(&self, identity: Identity) -> bool {
        self.services.cache.evict(identity)
    }

    /// Per-frame hook: queued background events, then timers, then the built-in frame events.
    pub fn on_frame(&mut self, input: FrameInput) -> Result<FrameReport, DispatchError> {
        self.dispatcher.require_main("on_frame")?;
        let mut report = FrameReport { drained: self.dispatcher.drain()?, ..FrameReport::default() };
        report.timers = self.services.timers.update(f64::from(input.delta), input.timestamp, input.simulating);

        let menu_changed = input.menu_mode != self.menu_mode;
        let cell_changed = input.cell.is_some() && input.cell != self.cell;
        let previous_cell = std::mem::replace(&mut self.cell, input.cell.clone());
        self.menu_mode = input.menu_mode;
        if !self.builtin_events {
            return Ok(report);
        }

        let mut events = Vec::with_capacity(4);
        if menu_changed {
            events.push(BuiltinEvent::menu_state(input.menu_mode));
        }
        if let (true, Some(cell)) = (cell_changed, input.cell) {
            debug!(%cell, previous = previous_cell.as_deref().unwrap_or("-"), "cell changed");
            events.push(BuiltinEvent::CellChanged { cell, previous: previous_cell });
        }
        events.push(BuiltinEvent::EnterFrame { delta: input.delta, menu_mode: input.menu_mode });
        if input.simulating {
            events.push(BuiltinEvent::Simulate { delta: input.delta, timestamp: input.timestamp });
        }
        for event in events {
            self.submit(event.into_event())?;
            report.events += 1;
        }
        Ok(report)
    }

    /// A save was loaded or a new game started: timers reset against the world clock.
    pub fn on_game_loaded(&mut self, world_timestamp: f64, new_game: bool) -> Result<Response, DispatchError> {
        self.dispatcher.require_main("on_game_loaded")?;
        self.services.timers.clear_all(world_timestamp);
        self.cell = None;
        self.submit(BuiltinEvent::Loaded { new_game }.into_event())
    }

    pub fn schedule(
        &self,
        domain: ClockDomain,
        delay: f64,
        repeat: Repeat,
        callback: TimerCallback,
    ) -> Result<TimerId, TimerError> {
        self.services.timers.schedule(domain, delay, repeat, callback)
    }

    pub fn schedule_at(&self, domain: ClockDomain, at: f64, callback: TimerCallback) -> Result<TimerId, TimerError> {
        self.services.timers.schedule_at(domain, at, callback)
    }

    pub fn cancel(&self, id: TimerId) -> bool {
        self.services.timers.cancel(id)
    }

    pub fn dispatcher(&self) -> Arc<Dispatcher> {
        Arc::clone(&self.dispatcher)
    }

    pub fn cache(&self) -> &Arc<HandleCache> {
        &self.services.cache
    }

    pub fn filters(&self) -> &Arc<FilterRegistry> {
        &self.services.filters
    }

    pub fn timers(&self) -> &SharedTimers {
        &self.services.timers
    }
}
