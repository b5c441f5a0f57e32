//! Simulated host world used by the demo binary.
//!
//! A loader thread streams actors in and announces them with `objectLoaded`; the main
//! loop steps frames, deals damage through filtered `damage` events and destroys actors
//! that run out of health.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use rhai::{Dynamic, FLOAT, INT};
use tracing::{debug, info, warn};

use crate::bridge::{Bridge, FrameInput};
use crate::config::BridgeConfig;
use crate::dispatcher::{DispatchStats, Dispatcher, ListenerInvoker};
use crate::events::{Event, Payload};
use crate::handle_cache::ScriptHandle;
use crate::identity::Identity;
use crate::scripts::ScriptHost;
use crate::thread_role::ThreadRole;

pub const DEFAULT_SCRIPT: &str = "assets/scripts/bridge_demo.rhai";

const CELLS: [&str; 3] = ["Harbor", "Old Quarter", "Marsh Road"];

#[derive(Debug, Clone)]
pub struct HostOptions {
    pub frames: u32,
    pub fixed_dt: f32,
    /// Game seconds per real second.
    pub timescale: f64,
    pub actors: u32,
    /// Frames between two damage rolls.
    pub damage_every: u32,
    pub damage_amount: f64,
    /// Delay between two actors coming off the loader.
    pub load_interval: Duration,
}

impl Default for HostOptions {
    fn default() -> Self {
        Self {
            frames: 240,
            fixed_dt: 1.0 / 60.0,
            timescale: 30.0,
            actors: 6,
            damage_every: 6,
            damage_amount: 25.0,
            load_interval: Duration::from_millis(2),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostSummary {
    pub frames: u32,
    pub loaded: usize,
    pub damage_events: usize,
    pub blocked: usize,
    pub destroyed: usize,
    pub stats: DispatchStats,
}

/// Fixed-step frame clock with a calendar in game hours.
struct WorldClock {
    frame: u32,
    fixed_dt: f32,
    timescale: f64,
    hours: f64,
}

impl WorldClock {
    fn new(fixed_dt: f32, timescale: f64, hours: f64) -> Self {
        Self { frame: 0, fixed_dt, timescale, hours }
    }

    fn tick(&mut self) -> FrameInput {
        self.frame += 1;
        let menu_mode = (self.frame / 60) % 4 == 3;
        if !menu_mode {
            self.hours += f64::from(self.fixed_dt) * self.timescale / 3600.0;
        }
        let cell = CELLS[(self.frame / 90) as usize % CELLS.len()];
        FrameInput {
            delta: self.fixed_dt,
            timestamp: self.hours,
            simulating: !menu_mode,
            menu_mode,
            cell: Some(cell.to_string()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Actor {
    pub identity: Identity,
    pub name: String,
    pub health: f64,
}

/// `damage` filtered on the target. Listeners may rewrite `damage` or set `block`.
pub fn damage_event(target: Identity, amount: f64, source: &str) -> Event {
    let source = source.to_string();
    Event::filtered("damage", target, move |cache| {
        let mut payload = Payload::new();
        payload.insert("reference".into(), Dynamic::from(cache.resolve_default(target)));
        payload.insert("damage".into(), Dynamic::from(amount as FLOAT));
        payload.insert("source".into(), Dynamic::from(source));
        payload
    })
}

/// Raised by the loader thread once an object exists natively.
pub fn object_loaded_event(actor: &Actor) -> Event {
    let identity = actor.identity;
    let name = actor.name.clone();
    Event::new("objectLoaded", move |cache| {
        let handle = cache.resolve(identity, || ScriptHandle::with_type(identity, "Actor"));
        let mut payload = Payload::new();
        payload.insert("reference".into(), Dynamic::from(handle));
        payload.insert("name".into(), Dynamic::from(name));
        payload
    })
}

fn spawn_loader(
    dispatcher: Arc<Dispatcher>,
    options: &HostOptions,
    arrivals: Sender<Actor>,
) -> Result<JoinHandle<usize>> {
    let count = options.actors;
    let interval = options.load_interval;
    thread::Builder::new()
        .name("loader".into())
        .spawn(move || {
            let _role = ThreadRole::Background.assign();
            let mut loaded = 0;
            for index in 0..count {
                let actor = Actor {
                    identity: Identity::mobile(0x1000 + u64::from(index) * 0x40),
                    name: format!("actor_{index:02}"),
                    health: 100.0,
                };
                // Announce before the world loop can see the actor and roll damage on it.
                if let Err(err) = dispatcher.submit(object_loaded_event(&actor)) {
                    warn!(error = %err, "loader could not queue objectLoaded");
                    break;
                }
                loaded += 1;
                if arrivals.send(actor).is_err() {
                    debug!("world loop gone; loader stopping");
                    break;
                }
                thread::sleep(interval);
            }
            loaded
        })
        .context("Spawning loader thread")
}

pub struct DemoWorld {
    bridge: Bridge,
    clock: WorldClock,
    options: HostOptions,
    actors: BTreeMap<u64, Actor>,
    arrivals: Receiver<Actor>,
    summary: HostSummary,
}

impl DemoWorld {
    /// Builds the bridge around a [`ScriptHost`]. Call from the main thread.
    pub fn new(config: &BridgeConfig, options: HostOptions) -> Result<(Self, JoinHandle<usize>)> {
        let script = config.scripts.main_script.clone().or_else(|| {
            let fallback = Path::new(DEFAULT_SCRIPT);
            fallback.exists().then(|| fallback.to_path_buf())
        });
        let bridge = Bridge::init(config, |services| {
            let mut host = ScriptHost::new(services, &config.scripts);
            if let Some(path) = &script {
                host.load(path)?;
            } else {
                info!("no script configured; events will have no listeners");
            }
            Ok(Box::new(host) as Box<dyn ListenerInvoker>)
        })?;
        let (sender, arrivals) = mpsc::channel();
        let loader = spawn_loader(bridge.dispatcher(), &options, sender)?;
        let world = Self {
            bridge,
            clock: WorldClock::new(options.fixed_dt, options.timescale, 8.0),
            options,
            actors: BTreeMap::new(),
            arrivals,
            summary: HostSummary::default(),
        };
        Ok((world, loader))
    }

    pub fn bridge(&self) -> &Bridge {
        &self.bridge
    }

    pub fn actors(&self) -> impl Iterator<Item = &Actor> {
        self.actors.values()
    }

    pub fn step(&mut self) -> Result<()> {
        while let Ok(actor) = self.arrivals.try_recv() {
            self.actors.insert(actor.identity.address(), actor);
        }
        let input = self.clock.tick();
        let simulating = input.simulating;
        self.bridge.on_frame(input)?;
        self.summary.frames += 1;
        if simulating && self.clock.frame % self.options.damage_every.max(1) == 0 {
            self.roll_damage()?;
        }
        Ok(())
    }

    fn roll_damage(&mut self) -> Result<()> {
        if self.actors.is_empty() {
            return Ok(());
        }
        let index = (self.clock.frame / self.options.damage_every.max(1)) as usize % self.actors.len();
        let Some(actor) = self.actors.values_mut().nth(index) else {
            return Ok(());
        };
        let response = self.bridge.submit(damage_event(actor.identity, self.options.damage_amount, "demo"))?;
        self.summary.damage_events += 1;
        if response.flag("block") {
            self.summary.blocked += 1;
            debug!(actor = %actor.identity, "damage blocked by a listener");
            return Ok(());
        }
        let amount = response
            .into_payload()
            .and_then(|payload| {
                let value = payload.get("damage")?;
                value.as_float().ok().or_else(|| value.as_int().ok().map(|v: INT| v as FLOAT))
            })
            .map_or(self.options.damage_amount, f64::from);
        actor.health -= amount;
        debug!(actor = %actor.identity, amount, health = actor.health, "damage applied");
        if actor.health <= 0.0 {
            let identity = actor.identity;
            self.actors.remove(&identity.address());
            self.bridge.notify_destroying(identity);
            self.summary.destroyed += 1;
            info!(%identity, "actor destroyed");
        }
        Ok(())
    }

    pub fn finish(self, loader: JoinHandle<usize>) -> Result<HostSummary> {
        let loaded = loader.join().map_err(|_| anyhow!("loader thread panicked"))?;
        let mut summary = self.summary;
        summary.loaded = loaded;
        summary.stats = self.bridge.dispatcher().stats();
        self.bridge.teardown()?;
        Ok(summary)
    }
}

/// Runs the whole demo on the calling thread, which becomes the main thread.
pub fn run(config: &BridgeConfig, options: HostOptions) -> Result<HostSummary> {
    let _role = ThreadRole::Main.assign();
    let frames = options.frames;
    let (mut world, loader) = DemoWorld::new(config, options)?;
    for _ in 0..frames {
        world.step()?;
    }
    let summary = world.finish(loader)?;
    info!(
        frames = summary.frames,
        loaded = summary.loaded,
        damage = summary.damage_events,
        blocked = summary.blocked,
        destroyed = summary.destroyed,
        "demo finished"
    );
    Ok(summary)
}
