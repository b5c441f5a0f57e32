use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{trace, warn};

use crate::error::TimerError;

/// The three clocks timers can run against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClockDomain {
    /// Wall time; advances every frame.
    Real,
    /// Advances only while the simulation is running (not in menus).
    Simulated,
    /// Follows the world's calendar timestamp, set absolutely each frame.
    GameCalendar,
}

impl ClockDomain {
    pub const ALL: [ClockDomain; 3] = [ClockDomain::Real, ClockDomain::Simulated, ClockDomain::GameCalendar];

    fn index(self) -> usize {
        match self {
            ClockDomain::Real => 0,
            ClockDomain::Simulated => 1,
            ClockDomain::GameCalendar => 2,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            ClockDomain::Real => "real",
            ClockDomain::Simulated => "simulate",
            ClockDomain::GameCalendar => "game",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "real" => Some(ClockDomain::Real),
            "simulate" | "simulated" => Some(ClockDomain::Simulated),
            "game" | "calendar" => Some(ClockDomain::GameCalendar),
            _ => None,
        }
    }
}

impl fmt::Display for ClockDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(pub u64);

impl fmt::Display for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "timer#{}", self.0)
    }
}

/// How many times a timer fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Repeat {
    Once,
    Times(u32),
    Forever,
}

impl Repeat {
    pub fn from_flag(repeating: bool) -> Self {
        if repeating {
            Repeat::Forever
        } else {
            Repeat::Once
        }
    }

    fn normalised(self) -> Self {
        match self {
            Repeat::Times(0) | Repeat::Times(1) => Repeat::Once,
            other => other,
        }
    }

    fn fires_again(self, fired: u32) -> bool {
        match self {
            Repeat::Once => false,
            Repeat::Times(limit) => fired < limit,
            Repeat::Forever => true,
        }
    }
}

/// Passed to a callback when it fires.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimerInfo {
    pub id: TimerId,
    pub domain: ClockDomain,
    pub due: f64,
    pub clock: f64,
    /// 1 on the first firing.
    pub iteration: u32,
}

pub type TimerCallback = Box<dyn FnMut(&TimerInfo) -> anyhow::Result<()> + Send>;

/// How a tick moves a clock.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ClockStep {
    By(f64),
    To(f64),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub fired: usize,
    pub failed: usize,
}

impl TickReport {
    fn absorb(&mut self, other: TickReport) {
        self.fired += other.fired;
        self.failed += other.failed;
    }
}

/// Ordering key: due time first, then registration order.
#[derive(Debug, Clone, Copy)]
struct DueKey {
    due: f64,
    seq: u64,
}

impl PartialEq for DueKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for DueKey {}

impl PartialOrd for DueKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DueKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.due.total_cmp(&other.due).then(self.seq.cmp(&other.seq))
    }
}

struct TimerEntry {
    id: TimerId,
    period: f64,
    repeat: Repeat,
    fired: u32,
    callback: TimerCallback,
}

#[derive(Default)]
struct Clock {
    now: f64,
    pending: BTreeMap<DueKey, TimerEntry>,
}

struct Firing {
    id: TimerId,
    cancelled: bool,
}

/// Pending callbacks for the three clock domains.
///
/// Not shared directly; [`SharedTimers`] wraps it so callbacks can run with the lock released.
pub struct TimerService {
    clocks: [Clock; 3],
    index: HashMap<TimerId, (ClockDomain, DueKey)>,
    next_id: u64,
    next_seq: u64,
    firing: Option<Firing>,
}

impl TimerService {
    pub fn new(game_timestamp: f64) -> Self {
        let mut service = Self {
            clocks: Default::default(),
            index: HashMap::new(),
            next_id: 1,
            next_seq: 0,
            firing: None,
        };
        service.clock_mut(ClockDomain::GameCalendar).now = game_timestamp;
        service
    }

    fn clock(&self, domain: ClockDomain) -> &Clock {
        &self.clocks[domain.index()]
    }

    fn clock_mut(&mut self, domain: ClockDomain) -> &mut Clock {
        &mut self.clocks[domain.index()]
    }

    pub fn now(&self, domain: ClockDomain) -> f64 {
        self.clock(domain).now
    }

    pub fn pending(&self, domain: ClockDomain) -> usize {
        self.clock(domain).pending.len()
    }

    /// Schedules `callback` to fire `delay` after the domain's current clock.
    /// Repeating timers use `delay` as their period.
    pub fn schedule(
        &mut self,
        domain: ClockDomain,
        delay: f64,
        repeat: Repeat,
        callback: TimerCallback,
    ) -> Result<TimerId, TimerError> {
        if delay.is_nan() || delay < 0.0 {
            return Err(TimerError::NegativeDelay(delay));
        }
        let repeat = repeat.normalised();
        if repeat != Repeat::Once && delay <= 0.0 {
            return Err(TimerError::NonPositivePeriod(delay));
        }
        let due = self.now(domain) + delay;
        Ok(self.insert(domain, due, delay, repeat, callback))
    }

    /// One-shot timer at an absolute clock value. Past values fire on the next tick.
    pub fn schedule_at(
        &mut self,
        domain: ClockDomain,
        at: f64,
        callback: TimerCallback,
    ) -> Result<TimerId, TimerError> {
        if !at.is_finite() {
            return Err(TimerError::NonFiniteTime(at));
        }
        Ok(self.insert(domain, at, 0.0, Repeat::Once, callback))
    }

    fn insert(
        &mut self,
        domain: ClockDomain,
        due: f64,
        period: f64,
        repeat: Repeat,
        callback: TimerCallback,
    ) -> TimerId {
        let id = TimerId(self.next_id);
        self.next_id += 1;
        let key = DueKey { due, seq: self.next_seq };
        self.next_seq += 1;
        self.clock_mut(domain).pending.insert(key, TimerEntry { id, period, repeat, fired: 0, callback });
        self.index.insert(id, (domain, key));
        trace!(%id, %domain, due, "scheduled timer");
        id
    }

    /// Cancels a pending timer, or stops a timer that is currently firing from rescheduling.
    pub fn cancel(&mut self, id: TimerId) -> bool {
        if let Some((domain, key)) = self.index.remove(&id) {
            self.clock_mut(domain).pending.remove(&key);
            return true;
        }
        match &mut self.firing {
            Some(firing) if firing.id == id && !firing.cancelled => {
                firing.cancelled = true;
                true
            }
            _ => false,
        }
    }

    pub fn time_left(&self, id: TimerId) -> Option<f64> {
        let (domain, key) = self.index.get(&id)?;
        Some((key.due - self.now(*domain)).max(0.0))
    }

    fn advance(&mut self, domain: ClockDomain, step: ClockStep) {
        let clock = self.clock_mut(domain);
        match step {
            ClockStep::By(delta) => clock.now += delta,
            ClockStep::To(value) => clock.now = value,
        }
    }

    /// Removes the earliest due timer registered before `watermark`.
    fn pop_due(&mut self, domain: ClockDomain, watermark: u64) -> Option<(DueKey, TimerEntry, TimerInfo)> {
        let clock = self.clock_mut(domain);
        let now = clock.now;
        let key = clock
            .pending
            .keys()
            .take_while(|key| key.due <= now)
            .find(|key| key.seq < watermark)
            .copied()?;
        let mut entry = clock.pending.remove(&key)?;
        entry.fired += 1;
        self.index.remove(&entry.id);
        self.firing = Some(Firing { id: entry.id, cancelled: false });
        let info = TimerInfo { id: entry.id, domain, due: key.due, clock: now, iteration: entry.fired };
        Some((key, entry, info))
    }

    fn finish_firing(&mut self, domain: ClockDomain, key: DueKey, entry: TimerEntry) {
        let cancelled = self.firing.take().is_some_and(|firing| firing.cancelled);
        if cancelled || !entry.repeat.fires_again(entry.fired) {
            return;
        }
        let next = DueKey { due: key.due + entry.period, seq: key.seq };
        self.index.insert(entry.id, (domain, next));
        self.clock_mut(domain).pending.insert(next, entry);
    }

    /// Drops every pending timer, zeroes the real and simulated clocks and resyncs the
    /// calendar clock to `game_timestamp`.
    pub fn clear_all(&mut self, game_timestamp: f64) {
        for clock in &mut self.clocks {
            clock.pending.clear();
            clock.now = 0.0;
        }
        self.index.clear();
        if let Some(firing) = &mut self.firing {
            firing.cancelled = true;
        }
        self.clock_mut(ClockDomain::GameCalendar).now = game_timestamp;
    }
}

/// Timer service shared between the bridge and script bindings.
#[derive(Clone)]
pub struct SharedTimers(Arc<Mutex<TimerService>>);

impl SharedTimers {
    pub fn new(game_timestamp: f64) -> Self {
        Self(Arc::new(Mutex::new(TimerService::new(game_timestamp))))
    }

    pub fn lock(&self) -> MutexGuard<'_, TimerService> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn schedule(
        &self,
        domain: ClockDomain,
        delay: f64,
        repeat: Repeat,
        callback: TimerCallback,
    ) -> Result<TimerId, TimerError> {
        self.lock().schedule(domain, delay, repeat, callback)
    }

    pub fn schedule_at(&self, domain: ClockDomain, at: f64, callback: TimerCallback) -> Result<TimerId, TimerError> {
        self.lock().schedule_at(domain, at, callback)
    }

    pub fn cancel(&self, id: TimerId) -> bool {
        self.lock().cancel(id)
    }

    pub fn time_left(&self, id: TimerId) -> Option<f64> {
        self.lock().time_left(id)
    }

    pub fn now(&self, domain: ClockDomain) -> f64 {
        self.lock().now(domain)
    }

    pub fn pending(&self, domain: ClockDomain) -> usize {
        self.lock().pending(domain)
    }

    pub fn clear_all(&self, game_timestamp: f64) {
        self.lock().clear_all(game_timestamp);
    }

    /// Per-frame update: real and simulated clocks advance by `delta` (simulated only while
    /// `simulating`), the calendar clock is set to `timestamp`.
    pub fn update(&self, delta: f64, timestamp: f64, simulating: bool) -> TickReport {
        let mut report = self.tick(ClockDomain::Real, ClockStep::By(delta));
        report.absorb(self.tick(ClockDomain::GameCalendar, ClockStep::To(timestamp)));
        if simulating {
            report.absorb(self.tick(ClockDomain::Simulated, ClockStep::By(delta)));
        }
        report
    }

    /// Moves one clock and fires everything that became due, earliest first.
    ///
    /// The lock is released around each callback so callbacks may schedule or cancel.
    /// Timers scheduled during this tick wait for the next one.
    pub fn tick(&self, domain: ClockDomain, step: ClockStep) -> TickReport {
        let watermark = {
            let mut service = self.lock();
            service.advance(domain, step);
            service.next_seq
        };
        let mut report = TickReport::default();
        loop {
            let popped = self.lock().pop_due(domain, watermark);
            let Some((key, mut entry, info)) = popped else {
                break;
            };
            report.fired += 1;
            if let Err(err) = (entry.callback)(&info) {
                report.failed += 1;
                let message = format!("{err:#}");
                warn!(timer = %info.id, %domain, error = %message, "timer callback failed");
            }
            self.lock().finish_firing(domain, key, entry);
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> TimerCallback {
        Box::new(|_| Ok(()))
    }

    #[test]
    fn rejects_negative_delay_and_zero_period() {
        let mut service = TimerService::new(0.0);
        assert_eq!(
            service.schedule(ClockDomain::Real, -1.0, Repeat::Once, noop()).unwrap_err(),
            TimerError::NegativeDelay(-1.0)
        );
        assert_eq!(
            service.schedule(ClockDomain::Real, 0.0, Repeat::Forever, noop()).unwrap_err(),
            TimerError::NonPositivePeriod(0.0)
        );
        assert!(service.schedule(ClockDomain::Real, 0.0, Repeat::Once, noop()).is_ok());
    }

    #[test]
    fn rejects_non_finite_absolute_time() {
        let mut service = TimerService::new(0.0);
        let err = service.schedule_at(ClockDomain::Real, f64::NAN, noop()).unwrap_err();
        assert!(matches!(err, TimerError::NonFiniteTime(value) if value.is_nan()));
        assert_eq!(
            service.schedule_at(ClockDomain::Real, f64::INFINITY, noop()).unwrap_err(),
            TimerError::NonFiniteTime(f64::INFINITY)
        );
        assert_eq!(service.pending(ClockDomain::Real), 0);
    }

    #[test]
    fn repeat_flag_maps_to_once_or_forever() {
        assert_eq!(Repeat::from_flag(false), Repeat::Once);
        assert_eq!(Repeat::from_flag(true), Repeat::Forever);
    }

    #[test]
    fn due_key_orders_by_time_then_registration() {
        let early = DueKey { due: 1.0, seq: 5 };
        let late = DueKey { due: 2.0, seq: 0 };
        let tie = DueKey { due: 1.0, seq: 6 };
        assert!(early < late);
        assert!(early < tie);
    }

    #[test]
    fn time_left_tracks_clock() {
        let timers = SharedTimers::new(0.0);
        let id = timers.schedule(ClockDomain::Real, 2.0, Repeat::Once, noop()).expect("schedule");
        timers.tick(ClockDomain::Real, ClockStep::By(0.5));
        assert_eq!(timers.time_left(id), Some(1.5));
        timers.tick(ClockDomain::Real, ClockStep::By(2.0));
        assert_eq!(timers.time_left(id), None);
    }
}
