use kestrel_script_bridge::dispatcher::{Dispatcher, Invocation, ListenerInvoker};
use kestrel_script_bridge::filters::FilterRegistry;
use kestrel_script_bridge::listeners::{ListenerOptions, ListenerRegistry};
use kestrel_script_bridge::{
    DispatchError, Event, FilterKey, HandleCache, Identity, ListenerFailure, Payload, Response, ScriptHandle,
    ThreadRole,
};
use rhai::Dynamic;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::thread;

type Log = Arc<Mutex<Vec<String>>>;

fn entries(log: &Log) -> Vec<String> {
    log.lock().unwrap().clone()
}

/// Records every dispatched event name. Events in `disabled` report no listeners.
struct RecordingInvoker {
    log: Log,
    disabled: HashSet<&'static str>,
}

impl ListenerInvoker for RecordingInvoker {
    fn is_event_enabled(&self, event: &str) -> bool {
        !self.disabled.contains(event)
    }

    fn invoke(&mut self, event: &str, payload: Payload, _filter: Option<FilterKey>) -> Invocation {
        self.log.lock().unwrap().push(event.to_string());
        Invocation::completed(payload)
    }
}

fn recording(disabled: &[&'static str]) -> (Arc<Dispatcher>, Log) {
    let log = Log::default();
    let invoker = RecordingInvoker { log: Arc::clone(&log), disabled: disabled.iter().copied().collect() };
    let cache = Arc::new(HandleCache::new(Arc::new(FilterRegistry::new())));
    (Arc::new(Dispatcher::new(cache, Box::new(invoker), 64)), log)
}

type Callback = Arc<dyn Fn(&mut Payload) -> Result<(), String> + Send + Sync>;

/// Runs `ListenerRegistry` callbacks in order, the way a listener subsystem would.
struct RegistryInvoker {
    registry: Arc<Mutex<ListenerRegistry<(&'static str, Callback)>>>,
}

impl ListenerInvoker for RegistryInvoker {
    fn is_event_enabled(&self, event: &str) -> bool {
        self.registry.lock().unwrap().is_event_enabled(event)
    }

    fn invoke(&mut self, event: &str, mut payload: Payload, filter: Option<FilterKey>) -> Invocation {
        let targets = self.registry.lock().unwrap().snapshot(event, filter);
        let mut failures = Vec::new();
        for (_, (name, callback)) in targets {
            if let Err(message) = callback(&mut payload) {
                failures.push(ListenerFailure::new(event, name, message));
            }
        }
        Invocation { response: payload, failures }
    }
}

fn push(log: &Log, entry: &'static str) -> Callback {
    let log = Arc::clone(log);
    Arc::new(move |_| {
        log.lock().unwrap().push(entry.to_string());
        Ok(())
    })
}

fn damage(target: Identity) -> Event {
    Event::filtered("damage", target, move |cache| {
        let mut payload = Payload::new();
        payload.insert("reference".into(), Dynamic::from(cache.resolve_default(target)));
        payload.insert("damage".into(), Dynamic::from(10.0_f64));
        payload
    })
}

#[test]
fn background_events_run_in_submission_order_before_the_next_main_event() {
    let (dispatcher, log) = recording(&[]);
    let _main = ThreadRole::Main.assign();

    let background = Arc::clone(&dispatcher);
    let responses = thread::spawn(move || {
        let _role = ThreadRole::Background.assign();
        ["e1", "e2", "e3"].map(|name| background.submit(Event::generic(name)).expect("background submit"))
    })
    .join()
    .expect("background thread");
    assert!(responses.iter().all(|response| matches!(response, Response::Queued)));
    assert!(entries(&log).is_empty(), "nothing runs on the background thread");
    assert_eq!(dispatcher.pending(), 3);

    let response = dispatcher.submit(Event::generic("tick")).expect("main submit");
    assert!(matches!(response, Response::Completed(_)));
    assert_eq!(entries(&log), vec!["e1", "e2", "e3", "tick"]);
    assert_eq!(dispatcher.pending(), 0);
    assert_eq!(dispatcher.stats().queued, 3);
}

#[test]
fn drain_runs_queue_without_a_main_event() {
    let (dispatcher, log) = recording(&[]);
    let _main = ThreadRole::Main.assign();
    let background = Arc::clone(&dispatcher);
    thread::spawn(move || {
        let _role = ThreadRole::Background.assign();
        background.submit(Event::generic("objectLoaded")).unwrap();
    })
    .join()
    .unwrap();
    assert_eq!(dispatcher.drain().unwrap(), 1);
    assert_eq!(entries(&log), vec!["objectLoaded"]);
}

#[test]
fn unassigned_threads_are_rejected() {
    let (dispatcher, log) = recording(&[]);
    let worker = Arc::clone(&dispatcher);
    let result = thread::Builder::new()
        .name("rogue".into())
        .spawn(move || worker.submit(Event::generic("damage")))
        .unwrap()
        .join()
        .unwrap();
    match result {
        Err(DispatchError::ThreadingViolation { operation, thread }) => {
            assert_eq!(operation, "submit");
            assert_eq!(thread, "rogue");
        }
        other => panic!("expected threading violation, got {other:?}"),
    }
    assert_eq!(dispatcher.pending(), 0, "rejected events are not queued");
    assert_eq!(dispatcher.stats().rejected, 1);
    assert!(entries(&log).is_empty());
}

#[test]
fn background_thread_cannot_drain() {
    let (dispatcher, _log) = recording(&[]);
    let result = thread::spawn(move || {
        let _role = ThreadRole::Background.assign();
        dispatcher.drain()
    })
    .join()
    .unwrap();
    assert!(matches!(result, Err(DispatchError::WrongThread { operation: "drain" })));
}

#[test]
fn payload_is_not_built_without_listeners() {
    let (dispatcher, log) = recording(&["quiet"]);
    let _main = ThreadRole::Main.assign();
    let built = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&built);
    let response = dispatcher
        .submit(Event::new("quiet", move |_| {
            flag.store(true, Ordering::SeqCst);
            Payload::new()
        }))
        .unwrap();
    assert!(matches!(response, Response::Skipped));
    assert!(response.is_neutral());
    assert!(!built.load(Ordering::SeqCst));
    assert!(entries(&log).is_empty());
    assert_eq!(dispatcher.stats().skipped, 1);
}

#[test]
fn failing_listener_does_not_stop_the_others() {
    let filters = Arc::new(FilterRegistry::new());
    let cache = Arc::new(HandleCache::new(Arc::clone(&filters)));
    let registry = Arc::new(Mutex::new(ListenerRegistry::new(Arc::clone(&filters))));
    let log = Log::default();
    {
        let mut registry = registry.lock().unwrap();
        let failing: Callback = Arc::new(|_| Err("boom".to_string()));
        registry.register("uiActivated", ("first", push(&log, "first")), ListenerOptions::default().with_priority(5));
        registry.register("uiActivated", ("failing", failing), ListenerOptions::default());
        registry.register("uiActivated", ("last", push(&log, "last")), ListenerOptions::default());
    }
    let dispatcher = Dispatcher::new(cache, Box::new(RegistryInvoker { registry }), 64);
    let _main = ThreadRole::Main.assign();

    let response = dispatcher.submit(Event::generic("uiActivated")).unwrap();
    assert!(matches!(response, Response::Completed(_)));
    assert_eq!(entries(&log), vec!["first", "last"]);
    assert_eq!(dispatcher.stats().listener_failures, 1);
}

#[test]
fn listeners_can_flag_block_for_the_call_site() {
    let filters = Arc::new(FilterRegistry::new());
    let cache = Arc::new(HandleCache::new(Arc::clone(&filters)));
    let registry = Arc::new(Mutex::new(ListenerRegistry::new(Arc::clone(&filters))));
    let blocker: Callback = Arc::new(|payload| {
        payload.insert("block".into(), Dynamic::from(true));
        Ok(())
    });
    registry.lock().unwrap().register("activate", ("blocker", blocker), ListenerOptions::default());
    let dispatcher = Dispatcher::new(cache, Box::new(RegistryInvoker { registry }), 64);
    let _main = ThreadRole::Main.assign();

    let response = dispatcher.submit(Event::generic("activate")).unwrap();
    assert!(response.flag("block"));
    assert!(!response.flag("claim"));
}

/// Submits `inner` from inside the `outer` listener.
struct NestingInvoker {
    dispatcher: Arc<OnceLock<Weak<Dispatcher>>>,
    log: Log,
}

impl ListenerInvoker for NestingInvoker {
    fn invoke(&mut self, event: &str, payload: Payload, _filter: Option<FilterKey>) -> Invocation {
        if event == "outer" {
            self.log.lock().unwrap().push("outer:start".into());
            let dispatcher = self.dispatcher.get().and_then(Weak::upgrade).expect("dispatcher set");
            let nested = dispatcher.submit(Event::generic("inner")).expect("nested submit");
            assert!(matches!(nested, Response::Deferred));
            self.log.lock().unwrap().push("outer:end".into());
        } else {
            self.log.lock().unwrap().push(event.to_string());
        }
        Invocation::completed(payload)
    }
}

#[test]
fn nested_submit_runs_after_the_current_event_finishes() {
    let slot = Arc::new(OnceLock::new());
    let log = Log::default();
    let invoker = NestingInvoker { dispatcher: Arc::clone(&slot), log: Arc::clone(&log) };
    let cache = Arc::new(HandleCache::new(Arc::new(FilterRegistry::new())));
    let dispatcher = Arc::new(Dispatcher::new(cache, Box::new(invoker), 64));
    slot.set(Arc::downgrade(&dispatcher)).unwrap();
    let _main = ThreadRole::Main.assign();

    dispatcher.submit(Event::generic("outer")).unwrap();
    assert_eq!(entries(&log), vec!["outer:start", "outer:end", "inner"]);
    assert_eq!(dispatcher.stats().deferred, 1);
}

/// While handling `batch`, submits `nested` on the main thread and has a background
/// thread queue `late`.
struct ProducingInvoker {
    dispatcher: Arc<OnceLock<Weak<Dispatcher>>>,
    log: Log,
}

impl ListenerInvoker for ProducingInvoker {
    fn invoke(&mut self, event: &str, payload: Payload, _filter: Option<FilterKey>) -> Invocation {
        self.log.lock().unwrap().push(event.to_string());
        if event == "batch" {
            let dispatcher = self.dispatcher.get().and_then(Weak::upgrade).expect("dispatcher set");
            let background = Arc::clone(&dispatcher);
            thread::spawn(move || {
                let _role = ThreadRole::Background.assign();
                background.submit(Event::generic("late")).unwrap();
            })
            .join()
            .unwrap();
            dispatcher.submit(Event::generic("nested")).unwrap();
        }
        Invocation::completed(payload)
    }
}

#[test]
fn drain_runs_only_the_events_queued_when_it_started() {
    let slot = Arc::new(OnceLock::new());
    let log = Log::default();
    let invoker = ProducingInvoker { dispatcher: Arc::clone(&slot), log: Arc::clone(&log) };
    let cache = Arc::new(HandleCache::new(Arc::new(FilterRegistry::new())));
    let dispatcher = Arc::new(Dispatcher::new(cache, Box::new(invoker), 64));
    slot.set(Arc::downgrade(&dispatcher)).unwrap();

    let background = Arc::clone(&dispatcher);
    thread::spawn(move || {
        let _role = ThreadRole::Background.assign();
        background.submit(Event::generic("batch")).unwrap();
    })
    .join()
    .unwrap();

    let _main = ThreadRole::Main.assign();
    assert_eq!(dispatcher.drain().unwrap(), 1);
    assert_eq!(entries(&log), vec!["batch", "nested"]);
    assert_eq!(dispatcher.pending(), 1, "event queued mid-drain waits for the next drain");

    assert_eq!(dispatcher.drain().unwrap(), 1);
    assert_eq!(entries(&log), vec!["batch", "nested", "late"]);
    assert_eq!(dispatcher.pending(), 0);
}

#[test]
fn filtered_listener_only_sees_its_target_until_eviction() {
    let filters = Arc::new(FilterRegistry::new());
    let cache = Arc::new(HandleCache::new(Arc::clone(&filters)));
    let registry = Arc::new(Mutex::new(ListenerRegistry::new(Arc::clone(&filters))));
    let a = Identity::mobile(0xA000);
    let b = Identity::mobile(0xB000);
    let log = Log::default();
    {
        let mut registry = registry.lock().unwrap();
        registry.register("damage", ("any", push(&log, "any")), ListenerOptions::default());
        registry.register("damage", ("only_a", push(&log, "only_a")), ListenerOptions::filtered(a));
    }
    let dispatcher = Dispatcher::new(Arc::clone(&cache), Box::new(RegistryInvoker { registry }), 64);
    let _main = ThreadRole::Main.assign();

    let response = dispatcher.submit(damage(a)).unwrap();
    assert_eq!(entries(&log), vec!["any", "only_a"]);
    let handle_a = response
        .payload()
        .and_then(|payload| payload.get("reference"))
        .and_then(|value| value.clone().try_cast::<ScriptHandle>())
        .expect("payload carries the target handle");
    assert_eq!(handle_a.identity(), a);

    log.lock().unwrap().clear();
    dispatcher.submit(damage(b)).unwrap();
    assert_eq!(entries(&log), vec!["any"]);

    log.lock().unwrap().clear();
    assert!(cache.evict(a));
    assert!(!handle_a.is_valid());
    assert!(!filters.is_subscribed("damage", FilterKey::Object(a)));
    dispatcher.submit(damage(a)).unwrap();
    assert_eq!(entries(&log), vec!["any"], "evicted filter must not fire for a reused identity");
}
