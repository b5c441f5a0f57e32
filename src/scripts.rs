use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};

use anyhow::{anyhow, Context, Result};
use rhai::{Dynamic, Engine, EvalAltResult, FnPtr, FuncArgs, Map, Scope, AST, FLOAT, INT};
use tracing::{debug, info};

use crate::bridge::BridgeServices;
use crate::config::ScriptConfig;
use crate::dispatcher::{Invocation, ListenerInvoker};
use crate::error::ListenerFailure;
use crate::events::Payload;
use crate::handle_cache::ScriptHandle;
use crate::identity::FilterKey;
use crate::listeners::{ListenerOptions, ListenerRegistry};
use crate::timers::{ClockDomain, Repeat, SharedTimers, TimerCallback, TimerId, TimerInfo};

type RhaiResult<T> = std::result::Result<T, Box<EvalAltResult>>;

pub type ScriptListeners = Arc<Mutex<ListenerRegistry<FnPtr>>>;

/// Lines scripts wrote through `log`/`print`, kept for tooling and tests.
#[derive(Clone, Default)]
pub struct ScriptLogs(Arc<Mutex<Vec<String>>>);

impl ScriptLogs {
    fn push(&self, line: String) {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).push(line);
    }

    pub fn take(&self) -> Vec<String> {
        std::mem::take(&mut *self.0.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

/// Engine plus the compiled script. Timer callbacks hold it weakly.
struct ScriptRuntime {
    engine: Engine,
    ast: RwLock<Option<Arc<AST>>>,
}

impl ScriptRuntime {
    fn current_ast(&self) -> Option<Arc<AST>> {
        self.ast.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn set_ast(&self, ast: Arc<AST>) {
        *self.ast.write().unwrap_or_else(PoisonError::into_inner) = Some(ast);
    }

    fn call(&self, callback: &FnPtr, args: impl FuncArgs) -> Result<Dynamic> {
        let ast = self.current_ast().ok_or_else(|| anyhow!("no script loaded"))?;
        callback.call::<Dynamic>(&self.engine, &ast, args).map_err(|err| anyhow!("{err}"))
    }
}

/// Runs rhai listeners and timer callbacks. Lives behind the dispatcher on the main thread.
pub struct ScriptHost {
    runtime: Arc<ScriptRuntime>,
    listeners: ScriptListeners,
    scope: Scope<'static>,
    script_path: Option<PathBuf>,
    error: Option<String>,
    logs: ScriptLogs,
}

impl ScriptHost {
    pub fn new(services: &BridgeServices, config: &ScriptConfig) -> Self {
        let registry = ListenerRegistry::new(Arc::clone(&services.filters));
        let listeners: ScriptListeners = Arc::new(Mutex::new(registry));
        let logs = ScriptLogs::default();
        let runtime = Arc::new_cyclic(|weak: &Weak<ScriptRuntime>| {
            let mut engine = Engine::new();
            engine.set_max_operations(config.max_operations);
            engine.set_max_call_levels(config.max_call_levels);
            let api = ScriptApi {
                listeners: Arc::clone(&listeners),
                timers: services.timers.clone(),
                runtime: weak.clone(),
                logs: logs.clone(),
            };
            register_api(&mut engine, api);
            ScriptRuntime { engine, ast: RwLock::new(None) }
        });
        Self { runtime, listeners, scope: Scope::new(), script_path: None, error: None, logs }
    }

    pub fn script_path(&self) -> Option<&Path> {
        self.script_path.as_deref()
    }

    pub fn last_error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn logs(&self) -> ScriptLogs {
        self.logs.clone()
    }

    pub fn listeners(&self) -> ScriptListeners {
        Arc::clone(&self.listeners)
    }

    /// Compiles and runs a script file: its top level first, then `init()` if defined.
    ///
    /// Listeners from a previously loaded script are dropped.
    pub fn load(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let source = fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
        self.script_path = Some(path.to_path_buf());
        self.load_source(&source).with_context(|| format!("Loading script {}", path.display()))
    }

    pub fn load_source(&mut self, source: &str) -> Result<()> {
        let result = self.load_source_inner(source);
        if let Err(err) = &result {
            self.error = Some(format!("{err:#}"));
        }
        result
    }

    fn load_source_inner(&mut self, source: &str) -> Result<()> {
        let ast = self.runtime.engine.compile(source).with_context(|| "Compiling Rhai script")?;
        let ast = Arc::new(ast);
        lock(&self.listeners).clear();
        self.scope = Scope::new();
        self.runtime.set_ast(Arc::clone(&ast));
        self.error = None;

        // call_fn evaluates the top level before looking up init().
        match self.runtime.engine.call_fn::<Dynamic>(&mut self.scope, &ast, "init", ()) {
            Ok(_) => {}
            Err(err) if is_missing_init(&err) => {}
            Err(err) => return Err(anyhow!("Running script: {err}")),
        }
        info!(path = ?self.script_path, "script loaded");
        Ok(())
    }
}

impl ListenerInvoker for ScriptHost {
    fn is_event_enabled(&self, event: &str) -> bool {
        lock(&self.listeners).is_event_enabled(event)
    }

    fn invoke(&mut self, event: &str, payload: Payload, filter: Option<FilterKey>) -> Invocation {
        // Snapshot so listeners may register or unregister while we iterate.
        let targets = lock(&self.listeners).snapshot(event, filter);
        let mut shared = Dynamic::from(payload).into_shared();
        let mut failures = Vec::new();
        for (_, callback) in targets {
            match self.runtime.call(&callback, (shared.clone(),)) {
                Ok(result) => {
                    if result.as_bool() == Ok(false) {
                        debug!(event, listener = callback.fn_name(), "listener stopped propagation");
                        break;
                    }
                    if let Some(returned) = result.try_cast::<Map>() {
                        if let Some(mut current) = shared.write_lock::<Map>() {
                            current.extend(returned);
                        }
                    }
                }
                Err(err) => {
                    failures.push(ListenerFailure::new(event, callback.fn_name(), format!("{err:#}")));
                }
            }
        }
        let response = shared.flatten().try_cast::<Map>().unwrap_or_default();
        Invocation { response, failures }
    }
}

fn is_missing_init(err: &EvalAltResult) -> bool {
    matches!(err, EvalAltResult::ErrorFunctionNotFound(name, _) if name == "init" || name.starts_with("init ("))
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// State captured by the functions scripts can call.
#[derive(Clone)]
struct ScriptApi {
    listeners: ScriptListeners,
    timers: SharedTimers,
    runtime: Weak<ScriptRuntime>,
    logs: ScriptLogs,
}

impl ScriptApi {
    fn register_event(&self, event: &str, callback: FnPtr, options: Map) -> RhaiResult<INT> {
        let options = parse_listener_options(&options)?;
        let id = lock(&self.listeners).register(event, callback, options);
        Ok(id.0 as INT)
    }

    fn unregister_event(&self, event: &str, callback: FnPtr) -> bool {
        let name = callback.fn_name().to_string();
        lock(&self.listeners).unregister_where(event, |existing| existing.fn_name() == name) > 0
    }

    fn is_event_registered(&self, event: &str, callback: FnPtr) -> bool {
        let name = callback.fn_name().to_string();
        lock(&self.listeners).is_registered_where(event, |existing| existing.fn_name() == name)
    }

    fn timer_start(&self, domain: &str, delay: Dynamic, callback: FnPtr, iterations: INT) -> RhaiResult<INT> {
        let domain = ClockDomain::parse(domain)
            .ok_or_else(|| format!("unknown timer domain '{domain}' (use real, simulate or game)"))?;
        let delay = delay
            .as_float()
            .or_else(|_| delay.as_int().map(|value| value as FLOAT))
            .map_err(|_| "timer delay must be a number".to_string())?;
        let repeat = match iterations {
            n if n <= 0 => Repeat::Forever,
            1 => Repeat::Once,
            n => Repeat::Times(u32::try_from(n).unwrap_or(u32::MAX)),
        };
        let runtime = self.runtime.clone();
        let fire: TimerCallback = Box::new(move |info: &TimerInfo| {
            let runtime = runtime.upgrade().ok_or_else(|| anyhow!("script runtime was unloaded"))?;
            runtime.call(&callback, (timer_info_map(info),)).map(|_| ())
        });
        let id = self.timers.schedule(domain, delay, repeat, fire).map_err(|err| err.to_string())?;
        Ok(id.0 as INT)
    }

    fn timer_cancel(&self, id: INT) -> bool {
        u64::try_from(id).is_ok_and(|id| self.timers.cancel(TimerId(id)))
    }

    fn timer_time_left(&self, id: INT) -> Dynamic {
        u64::try_from(id)
            .ok()
            .and_then(|id| self.timers.time_left(TimerId(id)))
            .map_or(Dynamic::UNIT, |left| Dynamic::from(left as FLOAT))
    }

    fn log(&self, message: &str) {
        info!(target: "script", "{message}");
        self.logs.push(message.to_string());
    }
}

fn parse_listener_options(options: &Map) -> RhaiResult<ListenerOptions> {
    let mut parsed = ListenerOptions::default();
    if let Some(priority) = options.get("priority") {
        parsed.priority = priority.as_int().map_err(|_| "listener priority must be an integer".to_string())?;
    }
    if let Some(filter) = options.get("filter") {
        parsed.filter = Some(filter_key_from(filter)?);
    }
    Ok(parsed)
}

fn filter_key_from(value: &Dynamic) -> RhaiResult<FilterKey> {
    if let Some(handle) = value.clone().try_cast::<ScriptHandle>() {
        if !handle.is_valid() {
            return Err("cannot filter on a handle whose object was destroyed".into());
        }
        return Ok(FilterKey::Object(handle.identity()));
    }
    if let Ok(value) = value.as_int() {
        return Ok(FilterKey::Value(value));
    }
    Err(format!("unsupported event filter of type {}", value.type_name()).into())
}

fn timer_info_map(info: &TimerInfo) -> Map {
    let mut map = Map::new();
    map.insert("id".into(), Dynamic::from(info.id.0 as INT));
    map.insert("domain".into(), Dynamic::from(info.domain.label().to_string()));
    map.insert("iteration".into(), Dynamic::from(info.iteration as INT));
    map.insert("clock".into(), Dynamic::from(info.clock as FLOAT));
    map
}

fn register_api(engine: &mut Engine, api: ScriptApi) {
    let print_logs = api.logs.clone();
    engine.on_print(move |text| {
        info!(target: "script", "{text}");
        print_logs.push(text.to_string());
    });
    engine.on_debug(|text, source, pos| {
        debug!(target: "script", source = source.unwrap_or("-"), position = %pos, "{text}");
    });

    engine
        .register_type_with_name::<ScriptHandle>("Handle")
        .register_get("valid", |handle: &mut ScriptHandle| handle.is_valid())
        .register_get("kind", |handle: &mut ScriptHandle| handle.type_name().to_string())
        .register_get("address", |handle: &mut ScriptHandle| handle.identity().address() as INT)
        .register_fn("==", |a: &mut ScriptHandle, b: ScriptHandle| a.ptr_eq(&b))
        .register_fn("!=", |a: &mut ScriptHandle, b: ScriptHandle| !a.ptr_eq(&b))
        .register_fn("to_string", |handle: &mut ScriptHandle| format!("{handle:?}"));

    let a = api.clone();
    engine.register_fn("register_event", move |event: &str, callback: FnPtr| {
        a.register_event(event, callback, Map::new())
    });
    let a = api.clone();
    engine.register_fn("register_event", move |event: &str, callback: FnPtr, options: Map| {
        a.register_event(event, callback, options)
    });
    let a = api.clone();
    engine.register_fn("unregister_event", move |event: &str, callback: FnPtr| a.unregister_event(event, callback));
    let a = api.clone();
    engine.register_fn("is_event_registered", move |event: &str, callback: FnPtr| {
        a.is_event_registered(event, callback)
    });

    let a = api.clone();
    engine.register_fn("timer_start", move |domain: &str, delay: Dynamic, callback: FnPtr| {
        a.timer_start(domain, delay, callback, 1)
    });
    let a = api.clone();
    engine.register_fn("timer_start", move |domain: &str, delay: Dynamic, callback: FnPtr, iterations: INT| {
        a.timer_start(domain, delay, callback, iterations)
    });
    let a = api.clone();
    engine.register_fn("timer_cancel", move |id: INT| a.timer_cancel(id));
    let a = api.clone();
    engine.register_fn("timer_time_left", move |id: INT| a.timer_time_left(id));

    engine.register_fn("log", move |message: &str| api.log(message));
}
