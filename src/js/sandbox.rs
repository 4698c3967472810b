//! One sandbox generation: a QuickJS context whose only ways out are the
//! bindings installed here.
//!
//! Native helpers are handed to the bootstrap as a function argument and
//! never become globals. The script sees `self`, `window`, `document`,
//! `location`, `top`, `parent`, `frameElement`, `unsafeWindow`, `console`
//! and the four timer functions, nothing else beyond the language builtins.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::rc::Rc;

use anyhow::{Context as AnyhowContext, Result};
use rquickjs::{Ctx, Function, IntoJs, Object, Persistent, Value};
use serde_json::Value as JsonValue;
use tokio::time::{Duration, Instant};

use super::channel::Message;
use super::console::{ConsoleLevel, ConsoleSink};
use super::runtime::{EngineError, QuickJsEngine};
use super::serializer::{serialize, Boundary, BoundaryValue};
use super::timers::{TimerId, TimerKind, TimerRegistry};
use crate::document::Document;
use crate::error::{EvaluationPhase, SandboxEvaluationError, SerializationError};
use crate::lifecycle::{Generation, LifecycleController, LifecycleState};

/// Browsers clamp timer delays to a signed 32-bit millisecond count.
const MAX_TIMER_DELAY_MS: f64 = 2_147_483_647.0;

/// Something the sandbox produced for the controller.
#[derive(Debug, Clone)]
pub(crate) enum Outgoing {
    Message(Message),
    Port { event: String, args: Vec<JsonValue> },
    Fault(SandboxEvaluationError),
}

pub(crate) type Outbox = Rc<RefCell<VecDeque<Outgoing>>>;

/// Shared state the native helpers close over.
#[derive(Clone)]
pub(crate) struct SandboxBindings {
    pub generation: Generation,
    pub lifecycle: Rc<RefCell<LifecycleController>>,
    pub timers: Rc<RefCell<TimerRegistry>>,
    pub outbox: Outbox,
    pub frames: Rc<Vec<Document>>,
    pub console: Rc<dyn ConsoleSink>,
}

pub(crate) struct Sandbox {
    // Must be released before the engine that owns the value.
    hooks: Persistent<Object<'static>>,
    engine: QuickJsEngine,
    generation: Generation,
    outbox: Outbox,
}

impl Sandbox {
    pub fn new(bindings: SandboxBindings) -> Result<Self> {
        let engine = QuickJsEngine::new()?;
        let hooks = engine
            .with_context(|ctx| install_bindings(&ctx, &bindings))
            .context("failed to install sandbox bindings")?;
        Ok(Self {
            hooks,
            engine,
            generation: bindings.generation,
            outbox: bindings.outbox,
        })
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    /// Evaluate the injected script. A throwing script is reported as a
    /// fault; the sandbox stays usable for whatever it registered before.
    pub fn evaluate(&self, source: &str, filename: &str) -> bool {
        match self.engine.eval(source, filename) {
            Ok(()) => true,
            Err(err) => {
                self.fault(err, EvaluationPhase::Script);
                false
            }
        }
    }

    pub fn deliver_message(&self, message: &Message) {
        let payload = message.to_wire();
        self.call_hook(EvaluationPhase::Listener, move |hooks| {
            let hook: Function = hooks.get("message")?;
            hook.call::<_, ()>((payload,))
        });
    }

    pub fn deliver_port(&self, event: &str, args: &[JsonValue]) {
        let event = event.to_string();
        let payload = JsonValue::Array(args.to_vec()).to_string();
        self.call_hook(EvaluationPhase::Listener, move |hooks| {
            let hook: Function = hooks.get("port")?;
            hook.call::<_, ()>((event, payload))
        });
    }

    /// Lifecycle notification (`pagehide`, `pageshow`, `detach`) on the
    /// sandbox's default namespace.
    pub fn notify(&self, event: &str) {
        let event = event.to_string();
        self.call_hook(EvaluationPhase::Listener, move |hooks| {
            let hook: Function = hooks.get("lifecycle")?;
            hook.call::<_, ()>((event,))
        });
    }

    pub fn fire_timer(&self, id: TimerId, kind: TimerKind) {
        let repeating = kind == TimerKind::Repeating;
        self.call_hook(EvaluationPhase::Timer, move |hooks| {
            let hook: Function = hooks.get("timer")?;
            hook.call::<_, ()>((id.get(), repeating))
        });
    }

    fn call_hook<F>(&self, phase: EvaluationPhase, f: F)
    where
        F: for<'js> FnOnce(Object<'js>) -> rquickjs::Result<()>,
    {
        let hooks = self.hooks.clone();
        let outcome = self.engine.guarded(move |ctx| {
            let hooks = hooks.restore(&ctx)?;
            f(hooks)
        });
        if let Err(err) = outcome {
            self.fault(err, phase);
        }
    }

    fn fault(&self, err: EngineError, phase: EvaluationPhase) {
        let fault = match err {
            EngineError::Exception { message, stack } => SandboxEvaluationError {
                message,
                stack,
                phase,
            },
            EngineError::QuickJs(err) => SandboxEvaluationError {
                message: err.to_string(),
                stack: None,
                phase,
            },
        };
        self.outbox.borrow_mut().push_back(Outgoing::Fault(fault));
    }
}

impl fmt::Debug for Sandbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sandbox")
            .field("generation", &self.generation)
            .finish()
    }
}

fn throw<T>(ctx: &Ctx<'_>, message: impl fmt::Display) -> rquickjs::Result<T> {
    let value = message.to_string().into_js(ctx)?;
    Err(ctx.throw(value))
}

fn index_arg(value: &Value<'_>) -> Option<usize> {
    let number = value.as_number()?;
    if number.is_finite() && number >= 0.0 && number.fract() == 0.0 {
        Some(number as usize)
    } else {
        None
    }
}

fn frame_at<'a>(frames: &'a [Document], index: &Value<'_>) -> Option<&'a Document> {
    index_arg(index).and_then(|index| frames.get(index))
}

fn to_wire(value: &BoundaryValue) -> Result<Option<String>, SerializationError> {
    Ok(serialize(value, Boundary::Message)?.map(|json| json.to_string()))
}

fn from_wire(text: Option<&str>) -> Result<BoundaryValue, SerializationError> {
    match text {
        None => Ok(BoundaryValue::Undefined),
        Some(text) => serde_json::from_str::<JsonValue>(text)
            .map(BoundaryValue::from)
            .map_err(|err| SerializationError::InvalidJson(err.to_string())),
    }
}

fn timer_delay(value: &Value<'_>) -> Duration {
    let ms = value.as_number().unwrap_or(0.0);
    if !ms.is_finite() || ms <= 0.0 {
        return Duration::ZERO;
    }
    Duration::from_secs_f64(ms.min(MAX_TIMER_DELAY_MS) / 1_000.0)
}

fn install_bindings<'js>(
    ctx: &Ctx<'js>,
    bindings: &SandboxBindings,
) -> rquickjs::Result<Persistent<Object<'static>>> {
    let natives = Object::new(ctx.clone())?;
    let generation = bindings.generation;

    // Channel
    {
        let lifecycle = Rc::clone(&bindings.lifecycle);
        let outbox = Rc::clone(&bindings.outbox);
        let func = Function::new(
            ctx.clone(),
            move |ctx: Ctx<'_>,
                  kind: String,
                  event: String,
                  payload: Option<String>|
                  -> rquickjs::Result<()> {
                if let Err(err) = lifecycle.borrow().ensure_sendable() {
                    return throw(&ctx, err);
                }
                let outgoing = match kind.as_str() {
                    "message" => match Message::from_wire(payload.as_deref()) {
                        Ok(message) => Outgoing::Message(message),
                        Err(err) => return throw(&ctx, err),
                    },
                    "port" => {
                        let args = payload
                            .as_deref()
                            .map(serde_json::from_str::<Vec<JsonValue>>)
                            .unwrap_or_else(|| Ok(Vec::new()));
                        match args {
                            Ok(args) => Outgoing::Port { event, args },
                            Err(err) => {
                                return throw(&ctx, SerializationError::InvalidJson(err.to_string()))
                            }
                        }
                    }
                    other => return throw(&ctx, format!("unknown channel `{other}`")),
                };
                outbox.borrow_mut().push_back(outgoing);
                Ok(())
            },
        )?
        .with_name("send")?;
        natives.set("send", func)?;
    }

    {
        let outbox = Rc::clone(&bindings.outbox);
        let func = Function::new(
            ctx.clone(),
            move |message: String, stack: Option<String>, phase: String| -> rquickjs::Result<()> {
                outbox
                    .borrow_mut()
                    .push_back(Outgoing::Fault(SandboxEvaluationError {
                        message,
                        stack,
                        phase: EvaluationPhase::parse(&phase),
                    }));
                Ok(())
            },
        )?
        .with_name("report")?;
        natives.set("report", func)?;
    }

    // Timers
    {
        let lifecycle = Rc::clone(&bindings.lifecycle);
        let timers = Rc::clone(&bindings.timers);
        let func = Function::new(
            ctx.clone(),
            move |delay: Value<'_>, repeating: bool| -> rquickjs::Result<u32> {
                let state = lifecycle.borrow().state();
                if state == LifecycleState::Destroyed {
                    return Ok(0);
                }
                let kind = if repeating {
                    TimerKind::Repeating
                } else {
                    TimerKind::OneShot
                };
                let id = timers.borrow_mut().schedule(
                    generation,
                    kind,
                    timer_delay(&delay),
                    Instant::now(),
                    state == LifecycleState::Frozen,
                );
                Ok(id.get())
            },
        )?
        .with_name("setTimer")?;
        natives.set("setTimer", func)?;
    }

    {
        let timers = Rc::clone(&bindings.timers);
        let func = Function::new(ctx.clone(), move |id: Value<'_>| -> rquickjs::Result<()> {
            if let Some(id) = id.as_number().and_then(TimerId::from_script) {
                timers.borrow_mut().cancel(generation, id);
            }
            Ok(())
        })?
        .with_name("clearTimer")?;
        natives.set("clearTimer", func)?;
    }

    // Console
    {
        let console = Rc::clone(&bindings.console);
        let func = Function::new(
            ctx.clone(),
            move |level: String, message: String| -> rquickjs::Result<()> {
                let level = level.parse().unwrap_or(ConsoleLevel::Log);
                console.write(level, &message);
                Ok(())
            },
        )?
        .with_name("log")?;
        natives.set("log", func)?;
    }

    // Document and frames
    let privileged = bindings
        .frames
        .first()
        .map(Document::is_privileged)
        .unwrap_or(false);
    natives.set("privileged", privileged)?;

    {
        let count = bindings.frames.len() as u32;
        let func = Function::new(ctx.clone(), move || -> rquickjs::Result<u32> { Ok(count) })?
            .with_name("frameCount")?;
        natives.set("frameCount", func)?;
    }

    {
        let frames = Rc::clone(&bindings.frames);
        let func = Function::new(
            ctx.clone(),
            move |ctx: Ctx<'_>, index: Value<'_>| -> rquickjs::Result<String> {
                match frame_at(&frames, &index) {
                    Some(document) => Ok(document.url().to_string()),
                    None => throw(&ctx, "no such frame"),
                }
            },
        )?
        .with_name("url")?;
        natives.set("url", func)?;
    }

    {
        let frames = Rc::clone(&bindings.frames);
        let func = Function::new(
            ctx.clone(),
            move |ctx: Ctx<'_>, index: Value<'_>| -> rquickjs::Result<String> {
                match frame_at(&frames, &index) {
                    Some(document) => Ok(document.title()),
                    None => throw(&ctx, "no such frame"),
                }
            },
        )?
        .with_name("title")?;
        natives.set("title", func)?;
    }

    {
        let frames = Rc::clone(&bindings.frames);
        let func = Function::new(
            ctx.clone(),
            move |ctx: Ctx<'_>, index: Value<'_>, title: String| -> rquickjs::Result<()> {
                match frame_at(&frames, &index) {
                    Some(document) => {
                        document.set_title(title);
                        Ok(())
                    }
                    None => throw(&ctx, "no such frame"),
                }
            },
        )?
        .with_name("setTitle")?;
        natives.set("setTitle", func)?;
    }

    {
        let frames = Rc::clone(&bindings.frames);
        let func = Function::new(
            ctx.clone(),
            move |ctx: Ctx<'_>, index: Value<'_>| -> rquickjs::Result<String> {
                match frame_at(&frames, &index) {
                    Some(document) => Ok(document.ready_state().as_str().to_string()),
                    None => throw(&ctx, "no such frame"),
                }
            },
        )?
        .with_name("readyState")?;
        natives.set("readyState", func)?;
    }

    {
        let frames = Rc::clone(&bindings.frames);
        let func = Function::new(
            ctx.clone(),
            move |ctx: Ctx<'_>, index: Value<'_>| -> rquickjs::Result<Option<String>> {
                let Some(document) = frame_at(&frames, &index) else {
                    return throw(&ctx, "no such frame");
                };
                let Some(element) = document.frame_element() else {
                    return Ok(None);
                };
                match to_wire(&element) {
                    Ok(text) => Ok(text),
                    Err(err) => throw(&ctx, err),
                }
            },
        )?
        .with_name("frameElement")?;
        natives.set("frameElement", func)?;
    }

    // Page globals (unsafeWindow)
    {
        let frames = Rc::clone(&bindings.frames);
        let func = Function::new(
            ctx.clone(),
            move |index: Value<'_>, name: String| -> rquickjs::Result<String> {
                let kind = match frame_at(&frames, &index).map(|document| document.global(&name)) {
                    None | Some(BoundaryValue::Undefined) => "undefined",
                    Some(BoundaryValue::Function(_)) => "function",
                    Some(_) => "data",
                };
                Ok(kind.to_string())
            },
        )?
        .with_name("pageGlobalKind")?;
        natives.set("pageGlobalKind", func)?;
    }

    {
        let frames = Rc::clone(&bindings.frames);
        let func = Function::new(
            ctx.clone(),
            move |ctx: Ctx<'_>, index: Value<'_>, name: String| -> rquickjs::Result<Option<String>> {
                let Some(document) = frame_at(&frames, &index) else {
                    return throw(&ctx, "no such frame");
                };
                match to_wire(&document.global(&name)) {
                    Ok(text) => Ok(text),
                    Err(err) => throw(&ctx, err),
                }
            },
        )?
        .with_name("pageGlobal")?;
        natives.set("pageGlobal", func)?;
    }

    {
        let frames = Rc::clone(&bindings.frames);
        let func = Function::new(
            ctx.clone(),
            move |ctx: Ctx<'_>,
                  index: Value<'_>,
                  name: String,
                  payload: Option<String>|
                  -> rquickjs::Result<()> {
                let Some(document) = frame_at(&frames, &index) else {
                    return throw(&ctx, "no such frame");
                };
                match from_wire(payload.as_deref()) {
                    Ok(value) => {
                        document.define_global(name, value);
                        Ok(())
                    }
                    Err(err) => throw(&ctx, err),
                }
            },
        )?
        .with_name("setPageGlobal")?;
        natives.set("setPageGlobal", func)?;
    }

    {
        let frames = Rc::clone(&bindings.frames);
        let func = Function::new(
            ctx.clone(),
            move |index: Value<'_>, name: String| -> rquickjs::Result<bool> {
                Ok(frame_at(&frames, &index)
                    .map(|document| document.remove_global(&name))
                    .unwrap_or(false))
            },
        )?
        .with_name("deletePageGlobal")?;
        natives.set("deletePageGlobal", func)?;
    }

    {
        let frames = Rc::clone(&bindings.frames);
        let func = Function::new(
            ctx.clone(),
            move |index: Value<'_>| -> rquickjs::Result<Vec<String>> {
                Ok(frame_at(&frames, &index)
                    .map(|document| {
                        document
                            .global_names()
                            .into_iter()
                            .filter(|name| !document.global(name).is_undefined())
                            .collect()
                    })
                    .unwrap_or_default())
            },
        )?
        .with_name("pageGlobalNames")?;
        natives.set("pageGlobalNames", func)?;
    }

    {
        let frames = Rc::clone(&bindings.frames);
        let func = Function::new(
            ctx.clone(),
            move |ctx: Ctx<'_>,
                  index: Value<'_>,
                  name: String,
                  payload: String|
                  -> rquickjs::Result<Option<String>> {
                let Some(document) = frame_at(&frames, &index) else {
                    return throw(&ctx, "no such frame");
                };
                let BoundaryValue::Function(function) = document.global(&name) else {
                    return throw(&ctx, format!("{name} is not a function"));
                };
                let args = match from_wire(Some(&payload)) {
                    Ok(BoundaryValue::Array(args)) => args,
                    Ok(_) => Vec::new(),
                    Err(err) => return throw(&ctx, err),
                };
                match to_wire(&function.call(&args)) {
                    Ok(text) => Ok(text),
                    Err(err) => throw(&ctx, err),
                }
            },
        )?
        .with_name("callPageGlobal")?;
        natives.set("callPageGlobal", func)?;
    }

    let bootstrap: Function = ctx.eval(SANDBOX_BOOTSTRAP)?;
    let hooks: Object = bootstrap.call((natives,))?;
    Ok(Persistent::save(ctx, hooks))
}

const SANDBOX_BOOTSTRAP: &str = r#"
(function (natives) {
    "use strict";
    const global = globalThis;
    const freeze = Object.freeze;

    const toError = (err) => (err instanceof Error ? err : new Error(String(err)));
    const invoke = (fn, ...args) => {
        try {
            return fn(...args);
        } catch (err) {
            throw toError(err);
        }
    };

    const fault = (err, phase) => {
        let message;
        let stack;
        if (err instanceof Error) {
            message = String(err.message);
            stack = err.stack === undefined ? undefined : String(err.stack);
        } else {
            message = String(err);
        }
        try {
            natives.report(message, stack, phase);
        } catch (_) {
            // Reporting must never throw back into the script.
        }
    };

    const encode = (value) => {
        if (value === undefined) {
            return undefined;
        }
        try {
            return JSON.stringify(value);
        } catch (err) {
            const detail = err && err.message ? err.message : String(err);
            throw new TypeError("SerializationError: " + detail);
        }
    };
    const decode = (text) => (text === undefined || text === null ? undefined : JSON.parse(text));

    function createEmitter() {
        const table = new Map();
        const pending = [];
        let depth = 0;
        const apply = (op) => {
            if (depth > 0) {
                pending.push(op);
            } else {
                op();
            }
        };
        return freeze({
            on(type, listener) {
                if (typeof listener !== "function") {
                    throw new TypeError("listener must be a function");
                }
                const name = String(type);
                apply(() => {
                    let list = table.get(name);
                    if (!list) {
                        list = [];
                        table.set(name, list);
                    }
                    list.push(listener);
                });
            },
            off(type, listener) {
                const name = String(type);
                apply(() => {
                    const list = table.get(name);
                    if (!list) {
                        return;
                    }
                    const index = list.indexOf(listener);
                    if (index !== -1) {
                        list.splice(index, 1);
                    }
                });
            },
            emit(type, args) {
                const list = table.get(type);
                if (!list || list.length === 0) {
                    return 0;
                }
                const snapshot = list.slice();
                depth++;
                try {
                    for (const listener of snapshot) {
                        try {
                            listener.apply(null, args);
                        } catch (err) {
                            fault(err, "listener");
                        }
                    }
                } finally {
                    depth--;
                    if (depth === 0) {
                        while (pending.length > 0) {
                            pending.shift()();
                        }
                    }
                }
                return snapshot.length;
            },
        });
    }

    const messages = createEmitter();
    const ports = createEmitter();

    const port = freeze({
        on(type, listener) {
            ports.on(type, listener);
        },
        removeListener(type, listener) {
            ports.off(type, listener);
        },
        emit(type, ...args) {
            invoke(natives.send, "port", String(type), encode(args));
        },
    });

    const self = freeze({
        on(type, listener) {
            messages.on(type, listener);
        },
        removeListener(type, listener) {
            messages.off(type, listener);
        },
        postMessage(value) {
            invoke(natives.send, "message", "message", encode(value));
        },
        port,
    });

    const callbacks = new Map();
    const schedule = (callback, delay, args, repeating) => {
        if (typeof callback !== "function") {
            throw new TypeError("timer callback must be a function");
        }
        const ms = Number(delay);
        const id = natives.setTimer(Number.isFinite(ms) ? ms : 0, repeating);
        if (id > 0) {
            callbacks.set(id, { callback, args });
        }
        return id;
    };
    const cancel = (id) => {
        if (typeof id !== "number" || !callbacks.has(id)) {
            return;
        }
        callbacks.delete(id);
        natives.clearTimer(id);
    };
    function setTimeout(callback, delay, ...args) {
        return schedule(callback, delay, args, false);
    }
    function setInterval(callback, delay, ...args) {
        return schedule(callback, delay, args, true);
    }
    function clearTimeout(id) {
        cancel(id);
    }
    function clearInterval(id) {
        cancel(id);
    }

    const stringify = (value) => {
        try {
            if (typeof value === "string") {
                return value;
            }
            if (value === undefined) {
                return "undefined";
            }
            if (value === null) {
                return "null";
            }
            if (typeof value === "object" && !(value instanceof Error)) {
                try {
                    return JSON.stringify(value);
                } catch (_) {
                    // Fall through to String().
                }
            }
            return String(value);
        } catch (_) {
            return "[unprintable]";
        }
    };
    const console = {};
    for (const level of ["log", "info", "warn", "error", "debug", "exception"]) {
        console[level] = (...args) => {
            try {
                natives.log(level, args.map(stringify).join(" "));
            } catch (_) {
                // Console must never throw.
            }
        };
    }
    freeze(console);

    const frameCount = natives.frameCount();
    const windows = [];
    const windowAt = (index) => {
        if (windows[index]) {
            return windows[index];
        }
        const last = frameCount - 1;
        const location = freeze({
            get href() {
                return natives.url(index);
            },
            toString() {
                return natives.url(index);
            },
        });
        const document = freeze({
            get title() {
                return natives.title(index);
            },
            set title(value) {
                natives.setTitle(index, String(value));
            },
            get URL() {
                return natives.url(index);
            },
            get readyState() {
                return natives.readyState(index);
            },
            get location() {
                return location;
            },
        });
        const win = {};
        Object.defineProperties(win, {
            window: { get: () => windows[index], enumerable: true },
            document: { value: document, enumerable: true },
            location: { get: () => location, enumerable: true },
            top: { get: () => windowAt(last), enumerable: true },
            parent: { get: () => windowAt(Math.min(index + 1, last)), enumerable: true },
            frameElement: {
                get: () => {
                    const element = decode(natives.frameElement(index));
                    return element === undefined ? null : element;
                },
                enumerable: true,
            },
        });
        freeze(win);
        windows[index] = index === 0 && natives.privileged ? unwrapped(win) : win;
        return windows[index];
    };

    // A privileged document is not wrapped: its globals show through `window`.
    const unwrapped = (win) =>
        new Proxy(win, {
            get(target, key, receiver) {
                if (typeof key !== "string" || key in target) {
                    return Reflect.get(target, key, receiver);
                }
                return pageValue(key);
            },
            has(target, key) {
                return key in target || (typeof key === "string" && natives.pageGlobalKind(0, key) !== "undefined");
            },
        });

    const pageValue = (name) => {
        const kind = natives.pageGlobalKind(0, name);
        if (kind === "function") {
            return (...args) => decode(invoke(natives.callPageGlobal, 0, name, encode(args)));
        }
        if (kind === "data") {
            return decode(invoke(natives.pageGlobal, 0, name));
        }
        return undefined;
    };
    const unsafeWindow = new Proxy(Object.create(null), {
        get(_target, key) {
            return typeof key === "string" ? pageValue(key) : undefined;
        },
        set(_target, key, value) {
            if (typeof key !== "string") {
                return false;
            }
            invoke(natives.setPageGlobal, 0, key, encode(value));
            return true;
        },
        has(_target, key) {
            return typeof key === "string" && natives.pageGlobalKind(0, key) !== "undefined";
        },
        deleteProperty(_target, key) {
            return typeof key === "string" && natives.deletePageGlobal(0, key);
        },
        ownKeys() {
            return natives.pageGlobalNames(0);
        },
        getOwnPropertyDescriptor(_target, key) {
            if (typeof key !== "string" || natives.pageGlobalKind(0, key) === "undefined") {
                return undefined;
            }
            return { value: pageValue(key), writable: true, enumerable: true, configurable: true };
        },
    });

    const view = windowAt(0);
    const constant = (name, value) =>
        Object.defineProperty(global, name, { value, enumerable: false, writable: false, configurable: false });
    const live = (name, get) =>
        Object.defineProperty(global, name, { get, enumerable: false, configurable: false });

    constant("self", self);
    constant("window", view);
    constant("document", view.document);
    constant("unsafeWindow", unsafeWindow);
    constant("console", console);
    constant("setTimeout", setTimeout);
    constant("setInterval", setInterval);
    constant("clearTimeout", clearTimeout);
    constant("clearInterval", clearInterval);
    live("location", () => view.location);
    live("top", () => view.top);
    live("parent", () => view.parent);
    live("frameElement", () => view.frameElement);

    return freeze({
        message(payload) {
            messages.emit("message", [decode(payload)]);
        },
        port(type, payload) {
            const args = decode(payload);
            ports.emit(type, Array.isArray(args) ? args : []);
        },
        lifecycle(type) {
            messages.emit(type, []);
        },
        timer(id, repeating) {
            const entry = callbacks.get(id);
            if (!entry) {
                return;
            }
            if (!repeating) {
                callbacks.delete(id);
            }
            try {
                entry.callback.apply(null, entry.args);
            } catch (err) {
                fault(err, "timer");
            }
        },
    });
})
"#;
