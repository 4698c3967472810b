//! Controller-side facade of a content worker.
//!
//! A [`Worker`] owns one sandbox generation at a time. Everything that
//! crosses into or out of the sandbox is queued and handed over by
//! [`Worker::pump`], which is also where document lifecycle notifications
//! are applied. Listeners may call back into the worker freely; such calls
//! enqueue and the running pump picks them up.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fmt;
use std::rc::Rc;

use serde_json::Value as JsonValue;
use tokio::time::{Duration, Instant};

use crate::config::{ErrorCallback, MessageCallback, WorkerConfig, WorkerOptions};
use crate::document::{Document, DocumentEvent, ObserverId};
use crate::error::{ChannelUnavailableError, SandboxEvaluationError, WorkerError};
use crate::js::channel::{ListenerId, ListenerSet, Message, MessageChannel, PortChannel};
use crate::js::console::ConsoleSink;
use crate::js::sandbox::{Outbox, Outgoing, Sandbox, SandboxBindings};
use crate::js::serializer::{
    serialize, serialize_port_args, Boundary, BoundaryValue, ForeignObject, ForeignProperty,
};
use crate::js::timers::TimerRegistry;
use crate::lifecycle::{Generation, LifecycleController, LifecycleState, Transition};

const ERROR_EVENT: &str = "error";

#[derive(Clone)]
struct Session {
    generation: Generation,
    document: Document,
    observer: ObserverId,
    lifecycle: Rc<RefCell<LifecycleController>>,
    outbox: Outbox,
    sandbox: Option<Rc<Sandbox>>,
    evaluated: bool,
}

impl Session {
    fn state(&self) -> LifecycleState {
        self.lifecycle.borrow().state()
    }

    /// Sandbox that may receive deliveries and fire timers right now.
    fn live_sandbox(&self) -> Option<Rc<Sandbox>> {
        if self.evaluated && self.state() == LifecycleState::Attached {
            self.sandbox.clone()
        } else {
            None
        }
    }
}

enum Inbound {
    Message(Message),
    Port { event: String, args: Vec<JsonValue> },
}

enum Pending {
    Document {
        generation: Generation,
        event: DocumentEvent,
    },
    Destroy,
}

struct WorkerInner {
    script: String,
    config: WorkerConfig,
    on_message: Option<MessageCallback>,
    on_error: Option<ErrorCallback>,
    console: Rc<dyn ConsoleSink>,
    messages: MessageChannel,
    port: PortChannel,
    errors: ListenerSet<SandboxEvaluationError>,
    timers: Rc<RefCell<TimerRegistry>>,
    session: RefCell<Option<Session>>,
    next_generation: Cell<Generation>,
    pending: RefCell<VecDeque<Pending>>,
    inbox: RefCell<VecDeque<Inbound>>,
    pumping: Cell<bool>,
    in_sandbox: Cell<bool>,
    tearing_down: Cell<bool>,
}

impl Drop for WorkerInner {
    fn drop(&mut self) {
        if let Some(session) = self.session.get_mut().take() {
            session.document.unsubscribe(session.observer);
        }
    }
}

/// Cheap-clone handle to a content worker.
#[derive(Clone)]
pub struct Worker {
    inner: Rc<WorkerInner>,
}

impl Worker {
    /// Validate `options`, attach to the target document and evaluate the
    /// script as soon as its load timing allows.
    pub fn new(options: WorkerOptions) -> Result<Self, WorkerError> {
        options.validate()?;
        let WorkerOptions {
            target,
            script,
            config,
            on_message,
            on_error,
            console,
        } = options;

        let min_interval = Duration::from_millis(config.min_interval_ms);
        let worker = Self {
            inner: Rc::new(WorkerInner {
                script,
                config,
                on_message,
                on_error,
                console,
                messages: MessageChannel::default(),
                port: PortChannel::default(),
                errors: ListenerSet::new(),
                timers: Rc::new(RefCell::new(TimerRegistry::new(min_interval))),
                session: RefCell::new(None),
                next_generation: Cell::new(Generation::FIRST),
                pending: RefCell::new(VecDeque::new()),
                inbox: RefCell::new(VecDeque::new()),
                pumping: Cell::new(false),
                in_sandbox: Cell::new(false),
                tearing_down: Cell::new(false),
            }),
        };
        worker.attach(target)?;
        Ok(worker)
    }

    /// Point the worker at `document`. The current generation is torn down
    /// first (timers retired, listeners cleared), then a fresh sandbox is
    /// created under a new generation and the option callbacks are
    /// registered again.
    ///
    /// Fails with [`WorkerError::Reentrant`] when called from sandbox code
    /// or from a callback that runs while a generation is being torn down
    /// (a `"detach"` listener, an error listener reporting a detach fault).
    pub fn attach(&self, document: Document) -> Result<Generation, WorkerError> {
        if self.inner.in_sandbox.get() || self.inner.tearing_down.get() {
            return Err(WorkerError::Reentrant);
        }
        if document.is_unloaded() {
            return Err(WorkerError::DocumentUnloaded);
        }
        self.teardown();

        let generation = self.inner.next_generation.get();
        self.inner.next_generation.set(generation.next());

        let lifecycle = Rc::new(RefCell::new(LifecycleController::attach(generation)));
        let outbox: Outbox = Rc::default();
        let sandbox = Sandbox::new(SandboxBindings {
            generation,
            lifecycle: Rc::clone(&lifecycle),
            timers: Rc::clone(&self.inner.timers),
            outbox: Rc::clone(&outbox),
            frames: Rc::new(document.ancestry()),
            console: Rc::clone(&self.inner.console),
        })?;

        let observer = {
            let weak = Rc::downgrade(&self.inner);
            document.subscribe(move |_, event| {
                if let Some(inner) = weak.upgrade() {
                    Worker { inner }.enqueue(Pending::Document {
                        generation,
                        event: event.clone(),
                    });
                }
            })
        };

        if let Some(callback) = &self.inner.on_message {
            self.inner.messages.on_shared("message", Rc::clone(callback));
        }
        if let Some(callback) = &self.inner.on_error {
            self.inner.errors.on(ERROR_EVENT, Rc::clone(callback));
        }

        if document.is_hidden() {
            lifecycle.borrow_mut().hide();
        }

        tracing::info!(
            target: "worker",
            %generation,
            url = %document.url(),
            timing = %self.inner.config.script_load_timing,
            "worker attached"
        );

        *self.inner.session.borrow_mut() = Some(Session {
            generation,
            document,
            observer,
            lifecycle,
            outbox,
            sandbox: Some(Rc::new(sandbox)),
            evaluated: false,
        });

        self.pump();
        Ok(generation)
    }

    /// Controller-initiated unload. Calling it again is a no-op.
    ///
    /// From inside a listener the teardown happens once that listener
    /// returns.
    pub fn destroy(&self) {
        self.enqueue(Pending::Destroy);
    }

    /// Send `value` to the sandbox's `self.on("message")` listeners.
    pub fn post_message(&self, value: &BoundaryValue) -> Result<(), WorkerError> {
        self.ensure_sendable()?;
        let message = match serialize(value, Boundary::Message)? {
            Some(json) => Message::json(json),
            None => Message::undefined(),
        };
        self.inner
            .inbox
            .borrow_mut()
            .push_back(Inbound::Message(message));
        self.pump();
        Ok(())
    }

    pub fn on(&self, event: &str, callback: impl Fn(&Message) + 'static) -> ListenerId {
        self.inner.messages.on(event, callback)
    }

    pub fn remove_listener(&self, id: ListenerId) {
        self.inner.messages.remove_listener(id);
    }

    /// Faults raised by the sandboxed script.
    pub fn on_error(&self, callback: impl Fn(&SandboxEvaluationError) + 'static) -> ListenerId {
        self.inner.errors.on(ERROR_EVENT, Rc::new(callback))
    }

    pub fn remove_error_listener(&self, id: ListenerId) {
        self.inner.errors.remove(id);
    }

    pub fn port(&self) -> Port<'_> {
        Port { worker: self }
    }

    /// Current location of the attached document, `None` once destroyed.
    pub fn url(&self) -> Option<String> {
        let session = self.session()?;
        if session.state().is_terminal() {
            return None;
        }
        Some(session.document.url().to_string())
    }

    pub fn state(&self) -> LifecycleState {
        self.session()
            .map(|session| session.state())
            .unwrap_or(LifecycleState::Destroyed)
    }

    pub fn generation(&self) -> Generation {
        self.session()
            .map(|session| session.generation)
            .unwrap_or(Generation::FIRST)
    }

    pub fn document(&self) -> Option<Document> {
        self.session().map(|session| session.document)
    }

    /// Timers the current generation still holds, armed or suspended.
    pub fn live_timers(&self) -> usize {
        self.session()
            .map(|session| self.inner.timers.borrow().live_count(session.generation))
            .unwrap_or(0)
    }

    /// When the earliest armed timer of the current generation is due.
    pub fn next_timer_deadline(&self) -> Option<Instant> {
        let session = self.session()?;
        session.live_sandbox()?;
        self.inner.timers.borrow().next_deadline(session.generation)
    }

    /// Run queued work until idle. Re-entrant calls return immediately and
    /// leave the work to the pump already running. Returns the number of
    /// dispatch steps taken.
    ///
    /// At most `maxDispatchPerPump` steps run per call. Work left over is not
    /// rescheduled; it runs on the next `pump`, which every send, document
    /// event, `tick` and `run_for` performs.
    pub fn pump(&self) -> usize {
        if self.inner.pumping.replace(true) {
            return 0;
        }
        let _guard = FlagGuard(&self.inner.pumping);

        let budget = self.inner.config.max_dispatch_per_pump;
        let mut steps = 0;
        let mut timers_fired = false;
        loop {
            if steps >= budget {
                tracing::warn!(
                    target: "worker",
                    budget,
                    "dispatch budget exhausted; remaining work deferred to the next pump"
                );
                break;
            }
            if self.step_outbox() || self.step_pending() || self.step_evaluate() || self.step_inbox()
            {
                steps += 1;
                continue;
            }
            if !timers_fired {
                timers_fired = true;
                let fired = self.fire_due_timers();
                if fired > 0 {
                    steps += fired;
                    continue;
                }
            }
            break;
        }

        if steps > 0 {
            tracing::trace!(target: "worker", steps, "pump finished");
        }
        steps
    }

    /// Wait for the next timer deadline and fire what is due. Returns
    /// `false` when no timer is armed.
    pub async fn tick(&self) -> bool {
        self.pump();
        let Some(deadline) = self.next_timer_deadline() else {
            return false;
        };
        tokio::time::sleep_until(deadline).await;
        self.pump();
        true
    }

    /// Drive timers for `duration` of (tokio) time.
    pub async fn run_for(&self, duration: Duration) {
        let end = Instant::now() + duration;
        loop {
            self.pump();
            match self.next_timer_deadline() {
                Some(deadline) if deadline <= end => tokio::time::sleep_until(deadline).await,
                _ => {
                    tokio::time::sleep_until(end).await;
                    self.pump();
                    return;
                }
            }
        }
    }

    fn session(&self) -> Option<Session> {
        self.inner.session.borrow().clone()
    }

    fn ensure_sendable(&self) -> Result<(), ChannelUnavailableError> {
        match self.session() {
            Some(session) => session.lifecycle.borrow().ensure_sendable(),
            None => Err(ChannelUnavailableError::gone()),
        }
    }

    fn enqueue(&self, pending: Pending) {
        self.inner.pending.borrow_mut().push_back(pending);
        self.pump();
    }

    fn enter_sandbox(&self, sandbox: &Sandbox, f: impl FnOnce(&Sandbox)) {
        let outer = self.inner.in_sandbox.replace(true);
        f(sandbox);
        self.inner.in_sandbox.set(outer);
    }

    fn step_outbox(&self) -> bool {
        let Some(session) = self.session() else {
            return false;
        };
        let next = session.outbox.borrow_mut().pop_front();
        match next {
            Some(outgoing) => {
                self.deliver_outgoing(outgoing);
                true
            }
            None => false,
        }
    }

    fn step_pending(&self) -> bool {
        let next = self.inner.pending.borrow_mut().pop_front();
        match next {
            Some(Pending::Destroy) => {
                self.teardown();
                true
            }
            Some(Pending::Document { generation, event }) => {
                self.apply_document_event(generation, event);
                true
            }
            None => false,
        }
    }

    fn step_evaluate(&self) -> bool {
        let Some(session) = self.session() else {
            return false;
        };
        let Some(sandbox) = session.sandbox.as_ref() else {
            return false;
        };
        if session.evaluated || session.state() != LifecycleState::Attached {
            return false;
        }
        let timing = self.inner.config.script_load_timing;
        if !timing.is_satisfied_by(session.document.ready_state()) {
            return false;
        }

        if let Some(current) = self.inner.session.borrow_mut().as_mut() {
            current.evaluated = true;
        }
        tracing::debug!(
            target: "worker",
            generation = %sandbox.generation(),
            script_url = %self.inner.config.script_url,
            "evaluating content script"
        );
        self.enter_sandbox(sandbox, |sandbox| {
            sandbox.evaluate(&self.inner.script, &self.inner.config.script_url);
        });
        true
    }

    fn step_inbox(&self) -> bool {
        let Some(sandbox) = self.session().and_then(|session| session.live_sandbox()) else {
            return false;
        };
        let next = self.inner.inbox.borrow_mut().pop_front();
        match next {
            Some(Inbound::Message(message)) => {
                self.enter_sandbox(&sandbox, |sandbox| sandbox.deliver_message(&message));
                true
            }
            Some(Inbound::Port { event, args }) => {
                self.enter_sandbox(&sandbox, |sandbox| sandbox.deliver_port(&event, &args));
                true
            }
            None => false,
        }
    }

    /// Fire every timer that is due right now, at most once each.
    fn fire_due_timers(&self) -> usize {
        let Some(session) = self.session() else {
            return 0;
        };
        let Some(sandbox) = session.live_sandbox() else {
            return 0;
        };
        let generation = session.generation;
        let now = Instant::now();
        let due = self.inner.timers.borrow().due(generation, now);

        let mut fired = 0;
        for id in due {
            // A lifecycle change queued by a callback takes effect first.
            if !self.inner.pending.borrow().is_empty() {
                break;
            }
            let kind = self.inner.timers.borrow_mut().begin_fire(generation, id, now);
            let Some(kind) = kind else {
                continue;
            };
            self.enter_sandbox(&sandbox, |sandbox| sandbox.fire_timer(id, kind));
            fired += 1;
        }
        fired
    }

    fn deliver_outgoing(&self, outgoing: Outgoing) {
        match outgoing {
            Outgoing::Message(message) => {
                let listeners = self.inner.messages.dispatch("message", &message);
                tracing::trace!(target: "worker", listeners, "message delivered to controller");
            }
            Outgoing::Port { event, args } => {
                let listeners = self.inner.port.dispatch(&event, &args);
                tracing::trace!(target: "worker", %event, listeners, "port event delivered to controller");
            }
            Outgoing::Fault(fault) => {
                if self.inner.errors.emit(ERROR_EVENT, &fault) == 0 {
                    tracing::error!(
                        target: "worker",
                        phase = fault.phase.as_str(),
                        stack = fault.stack.as_deref().unwrap_or(""),
                        "unhandled sandbox error: {}",
                        fault.message
                    );
                }
            }
        }
    }

    fn apply_document_event(&self, generation: Generation, event: DocumentEvent) {
        let Some(session) = self.session() else {
            return;
        };
        if session.generation != generation || session.sandbox.is_none() {
            return;
        }
        match event {
            DocumentEvent::PageHide { persisted: true } => self.freeze(&session),
            DocumentEvent::PageShow { .. } => self.resume(&session),
            DocumentEvent::Unload => self.teardown(),
            // An unload notification follows.
            DocumentEvent::PageHide { persisted: false } => {}
            DocumentEvent::LocationChanged(url) => {
                tracing::debug!(target: "worker", %generation, %url, "document location changed");
            }
            DocumentEvent::ReadyStateChanged(state) => {
                tracing::debug!(target: "worker", %generation, state = state.as_str(), "document ready state changed");
            }
        }
    }

    fn freeze(&self, session: &Session) {
        if session.lifecycle.borrow_mut().hide() != Transition::Frozen {
            return;
        }
        let suspended = self
            .inner
            .timers
            .borrow_mut()
            .suspend(session.generation, Instant::now());
        tracing::debug!(target: "worker", generation = %session.generation, suspended, "sandbox frozen");
        self.notify_both(session, "pagehide");
    }

    fn resume(&self, session: &Session) {
        if session.lifecycle.borrow_mut().show() != Transition::Resumed {
            return;
        }
        let resumed = self
            .inner
            .timers
            .borrow_mut()
            .resume(session.generation, Instant::now());
        tracing::debug!(target: "worker", generation = %session.generation, resumed, "sandbox resumed");
        self.notify_both(session, "pageshow");
    }

    fn notify_both(&self, session: &Session, event: &str) {
        if let Some(sandbox) = &session.sandbox {
            self.enter_sandbox(sandbox, |sandbox| sandbox.notify(event));
        }
        self.inner.messages.dispatch(event, &Message::undefined());
    }

    /// Retire the current generation. Timers go first so nothing can fire
    /// once teardown has started, and the sandbox is detached from the
    /// session before any callback runs.
    fn teardown(&self) {
        if self.inner.tearing_down.get() {
            return;
        }
        let Some(session) = self.session() else {
            return;
        };
        let sandbox = match self.inner.session.borrow_mut().as_mut() {
            Some(current) => current.sandbox.take(),
            None => None,
        };
        let Some(sandbox) = sandbox else {
            return;
        };
        let generation = session.generation;
        let _guard = FlagGuard::raise(&self.inner.tearing_down);

        let retired = self.inner.timers.borrow_mut().retire(generation);
        session.lifecycle.borrow_mut().unload();
        session.document.unsubscribe(session.observer);

        self.enter_sandbox(&sandbox, |sandbox| sandbox.notify("detach"));
        drop(sandbox);
        loop {
            let next = session.outbox.borrow_mut().pop_front();
            let Some(outgoing) = next else {
                break;
            };
            self.deliver_outgoing(outgoing);
        }

        self.inner.messages.dispatch("detach", &Message::undefined());
        self.inner.messages.clear();
        self.inner.port.clear();
        self.inner.errors.clear();
        let dropped = self.inner.inbox.borrow_mut().drain(..).count();
        if dropped > 0 {
            tracing::warn!(
                target: "worker",
                %generation,
                dropped,
                "discarding deliveries that never reached the sandbox"
            );
        }

        tracing::info!(target: "worker", %generation, retired_timers = retired, "worker detached");
    }
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("generation", &self.generation())
            .field("state", &self.state())
            .field("url", &self.url())
            .finish()
    }
}

/// A worker handed over as a message value flattens to `{ url, port: {} }`.
impl ForeignObject for Worker {
    fn class_name(&self) -> &str {
        "Worker"
    }

    fn own_properties(&self) -> Vec<ForeignProperty> {
        let url = self.url().map(BoundaryValue::from).unwrap_or_default();
        vec![
            ForeignProperty::enumerable("url", url),
            ForeignProperty::enumerable("port", BoundaryValue::foreign(PortHandle)),
        ]
    }
}

/// Method-only stand-in for the port when a worker is flattened.
struct PortHandle;

impl ForeignObject for PortHandle {
    fn class_name(&self) -> &str {
        "Port"
    }

    fn own_properties(&self) -> Vec<ForeignProperty> {
        ["on", "removeListener", "emit"]
            .into_iter()
            .map(|name| {
                ForeignProperty::enumerable(name, BoundaryValue::function(|_| BoundaryValue::Undefined))
            })
            .collect()
    }
}

/// The worker's named-event namespace.
pub struct Port<'a> {
    worker: &'a Worker,
}

impl Port<'_> {
    pub fn on(&self, event: &str, callback: impl Fn(&[JsonValue]) + 'static) -> ListenerId {
        self.worker.inner.port.on(event, callback)
    }

    pub fn remove_listener(&self, id: ListenerId) {
        self.worker.inner.port.remove_listener(id);
    }

    /// Emit `event` with positional arguments to the sandbox's
    /// `self.port.on(event)` listeners.
    pub fn emit(&self, event: &str, args: &[BoundaryValue]) -> Result<(), WorkerError> {
        self.worker.ensure_sendable()?;
        let args = serialize_port_args(args)?;
        self.worker.inner.inbox.borrow_mut().push_back(Inbound::Port {
            event: event.to_string(),
            args,
        });
        self.worker.pump();
        Ok(())
    }
}

/// Holds a flag up until dropped.
struct FlagGuard<'a>(&'a Cell<bool>);

impl<'a> FlagGuard<'a> {
    fn raise(flag: &'a Cell<bool>) -> Self {
        flag.set(true);
        Self(flag)
    }
}

impl Drop for FlagGuard<'_> {
    fn drop(&mut self) {
        self.0.set(false);
    }
}
