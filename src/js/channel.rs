//! Controller-side endpoints of the worker's two message namespaces.
//!
//! The default namespace carries `postMessage` payloads and lifecycle
//! notifications; the port namespace carries arbitrarily named events with
//! positional arguments. They are separate types with separate listener
//! sets, so nothing emitted on one can reach the other. The sandbox keeps
//! mirror tables with the same ordering and deferral rules in its bootstrap.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

use serde_json::Value as JsonValue;

use crate::error::SerializationError;

/// A JSON-safe payload of the default namespace. `undefined` is kept
/// distinct from `null`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Message(Option<JsonValue>);

impl Message {
    pub fn undefined() -> Self {
        Self(None)
    }

    pub fn json(value: JsonValue) -> Self {
        Self(Some(value))
    }

    pub fn is_undefined(&self) -> bool {
        self.0.is_none()
    }

    pub fn value(&self) -> Option<&JsonValue> {
        self.0.as_ref()
    }

    pub fn as_str(&self) -> Option<&str> {
        self.0.as_ref().and_then(JsonValue::as_str)
    }

    pub fn into_value(self) -> Option<JsonValue> {
        self.0
    }

    /// Wire form handed to the sandbox: JSON text, or nothing for `undefined`.
    pub(crate) fn to_wire(&self) -> Option<String> {
        self.0.as_ref().map(JsonValue::to_string)
    }

    pub(crate) fn from_wire(text: Option<&str>) -> Result<Self, SerializationError> {
        match text {
            None => Ok(Self::undefined()),
            Some(text) => serde_json::from_str(text)
                .map(Self::json)
                .map_err(|err| SerializationError::InvalidJson(err.to_string())),
        }
    }
}

impl From<JsonValue> for Message {
    fn from(value: JsonValue) -> Self {
        Self::json(value)
    }
}

impl PartialEq<JsonValue> for Message {
    fn eq(&self, other: &JsonValue) -> bool {
        self.0.as_ref() == Some(other)
    }
}

/// Token returned by `on`, used to remove the listener again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

type Callback<A> = Rc<dyn Fn(&A)>;

struct Entry<A: ?Sized> {
    id: ListenerId,
    event: String,
    callback: Callback<A>,
}

enum PendingOp<A: ?Sized> {
    Add(Entry<A>),
    Remove(ListenerId),
    Clear,
}

/// Ordered listener table. Registrations and removals made while a
/// dispatch is running are applied once the outermost dispatch finishes.
pub struct ListenerSet<A: ?Sized> {
    entries: RefCell<Vec<Entry<A>>>,
    pending: RefCell<Vec<PendingOp<A>>>,
    dispatch_depth: Cell<usize>,
    next_id: Cell<u64>,
}

impl<A: ?Sized> Default for ListenerSet<A> {
    fn default() -> Self {
        Self {
            entries: RefCell::new(Vec::new()),
            pending: RefCell::new(Vec::new()),
            dispatch_depth: Cell::new(0),
            next_id: Cell::new(1),
        }
    }
}

impl<A: ?Sized> ListenerSet<A> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(&self, event: &str, callback: Callback<A>) -> ListenerId {
        let id = ListenerId(self.next_id.get());
        self.next_id.set(id.0 + 1);
        let entry = Entry {
            id,
            event: event.to_string(),
            callback,
        };
        self.apply_or_defer(PendingOp::Add(entry));
        id
    }

    /// Removing an unknown or already-removed listener is a no-op.
    pub fn remove(&self, id: ListenerId) {
        self.apply_or_defer(PendingOp::Remove(id));
    }

    pub fn clear(&self) {
        self.apply_or_defer(PendingOp::Clear);
    }

    /// Invoke every listener of `event` in registration order; returns how
    /// many ran.
    pub fn emit(&self, event: &str, args: &A) -> usize {
        let snapshot: Vec<Callback<A>> = self
            .entries
            .borrow()
            .iter()
            .filter(|entry| entry.event == event)
            .map(|entry| Rc::clone(&entry.callback))
            .collect();
        if snapshot.is_empty() {
            return 0;
        }

        let _guard = DispatchGuard::enter(self);
        for callback in &snapshot {
            callback(args);
        }
        snapshot.len()
    }

    fn apply_or_defer(&self, op: PendingOp<A>) {
        if self.dispatch_depth.get() > 0 {
            self.pending.borrow_mut().push(op);
        } else {
            self.apply(op);
        }
    }

    fn apply(&self, op: PendingOp<A>) {
        let mut entries = self.entries.borrow_mut();
        match op {
            PendingOp::Add(entry) => entries.push(entry),
            PendingOp::Remove(id) => entries.retain(|entry| entry.id != id),
            PendingOp::Clear => entries.clear(),
        }
    }

    fn flush_pending(&self) {
        let ops: Vec<PendingOp<A>> = self.pending.borrow_mut().drain(..).collect();
        for op in ops {
            self.apply(op);
        }
    }
}

struct DispatchGuard<'a, A: ?Sized> {
    set: &'a ListenerSet<A>,
}

impl<'a, A: ?Sized> DispatchGuard<'a, A> {
    fn enter(set: &'a ListenerSet<A>) -> Self {
        set.dispatch_depth.set(set.dispatch_depth.get() + 1);
        Self { set }
    }
}

impl<A: ?Sized> Drop for DispatchGuard<'_, A> {
    fn drop(&mut self) {
        let depth = self.set.dispatch_depth.get() - 1;
        self.set.dispatch_depth.set(depth);
        if depth == 0 {
            self.set.flush_pending();
        }
    }
}

impl<A: ?Sized> fmt::Debug for ListenerSet<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerSet")
            .field("listeners", &self.entries.borrow().len())
            .field("pending", &self.pending.borrow().len())
            .finish()
    }
}

/// The default namespace (`worker.on` / `worker.postMessage`).
#[derive(Debug, Default)]
pub struct MessageChannel {
    listeners: ListenerSet<Message>,
}

impl MessageChannel {
    pub fn on(&self, event: &str, callback: impl Fn(&Message) + 'static) -> ListenerId {
        self.listeners.on(event, Rc::new(callback))
    }

    pub(crate) fn on_shared(&self, event: &str, callback: Rc<dyn Fn(&Message)>) -> ListenerId {
        self.listeners.on(event, callback)
    }

    pub fn remove_listener(&self, id: ListenerId) {
        self.listeners.remove(id);
    }

    pub fn dispatch(&self, event: &str, message: &Message) -> usize {
        self.listeners.emit(event, message)
    }

    pub fn clear(&self) {
        self.listeners.clear();
    }
}

/// The named-event namespace (`worker.port`).
#[derive(Debug, Default)]
pub struct PortChannel {
    listeners: ListenerSet<[JsonValue]>,
}

impl PortChannel {
    pub fn on(&self, event: &str, callback: impl Fn(&[JsonValue]) + 'static) -> ListenerId {
        self.listeners.on(event, Rc::new(callback))
    }

    pub fn remove_listener(&self, id: ListenerId) {
        self.listeners.remove(id);
    }

    pub fn dispatch(&self, event: &str, args: &[JsonValue]) -> usize {
        self.listeners.emit(event, args)
    }

    pub fn clear(&self) {
        self.listeners.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn listeners_fire_in_registration_order() {
        let channel = MessageChannel::default();
        let calls = Rc::new(RefCell::new(Vec::new()));
        for name in ["first", "second"] {
            let calls = Rc::clone(&calls);
            channel.on("message", move |_| calls.borrow_mut().push(name));
        }

        for _ in 0..3 {
            assert_eq!(channel.dispatch("message", &Message::json(json!(1))), 2);
        }
        assert_eq!(
            *calls.borrow(),
            vec!["first", "second", "first", "second", "first", "second"]
        );
    }

    #[test]
    fn removal_is_idempotent() {
        let channel = PortChannel::default();
        let id = channel.on("ping", |_| {});
        channel.remove_listener(id);
        channel.remove_listener(id);
        assert_eq!(channel.dispatch("ping", &[]), 0);
    }

    #[test]
    fn mutations_during_dispatch_apply_next_cycle() {
        let set: Rc<ListenerSet<Message>> = Rc::new(ListenerSet::new());
        let calls = Rc::new(RefCell::new(Vec::new()));
        let own_id = Rc::new(Cell::new(None));

        let registering = {
            let set = Rc::clone(&set);
            let calls = Rc::clone(&calls);
            let own_id = Rc::clone(&own_id);
            Rc::new(move |_: &Message| {
                calls.borrow_mut().push("outer");
                let inner_calls = Rc::clone(&calls);
                set.on(
                    "message",
                    Rc::new(move |_: &Message| inner_calls.borrow_mut().push("inner")),
                );
                if let Some(id) = own_id.get() {
                    set.remove(id);
                }
            })
        };
        own_id.set(Some(set.on("message", registering)));

        assert_eq!(set.emit("message", &Message::undefined()), 1);
        assert_eq!(*calls.borrow(), vec!["outer"]);

        assert_eq!(set.emit("message", &Message::undefined()), 1);
        assert_eq!(*calls.borrow(), vec!["outer", "inner"]);
    }

    #[test]
    fn events_are_matched_by_name() {
        let channel = MessageChannel::default();
        let hits = Rc::new(Cell::new(0));
        let counter = Rc::clone(&hits);
        channel.on("pagehide", move |_| counter.set(counter.get() + 1));
        channel.dispatch("message", &Message::undefined());
        assert_eq!(hits.get(), 0);
        channel.dispatch("pagehide", &Message::undefined());
        assert_eq!(hits.get(), 1);
    }

    #[test]
    fn wire_format_keeps_undefined_apart_from_null() {
        assert_eq!(Message::undefined().to_wire(), None);
        assert_eq!(Message::json(JsonValue::Null).to_wire().as_deref(), Some("null"));
        assert_eq!(Message::from_wire(None).unwrap(), Message::undefined());
        assert_eq!(
            Message::from_wire(Some("{\"a\":[1]}")).unwrap(),
            json!({"a": [1]})
        );
        assert!(Message::from_wire(Some("{")).is_err());
    }
}
