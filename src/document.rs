//! The foreign document a worker attaches to.
//!
//! Creating real windows and navigating them is the embedder's job; this
//! handle is the part the sandbox needs: identity, location, title, frame
//! ancestry, page-owned globals and lifecycle notifications.

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

use url::Url;
use uuid::Uuid;

use crate::js::serializer::{BoundaryValue, ForeignObject, ForeignProperty};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ReadyState {
    Loading,
    Interactive,
    Complete,
}

impl ReadyState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Loading => "loading",
            Self::Interactive => "interactive",
            Self::Complete => "complete",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DocumentEvent {
    ReadyStateChanged(ReadyState),
    LocationChanged(Url),
    PageHide { persisted: bool },
    PageShow { persisted: bool },
    Unload,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

type Observer = Rc<dyn Fn(&Document, &DocumentEvent)>;

struct DocumentInner {
    id: Uuid,
    url: RefCell<Url>,
    title: RefCell<String>,
    ready_state: Cell<ReadyState>,
    hidden: Cell<bool>,
    unloaded: Cell<bool>,
    privileged: bool,
    parent: Option<Document>,
    frame_element: Option<Rc<Element>>,
    globals: RefCell<BTreeMap<String, BoundaryValue>>,
    observers: RefCell<Vec<(ObserverId, Observer)>>,
    next_observer: Cell<u64>,
}

/// Cheap-clone handle to a foreign document.
#[derive(Clone)]
pub struct Document {
    inner: Rc<DocumentInner>,
}

impl Document {
    /// A top-level document that is still loading.
    pub fn new(url: &str) -> Result<Self, url::ParseError> {
        Ok(Self::build(Url::parse(url)?, None, None, false))
    }

    /// A loaded top-level document of the embedder itself (browser chrome).
    /// Scripts attached to it see its globals directly on `window`.
    pub fn privileged(url: &str) -> Result<Self, url::ParseError> {
        let document = Self::build(Url::parse(url)?, None, None, true);
        document.inner.ready_state.set(ReadyState::Complete);
        Ok(document)
    }

    /// A top-level document that has finished loading.
    pub fn loaded(url: &str) -> Result<Self, url::ParseError> {
        let document = Self::new(url)?;
        document.inner.ready_state.set(ReadyState::Complete);
        Ok(document)
    }

    /// A loaded document inside an `<iframe>` of `self`.
    pub fn create_frame(&self, url: &str) -> Result<Self, url::ParseError> {
        let url = Url::parse(url)?;
        let element = Rc::new(Element::new("iframe").with_attribute("src", url.as_str()));
        let frame = Self::build(url, Some(self.clone()), Some(element), false);
        frame.inner.ready_state.set(ReadyState::Complete);
        Ok(frame)
    }

    fn build(
        url: Url,
        parent: Option<Document>,
        frame_element: Option<Rc<Element>>,
        privileged: bool,
    ) -> Self {
        Self {
            inner: Rc::new(DocumentInner {
                id: Uuid::new_v4(),
                url: RefCell::new(url),
                title: RefCell::new(String::new()),
                ready_state: Cell::new(ReadyState::Loading),
                hidden: Cell::new(false),
                unloaded: Cell::new(false),
                privileged,
                parent,
                frame_element,
                globals: RefCell::new(BTreeMap::new()),
                observers: RefCell::new(Vec::new()),
                next_observer: Cell::new(1),
            }),
        }
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn url(&self) -> Url {
        self.inner.url.borrow().clone()
    }

    /// In-place navigation (fragment change, history push). The document
    /// instance stays the same.
    pub fn set_location(&self, url: &str) -> Result<(), url::ParseError> {
        let url = Url::parse(url)?;
        *self.inner.url.borrow_mut() = url.clone();
        self.notify(DocumentEvent::LocationChanged(url));
        Ok(())
    }

    pub fn title(&self) -> String {
        self.inner.title.borrow().clone()
    }

    pub fn set_title(&self, title: impl Into<String>) {
        *self.inner.title.borrow_mut() = title.into();
    }

    pub fn ready_state(&self) -> ReadyState {
        self.inner.ready_state.get()
    }

    /// Advance the ready state. Going backwards is ignored.
    pub fn set_ready_state(&self, state: ReadyState) {
        if state <= self.inner.ready_state.get() || self.is_unloaded() {
            return;
        }
        self.inner.ready_state.set(state);
        self.notify(DocumentEvent::ReadyStateChanged(state));
    }

    pub fn is_hidden(&self) -> bool {
        self.inner.hidden.get()
    }

    pub fn is_unloaded(&self) -> bool {
        self.inner.unloaded.get()
    }

    pub fn is_privileged(&self) -> bool {
        self.inner.privileged
    }

    /// The document moved into the back/forward cache.
    pub fn hide(&self) {
        if self.is_unloaded() || self.inner.hidden.replace(true) {
            return;
        }
        self.notify(DocumentEvent::PageHide { persisted: true });
    }

    /// The same document instance came back through history navigation.
    pub fn show(&self) {
        if self.is_unloaded() || !self.inner.hidden.replace(false) {
            return;
        }
        self.notify(DocumentEvent::PageShow { persisted: true });
    }

    /// The document is gone for good. Calling it twice is harmless.
    pub fn unload(&self) {
        if self.inner.unloaded.replace(true) {
            return;
        }
        self.inner.hidden.set(true);
        self.notify(DocumentEvent::PageHide { persisted: false });
        self.notify(DocumentEvent::Unload);
        self.inner.observers.borrow_mut().clear();
    }

    pub fn parent(&self) -> Option<Document> {
        self.inner.parent.clone()
    }

    pub fn top(&self) -> Document {
        let mut current = self.clone();
        while let Some(parent) = current.parent() {
            current = parent;
        }
        current
    }

    /// `[self, parent, …, top]`.
    pub fn ancestry(&self) -> Vec<Document> {
        let mut chain = vec![self.clone()];
        while let Some(parent) = chain.last().and_then(Document::parent) {
            chain.push(parent);
        }
        chain
    }

    pub fn frame_element(&self) -> Option<BoundaryValue> {
        self.inner
            .frame_element
            .as_ref()
            .map(|element| BoundaryValue::Foreign(element.clone() as Rc<dyn ForeignObject>))
    }

    /// Define or replace a page-owned global.
    pub fn define_global(&self, name: impl Into<String>, value: BoundaryValue) {
        self.inner.globals.borrow_mut().insert(name.into(), value);
    }

    pub fn global(&self, name: &str) -> BoundaryValue {
        self.inner
            .globals
            .borrow()
            .get(name)
            .cloned()
            .unwrap_or_default()
    }

    pub fn global_names(&self) -> Vec<String> {
        self.inner.globals.borrow().keys().cloned().collect()
    }

    pub fn remove_global(&self, name: &str) -> bool {
        self.inner.globals.borrow_mut().remove(name).is_some()
    }

    /// A DOM-like node owned by this document.
    pub fn create_element(&self, tag: &str) -> BoundaryValue {
        BoundaryValue::foreign(Element::new(tag))
    }

    /// Observe lifecycle notifications. Observers run synchronously in
    /// registration order.
    pub fn subscribe(&self, observer: impl Fn(&Document, &DocumentEvent) + 'static) -> ObserverId {
        let id = ObserverId(self.inner.next_observer.get());
        self.inner.next_observer.set(id.0 + 1);
        self.inner
            .observers
            .borrow_mut()
            .push((id, Rc::new(observer)));
        id
    }

    pub fn unsubscribe(&self, id: ObserverId) {
        self.inner
            .observers
            .borrow_mut()
            .retain(|(observer, _)| *observer != id);
    }

    fn notify(&self, event: DocumentEvent) {
        tracing::debug!(target: "worker", document = %self.inner.id, ?event, "document event");
        let observers: Vec<Observer> = self
            .inner
            .observers
            .borrow()
            .iter()
            .map(|(_, observer)| Rc::clone(observer))
            .collect();
        for observer in observers {
            observer(self, &event);
        }
    }
}

impl PartialEq for Document {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Document {}

impl fmt::Debug for Document {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Document")
            .field("id", &self.inner.id)
            .field("url", &self.inner.url.borrow().as_str())
            .field("ready_state", &self.inner.ready_state.get())
            .field("hidden", &self.inner.hidden.get())
            .field("unloaded", &self.inner.unloaded.get())
            .field("privileged", &self.inner.privileged)
            .finish()
    }
}

/// DOM-like node. Everything on it is non-enumerable, so it crosses the
/// boundary as an empty object.
#[derive(Debug, Clone)]
pub struct Element {
    tag: String,
    attributes: BTreeMap<String, String>,
}

impl Element {
    pub fn new(tag: &str) -> Self {
        Self {
            tag: tag.to_ascii_lowercase(),
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_attribute(mut self, name: &str, value: &str) -> Self {
        self.attributes.insert(name.to_string(), value.to_string());
        self
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }
}

impl ForeignObject for Element {
    fn class_name(&self) -> &str {
        "Element"
    }

    fn own_properties(&self) -> Vec<ForeignProperty> {
        let attributes = BoundaryValue::object(
            self.attributes
                .iter()
                .map(|(name, value)| (name.clone(), BoundaryValue::from(value.as_str()))),
        );
        let element = self.clone();
        vec![
            ForeignProperty::hidden("tagName", self.tag().to_ascii_uppercase()),
            ForeignProperty::hidden("attributes", attributes),
            ForeignProperty::hidden(
                "getAttribute",
                BoundaryValue::function(move |args| match args.first() {
                    Some(BoundaryValue::String(name)) => element
                        .attribute(name)
                        .map(BoundaryValue::from)
                        .unwrap_or(BoundaryValue::Null),
                    _ => BoundaryValue::Null,
                }),
            ),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::js::serializer::{serialize, Boundary};
    use serde_json::json;

    #[test]
    fn frames_know_their_ancestry() {
        let top = Document::loaded("data:text/html,top").unwrap();
        let middle = top.create_frame("data:text/html,middle").unwrap();
        let leaf = middle.create_frame("data:text/html,leaf").unwrap();

        let chain = leaf.ancestry();
        assert_eq!(chain.len(), 3);
        assert_eq!(chain[1], middle);
        assert_eq!(leaf.top(), top);
        assert!(top.frame_element().is_none());
        assert!(leaf.frame_element().is_some());
    }

    #[test]
    fn elements_flatten_to_empty_objects() {
        let document = Document::loaded("data:text/html,foo").unwrap();
        let div = document.create_element("div");
        assert_eq!(serialize(&div, Boundary::Message).unwrap(), Some(json!({})));
    }

    #[test]
    fn frame_elements_answer_attribute_lookups() {
        let top = Document::loaded("data:text/html,top").unwrap();
        let frame = top.create_frame("data:text/html,frame").unwrap();
        let Some(BoundaryValue::Foreign(element)) = frame.frame_element() else {
            panic!("frame has no element");
        };

        let properties = element.own_properties();
        let lookup = |key: &str| {
            properties
                .iter()
                .find(|property| property.key == key)
                .map(|property| property.value.clone())
                .unwrap()
        };
        assert!(matches!(lookup("tagName"), BoundaryValue::String(tag) if tag == "IFRAME"));
        let BoundaryValue::Function(get_attribute) = lookup("getAttribute") else {
            panic!("getAttribute is not callable");
        };
        assert!(matches!(
            get_attribute.call(&[BoundaryValue::from("src")]),
            BoundaryValue::String(src) if src == "data:text/html,frame"
        ));
        assert!(matches!(
            get_attribute.call(&[BoundaryValue::from("id")]),
            BoundaryValue::Null
        ));
        assert!(properties.iter().all(|property| !property.enumerable));
    }

    #[test]
    fn only_privileged_documents_say_so() {
        let chrome = Document::privileged("chrome://browser/content/browser.xhtml").unwrap();
        assert!(chrome.is_privileged());
        assert_eq!(chrome.ready_state(), ReadyState::Complete);
        let frame = chrome.create_frame("data:text/html,frame").unwrap();
        assert!(!frame.is_privileged());
        assert!(!Document::loaded("data:text/html,foo").unwrap().is_privileged());
    }

    #[test]
    fn lifecycle_notifications_reach_observers_once() {
        let document = Document::loaded("data:text/html,foo").unwrap();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&seen);
        document.subscribe(move |_, event| sink.borrow_mut().push(event.clone()));

        document.hide();
        document.hide();
        document.show();
        document.unload();
        document.unload();
        document.show();

        assert_eq!(
            *seen.borrow(),
            vec![
                DocumentEvent::PageHide { persisted: true },
                DocumentEvent::PageShow { persisted: true },
                DocumentEvent::PageHide { persisted: false },
                DocumentEvent::Unload,
            ]
        );
    }

    #[test]
    fn ready_state_only_moves_forward() {
        let document = Document::new("data:text/html,foo").unwrap();
        document.set_ready_state(ReadyState::Complete);
        document.set_ready_state(ReadyState::Interactive);
        assert_eq!(document.ready_state(), ReadyState::Complete);
    }

    #[test]
    fn in_place_navigation_keeps_identity() {
        let document = Document::loaded("data:text/html,foo").unwrap();
        let id = document.id();
        document.set_location("data:text/html,foo#bar").unwrap();
        assert_eq!(document.id(), id);
        assert_eq!(document.url().as_str(), "data:text/html,foo#bar");
    }
}
