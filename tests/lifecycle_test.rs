use std::cell::RefCell;
use std::rc::Rc;

use content_worker::{
    BoundaryValue, ConsoleLevel, ConsoleSink, Document, Generation, LifecycleState, ReadyState,
    ScriptLoadTiming, UnavailableReason, Worker, WorkerError, WorkerOptions,
};
use serde_json::{json, Value as JsonValue};

type Inbox = Rc<RefCell<Vec<JsonValue>>>;

#[derive(Default)]
struct RecordingConsole {
    lines: RefCell<Vec<String>>,
}

impl ConsoleSink for RecordingConsole {
    fn write(&self, _level: ConsoleLevel, message: &str) {
        self.lines.borrow_mut().push(message.to_string());
    }
}

fn build(document: Document, script: &str) -> (WorkerOptions, Inbox) {
    let received: Inbox = Rc::default();
    let sink = Rc::clone(&received);
    let options = WorkerOptions::new(document, script).on_message(move |message| {
        sink.borrow_mut()
            .push(message.value().cloned().unwrap_or(JsonValue::Null))
    });
    (options, received)
}

fn unavailable(err: WorkerError) -> UnavailableReason {
    match err {
        WorkerError::ChannelUnavailable(err) => err.reason,
        other => panic!("expected ChannelUnavailableError, got {other}"),
    }
}

const ECHO: &str = r#"self.on("message", function (m) { self.postMessage("echo:" + m); });"#;

#[test]
fn frozen_sandbox_rejects_sends_without_invoking_listeners() {
    let document = Document::loaded("data:text/html,foo").expect("document");
    let (options, received) = build(document.clone(), ECHO);
    let worker = Worker::new(options).expect("worker");

    document.hide();
    assert_eq!(worker.state(), LifecycleState::Frozen);

    let err = worker.post_message(&BoundaryValue::from("hi")).unwrap_err();
    assert_eq!(unavailable(err), UnavailableReason::Hidden);
    let err = worker
        .port()
        .emit("ping", &[BoundaryValue::from(1)])
        .unwrap_err();
    assert_eq!(unavailable(err), UnavailableReason::Hidden);
    assert!(received.borrow().is_empty());
}

#[test]
fn listeners_survive_a_freeze_and_resume() {
    let document = Document::loaded("data:text/html,foo").expect("document");
    let (options, received) = build(document.clone(), ECHO);
    let worker = Worker::new(options).expect("worker");

    let events = Rc::new(RefCell::new(Vec::new()));
    for name in ["pagehide", "pageshow"] {
        let events = Rc::clone(&events);
        worker.on(name, move |message| {
            assert!(message.is_undefined());
            events.borrow_mut().push(name);
        });
    }

    document.hide();
    document.show();
    assert_eq!(worker.state(), LifecycleState::Attached);

    worker.post_message(&BoundaryValue::from("hi")).expect("post");
    assert_eq!(*received.borrow(), vec![json!("echo:hi")]);
    assert_eq!(*events.borrow(), vec!["pagehide", "pageshow"]);
}

#[test]
fn sandbox_sees_page_history_events() {
    let document = Document::loaded("data:text/html,foo").expect("document");
    let (options, received) = build(
        document.clone(),
        r#"
        let hiddenError = null;
        self.on("pagehide", function () {
            try {
                self.postMessage("while hidden");
            } catch (e) {
                hiddenError = e.message;
            }
            setTimeout(function () { self.postMessage("timeout after show"); }, 0);
        });
        self.on("pageshow", function () {
            self.postMessage("shown: " + hiddenError);
        });
        "#,
    );
    let worker = Worker::new(options).expect("worker");

    document.hide();
    assert!(received.borrow().is_empty());
    assert_eq!(worker.live_timers(), 1);

    document.show();
    let received = received.borrow();
    assert_eq!(received.len(), 2);
    let shown = received[0].as_str().expect("string");
    assert!(
        shown.starts_with("shown: page is hidden: The page is currently hidden"),
        "{shown}"
    );
    assert_eq!(received[1], json!("timeout after show"));
}

#[test]
fn unload_destroys_the_worker() {
    let document = Document::loaded("data:text/html,foo").expect("document");
    let console = Rc::new(RecordingConsole::default());
    let (options, _) = build(
        document.clone(),
        r#"
        self.on("detach", function () {
            console.log("detached");
            try {
                self.postMessage("too late");
            } catch (e) {
                console.log(e.message.split(":")[0]);
            }
        });
        "#,
    );
    let worker = Worker::new(options.console(console.clone())).expect("worker");

    let detached = Rc::new(RefCell::new(0));
    let counter = Rc::clone(&detached);
    worker.on("detach", move |_| *counter.borrow_mut() += 1);

    document.unload();
    assert_eq!(worker.state(), LifecycleState::Destroyed);
    assert_eq!(worker.url(), None);
    assert_eq!(*detached.borrow(), 1);
    assert_eq!(
        *console.lines.borrow(),
        vec!["detached".to_string(), "page is gone".to_string()]
    );

    let err = worker.post_message(&BoundaryValue::Null).unwrap_err();
    assert_eq!(unavailable(err), UnavailableReason::Gone);

    // Once destroyed, nothing comes back.
    document.show();
    assert_eq!(worker.state(), LifecycleState::Destroyed);
}

#[test]
fn destroy_is_idempotent() {
    let document = Document::loaded("data:text/html,foo").expect("document");
    let (options, _) = build(document, ECHO);
    let worker = Worker::new(options).expect("worker");

    let detached = Rc::new(RefCell::new(0));
    let counter = Rc::clone(&detached);
    worker.on("detach", move |_| *counter.borrow_mut() += 1);

    worker.destroy();
    worker.destroy();
    assert_eq!(worker.state(), LifecycleState::Destroyed);
    assert_eq!(*detached.borrow(), 1);
}

#[test]
fn destroy_from_a_listener_runs_after_it_returns() {
    let document = Document::loaded("data:text/html,foo").expect("document");
    let (options, received) = build(document, ECHO);
    let worker = Worker::new(options).expect("worker");

    let handle = worker.clone();
    worker.on("message", move |_| {
        handle.destroy();
        assert_eq!(handle.state(), LifecycleState::Attached);
    });

    worker.post_message(&BoundaryValue::from(1)).expect("post");
    assert_eq!(*received.borrow(), vec![json!("echo:1")]);
    assert_eq!(worker.state(), LifecycleState::Destroyed);
}

#[test]
fn reattaching_starts_a_new_generation() {
    let first = Document::loaded("data:text/html,first").expect("document");
    let (options, received) = build(
        first.clone(),
        r#"self.postMessage(location.href); self.on("message", function (m) { self.postMessage("echo:" + m); });"#,
    );
    let worker = Worker::new(options).expect("worker");
    assert_eq!(worker.generation(), Generation::FIRST);

    let second = Document::loaded("data:text/html,second").expect("document");
    let generation = worker.attach(second.clone()).expect("attach");
    assert_eq!(generation, Generation::FIRST.next());
    assert_eq!(worker.generation(), generation);
    assert_eq!(worker.url().as_deref(), Some("data:text/html,second"));

    // The old document no longer drives this worker.
    first.hide();
    assert_eq!(worker.state(), LifecycleState::Attached);

    worker.post_message(&BoundaryValue::from("x")).expect("post");
    assert_eq!(
        *received.borrow(),
        vec![
            json!("data:text/html,first"),
            json!("data:text/html,second"),
            json!("echo:x"),
        ]
    );

    // Destroyed workers can be re-attached too, again under a new generation.
    second.unload();
    let third = Document::loaded("data:text/html,third").expect("document");
    let generation = worker.attach(third).expect("attach");
    assert_eq!(generation.get(), 3);
    assert_eq!(worker.state(), LifecycleState::Attached);
}

#[test]
fn unloaded_documents_cannot_be_attached() {
    let document = Document::loaded("data:text/html,foo").expect("document");
    document.unload();
    let (options, _) = build(document, ECHO);
    assert!(matches!(
        Worker::new(options),
        Err(WorkerError::DocumentUnloaded)
    ));
}

#[test]
fn script_waits_for_its_load_timing() {
    let script = r#"self.postMessage(document.readyState);"#;

    let document = Document::new("data:text/html,foo").expect("document");
    let (options, received) = build(document.clone(), script);
    let _worker = Worker::new(options).expect("worker");
    assert!(received.borrow().is_empty());
    document.set_ready_state(ReadyState::Interactive);
    assert!(received.borrow().is_empty());
    document.set_ready_state(ReadyState::Complete);
    assert_eq!(*received.borrow(), vec![json!("complete")]);

    let document = Document::new("data:text/html,foo").expect("document");
    let (options, received) = build(document.clone(), script);
    let _worker =
        Worker::new(options.script_load_timing(ScriptLoadTiming::Ready)).expect("worker");
    document.set_ready_state(ReadyState::Interactive);
    assert_eq!(*received.borrow(), vec![json!("interactive")]);

    let document = Document::new("data:text/html,foo").expect("document");
    let (options, received) = build(document, script);
    let _worker =
        Worker::new(options.script_load_timing(ScriptLoadTiming::Start)).expect("worker");
    assert_eq!(*received.borrow(), vec![json!("loading")]);
}

#[test]
fn messages_posted_before_evaluation_are_kept_in_order() {
    let document = Document::new("data:text/html,foo").expect("document");
    let (options, received) = build(document.clone(), ECHO);
    let worker = Worker::new(options).expect("worker");

    worker.post_message(&BoundaryValue::from(1)).expect("post");
    worker.post_message(&BoundaryValue::from(2)).expect("post");
    assert!(received.borrow().is_empty());

    document.set_ready_state(ReadyState::Complete);
    assert_eq!(*received.borrow(), vec![json!("echo:1"), json!("echo:2")]);
}

#[test]
fn url_follows_in_place_navigation() {
    let document = Document::loaded("data:text/html,foo").expect("document");
    let (options, _) = build(document.clone(), ECHO);
    let worker = Worker::new(options).expect("worker");

    assert_eq!(worker.url().as_deref(), Some("data:text/html,foo"));
    document.set_location("data:text/html,foo#bar").expect("navigate");
    assert_eq!(worker.url().as_deref(), Some("data:text/html,foo#bar"));
}

#[test]
fn attaching_from_inside_the_sandbox_is_rejected() {
    let document = Document::loaded("data:text/html,foo").expect("document");
    let (options, received) = build(
        document.clone(),
        r#"self.on("message", function () { self.postMessage(unsafeWindow.reattach()); });"#,
    );
    let worker = Worker::new(options).expect("worker");

    let handle = worker.clone();
    let target = Document::loaded("data:text/html,other").expect("document");
    document.define_global(
        "reattach",
        BoundaryValue::function(move |_| {
            let refused = matches!(handle.attach(target.clone()), Err(WorkerError::Reentrant));
            BoundaryValue::from(refused)
        }),
    );

    worker.post_message(&BoundaryValue::Null).expect("post");
    assert_eq!(*received.borrow(), vec![json!(true)]);
    assert_eq!(worker.generation(), Generation::FIRST);
}

#[test]
fn detach_listeners_cannot_attach_mid_teardown() {
    let first = Document::loaded("data:text/html,first").expect("document");
    let (options, received) = build(first.clone(), r#"self.postMessage(location.href);"#);
    let worker = Worker::new(options).expect("worker");

    let second = Document::loaded("data:text/html,second").expect("document");
    let refused = Rc::new(RefCell::new(None));
    {
        let handle = worker.clone();
        let target = second.clone();
        let refused = Rc::clone(&refused);
        worker.on("detach", move |_| {
            let outcome = handle.attach(target.clone());
            *refused.borrow_mut() = Some(matches!(outcome, Err(WorkerError::Reentrant)));
        });
    }

    first.unload();
    assert_eq!(*refused.borrow(), Some(true));
    assert_eq!(worker.state(), LifecycleState::Destroyed);
    assert_eq!(worker.generation(), Generation::FIRST);

    // Once teardown has finished the same call goes through, and the new
    // generation keeps its message callback.
    let generation = worker.attach(second).expect("attach");
    assert_eq!(generation, Generation::FIRST.next());
    assert_eq!(
        *received.borrow(),
        vec![json!("data:text/html,first"), json!("data:text/html,second")]
    );
}

#[test]
fn error_listener_attaching_during_a_detach_fault_does_not_recurse() {
    let first = Document::loaded("data:text/html,first").expect("document");
    let (options, received) = build(
        first.clone(),
        r#"
        self.postMessage(location.href);
        self.on("detach", function () { throw new Error("detach failed"); });
        "#,
    );
    let worker = Worker::new(options).expect("worker");

    let second = Document::loaded("data:text/html,second").expect("document");
    let faults = Rc::new(RefCell::new(Vec::new()));
    {
        let handle = worker.clone();
        let target = second.clone();
        let faults = Rc::clone(&faults);
        worker.on_error(move |fault| {
            let outcome = handle.attach(target.clone());
            faults.borrow_mut().push((
                fault.message.clone(),
                matches!(outcome, Err(WorkerError::Reentrant)),
            ));
        });
    }

    first.unload();
    assert_eq!(*faults.borrow(), vec![("detach failed".to_string(), true)]);
    assert_eq!(worker.state(), LifecycleState::Destroyed);

    worker.attach(second).expect("attach");
    assert_eq!(worker.state(), LifecycleState::Attached);
    assert_eq!(worker.url().as_deref(), Some("data:text/html,second"));
    assert_eq!(
        *received.borrow(),
        vec![json!("data:text/html,first"), json!("data:text/html,second")]
    );
}

#[test]
fn deliveries_still_queued_at_teardown_are_dropped() {
    let document = Document::new("data:text/html,foo").expect("document");
    let (options, received) = build(document.clone(), ECHO);
    let worker = Worker::new(options).expect("worker");

    // Not evaluated yet, so the message waits in the queue.
    worker.post_message(&BoundaryValue::from("never")).expect("post");
    document.unload();

    let next = Document::loaded("data:text/html,next").expect("document");
    worker.attach(next).expect("attach");
    assert!(received.borrow().is_empty());
}
