//! Synchronous telemetry event bus.
//!
//! Components publish named events (`oban.job.start`, `oban.job.stop`, …)
//! with JSON metadata. Subscribers attach a handler for an explicit list of
//! event names and are dispatched synchronously; a panicking handler never
//! interrupts dispatch to the remaining handlers.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use once_cell::sync::Lazy;
use serde_json::{Map, Value};

type Handler = Arc<dyn Fn(&str, &Value) + Send + Sync>;

struct Subscriber {
    id: String,
    events: Vec<String>,
    handler: Handler,
}

static SUBSCRIBERS: Lazy<Mutex<Vec<Subscriber>>> = Lazy::new(|| Mutex::new(Vec::new()));

static MONOTONIC_EPOCH: Lazy<Instant> = Lazy::new(Instant::now);

/// Nanoseconds on a process-local monotonic clock. Only meaningful relative
/// to other values from the same process.
pub fn monotonic_time_ns() -> u64 {
    MONOTONIC_EPOCH.elapsed().as_nanos() as u64
}

/// Attach a handler for the given event names. Re-attaching with the same id
/// replaces the previous handler.
pub fn attach<F>(id: &str, events: &[&str], handler: F)
where
    F: Fn(&str, &Value) + Send + Sync + 'static,
{
    let mut subscribers = SUBSCRIBERS.lock().expect("telemetry lock poisoned");

    subscribers.retain(|subscriber| subscriber.id != id);
    subscribers.push(Subscriber {
        id: id.to_owned(),
        events: events.iter().map(|event| (*event).to_owned()).collect(),
        handler: Arc::new(handler),
    });
}

/// Detach the handler registered under the given id, if any.
pub fn detach(id: &str) {
    SUBSCRIBERS
        .lock()
        .expect("telemetry lock poisoned")
        .retain(|subscriber| subscriber.id != id);
}

/// Dispatch an event to every handler attached to its name.
pub fn execute(name: &str, metadata: Value) {
    let handlers: Vec<Handler> = {
        let subscribers = SUBSCRIBERS.lock().expect("telemetry lock poisoned");

        subscribers
            .iter()
            .filter(|subscriber| subscriber.events.iter().any(|event| event == name))
            .map(|subscriber| Arc::clone(&subscriber.handler))
            .collect()
    };

    for handler in handlers {
        // A broken subscriber must not take down the publishing loop.
        catch_unwind(AssertUnwindSafe(|| handler(name, &metadata))).ok();
    }
}

/// An in-flight span. Emits `<name>.start` on creation and `<name>.stop` or
/// `<name>.exception` when finished, carrying the accumulated metadata plus
/// `monotonic_time` and `duration` in nanoseconds.
pub struct Span {
    name: String,
    metadata: Map<String, Value>,
    started: Instant,
}

/// Open a span, emitting its start event.
pub fn span(name: &str, metadata: Value) -> Span {
    let metadata = metadata.as_object().cloned().unwrap_or_default();

    let mut start_meta = metadata.clone();
    start_meta.insert("monotonic_time".to_owned(), monotonic_time_ns().into());
    execute(&format!("{name}.start"), Value::Object(start_meta));

    Span {
        name: name.to_owned(),
        metadata,
        started: Instant::now(),
    }
}

impl Span {
    /// Merge additional metadata into the span's stop event.
    pub fn add(&mut self, metadata: Value) {
        if let Value::Object(entries) = metadata {
            self.metadata.extend(entries);
        }
    }

    fn envelope(&self) -> Map<String, Value> {
        let mut meta = self.metadata.clone();
        meta.insert("monotonic_time".to_owned(), monotonic_time_ns().into());
        meta.insert(
            "duration".to_owned(),
            (self.started.elapsed().as_nanos() as u64).into(),
        );
        meta
    }

    /// Close the span successfully.
    pub fn finish(self) {
        let meta = self.envelope();
        execute(&format!("{}.stop", self.name), Value::Object(meta));
    }

    /// Close the span with an error.
    pub fn fail(self, error_message: &str) {
        let mut meta = self.envelope();
        meta.insert("error_message".to_owned(), error_message.into());
        execute(&format!("{}.exception", self.name), Value::Object(meta));
    }
}
