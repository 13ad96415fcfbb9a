//! Captures tracing events so tests can assert on what workflows logged.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use tracing::field::{Field, Visit};
use tracing::{Dispatch, Event as TracingEvent, Level, Subscriber, dispatcher};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::{Context as LayerContext, Layer};
use tracing_subscriber::prelude::*;

#[derive(Debug, Clone)]
pub struct CapturedEvent {
    pub level: Level,
    pub message: String,
    pub fields: BTreeMap<String, String>,
}

impl CapturedEvent {
    /// Field value with surrounding quotes stripped.
    pub fn field(&self, key: &str) -> Option<String> {
        self.fields.get(key).map(|v| v.trim_matches('"').to_string())
    }
}

#[derive(Clone, Default)]
pub struct CapturedEvents(Arc<Mutex<Vec<CapturedEvent>>>);

impl CapturedEvents {
    pub fn all(&self) -> Vec<CapturedEvent> {
        self.0.lock().unwrap().clone()
    }

    pub fn with_message(&self, message: &str) -> Vec<CapturedEvent> {
        self.all().into_iter().filter(|e| e.message == message).collect()
    }

    pub fn at_level(&self, level: Level) -> Vec<CapturedEvent> {
        self.all().into_iter().filter(|e| e.level == level).collect()
    }
}

struct CaptureLayer {
    events: CapturedEvents,
}

struct FieldCapture<'a> {
    fields: &'a mut BTreeMap<String, String>,
}

impl Visit for FieldCapture<'_> {
    fn record_str(&mut self, field: &Field, value: &str) {
        self.fields.insert(field.name().to_string(), value.to_string());
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.fields.insert(field.name().to_string(), value.to_string());
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.fields.insert(field.name().to_string(), format!("{value:?}"));
    }
}

impl<S: Subscriber> Layer<S> for CaptureLayer {
    fn on_event(&self, event: &TracingEvent<'_>, _ctx: LayerContext<'_, S>) {
        let mut fields = BTreeMap::new();
        event.record(&mut FieldCapture { fields: &mut fields });
        let message = fields.get("message").cloned().unwrap_or_default();
        self.events.0.lock().unwrap().push(CapturedEvent {
            level: *event.metadata().level(),
            message,
            fields,
        });
    }
}

/// Install a thread-local subscriber that records every event. Hold the guard
/// for the duration of the test.
pub fn install_tracing_capture() -> (CapturedEvents, dispatcher::DefaultGuard) {
    let captured = CapturedEvents::default();
    let collector = tracing_subscriber::registry()
        .with(CaptureLayer {
            events: captured.clone(),
        })
        .with(LevelFilter::TRACE);
    let guard = dispatcher::set_default(&Dispatch::new(collector));
    (captured, guard)
}
