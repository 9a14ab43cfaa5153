use crate::record::LogRecord;
use crate::sink::LogSink;
use chrono::Utc;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Metadata, Subscriber};
use tracing_subscriber::layer::{Context, Layer};
use tracing_subscriber::registry::LookupSpan;

/// Events from these targets are never forwarded. The first is this crate's
/// own diagnostics; the rest are emitted by the transports' dependencies
/// while delivering.
const IGNORED_TARGETS: [&str; 5] = ["tracing_gelf_sink", "hyper", "reqwest", "rustls", "h2"];

/// `tracing_subscriber` layer that turns events into [`LogRecord`]s and hands
/// them to a [`LogSink`].
///
/// Delivery happens inline on the thread that emitted the event; the sink is
/// expected to return immediately.
pub struct GelfLayer {
    sink: Arc<dyn LogSink>,
    max_level: Level,
    next_id: AtomicU64,
    /// Events seen by the layer, before level filtering.
    pub total_events: Arc<AtomicU64>,
    /// Events handed to the sink.
    pub delivered_events: Arc<AtomicU64>,
}

impl GelfLayer {
    /// Forward events at `INFO` and above.
    pub fn new(sink: Arc<dyn LogSink>) -> Self {
        GelfLayer {
            sink,
            max_level: Level::INFO,
            next_id: AtomicU64::new(1),
            total_events: Arc::new(AtomicU64::new(0)),
            delivered_events: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Forward events at the named severity and above.
    ///
    /// Accepts the GELF level names (`error`, `warn`, `info`, `verbose`,
    /// `debug`, `silly`). Unknown names fall back to `info`.
    pub fn with_level(mut self, name: &str) -> Self {
        self.max_level = match level_from_name(name) {
            Some(level) => level,
            None => {
                tracing::warn!(level = %name, "unknown log level; forwarding info and above");
                Level::INFO
            }
        };
        self
    }

    fn forwards(&self, meta: &Metadata<'_>) -> bool {
        *meta.level() <= self.max_level && !is_ignored_target(meta.target())
    }
}

/// `true` for an ignored crate or any of its modules.
fn is_ignored_target(target: &str) -> bool {
    IGNORED_TARGETS.iter().any(|krate| {
        target
            .strip_prefix(krate)
            .is_some_and(|rest| rest.is_empty() || rest.starts_with("::"))
    })
}

/// GELF severity name for a `tracing` level.
pub fn level_name(level: &Level) -> &'static str {
    match *level {
        Level::ERROR => "error",
        Level::WARN => "warn",
        Level::INFO => "info",
        Level::DEBUG => "debug",
        Level::TRACE => "silly",
    }
}

fn level_from_name(name: &str) -> Option<Level> {
    match name.to_ascii_lowercase().as_str() {
        "error" => Some(Level::ERROR),
        "warn" => Some(Level::WARN),
        "info" => Some(Level::INFO),
        "verbose" | "debug" => Some(Level::DEBUG),
        "silly" => Some(Level::TRACE),
        _ => None,
    }
}

impl<S> Layer<S> for GelfLayer
where
    S: Subscriber + for<'span> LookupSpan<'span>,
{
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        self.total_events.fetch_add(1, Ordering::Relaxed);

        let meta = event.metadata();
        if !self.forwards(meta) {
            return;
        }

        let mut fields = BTreeMap::new();
        let mut message = None;
        let mut exception = false;

        event.record(&mut FieldVisitor {
            fields: &mut fields,
            message: &mut message,
            exception: &mut exception,
        });

        fields.insert("target".to_owned(), Value::from(meta.target()));
        if let Some(module_path) = meta.module_path() {
            fields.insert("module_path".to_owned(), Value::from(module_path));
        }
        if let Some(file) = meta.file() {
            fields.insert("file".to_owned(), Value::from(file));
        }
        if let Some(line) = meta.line() {
            fields.insert("line".to_owned(), Value::from(line));
        }

        let record = LogRecord {
            level: Some(level_name(meta.level()).to_owned()),
            message: Value::String(message.unwrap_or_default()),
            exception,
            timestamp: Some(Utc::now()),
            id: Some(self.next_id.fetch_add(1, Ordering::Relaxed).to_string()),
            fields,
        };

        self.sink.deliver(&record);
        self.delivered_events.fetch_add(1, Ordering::Relaxed);
    }
}

/// Collects an event's fields. `message` becomes the record message and a
/// boolean `exception` field sets the exception flag.
pub struct FieldVisitor<'a> {
    pub fields: &'a mut BTreeMap<String, Value>,
    pub message: &'a mut Option<String>,
    pub exception: &'a mut bool,
}

impl<'a> Visit for FieldVisitor<'a> {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            *self.message = Some(value.to_string());
        } else {
            self.fields
                .insert(field.name().to_string(), Value::String(value.to_string()));
        }
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.fields.insert(field.name().to_string(), Value::from(value));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.fields.insert(field.name().to_string(), Value::from(value));
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        // NaN and infinities have no JSON form
        let value = serde_json::Number::from_f64(value)
            .map(Value::Number)
            .unwrap_or_else(|| Value::String(value.to_string()));
        self.fields.insert(field.name().to_string(), value);
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        if field.name() == "exception" {
            *self.exception = value;
        } else {
            self.fields.insert(field.name().to_string(), Value::from(value));
        }
    }

    fn record_error(&mut self, field: &Field, value: &(dyn std::error::Error + 'static)) {
        self.fields
            .insert(field.name().to_string(), Value::String(value.to_string()));
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            *self.message = Some(format!("{:?}", value));
        } else {
            self.fields
                .insert(field.name().to_string(), Value::String(format!("{:?}", value)));
        }
    }
}
