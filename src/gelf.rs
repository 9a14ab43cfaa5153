//! Translation of [`LogRecord`]s into GELF 1.1 payloads.
//!
//! The builder is pure: it never performs I/O and never fails. The only
//! non-deterministic input is the wall-clock timestamp.

use crate::record::LogRecord;
use chrono::Utc;
use serde::Serialize;
use serde_json::{Map, Number, Value};
use std::collections::BTreeMap;

pub const GELF_VERSION: &str = "1.1";

/// Level names understood by the builder, most severe first.
pub const LEVELS: [(&str, u8); 6] = [
    ("error", 0),
    ("warn", 1),
    ("info", 2),
    ("verbose", 3),
    ("debug", 4),
    ("silly", 5),
];

/// Record keys that are consumed by the builder and never expanded into
/// `_`-prefixed custom fields.
const RESERVED_KEYS: [&str; 4] = ["level", "message", "id", "exception"];

/// Map a level name onto its GELF severity. Unknown or absent names are
/// treated as the most severe level.
pub fn level_to_int(level: Option<&str>) -> u8 {
    level
        .and_then(|name| LEVELS.iter().find(|(n, _)| *n == name))
        .map(|(_, severity)| *severity)
        .unwrap_or(0)
}

/// A custom field value as it appears on the wire.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum FieldValue {
    Str(String),
    Num(Number),
    /// Structured data forwarded untouched; the JSON encoder serializes it.
    Raw(Value),
}

/// Policy for custom field values that are neither strings nor numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Sanitize {
    /// Render the value as JSON text.
    #[default]
    Stringify,
    Passthrough,
}

impl FieldValue {
    pub fn from_value(value: Value, sanitize: Sanitize) -> Self {
        match value {
            Value::String(s) => FieldValue::Str(s),
            Value::Number(n) => FieldValue::Num(n),
            other => match sanitize {
                Sanitize::Stringify => FieldValue::Str(other.to_string()),
                Sanitize::Passthrough => FieldValue::Raw(other),
            },
        }
    }
}

/// A GELF message ready to be serialized.
#[derive(Debug, Clone, Serialize)]
pub struct GelfPayload {
    pub version: &'static str,
    pub timestamp: f64,
    pub level: u8,
    pub host: String,
    pub short_message: Value,
    pub full_message: Value,
    /// Every `_`-prefixed field, including `_service`, `_environment` and `_release`.
    #[serde(flatten)]
    pub additional: BTreeMap<String, FieldValue>,
}

impl GelfPayload {
    /// Serialize into the JSON bytes sent on the wire.
    pub fn to_bytes(&self) -> Vec<u8> {
        // Keys are strings and values are plain JSON, so this can't fail
        serde_json::to_vec(self).unwrap_or_default()
    }
}

/// Settings fixed for the lifetime of a builder.
#[derive(Debug, Clone)]
pub struct BuilderConfig {
    pub hostname: String,
    pub service: Option<String>,
    pub environment: Option<String>,
    pub release: Option<String>,
    pub legacy_format: bool,
    pub sanitize: Sanitize,
    /// Static fields merged last; every key starts with `_`.
    pub custom_fields: BTreeMap<String, Value>,
}

impl Default for BuilderConfig {
    fn default() -> Self {
        BuilderConfig {
            hostname: "localhost".to_string(),
            service: Some("nodejs".to_string()),
            environment: Some("development".to_string()),
            release: None,
            legacy_format: false,
            sanitize: Sanitize::Stringify,
            custom_fields: BTreeMap::new(),
        }
    }
}

/// Builds [`GelfPayload`]s from [`LogRecord`]s.
#[derive(Debug, Clone)]
pub struct PayloadBuilder {
    config: BuilderConfig,
}

impl PayloadBuilder {
    pub fn new(config: BuilderConfig) -> Self {
        PayloadBuilder { config }
    }

    pub fn config(&self) -> &BuilderConfig {
        &self.config
    }

    pub fn build(&self, record: &LogRecord) -> GelfPayload {
        let short_message = match &record.message {
            Value::String(msg) => Value::String(first_line(msg).to_owned()),
            other => other.clone(),
        };

        let mut additional = BTreeMap::new();

        let full_message = if self.config.legacy_format {
            Value::String(legacy_full_message(record))
        } else {
            self.expand_fields(record, &mut additional);
            record.message.clone()
        };

        // Logger configuration is trusted ahead of any one event's fields
        additional.insert("_service".to_owned(), optional_str(&self.config.service));
        additional.insert(
            "_environment".to_owned(),
            optional_str(&self.config.environment),
        );
        additional.insert("_release".to_owned(), optional_str(&self.config.release));

        for (k, v) in &self.config.custom_fields {
            additional.insert(k.clone(), FieldValue::from_value(v.clone(), Sanitize::Passthrough));
        }

        GelfPayload {
            version: GELF_VERSION,
            timestamp: Utc::now().timestamp_millis() as f64 / 1000.0,
            level: level_to_int(record.level.as_deref()),
            host: self.config.hostname.clone(),
            short_message,
            full_message,
            additional,
        }
    }

    fn expand_fields(&self, record: &LogRecord, additional: &mut BTreeMap<String, FieldValue>) {
        if let Some(timestamp) = record.timestamp {
            additional.insert(
                "_timestamp".to_owned(),
                FieldValue::Str(timestamp.to_rfc3339()),
            );
        }

        for (k, v) in &record.fields {
            if RESERVED_KEYS.contains(&k.as_str()) {
                continue;
            }

            additional.insert(
                format!("_{}", k),
                FieldValue::from_value(v.clone(), self.config.sanitize),
            );
        }
    }
}

fn first_line(msg: &str) -> &str {
    msg.split('\n').next().unwrap_or(msg)
}

fn optional_str(value: &Option<String>) -> FieldValue {
    match value {
        Some(s) => FieldValue::Str(s.clone()),
        None => FieldValue::Raw(Value::Null),
    }
}

/// Pretty JSON of the whole record minus `level` and the exception flag.
fn legacy_full_message(record: &LogRecord) -> String {
    let mut meta = Map::new();

    for (k, v) in &record.fields {
        if k != "level" && k != "exception" {
            meta.insert(k.clone(), v.clone());
        }
    }

    meta.insert("message".to_owned(), record.message.clone());
    if let Some(timestamp) = record.timestamp {
        meta.insert("timestamp".to_owned(), Value::String(timestamp.to_rfc3339()));
    }
    if let Some(id) = &record.id {
        meta.insert("id".to_owned(), Value::String(id.clone()));
    }

    serde_json::to_string_pretty(&Value::Object(meta)).unwrap_or_default()
}
