use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;

/// A single log event handed to the sink by the host logging framework.
///
/// `level`, `message`, `exception` and `id` have fixed meaning; everything
/// the caller attaches beyond that lives in `fields`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LogRecord {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,
    pub message: Value,
    /// Marks the record as carrying an unrecoverable application error.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub exception: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    /// Internal identifier assigned by the host; never forwarded as a field.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(flatten)]
    pub fields: BTreeMap<String, Value>,
}

impl LogRecord {
    pub fn new(level: impl Into<String>, message: impl Into<Value>) -> Self {
        LogRecord {
            level: Some(level.into()),
            message: message.into(),
            ..Default::default()
        }
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    pub fn with_exception(mut self, exception: bool) -> Self {
        self.exception = exception;
        self
    }
}
