use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::SystemTime;

/// Free-form fields attached to a record. Insertion order is preserved all the
/// way to the wire.
pub type Fields = serde_json::Map<String, Value>;

/// Routing metadata understood by the collector. Every field falls back to
/// the client default when absent; empty strings are treated as absent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    pub host: Option<String>,
    pub source: Option<String>,
    pub sourcetype: Option<String>,
    pub index: Option<String>,
}

impl Metadata {
    /// Per-field resolution of this metadata over the given defaults.
    pub fn resolved_over(&self, defaults: &Metadata) -> Metadata {
        fn pick(own: &Option<String>, fallback: &Option<String>) -> Option<String> {
            own.clone().or_else(|| fallback.clone())
        }
        Metadata {
            host: pick(&self.host, &defaults.host),
            source: pick(&self.source, &defaults.source),
            sourcetype: pick(&self.sourcetype, &defaults.sourcetype),
            index: pick(&self.index, &defaults.index),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.host.is_none()
            && self.source.is_none()
            && self.sourcetype.is_none()
            && self.index.is_none()
    }
}

/// Event payload: either plain text or an arbitrary JSON structure, sent
/// verbatim under the `event` key.
#[derive(Debug, Clone, PartialEq)]
pub enum EventBody {
    Text(String),
    Structured(Value),
}

impl EventBody {
    pub(crate) fn to_value(&self) -> Value {
        match self {
            EventBody::Text(text) => Value::String(text.clone()),
            EventBody::Structured(value) => value.clone(),
        }
    }
}

impl From<&str> for EventBody {
    fn from(text: &str) -> Self {
        EventBody::Text(text.to_owned())
    }
}

impl From<String> for EventBody {
    fn from(text: String) -> Self {
        EventBody::Text(text)
    }
}

impl From<Value> for EventBody {
    fn from(value: Value) -> Self {
        EventBody::Structured(value)
    }
}

/// A record timestamp: epoch milliseconds or a date-time convertible to them.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Timestamp {
    Millis(i64),
    Date(DateTime<Utc>),
}

impl Timestamp {
    pub fn epoch_millis(&self) -> i64 {
        match *self {
            Timestamp::Millis(millis) => millis,
            Timestamp::Date(date) => date.timestamp_millis(),
        }
    }
}

impl From<i64> for Timestamp {
    fn from(millis: i64) -> Self {
        Timestamp::Millis(millis)
    }
}

impl From<DateTime<Utc>> for Timestamp {
    fn from(date: DateTime<Utc>) -> Self {
        Timestamp::Date(date)
    }
}

impl From<SystemTime> for Timestamp {
    fn from(time: SystemTime) -> Self {
        Timestamp::Date(time.into())
    }
}

/// A free-form log event.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub body: EventBody,
    pub time: Option<Timestamp>,
    pub metadata: Metadata,
    pub fields: Fields,
}

impl Event {
    pub fn new(body: impl Into<EventBody>) -> Self {
        Self {
            body: body.into(),
            time: None,
            metadata: Metadata::default(),
            fields: Fields::new(),
        }
    }
}

/// A single named measurement.
#[derive(Debug, Clone, PartialEq)]
pub struct Metric {
    pub name: String,
    pub value: f64,
    pub time: Option<Timestamp>,
    pub metadata: Metadata,
    pub fields: Fields,
}

impl Metric {
    pub fn new(name: impl Into<String>, value: f64) -> Self {
        Self {
            name: name.into(),
            value,
            time: None,
            metadata: Metadata::default(),
            fields: Fields::new(),
        }
    }
}

/// Several measurements sharing one timestamp and metadata.
///
/// Measurement values must be JSON numbers; null values are skipped.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricGroup {
    pub measurements: Fields,
    pub time: Option<Timestamp>,
    pub metadata: Metadata,
    pub fields: Fields,
}

impl MetricGroup {
    pub fn new(measurements: Fields) -> Self {
        Self {
            measurements,
            time: None,
            metadata: Metadata::default(),
            fields: Fields::new(),
        }
    }
}

/// The input type accepted by the client's generic push operation.
#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    Event(Event),
    Metric(Metric),
}

impl From<Event> for Record {
    fn from(event: Event) -> Self {
        Record::Event(event)
    }
}

impl From<Metric> for Record {
    fn from(metric: Metric) -> Self {
        Record::Metric(metric)
    }
}
