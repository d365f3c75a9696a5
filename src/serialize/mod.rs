mod record;

pub use record::{Event, EventBody, Fields, Metadata, Metric, MetricGroup, Record, Timestamp};

use bytes::Bytes;
use serde_json::{Number, Value};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SerializationError {
    #[error("JSON serialization failed: {0}")]
    Json(#[from] serde_json::Error),
    #[error("metric value for {name:?} is not a finite number")]
    NonFiniteValue { name: String },
    #[error("measurement {name:?} is not numeric")]
    NonNumericMeasurement { name: String },
}

/// One newline-terminated wire envelope, ready to be concatenated into a
/// request body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerializedMessage {
    body: Bytes,
}

impl SerializedMessage {
    pub fn len(&self) -> usize {
        self.body.len()
    }

    pub fn is_empty(&self) -> bool {
        self.body.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.body
    }
}

/// Deep-merges `overlay` into `base`: nested maps recurse, everything else
/// (scalars and arrays) is replaced by the overlay value.
pub fn deep_merge(base: &mut Fields, overlay: &Fields) {
    for (key, value) in overlay {
        match (base.get_mut(key), value) {
            (Some(Value::Object(existing)), Value::Object(incoming)) => {
                deep_merge(existing, incoming);
            }
            _ => {
                base.insert(key.clone(), value.clone());
            }
        }
    }
}

/// Converts records into the collector's newline-delimited JSON envelopes.
///
/// Holds the client's default metadata and fields so precedence is applied in
/// one place: record metadata wins per field, record fields deep-merge over
/// defaults, metric keys are injected last.
#[derive(Debug, Clone)]
pub struct HecSerializer {
    default_metadata: Metadata,
    default_fields: Fields,
    multi_metric_format: bool,
}

impl HecSerializer {
    pub fn new(default_metadata: Metadata, default_fields: Fields, multi_metric_format: bool) -> Self {
        Self {
            default_metadata,
            default_fields,
            multi_metric_format,
        }
    }

    pub fn serialize_record(&self, record: &Record) -> Result<SerializedMessage, SerializationError> {
        match record {
            Record::Event(event) => self.serialize_event(event),
            Record::Metric(metric) => self.serialize_metric(metric),
        }
    }

    pub fn serialize_event(&self, event: &Event) -> Result<SerializedMessage, SerializationError> {
        let mut fields = self.default_fields.clone();
        deep_merge(&mut fields, &event.fields);
        self.envelope(event.time, &event.metadata, fields, Some(&event.body))
    }

    pub fn serialize_metric(&self, metric: &Metric) -> Result<SerializedMessage, SerializationError> {
        let value = Number::from_f64(metric.value).ok_or_else(|| {
            SerializationError::NonFiniteValue {
                name: metric.name.clone(),
            }
        })?;
        let mut fields = self.default_fields.clone();
        deep_merge(&mut fields, &metric.fields);
        fields.insert("metric_name".to_owned(), Value::String(metric.name.clone()));
        fields.insert("_value".to_owned(), Value::Number(value));
        self.envelope(metric.time, &metric.metadata, fields, None)
    }

    /// Serializes a multi-measurement record.
    ///
    /// With the multi-measurement format enabled this emits a single envelope
    /// carrying one `metric_name:<name>` key per measurement; otherwise it
    /// expands to one single-metric envelope per measurement, all sharing the
    /// group's timestamp and metadata.
    pub fn serialize_metric_group(
        &self,
        group: &MetricGroup,
    ) -> Result<Vec<SerializedMessage>, SerializationError> {
        let mut base = self.default_fields.clone();
        deep_merge(&mut base, &group.fields);

        if self.multi_metric_format {
            let mut fields = base;
            let mut emitted = false;
            for (name, value) in &group.measurements {
                let Some(number) = measurement_number(name, value)? else {
                    continue;
                };
                fields.insert(format!("metric_name:{name}"), Value::Number(number));
                emitted = true;
            }
            if !emitted {
                return Ok(Vec::new());
            }
            let envelope = self.envelope(group.time, &group.metadata, fields, None)?;
            return Ok(vec![envelope]);
        }

        let mut envelopes = Vec::with_capacity(group.measurements.len());
        for (name, value) in &group.measurements {
            let Some(number) = measurement_number(name, value)? else {
                continue;
            };
            let mut fields = base.clone();
            fields.insert("metric_name".to_owned(), Value::String(name.clone()));
            fields.insert("_value".to_owned(), Value::Number(number));
            envelopes.push(self.envelope(group.time, &group.metadata, fields, None)?);
        }
        Ok(envelopes)
    }

    // Envelope key order is fixed: time, host, source, sourcetype, index,
    // fields, event.
    fn envelope(
        &self,
        time: Option<Timestamp>,
        metadata: &Metadata,
        fields: Fields,
        event: Option<&EventBody>,
    ) -> Result<SerializedMessage, SerializationError> {
        let mut envelope = Fields::new();
        if let Some(number) = time.and_then(epoch_seconds) {
            envelope.insert("time".to_owned(), Value::Number(number));
        }
        let resolved = metadata.resolved_over(&self.default_metadata);
        for (key, value) in [
            ("host", resolved.host),
            ("source", resolved.source),
            ("sourcetype", resolved.sourcetype),
            ("index", resolved.index),
        ] {
            if let Some(value) = value.filter(|v| !v.is_empty()) {
                envelope.insert(key.to_owned(), Value::String(value));
            }
        }
        envelope.insert("fields".to_owned(), Value::Object(fields));
        if let Some(body) = event {
            envelope.insert("event".to_owned(), body.to_value());
        }

        let mut buffer = serde_json::to_vec(&Value::Object(envelope))?;
        buffer.push(b'\n');
        Ok(SerializedMessage {
            body: Bytes::from(buffer),
        })
    }
}

/// Epoch seconds with millisecond precision as a JSON number.
fn epoch_seconds(time: Timestamp) -> Option<Number> {
    Number::from_f64(time.epoch_millis() as f64 / 1000.0)
}

fn measurement_number(name: &str, value: &Value) -> Result<Option<Number>, SerializationError> {
    match value {
        Value::Null => Ok(None),
        Value::Number(number) => Ok(Some(number.clone())),
        _ => Err(SerializationError::NonNumericMeasurement {
            name: name.to_owned(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn bare() -> HecSerializer {
        HecSerializer::new(Metadata::default(), Fields::new(), false)
    }

    #[test]
    fn time_coercion_keeps_millisecond_precision() {
        let number = epoch_seconds(Timestamp::Millis(1_575_029_727_123)).unwrap();
        assert_eq!(number.as_f64().unwrap(), 1_575_029_727.123);
    }

    #[test]
    fn empty_metadata_fields_are_omitted() {
        let mut event = Event::new("hi");
        event.metadata.host = Some(String::new());
        event.metadata.source = Some("src".to_owned());
        let message = bare().serialize_event(&event).unwrap();
        let value: Value = serde_json::from_slice(message.as_bytes()).unwrap();
        assert!(value.get("host").is_none());
        assert_eq!(value["source"], json!("src"));
        assert!(value.get("time").is_none());
    }

    #[test]
    fn structured_body_is_passed_through() {
        let mut event = Event::new(EventBody::Structured(json!({"k": [1, 2]})));
        event.time = Some(Timestamp::Millis(1_000));
        let message = bare().serialize_event(&event).unwrap();
        let value: Value = serde_json::from_slice(message.as_bytes()).unwrap();
        assert_eq!(value["event"], json!({"k": [1, 2]}));
        assert_eq!(value["time"], json!(1.0));
    }

    #[test]
    fn non_finite_metric_is_rejected() {
        let metric = Metric::new("m", f64::NAN);
        let error = bare().serialize_metric(&metric).unwrap_err();
        assert!(matches!(error, SerializationError::NonFiniteValue { .. }));
    }

    #[test]
    fn deep_merge_recurses_into_maps_and_replaces_arrays() {
        let mut base = match json!({"a": {"x": 1, "y": 2}, "list": [1], "keep": true}) {
            Value::Object(map) => map,
            _ => unreachable!(),
        };
        let overlay = match json!({"a": {"y": 3, "z": 4}, "list": [9, 9]}) {
            Value::Object(map) => map,
            _ => unreachable!(),
        };
        deep_merge(&mut base, &overlay);
        assert_eq!(
            Value::Object(base),
            json!({"a": {"x": 1, "y": 3, "z": 4}, "list": [9, 9], "keep": true})
        );
    }

    #[test]
    fn null_measurements_are_skipped() {
        let measurements = match json!({"a": 1.5, "b": null}) {
            Value::Object(map) => map,
            _ => unreachable!(),
        };
        let group = MetricGroup::new(measurements);
        let messages = bare().serialize_metric_group(&group).unwrap();
        assert_eq!(messages.len(), 1);
        let value: Value = serde_json::from_slice(messages[0].as_bytes()).unwrap();
        assert_eq!(value["fields"]["metric_name"], json!("a"));
        assert_eq!(value["fields"]["_value"], json!(1.5));
    }

    #[test]
    fn non_numeric_measurement_is_rejected() {
        let measurements = match json!({"a": "oops"}) {
            Value::Object(map) => map,
            _ => unreachable!(),
        };
        let group = MetricGroup::new(measurements);
        let error = bare().serialize_metric_group(&group).unwrap_err();
        assert!(matches!(
            error,
            SerializationError::NonNumericMeasurement { .. }
        ));
    }
}
