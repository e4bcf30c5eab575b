//! Test data builders for telemetry events.

use pulse_core::{models::Metadata, RawEvent};
use rand::Rng;
use serde_json::{json, Value};
use uuid::Uuid;

/// Builder for test events.
#[derive(Debug, Clone)]
pub struct EventBuilder {
    event_id: String,
    device_id: String,
    sensor_type: String,
    value: f64,
    unit: String,
    timestamp: String,
    metadata: Option<Metadata>,
}

impl EventBuilder {
    /// Creates a builder with a random event id and plausible readings.
    pub fn new() -> Self {
        let mut rng = rand::rng();
        Self {
            event_id: format!("evt_{}", Uuid::new_v4().simple()),
            device_id: format!("device-{}", rng.random_range(1..=50)),
            sensor_type: "temperature".to_string(),
            value: rng.random_range(-20.0..45.0),
            unit: "celsius".to_string(),
            timestamp: "2024-06-01T12:00:00.000Z".to_string(),
            metadata: None,
        }
    }

    /// Sets the event id.
    #[must_use]
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.event_id = id.into();
        self
    }

    /// Sets the device id.
    #[must_use]
    pub fn device(mut self, id: impl Into<String>) -> Self {
        self.device_id = id.into();
        self
    }

    /// Sets sensor type and unit.
    #[must_use]
    pub fn sensor(mut self, sensor_type: impl Into<String>, unit: impl Into<String>) -> Self {
        self.sensor_type = sensor_type.into();
        self.unit = unit.into();
        self
    }

    /// Sets the reading.
    #[must_use]
    pub fn value(mut self, value: f64) -> Self {
        self.value = value;
        self
    }

    /// Sets the raw timestamp string.
    #[must_use]
    pub fn timestamp(mut self, timestamp: impl Into<String>) -> Self {
        self.timestamp = timestamp.into();
        self
    }

    /// Adds a metadata entry.
    #[must_use]
    pub fn meta(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.get_or_insert_with(Metadata::new).insert(key.into(), value);
        self
    }

    /// Builds the event.
    pub fn build(self) -> RawEvent {
        RawEvent {
            event_id: self.event_id,
            device_id: self.device_id,
            sensor_type: self.sensor_type,
            value: self.value,
            unit: self.unit,
            timestamp: self.timestamp,
            metadata: self.metadata,
        }
    }

    /// Builds the event as a JSON request body value.
    pub fn build_json(self) -> Value {
        serde_json::to_value(self.build()).unwrap_or(Value::Null)
    }
}

impl Default for EventBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// `count` events with ids `{prefix}-0` .. `{prefix}-{count-1}`.
pub fn events(prefix: &str, count: usize) -> Vec<RawEvent> {
    (0..count).map(|i| EventBuilder::new().id(format!("{prefix}-{i}")).build()).collect()
}

/// JSON array of `count` valid events, with invalid elements at
/// `invalid_at`.
pub fn batch_json(prefix: &str, count: usize, invalid_at: &[usize]) -> Value {
    let items = (0..count)
        .map(|i| {
            if invalid_at.contains(&i) {
                invalid_event_json(i)
            } else {
                EventBuilder::new().id(format!("{prefix}-{i}")).build_json()
            }
        })
        .collect();
    Value::Array(items)
}

/// An element that fails validation. Cycles through several failure kinds.
pub fn invalid_event_json(seed: usize) -> Value {
    match seed % 4 {
        0 => json!({ "device_id": "d", "sensor_type": "t", "value": 1.0, "unit": "u",
                     "timestamp": "2024-01-01T00:00:00Z" }),
        1 => json!({ "event_id": "bad-ts", "device_id": "d", "sensor_type": "t", "value": 1.0,
                     "unit": "u", "timestamp": "yesterday" }),
        2 => json!({ "event_id": "bad-value", "device_id": "d", "sensor_type": "t",
                     "value": "hot", "unit": "u", "timestamp": "2024-01-01T00:00:00Z" }),
        _ => json!("not an object"),
    }
}

#[cfg(test)]
mod tests {
    use pulse_core::validation::partition_batch;

    use super::*;

    #[test]
    fn built_events_validate() {
        let event = EventBuilder::new().meta("firmware", json!("1.2.0")).build();
        assert!(event.validate().is_ok());
        assert_eq!(event.metadata.unwrap()["firmware"], "1.2.0");
    }

    #[test]
    fn batch_json_places_invalid_elements() {
        let Value::Array(items) = batch_json("b", 10, &[1, 4, 7, 8]) else {
            panic!("expected array");
        };
        let batch = partition_batch(items);
        assert_eq!(batch.invalid_indexes, vec![1, 4, 7, 8]);
        assert_eq!(batch.accepted(), 6);
    }
}
