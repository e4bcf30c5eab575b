//! Ingress validation of telemetry events.
//!
//! Batch submissions are validated element by element; invalid positions are
//! reported back to the producer while the valid remainder is admitted.

use serde_json::Value;

use crate::{
    error::{PulseError, Result},
    models::{normalize_timestamp, RawEvent},
};

/// Longest identifier accepted for `event_id` and `device_id`.
pub const MAX_ID_LEN: usize = 255;

impl RawEvent {
    /// Checks the event's fields.
    ///
    /// # Errors
    ///
    /// Returns `PulseError::Validation` describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        require_id("event_id", &self.event_id)?;
        require_id("device_id", &self.device_id)?;
        require_text("sensor_type", &self.sensor_type)?;
        require_text("unit", &self.unit)?;

        if !self.value.is_finite() {
            return Err(PulseError::validation("value must be a finite number"));
        }

        normalize_timestamp(&self.timestamp).map(|_| ())
    }
}

fn require_text(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(PulseError::validation(format!("{field} must not be empty")));
    }
    Ok(())
}

fn require_id(field: &str, value: &str) -> Result<()> {
    require_text(field, value)?;
    if value.len() > MAX_ID_LEN {
        return Err(PulseError::validation(format!(
            "{field} exceeds {MAX_ID_LEN} bytes"
        )));
    }
    Ok(())
}

/// Decodes and validates one event from arbitrary JSON.
///
/// # Errors
///
/// Returns `PulseError::Validation` when the value has the wrong shape or
/// fails field validation.
pub fn parse_event(value: Value) -> Result<RawEvent> {
    let event: RawEvent = serde_json::from_value(value)
        .map_err(|e| PulseError::validation(format!("malformed event: {e}")))?;
    event.validate()?;
    Ok(event)
}

/// Result of validating a submitted batch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PartitionedBatch {
    /// Valid events in submission order.
    pub valid: Vec<RawEvent>,
    /// Zero-based positions of invalid elements, ascending.
    pub invalid_indexes: Vec<usize>,
}

impl PartitionedBatch {
    /// Number of valid events.
    pub fn accepted(&self) -> usize {
        self.valid.len()
    }

    /// Number of invalid elements.
    pub fn rejected(&self) -> usize {
        self.invalid_indexes.len()
    }
}

/// Splits a submitted batch into valid events and invalid positions.
pub fn partition_batch(items: Vec<Value>) -> PartitionedBatch {
    let mut batch = PartitionedBatch::default();

    for (index, item) in items.into_iter().enumerate() {
        match parse_event(item) {
            Ok(event) => batch.valid.push(event),
            Err(e) => {
                tracing::debug!(index, error = %e, "rejecting batch element");
                batch.invalid_indexes.push(index);
            },
        }
    }

    batch
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn valid_json(id: &str) -> Value {
        json!({
            "event_id": id,
            "device_id": "device-7",
            "sensor_type": "pressure",
            "value": 1013.25,
            "unit": "hPa",
            "timestamp": "2024-05-01T08:30:00Z",
            "metadata": { "site": "north" }
        })
    }

    #[test]
    fn well_formed_event_passes() {
        let event = parse_event(valid_json("evt-1")).unwrap();
        assert_eq!(event.device_id, "device-7");
        assert!(event.metadata.is_some());
    }

    #[test]
    fn missing_field_is_rejected() {
        let mut value = valid_json("evt-1");
        value.as_object_mut().unwrap().remove("unit");

        let err = parse_event(value).unwrap_err();
        assert_eq!(err.code(), "E1001");
    }

    #[test]
    fn blank_ids_are_rejected() {
        assert!(parse_event(valid_json("   ")).is_err());
    }

    #[test]
    fn overlong_id_is_rejected() {
        assert!(parse_event(valid_json(&"x".repeat(MAX_ID_LEN + 1))).is_err());
    }

    #[test]
    fn bad_timestamp_is_rejected() {
        let mut value = valid_json("evt-1");
        value["timestamp"] = json!("not a time");
        assert!(parse_event(value).is_err());
    }

    #[test]
    fn string_value_is_rejected() {
        let mut value = valid_json("evt-1");
        value["value"] = json!("12");
        assert!(parse_event(value).is_err());
    }

    #[test]
    fn partition_reports_exact_invalid_positions() {
        let items = vec![
            valid_json("a"),
            json!({ "event_id": "b" }),
            valid_json("c"),
            json!(42),
            valid_json("e"),
        ];

        let batch = partition_batch(items);

        assert_eq!(batch.accepted(), 3);
        assert_eq!(batch.rejected(), 2);
        assert_eq!(batch.invalid_indexes, vec![1, 3]);
        let ids: Vec<_> = batch.valid.iter().map(|e| e.event_id.as_str()).collect();
        assert_eq!(ids, ["a", "c", "e"]);
    }
}
