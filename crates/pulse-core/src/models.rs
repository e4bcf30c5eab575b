//! Core domain models and strongly-typed identifiers.
//!
//! Defines the inbound telemetry event, its processed form, the queue job
//! envelope and the derived queue depth. Jobs carry deterministic
//! identifiers so resubmitting the same work is a no-op at the queue level.

use std::fmt;

use chrono::{DateTime, NaiveDateTime, SecondsFormat, SubsecRound, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{PulseError, Result};

/// Free-form event metadata, persisted as JSONB.
pub type Metadata = serde_json::Map<String, serde_json::Value>;

/// Telemetry event as accepted at ingress.
///
/// Immutable once admitted. `event_id` is the natural key: it doubles as the
/// queue job id for single-event jobs and as the conflict target on insert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawEvent {
    /// Globally unique event identifier supplied by the producer.
    pub event_id: String,
    /// Device that produced the reading.
    pub device_id: String,
    /// Sensor kind, e.g. `temperature`.
    pub sensor_type: String,
    /// Reading value.
    pub value: f64,
    /// Unit of `value`.
    pub unit: String,
    /// Reading time as an ISO-8601 string.
    pub timestamp: String,
    /// Optional producer metadata.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
}

/// Event after normalization by a worker.
///
/// Created once per dequeue, never mutated, and stored at most once per
/// `event_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessedEvent {
    /// Natural key carried over from the raw event.
    pub event_id: String,
    /// Device that produced the reading.
    pub device_id: String,
    /// Sensor kind.
    pub sensor_type: String,
    /// Reading value.
    pub value: f64,
    /// Unit of `value`.
    pub unit: String,
    /// Reading time, normalized to UTC with millisecond precision.
    pub timestamp: DateTime<Utc>,
    /// Optional producer metadata.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
    /// When a worker began processing the job.
    pub processed_at: DateTime<Utc>,
    /// When the job was enqueued.
    pub received_at: DateTime<Utc>,
}

impl ProcessedEvent {
    /// Normalizes a raw event.
    ///
    /// # Errors
    ///
    /// Returns `PulseError::Validation` if the timestamp is not ISO-8601.
    pub fn from_raw(
        raw: &RawEvent,
        processed_at: DateTime<Utc>,
        received_at: DateTime<Utc>,
    ) -> Result<Self> {
        Ok(Self {
            event_id: raw.event_id.clone(),
            device_id: raw.device_id.clone(),
            sensor_type: raw.sensor_type.clone(),
            value: raw.value,
            unit: raw.unit.clone(),
            timestamp: normalize_timestamp(&raw.timestamp)?,
            metadata: raw.metadata.clone(),
            processed_at,
            received_at,
        })
    }

    /// Canonical ISO-8601 rendering of the reading time.
    pub fn canonical_timestamp(&self) -> String {
        self.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true)
    }
}

/// Parses an ISO-8601 timestamp into UTC with millisecond precision.
///
/// Strings without an offset are read as UTC.
///
/// # Errors
///
/// Returns `PulseError::Validation` when the string is not a timestamp.
pub fn normalize_timestamp(input: &str) -> Result<DateTime<Utc>> {
    let parsed = DateTime::parse_from_rfc3339(input)
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|_| {
            NaiveDateTime::parse_from_str(input, "%Y-%m-%dT%H:%M:%S%.f").map(|dt| dt.and_utc())
        })
        .map_err(|e| PulseError::validation(format!("invalid timestamp {input:?}: {e}")))?;

    Ok(parsed.trunc_subsecs(3))
}

/// Queue-addressable job identifier.
///
/// Single-event jobs reuse the event id; batch jobs derive their id from
/// offset, first member and length so the same split always yields the same
/// ids.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub String);

impl JobId {
    /// Job id for a single-event job.
    pub fn for_event(event: &RawEvent) -> Self {
        Self(event.event_id.clone())
    }

    /// Job id for a sub-batch starting at `offset` within the submitted batch.
    pub fn for_batch(offset: usize, first_event_id: &str, len: usize) -> Self {
        Self(format!("batch-{offset}-{first_event_id}-{len}"))
    }

    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for JobId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// What a job carries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "events", rename_all = "snake_case")]
pub enum JobPayload {
    /// Exactly one event.
    Single(RawEvent),
    /// An ordered sub-batch of events.
    Batch(Vec<RawEvent>),
}

impl JobPayload {
    /// Events carried by this payload, in order.
    pub fn events(&self) -> &[RawEvent] {
        match self {
            Self::Single(event) => std::slice::from_ref(event),
            Self::Batch(events) => events,
        }
    }
}

/// Durable unit of work on the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Deterministic job identifier.
    pub id: JobId,
    /// Wrapped event or events.
    pub payload: JobPayload,
    /// When the job was created by admission.
    pub enqueued_at: DateTime<Utc>,
    /// Delivery attempts so far, maintained by the queue.
    #[serde(default)]
    pub attempts: u32,
}

impl Job {
    /// Wraps a single event.
    pub fn single(event: RawEvent, enqueued_at: DateTime<Utc>) -> Self {
        Self {
            id: JobId::for_event(&event),
            payload: JobPayload::Single(event),
            enqueued_at,
            attempts: 0,
        }
    }

    /// Wraps a sub-batch that started at `offset` in the submitted batch.
    ///
    /// # Errors
    ///
    /// Returns `PulseError::Validation` for an empty batch, which has no
    /// first member to derive an id from.
    pub fn batch(offset: usize, events: Vec<RawEvent>, enqueued_at: DateTime<Utc>) -> Result<Self> {
        let first = events
            .first()
            .ok_or_else(|| PulseError::validation("cannot create a job from an empty batch"))?;
        let id = JobId::for_batch(offset, &first.event_id, events.len());

        Ok(Self { id, payload: JobPayload::Batch(events), enqueued_at, attempts: 0 })
    }

    /// Events carried by this job.
    pub fn events(&self) -> &[RawEvent] {
        self.payload.events()
    }

    /// Number of events carried by this job.
    pub fn event_count(&self) -> usize {
        self.events().len()
    }
}

/// Waiting plus active jobs, recomputed from the queue on every read.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueDepth {
    /// Jobs waiting to be claimed, including delayed retries.
    pub waiting: u64,
    /// Jobs currently claimed by a worker.
    pub active: u64,
}

impl QueueDepth {
    /// Depth compared against the backpressure threshold.
    pub const fn total(&self) -> u64 {
        self.waiting + self.active
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn raw(event_id: &str, timestamp: &str) -> RawEvent {
        RawEvent {
            event_id: event_id.to_string(),
            device_id: "device-1".to_string(),
            sensor_type: "temperature".to_string(),
            value: 21.5,
            unit: "celsius".to_string(),
            timestamp: timestamp.to_string(),
            metadata: None,
        }
    }

    #[test]
    fn timestamps_normalize_to_utc_milliseconds() {
        let ts = normalize_timestamp("2024-03-01T12:00:00.123456+02:00").unwrap();
        assert_eq!(ts, Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap() + chrono::Duration::milliseconds(123));
    }

    #[test]
    fn offsetless_timestamps_are_read_as_utc() {
        let ts = normalize_timestamp("2024-03-01T12:00:00").unwrap();
        assert_eq!(ts, Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap());
    }

    #[test]
    fn garbage_timestamp_is_a_validation_error() {
        let err = normalize_timestamp("yesterday").unwrap_err();
        assert!(matches!(err, PulseError::Validation { .. }));
    }

    #[test]
    fn processed_event_keeps_identity_and_times() {
        let processed_at = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 5).unwrap();
        let received_at = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 1).unwrap();
        let event = ProcessedEvent::from_raw(
            &raw("evt-1", "2024-03-01T00:00:00Z"),
            processed_at,
            received_at,
        )
        .unwrap();

        assert_eq!(event.event_id, "evt-1");
        assert_eq!(event.processed_at, processed_at);
        assert_eq!(event.received_at, received_at);
        assert_eq!(event.canonical_timestamp(), "2024-03-01T00:00:00.000Z");
    }

    #[test]
    fn single_job_reuses_event_id() {
        let job = Job::single(raw("evt-42", "2024-03-01T00:00:00Z"), Utc::now());
        assert_eq!(job.id.as_str(), "evt-42");
        assert_eq!(job.event_count(), 1);
    }

    #[test]
    fn batch_job_id_is_deterministic() {
        let events = vec![raw("a", "2024-03-01T00:00:00Z"), raw("b", "2024-03-01T00:00:00Z")];
        let first = Job::batch(1000, events.clone(), Utc::now()).unwrap();
        let second = Job::batch(1000, events, Utc::now()).unwrap();

        assert_eq!(first.id.as_str(), "batch-1000-a-2");
        assert_eq!(first.id, second.id);
    }

    #[test]
    fn empty_batch_job_is_rejected() {
        assert!(Job::batch(0, Vec::new(), Utc::now()).is_err());
    }

    #[test]
    fn job_payload_round_trips_through_json() {
        let job = Job::single(raw("evt-1", "2024-03-01T00:00:00Z"), Utc::now());
        let json = serde_json::to_value(&job).unwrap();
        assert_eq!(json["payload"]["kind"], "single");

        let decoded: Job = serde_json::from_value(json).unwrap();
        assert_eq!(decoded, job);
    }

    #[test]
    fn queue_depth_sums_waiting_and_active() {
        assert_eq!(QueueDepth { waiting: 7, active: 3 }.total(), 10);
    }
}
