//! Proptest strategies for events and mixed-validity batches.

use proptest::prelude::{any, prop, prop_oneof, Just, Strategy};
use pulse_core::RawEvent;
use serde_json::Value;

use crate::fixtures::{invalid_event_json, EventBuilder};

/// Identifier-safe strings of 1 to 32 characters.
pub fn identifier() -> impl Strategy<Value = String> {
    "[a-z0-9][a-z0-9_-]{0,31}"
}

/// Timestamps in the accepted input formats.
pub fn timestamp() -> impl Strategy<Value = String> {
    (2000i32..2100, 1u32..=12, 1u32..=28, 0u32..24, 0u32..60, 0u32..60, 0u32..1000).prop_flat_map(
        |(y, mo, d, h, mi, s, ms)| {
            prop_oneof![
                Just(format!("{y:04}-{mo:02}-{d:02}T{h:02}:{mi:02}:{s:02}Z")),
                Just(format!("{y:04}-{mo:02}-{d:02}T{h:02}:{mi:02}:{s:02}.{ms:03}Z")),
                Just(format!("{y:04}-{mo:02}-{d:02}T{h:02}:{mi:02}:{s:02}+02:00")),
                Just(format!("{y:04}-{mo:02}-{d:02}T{h:02}:{mi:02}:{s:02}.{ms:03}")),
            ]
        },
    )
}

/// Valid events with arbitrary ids, readings and timestamps.
pub fn raw_event() -> impl Strategy<Value = RawEvent> {
    (identifier(), identifier(), -1.0e6f64..1.0e6, timestamp()).prop_map(
        |(event_id, device_id, value, timestamp)| {
            EventBuilder::new()
                .id(event_id)
                .device(device_id)
                .value(value)
                .timestamp(timestamp)
                .build()
        },
    )
}

/// Batch elements paired with the positions that must be rejected.
pub fn mixed_batch(max_len: usize) -> impl Strategy<Value = (Vec<Value>, Vec<usize>)> {
    prop::collection::vec(any::<bool>(), 0..=max_len).prop_map(|validity| {
        let mut items = Vec::with_capacity(validity.len());
        let mut invalid = Vec::new();
        for (index, valid) in validity.into_iter().enumerate() {
            if valid {
                items.push(EventBuilder::new().id(format!("mix-{index}")).build_json());
            } else {
                items.push(invalid_event_json(index));
                invalid.push(index);
            }
        }
        (items, invalid)
    })
}
