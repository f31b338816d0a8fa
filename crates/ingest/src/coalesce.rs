//! Group a batch's messages into per-bucket, per-measurement groups.
//! Implemented as flat maps keyed on tuples rather than nested
//! per-type/per-identifier maps -- the coalesced groups are contractual,
//! the intermediate shape is not.
use std::collections::{
    BTreeMap,
    BTreeSet,
};

use serde_json::Value as Json;
use ts_model::{
    DataDocument,
    DataPoint,
    Event,
    EventDocument,
};

use crate::messages::{
    DataMessage,
    EventMessage,
};

/// A measurement sighted in this batch: the earliest `time` seen becomes its
/// `start`, the latest message's `meta`/`interval` win.
#[derive(Clone, Debug, PartialEq)]
pub struct CoalescedMeasurement {
    pub data_type: String,
    pub identifier: String,
    pub start: i64,
    pub interval: i64,
    pub meta: BTreeMap<String, Json>,
}

/// A coalesced data bucket, not yet reconciled against the store.
#[derive(Clone, Debug, PartialEq)]
pub struct CoalescedBucket {
    pub data_type: String,
    pub identifier: String,
    pub interval: i64,
    pub start: i64,
    pub end: i64,
    pub points: Vec<DataPoint>,
    pub value_types: BTreeSet<String>,
}

/// A coalesced event bucket, events not yet merged against the store.
#[derive(Clone, Debug, PartialEq)]
pub struct CoalescedEventBucket {
    pub data_type: String,
    pub start: i64,
    pub end: i64,
    pub events: Vec<Event>,
}

/// The full result of coalescing one batch.
#[derive(Default)]
pub struct Coalesced {
    pub measurements: Vec<CoalescedMeasurement>,
    pub value_types_by_data_type: BTreeMap<String, BTreeSet<String>>,
    pub data_buckets: Vec<CoalescedBucket>,
    pub event_buckets: Vec<CoalescedEventBucket>,
}

/// Coalesce a decoded batch's messages. `data_messages` is sorted by
/// ascending `time` first, so a measurement's `start` reflects the earliest
/// sample even under late arrival within the batch.
pub fn coalesce(
    mut data_messages: Vec<DataMessage>,
    event_messages: Vec<EventMessage>,
    high_resolution_document_size: u32,
    event_document_duration: i64,
) -> Coalesced {
    data_messages.sort_by_key(|m| m.time);

    let mut measurements: BTreeMap<(String, String), CoalescedMeasurement> = BTreeMap::new();
    let mut buckets: BTreeMap<(String, String, i64, i64), CoalescedBucket> = BTreeMap::new();
    let mut value_types_by_data_type: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();

    for message in data_messages {
        measurements
            .entry((message.data_type.clone(), message.identifier.clone()))
            .and_modify(|existing| {
                existing.start = existing.start.min(message.time);
                existing.interval = message.interval;
                existing.meta = message.meta.clone();
            })
            .or_insert_with(|| CoalescedMeasurement {
                data_type: message.data_type.clone(),
                identifier: message.identifier.clone(),
                start: message.time,
                interval: message.interval,
                meta: message.meta.clone(),
            });

        let doc_length = DataDocument::doc_length(message.interval, high_resolution_document_size);
        let (start, end) = DataDocument::bucket_bounds(message.time, doc_length);
        let bucket = buckets
            .entry((message.data_type.clone(), message.identifier.clone(), start, end))
            .or_insert_with(|| CoalescedBucket {
                data_type: message.data_type.clone(),
                identifier: message.identifier.clone(),
                interval: message.interval,
                start,
                end,
                points: Vec::new(),
                value_types: BTreeSet::new(),
            });

        let seen_value_types = value_types_by_data_type.entry(message.data_type.clone()).or_default();
        for (value_type, value) in message.values {
            bucket.points.push(DataPoint {
                time: message.time,
                interval: message.interval,
                value_type: value_type.clone(),
                value,
            });
            bucket.value_types.insert(value_type.clone());
            seen_value_types.insert(value_type);
        }
    }

    let mut event_buckets: BTreeMap<(String, i64, i64), CoalescedEventBucket> = BTreeMap::new();
    for message in event_messages {
        let (start, end) = EventDocument::bucket_bounds(message.start, event_document_duration);
        let bucket = event_buckets
            .entry((message.data_type.clone(), start, end))
            .or_insert_with(|| CoalescedEventBucket {
                data_type: message.data_type.clone(),
                start,
                end,
                events: Vec::new(),
            });
        bucket.events.push(Event {
            start: message.start,
            end: message.end,
            identifier: message.identifier,
            affected: message.affected,
            text: message.text,
            event_type: message.event_type,
        });
    }
    // Within a bucket, identity is `(start, identifier)`; a later event in
    // batch order replaces an earlier one under the same key.
    for bucket in event_buckets.values_mut() {
        let mut by_identity: BTreeMap<(i64, String), Event> = BTreeMap::new();
        for event in bucket.events.drain(..) {
            by_identity.insert((event.start, event.identifier.clone()), event);
        }
        bucket.events = by_identity.into_values().collect();
    }

    Coalesced {
        measurements: measurements.into_values().collect(),
        value_types_by_data_type,
        data_buckets: buckets.into_values().collect(),
        event_buckets: event_buckets.into_values().collect(),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn data_message(time: i64, interval: i64, identifier: &str, value: Option<f64>) -> DataMessage {
        DataMessage {
            data_type: "cpu".into(),
            identifier: identifier.into(),
            time,
            interval,
            values: BTreeMap::from([("usage_idle".to_owned(), value)]),
            meta: BTreeMap::from([("host".to_owned(), json!(identifier))]),
        }
    }

    #[test]
    fn measurement_start_is_the_earliest_time_seen() {
        let messages = vec![
            data_message(61_000, 60, "host-1", Some(1.0)),
            data_message(1_000, 60, "host-1", Some(2.0)),
        ];
        let coalesced = coalesce(messages, Vec::new(), 1_000, 86_400);
        assert_eq!(coalesced.measurements.len(), 1);
        assert_eq!(coalesced.measurements[0].start, 1_000);
    }

    #[test]
    fn bucket_boundaries_are_aligned_to_doc_length() {
        let messages = vec![data_message(61_000, 60, "host-1", Some(1.0))];
        let coalesced = coalesce(messages, Vec::new(), 1_000, 86_400);
        assert_eq!(coalesced.data_buckets.len(), 1);
        let bucket = &coalesced.data_buckets[0];
        assert_eq!((bucket.start, bucket.end), (60_000, 120_000));
    }

    #[test]
    fn value_types_are_collected_per_data_type() {
        let messages = vec![data_message(0, 60, "host-1", Some(1.0))];
        let coalesced = coalesce(messages, Vec::new(), 1_000, 86_400);
        let seen = coalesced.value_types_by_data_type.get("cpu").unwrap();
        assert!(seen.contains("usage_idle"));
    }

    #[test]
    fn event_merge_is_last_writer_wins_within_a_bucket() {
        let events = vec![
            EventMessage {
                data_type: "cpu".into(),
                start: 10,
                end: 20,
                identifier: "host-1".into(),
                affected: Json::Null,
                text: "first".into(),
                event_type: "alert".into(),
            },
            EventMessage {
                data_type: "cpu".into(),
                start: 10,
                end: 20,
                identifier: "host-1".into(),
                affected: Json::Null,
                text: "second".into(),
                event_type: "alert".into(),
            },
        ];
        let coalesced = coalesce(Vec::new(), events, 1_000, 86_400);
        assert_eq!(coalesced.event_buckets.len(), 1);
        assert_eq!(coalesced.event_buckets[0].events.len(), 1);
        assert_eq!(coalesced.event_buckets[0].events[0].text, "second");
    }
}
