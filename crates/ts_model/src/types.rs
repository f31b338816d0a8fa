//! The domain objects: `DataType`, `Measurement`, `DataDocument` (a bucket),
//! `DataPoint`, `EventDocument`, and `Event`.
use std::collections::BTreeMap;

use serde::{
    Deserialize,
    Serialize,
};
use serde_json::Value as Json;

/// Description of a single value type a data type's points may carry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ValueTypeDescriptor {
    pub description: String,
    pub units: String,
}

/// Whether a metadata field is required when upserting a measurement.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MetadataFieldSpec {
    pub required: bool,
}

/// A data type's schema: its known value types and the metadata fields a
/// measurement of this type may carry. Loaded from the `metadata`
/// collection and cached in the in-process registry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DataType {
    pub name: String,
    #[serde(default)]
    pub values: BTreeMap<String, ValueTypeDescriptor>,
    #[serde(default)]
    pub metadata_fields: BTreeMap<String, MetadataFieldSpec>,
}

impl DataType {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            values: BTreeMap::new(),
            metadata_fields: BTreeMap::new(),
        }
    }

    /// The subset of `meta` whose field is declared `required` for this data
    /// type, used when the measurement upserter creates a new record.
    pub fn required_meta<'a>(
        &self,
        meta: &'a BTreeMap<String, Json>,
    ) -> BTreeMap<String, &'a Json> {
        meta.iter()
            .filter(|(field, _)| {
                self.metadata_fields
                    .get(*field)
                    .is_some_and(|spec| spec.required)
            })
            .map(|(field, value)| (field.clone(), value))
            .collect()
    }

    /// Value types present in the batch but not yet declared on this data
    /// type.
    pub fn missing_value_types<'a>(
        &self,
        seen: impl IntoIterator<Item = &'a str>,
    ) -> Vec<&'a str> {
        seen.into_iter()
            .filter(|value_type| !self.values.contains_key(*value_type))
            .collect()
    }
}

/// An active or closed measurement. `end = None` marks the record active;
/// at most one active record may exist per `(data_type, identifier)`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    pub data_type: String,
    pub identifier: String,
    pub start: i64,
    pub end: Option<i64>,
    pub last_updated: i64,
    #[serde(default)]
    pub meta: BTreeMap<String, Json>,
}

impl Measurement {
    pub fn is_active(&self) -> bool {
        self.end.is_none()
    }
}

/// A single sample. `value = None` means "absent" and may be dropped during
/// overlap migration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DataPoint {
    pub time: i64,
    pub interval: i64,
    pub value_type: String,
    pub value: Option<f64>,
}

/// A fixed-width time bucket of data points for one measurement.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DataDocument {
    pub data_type: String,
    pub measurement_identifier: String,
    pub interval: i64,
    pub start: i64,
    pub end: i64,
    #[serde(default)]
    pub value_types: BTreeMap<String, ValueTypeDescriptor>,
    #[serde(default)]
    pub data_points: Vec<DataPoint>,
}

impl DataDocument {
    /// Bucket duration for `interval` seconds and `bucket_size` points per
    /// bucket: `interval * bucket_size`.
    pub fn doc_length(interval: i64, bucket_size: u32) -> i64 {
        interval * i64::from(bucket_size)
    }

    /// The aligned `[start, end)` a timestamp falls into for a given
    /// `doc_length`.
    pub fn bucket_bounds(time: i64, doc_length: i64) -> (i64, i64) {
        let start = (time.div_euclid(doc_length)) * doc_length;
        (start, start + doc_length)
    }

    /// Whether `self` and `other` overlap under the half-open `[start, end)`
    /// convention used throughout the overlap query.
    pub fn overlaps(&self, start: i64, end: i64) -> bool {
        self.start < end && self.end > start
    }
}

/// A single affected-entity event within an event bucket.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub start: i64,
    pub end: i64,
    pub identifier: String,
    #[serde(default)]
    pub affected: Json,
    pub text: String,
    #[serde(rename = "type")]
    pub event_type: String,
}

impl Event {
    /// Identity within a bucket: `(start, identifier)`. A later write with
    /// the same key replaces an earlier one.
    pub fn identity(&self) -> (i64, &str) {
        (self.start, self.identifier.as_str())
    }
}

/// A fixed-width bucket of events for one data type. Bucket
/// duration is the constant `EVENT_DOCUMENT_DURATION`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EventDocument {
    pub data_type: String,
    pub start: i64,
    pub end: i64,
    #[serde(default)]
    pub events: Vec<Event>,
}

impl EventDocument {
    pub fn bucket_bounds(time: i64, event_document_duration: i64) -> (i64, i64) {
        let start = (time.div_euclid(event_document_duration)) * event_document_duration;
        (start, start + event_document_duration)
    }

    /// Overlay `new_events` onto the existing ones, keyed by
    /// `(start, identifier)`; a later write replaces an earlier one.
    pub fn merge(&mut self, new_events: impl IntoIterator<Item = Event>) {
        let mut by_identity: BTreeMap<(i64, String), Event> = std::mem::take(&mut self.events)
            .into_iter()
            .map(|event| ((event.start, event.identifier.clone()), event))
            .collect();
        for event in new_events {
            by_identity.insert((event.start, event.identifier.clone()), event);
        }
        self.events = by_identity.into_values().collect();
    }
}

#[cfg(any(test, feature = "testing"))]
mod proptest_impls {
    use proptest::prelude::*;

    use super::DataPoint;

    impl Arbitrary for DataPoint {
        type Parameters = ();
        type Strategy = BoxedStrategy<Self>;

        fn arbitrary_with(_args: Self::Parameters) -> Self::Strategy {
            (
                0i64..1_000_000_000,
                1i64..3600,
                "[a-z_]{1,12}",
                proptest::option::of(any::<f64>().prop_filter("finite", |v| v.is_finite())),
            )
                .prop_map(|(time, interval, value_type, value)| DataPoint {
                    time,
                    interval,
                    value_type,
                    value,
                })
                .boxed()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_bounds_are_aligned() {
        let doc_length = DataDocument::doc_length(10, 360);
        assert_eq!(doc_length, 3600);
        assert_eq!(DataDocument::bucket_bounds(3650, doc_length), (3600, 7200));
        assert_eq!(DataDocument::bucket_bounds(0, doc_length), (0, 3600));
    }

    #[test]
    fn overlap_is_half_open() {
        let doc = DataDocument {
            data_type: "cpu".into(),
            measurement_identifier: "host-1".into(),
            interval: 10,
            start: 0,
            end: 3600,
            value_types: BTreeMap::new(),
            data_points: Vec::new(),
        };
        assert!(doc.overlaps(3599, 7200));
        assert!(!doc.overlaps(3600, 7200));
    }

    #[test]
    fn event_merge_last_writer_wins() {
        let mut doc = EventDocument {
            data_type: "cpu".into(),
            start: 0,
            end: 86_400,
            events: vec![Event {
                start: 10,
                end: 20,
                identifier: "host-1".into(),
                affected: Json::Null,
                text: "first".into(),
                event_type: "alert".into(),
            }],
        };
        doc.merge(vec![Event {
            start: 10,
            end: 20,
            identifier: "host-1".into(),
            affected: Json::Null,
            text: "second".into(),
            event_type: "alert".into(),
        }]);
        assert_eq!(doc.events.len(), 1);
        assert_eq!(doc.events[0].text, "second");
    }
}
