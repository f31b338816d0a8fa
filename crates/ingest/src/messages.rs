//! Typed messages produced by the decoder and consumed by the coalescer.
//! These are the two variants of the polymorphic message union
//! discriminated by a `.event` suffix on the payload's `type` field.
use std::collections::BTreeMap;

use serde_json::Value as Json;

/// One sample, already tagged with the data type it targets and the
/// measurement identifier it belongs to.
#[derive(Clone, Debug, PartialEq)]
pub struct DataMessage {
    pub data_type: String,
    pub identifier: String,
    pub time: i64,
    pub interval: i64,
    pub values: BTreeMap<String, Option<f64>>,
    pub meta: BTreeMap<String, Json>,
}

/// One affected-entity event, already tagged with the data type it targets.
#[derive(Clone, Debug, PartialEq)]
pub struct EventMessage {
    pub data_type: String,
    pub start: i64,
    pub end: i64,
    pub identifier: String,
    pub affected: Json,
    pub text: String,
    pub event_type: String,
}
