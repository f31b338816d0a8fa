//! Validate a batch envelope, classify each item as a data- or
//! event-message, and construct the typed messages the coalescer consumes.
use std::sync::LazyLock;

use errors::ErrorMetadata;
use regex::Regex;
use serde_json::{
    Map,
    Value as Json,
};

use crate::{
    messages::{
        DataMessage,
        EventMessage,
    },
    metrics::log_dropped_message,
    registry::DataTypeRegistry,
};

static EVENT_TYPE_SUFFIX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^(.+)\.event$").unwrap());

/// The two ordered sequences produced by decoding a batch.
#[derive(Default)]
pub struct DecodedBatch {
    pub data_messages: Vec<DataMessage>,
    pub event_messages: Vec<EventMessage>,
}

/// `type` classified into the data type it names and whether it's the
/// `.event` variant.
fn classify(type_field: &str) -> (String, bool) {
    match EVENT_TYPE_SUFFIX.captures(type_field) {
        Some(caps) => (caps[1].to_owned(), true),
        None => (type_field.to_owned(), false),
    }
}

/// Decode and validate every item of a batch, resolving unknown data types
/// against `registry`, refreshing it from `store` at most once per batch.
///
/// Per-item malformation (not an object, missing `type`, an unknown data
/// type even after a refresh, a malformed typed message) is logged and the
/// item is dropped. A registry refresh failure aborts the whole batch with
/// a transient (`Overloaded`) error, since some items may legitimately
/// belong to a type that only a refresh would reveal.
pub async fn decode_batch(
    items: Vec<Json>,
    registry: &DataTypeRegistry,
    store: &dyn store::Store,
) -> anyhow::Result<DecodedBatch> {
    let mut batch = DecodedBatch::default();
    let mut refreshed = false;

    for item in items {
        let Json::Object(obj) = item else {
            tracing::warn!("dropping non-object batch item");
            log_dropped_message("not_an_object");
            continue;
        };
        let Some(type_field) = obj.get("type").and_then(Json::as_str) else {
            tracing::warn!("dropping batch item with no `type` field");
            log_dropped_message("missing_type");
            continue;
        };
        let (data_type_name, is_event) = classify(type_field);

        if registry.get(&data_type_name).is_none() {
            if !refreshed {
                registry.refresh(store).await.map_err(|e| {
                    anyhow::Error::new(ErrorMetadata::overloaded(
                        "DataTypeRegistryRefreshFailed",
                        format!("failed to refresh data type registry: {e:#}"),
                    ))
                    .context(e)
                })?;
                refreshed = true;
            }
            if registry.get(&data_type_name).is_none() {
                tracing::warn!("dropping batch item for unknown data type {data_type_name}");
                log_dropped_message("unknown_data_type");
                continue;
            }
        }

        if is_event {
            match construct_event_message(&data_type_name, &obj) {
                Ok(message) => batch.event_messages.push(message),
                Err(e) => {
                    tracing::warn!("dropping malformed event message: {e:#}");
                    log_dropped_message("malformed_event");
                },
            }
        } else {
            match construct_data_message(&data_type_name, &obj) {
                Ok(message) => batch.data_messages.push(message),
                Err(e) => {
                    tracing::warn!("dropping malformed data message: {e:#}");
                    log_dropped_message("malformed_data");
                },
            }
        }
    }

    Ok(batch)
}

fn require_str<'a>(obj: &'a Map<String, Json>, field: &str) -> anyhow::Result<&'a str> {
    obj.get(field)
        .and_then(Json::as_str)
        .ok_or_else(|| anyhow::anyhow!("missing or non-string field `{field}`"))
}

fn require_i64(obj: &Map<String, Json>, field: &str) -> anyhow::Result<i64> {
    obj.get(field)
        .and_then(Json::as_f64)
        .map(|n| n as i64)
        .ok_or_else(|| anyhow::anyhow!("missing or non-numeric field `{field}`"))
}

fn construct_data_message(data_type_name: &str, obj: &Map<String, Json>) -> anyhow::Result<DataMessage> {
    let time = require_i64(obj, "time")?;
    let interval = require_i64(obj, "interval")?;
    let identifier = require_str(obj, "identifier")?.to_owned();
    let values = obj
        .get("values")
        .and_then(Json::as_object)
        .map(|values| values.iter().map(|(k, v)| (k.clone(), v.as_f64())).collect())
        .unwrap_or_default();
    let meta = obj
        .get("meta")
        .and_then(Json::as_object)
        .cloned()
        .unwrap_or_default()
        .into_iter()
        .collect();
    Ok(DataMessage {
        data_type: data_type_name.to_owned(),
        identifier,
        time,
        interval,
        values,
        meta,
    })
}

fn construct_event_message(data_type_name: &str, obj: &Map<String, Json>) -> anyhow::Result<EventMessage> {
    let start = require_i64(obj, "start")?;
    let end = require_i64(obj, "end")?;
    let identifier = require_str(obj, "identifier")?.to_owned();
    let text = require_str(obj, "text")?.to_owned();
    let event_type = require_str(obj, "event_type")?.to_owned();
    let affected = obj.get("affected").cloned().unwrap_or(Json::Null);
    Ok(EventMessage {
        data_type: data_type_name.to_owned(),
        start,
        end,
        identifier,
        affected,
        text,
        event_type,
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use store::MemoryStore;
    use ts_model::DataType;

    use super::*;
    use crate::registry::DataTypeRegistry;

    #[tokio::test]
    async fn classifies_event_suffix() {
        let store = MemoryStore::new();
        store.seed_metadata(DataType::new("cpu"));
        let registry = DataTypeRegistry::new(Vec::new());
        registry.refresh(&store).await.unwrap();

        let items = vec![json!({
            "type": "cpu.event",
            "start": 0,
            "end": 60,
            "identifier": "host-1",
            "text": "reboot",
            "event_type": "alert",
        })];
        let decoded = decode_batch(items, &registry, &store).await.unwrap();
        assert_eq!(decoded.event_messages.len(), 1);
        assert!(decoded.data_messages.is_empty());
        assert_eq!(decoded.event_messages[0].data_type, "cpu");
    }

    #[tokio::test]
    async fn unknown_data_type_triggers_one_refresh_then_is_dropped() {
        let store = MemoryStore::new();
        let registry = DataTypeRegistry::new(Vec::new());
        let items = vec![json!({"type": "cpu", "time": 1, "interval": 60, "identifier": "host-1"})];
        let decoded = decode_batch(items, &registry, &store).await.unwrap();
        assert!(decoded.data_messages.is_empty());
    }

    #[tokio::test]
    async fn non_object_and_missing_type_are_dropped() {
        let store = MemoryStore::new();
        let registry = DataTypeRegistry::new(Vec::new());
        let items = vec![json!("not an object"), json!({"time": 1})];
        let decoded = decode_batch(items, &registry, &store).await.unwrap();
        assert!(decoded.data_messages.is_empty());
        assert!(decoded.event_messages.is_empty());
    }

    #[tokio::test]
    async fn malformed_event_message_is_dropped_without_aborting_batch() {
        let store = MemoryStore::new();
        store.seed_metadata(DataType::new("cpu"));
        let registry = DataTypeRegistry::new(Vec::new());
        registry.refresh(&store).await.unwrap();

        // Missing `identifier`.
        let items = vec![json!({
            "type": "cpu.event",
            "start": 0,
            "end": 60,
            "text": "reboot",
            "event_type": "alert",
        })];
        let decoded = decode_batch(items, &registry, &store).await.unwrap();
        assert!(decoded.event_messages.is_empty());
    }

    #[tokio::test]
    async fn valid_data_message_decodes() {
        let store = MemoryStore::new();
        store.seed_metadata(DataType::new("cpu"));
        let registry = DataTypeRegistry::new(Vec::new());
        registry.refresh(&store).await.unwrap();

        let items = vec![json!({
            "type": "cpu",
            "time": 61_000,
            "interval": 60,
            "identifier": "host-1",
            "values": {"usage_idle": 42.0, "usage_user": Json::Null},
            "meta": {"host": "host-1"},
        })];
        let decoded = decode_batch(items, &registry, &store).await.unwrap();
        assert_eq!(decoded.data_messages.len(), 1);
        let msg = &decoded.data_messages[0];
        assert_eq!(msg.time, 61_000);
        assert_eq!(msg.values.get("usage_idle"), Some(&Some(42.0)));
        assert_eq!(msg.values.get("usage_user"), Some(&None));
    }
}
