//! The ingestion pipeline: decode a batch, coalesce it into measurements,
//! value types, and buckets, then commit each piece to the store. Wired
//! together here; each stage's own module owns its algorithm and tests.
pub mod coalesce;
pub mod data_writer;
pub mod decoder;
pub mod event_writer;
pub mod measurement;
pub mod messages;
pub mod metrics;
pub mod registry;
pub mod value_types;

use std::sync::Arc;

use cache::Cache;
use common::knobs::{
    EVENT_DOCUMENT_DURATION,
    HIGH_RESOLUTION_DOCUMENT_SIZE,
};
use lock::DistributedLock;
use serde_json::Value as Json;
use store::Store;

use crate::registry::DataTypeRegistry;

/// The per-worker set of backend collaborators plus the in-process data-type
/// registry, threaded through every stage of `process_batch`.
pub struct IngestContext {
    pub store: Arc<dyn Store>,
    pub cache: Arc<dyn Cache>,
    pub lock: Arc<dyn DistributedLock>,
    pub registry: DataTypeRegistry,
}

impl IngestContext {
    pub fn new(
        store: Arc<dyn Store>,
        cache: Arc<dyn Cache>,
        lock: Arc<dyn DistributedLock>,
        ignore_databases: Vec<String>,
    ) -> Self {
        Self {
            store,
            cache,
            lock,
            registry: DataTypeRegistry::new(ignore_databases),
        }
    }
}

/// Run a single decoded top-level JSON array through the full ingestion
/// pipeline. Returns
/// `Ok(())` once every measurement/bucket in the batch has been committed;
/// an `Err` here is always classified via `ErrorMetadataAnyhowExt` by the
/// caller to decide ack vs. requeue.
pub async fn process_batch(ctx: &IngestContext, items: Vec<Json>) -> anyhow::Result<()> {
    let decoded = decoder::decode_batch(items, &ctx.registry, ctx.store.as_ref()).await?;

    let coalesced = coalesce::coalesce(
        decoded.data_messages,
        decoded.event_messages,
        *HIGH_RESOLUTION_DOCUMENT_SIZE,
        i64::try_from(*EVENT_DOCUMENT_DURATION).expect("EVENT_DOCUMENT_DURATION fits in i64"),
    );

    for coalesced_measurement in &coalesced.measurements {
        let Some(data_type) = ctx.registry.get(&coalesced_measurement.data_type) else {
            tracing::warn!(
                "skipping measurement for data type {} with no registry entry",
                coalesced_measurement.data_type
            );
            continue;
        };
        measurement::upsert_measurement(
            ctx.store.as_ref(),
            ctx.cache.as_ref(),
            ctx.lock.as_ref(),
            &data_type,
            coalesced_measurement,
        )
        .await?;
    }

    for (data_type_name, seen) in &coalesced.value_types_by_data_type {
        value_types::reconcile_value_types(
            ctx.store.as_ref(),
            ctx.cache.as_ref(),
            ctx.lock.as_ref(),
            data_type_name,
            seen,
        )
        .await?;
    }

    for bucket in &coalesced.data_buckets {
        let Some(data_type) = ctx.registry.get(&bucket.data_type) else {
            tracing::warn!("skipping data bucket for data type {} with no registry entry", bucket.data_type);
            continue;
        };
        data_writer::write_data_bucket(
            ctx.store.as_ref(),
            ctx.cache.as_ref(),
            ctx.lock.as_ref(),
            &data_type,
            bucket,
        )
        .await?;
    }

    for bucket in &coalesced.event_buckets {
        event_writer::write_event_bucket(ctx.store.as_ref(), ctx.cache.as_ref(), ctx.lock.as_ref(), bucket).await?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use cache::MemoryCache;
    use lock::MemoryLock;
    use serde_json::json;
    use store::MemoryStore;
    use ts_model::DataType;

    use super::*;

    #[tokio::test]
    async fn end_to_end_batch_creates_measurement_and_bucket() {
        let memory_store = MemoryStore::new();
        memory_store.seed_metadata(DataType::new("cpu"));
        let store: Arc<dyn Store> = Arc::new(memory_store);
        let cache: Arc<dyn Cache> = Arc::new(MemoryCache::new());
        let lock: Arc<dyn DistributedLock> = Arc::new(MemoryLock::new());

        let ctx = IngestContext::new(store.clone(), cache, lock, Vec::new());
        ctx.registry.refresh(store.as_ref()).await.unwrap();

        let items = vec![json!({
            "type": "cpu",
            "time": 61_000,
            "interval": 60,
            "identifier": "host-1",
            "values": {"usage_idle": 42.0},
            "meta": {"host": "host-1"},
        })];
        process_batch(&ctx, items).await.unwrap();

        let active = store.find_active_measurement("cpu", "host-1").await.unwrap();
        assert!(active.is_some());
        let schema = store.find_metadata("cpu").await.unwrap().unwrap();
        assert!(schema.values.contains_key("usage_idle"));
    }

    #[tokio::test]
    async fn batch_with_only_unknown_data_types_is_a_noop_success() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let cache: Arc<dyn Cache> = Arc::new(MemoryCache::new());
        let lock: Arc<dyn DistributedLock> = Arc::new(MemoryLock::new());
        let ctx = IngestContext::new(store, cache, lock, Vec::new());

        let items = vec![json!({"type": "unknown", "time": 0, "interval": 60, "identifier": "x"})];
        process_batch(&ctx, items).await.unwrap();
    }
}
