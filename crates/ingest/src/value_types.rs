//! Ensure a data type's metadata document advertises every value
//! type seen in the batch.
use std::collections::BTreeMap;

use cache::Cache;
use common::knobs::{
    DATA_CACHE_EXPIRATION,
    LOCK_RETRIES,
    LOCK_TIMEOUT,
};
use errors::ErrorMetadata;
use lock::DistributedLock;
use store::Store;
use ts_model::{
    keys,
    ValueTypeDescriptor,
};

pub async fn reconcile_value_types(
    store: &dyn Store,
    cache: &dyn Cache,
    lock: &dyn DistributedLock,
    data_type: &str,
    seen: &std::collections::BTreeSet<String>,
) -> anyhow::Result<()> {
    if seen.is_empty() {
        return Ok(());
    }

    let cache_ids: Vec<String> = seen.iter().map(|vt| keys::value_type_id(data_type, vt)).collect();
    let cached = cache.multi_get(&cache_ids).await.unwrap_or_default();
    if cached.len() == cache_ids.len() {
        return Ok(());
    }

    let metadata_lock_key = keys::lock_id(&keys::metadata_id(data_type));
    let guard = lock
        .acquire(&metadata_lock_key, *LOCK_TIMEOUT, *LOCK_RETRIES)
        .await
        .map_err(|e| {
            anyhow::Error::new(ErrorMetadata::overloaded(
                "ValueTypeLockTimeout",
                format!("could not acquire metadata lock for {data_type}: {e:#}"),
            ))
        })?;

    let result = reconcile_locked(store, cache, data_type, seen, &cache_ids).await;

    if let Err(e) = lock.release(guard).await {
        tracing::warn!("failed to release metadata lock {metadata_lock_key}: {e:#}");
    }
    result
}

async fn reconcile_locked(
    store: &dyn Store,
    cache: &dyn Cache,
    data_type: &str,
    seen: &std::collections::BTreeSet<String>,
    cache_ids: &[String],
) -> anyhow::Result<()> {
    let schema = store.find_metadata(data_type).await?.ok_or_else(|| {
        anyhow::Error::new(ErrorMetadata::overloaded(
            "MetadataDocumentMissing",
            format!("metadata document missing for data type {data_type}"),
        ))
    })?;

    let missing = schema.missing_value_types(seen.iter().map(String::as_str));
    if !missing.is_empty() {
        let additions: BTreeMap<String, ValueTypeDescriptor> = missing
            .into_iter()
            .map(|value_type| {
                (
                    value_type.to_owned(),
                    ValueTypeDescriptor {
                        description: value_type.to_owned(),
                        units: value_type.to_owned(),
                    },
                )
            })
            .collect();
        store.add_value_types(data_type, additions).await?;
    }

    for cache_id in cache_ids {
        if let Err(e) = cache.set_with_ttl(cache_id, cache::present(), *DATA_CACHE_EXPIRATION).await {
            tracing::warn!("failed to populate value-type cache entry {cache_id}: {e:#}");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use cache::MemoryCache;
    use lock::MemoryLock;
    use store::MemoryStore;
    use ts_model::DataType;

    use super::*;

    #[tokio::test]
    async fn adds_missing_value_types_and_leaves_existing_ones_alone() {
        let store = MemoryStore::new();
        let cache = MemoryCache::new();
        let lock = MemoryLock::new();
        let mut data_type = DataType::new("cpu");
        data_type.values.insert(
            "usage_idle".to_owned(),
            ValueTypeDescriptor {
                description: "custom".into(),
                units: "percent".into(),
            },
        );
        store.seed_metadata(data_type);

        let seen = BTreeSet::from(["usage_idle".to_owned(), "usage_user".to_owned()]);
        reconcile_value_types(&store, &cache, &lock, "cpu", &seen).await.unwrap();

        let schema = store.find_metadata("cpu").await.unwrap().unwrap();
        assert_eq!(schema.values["usage_idle"].description, "custom");
        assert_eq!(schema.values["usage_user"].description, "usage_user");
    }

    #[tokio::test]
    async fn fully_cached_set_is_a_noop() {
        let store = MemoryStore::new();
        let cache = MemoryCache::new();
        let lock = MemoryLock::new();
        store.seed_metadata(DataType::new("cpu"));

        let seen = BTreeSet::from(["usage_idle".to_owned()]);
        cache
            .set_with_ttl(
                &ts_model::keys::value_type_id("cpu", "usage_idle"),
                cache::present(),
                *DATA_CACHE_EXPIRATION,
            )
            .await
            .unwrap();

        reconcile_value_types(&store, &cache, &lock, "cpu", &seen).await.unwrap();
        let schema = store.find_metadata("cpu").await.unwrap().unwrap();
        assert!(schema.values.is_empty());
    }

    #[tokio::test]
    async fn missing_metadata_document_is_transient() {
        let store = MemoryStore::new();
        let cache = MemoryCache::new();
        let lock = MemoryLock::new();
        let seen = BTreeSet::from(["usage_idle".to_owned()]);

        let err = reconcile_value_types(&store, &cache, &lock, "cpu", &seen)
            .await
            .unwrap_err();
        assert!(errors::ErrorMetadataAnyhowExt::is_overloaded(&err));
    }
}
