//! For each distinct measurement sighted in a batch, ensure an active
//! record exists in the store, gated by the cache so a hot measurement
//! doesn't take the lock/store round-trip on every batch.
use std::time::Duration;

use cache::Cache;
use common::knobs::{
    LOCK_RETRIES,
    LOCK_TIMEOUT,
    MEASUREMENT_CACHE_EXPIRATION,
};
use errors::ErrorMetadata;
use lock::DistributedLock;
use store::Store;
use ts_model::{
    keys,
    DataType,
    Measurement,
};

use crate::coalesce::CoalescedMeasurement;

/// `max(MEASUREMENT_CACHE_EXPIRATION, interval * 2)` -- favors a lower
/// bound, so a slowly sampled measurement is never cache-forgotten between
/// updates.
pub fn cache_ttl_for_interval(interval: i64) -> Duration {
    let min_secs = i64::try_from(MEASUREMENT_CACHE_EXPIRATION.as_secs()).unwrap_or(i64::MAX);
    Duration::from_secs(min_secs.max(interval.saturating_mul(2)).max(0) as u64)
}

pub async fn upsert_measurement(
    store: &dyn Store,
    cache: &dyn Cache,
    lock: &dyn DistributedLock,
    data_type: &DataType,
    measurement: &CoalescedMeasurement,
) -> anyhow::Result<()> {
    let cache_id = keys::measurement_id(&measurement.data_type, &measurement.identifier);
    if cache.get(&cache_id).await.unwrap_or(None).is_some() {
        return Ok(());
    }

    let lock_key = keys::lock_id(&cache_id);
    let guard = lock
        .acquire(&lock_key, *LOCK_TIMEOUT, *LOCK_RETRIES)
        .await
        .map_err(|e| {
            anyhow::Error::new(ErrorMetadata::overloaded(
                "MeasurementLockTimeout",
                format!("could not acquire measurement lock {lock_key}: {e:#}"),
            ))
        })?;

    let result = upsert_measurement_locked(store, cache, data_type, measurement, &cache_id).await;

    if let Err(e) = lock.release(guard).await {
        tracing::warn!("failed to release measurement lock {lock_key}: {e:#}");
    }
    result
}

async fn upsert_measurement_locked(
    store: &dyn Store,
    cache: &dyn Cache,
    data_type: &DataType,
    measurement: &CoalescedMeasurement,
    cache_id: &str,
) -> anyhow::Result<()> {
    let ttl = cache_ttl_for_interval(measurement.interval);
    if store
        .find_active_measurement(&measurement.data_type, &measurement.identifier)
        .await?
        .is_some()
    {
        fill_cache(cache, cache_id, ttl).await;
        return Ok(());
    }

    let required_meta = data_type
        .required_meta(&measurement.meta)
        .into_iter()
        .map(|(field, value)| (field, value.clone()))
        .collect();
    let record = Measurement {
        data_type: measurement.data_type.clone(),
        identifier: measurement.identifier.clone(),
        start: measurement.start,
        end: None,
        last_updated: measurement.start,
        meta: required_meta,
    };
    store.insert_measurement(&measurement.data_type, record).await?;
    fill_cache(cache, cache_id, ttl).await;
    Ok(())
}

/// A cache failure is never fatal -- best-effort, logged, not propagated.
async fn fill_cache(cache: &dyn Cache, cache_id: &str, ttl: Duration) {
    if let Err(e) = cache.set_with_ttl(cache_id, cache::present(), ttl).await {
        tracing::warn!("failed to populate measurement cache entry {cache_id}: {e:#}");
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use cache::MemoryCache;
    use lock::MemoryLock;
    use store::MemoryStore;
    use ts_model::{
        DataType,
        MetadataFieldSpec,
    };

    use super::*;

    fn measurement(interval: i64) -> CoalescedMeasurement {
        CoalescedMeasurement {
            data_type: "cpu".into(),
            identifier: "host-1".into(),
            start: 61_000,
            interval,
            meta: BTreeMap::from([
                ("host".to_owned(), serde_json::json!("host-1")),
                ("note".to_owned(), serde_json::json!("irrelevant")),
            ]),
        }
    }

    #[tokio::test]
    async fn creates_a_new_active_measurement_with_only_required_meta() {
        let store = MemoryStore::new();
        let cache = MemoryCache::new();
        let lock = MemoryLock::new();
        let mut data_type = DataType::new("cpu");
        data_type
            .metadata_fields
            .insert("host".to_owned(), MetadataFieldSpec { required: true });
        store.seed_metadata(data_type.clone());

        upsert_measurement(&store, &cache, &lock, &data_type, &measurement(60))
            .await
            .unwrap();

        let active = store.find_active_measurement("cpu", "host-1").await.unwrap().unwrap();
        assert_eq!(active.start, 61_000);
        assert!(active.is_active());
        assert!(active.meta.contains_key("host"));
        assert!(!active.meta.contains_key("note"));
    }

    #[tokio::test]
    async fn second_call_is_a_cache_short_circuit() {
        let store = MemoryStore::new();
        let cache = MemoryCache::new();
        let lock = MemoryLock::new();
        let data_type = DataType::new("cpu");
        store.seed_metadata(data_type.clone());

        upsert_measurement(&store, &cache, &lock, &data_type, &measurement(60))
            .await
            .unwrap();
        // A second identical call must not insert a duplicate record.
        upsert_measurement(&store, &cache, &lock, &data_type, &measurement(60))
            .await
            .unwrap();

        assert!(cache
            .get(&ts_model::keys::measurement_id("cpu", "host-1"))
            .await
            .unwrap()
            .is_some());
    }

    #[test]
    fn cache_ttl_is_the_max_of_default_and_interval_times_two() {
        assert_eq!(cache_ttl_for_interval(60), MEASUREMENT_CACHE_EXPIRATION.max(Duration::from_secs(120)));
        assert_eq!(cache_ttl_for_interval(10_000), Duration::from_secs(20_000));
    }
}
