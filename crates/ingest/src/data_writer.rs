//! The data-bucket writer. Per coalesced bucket, either merges into an
//! existing document (UPDATE) or, when none exists yet, reconciles any
//! buckets an interval change has made it overlap (CREATE).
use std::collections::BTreeMap;

use cache::Cache;
use common::knobs::{
    DATA_CACHE_EXPIRATION,
    HIGH_RESOLUTION_DOCUMENT_SIZE,
    LOCK_RETRIES,
    LOCK_TIMEOUT,
};
use errors::ErrorMetadata;
use lock::{
    DistributedLock,
    LockGuard,
};
use serde_json::Value as Json;
use store::{
    Store,
    StoreId,
};
use ts_model::{
    keys,
    DataDocument,
    DataPoint,
    DataType,
    ValueTypeDescriptor,
};

use crate::coalesce::CoalescedBucket;

fn cache_value(value_types: &BTreeMap<String, ValueTypeDescriptor>) -> Json {
    serde_json::json!({ "value_types": value_types })
}

#[cfg(test)]
fn parse_cached_value_types(value: &Json) -> Option<BTreeMap<String, ValueTypeDescriptor>> {
    value
        .get("value_types")
        .and_then(|v| serde_json::from_value(v.clone()).ok())
}

fn descriptor_for(data_type: &DataType, value_type: &str) -> ValueTypeDescriptor {
    data_type.values.get(value_type).cloned().unwrap_or_else(|| ValueTypeDescriptor {
        description: value_type.to_owned(),
        units: value_type.to_owned(),
    })
}

pub async fn write_data_bucket(
    store: &dyn Store,
    cache: &dyn Cache,
    lock: &dyn DistributedLock,
    data_type: &DataType,
    bucket: &CoalescedBucket,
) -> anyhow::Result<()> {
    let cache_id = keys::data_bucket_id(&bucket.data_type, &bucket.identifier, bucket.start, bucket.end);
    let lock_key = keys::lock_id(&cache_id);
    let guard = lock.acquire(&lock_key, *LOCK_TIMEOUT, *LOCK_RETRIES).await.map_err(|e| {
        anyhow::Error::new(ErrorMetadata::overloaded(
            "DataBucketLockTimeout",
            format!("could not acquire data bucket lock {lock_key}: {e:#}"),
        ))
    })?;

    let result = write_data_bucket_locked(store, cache, lock, data_type, bucket, &cache_id).await;

    if let Err(e) = lock.release(guard).await {
        tracing::warn!("failed to release data bucket lock {lock_key}: {e:#}");
    }
    result
}

async fn write_data_bucket_locked(
    store: &dyn Store,
    cache: &dyn Cache,
    lock: &dyn DistributedLock,
    data_type: &DataType,
    bucket: &CoalescedBucket,
    cache_id: &str,
) -> anyhow::Result<()> {
    let cached = cache.get(cache_id).await.unwrap_or(None);
    let existing = store
        .find_data_bucket(&bucket.data_type, &bucket.identifier, bucket.start, bucket.end)
        .await?;

    match (cached, existing) {
        (_, Some((id, doc))) => update_bucket(store, cache, data_type, bucket, cache_id, id, doc).await,
        // A cache hit naming a bucket the store no longer has is a stale
        // entry (e.g. reconciled away by another worker); fall through to
        // CREATE rather than trust it blindly.
        (_, None) => create_bucket(store, cache, lock, data_type, bucket).await,
    }
}

async fn update_bucket(
    store: &dyn Store,
    cache: &dyn Cache,
    data_type: &DataType,
    bucket: &CoalescedBucket,
    cache_id: &str,
    id: StoreId,
    mut doc: DataDocument,
) -> anyhow::Result<()> {
    for value_type in &bucket.value_types {
        doc.value_types
            .entry(value_type.clone())
            .or_insert_with(|| descriptor_for(data_type, value_type));
    }

    // Merge by (time, value_type) rather than appending so that redelivering
    // the same batch -- or a second writer landing on the same bucket -- is
    // idempotent: the incoming point always wins over whatever was already
    // stored at that key.
    let mut merged: BTreeMap<(i64, String), DataPoint> = doc
        .data_points
        .into_iter()
        .map(|p| ((p.time, p.value_type.clone()), p))
        .collect();
    for point in &bucket.points {
        merged.insert((point.time, point.value_type.clone()), point.clone());
    }
    doc.data_points = merged.into_values().collect();

    store.update_data_bucket(&bucket.data_type, &id, doc.clone()).await?;

    if let Err(e) = cache.set_with_ttl(cache_id, cache_value(&doc.value_types), *DATA_CACHE_EXPIRATION).await {
        tracing::warn!("failed to populate data bucket cache entry {cache_id}: {e:#}");
    }
    Ok(())
}

struct MigratedBucket {
    points: BTreeMap<(i64, String), DataPoint>,
    value_types: BTreeMap<String, ValueTypeDescriptor>,
}

/// The CREATE path: query overlapping buckets, migrate their points under
/// the new interval, write the union of new buckets, then delete the old
/// ones. Guarded by a lock per overlapping bucket in addition to `D`'s own
/// (already held by the caller).
async fn create_bucket(
    store: &dyn Store,
    cache: &dyn Cache,
    lock: &dyn DistributedLock,
    data_type: &DataType,
    bucket: &CoalescedBucket,
) -> anyhow::Result<()> {
    let mut overlaps = store
        .find_overlapping_data_buckets(&bucket.data_type, &bucket.identifier, bucket.start, bucket.end)
        .await?;
    // Deterministic order across workers avoids cross-worker lock-order deadlock.
    overlaps.sort_by_key(|(_, doc)| (doc.start, doc.end));

    let mut overlap_locks: Vec<(String, LockGuard)> = Vec::with_capacity(overlaps.len());
    for (_, doc) in &overlaps {
        let overlap_cache_id = keys::data_bucket_id(&bucket.data_type, &bucket.identifier, doc.start, doc.end);
        let overlap_lock_key = keys::lock_id(&overlap_cache_id);
        match lock.acquire(&overlap_lock_key, *LOCK_TIMEOUT, *LOCK_RETRIES).await {
            Ok(guard) => overlap_locks.push((overlap_lock_key, guard)),
            Err(e) => {
                release_overlap_locks(lock, overlap_locks).await;
                return Err(anyhow::Error::new(ErrorMetadata::overloaded(
                    "OverlapLockTimeout",
                    format!("could not acquire overlap lock {overlap_lock_key}: {e:#}"),
                )));
            },
        }
    }

    let result = reconcile_overlaps(store, cache, data_type, bucket, overlaps).await;

    release_overlap_locks(lock, overlap_locks).await;
    result
}

async fn release_overlap_locks(lock: &dyn DistributedLock, guards: Vec<(String, LockGuard)>) {
    for (key, guard) in guards {
        if let Err(e) = lock.release(guard).await {
            tracing::warn!("failed to release overlap lock {key}: {e:#}");
        }
    }
}

async fn reconcile_overlaps(
    store: &dyn Store,
    cache: &dyn Cache,
    data_type: &DataType,
    bucket: &CoalescedBucket,
    overlaps: Vec<(StoreId, DataDocument)>,
) -> anyhow::Result<()> {
    let doc_length = DataDocument::doc_length(bucket.interval, *HIGH_RESOLUTION_DOCUMENT_SIZE);
    let own_key = (bucket.start, bucket.end);

    let mut migrated: BTreeMap<(i64, i64), MigratedBucket> = BTreeMap::new();
    let own_value_types: BTreeMap<String, ValueTypeDescriptor> = bucket
        .value_types
        .iter()
        .map(|vt| (vt.clone(), descriptor_for(data_type, vt)))
        .collect();
    let own_entry = migrated.entry(own_key).or_insert_with(|| MigratedBucket {
        points: BTreeMap::new(),
        value_types: own_value_types,
    });
    for point in &bucket.points {
        own_entry
            .points
            .insert((point.time, point.value_type.clone()), point.clone());
    }

    let mut old_cache_ids = Vec::with_capacity(overlaps.len());
    let mut old_ids = Vec::with_capacity(overlaps.len());
    for (id, old_doc) in overlaps {
        old_cache_ids.push(keys::data_bucket_id(&bucket.data_type, &bucket.identifier, old_doc.start, old_doc.end));
        old_ids.push(id);

        for point in old_doc.data_points {
            let (new_start, new_end) = DataDocument::bucket_bounds(point.time, doc_length);
            let key = (new_start, new_end);
            let entry = migrated.entry(key).or_insert_with(|| MigratedBucket {
                points: BTreeMap::new(),
                value_types: old_doc.value_types.clone(),
            });
            entry.value_types.extend(old_doc.value_types.clone());

            let point_key = (point.time, point.value_type.clone());
            if key == own_key && entry.points.contains_key(&point_key) {
                // D always wins over a migrated point at the same timestamp.
                continue;
            }
            if let Some(value) = point.value {
                entry.points.insert(
                    point_key,
                    DataPoint {
                        time: point.time,
                        interval: bucket.interval,
                        value_type: point.value_type,
                        value: Some(value),
                    },
                );
            }
        }
    }

    let new_docs: Vec<DataDocument> = migrated
        .iter()
        .map(|((start, end), migrated_bucket)| DataDocument {
            data_type: bucket.data_type.clone(),
            measurement_identifier: bucket.identifier.clone(),
            interval: bucket.interval,
            start: *start,
            end: *end,
            value_types: migrated_bucket.value_types.clone(),
            data_points: migrated_bucket.points.values().cloned().collect(),
        })
        .collect();

    store.insert_data_buckets(&bucket.data_type, new_docs.clone()).await?;

    // New-bucket cache entries must land before the stale entries are
    // deleted: a concurrent reader racing on an old id is always safe since
    // its replacement is already visible.
    for doc in &new_docs {
        let doc_cache_id = keys::data_bucket_id(&bucket.data_type, &bucket.identifier, doc.start, doc.end);
        if let Err(e) = cache
            .set_with_ttl(&doc_cache_id, cache_value(&doc.value_types), *DATA_CACHE_EXPIRATION)
            .await
        {
            tracing::warn!("failed to populate data bucket cache entry {doc_cache_id}: {e:#}");
        }
    }

    store.delete_data_buckets(&bucket.data_type, &old_ids).await?;
    for old_cache_id in old_cache_ids {
        if let Err(e) = cache.delete(&old_cache_id).await {
            tracing::warn!("failed to delete stale data bucket cache entry {old_cache_id}: {e:#}");
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
    use ts_model::DataPoint;

    use super::*;

    fn point(time: i64, interval: i64, value_type: &str, value: Option<f64>) -> DataPoint {
        DataPoint {
            time,
            interval,
            value_type: value_type.into(),
            value,
        }
    }

    fn bucket(start: i64, end: i64, interval: i64, points: Vec<DataPoint>) -> CoalescedBucket {
        CoalescedBucket {
            data_type: "cpu".into(),
            identifier: "host-1".into(),
            interval,
            start,
            end,
            points,
            value_types: BTreeSet::from(["usage_idle".to_owned()]),
        }
    }

    #[test]
    fn cache_value_roundtrips() {
        let value_types = BTreeMap::from([(
            "usage_idle".to_owned(),
            ValueTypeDescriptor {
                description: "d".into(),
                units: "u".into(),
            },
        )]);
        let json = cache_value(&value_types);
        let parsed = parse_cached_value_types(&json).unwrap();
        assert_eq!(parsed, value_types);
    }

    #[tokio::test]
    async fn create_path_writes_a_fresh_bucket_when_none_overlaps() {
        let store = MemoryStore::new();
        let cache = MemoryCache::new();
        let lock = MemoryLock::new();
        let data_type = DataType::new("cpu");

        let b = bucket(0, 3600, 10, vec![point(0, 10, "usage_idle", Some(1.0))]);
        write_data_bucket(&store, &cache, &lock, &data_type, &b).await.unwrap();

        let (_, doc) = store.find_data_bucket("cpu", "host-1", 0, 3600).await.unwrap().unwrap();
        assert_eq!(doc.data_points.len(), 1);
    }

    #[tokio::test]
    async fn update_path_appends_points_to_an_existing_bucket() {
        let store = MemoryStore::new();
        let cache = MemoryCache::new();
        let lock = MemoryLock::new();
        let data_type = DataType::new("cpu");

        let first = bucket(0, 3600, 10, vec![point(0, 10, "usage_idle", Some(1.0))]);
        write_data_bucket(&store, &cache, &lock, &data_type, &first).await.unwrap();
        let second = bucket(0, 3600, 10, vec![point(10, 10, "usage_idle", Some(2.0))]);
        write_data_bucket(&store, &cache, &lock, &data_type, &second).await.unwrap();

        let (_, doc) = store.find_data_bucket("cpu", "host-1", 0, 3600).await.unwrap().unwrap();
        assert_eq!(doc.data_points.len(), 2);
    }

    #[tokio::test]
    async fn redelivering_the_same_batch_does_not_duplicate_points() {
        let store = MemoryStore::new();
        let cache = MemoryCache::new();
        let lock = MemoryLock::new();
        let data_type = DataType::new("cpu");

        let b = bucket(0, 3600, 10, vec![point(0, 10, "usage_idle", Some(1.0))]);
        write_data_bucket(&store, &cache, &lock, &data_type, &b).await.unwrap();
        // Redelivery: the exact same coalesced bucket lands again.
        write_data_bucket(&store, &cache, &lock, &data_type, &b).await.unwrap();

        let (_, doc) = store.find_data_bucket("cpu", "host-1", 0, 3600).await.unwrap().unwrap();
        assert_eq!(doc.data_points.len(), 1);
        assert_eq!(doc.data_points[0].value, Some(1.0));
    }

    #[tokio::test]
    async fn second_writer_at_the_same_time_and_value_type_wins_last_writer() {
        let store = MemoryStore::new();
        let cache = MemoryCache::new();
        let lock = MemoryLock::new();
        let data_type = DataType::new("cpu");

        let first = bucket(0, 3600, 10, vec![point(0, 10, "usage_idle", Some(1.0))]);
        write_data_bucket(&store, &cache, &lock, &data_type, &first).await.unwrap();
        let second = bucket(0, 3600, 10, vec![point(0, 10, "usage_idle", Some(9.0))]);
        write_data_bucket(&store, &cache, &lock, &data_type, &second).await.unwrap();

        let (_, doc) = store.find_data_bucket("cpu", "host-1", 0, 3600).await.unwrap().unwrap();
        assert_eq!(doc.data_points.len(), 1);
        assert_eq!(doc.data_points[0].value, Some(9.0));
    }

    #[tokio::test]
    async fn create_path_migrates_overlapping_points_under_the_new_interval() {
        let store = MemoryStore::new();
        let cache = MemoryCache::new();
        let lock = MemoryLock::new();
        let data_type = DataType::new("cpu");

        // Old bucket at interval 10 spans [0, 3600).
        let old = DataDocument {
            data_type: "cpu".into(),
            measurement_identifier: "host-1".into(),
            interval: 10,
            start: 0,
            end: 3600,
            value_types: BTreeMap::from([(
                "usage_idle".to_owned(),
                ValueTypeDescriptor {
                    description: "usage_idle".into(),
                    units: "usage_idle".into(),
                },
            )]),
            data_points: vec![point(100, 10, "usage_idle", Some(9.0)), point(200, 10, "usage_idle", None)],
        };
        store.insert_data_buckets("cpu", vec![old]).await.unwrap();

        // New bucket at interval 60 covers [0, 21_600) -- overlaps the old [0, 3600) bucket.
        let new_doc_length = DataDocument::doc_length(60, *HIGH_RESOLUTION_DOCUMENT_SIZE);
        let d = bucket(0, new_doc_length, 60, vec![point(0, 60, "usage_idle", Some(1.0))]);
        write_data_bucket(&store, &cache, &lock, &data_type, &d).await.unwrap();

        // The old bucket is gone...
        assert!(store.find_data_bucket("cpu", "host-1", 0, 3600).await.unwrap().is_none());
        // ...and its non-null point was migrated into a bucket sized for interval 60.
        let new_doc_length = DataDocument::doc_length(60, *HIGH_RESOLUTION_DOCUMENT_SIZE);
        let (migrated_start, migrated_end) = DataDocument::bucket_bounds(100, new_doc_length);
        let (_, migrated) = store
            .find_data_bucket("cpu", "host-1", migrated_start, migrated_end)
            .await
            .unwrap()
            .unwrap();
        assert!(migrated.data_points.iter().any(|p| p.time == 100 && p.value == Some(9.0)));
        // The null-valued point was dropped but the bucket's value_types are unchanged.
        assert!(!migrated.data_points.iter().any(|p| p.time == 200));
    }
}
