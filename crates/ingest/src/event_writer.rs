//! The event-bucket writer. Merges new events into an existing bucket
//! keyed by `(start, identifier)`, or creates one if none exists yet.
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
    EventDocument,
};

use crate::coalesce::CoalescedEventBucket;

pub async fn write_event_bucket(
    store: &dyn Store,
    cache: &dyn Cache,
    lock: &dyn DistributedLock,
    bucket: &CoalescedEventBucket,
) -> anyhow::Result<()> {
    let cache_id = keys::event_bucket_id(&bucket.data_type, bucket.start, bucket.end);
    let lock_key = keys::lock_id(&cache_id);
    let guard = lock.acquire(&lock_key, *LOCK_TIMEOUT, *LOCK_RETRIES).await.map_err(|e| {
        anyhow::Error::new(ErrorMetadata::overloaded(
            "EventBucketLockTimeout",
            format!("could not acquire event bucket lock {lock_key}: {e:#}"),
        ))
    })?;

    let result = write_event_bucket_locked(store, cache, bucket, &cache_id).await;

    if let Err(e) = lock.release(guard).await {
        tracing::warn!("failed to release event bucket lock {lock_key}: {e:#}");
    }
    result
}

async fn write_event_bucket_locked(
    store: &dyn Store,
    cache: &dyn Cache,
    bucket: &CoalescedEventBucket,
    cache_id: &str,
) -> anyhow::Result<()> {
    match store.find_event_bucket(&bucket.data_type, bucket.start, bucket.end).await? {
        None => {
            let doc = EventDocument {
                data_type: bucket.data_type.clone(),
                start: bucket.start,
                end: bucket.end,
                events: bucket.events.clone(),
            };
            store.insert_event_bucket(&bucket.data_type, doc).await?;
        },
        Some((id, mut doc)) => {
            doc.merge(bucket.events.iter().cloned());
            store.update_event_bucket(&bucket.data_type, &id, doc).await?;
        },
    }

    if let Err(e) = cache.set_with_ttl(cache_id, cache::present(), *DATA_CACHE_EXPIRATION).await {
        tracing::warn!("failed to populate event bucket cache entry {cache_id}: {e:#}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use cache::MemoryCache;
    use lock::MemoryLock;
    use store::MemoryStore;
    use ts_model::Event;

    use super::*;

    fn event(start: i64, identifier: &str, text: &str) -> Event {
        Event {
            start,
            end: start + 10,
            identifier: identifier.into(),
            affected: serde_json::Value::Null,
            text: text.into(),
            event_type: "alert".into(),
        }
    }

    #[tokio::test]
    async fn creates_a_new_bucket_when_none_exists() {
        let store = MemoryStore::new();
        let cache = MemoryCache::new();
        let lock = MemoryLock::new();
        let bucket = CoalescedEventBucket {
            data_type: "cpu".into(),
            start: 0,
            end: 86_400,
            events: vec![event(10, "host-1", "reboot")],
        };
        write_event_bucket(&store, &cache, &lock, &bucket).await.unwrap();

        let (_, doc) = store.find_event_bucket("cpu", 0, 86_400).await.unwrap().unwrap();
        assert_eq!(doc.events.len(), 1);
    }

    #[tokio::test]
    async fn merges_into_an_existing_bucket_by_identity() {
        let store = MemoryStore::new();
        let cache = MemoryCache::new();
        let lock = MemoryLock::new();
        let bucket = CoalescedEventBucket {
            data_type: "cpu".into(),
            start: 0,
            end: 86_400,
            events: vec![event(10, "host-1", "first")],
        };
        write_event_bucket(&store, &cache, &lock, &bucket).await.unwrap();

        let second = CoalescedEventBucket {
            data_type: "cpu".into(),
            start: 0,
            end: 86_400,
            events: vec![event(10, "host-1", "second"), event(20, "host-2", "new")],
        };
        write_event_bucket(&store, &cache, &lock, &second).await.unwrap();

        let (_, doc) = store.find_event_bucket("cpu", 0, 86_400).await.unwrap().unwrap();
        assert_eq!(doc.events.len(), 2);
        assert!(doc.events.iter().any(|e| e.identifier == "host-1" && e.text == "second"));
        assert!(doc.events.iter().any(|e| e.identifier == "host-2"));
    }
}
