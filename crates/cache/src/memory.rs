//! In-memory `Cache` test double: a `Mutex<HashMap>` with manual TTL
//! bookkeeping against the wall clock.
use std::{
    collections::{
        BTreeMap,
        HashMap,
    },
    time::{
        Duration,
        Instant,
    },
};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value as Json;

use crate::Cache;

struct Entry {
    value: Json,
    expires_at: Instant,
}

#[derive(Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn get_live(entries: &HashMap<String, Entry>, key: &str) -> Option<Json> {
        entries.get(key).filter(|e| e.expires_at > Instant::now()).map(|e| e.value.clone())
    }
}

#[async_trait]
impl Cache for MemoryCache {
    async fn get(&self, key: &str) -> anyhow::Result<Option<Json>> {
        Ok(Self::get_live(&self.entries.lock(), key))
    }

    async fn multi_get(&self, keys: &[String]) -> anyhow::Result<BTreeMap<String, Json>> {
        let entries = self.entries.lock();
        Ok(keys
            .iter()
            .filter_map(|key| Self::get_live(&entries, key).map(|v| (key.clone(), v)))
            .collect())
    }

    async fn set_with_ttl(&self, key: &str, value: Json, ttl: Duration) -> anyhow::Result<()> {
        self.entries.lock().insert(
            key.to_owned(),
            Entry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> anyhow::Result<()> {
        self.entries.lock().remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn set_then_get_round_trips() {
        let cache = MemoryCache::new();
        cache
            .set_with_ttl("k", Json::from(1), Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(cache.get("k").await.unwrap(), Some(Json::from(1)));
    }

    #[tokio::test]
    async fn expired_entry_is_absent() {
        let cache = MemoryCache::new();
        cache
            .set_with_ttl("k", Json::from(1), Duration::from_millis(1))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(cache.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn multi_get_skips_missing_keys() {
        let cache = MemoryCache::new();
        cache
            .set_with_ttl("a", Json::from(1), Duration::from_secs(60))
            .await
            .unwrap();
        let result = cache
            .multi_get(&["a".to_owned(), "b".to_owned()])
            .await
            .unwrap();
        assert_eq!(result.len(), 1);
        assert!(result.contains_key("a"));
    }
}
