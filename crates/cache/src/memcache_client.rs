//! Production `Cache` backed by the `memcache` wire protocol. The official
//! client is synchronous, so every call is dispatched through
//! `tokio::task::spawn_blocking` rather than blocking the consumer loop's
//! executor thread on a round-trip.
use std::{
    collections::BTreeMap,
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value as Json;

use crate::Cache;

pub struct MemcacheClient {
    client: Arc<Mutex<memcache::Client>>,
}

impl MemcacheClient {
    pub fn connect(url: &str) -> anyhow::Result<Self> {
        let client = memcache::Client::connect(url)?;
        Ok(Self {
            client: Arc::new(Mutex::new(client)),
        })
    }
}

async fn run_blocking<F, T>(client: Arc<Mutex<memcache::Client>>, f: F) -> anyhow::Result<T>
where
    F: FnOnce(&memcache::Client) -> Result<T, memcache::MemcacheError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        let client = client.lock();
        f(&client).map_err(anyhow::Error::from)
    })
    .await?
}

#[async_trait]
impl Cache for MemcacheClient {
    async fn get(&self, key: &str) -> anyhow::Result<Option<Json>> {
        let client = self.client.clone();
        let key = key.to_owned();
        run_blocking(client, move |client| {
            client.get::<String>(&key).map(|v| v.and_then(|raw| serde_json::from_str(&raw).ok()))
        })
        .await
    }

    async fn multi_get(&self, keys: &[String]) -> anyhow::Result<BTreeMap<String, Json>> {
        let client = self.client.clone();
        let keys = keys.to_vec();
        run_blocking(client, move |client| {
            let refs: Vec<&str> = keys.iter().map(String::as_str).collect();
            let raw: BTreeMap<String, String> = client.gets(&refs)?.into_iter().collect();
            Ok(raw
                .into_iter()
                .filter_map(|(k, v)| serde_json::from_str(&v).ok().map(|v| (k, v)))
                .collect())
        })
        .await
    }

    async fn set_with_ttl(&self, key: &str, value: Json, ttl: Duration) -> anyhow::Result<()> {
        let client = self.client.clone();
        let key = key.to_owned();
        let raw = serde_json::to_string(&value)?;
        let ttl_secs = u32::try_from(ttl.as_secs()).unwrap_or(u32::MAX);
        run_blocking(client, move |client| client.set(&key, raw.as_str(), ttl_secs)).await
    }

    async fn delete(&self, key: &str) -> anyhow::Result<()> {
        let client = self.client.clone();
        let key = key.to_owned();
        run_blocking(client, move |client| client.delete(&key).map(|_| ())).await
    }
}
