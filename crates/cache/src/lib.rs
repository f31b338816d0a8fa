//! Memcached-backed short-circuit cache: a `Cache` trait over the
//! bucket-key string format, a production implementation backed by
//! the `memcache` wire protocol, and an in-memory test double.
pub mod memcache_client;
pub mod memory;

use std::{
    collections::BTreeMap,
    time::Duration,
};

use async_trait::async_trait;
use serde_json::Value as Json;

pub use crate::{
    memcache_client::MemcacheClient,
    memory::MemoryCache,
};

/// Sentinel value stored for "document known to exist" checks that don't
/// need to remember anything beyond presence.
pub fn present() -> Json {
    Json::from(1)
}

#[async_trait]
pub trait Cache: Send + Sync {
    async fn get(&self, key: &str) -> anyhow::Result<Option<Json>>;

    /// Fetch every key at once; keys with no entry are absent from the
    /// result map.
    async fn multi_get(&self, keys: &[String]) -> anyhow::Result<BTreeMap<String, Json>>;

    async fn set_with_ttl(&self, key: &str, value: Json, ttl: Duration) -> anyhow::Result<()>;

    async fn delete(&self, key: &str) -> anyhow::Result<()>;
}
