//! Distributed mutual exclusion: a `DistributedLock` trait over a
//! Redis-backed production implementation and an in-memory test double.
//! Every bucket mutation holds one of these for the duration of the
//! mutation.
pub mod memory;
pub mod redis_lock;

use std::time::Duration;

use async_trait::async_trait;

pub use crate::{
    memory::MemoryLock,
    redis_lock::RedisLock,
};

/// A held lock. Only `release` consumes it; dropping it without releasing
/// leaves the key to expire on its own TTL: a failed release is logged,
/// not retried.
#[derive(Clone, Debug)]
pub struct LockGuard {
    pub key: String,
    pub token: String,
}

#[async_trait]
pub trait DistributedLock: Send + Sync {
    /// Attempt to acquire `key`, retrying up to `retries` times. Each
    /// attempt's hold expires after `timeout` if never explicitly released.
    /// Exhausting `retries` is a transient failure: the caller should
    /// abort the batch and let the broker redeliver it.
    async fn acquire(&self, key: &str, timeout: Duration, retries: u32) -> anyhow::Result<LockGuard>;

    /// Release a lock this process still holds. A no-op (and not an error)
    /// if the lock already expired or was taken over by another holder.
    async fn release(&self, guard: LockGuard) -> anyhow::Result<()>;
}
