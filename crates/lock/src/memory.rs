//! In-memory `DistributedLock` test double: a `Mutex<HashMap>` of held keys
//! with manual TTL bookkeeping, so tests can exercise lock contention and
//! expiry without a Redis instance.
use std::{
    collections::HashMap,
    time::{
        Duration,
        Instant,
    },
};

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::RngCore;

use crate::{
    DistributedLock,
    LockGuard,
};

struct Held {
    token: String,
    expires_at: Instant,
}

#[derive(Default)]
pub struct MemoryLock {
    held: Mutex<HashMap<String, Held>>,
}

impl MemoryLock {
    pub fn new() -> Self {
        Self::default()
    }

    fn random_token() -> String {
        let mut bytes = [0u8; 16];
        rand::rng().fill_bytes(&mut bytes);
        bytes.iter().map(|b| format!("{b:02x}")).collect()
    }

    fn try_acquire(&self, key: &str, timeout: Duration, token: &str) -> bool {
        let mut held = self.held.lock();
        let now = Instant::now();
        if let Some(existing) = held.get(key) {
            if existing.expires_at > now {
                return false;
            }
        }
        held.insert(
            key.to_owned(),
            Held {
                token: token.to_owned(),
                expires_at: now + timeout,
            },
        );
        true
    }
}

#[async_trait]
impl DistributedLock for MemoryLock {
    async fn acquire(&self, key: &str, timeout: Duration, retries: u32) -> anyhow::Result<LockGuard> {
        let token = Self::random_token();
        for attempt in 0..=retries {
            if self.try_acquire(key, timeout, &token) {
                return Ok(LockGuard {
                    key: key.to_owned(),
                    token,
                });
            }
            if attempt < retries {
                tokio::task::yield_now().await;
            }
        }
        anyhow::bail!("exhausted {retries} attempts acquiring lock {key}");
    }

    async fn release(&self, guard: LockGuard) -> anyhow::Result<()> {
        let mut held = self.held.lock();
        if let Some(existing) = held.get(&guard.key) {
            if existing.token == guard.token {
                held.remove(&guard.key);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn second_acquire_fails_while_held() {
        let lock = MemoryLock::new();
        let guard = lock
            .acquire("k", Duration::from_secs(60), 0)
            .await
            .unwrap();
        let err = lock.acquire("k", Duration::from_millis(1), 0).await;
        assert!(err.is_err());
        lock.release(guard).await.unwrap();
        lock.acquire("k", Duration::from_secs(60), 0).await.unwrap();
    }

    #[tokio::test]
    async fn release_with_stale_token_is_a_noop() {
        let lock = MemoryLock::new();
        let guard = lock
            .acquire("k", Duration::from_secs(60), 0)
            .await
            .unwrap();
        let stale = LockGuard {
            key: "k".to_owned(),
            token: "not-the-real-token".to_owned(),
        };
        lock.release(stale).await.unwrap();
        // Original holder's lock is untouched.
        let err = lock.acquire("k", Duration::from_millis(1), 0).await;
        assert!(err.is_err());
        lock.release(guard).await.unwrap();
    }

    #[tokio::test]
    async fn expired_lock_can_be_reacquired() {
        let lock = MemoryLock::new();
        let _guard = lock
            .acquire("k", Duration::from_millis(1), 0)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        lock.acquire("k", Duration::from_secs(60), 0).await.unwrap();
    }
}
