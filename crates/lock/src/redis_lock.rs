//! Production `DistributedLock` backed by Redis: `SET key token NX PX
//! millis` to acquire, a `GET`-then-`DEL` Lua script to release only if we
//! still hold the token (never another worker's subsequent acquisition of
//! the same key after our TTL expired).
use std::time::Duration;

use async_trait::async_trait;
use rand::RngCore;
use redis::{
    aio::ConnectionManager,
    Script,
};

use crate::{
    DistributedLock,
    LockGuard,
};

const RELEASE_SCRIPT: &str = r#"
if redis.call("get", KEYS[1]) == ARGV[1] then
    return redis.call("del", KEYS[1])
else
    return 0
end
"#;

pub struct RedisLock {
    conn: ConnectionManager,
}

impl RedisLock {
    pub async fn connect(url: &str) -> anyhow::Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = client.get_connection_manager().await?;
        Ok(Self { conn })
    }

    fn random_token() -> String {
        let mut bytes = [0u8; 16];
        rand::rng().fill_bytes(&mut bytes);
        bytes.iter().map(|b| format!("{b:02x}")).collect()
    }
}

#[async_trait]
impl DistributedLock for RedisLock {
    async fn acquire(&self, key: &str, timeout: Duration, retries: u32) -> anyhow::Result<LockGuard> {
        let token = Self::random_token();
        let millis: usize = timeout.as_millis().try_into().unwrap_or(usize::MAX);
        let mut conn = self.conn.clone();
        for attempt in 0..=retries {
            let acquired: bool = redis::cmd("SET")
                .arg(key)
                .arg(&token)
                .arg("NX")
                .arg("PX")
                .arg(millis)
                .query_async::<Option<String>>(&mut conn)
                .await?
                .is_some();
            if acquired {
                return Ok(LockGuard {
                    key: key.to_owned(),
                    token,
                });
            }
            if attempt < retries {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
        anyhow::bail!("exhausted {retries} attempts acquiring lock {key}");
    }

    async fn release(&self, guard: LockGuard) -> anyhow::Result<()> {
        let mut conn = self.conn.clone();
        let script = Script::new(RELEASE_SCRIPT);
        let _: i64 = script
            .key(&guard.key)
            .arg(&guard.token)
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }
}
