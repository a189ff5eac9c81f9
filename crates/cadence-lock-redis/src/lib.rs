//! Redis-backed [`DistributedLock`] for multi-instance deployments.
//!
//! One lock key per job code, taken with `SET NX PX`. Each scheduler
//! instance carries a random holder token, and release/extend run as
//! Lua scripts that check the token before touching the key, so an
//! instance can never drop or refresh a grant that has passed to
//! someone else.

use std::time::Duration;

use async_trait::async_trait;
use cadence_scheduler::{DistributedLock, LockError};
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client, Script, SetExpiry, SetOptions};
use uuid::Uuid;

const DEFAULT_KEY_PREFIX: &str = "cadence:lock:";

// Delete the key only if we still hold it.
const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

// Refresh the expiry only if we still hold the key.
const EXTEND_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("PEXPIRE", KEYS[1], ARGV[2])
else
    return 0
end
"#;

/// Distributed lock over a single Redis instance.
#[derive(Debug)]
pub struct RedisLock {
    client: Client,
    holder_id: String,
    key_prefix: String,
    release: Script,
    extend: Script,
}

impl RedisLock {
    /// Connect to `url` (e.g. `redis://127.0.0.1:6379/0`). The
    /// connection itself is established lazily on first use.
    pub fn new(url: &str) -> Result<Self, LockError> {
        let client = Client::open(url).map_err(|e| LockError::Backend(e.to_string()))?;
        Ok(Self {
            client,
            holder_id: Uuid::new_v4().to_string(),
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            release: Script::new(RELEASE_SCRIPT),
            extend: Script::new(EXTEND_SCRIPT),
        })
    }

    /// Override the key prefix, for namespacing several schedulers on
    /// one Redis instance.
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    /// This instance's holder token.
    pub fn holder_id(&self) -> &str {
        &self.holder_id
    }

    fn redis_key(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix, key)
    }

    async fn connection(&self) -> Result<MultiplexedConnection, LockError> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| LockError::Backend(e.to_string()))
    }
}

#[async_trait]
impl DistributedLock for RedisLock {
    async fn acquire(&self, key: &str, ttl: Duration) -> Result<bool, LockError> {
        let mut conn = self.connection().await?;
        let options = SetOptions::default()
            .conditional_set(redis::ExistenceCheck::NX)
            .with_expiration(SetExpiry::PX(ttl.as_millis() as usize));
        // NX returns nil when the key is already held.
        let reply: Option<String> = conn
            .set_options(self.redis_key(key), &self.holder_id, options)
            .await
            .map_err(|e| LockError::Backend(e.to_string()))?;
        Ok(reply.is_some())
    }

    async fn release(&self, key: &str) -> Result<bool, LockError> {
        let mut conn = self.connection().await?;
        let removed: i64 = self
            .release
            .key(self.redis_key(key))
            .arg(&self.holder_id)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| LockError::Backend(e.to_string()))?;
        Ok(removed == 1)
    }

    async fn extend(&self, key: &str, ttl: Duration) -> Result<bool, LockError> {
        let mut conn = self.connection().await?;
        let refreshed: i64 = self
            .extend
            .key(self.redis_key(key))
            .arg(&self.holder_id)
            .arg(ttl.as_millis() as u64)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| LockError::Backend(e.to_string()))?;
        Ok(refreshed == 1)
    }
}
