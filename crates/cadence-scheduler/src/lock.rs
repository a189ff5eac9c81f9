//! Distributed lock contract and in-process adapters.
//!
//! The scheduler gates each scheduled run on a lock keyed by job code so
//! that at most one of the cooperating scheduler instances runs a given
//! job at a time. Grants carry an expiry: a holder that crashes without
//! releasing cannot wedge the job forever, and long-running jobs call
//! `extend` to keep their grant alive.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::LockError;

/// Cross-process mutual exclusion keyed by job code.
///
/// The `ttl` passed to `acquire` and `extend` is the lifetime of the
/// grant, not a wait budget: `acquire` never blocks waiting for another
/// holder to release.
#[async_trait]
pub trait DistributedLock: Send + Sync {
    /// Try to take the lock; `false` means another holder owns it.
    async fn acquire(&self, key: &str, ttl: Duration) -> Result<bool, LockError>;

    /// Give the lock back; `false` if this instance does not hold it.
    async fn release(&self, key: &str) -> Result<bool, LockError>;

    /// Push the grant's expiry to `ttl` from now; `false` if this
    /// instance does not hold a live grant.
    async fn extend(&self, key: &str, ttl: Duration) -> Result<bool, LockError>;
}

/// Lock for single-instance deployments: every acquire succeeds.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopLock;

#[async_trait]
impl DistributedLock for NoopLock {
    async fn acquire(&self, _key: &str, _ttl: Duration) -> Result<bool, LockError> {
        Ok(true)
    }

    async fn release(&self, _key: &str) -> Result<bool, LockError> {
        Ok(true)
    }

    async fn extend(&self, _key: &str, _ttl: Duration) -> Result<bool, LockError> {
        Ok(true)
    }
}

/// A live grant: holder token plus expiry.
#[derive(Debug, Clone)]
struct Grant {
    holder: String,
    expires_at: Instant,
}

/// In-process lock with real grant semantics: holder tokens, expiry, and
/// reclamation of expired grants.
///
/// One `MemoryLock` is one holder. [`sibling`](Self::sibling) creates
/// another holder over the same grant table, which is how tests model
/// cooperating scheduler instances.
#[derive(Debug, Clone)]
pub struct MemoryLock {
    holder_id: String,
    grants: Arc<Mutex<HashMap<String, Grant>>>,
}

impl MemoryLock {
    pub fn new() -> Self {
        Self {
            holder_id: Uuid::new_v4().to_string(),
            grants: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// A distinct holder sharing this lock's grant table.
    pub fn sibling(&self) -> Self {
        Self {
            holder_id: Uuid::new_v4().to_string(),
            grants: Arc::clone(&self.grants),
        }
    }

    /// This holder's token.
    pub fn holder_id(&self) -> &str {
        &self.holder_id
    }
}

impl Default for MemoryLock {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DistributedLock for MemoryLock {
    async fn acquire(&self, key: &str, ttl: Duration) -> Result<bool, LockError> {
        let mut grants = self.grants.lock().await;
        let now = Instant::now();
        match grants.get(key) {
            // Live grant held by someone else.
            Some(grant) if grant.expires_at > now && grant.holder != self.holder_id => Ok(false),
            // Free, expired, or re-acquired by the current holder.
            _ => {
                grants.insert(
                    key.to_string(),
                    Grant {
                        holder: self.holder_id.clone(),
                        expires_at: now + ttl,
                    },
                );
                Ok(true)
            }
        }
    }

    async fn release(&self, key: &str) -> Result<bool, LockError> {
        let mut grants = self.grants.lock().await;
        match grants.get(key) {
            Some(grant) if grant.holder == self.holder_id => {
                grants.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn extend(&self, key: &str, ttl: Duration) -> Result<bool, LockError> {
        let mut grants = self.grants.lock().await;
        let now = Instant::now();
        match grants.get_mut(key) {
            Some(grant) if grant.holder == self.holder_id && grant.expires_at > now => {
                grant.expires_at = now + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(60);

    #[tokio::test]
    async fn test_acquire_then_contend() {
        let a = MemoryLock::new();
        let b = a.sibling();

        assert!(a.acquire("job.x", TTL).await.unwrap());
        assert!(!b.acquire("job.x", TTL).await.unwrap());

        // Distinct keys are independent.
        assert!(b.acquire("job.y", TTL).await.unwrap());
    }

    #[tokio::test]
    async fn test_release_frees_grant() {
        let a = MemoryLock::new();
        let b = a.sibling();

        assert!(a.acquire("job.x", TTL).await.unwrap());
        assert!(a.release("job.x").await.unwrap());
        assert!(b.acquire("job.x", TTL).await.unwrap());
    }

    #[tokio::test]
    async fn test_release_by_non_holder_fails() {
        let a = MemoryLock::new();
        let b = a.sibling();

        assert!(a.acquire("job.x", TTL).await.unwrap());
        assert!(!b.release("job.x").await.unwrap());
        // Still held by a.
        assert!(!b.acquire("job.x", TTL).await.unwrap());
    }

    #[tokio::test]
    async fn test_expired_grant_is_reclaimable() {
        let a = MemoryLock::new();
        let b = a.sibling();

        assert!(a.acquire("job.x", Duration::from_millis(10)).await.unwrap());
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(b.acquire("job.x", TTL).await.unwrap());

        // The original holder lost the grant; it cannot release or extend.
        assert!(!a.release("job.x").await.unwrap());
        assert!(!a.extend("job.x", TTL).await.unwrap());
    }

    #[tokio::test]
    async fn test_extend_refreshes_expiry() {
        let a = MemoryLock::new();
        let b = a.sibling();

        assert!(a.acquire("job.x", Duration::from_millis(40)).await.unwrap());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(a.extend("job.x", Duration::from_secs(60)).await.unwrap());
        tokio::time::sleep(Duration::from_millis(40)).await;

        // Without the extend this grant would have lapsed by now.
        assert!(!b.acquire("job.x", TTL).await.unwrap());
    }

    #[tokio::test]
    async fn test_extend_without_grant_fails() {
        let a = MemoryLock::new();
        assert!(!a.extend("job.x", TTL).await.unwrap());
    }

    #[tokio::test]
    async fn test_reacquire_by_holder_refreshes() {
        let a = MemoryLock::new();
        assert!(a.acquire("job.x", TTL).await.unwrap());
        assert!(a.acquire("job.x", TTL).await.unwrap());
        assert!(a.release("job.x").await.unwrap());
    }

    #[tokio::test]
    async fn test_noop_lock_always_grants() {
        let lock = NoopLock;
        assert!(lock.acquire("anything", TTL).await.unwrap());
        assert!(lock.extend("anything", TTL).await.unwrap());
        assert!(lock.release("anything").await.unwrap());
    }
}
