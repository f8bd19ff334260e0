//! Per-entity audit locks
//!
//! At most one targeted audit may run per entity. The lock is a cache key
//! (`audit_lock_wallet_<id>`) with a TTL, so a worker that dies mid-audit
//! stops blocking the entity once the TTL passes. Services hold it in a
//! [`StoreCache`](crate::cache::StoreCache) so it spans worker processes.

use std::sync::Arc;

use chrono::Duration;
use ledgerwatch_core::EntityType;

use crate::cache::Cache;

/// Exclusive, TTL-bounded entity lock
#[derive(Clone)]
pub struct EntityLock {
    cache: Arc<dyn Cache>,
    ttl: Duration,
}

impl EntityLock {
    pub fn new(cache: Arc<dyn Cache>, ttl: Duration) -> Self {
        Self { cache, ttl }
    }

    pub fn key(entity_type: EntityType, entity_id: i64) -> String {
        format!("audit_lock_{}_{}", entity_type, entity_id)
    }

    /// Take the lock, or `None` if another audit holds it
    pub fn try_acquire(&self, entity_type: EntityType, entity_id: i64) -> Option<LockGuard> {
        let key = Self::key(entity_type, entity_id);
        if self.cache.add(&key, self.ttl) {
            Some(LockGuard {
                cache: Arc::clone(&self.cache),
                key,
            })
        } else {
            None
        }
    }

    pub fn is_locked(&self, entity_type: EntityType, entity_id: i64) -> bool {
        self.cache.has(&Self::key(entity_type, entity_id))
    }
}

/// Releases the lock on drop
pub struct LockGuard {
    cache: Arc<dyn Cache>,
    key: String,
}

impl LockGuard {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.cache.forget(&self.key);
    }
}
