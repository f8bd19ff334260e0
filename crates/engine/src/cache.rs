//! Short-lived key cache
//!
//! Holds flags only (a key is present or not). Used for fingerprint
//! read-through and for per-entity audit locks. Expiry is driven by the
//! injected [`Clock`].
//!
//! [`MemoryCache`] is process-local. [`StoreCache`] keeps keys as leases in
//! the audit store, so every worker process sharing the store sees them.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use ledgerwatch_core::Clock;
use ledgerwatch_store::{AuditStore, LeaseRepository};
use parking_lot::Mutex;

/// Key presence cache with per-key expiry
pub trait Cache: Send + Sync {
    /// Key present and not expired
    fn has(&self, key: &str) -> bool;

    /// Insert or refresh a key
    fn put(&self, key: &str, ttl: Duration);

    /// Insert only if absent; returns `true` when this call inserted it
    fn add(&self, key: &str, ttl: Duration) -> bool;

    fn forget(&self, key: &str);
}

/// Process-local [`Cache`]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, DateTime<Utc>>>,
    clock: Arc<dyn Clock>,
}

impl MemoryCache {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            clock,
        }
    }

    /// Number of live keys
    pub fn len(&self) -> usize {
        let now = self.clock.now();
        self.entries.lock().values().filter(|exp| **exp > now).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Cache for MemoryCache {
    fn has(&self, key: &str) -> bool {
        let now = self.clock.now();
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(expires_at) if *expires_at > now => true,
            Some(_) => {
                entries.remove(key);
                false
            }
            None => false,
        }
    }

    fn put(&self, key: &str, ttl: Duration) {
        let expires_at = self.clock.now() + ttl;
        self.entries.lock().insert(key.to_string(), expires_at);
    }

    fn add(&self, key: &str, ttl: Duration) -> bool {
        let now = self.clock.now();
        let mut entries = self.entries.lock();
        if entries.get(key).map_or(false, |exp| *exp > now) {
            return false;
        }
        entries.insert(key.to_string(), now + ttl);
        true
    }

    fn forget(&self, key: &str) {
        self.entries.lock().remove(key);
    }
}

/// Store-backed [`Cache`]
///
/// A store error reads as "absent" for [`Cache::has`] and as "not inserted"
/// for [`Cache::add`], so an unreachable store never hands out a lock.
pub struct StoreCache {
    store: Arc<dyn AuditStore>,
    clock: Arc<dyn Clock>,
}

impl StoreCache {
    pub fn new(store: Arc<dyn AuditStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }
}

impl Cache for StoreCache {
    fn has(&self, key: &str) -> bool {
        self.store
            .lease_active(key, self.clock.now())
            .unwrap_or_else(|e| {
                tracing::warn!(key, error = %e, "Lease lookup failed");
                false
            })
    }

    fn put(&self, key: &str, ttl: Duration) {
        if let Err(e) = self.store.renew_lease(key, self.clock.now() + ttl) {
            tracing::warn!(key, error = %e, "Lease write failed");
        }
    }

    fn add(&self, key: &str, ttl: Duration) -> bool {
        let now = self.clock.now();
        self.store
            .acquire_lease(key, now + ttl, now)
            .unwrap_or_else(|e| {
                tracing::warn!(key, error = %e, "Lease acquire failed");
                false
            })
    }

    fn forget(&self, key: &str) {
        if let Err(e) = self.store.release_lease(key) {
            tracing::error!(key, error = %e, "Lease release failed, held until expiry");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ledgerwatch_core::ManualClock;
    use ledgerwatch_store::MemoryStore;

    #[test]
    fn test_entries_expire() {
        let clock = Arc::new(ManualClock::default());
        let cache = MemoryCache::new(clock.clone());

        cache.put("k", Duration::minutes(5));
        assert!(cache.has("k"));

        clock.advance(Duration::minutes(5));
        assert!(!cache.has("k"));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_add_is_exclusive_until_expiry() {
        let clock = Arc::new(ManualClock::default());
        let cache = MemoryCache::new(clock.clone());

        assert!(cache.add("lock", Duration::seconds(10)));
        assert!(!cache.add("lock", Duration::seconds(10)));

        clock.advance(Duration::seconds(11));
        assert!(cache.add("lock", Duration::seconds(10)));

        cache.forget("lock");
        assert!(!cache.has("lock"));
    }

    #[test]
    fn test_store_cache_is_shared_through_the_store() {
        let clock = Arc::new(ManualClock::default());
        let store: Arc<dyn AuditStore> = Arc::new(MemoryStore::new());
        let one = StoreCache::new(Arc::clone(&store), clock.clone());
        let other = StoreCache::new(store, clock.clone());

        assert!(one.add("lock", Duration::seconds(10)));
        assert!(!other.add("lock", Duration::seconds(10)));
        assert!(other.has("lock"));

        clock.advance(Duration::seconds(11));
        assert!(!one.has("lock"));
        assert!(other.add("lock", Duration::seconds(10)));

        other.forget("lock");
        assert!(!one.has("lock"));
    }
}
