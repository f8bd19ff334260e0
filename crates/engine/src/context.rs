//! Collaborators shared by every auditor

use std::sync::Arc;

use ledgerwatch_core::{Clock, SystemClock};
use ledgerwatch_store::AuditStore;

use crate::cache::{Cache, MemoryCache, StoreCache};
use crate::config::AuditConfig;
use crate::lock::EntityLock;
use crate::notify::NotificationRouter;

/// Constructor-injected dependencies of the audit engine
#[derive(Clone)]
pub struct AuditServices {
    pub store: Arc<dyn AuditStore>,
    pub clock: Arc<dyn Clock>,
    pub cache: Arc<dyn Cache>,
    /// Entity locks; kept in the store so separate processes exclude each other
    pub locks: Arc<dyn Cache>,
    pub notifications: NotificationRouter,
    pub config: Arc<AuditConfig>,
}

impl AuditServices {
    /// Process-local fingerprint cache, store-backed locks, log-only notifications
    pub fn new(store: Arc<dyn AuditStore>, clock: Arc<dyn Clock>, config: AuditConfig) -> Self {
        let cache: Arc<dyn Cache> = Arc::new(MemoryCache::new(Arc::clone(&clock)));
        let locks: Arc<dyn Cache> = Arc::new(StoreCache::new(Arc::clone(&store), Arc::clone(&clock)));
        Self {
            store,
            clock,
            cache,
            locks,
            notifications: NotificationRouter::silent(),
            config: Arc::new(config),
        }
    }

    /// Wall-clock services with default configuration
    pub fn with_defaults(store: Arc<dyn AuditStore>) -> Self {
        Self::new(store, Arc::new(SystemClock), AuditConfig::default())
    }

    pub fn with_cache(mut self, cache: Arc<dyn Cache>) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_locks(mut self, locks: Arc<dyn Cache>) -> Self {
        self.locks = locks;
        self
    }

    pub fn with_notifications(mut self, router: NotificationRouter) -> Self {
        self.notifications = router;
        self
    }

    /// Lock used for per-entity audit exclusivity
    pub fn entity_lock(&self) -> EntityLock {
        EntityLock::new(Arc::clone(&self.locks), self.config.targeted.lock_ttl())
    }
}
