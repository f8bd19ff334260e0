//! Application context - wires the engine to a database

use std::path::{Path, PathBuf};
use std::sync::Arc;

use ledgerwatch_core::{SystemClock, UserId};
use ledgerwatch_engine::{
    AuditConfig, AuditOrchestrator, AuditServices, NotificationRouter, QueueWorker,
    StaticDirectory, TracingNotifier,
};
use ledgerwatch_store::SqliteStore;

pub struct AppContext {
    pub store: Arc<SqliteStore>,
    pub services: AuditServices,
    pub orchestrator: AuditOrchestrator,
    db_path: PathBuf,
}

impl AppContext {
    /// Open (or create) the database and load configuration
    ///
    /// Without a config file the built-in defaults apply.
    pub fn open(
        db_path: impl AsRef<Path>,
        config_path: Option<&Path>,
        auditors: &[UserId],
    ) -> Result<Self, anyhow::Error> {
        let db_path = db_path.as_ref().to_path_buf();
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let config = match config_path {
            Some(path) => AuditConfig::from_file(path)?,
            None => AuditConfig::default(),
        };

        let store = Arc::new(SqliteStore::open(&db_path)?);
        let router = NotificationRouter::new(
            Arc::new(StaticDirectory::new(auditors.iter().copied())),
            Arc::new(TracingNotifier),
        );
        // entity locks are leases in the database, shared with any other worker process
        let services = AuditServices::new(store.clone(), Arc::new(SystemClock), config)
            .with_notifications(router);

        tracing::debug!(db = %db_path.display(), "Audit database opened");

        Ok(Self {
            orchestrator: AuditOrchestrator::new(services.clone()),
            services,
            store,
            db_path,
        })
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub fn worker(&self) -> QueueWorker {
        QueueWorker::new(self.services.clone())
    }
}
