//! Queue worker
//!
//! Drains due jobs from the audit queue and dispatches them:
//!
//! ```text
//!  claim_due ──► batch    ──► TargetedAuditor  (locked → defer, no wallet → discard)
//!            ──► periodic ──► PeriodicAuditor  (stale → discard, else queue next run)
//!            ──► global   ──► GlobalAuditor
//!
//!  ok    → complete_job (+ follow-up)
//!  error → record_job_failure, retried after backoff until max_attempts
//! ```
//!
//! Several workers may drain the same queue; claims are leased and the
//! entity lock keeps reconciliations of one wallet exclusive.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use ledgerwatch_core::{AuditQueueJob, AuditType, EntityType, NewAuditJob};
use ledgerwatch_store::AuditQueueRepository;
use tokio::sync::watch;
use uuid::Uuid;

use crate::context::AuditServices;
use crate::error::{AuditError, AuditResult};
use crate::global::GlobalAuditor;
use crate::periodic::{PeriodicAuditor, PeriodicOutcome};
use crate::targeted::{TargetedAuditor, TargetedOutcome};

/// What happened to one claimed job
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    /// Done; the job row is deleted and the follow-up, if any, queued
    Completed { follow_up: Option<NewAuditJob> },
    /// Nothing left to do
    Discarded,
    /// Not ready yet, released without counting an attempt
    Deferred(DateTime<Utc>),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub completed: usize,
    pub deferred: usize,
    pub discarded: usize,
    pub failed: usize,
}

impl DrainReport {
    pub fn processed(&self) -> usize {
        self.completed + self.deferred + self.discarded + self.failed
    }
}

pub struct QueueWorker {
    services: AuditServices,
    targeted: TargetedAuditor,
    periodic: PeriodicAuditor,
    global: GlobalAuditor,
}

impl QueueWorker {
    pub fn new(services: AuditServices) -> Self {
        Self {
            targeted: TargetedAuditor::new(services.clone()),
            periodic: PeriodicAuditor::new(services.clone()),
            global: GlobalAuditor::new(services.clone()),
            services,
        }
    }

    pub fn with_global_auditor(mut self, global: GlobalAuditor) -> Self {
        self.global = global;
        self
    }

    /// Run the auditor matching the job's type
    pub fn process(&self, job: &AuditQueueJob) -> AuditResult<JobOutcome> {
        match (job.audit_type, job.entity_type) {
            (AuditType::Batch, EntityType::Wallet) => {
                match self.targeted.audit_wallet(job.entity_id)? {
                    TargetedOutcome::Locked => {
                        let retry = self.services.config.targeted.lock_retry_delay();
                        Ok(JobOutcome::Deferred(self.services.clock.now() + retry))
                    }
                    TargetedOutcome::MissingWallet => Ok(JobOutcome::Discarded),
                    TargetedOutcome::Completed(_) => Ok(JobOutcome::Completed { follow_up: None }),
                }
            }
            (AuditType::Periodic, EntityType::Wallet) => match self.periodic.execute(job)? {
                PeriodicOutcome::Stale => Ok(JobOutcome::Discarded),
                PeriodicOutcome::Completed { next_audit, .. } => Ok(JobOutcome::Completed {
                    follow_up: Some(next_audit),
                }),
            },
            (AuditType::Global, _) => {
                self.global.run()?;
                Ok(JobOutcome::Completed { follow_up: None })
            }
            (audit_type, entity_type) => Err(AuditError::UnsupportedJob {
                job_id: job.id,
                reason: format!("{} audit of {} entity", audit_type, entity_type),
            }),
        }
    }

    /// Process every job that is due now
    pub fn drain_once(&self) -> AuditResult<DrainReport> {
        let store = &self.services.store;
        let queue = &self.services.config.queue;
        let mut report = DrainReport::default();

        while let Some(job) = store.claim_due(&queue.queue_name, self.services.clock.now(), queue.lease())? {
            match self.process(&job) {
                Ok(JobOutcome::Completed { follow_up }) => {
                    store.complete_job(job.id)?;
                    if let Some(next) = follow_up {
                        store.enqueue_unique(next, self.services.clock.now())?;
                    }
                    report.completed += 1;
                }
                Ok(JobOutcome::Discarded) => {
                    store.complete_job(job.id)?;
                    report.discarded += 1;
                }
                Ok(JobOutcome::Deferred(until)) => {
                    store.defer_job(job.id, until)?;
                    report.deferred += 1;
                }
                Err(e) => {
                    let retry_at = self.services.clock.now() + self.services.config.targeted.retry_backoff();
                    let updated = store.record_job_failure(job.id, &e.to_string(), retry_at)?;
                    if updated.is_exhausted() {
                        tracing::error!(
                            job_id = job.id,
                            audit_type = %job.audit_type,
                            entity_id = job.entity_id,
                            attempts = updated.attempts,
                            error = %e,
                            "Audit job exhausted its attempts, left for manual attention"
                        );
                    } else {
                        tracing::warn!(
                            job_id = job.id,
                            audit_type = %job.audit_type,
                            attempts = updated.attempts,
                            error = %e,
                            "Audit job failed, will retry"
                        );
                    }
                    report.failed += 1;
                }
            }
        }

        Ok(report)
    }

    /// Poll the queue until `shutdown` flips to true
    ///
    /// Draining is blocking store work, so it runs on the blocking pool.
    pub async fn run(
        self: Arc<Self>,
        poll: std::time::Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> AuditResult<()> {
        let worker_id = Uuid::new_v4();
        let mut ticker = tokio::time::interval(poll);
        tracing::info!(%worker_id, queue = %self.services.config.queue.queue_name, "Audit worker started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let worker = Arc::clone(&self);
                    match tokio::task::spawn_blocking(move || worker.drain_once()).await {
                        Ok(Ok(report)) if report.processed() > 0 => {
                            tracing::debug!(
                                %worker_id,
                                completed = report.completed,
                                deferred = report.deferred,
                                discarded = report.discarded,
                                failed = report.failed,
                                "Queue drained"
                            );
                        }
                        Ok(Ok(_)) => {}
                        Ok(Err(e)) => tracing::warn!(%worker_id, error = %e, "Queue drain failed"),
                        Err(e) => return Err(AuditError::Worker(e.to_string())),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!(%worker_id, "Audit worker stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use ledgerwatch_core::{
        Clock, Flow, ManualClock, Nature, SystemWallet, Transaction, TxStatus, Wallet,
        PRIORITY_HIGH,
    };
    use ledgerwatch_store::{Fault, MemoryStore};
    use rust_decimal_macros::dec;

    struct Fixture {
        store: Arc<MemoryStore>,
        clock: Arc<ManualClock>,
        services: AuditServices,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap()));
        let services = AuditServices::new(store.clone(), clock.clone(), Default::default());
        Fixture { store, clock, services }
    }

    impl Fixture {
        fn worker(&self) -> QueueWorker {
            QueueWorker::new(self.services.clone())
        }

        fn wallet(&self, id: i64, balance: rust_decimal::Decimal) {
            self.store.insert_wallet(Wallet {
                id,
                user_id: id,
                balance,
                updated_at: self.clock.now(),
            });
            self.store.insert_transaction(Transaction {
                id,
                wallet_id: id,
                amount: dec!(100),
                flow: Flow::In,
                nature: Nature::Internal,
                status: TxStatus::Completed,
                created_at: self.clock.now(),
            });
        }

        fn enqueue(&self, entity_type: EntityType, entity_id: i64, audit_type: AuditType) -> AuditQueueJob {
            let now = self.clock.now();
            self.store
                .enqueue_unique(
                    NewAuditJob {
                        queue_name: "audits".into(),
                        entity_type,
                        entity_id,
                        audit_type,
                        priority: PRIORITY_HIGH,
                        scheduled_at: now,
                        max_attempts: 3,
                    },
                    now,
                )
                .unwrap()
                .0
        }
    }

    #[test]
    fn test_targeted_job_completes_and_is_deleted() {
        let f = fixture();
        f.wallet(1, dec!(100));
        let job = f.enqueue(EntityType::Wallet, 1, AuditType::Batch);

        let report = f.worker().drain_once().unwrap();
        assert_eq!(report.completed, 1);
        assert!(f.store.job(job.id).unwrap().is_none());
        assert_eq!(f.store.snapshots(1).len(), 1);
    }

    #[test]
    fn test_locked_wallet_defers_without_attempt() {
        let f = fixture();
        f.wallet(1, dec!(100));
        let job = f.enqueue(EntityType::Wallet, 1, AuditType::Batch);
        let _guard = f.services.entity_lock().try_acquire(EntityType::Wallet, 1).unwrap();

        let report = f.worker().drain_once().unwrap();
        assert_eq!(report.deferred, 1);
        let stored = f.store.job(job.id).unwrap().unwrap();
        assert_eq!(stored.attempts, 0);
        assert_eq!(stored.scheduled_at, f.clock.now() + Duration::seconds(60));
        assert!(f.store.snapshots(1).is_empty());
    }

    #[test]
    fn test_missing_wallet_is_discarded() {
        let f = fixture();
        let job = f.enqueue(EntityType::Wallet, 42, AuditType::Batch);

        let report = f.worker().drain_once().unwrap();
        assert_eq!(report.discarded, 1);
        assert!(f.store.job(job.id).unwrap().is_none());
    }

    #[test]
    fn test_periodic_job_queues_follow_up() {
        let f = fixture();
        f.wallet(1, dec!(100));
        let job = f.enqueue(EntityType::Wallet, 1, AuditType::Periodic);

        let report = f.worker().drain_once().unwrap();
        assert_eq!(report.completed, 1);
        assert!(f.store.job(job.id).unwrap().is_none());
        let next = f
            .store
            .outstanding_job(EntityType::Wallet, 1, AuditType::Periodic)
            .unwrap()
            .unwrap();
        assert!(next.scheduled_at > f.clock.now());
    }

    #[test]
    fn test_failures_retry_then_exhaust() {
        let f = fixture();
        // the global auditor needs a system wallet; without one every run fails
        let job = f.enqueue(EntityType::System, 0, AuditType::Global);
        let worker = f.worker();

        for attempt in 1..=3 {
            let report = worker.drain_once().unwrap();
            assert_eq!(report.failed, 1);
            let stored = f.store.job(job.id).unwrap().unwrap();
            assert_eq!(stored.attempts, attempt);
            assert!(stored.last_error.is_some());
            f.clock.advance(Duration::minutes(2));
        }

        // exhausted: never claimed again, visible to operators
        assert_eq!(worker.drain_once().unwrap().processed(), 0);
        assert_eq!(f.store.failed_jobs().unwrap().len(), 1);
    }

    #[test]
    fn test_store_fault_counts_as_failure() {
        let f = fixture();
        f.store.set_system_wallet(SystemWallet {
            solde_marchand: dec!(0),
            engagement_users: dec!(0),
            plateforme_benefices: dec!(0),
            updated_at: f.clock.now(),
        });
        f.enqueue(EntityType::System, 0, AuditType::Global);
        f.store.inject_failure(Fault::SystemRead);

        let report = f.worker().drain_once().unwrap();
        assert_eq!(report.failed, 1);
    }

    #[test]
    fn test_unsupported_job_fails() {
        let f = fixture();
        let job = f.enqueue(EntityType::Wallet, 1, AuditType::Realtime);
        let worker = f.worker();

        let err = worker.process(&job).unwrap_err();
        assert!(matches!(err, AuditError::UnsupportedJob { .. }));
    }

    #[tokio::test]
    async fn test_run_drains_until_shutdown() {
        let f = fixture();
        f.wallet(1, dec!(100));
        let job = f.enqueue(EntityType::Wallet, 1, AuditType::Batch);
        let orphan = f.enqueue(EntityType::Wallet, 2, AuditType::Batch);

        let worker = Arc::new(f.worker());
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(worker.run(std::time::Duration::from_millis(10), rx));

        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        tx.send(true).unwrap();
        handle.await.unwrap().unwrap();

        assert!(f.store.job(job.id).unwrap().is_none());
        assert!(f.store.job(orphan.id).unwrap().is_none());
    }
}
