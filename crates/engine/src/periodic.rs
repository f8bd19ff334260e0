//! Periodic auditor
//!
//! Two passes on separate schedules:
//!
//! - **Scheduling** walks every active wallet, scores its risk and queues a
//!   periodic job when the wallet is unlocked, overdue and has changed since
//!   its last snapshot. It also keeps one global audit job queued. A wallet
//!   that fails to analyse is logged and skipped.
//! - **Execution** drops stale jobs, snapshots the wallet, looks for trend
//!   anomalies over the snapshot history and returns the follow-up job.

use chrono::{DateTime, Utc};
use ledgerwatch_core::{
    AnomalyScope, AuditQueueJob, AuditStatus, AuditType, EntityType, JobId, NewAuditJob,
    NewSnapshot, SnapshotId, Wallet, PRIORITY_NORMAL,
};
use ledgerwatch_store::{
    AuditLogRepository, AuditQueueRepository, LedgerRepository, SnapshotRepository,
    WalletRepository,
};
use rust_decimal::Decimal;

use crate::anomaly::{AnomalyRecorder, Recorded};
use crate::context::AuditServices;
use crate::error::AuditResult;
use crate::risk::{assess, RiskAssessment, RiskInputs};
use crate::trend::{analyze, trend_anomalies, TrendReport};

/// Outcome of one scheduling sweep
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScheduleReport {
    pub examined: usize,
    pub scheduled: usize,
    pub already_queued: usize,
    pub skipped_locked: usize,
    pub skipped_not_due: usize,
    pub skipped_unchanged: usize,
    pub failed: usize,
    pub global_job: Option<JobId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WalletDecision {
    Scheduled,
    AlreadyQueued,
    Locked,
    NotDue,
    Unchanged,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PeriodicOutcome {
    /// Wallet missing or untouched since well before the job was created
    Stale,
    Completed {
        snapshot_id: SnapshotId,
        trend: Option<TrendReport>,
        anomalies_created: usize,
        duplicates_suppressed: usize,
        /// The wallet's next periodic audit
        next_audit: NewAuditJob,
    },
}

pub struct PeriodicAuditor {
    services: AuditServices,
    recorder: AnomalyRecorder,
}

impl PeriodicAuditor {
    pub fn new(services: AuditServices) -> Self {
        Self {
            recorder: AnomalyRecorder::new(services.clone()),
            services,
        }
    }

    /// Gather risk signals for a wallet and score them
    pub fn assess_wallet(&self, wallet: &Wallet, now: DateTime<Utc>) -> AuditResult<RiskAssessment> {
        let config = &self.services.config.periodic;
        let store = &self.services.store;

        let activity = store.wallet_activity(wallet.id, now - config.activity_window())?;
        let last_transaction_at = match activity.last_transaction_at {
            Some(at) => Some(at),
            None => store.wallet_activity(wallet.id, DateTime::<Utc>::UNIX_EPOCH)?.last_transaction_at,
        };
        let idle_since = last_transaction_at.unwrap_or(wallet.updated_at);

        let inputs = RiskInputs {
            daily_volume: activity.volume / Decimal::from(config.activity_window_days.max(1)),
            transaction_count_30d: activity.transaction_count,
            unresolved_anomalies: store.count_unresolved(EntityType::Wallet, wallet.id)?,
            balance: wallet.balance,
            days_inactive: (now - idle_since).num_days().max(0),
        };
        Ok(assess(&inputs, config))
    }

    fn periodic_job(&self, wallet_id: i64, priority: u8, at: DateTime<Utc>) -> NewAuditJob {
        let queue = &self.services.config.queue;
        NewAuditJob {
            queue_name: queue.queue_name.clone(),
            entity_type: EntityType::Wallet,
            entity_id: wallet_id,
            audit_type: AuditType::Periodic,
            priority,
            scheduled_at: at,
            max_attempts: queue.default_max_attempts,
        }
    }

    /// Scheduling pass
    pub fn schedule(&self) -> AuditResult<ScheduleReport> {
        let now = self.services.clock.now();
        let config = &self.services.config;
        let wallets = self
            .services
            .store
            .active_wallets(now - config.periodic.activity_window())?;

        let mut report = ScheduleReport::default();
        for wallet in &wallets {
            report.examined += 1;
            match self.schedule_wallet(wallet, now) {
                Ok(WalletDecision::Scheduled) => report.scheduled += 1,
                Ok(WalletDecision::AlreadyQueued) => report.already_queued += 1,
                Ok(WalletDecision::Locked) => report.skipped_locked += 1,
                Ok(WalletDecision::NotDue) => report.skipped_not_due += 1,
                Ok(WalletDecision::Unchanged) => report.skipped_unchanged += 1,
                Err(e) => {
                    report.failed += 1;
                    tracing::warn!(wallet_id = wallet.id, error = %e, "Periodic scheduling failed for wallet");
                }
            }
        }

        let global = NewAuditJob {
            queue_name: config.queue.queue_name.clone(),
            entity_type: EntityType::System,
            entity_id: 0,
            audit_type: AuditType::Global,
            priority: PRIORITY_NORMAL,
            scheduled_at: now + config.periodic.global_audit_delay(),
            max_attempts: config.queue.default_max_attempts,
        };
        match self.services.store.enqueue_unique(global, now) {
            Ok((job, _)) => report.global_job = Some(job.id),
            Err(e) => tracing::warn!(error = %e, "Failed to queue global audit"),
        }

        tracing::info!(
            examined = report.examined,
            scheduled = report.scheduled,
            failed = report.failed,
            "Periodic scheduling sweep finished"
        );
        Ok(report)
    }

    fn schedule_wallet(&self, wallet: &Wallet, now: DateTime<Utc>) -> AuditResult<WalletDecision> {
        let config = &self.services.config.periodic;
        let store = &self.services.store;

        if self.services.entity_lock().is_locked(EntityType::Wallet, wallet.id) {
            return Ok(WalletDecision::Locked);
        }

        let assessment = self.assess_wallet(wallet, now)?;
        if let Some(last) = store.latest_snapshot(wallet.id, Some(AuditType::Periodic))? {
            if now - last.snapshot_date <= assessment.frequency {
                return Ok(WalletDecision::NotDue);
            }
        }

        let changed = match store.latest_snapshot(wallet.id, None)? {
            None => true,
            Some(snapshot) => {
                let count = store.completed_internal_count(wallet.id)?;
                (wallet.balance - snapshot.balance).abs() > config.balance_change_threshold
                    || count.abs_diff(snapshot.transaction_count) > config.tx_count_change_threshold
            }
        };
        if !changed {
            return Ok(WalletDecision::Unchanged);
        }

        let (job, created) =
            store.enqueue_unique(self.periodic_job(wallet.id, assessment.priority, now), now)?;
        if !created {
            return Ok(WalletDecision::AlreadyQueued);
        }
        tracing::debug!(
            wallet_id = wallet.id,
            job_id = job.id,
            score = %assessment.score,
            level = %assessment.level,
            "Periodic audit scheduled"
        );
        Ok(WalletDecision::Scheduled)
    }

    /// Execution pass for one periodic job
    pub fn execute(&self, job: &AuditQueueJob) -> AuditResult<PeriodicOutcome> {
        let config = &self.services.config.periodic;
        let store = &self.services.store;
        let now = self.services.clock.now();

        let Some(wallet) = store.wallet(job.entity_id)? else {
            return Ok(PeriodicOutcome::Stale);
        };
        if wallet.updated_at < job.created_at - config.stale_grace() {
            tracing::debug!(wallet_id = wallet.id, job_id = job.id, "Stale periodic job discarded");
            return Ok(PeriodicOutcome::Stale);
        }

        let snapshot = store.insert_snapshot(NewSnapshot {
            wallet_id: wallet.id,
            balance: wallet.balance,
            transaction_count: store.completed_internal_count(wallet.id)?,
            snapshot_date: now,
            audit_type: AuditType::Periodic,
        })?;

        let history = store.snapshots_since(wallet.id, now - config.trend_window())?;
        let trend = analyze(&history);

        let mut anomalies_created = 0;
        let mut duplicates_suppressed = 0;
        if let Some(report) = &trend {
            for anomaly in trend_anomalies(wallet.id, report, config) {
                let anomaly = anomaly.meta("snapshot_id", snapshot.id);
                match self.recorder.record(anomaly, AnomalyScope::Periodic, AuditStatus::Pending)? {
                    Recorded::Created(log) => {
                        anomalies_created += 1;
                        self.recorder.notify(&log);
                    }
                    Recorded::Duplicate { .. } => duplicates_suppressed += 1,
                }
            }
        }

        let assessment = self.assess_wallet(&wallet, now)?;
        Ok(PeriodicOutcome::Completed {
            snapshot_id: snapshot.id,
            trend,
            anomalies_created,
            duplicates_suppressed,
            next_audit: self.periodic_job(wallet.id, assessment.priority, now + assessment.frequency),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use ledgerwatch_core::{Clock, Flow, ManualClock, Nature, Transaction, TxStatus};
    use ledgerwatch_store::MemoryStore;
    use rust_decimal_macros::dec;
    use std::sync::Arc;

    struct Fixture {
        store: Arc<MemoryStore>,
        clock: Arc<ManualClock>,
        services: AuditServices,
        auditor: PeriodicAuditor,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap()));
        let services = AuditServices::new(store.clone(), clock.clone(), Default::default());
        Fixture {
            auditor: PeriodicAuditor::new(services.clone()),
            services,
            store,
            clock,
        }
    }

    impl Fixture {
        fn funded_wallet(&self, id: i64, amount: Decimal) {
            let now = self.clock.now();
            self.store.insert_wallet(Wallet {
                id,
                user_id: id,
                balance: amount,
                updated_at: now,
            });
            self.store.insert_transaction(Transaction {
                id: id * 100,
                wallet_id: id,
                amount,
                flow: Flow::In,
                nature: Nature::Internal,
                status: TxStatus::Completed,
                created_at: now,
            });
        }
    }

    #[test]
    fn test_schedule_queues_active_wallets_and_global_job() {
        let f = fixture();
        f.funded_wallet(1, dec!(100));
        f.funded_wallet(2, dec!(200));

        let report = f.auditor.schedule().unwrap();
        assert_eq!(report.examined, 2);
        assert_eq!(report.scheduled, 2);

        let global = f.store.job(report.global_job.unwrap()).unwrap().unwrap();
        assert_eq!(global.audit_type, AuditType::Global);
        assert_eq!(global.scheduled_at, f.clock.now() + Duration::hours(24));

        // a second sweep finds everything already queued
        let again = f.auditor.schedule().unwrap();
        assert_eq!(again.scheduled, 0);
        assert_eq!(again.already_queued, 2);
        assert_eq!(again.global_job, report.global_job);
    }

    #[test]
    fn test_locked_wallet_is_skipped() {
        let f = fixture();
        f.funded_wallet(1, dec!(100));
        let _guard = f.services.entity_lock().try_acquire(EntityType::Wallet, 1).unwrap();

        let report = f.auditor.schedule().unwrap();
        assert_eq!(report.skipped_locked, 1);
        assert_eq!(report.scheduled, 0);
    }

    #[test]
    fn test_recent_audit_is_not_due() {
        let f = fixture();
        f.funded_wallet(1, dec!(100));
        let job = f.store.enqueue_unique(f.auditor.periodic_job(1, 8, f.clock.now()), f.clock.now()).unwrap().0;
        f.auditor.execute(&job).unwrap();
        f.store.complete_job(job.id).unwrap();

        f.clock.advance(Duration::hours(1));
        let report = f.auditor.schedule().unwrap();
        assert_eq!(report.skipped_not_due, 1);
    }

    #[test]
    fn test_unchanged_wallet_is_skipped() {
        let f = fixture();
        f.funded_wallet(1, dec!(100));
        f.store
            .insert_snapshot(NewSnapshot {
                wallet_id: 1,
                balance: dec!(100),
                transaction_count: 1,
                snapshot_date: f.clock.now(),
                audit_type: AuditType::Batch,
            })
            .unwrap();

        let report = f.auditor.schedule().unwrap();
        assert_eq!(report.skipped_unchanged, 1);
    }

    #[test]
    fn test_stale_job_is_discarded() {
        let f = fixture();
        f.funded_wallet(1, dec!(100));
        f.clock.advance(Duration::hours(3));
        let now = f.clock.now();
        let (job, _) = f.store.enqueue_unique(f.auditor.periodic_job(1, 5, now), now).unwrap();

        assert_eq!(f.auditor.execute(&job).unwrap(), PeriodicOutcome::Stale);
        assert!(f.store.snapshots(1).is_empty());
    }

    #[test]
    fn test_execute_snapshots_and_plans_next_audit() {
        let f = fixture();
        f.funded_wallet(1, dec!(100));
        let now = f.clock.now();
        let (job, _) = f.store.enqueue_unique(f.auditor.periodic_job(1, 5, now), now).unwrap();

        let PeriodicOutcome::Completed { next_audit, trend, .. } = f.auditor.execute(&job).unwrap() else {
            panic!("expected completed outcome");
        };
        assert!(trend.is_none());
        assert_eq!(f.store.snapshots(1).len(), 1);
        assert_eq!(next_audit.audit_type, AuditType::Periodic);
        // low risk: every 48h
        assert_eq!(next_audit.scheduled_at, now + Duration::hours(48));
        assert_eq!(next_audit.priority, 8);
    }

    #[test]
    fn test_execute_flags_sharp_decline() {
        let f = fixture();
        f.funded_wallet(1, dec!(1000));
        f.store
            .insert_snapshot(NewSnapshot {
                wallet_id: 1,
                balance: dec!(1000),
                transaction_count: 1,
                snapshot_date: f.clock.now(),
                audit_type: AuditType::Periodic,
            })
            .unwrap();

        f.clock.advance(Duration::days(2));
        let now = f.clock.now();
        f.store.set_wallet_balance(1, dec!(100), now).unwrap();
        let (job, _) = f.store.enqueue_unique(f.auditor.periodic_job(1, 5, now), now).unwrap();

        let PeriodicOutcome::Completed { anomalies_created, .. } = f.auditor.execute(&job).unwrap() else {
            panic!("expected completed outcome");
        };
        // a 90% drop between two snapshots is also highly volatile
        assert_eq!(anomalies_created, 2);
        let logs = f.store.entity_audit_logs(EntityType::Wallet, 1).unwrap();
        assert!(logs.iter().any(|l| l.invariant_violated == "sharp_balance_decline"));
        assert!(logs.iter().all(|l| l.audit_type == AuditType::Periodic));
    }
}
