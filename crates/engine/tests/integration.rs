//! Integration tests for the audit engine
//!
//! These drive the orchestrator, auditors and worker together against the
//! in-memory store, with one end-to-end run on SQLite.

use std::sync::{mpsc, Arc, Mutex};

use chrono::{Duration, TimeZone, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tempfile::TempDir;

use ledgerwatch_core::{
    AuditStatus, AuditType, Clock, EntityType, Flow, ManualClock, Nature, Severity, SystemWallet,
    Transaction, TransactionCompleted, TxStatus, UserId, Wallet, PRIORITY_HIGH,
};
use ledgerwatch_engine::{
    assess, fingerprint, AnomalyNotification, AuditConfig, AuditOrchestrator, AuditServices,
    GlobalAuditor, MemoryNotifier, NotificationRouter, Notifier, NotifyError, QueueWorker,
    Resolution, RiskInputs, StaticDirectory, TargetedAuditor, TargetedOutcome,
};
use ledgerwatch_store::{
    AuditLogRepository, AuditQueueRepository, CorrectionRepository, Fault, LedgerRepository, MemoryStore,
    SnapshotRepository, SqliteStore, WalletRepository,
};

const AUDITOR: UserId = 900;

struct Platform {
    store: Arc<MemoryStore>,
    clock: Arc<ManualClock>,
    notifier: Arc<MemoryNotifier>,
    services: AuditServices,
    orchestrator: AuditOrchestrator,
    next_tx: i64,
}

impl Platform {
    fn new() -> Self {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap()));
        let notifier = Arc::new(MemoryNotifier::new());
        let router = NotificationRouter::new(
            Arc::new(StaticDirectory::new([AUDITOR])),
            notifier.clone(),
        );
        let services = AuditServices::new(store.clone(), clock.clone(), AuditConfig::default())
            .with_notifications(router);
        Self {
            orchestrator: AuditOrchestrator::new(services.clone()),
            services,
            store,
            clock,
            notifier,
            next_tx: 1,
        }
    }

    fn open_wallet(&self, id: i64, balance: Decimal) {
        self.store.insert_wallet(Wallet {
            id,
            user_id: id,
            balance,
            updated_at: self.clock.now(),
        });
    }

    /// Append a completed ledger entry without touching the cached balance
    fn ledger_entry(&mut self, wallet_id: i64, amount: Decimal, flow: Flow) -> Transaction {
        let tx = Transaction {
            id: self.next_tx,
            wallet_id,
            amount,
            flow,
            nature: Nature::Internal,
            status: TxStatus::Completed,
            created_at: self.clock.now(),
        };
        self.next_tx += 1;
        self.store.insert_transaction(tx.clone());
        tx
    }

    /// Commit a transaction the way the business layer would, then audit it
    fn commit(&mut self, wallet_id: i64, amount: Decimal, flow: Flow, update_cache: bool) {
        let tx = self.ledger_entry(wallet_id, amount, flow);
        if update_cache {
            let wallet = self.store.wallet(wallet_id).unwrap().unwrap();
            self.store
                .set_wallet_balance(wallet_id, wallet.balance + tx.signed_amount(), self.clock.now())
                .unwrap();
        }
        self.orchestrator.audit_transaction(&TransactionCompleted::from(&tx));
        self.clock.advance(Duration::minutes(1));
    }

    fn targeted(&self) -> TargetedAuditor {
        TargetedAuditor::new(self.services.clone())
    }

    fn logs_for(&self, wallet_id: i64) -> Vec<ledgerwatch_core::AuditLog> {
        self.store.entity_audit_logs(EntityType::Wallet, wallet_id).unwrap()
    }
}

/// Wallet 1 with a cached `balance` backed by a single deposit of `ledger`
fn drifted(platform: &mut Platform, balance: Decimal, ledger: Decimal) -> Transaction {
    platform.open_wallet(1, balance);
    platform.ledger_entry(1, ledger, Flow::In)
}

#[test]
fn test_scenario_consistent_wallet_is_clean() {
    let mut p = Platform::new();
    p.open_wallet(1, dec!(0));
    p.commit(1, dec!(100), Flow::In, true);

    assert_eq!(p.store.audit_log_count(), 0);
    assert_eq!(p.notifier.count(), 0);
}

#[test]
fn test_scenario_stale_cache_is_medium_mismatch() {
    let mut p = Platform::new();
    let tx = drifted(&mut p, dec!(100), dec!(95));

    let report = p
        .orchestrator
        .audit_transaction(&TransactionCompleted::from(&tx))
        .unwrap();
    assert_eq!(report.anomalies_created, 1);

    let logs = p.logs_for(1);
    assert_eq!(logs.len(), 1);
    let log = &logs[0];
    assert_eq!(log.invariant_violated, "balance_ledger_mismatch");
    assert_eq!(log.expected_value, dec!(95));
    assert_eq!(log.actual_value, dec!(100));
    assert_eq!(log.difference, dec!(5));
    assert_eq!(log.severity, Severity::Medium);
    assert_eq!(log.status, AuditStatus::Pending);
    assert_eq!(p.notifier.sent()[0].0, AUDITOR);
}

#[test]
fn test_balance_matches_ledger_or_mismatch_is_logged() {
    let mut p = Platform::new();
    for id in 1..=3 {
        p.open_wallet(id, dec!(0));
    }
    p.commit(1, dec!(40), Flow::In, true);
    p.commit(1, dec!(15.5), Flow::Out, true);
    p.commit(2, dec!(200), Flow::In, true);
    // cache update lost
    p.commit(2, dec!(30), Flow::Out, false);
    p.commit(3, dec!(12.34), Flow::In, true);
    p.commit(3, dec!(0.004), Flow::In, false);

    for id in 1..=3 {
        let wallet = p.store.wallet(id).unwrap().unwrap();
        let ledger: Decimal = p
            .store
            .wallet_transactions(id)
            .unwrap()
            .iter()
            .filter(|tx| tx.counts_toward_balance())
            .map(|tx| tx.signed_amount())
            .sum();
        let consistent = (wallet.balance - ledger).abs() < dec!(0.01);
        let logged = p.logs_for(id).iter().any(|log| {
            log.invariant_violated == "balance_ledger_mismatch"
                && log.expected_value == ledger
                && log.actual_value == wallet.balance
        });
        assert!(consistent || logged, "wallet {} drifted silently", id);
    }
    assert_eq!(p.logs_for(2).len(), 1);
    assert!(p.logs_for(3).is_empty());
}

#[test]
fn test_sub_cent_drift_is_auto_corrected() {
    let mut p = Platform::new();
    drifted(&mut p, dec!(100.005), dec!(100));

    let TargetedOutcome::Completed(report) = p.targeted().audit_wallet(1).unwrap() else {
        panic!("expected a completed reconciliation");
    };
    assert_eq!(report.findings.len(), 1);
    assert_eq!(report.findings[0].resolution, Resolution::AutoCorrected);

    let log = p.store.audit_log(report.findings[0].audit_log_id.unwrap()).unwrap().unwrap();
    assert_eq!(log.status, AuditStatus::Resolved);
    assert_eq!(log.audit_type, AuditType::Batch);
    assert_eq!(log.metadata.get("auto_corrected"), Some(&serde_json::json!(true)));
    assert_eq!(p.store.wallet(1).unwrap().unwrap().balance, dec!(100));
    // corrections are not escalated
    assert_eq!(p.notifier.count(), 0);
}

#[test]
fn test_real_mismatch_is_escalated_with_correction_request() {
    let mut p = Platform::new();
    drifted(&mut p, dec!(150), dec!(100));

    let TargetedOutcome::Completed(report) = p.targeted().audit_wallet(1).unwrap() else {
        panic!("expected a completed reconciliation");
    };
    let finding = &report.findings[0];
    assert_eq!(finding.resolution, Resolution::Escalated);
    // 50 of 150 is far above the 10% critical ratio
    assert_eq!(finding.severity, Severity::Critical);

    let log = p.store.audit_log(finding.audit_log_id.unwrap()).unwrap().unwrap();
    assert_eq!(log.status, AuditStatus::Investigating);
    assert!(log.processed_at.is_some());
    assert_eq!(p.store.wallet(1).unwrap().unwrap().balance, dec!(150));
    assert_eq!(p.notifier.count(), 1);

    let requests = p.orchestrator.open_correction_requests().unwrap();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].audit_log_id, log.id);
    assert_eq!(requests[0].ledger_balance, dec!(100));
    assert_eq!(Some(requests[0].id), finding.correction_request_id);
}

#[test]
fn test_failed_correction_rolls_back_and_escalates() {
    let mut p = Platform::new();
    drifted(&mut p, dec!(100.005), dec!(100));
    p.store.inject_failure(Fault::BalanceWrite);

    let TargetedOutcome::Completed(report) = p.targeted().audit_wallet(1).unwrap() else {
        panic!("expected a completed reconciliation");
    };
    assert_eq!(report.findings[0].resolution, Resolution::Escalated);

    let logs = p.logs_for(1);
    assert_eq!(logs.len(), 1, "the rolled back log must not survive");
    assert_eq!(logs[0].status, AuditStatus::Investigating);
    assert!(logs[0].metadata.contains_key("auto_correction_error"));
    assert_eq!(p.store.wallet(1).unwrap().unwrap().balance, dec!(100.005));
}

#[test]
fn test_locked_wallet_is_left_untouched() {
    let mut p = Platform::new();
    drifted(&mut p, dec!(150), dec!(100));
    let in_flight = p
        .services
        .entity_lock()
        .try_acquire(EntityType::Wallet, 1)
        .unwrap();

    assert_eq!(p.targeted().audit_wallet(1).unwrap(), TargetedOutcome::Locked);
    assert!(p.store.snapshots(1).is_empty());
    assert_eq!(p.store.audit_log_count(), 0);

    drop(in_flight);
    assert!(matches!(
        p.targeted().audit_wallet(1).unwrap(),
        TargetedOutcome::Completed(_)
    ));
    // the rerun finds the same condition already on file
    let TargetedOutcome::Completed(again) = p.targeted().audit_wallet(1).unwrap() else {
        panic!("expected a completed reconciliation");
    };
    assert_eq!(again.findings[0].resolution, Resolution::Duplicate);
    assert_eq!(p.store.audit_log_count(), 1);
}

/// Holds the escalating audit inside its lock until the test lets go
struct GateNotifier {
    entered: Mutex<Option<mpsc::Sender<()>>>,
    release: Mutex<mpsc::Receiver<()>>,
}

impl Notifier for GateNotifier {
    fn notify(&self, _: UserId, _: &AnomalyNotification) -> Result<(), NotifyError> {
        if let Some(entered) = self.entered.lock().unwrap().take() {
            entered.send(()).unwrap();
        }
        let _ = self.release.lock().unwrap().recv();
        Ok(())
    }
}

#[test]
fn test_second_audit_observes_the_lock() {
    let mut p = Platform::new();
    drifted(&mut p, dec!(150), dec!(100));
    let (entered_tx, entered_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel();
    let gate = Arc::new(GateNotifier {
        entered: Mutex::new(Some(entered_tx)),
        release: Mutex::new(release_rx),
    });
    let services = p.services.clone().with_notifications(NotificationRouter::new(
        Arc::new(StaticDirectory::new([AUDITOR])),
        gate,
    ));

    let holder = TargetedAuditor::new(services);
    let handle = std::thread::spawn(move || holder.audit_wallet(1).unwrap());
    // the first audit has committed its finding and still holds the lock
    entered_rx.recv().unwrap();

    assert_eq!(p.targeted().audit_wallet(1).unwrap(), TargetedOutcome::Locked);
    assert_eq!(p.store.snapshots(1).len(), 1);

    release_tx.send(()).unwrap();
    let TargetedOutcome::Completed(report) = handle.join().unwrap() else {
        panic!("expected a completed reconciliation");
    };
    assert_eq!(report.findings[0].resolution, Resolution::Escalated);
    assert_eq!(p.store.audit_log_count(), 1);
    assert!(!p.services.entity_lock().is_locked(EntityType::Wallet, 1));
}

#[test]
fn test_lock_is_shared_by_stores_on_one_database() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("audit.db");
    let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap()));
    let first = Arc::new(SqliteStore::open(&path).unwrap());
    let second = Arc::new(SqliteStore::open(&path).unwrap());
    first
        .insert_wallet(&Wallet {
            id: 1,
            user_id: 1,
            balance: dec!(0),
            updated_at: clock.now(),
        })
        .unwrap();

    let holder = AuditServices::new(first, clock.clone(), AuditConfig::default());
    let other = AuditServices::new(second.clone(), clock.clone(), AuditConfig::default());
    let guard = holder.entity_lock().try_acquire(EntityType::Wallet, 1).unwrap();

    assert_eq!(TargetedAuditor::new(other.clone()).audit_wallet(1).unwrap(), TargetedOutcome::Locked);
    assert!(other.entity_lock().is_locked(EntityType::Wallet, 1));

    drop(guard);
    assert!(matches!(
        TargetedAuditor::new(other).audit_wallet(1).unwrap(),
        TargetedOutcome::Completed(_)
    ));
    assert_eq!(second.latest_snapshot(1, None).unwrap().map(|s| s.wallet_id), Some(1));
}

#[test]
fn test_interrupted_escalation_completes_on_retry() {
    let mut p = Platform::new();
    drifted(&mut p, dec!(150), dec!(100));
    p.orchestrator.schedule_targeted_audit(1, PRIORITY_HIGH).unwrap();
    p.store.inject_failure(Fault::AuditLogUpdate);
    let worker = QueueWorker::new(p.services.clone());

    let first = worker.drain_once().unwrap();
    assert_eq!(first.failed, 1);
    // nothing half-written survives the failed attempt
    assert_eq!(p.store.audit_log_count(), 0);
    assert!(p.orchestrator.open_correction_requests().unwrap().is_empty());
    assert_eq!(p.notifier.count(), 0);

    p.clock.advance(Duration::minutes(5));
    let second = worker.drain_once().unwrap();
    assert_eq!(second.completed, 1);

    let logs = p.logs_for(1);
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].status, AuditStatus::Investigating);
    assert!(logs[0].processed_at.is_some());
    assert_eq!(p.notifier.count(), 1);
    let requests = p.orchestrator.open_correction_requests().unwrap();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].audit_log_id, logs[0].id);
    assert_eq!(p.store.queue_depth().unwrap(), 0);
}

#[test]
fn test_balance_without_history_is_data_corruption() {
    let p = Platform::new();
    p.open_wallet(1, dec!(75));
    // small enough to auto-correct if it were a plain mismatch
    p.open_wallet(2, dec!(0.005));

    for (wallet_id, balance) in [(1, dec!(75)), (2, dec!(0.005))] {
        let TargetedOutcome::Completed(report) = p.targeted().audit_wallet(wallet_id).unwrap() else {
            panic!("expected a completed reconciliation");
        };
        assert_eq!(report.transaction_count, 0);
        let finding = &report.findings[0];
        assert_eq!(finding.invariant, "data_corruption");
        assert_eq!(finding.severity, Severity::Critical);
        assert_eq!(finding.resolution, Resolution::Escalated);

        let log = p.store.audit_log(finding.audit_log_id.unwrap()).unwrap().unwrap();
        assert_eq!(log.status, AuditStatus::Investigating);
        assert_eq!(log.expected_value, dec!(0));
        assert_eq!(log.actual_value, balance);
        assert_eq!(p.store.wallet(wallet_id).unwrap().unwrap().balance, balance);
    }

    let requests = p.orchestrator.open_correction_requests().unwrap();
    assert_eq!(requests.len(), 2);
    assert!(requests.iter().all(|r| r.ledger_balance == dec!(0)));
    assert_eq!(requests[0].current_balance, dec!(75));
    assert_eq!(p.notifier.count(), 2);
}

#[test]
fn test_fingerprint_is_stable() {
    let a = fingerprint("balance_ledger_mismatch", EntityType::Wallet, 7, ledgerwatch_core::AnomalyScope::Global);
    let b = fingerprint("balance_ledger_mismatch", EntityType::Wallet, 7, ledgerwatch_core::AnomalyScope::Global);
    assert_eq!(a, b);
    assert_eq!(a.len(), 64);
}

fn system(p: &Platform, solde: Decimal, engagement: Decimal, profit: Decimal) {
    p.store.set_system_wallet(SystemWallet {
        solde_marchand: solde,
        engagement_users: engagement,
        plateforme_benefices: profit,
        updated_at: p.clock.now(),
    });
}

#[test]
fn test_scenario_accounting_equation_holds() {
    let p = Platform::new();
    system(&p, dec!(1000), dec!(400), dec!(600));

    p.orchestrator.execute_global_audit().unwrap();
    assert!(p
        .store
        .recent_audit_logs(50)
        .unwrap()
        .iter()
        .all(|l| l.invariant_violated != "accounting_equation_violation"));
}

#[test]
fn test_scenario_accounting_equation_violation_logged_once() {
    let p = Platform::new();
    system(&p, dec!(1000), dec!(400), dec!(550));

    p.orchestrator.execute_global_audit().unwrap();
    p.clock.advance(Duration::hours(24));
    p.orchestrator.execute_global_audit().unwrap();

    let violations: Vec<_> = p
        .store
        .entity_audit_logs(EntityType::System, 0)
        .unwrap()
        .into_iter()
        .filter(|l| l.invariant_violated == "accounting_equation_violation")
        .collect();
    assert_eq!(violations.len(), 1);
    assert_eq!(violations[0].expected_value, dec!(950));
    assert_eq!(violations[0].actual_value, dec!(1000));
    assert_eq!(violations[0].difference, dec!(50));
    assert_eq!(violations[0].severity, Severity::High);
    assert_eq!(violations[0].audit_type, AuditType::Global);
}

#[test]
fn test_higher_volume_is_audited_at_least_as_often() {
    let config = AuditConfig::default().periodic;
    let base = RiskInputs {
        daily_volume: dec!(0),
        transaction_count_30d: 40,
        unresolved_anomalies: 0,
        balance: dec!(2500),
        days_inactive: 2,
    };
    let volumes = [dec!(0), dec!(500), dec!(5000), dec!(20000), dec!(49999), dec!(50001), dec!(90000)];
    for pair in volumes.windows(2) {
        let lower = assess(&RiskInputs { daily_volume: pair[0], ..base.clone() }, &config);
        let higher = assess(&RiskInputs { daily_volume: pair[1], ..base.clone() }, &config);
        assert!(
            higher.frequency <= lower.frequency,
            "volume {} audited less often than {}",
            pair[1],
            pair[0]
        );
    }
}

#[test]
fn test_realtime_to_worker_flow() {
    let mut p = Platform::new();
    p.open_wallet(1, dec!(0));
    p.commit(1, dec!(2500), Flow::In, true);

    let job = p
        .store
        .outstanding_job(EntityType::Wallet, 1, AuditType::Batch)
        .unwrap()
        .expect("large transaction queues a targeted audit");
    let worker = QueueWorker::new(p.services.clone());

    // debounced: not due yet
    assert_eq!(worker.drain_once().unwrap().processed(), 0);

    p.clock.advance(Duration::minutes(5));
    let report = worker.drain_once().unwrap();
    assert_eq!(report.completed, 1);
    assert!(p.store.job(job.id).unwrap().is_none());
    assert_eq!(p.store.snapshots(1).len(), 1);
    assert_eq!(p.store.audit_log_count(), 0);
}

#[test]
fn test_schedule_and_execute_periodic_audits() {
    let mut p = Platform::new();
    p.open_wallet(1, dec!(0));
    p.open_wallet(2, dec!(0));
    p.commit(1, dec!(300), Flow::In, true);
    p.commit(2, dec!(80), Flow::In, true);
    system(&p, dec!(380), dec!(380), dec!(0));

    assert_eq!(p.orchestrator.schedule_periodic_audits().unwrap(), 2);
    let stats = p.orchestrator.audit_stats().unwrap();
    // two wallet jobs plus the global one
    assert_eq!(stats.queue_depth, 3);

    let worker = QueueWorker::new(p.services.clone());
    let report = worker.drain_once().unwrap();
    assert_eq!(report.completed, 2);
    assert_eq!(p.store.snapshots(1).len(), 1);
    assert!(p.store.outstanding_job(EntityType::Wallet, 1, AuditType::Periodic).unwrap().is_some());

    p.clock.advance(Duration::hours(24));
    let report = worker.drain_once().unwrap();
    assert!(report.completed >= 1);
    assert!(p.store.outstanding_job(EntityType::System, 0, AuditType::Global).unwrap().is_none());
}

#[test]
fn test_global_auditor_runs_from_queue_with_custom_detectors() {
    let p = Platform::new();
    system(&p, dec!(1000), dec!(400), dec!(550));
    p.orchestrator.schedule_periodic_audits().unwrap();
    p.clock.advance(Duration::hours(25));

    let worker = QueueWorker::new(p.services.clone())
        .with_global_auditor(GlobalAuditor::new(p.services.clone()).with_detectors(Vec::new()));
    assert_eq!(worker.drain_once().unwrap().completed, 1);
    assert!(p.notifier.count() > 0);
}

#[test]
fn test_end_to_end_on_sqlite() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(SqliteStore::open(dir.path().join("audit.db")).unwrap());
    let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap()));
    let services = AuditServices::new(store.clone(), clock.clone(), AuditConfig::default());
    let orchestrator = AuditOrchestrator::new(services.clone());

    let tx = Transaction {
        id: 1,
        wallet_id: 1,
        amount: dec!(1500),
        flow: Flow::In,
        nature: Nature::Internal,
        status: TxStatus::Completed,
        created_at: clock.now(),
    };
    store
        .insert_wallet(&Wallet {
            id: 1,
            user_id: 1,
            balance: dec!(1500),
            updated_at: clock.now(),
        })
        .unwrap();
    store.insert_transaction(&tx).unwrap();

    let report = orchestrator
        .audit_transaction(&TransactionCompleted::from(&tx))
        .unwrap();
    assert_eq!(report.anomalies_created, 0);
    assert!(report.targeted_job.is_some());

    // rounding drift appears before the targeted audit runs
    store.set_wallet_balance(1, dec!(1500.005), clock.now()).unwrap();
    clock.advance(Duration::minutes(6));

    let drained = QueueWorker::new(services).drain_once().unwrap();
    assert_eq!(drained.completed, 1);
    assert_eq!(store.wallet(1).unwrap().unwrap().balance, dec!(1500));

    let logs = orchestrator.recent_audit_logs(10).unwrap();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].status, AuditStatus::Resolved);
    let stats = orchestrator.audit_stats().unwrap();
    assert_eq!(stats.by_status.get("resolved"), Some(&1));
    assert_eq!(stats.queue_depth, 0);
    assert!(store.open_correction_requests().unwrap().is_empty());
}
