//! In-memory storage engine
//!
//! Backs tests and embedded use. A reentrant lock serialises every call;
//! [`TransactionRunner`] holds it for the whole unit of work and restores a
//! copy of the state on error, so rollbacks are exact.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::ops::Bound;

use chrono::{DateTime, Duration, Utc};
use parking_lot::{Mutex, ReentrantMutex};
use rust_decimal::Decimal;
use serde_json::{Map, Value};

use ledgerwatch_core::{
    AuditLog, AuditLogId, AuditQueueJob, AuditSnapshot, AuditStatus, AuditType,
    CorrectionRequest, CorrectionStatus, EntityType, JobId, Nature, NewAuditJob, NewAuditLog,
    NewSnapshot, SystemTransaction, SystemWallet, Transaction, Wallet, WalletId,
};

use crate::error::{StoreError, StoreResult};
use crate::repository::*;

/// One-shot failure points for exercising rollback and retry paths
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Fault {
    LedgerRead,
    SystemRead,
    BalanceWrite,
    AuditLogWrite,
    AuditLogUpdate,
}

#[derive(Debug, Clone, Default)]
struct MemoryState {
    wallets: BTreeMap<WalletId, Wallet>,
    transactions: Vec<Transaction>,
    system_wallet: Option<SystemWallet>,
    system_transactions: Vec<SystemTransaction>,
    audit_logs: BTreeMap<AuditLogId, AuditLog>,
    jobs: BTreeMap<JobId, AuditQueueJob>,
    snapshots: Vec<AuditSnapshot>,
    corrections: Vec<CorrectionRequest>,
    last_id: i64,
}

impl MemoryState {
    fn next_id(&mut self) -> i64 {
        self.last_id += 1;
        self.last_id
    }

    fn completed_for(&self, wallet_id: WalletId) -> impl Iterator<Item = &Transaction> {
        self.transactions
            .iter()
            .filter(move |tx| tx.wallet_id == wallet_id && tx.is_completed())
    }
}

struct Inner {
    state: RefCell<MemoryState>,
    depth: Cell<u32>,
}

/// In-memory [`AuditStore`](crate::AuditStore)
pub struct MemoryStore {
    inner: ReentrantMutex<Inner>,
    faults: Mutex<HashSet<Fault>>,
    /// Outside the transactional state: a rollback never frees a lock
    leases: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: ReentrantMutex::new(Inner {
                state: RefCell::new(MemoryState::default()),
                depth: Cell::new(0),
            }),
            faults: Mutex::new(HashSet::new()),
            leases: Mutex::new(HashMap::new()),
        }
    }

    fn read<T>(&self, f: impl FnOnce(&MemoryState) -> T) -> T {
        let guard = self.inner.lock();
        let state = guard.state.borrow();
        f(&state)
    }

    fn write<T>(&self, f: impl FnOnce(&mut MemoryState) -> T) -> T {
        let guard = self.inner.lock();
        let mut state = guard.state.borrow_mut();
        f(&mut state)
    }

    fn check(&self, fault: Fault) -> StoreResult<()> {
        if self.faults.lock().remove(&fault) {
            return Err(StoreError::Injected(format!("{:?}", fault)));
        }
        Ok(())
    }

    /// Make the next operation at `fault` fail once
    pub fn inject_failure(&self, fault: Fault) {
        self.faults.lock().insert(fault);
    }

    // === Ledger seeding (owned by the business layer in production) ===

    pub fn insert_wallet(&self, wallet: Wallet) {
        self.write(|s| {
            s.wallets.insert(wallet.id, wallet);
        });
    }

    pub fn insert_transaction(&self, tx: Transaction) {
        self.write(|s| s.transactions.push(tx));
    }

    pub fn set_system_wallet(&self, system: SystemWallet) {
        self.write(|s| s.system_wallet = Some(system));
    }

    pub fn insert_system_transaction(&self, tx: SystemTransaction) {
        self.write(|s| s.system_transactions.push(tx));
    }

    pub fn snapshots(&self, wallet_id: WalletId) -> Vec<AuditSnapshot> {
        self.read(|s| {
            s.snapshots
                .iter()
                .filter(|snap| snap.wallet_id == wallet_id)
                .cloned()
                .collect()
        })
    }

    pub fn audit_log_count(&self) -> usize {
        self.read(|s| s.audit_logs.len())
    }
}

impl WalletRepository for MemoryStore {
    fn wallet(&self, id: WalletId) -> StoreResult<Option<Wallet>> {
        Ok(self.read(|s| s.wallets.get(&id).cloned()))
    }

    fn wallets_page(&self, after: Option<WalletId>, limit: usize) -> StoreResult<Vec<Wallet>> {
        let start = match after {
            Some(id) => Bound::Excluded(id),
            None => Bound::Unbounded,
        };
        Ok(self.read(|s| {
            s.wallets
                .range((start, Bound::Unbounded))
                .take(limit)
                .map(|(_, w)| w.clone())
                .collect()
        }))
    }

    fn active_wallets(&self, since: DateTime<Utc>) -> StoreResult<Vec<Wallet>> {
        Ok(self.read(|s| {
            s.wallets
                .values()
                .filter(|w| {
                    !w.balance.is_zero()
                        || s.completed_for(w.id).any(|tx| tx.created_at >= since)
                })
                .cloned()
                .collect()
        }))
    }

    fn total_wallet_balance(&self) -> StoreResult<Decimal> {
        Ok(self.read(|s| s.wallets.values().map(|w| w.balance).sum()))
    }

    fn set_wallet_balance(
        &self,
        id: WalletId,
        balance: Decimal,
        at: DateTime<Utc>,
    ) -> StoreResult<()> {
        self.check(Fault::BalanceWrite)?;
        self.write(|s| match s.wallets.get_mut(&id) {
            Some(wallet) => {
                wallet.balance = balance;
                wallet.updated_at = at;
                Ok(())
            }
            None => Err(StoreError::not_found("Wallet", id)),
        })
    }
}

impl LedgerRepository for MemoryStore {
    fn wallet_transactions(&self, wallet_id: WalletId) -> StoreResult<Vec<Transaction>> {
        self.check(Fault::LedgerRead)?;
        let mut txs: Vec<Transaction> = self.read(|s| {
            s.transactions
                .iter()
                .filter(|tx| tx.wallet_id == wallet_id)
                .cloned()
                .collect()
        });
        txs.sort_by_key(|tx| (tx.created_at, tx.id));
        Ok(txs)
    }

    fn completed_internal_sum(&self, wallet_id: WalletId) -> StoreResult<Decimal> {
        self.check(Fault::LedgerRead)?;
        Ok(self.read(|s| {
            s.completed_for(wallet_id)
                .filter(|tx| tx.nature == Nature::Internal)
                .map(|tx| tx.signed_amount())
                .sum()
        }))
    }

    fn completed_internal_count(&self, wallet_id: WalletId) -> StoreResult<u64> {
        self.check(Fault::LedgerRead)?;
        Ok(self.read(|s| {
            s.completed_for(wallet_id)
                .filter(|tx| tx.nature == Nature::Internal)
                .count() as u64
        }))
    }

    fn wallet_activity(
        &self,
        wallet_id: WalletId,
        since: DateTime<Utc>,
    ) -> StoreResult<WalletActivity> {
        self.check(Fault::LedgerRead)?;
        Ok(self.read(|s| {
            s.completed_for(wallet_id)
                .filter(|tx| tx.created_at >= since)
                .fold(WalletActivity::default(), |mut acc, tx| {
                    acc.transaction_count += 1;
                    acc.volume += tx.amount.abs();
                    acc.last_transaction_at = acc.last_transaction_at.max(Some(tx.created_at));
                    acc
                })
        }))
    }

    fn net_internal_wallet_flow(&self) -> StoreResult<Decimal> {
        self.check(Fault::LedgerRead)?;
        Ok(self.read(|s| {
            s.transactions
                .iter()
                .filter(|tx| tx.counts_toward_balance())
                .map(|tx| tx.signed_amount())
                .sum()
        }))
    }
}

impl SystemLedgerRepository for MemoryStore {
    fn system_wallet(&self) -> StoreResult<Option<SystemWallet>> {
        self.check(Fault::SystemRead)?;
        Ok(self.read(|s| s.system_wallet.clone()))
    }

    fn system_net_flow(&self, nature: Option<Nature>) -> StoreResult<Decimal> {
        self.check(Fault::SystemRead)?;
        Ok(self.read(|s| {
            s.system_transactions
                .iter()
                .filter(|tx| tx.status == ledgerwatch_core::TxStatus::Completed)
                .filter(|tx| nature.map_or(true, |n| tx.nature == n))
                .map(|tx| tx.signed_amount())
                .sum()
        }))
    }
}

impl AuditLogRepository for MemoryStore {
    fn insert_audit_log(&self, log: NewAuditLog, at: DateTime<Utc>) -> StoreResult<AuditLog> {
        self.check(Fault::AuditLogWrite)?;
        Ok(self.write(|s| {
            let id = s.next_id();
            let log = log.into_log(id, at);
            s.audit_logs.insert(id, log.clone());
            log
        }))
    }

    fn audit_log(&self, id: AuditLogId) -> StoreResult<Option<AuditLog>> {
        Ok(self.read(|s| s.audit_logs.get(&id).cloned()))
    }

    fn find_by_fingerprint(&self, fingerprint: &str) -> StoreResult<Option<AuditLog>> {
        Ok(self.read(|s| {
            s.audit_logs
                .values()
                .find(|log| log.fingerprint == fingerprint)
                .cloned()
        }))
    }

    fn update_audit_status(
        &self,
        id: AuditLogId,
        status: AuditStatus,
        processed_at: Option<DateTime<Utc>>,
        metadata: Option<Map<String, Value>>,
    ) -> StoreResult<()> {
        self.check(Fault::AuditLogUpdate)?;
        self.write(|s| match s.audit_logs.get_mut(&id) {
            Some(log) => {
                log.status = status;
                if processed_at.is_some() {
                    log.processed_at = processed_at;
                }
                if let Some(metadata) = metadata {
                    log.metadata = metadata;
                }
                Ok(())
            }
            None => Err(StoreError::not_found("AuditLog", id)),
        })
    }

    fn recent_audit_logs(&self, limit: usize) -> StoreResult<Vec<AuditLog>> {
        Ok(self.read(|s| {
            let mut logs: Vec<AuditLog> = s.audit_logs.values().cloned().collect();
            logs.sort_by(|a, b| (b.created_at, b.id).cmp(&(a.created_at, a.id)));
            logs.truncate(limit);
            logs
        }))
    }

    fn entity_audit_logs(
        &self,
        entity_type: EntityType,
        entity_id: i64,
    ) -> StoreResult<Vec<AuditLog>> {
        Ok(self.read(|s| {
            let mut logs: Vec<AuditLog> = s
                .audit_logs
                .values()
                .filter(|log| log.entity_type == entity_type && log.entity_id == entity_id)
                .cloned()
                .collect();
            logs.sort_by(|a, b| (b.created_at, b.id).cmp(&(a.created_at, a.id)));
            logs
        }))
    }

    fn count_unresolved(&self, entity_type: EntityType, entity_id: i64) -> StoreResult<u64> {
        Ok(self.read(|s| {
            s.audit_logs
                .values()
                .filter(|log| {
                    log.entity_type == entity_type
                        && log.entity_id == entity_id
                        && !log.is_resolved()
                })
                .count() as u64
        }))
    }

    fn count_audit_logs_by(&self, grouping: LogGrouping) -> StoreResult<Vec<(String, u64)>> {
        Ok(self.read(|s| {
            let mut counts: BTreeMap<String, u64> = BTreeMap::new();
            for log in s.audit_logs.values() {
                let key = match grouping {
                    LogGrouping::Status => log.status.to_string(),
                    LogGrouping::Severity => log.severity.to_string(),
                    LogGrouping::AuditType => log.audit_type.to_string(),
                };
                *counts.entry(key).or_insert(0) += 1;
            }
            counts.into_iter().collect()
        }))
    }
}

impl AuditQueueRepository for MemoryStore {
    fn enqueue_unique(
        &self,
        job: NewAuditJob,
        at: DateTime<Utc>,
    ) -> StoreResult<(AuditQueueJob, bool)> {
        Ok(self.write(|s| {
            let existing = s.jobs.values().find(|j| {
                j.entity_type == job.entity_type
                    && j.entity_id == job.entity_id
                    && j.audit_type == job.audit_type
                    && !j.is_exhausted()
            });
            if let Some(existing) = existing {
                return (existing.clone(), false);
            }
            let id = s.next_id();
            let job = job.into_job(id, at);
            s.jobs.insert(id, job.clone());
            (job, true)
        }))
    }

    fn job(&self, id: JobId) -> StoreResult<Option<AuditQueueJob>> {
        Ok(self.read(|s| s.jobs.get(&id).cloned()))
    }

    fn outstanding_job(
        &self,
        entity_type: EntityType,
        entity_id: i64,
        audit_type: AuditType,
    ) -> StoreResult<Option<AuditQueueJob>> {
        Ok(self.read(|s| {
            s.jobs
                .values()
                .find(|j| {
                    j.entity_type == entity_type
                        && j.entity_id == entity_id
                        && j.audit_type == audit_type
                        && !j.is_exhausted()
                })
                .cloned()
        }))
    }

    fn claim_due(
        &self,
        queue_name: &str,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> StoreResult<Option<AuditQueueJob>> {
        Ok(self.write(|s| {
            let next = s
                .jobs
                .values()
                .filter(|j| j.queue_name == queue_name && j.is_due(now))
                .min_by_key(|j| (j.priority, j.scheduled_at, j.id))
                .map(|j| j.id)?;
            let job = s.jobs.get_mut(&next)?;
            job.reserved_until = Some(now + lease);
            Some(job.clone())
        }))
    }

    fn complete_job(&self, id: JobId) -> StoreResult<()> {
        self.write(|s| match s.jobs.remove(&id) {
            Some(_) => Ok(()),
            None => Err(StoreError::not_found("AuditQueueJob", id)),
        })
    }

    fn defer_job(&self, id: JobId, until: DateTime<Utc>) -> StoreResult<()> {
        self.write(|s| match s.jobs.get_mut(&id) {
            Some(job) => {
                job.reserved_until = None;
                job.scheduled_at = until;
                Ok(())
            }
            None => Err(StoreError::not_found("AuditQueueJob", id)),
        })
    }

    fn record_job_failure(
        &self,
        id: JobId,
        error: &str,
        retry_at: DateTime<Utc>,
    ) -> StoreResult<AuditQueueJob> {
        self.write(|s| match s.jobs.get_mut(&id) {
            Some(job) => {
                job.attempts += 1;
                job.last_error = Some(error.to_string());
                job.reserved_until = None;
                job.scheduled_at = retry_at;
                Ok(job.clone())
            }
            None => Err(StoreError::not_found("AuditQueueJob", id)),
        })
    }

    fn queue_depth(&self) -> StoreResult<u64> {
        Ok(self.read(|s| s.jobs.values().filter(|j| !j.is_exhausted()).count() as u64))
    }

    fn failed_jobs(&self) -> StoreResult<Vec<AuditQueueJob>> {
        Ok(self.read(|s| {
            s.jobs
                .values()
                .filter(|j| j.is_exhausted())
                .cloned()
                .collect()
        }))
    }
}

impl SnapshotRepository for MemoryStore {
    fn insert_snapshot(&self, snapshot: NewSnapshot) -> StoreResult<AuditSnapshot> {
        Ok(self.write(|s| {
            let id = s.next_id();
            let snapshot = snapshot.into_snapshot(id);
            s.snapshots.push(snapshot.clone());
            snapshot
        }))
    }

    fn latest_snapshot(
        &self,
        wallet_id: WalletId,
        audit_type: Option<AuditType>,
    ) -> StoreResult<Option<AuditSnapshot>> {
        Ok(self.read(|s| {
            s.snapshots
                .iter()
                .filter(|snap| snap.wallet_id == wallet_id)
                .filter(|snap| audit_type.map_or(true, |t| snap.audit_type == t))
                .max_by_key(|snap| (snap.snapshot_date, snap.id))
                .cloned()
        }))
    }

    fn snapshots_since(
        &self,
        wallet_id: WalletId,
        since: DateTime<Utc>,
    ) -> StoreResult<Vec<AuditSnapshot>> {
        let mut snapshots: Vec<AuditSnapshot> = self.read(|s| {
            s.snapshots
                .iter()
                .filter(|snap| snap.wallet_id == wallet_id && snap.snapshot_date >= since)
                .cloned()
                .collect()
        });
        snapshots.sort_by_key(|snap| (snap.snapshot_date, snap.id));
        Ok(snapshots)
    }
}

impl CorrectionRepository for MemoryStore {
    fn insert_correction_request(
        &self,
        audit_log_id: AuditLogId,
        wallet_id: WalletId,
        current_balance: Decimal,
        ledger_balance: Decimal,
        at: DateTime<Utc>,
    ) -> StoreResult<CorrectionRequest> {
        Ok(self.write(|s| {
            let request = CorrectionRequest {
                id: s.next_id(),
                audit_log_id,
                wallet_id,
                current_balance,
                ledger_balance,
                status: CorrectionStatus::Open,
                created_at: at,
            };
            s.corrections.push(request.clone());
            request
        }))
    }

    fn open_correction_requests(&self) -> StoreResult<Vec<CorrectionRequest>> {
        Ok(self.read(|s| {
            s.corrections
                .iter()
                .filter(|c| c.status == CorrectionStatus::Open)
                .cloned()
                .collect()
        }))
    }
}

impl LeaseRepository for MemoryStore {
    fn acquire_lease(
        &self,
        key: &str,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let mut leases = self.leases.lock();
        if leases.get(key).map_or(false, |held| *held > now) {
            return Ok(false);
        }
        leases.insert(key.to_string(), expires_at);
        Ok(true)
    }

    fn renew_lease(&self, key: &str, expires_at: DateTime<Utc>) -> StoreResult<()> {
        self.leases.lock().insert(key.to_string(), expires_at);
        Ok(())
    }

    fn lease_active(&self, key: &str, now: DateTime<Utc>) -> StoreResult<bool> {
        Ok(self.leases.lock().get(key).map_or(false, |held| *held > now))
    }

    fn release_lease(&self, key: &str) -> StoreResult<()> {
        self.leases.lock().remove(key);
        Ok(())
    }
}

impl TransactionRunner for MemoryStore {
    fn run_in_transaction(&self, work: &mut dyn FnMut() -> StoreResult<()>) -> StoreResult<()> {
        let guard = self.inner.lock();
        if guard.depth.get() > 0 {
            return work();
        }

        let backup = guard.state.borrow().clone();
        guard.depth.set(1);
        let result = work();
        guard.depth.set(0);

        if result.is_err() {
            *guard.state.borrow_mut() = backup;
        }
        result
    }
}
