//! Repository contracts
//!
//! Every method takes explicit timestamps; engines never read the clock.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde_json::{Map, Value};

use ledgerwatch_core::{
    AuditLog, AuditLogId, AuditQueueJob, AuditSnapshot, AuditStatus, AuditType,
    CorrectionRequest, EntityType, JobId, Nature, NewAuditJob, NewAuditLog, NewSnapshot,
    SystemWallet, Transaction, Wallet, WalletId,
};

use crate::error::StoreResult;

/// Aggregate of a wallet's completed transactions inside a time window
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WalletActivity {
    pub transaction_count: u64,
    /// Sum of absolute amounts
    pub volume: Decimal,
    pub last_transaction_at: Option<DateTime<Utc>>,
}

impl WalletActivity {
    /// Mean transaction amount, zero when there is no activity
    pub fn average_amount(&self) -> Decimal {
        if self.transaction_count == 0 {
            Decimal::ZERO
        } else {
            self.volume / Decimal::from(self.transaction_count)
        }
    }

    /// The same window with one transaction of `amount` taken out
    pub fn excluding(mut self, amount: Decimal) -> Self {
        if self.transaction_count > 0 {
            self.transaction_count -= 1;
            self.volume = (self.volume - amount.abs()).max(Decimal::ZERO);
        }
        self
    }
}

/// Column used by [`AuditLogRepository::count_audit_logs_by`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogGrouping {
    Status,
    Severity,
    AuditType,
}

impl LogGrouping {
    pub fn column(&self) -> &'static str {
        match self {
            LogGrouping::Status => "status",
            LogGrouping::Severity => "severity",
            LogGrouping::AuditType => "audit_type",
        }
    }
}

pub trait WalletRepository {
    fn wallet(&self, id: WalletId) -> StoreResult<Option<Wallet>>;

    /// Wallets ordered by id, at most `limit`, starting after the `after` cursor
    ///
    /// `None` starts from the lowest id.
    fn wallets_page(&self, after: Option<WalletId>, limit: usize) -> StoreResult<Vec<Wallet>>;

    /// Wallets with a completed transaction since `since` or a nonzero balance
    fn active_wallets(&self, since: DateTime<Utc>) -> StoreResult<Vec<Wallet>>;

    fn total_wallet_balance(&self) -> StoreResult<Decimal>;

    /// Only the auto-correction path calls this, under the entity lock
    fn set_wallet_balance(
        &self,
        id: WalletId,
        balance: Decimal,
        at: DateTime<Utc>,
    ) -> StoreResult<()>;
}

pub trait LedgerRepository {
    /// All transactions of a wallet in chronological order
    fn wallet_transactions(&self, wallet_id: WalletId) -> StoreResult<Vec<Transaction>>;

    /// Signed sum of the wallet's completed internal transactions
    fn completed_internal_sum(&self, wallet_id: WalletId) -> StoreResult<Decimal>;

    fn completed_internal_count(&self, wallet_id: WalletId) -> StoreResult<u64>;

    /// Completed transactions (any nature) created at or after `since`
    fn wallet_activity(
        &self,
        wallet_id: WalletId,
        since: DateTime<Utc>,
    ) -> StoreResult<WalletActivity>;

    /// Signed sum of completed internal transactions across every wallet
    fn net_internal_wallet_flow(&self) -> StoreResult<Decimal>;
}

pub trait SystemLedgerRepository {
    fn system_wallet(&self) -> StoreResult<Option<SystemWallet>>;

    /// Signed sum of completed system transactions, optionally by nature
    fn system_net_flow(&self, nature: Option<Nature>) -> StoreResult<Decimal>;
}

pub trait AuditLogRepository {
    fn insert_audit_log(&self, log: NewAuditLog, at: DateTime<Utc>) -> StoreResult<AuditLog>;

    fn audit_log(&self, id: AuditLogId) -> StoreResult<Option<AuditLog>>;

    fn find_by_fingerprint(&self, fingerprint: &str) -> StoreResult<Option<AuditLog>>;

    /// Transition a log; `metadata` replaces the stored map when given
    fn update_audit_status(
        &self,
        id: AuditLogId,
        status: AuditStatus,
        processed_at: Option<DateTime<Utc>>,
        metadata: Option<Map<String, Value>>,
    ) -> StoreResult<()>;

    /// Newest first
    fn recent_audit_logs(&self, limit: usize) -> StoreResult<Vec<AuditLog>>;

    /// Newest first
    fn entity_audit_logs(&self, entity_type: EntityType, entity_id: i64)
        -> StoreResult<Vec<AuditLog>>;

    fn count_unresolved(&self, entity_type: EntityType, entity_id: i64) -> StoreResult<u64>;

    fn count_audit_logs_by(&self, grouping: LogGrouping) -> StoreResult<Vec<(String, u64)>>;
}

pub trait AuditQueueRepository {
    /// Insert unless an outstanding job exists for the same entity and audit type.
    ///
    /// Returns the stored job and whether it was newly created.
    fn enqueue_unique(
        &self,
        job: NewAuditJob,
        at: DateTime<Utc>,
    ) -> StoreResult<(AuditQueueJob, bool)>;

    fn job(&self, id: JobId) -> StoreResult<Option<AuditQueueJob>>;

    /// Non-exhausted job for the entity, reserved or not
    fn outstanding_job(
        &self,
        entity_type: EntityType,
        entity_id: i64,
        audit_type: AuditType,
    ) -> StoreResult<Option<AuditQueueJob>>;

    /// Reserve the next due job: lowest priority number, then earliest schedule
    fn claim_due(
        &self,
        queue_name: &str,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> StoreResult<Option<AuditQueueJob>>;

    /// Delete a finished job
    fn complete_job(&self, id: JobId) -> StoreResult<()>;

    /// Release without counting an attempt
    fn defer_job(&self, id: JobId, until: DateTime<Utc>) -> StoreResult<()>;

    /// Count an attempt, store the error and release
    fn record_job_failure(
        &self,
        id: JobId,
        error: &str,
        retry_at: DateTime<Utc>,
    ) -> StoreResult<AuditQueueJob>;

    /// Jobs not yet exhausted
    fn queue_depth(&self) -> StoreResult<u64>;

    /// Jobs left for manual attention
    fn failed_jobs(&self) -> StoreResult<Vec<AuditQueueJob>>;
}

pub trait SnapshotRepository {
    fn insert_snapshot(&self, snapshot: NewSnapshot) -> StoreResult<AuditSnapshot>;

    /// Most recent snapshot, optionally restricted to one auditor
    fn latest_snapshot(
        &self,
        wallet_id: WalletId,
        audit_type: Option<AuditType>,
    ) -> StoreResult<Option<AuditSnapshot>>;

    /// Oldest first
    fn snapshots_since(
        &self,
        wallet_id: WalletId,
        since: DateTime<Utc>,
    ) -> StoreResult<Vec<AuditSnapshot>>;
}

pub trait CorrectionRepository {
    fn insert_correction_request(
        &self,
        audit_log_id: AuditLogId,
        wallet_id: WalletId,
        current_balance: Decimal,
        ledger_balance: Decimal,
        at: DateTime<Utc>,
    ) -> StoreResult<CorrectionRequest>;

    fn open_correction_requests(&self) -> StoreResult<Vec<CorrectionRequest>>;
}

/// Expiring named leases, shared by every process using the same store
///
/// Entity locks live here so that workers in separate processes exclude
/// each other. A lease past its `expires_at` counts as free.
pub trait LeaseRepository {
    /// Take `key` until `expires_at` unless a live lease holds it; `true` when taken
    fn acquire_lease(
        &self,
        key: &str,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> StoreResult<bool>;

    /// Insert or extend a lease regardless of its holder
    fn renew_lease(&self, key: &str, expires_at: DateTime<Utc>) -> StoreResult<()>;

    fn lease_active(&self, key: &str, now: DateTime<Utc>) -> StoreResult<bool>;

    fn release_lease(&self, key: &str) -> StoreResult<()>;
}

/// Atomic unit of work
///
/// `work` calls the engine's own repository methods. If it returns `Err`,
/// every write it made is rolled back. Nested calls join the outer unit.
pub trait TransactionRunner {
    fn run_in_transaction(&self, work: &mut dyn FnMut() -> StoreResult<()>) -> StoreResult<()>;
}

/// Everything the audit engine needs from persistence
pub trait AuditStore:
    WalletRepository
    + LedgerRepository
    + SystemLedgerRepository
    + AuditLogRepository
    + AuditQueueRepository
    + SnapshotRepository
    + CorrectionRepository
    + LeaseRepository
    + TransactionRunner
    + Send
    + Sync
{
}

impl<T> AuditStore for T where
    T: WalletRepository
        + LedgerRepository
        + SystemLedgerRepository
        + AuditLogRepository
        + AuditQueueRepository
        + SnapshotRepository
        + CorrectionRepository
        + LeaseRepository
        + TransactionRunner
        + Send
        + Sync
{
}

/// Run `f` atomically and hand back its value
pub fn transaction<R, T>(runner: &R, f: impl FnOnce() -> StoreResult<T>) -> StoreResult<T>
where
    R: TransactionRunner + ?Sized,
{
    let mut f = Some(f);
    let mut output = None;
    runner.run_in_transaction(&mut || {
        if let Some(f) = f.take() {
            output = Some(f()?);
        }
        Ok(())
    })?;
    output.ok_or_else(|| crate::error::StoreError::Internal("transaction produced no value".into()))
}
