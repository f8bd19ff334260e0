//! Targeted auditor
//!
//! Full reconciliation of one wallet, consumed from the queue.
//!
//! ```text
//! acquire audit_lock_wallet_<id> ── busy ──► Locked (job deferred)
//!        │
//!        ▼
//! snapshot (pre-correction)
//!        │
//!        ▼
//! replay completed internal transactions ──► ledger balance + trail
//!        │
//!        ├─ no transactions, balance != 0 ──► data_corruption (critical)
//!        └─ difference != 0 ──► balance_ledger_mismatch
//!                                   │
//!            difference < 0.01 ─────┼──► correct balance + resolve log (one transaction)
//!                                   │         │ failure: rolled back
//!                                   ▼         ▼
//!          investigating log (+ correction request if critical), one transaction
//!                                   │
//!                                   ▼
//!                                notify
//! ```

use chrono::{DateTime, Utc};
use ledgerwatch_core::{
    AnomalyScope, AuditLogId, AuditStatus, AuditType, EntityType, Invariant, NewSnapshot,
    Severity, SnapshotId, Transaction, TransactionId, Wallet, WalletId,
};
use ledgerwatch_store::{
    transaction, AuditLogRepository, CorrectionRepository, LedgerRepository, SnapshotRepository,
    WalletRepository,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::anomaly::{Anomaly, AnomalyRecorder};
use crate::context::AuditServices;
use crate::error::AuditResult;
use crate::severity::classify;

/// One step of the running balance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrailPoint {
    pub transaction_id: TransactionId,
    pub running_balance: Decimal,
}

/// Ground truth recomputed from the full history
#[derive(Debug, Clone, PartialEq)]
pub struct LedgerReplay {
    pub ledger_balance: Decimal,
    pub transaction_count: u64,
    /// Most recent points only
    pub trail: Vec<TrailPoint>,
    pub first_transaction_at: Option<DateTime<Utc>>,
    pub last_transaction_at: Option<DateTime<Utc>>,
}

/// Replay completed internal transactions in chronological order
pub fn replay(transactions: &[Transaction], trail_length: usize) -> LedgerReplay {
    let mut ordered: Vec<&Transaction> = transactions
        .iter()
        .filter(|tx| tx.counts_toward_balance())
        .collect();
    ordered.sort_by_key(|tx| (tx.created_at, tx.id));

    let mut running = Decimal::ZERO;
    let mut trail = Vec::with_capacity(ordered.len().min(trail_length));
    for tx in &ordered {
        running += tx.signed_amount();
        trail.push(TrailPoint {
            transaction_id: tx.id,
            running_balance: running,
        });
    }
    if trail.len() > trail_length {
        trail.drain(..trail.len() - trail_length);
    }

    LedgerReplay {
        ledger_balance: running,
        transaction_count: ordered.len() as u64,
        trail,
        first_transaction_at: ordered.first().map(|tx| tx.created_at),
        last_transaction_at: ordered.last().map(|tx| tx.created_at),
    }
}

/// How a finding was handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    AutoCorrected,
    Escalated,
    /// Same fingerprint already logged; nothing done
    Duplicate,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Finding {
    pub invariant: String,
    pub severity: Severity,
    pub audit_log_id: Option<AuditLogId>,
    pub resolution: Resolution,
    pub correction_request_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReconciliationReport {
    pub wallet_id: WalletId,
    pub snapshot_id: SnapshotId,
    pub current_balance: Decimal,
    pub ledger_balance: Decimal,
    pub difference: Decimal,
    pub transaction_count: u64,
    pub findings: Vec<Finding>,
}

impl ReconciliationReport {
    pub fn is_clean(&self) -> bool {
        self.findings.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TargetedOutcome {
    /// Another audit holds the wallet; try again later
    Locked,
    MissingWallet,
    Completed(ReconciliationReport),
}

pub struct TargetedAuditor {
    services: AuditServices,
    recorder: AnomalyRecorder,
}

impl TargetedAuditor {
    pub fn new(services: AuditServices) -> Self {
        Self {
            recorder: AnomalyRecorder::new(services.clone()),
            services,
        }
    }

    /// Reconcile one wallet under its entity lock
    pub fn audit_wallet(&self, wallet_id: WalletId) -> AuditResult<TargetedOutcome> {
        let lock = self.services.entity_lock();
        let Some(_guard) = lock.try_acquire(EntityType::Wallet, wallet_id) else {
            tracing::debug!(wallet_id, "Targeted audit skipped: wallet locked");
            return Ok(TargetedOutcome::Locked);
        };

        let store = &self.services.store;
        let Some(wallet) = store.wallet(wallet_id)? else {
            tracing::warn!(wallet_id, "Targeted audit skipped: unknown wallet");
            return Ok(TargetedOutcome::MissingWallet);
        };
        let now = self.services.clock.now();

        let history = store.wallet_transactions(wallet_id)?;
        let replay = replay(&history, self.services.config.targeted.trail_length);
        let snapshot = store.insert_snapshot(NewSnapshot {
            wallet_id,
            balance: wallet.balance,
            transaction_count: replay.transaction_count,
            snapshot_date: now,
            audit_type: AuditType::Batch,
        })?;

        let difference = (wallet.balance - replay.ledger_balance).abs();
        let mut findings = Vec::new();

        if replay.transaction_count == 0 && !wallet.balance.is_zero() {
            let anomaly = Anomaly::wallet(Invariant::DataCorruption, wallet_id)
                .values(Decimal::ZERO, wallet.balance)
                .severity(Severity::Critical)
                .describe(format!(
                    "Wallet {} has balance {} but no completed transactions",
                    wallet_id, wallet.balance
                ))
                .meta("snapshot_id", snapshot.id);
            findings.push(self.escalate(&wallet, &replay, anomaly, now)?);
        } else if !difference.is_zero() {
            let severity = classify(difference, wallet.balance, &self.services.config.realtime.severity);
            let anomaly = Anomaly::wallet(Invariant::BalanceLedgerMismatch, wallet_id)
                .values(replay.ledger_balance, wallet.balance)
                .severity(severity)
                .describe(format!(
                    "Reconciliation of wallet {}: balance {} vs ledger {}",
                    wallet_id, wallet.balance, replay.ledger_balance
                ))
                .meta("snapshot_id", snapshot.id)
                .meta("ledger_replay", replay_metadata(&replay)?);

            let finding = if difference < self.services.config.targeted.auto_correct_below {
                self.auto_correct(&wallet, &replay, anomaly, now)?
            } else {
                self.escalate(&wallet, &replay, anomaly, now)?
            };
            findings.push(finding);
        }

        Ok(TargetedOutcome::Completed(ReconciliationReport {
            wallet_id,
            snapshot_id: snapshot.id,
            current_balance: wallet.balance,
            ledger_balance: replay.ledger_balance,
            difference,
            transaction_count: replay.transaction_count,
            findings,
        }))
    }

    fn duplicate(&self, anomaly: &Anomaly) -> AuditResult<Option<Finding>> {
        let fingerprint = anomaly.fingerprint(AnomalyScope::Targeted);
        if self.services.store.find_by_fingerprint(&fingerprint)?.is_some() {
            return Ok(Some(Finding {
                invariant: anomaly.invariant.clone(),
                severity: anomaly.severity,
                audit_log_id: None,
                resolution: Resolution::Duplicate,
                correction_request_id: None,
            }));
        }
        Ok(None)
    }

    /// Log write, balance write and resolution in one unit of work
    fn auto_correct(
        &self,
        wallet: &Wallet,
        replay: &LedgerReplay,
        anomaly: Anomaly,
        now: DateTime<Utc>,
    ) -> AuditResult<Finding> {
        if let Some(duplicate) = self.duplicate(&anomaly)? {
            return Ok(duplicate);
        }

        let store = &self.services.store;
        let new_log = anomaly.clone().into_new_log(AnomalyScope::Targeted, AuditStatus::Pending);
        let mut resolved_metadata = new_log.metadata.clone();
        resolved_metadata.insert("auto_corrected".to_string(), Value::Bool(true));
        resolved_metadata.insert(
            "correction".to_string(),
            json!({
                "previous_balance": wallet.balance,
                "corrected_balance": replay.ledger_balance,
                "corrected_at": now,
            }),
        );

        let corrected = transaction(store.as_ref(), || {
            let log = store.insert_audit_log(new_log.clone(), now)?;
            store.set_wallet_balance(wallet.id, replay.ledger_balance, now)?;
            store.update_audit_status(
                log.id,
                AuditStatus::Resolved,
                Some(now),
                Some(resolved_metadata.clone()),
            )?;
            Ok(log.id)
        });

        match corrected {
            Ok(log_id) => {
                tracing::info!(
                    wallet_id = wallet.id,
                    audit_log_id = log_id,
                    from = %wallet.balance,
                    to = %replay.ledger_balance,
                    "Wallet balance auto-corrected"
                );
                Ok(Finding {
                    invariant: anomaly.invariant,
                    severity: anomaly.severity,
                    audit_log_id: Some(log_id),
                    resolution: Resolution::AutoCorrected,
                    correction_request_id: None,
                })
            }
            Err(e) => {
                tracing::warn!(
                    wallet_id = wallet.id,
                    error = %e,
                    "Auto-correction rolled back, escalating"
                );
                let anomaly = anomaly.meta("auto_correction_error", e.to_string());
                self.escalate(wallet, replay, anomaly, now)
            }
        }
    }

    /// Log, `investigating` transition and correction request commit together
    ///
    /// Auditors are notified only once the unit of work has committed, so a
    /// failed attempt leaves nothing behind and the retried job starts over.
    fn escalate(
        &self,
        wallet: &Wallet,
        replay: &LedgerReplay,
        anomaly: Anomaly,
        now: DateTime<Utc>,
    ) -> AuditResult<Finding> {
        let invariant = anomaly.invariant.clone();
        let severity = anomaly.severity;
        let fingerprint = anomaly.fingerprint(AnomalyScope::Targeted);
        let new_log = anomaly.into_new_log(AnomalyScope::Targeted, AuditStatus::Investigating);
        let store = &self.services.store;

        let escalated = transaction(store.as_ref(), || {
            if store.find_by_fingerprint(&fingerprint)?.is_some() {
                return Ok(None);
            }
            let mut log = store.insert_audit_log(new_log, now)?;
            store.update_audit_status(log.id, AuditStatus::Investigating, Some(now), None)?;
            log.status = AuditStatus::Investigating;
            log.processed_at = Some(now);

            let request_id = if severity == Severity::Critical {
                let request = store.insert_correction_request(
                    log.id,
                    wallet.id,
                    wallet.balance,
                    replay.ledger_balance,
                    now,
                )?;
                Some(request.id)
            } else {
                None
            };
            Ok(Some((log, request_id)))
        })?;

        let Some((log, correction_request_id)) = escalated else {
            return Ok(Finding {
                invariant,
                severity,
                audit_log_id: None,
                resolution: Resolution::Duplicate,
                correction_request_id: None,
            });
        };

        tracing::warn!(
            wallet_id = wallet.id,
            audit_log_id = log.id,
            severity = %severity,
            invariant = %invariant,
            "Audit finding escalated"
        );
        self.recorder.notify(&log);

        Ok(Finding {
            invariant,
            severity,
            audit_log_id: Some(log.id),
            resolution: Resolution::Escalated,
            correction_request_id,
        })
    }
}

fn replay_metadata(replay: &LedgerReplay) -> AuditResult<Value> {
    Ok(json!({
        "transaction_count": replay.transaction_count,
        "first_transaction_at": replay.first_transaction_at,
        "last_transaction_at": replay.last_transaction_at,
        "trail": serde_json::to_value(&replay.trail)?,
    }))
}
