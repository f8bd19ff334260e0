//! Realtime auditor
//!
//! Runs in-process right after a wallet transaction commits. It is a
//! post-commit observer: every internal fault is logged and swallowed so
//! the triggering transaction is never affected.
//!
//! ```text
//! TransactionCompleted
//!        │
//!        ▼
//!  balance vs ledger ─┐
//!  negative balance  ─┤
//!  unusual size      ─┼──► record (cache + store dedup) ──► notify
//!  high frequency    ─┘
//!        │
//!        ▼
//!  amount > 1000 or balance < 0 ──► enqueue targeted job (+5 min)
//! ```

use ledgerwatch_core::{
    AnomalyScope, AuditType, EntityType, Invariant, JobId, NewAuditJob, Severity,
    TransactionCompleted, Wallet, PRIORITY_HIGH,
};
use ledgerwatch_store::{AuditQueueRepository, LedgerRepository, WalletRepository};
use rust_decimal::Decimal;

use crate::anomaly::{Anomaly, AnomalyRecorder, Recorded};
use crate::context::AuditServices;
use crate::error::AuditResult;
use crate::severity::classify;

/// What one realtime pass did
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RealtimeReport {
    pub anomalies_created: usize,
    pub duplicates_suppressed: usize,
    /// Set when this pass queued a targeted audit
    pub targeted_job: Option<JobId>,
    /// The pass hit an operational error and stopped early
    pub aborted: bool,
}

pub struct RealtimeAuditor {
    services: AuditServices,
    recorder: AnomalyRecorder,
}

impl RealtimeAuditor {
    pub fn new(services: AuditServices) -> Self {
        Self {
            recorder: AnomalyRecorder::new(services.clone()),
            services,
        }
    }

    /// Audit the wallet touched by `event`; never fails
    pub fn audit(&self, event: &TransactionCompleted) -> RealtimeReport {
        match self.try_audit(event) {
            Ok(report) => report,
            Err(e) => {
                tracing::error!(
                    wallet_id = event.wallet_id,
                    transaction_id = event.transaction_id,
                    error = %e,
                    "Realtime audit failed"
                );
                RealtimeReport {
                    aborted: true,
                    ..Default::default()
                }
            }
        }
    }

    fn try_audit(&self, event: &TransactionCompleted) -> AuditResult<RealtimeReport> {
        let mut report = RealtimeReport::default();

        let Some(wallet) = self.services.store.wallet(event.wallet_id)? else {
            tracing::warn!(wallet_id = event.wallet_id, "Realtime audit skipped: unknown wallet");
            return Ok(report);
        };

        for anomaly in self.detect(&wallet, event)? {
            match self.recorder.record_cached(anomaly, AnomalyScope::Realtime)? {
                Recorded::Created(log) => {
                    report.anomalies_created += 1;
                    self.recorder.notify(&log);
                }
                Recorded::Duplicate { .. } => report.duplicates_suppressed += 1,
            }
        }

        report.targeted_job = self.maybe_enqueue_targeted(&wallet, event)?;
        Ok(report)
    }

    fn detect(&self, wallet: &Wallet, event: &TransactionCompleted) -> AuditResult<Vec<Anomaly>> {
        let config = &self.services.config.realtime;
        let store = &self.services.store;
        let now = self.services.clock.now();
        let mut anomalies = Vec::new();

        let ledger_balance = store.completed_internal_sum(wallet.id)?;
        let difference = (wallet.balance - ledger_balance).abs();
        if difference >= config.mismatch_tolerance {
            anomalies.push(
                Anomaly::wallet(Invariant::BalanceLedgerMismatch, wallet.id)
                    .values(ledger_balance, wallet.balance)
                    .severity(classify(difference, wallet.balance, &config.severity))
                    .describe(format!(
                        "Wallet {} balance {} does not match ledger sum {}",
                        wallet.id, wallet.balance, ledger_balance
                    ))
                    .meta("transaction_id", event.transaction_id),
            );
        }

        if wallet.balance < Decimal::ZERO {
            anomalies.push(
                Anomaly::wallet(Invariant::NegativeBalance, wallet.id)
                    .values(Decimal::ZERO, wallet.balance)
                    .severity(classify(
                        wallet.balance,
                        config.negative_balance_reference,
                        &config.severity,
                    ))
                    .describe(format!("Wallet {} has negative balance {}", wallet.id, wallet.balance)),
            );
        }

        // the triggering transaction is already committed; average what came before it
        let prior = store
            .wallet_activity(wallet.id, now - config.average_window())?
            .excluding(event.amount);
        let average = prior.average_amount();
        let limit = average * config.unusual_size_multiplier;
        if average > Decimal::ZERO && event.amount > limit {
            anomalies.push(
                Anomaly::new(
                    Invariant::UnusualTransactionSize.as_ref(),
                    EntityType::Transaction,
                    event.transaction_id,
                )
                .values(limit, event.amount)
                .severity(Severity::Medium)
                .describe(format!(
                    "Transaction {} amount {} exceeds {}x the 30-day average {}",
                    event.transaction_id,
                    event.amount,
                    config.unusual_size_multiplier,
                    average.round_dp(2)
                ))
                .meta("wallet_id", wallet.id),
            );
        }

        let burst = store.wallet_activity(wallet.id, now - config.high_frequency_window())?;
        if burst.transaction_count > config.high_frequency_threshold {
            let threshold = Decimal::from(config.high_frequency_threshold);
            let count = Decimal::from(burst.transaction_count);
            anomalies.push(
                Anomaly::wallet(Invariant::HighFrequency, wallet.id)
                    .values(threshold, count)
                    .severity(Severity::Low)
                    .describe(format!(
                        "Wallet {} made {} transactions in the last {} minutes",
                        wallet.id, burst.transaction_count, config.high_frequency_window_minutes
                    )),
            );
        }

        Ok(anomalies)
    }

    fn maybe_enqueue_targeted(
        &self,
        wallet: &Wallet,
        event: &TransactionCompleted,
    ) -> AuditResult<Option<JobId>> {
        let config = &self.services.config;
        if event.amount <= config.realtime.targeted_trigger_amount && wallet.balance >= Decimal::ZERO {
            return Ok(None);
        }

        let now = self.services.clock.now();
        let (job, created) = self.services.store.enqueue_unique(
            NewAuditJob {
                queue_name: config.queue.queue_name.clone(),
                entity_type: EntityType::Wallet,
                entity_id: wallet.id,
                audit_type: AuditType::Batch,
                priority: PRIORITY_HIGH,
                scheduled_at: now + config.realtime.targeted_delay(),
                max_attempts: config.queue.default_max_attempts,
            },
            now,
        )?;

        if created {
            tracing::info!(wallet_id = wallet.id, job_id = job.id, "Targeted audit queued");
        }
        Ok(Some(job.id))
    }
}
