//! Global auditor
//!
//! System-wide accounting checks run as one atomic batch:
//!
//! ```text
//!  1. accounting equation      solde_marchand == engagement_users + plateforme_benefices
//!  2. wallet reconciliation    Σ wallet.balance == engagement_users, then per wallet in pages
//!  3. inter-system             net system flow == profit, net wallet flow == Σ wallet.balance
//!  4. liquidity                solde_marchand / max(engagement_users, 1) >= 0.1, solde >= 0
//!  5. conservation of funds    solde_marchand == Σ external in - Σ external out
//!  6. pattern detectors        pluggable heuristics
//! ```
//!
//! Any operational error rolls the whole run back. Notifications go out
//! only after the commit.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use ledgerwatch_core::{
    AnomalyScope, AuditLog, AuditStatus, Invariant, Nature, Severity, SystemWallet, Wallet,
};
use ledgerwatch_store::{
    transaction, AuditStore, LedgerRepository, StoreError, SystemLedgerRepository,
    WalletRepository,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::anomaly::{Anomaly, AnomalyRecorder, Recorded};
use crate::config::GlobalConfig;
use crate::context::AuditServices;
use crate::error::{AuditError, AuditResult};
use crate::severity::{classify, SeverityThresholds};

/// Summary of one global run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalAuditReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub checks_performed: usize,
    pub anomalies_created: usize,
    pub duplicates_suppressed: usize,
    pub wallets_checked: usize,
}

/// Read-only view handed to pattern detectors
pub struct PatternContext<'a> {
    pub store: &'a dyn AuditStore,
    pub system: &'a SystemWallet,
    pub now: DateTime<Utc>,
    pub config: &'a GlobalConfig,
}

impl PatternContext<'_> {
    /// Visit every wallet in id order, one page at a time
    pub fn for_each_wallet(&self, f: impl FnMut(&Wallet) -> AuditResult<()>) -> AuditResult<()> {
        for_each_wallet(self.store, self.config.batch_size, f)
    }
}

/// Pluggable heuristic run as the last global check
pub trait PatternDetector: Send + Sync {
    fn name(&self) -> &str;

    fn detect(&self, ctx: &PatternContext<'_>) -> AuditResult<Vec<Anomaly>>;
}

/// Placeholder for growth heuristics; counted as a check, never reports
pub struct AbnormalGrowthDetector;

impl PatternDetector for AbnormalGrowthDetector {
    fn name(&self) -> &str {
        "abnormal_growth"
    }

    fn detect(&self, _ctx: &PatternContext<'_>) -> AuditResult<Vec<Anomaly>> {
        Ok(Vec::new())
    }
}

/// Flags a single wallet holding most of what users are owed
pub struct RiskConcentrationDetector;

impl PatternDetector for RiskConcentrationDetector {
    fn name(&self) -> &str {
        "risk_concentration"
    }

    fn detect(&self, ctx: &PatternContext<'_>) -> AuditResult<Vec<Anomaly>> {
        let engagement = ctx.system.engagement_users;
        if engagement <= Decimal::ZERO {
            return Ok(Vec::new());
        }

        let mut largest: Option<(i64, Decimal)> = None;
        ctx.for_each_wallet(|wallet| {
            if largest.map_or(true, |(_, balance)| wallet.balance > balance) {
                largest = Some((wallet.id, wallet.balance));
            }
            Ok(())
        })?;

        let Some((wallet_id, balance)) = largest else {
            return Ok(Vec::new());
        };
        let share = balance / engagement;
        if share <= ctx.config.concentration_threshold {
            return Ok(Vec::new());
        }

        Ok(vec![Anomaly::wallet(Invariant::RiskConcentration, wallet_id)
            .values(ctx.config.concentration_threshold, share.round_dp(4))
            .severity(Severity::Medium)
            .describe(format!(
                "Wallet {} holds {}% of user engagements",
                wallet_id,
                (share * Decimal::ONE_HUNDRED).round_dp(1)
            ))
            .meta("balance", balance.to_string())
            .meta("engagement_users", engagement.to_string())])
    }
}

/// Flags when most user money sits in wallets nobody has touched lately
pub struct DormantFundsDetector;

impl PatternDetector for DormantFundsDetector {
    fn name(&self) -> &str {
        "dormant_funds"
    }

    fn detect(&self, ctx: &PatternContext<'_>) -> AuditResult<Vec<Anomaly>> {
        let since = ctx.now - ctx.config.dormant_after();
        let mut total = Decimal::ZERO;
        let mut dormant = Decimal::ZERO;
        let mut dormant_wallets = 0u64;

        ctx.for_each_wallet(|wallet| {
            if wallet.balance <= Decimal::ZERO {
                return Ok(());
            }
            total += wallet.balance;
            if ctx.store.wallet_activity(wallet.id, since)?.transaction_count == 0 {
                dormant += wallet.balance;
                dormant_wallets += 1;
            }
            Ok(())
        })?;

        if total.is_zero() {
            return Ok(Vec::new());
        }
        let share = dormant / total;
        if share <= ctx.config.dormant_share_threshold {
            return Ok(Vec::new());
        }

        Ok(vec![Anomaly::system(Invariant::DormantFunds)
            .values(ctx.config.dormant_share_threshold, share.round_dp(4))
            .severity(Severity::Low)
            .describe(format!(
                "{} dormant wallets hold {}% of user balances",
                dormant_wallets,
                (share * Decimal::ONE_HUNDRED).round_dp(1)
            ))
            .meta("dormant_wallets", dormant_wallets)
            .meta("dormant_balance", dormant.to_string())])
    }
}

pub fn default_detectors() -> Vec<Arc<dyn PatternDetector>> {
    vec![
        Arc::new(AbnormalGrowthDetector),
        Arc::new(RiskConcentrationDetector),
        Arc::new(DormantFundsDetector),
    ]
}

fn for_each_wallet(
    store: &dyn AuditStore,
    batch_size: usize,
    mut f: impl FnMut(&Wallet) -> AuditResult<()>,
) -> AuditResult<()> {
    let mut after = None;
    loop {
        let page = store.wallets_page(after, batch_size)?;
        for wallet in &page {
            f(wallet)?;
        }
        match page.last() {
            Some(last) if page.len() == batch_size => after = Some(last.id),
            _ => return Ok(()),
        }
    }
}

#[derive(Default)]
struct RunState {
    checks_performed: usize,
    wallets_checked: usize,
    duplicates_suppressed: usize,
    created: Vec<AuditLog>,
}

pub struct GlobalAuditor {
    services: AuditServices,
    recorder: AnomalyRecorder,
    detectors: Vec<Arc<dyn PatternDetector>>,
}

impl GlobalAuditor {
    pub fn new(services: AuditServices) -> Self {
        Self {
            recorder: AnomalyRecorder::new(services.clone()),
            services,
            detectors: default_detectors(),
        }
    }

    /// Replace the pattern detectors
    pub fn with_detectors(mut self, detectors: Vec<Arc<dyn PatternDetector>>) -> Self {
        self.detectors = detectors;
        self
    }

    /// Run every check atomically
    pub fn run(&self) -> AuditResult<GlobalAuditReport> {
        let started_at = self.services.clock.now();
        let mut failure: Option<AuditError> = None;

        let outcome = transaction(self.services.store.as_ref(), || {
            match self.run_checks(started_at) {
                Ok(state) => Ok(state),
                Err(AuditError::Store(e)) => Err(e),
                Err(e) => {
                    let message = e.to_string();
                    failure = Some(e);
                    Err(StoreError::Internal(message))
                }
            }
        });

        let state = match outcome {
            Ok(state) => state,
            Err(e) => {
                let error = failure.take().unwrap_or(AuditError::Store(e));
                tracing::error!(error = %error, "Global audit aborted and rolled back");
                return Err(error);
            }
        };

        for log in &state.created {
            self.recorder.notify(log);
        }

        let report = GlobalAuditReport {
            started_at,
            finished_at: self.services.clock.now(),
            checks_performed: state.checks_performed,
            anomalies_created: state.created.len(),
            duplicates_suppressed: state.duplicates_suppressed,
            wallets_checked: state.wallets_checked,
        };
        tracing::info!(
            checks = report.checks_performed,
            anomalies = report.anomalies_created,
            duplicates = report.duplicates_suppressed,
            wallets = report.wallets_checked,
            "Global audit finished"
        );
        Ok(report)
    }

    fn run_checks(&self, now: DateTime<Utc>) -> AuditResult<RunState> {
        let store = self.services.store.as_ref();
        let config = &self.services.config.global;
        let system = store.system_wallet()?.ok_or(AuditError::MissingSystemWallet)?;

        let mut state = RunState::default();
        let mut findings = Vec::new();

        findings.extend(self.accounting_equation(&system));
        state.checks_performed += 1;

        findings.extend(self.wallet_reconciliation(&system, &mut state)?);
        state.checks_performed += 1;

        findings.extend(self.inter_system(&system)?);
        state.checks_performed += 1;

        findings.extend(self.liquidity(&system));
        state.checks_performed += 1;

        findings.extend(self.conservation_of_funds(&system)?);
        state.checks_performed += 1;

        let ctx = PatternContext {
            store,
            system: &system,
            now,
            config,
        };
        for detector in &self.detectors {
            let found = detector.detect(&ctx)?;
            tracing::debug!(detector = detector.name(), found = found.len(), "Pattern detector ran");
            findings.extend(found);
            state.checks_performed += 1;
        }

        for anomaly in findings {
            match self.recorder.record(anomaly, AnomalyScope::Global, AuditStatus::Pending)? {
                Recorded::Created(log) => state.created.push(log),
                Recorded::Duplicate { .. } => state.duplicates_suppressed += 1,
            }
        }
        Ok(state)
    }

    fn thresholds(&self) -> &SeverityThresholds {
        &self.services.config.global.severity
    }

    fn exceeds_tolerance(&self, difference: Decimal) -> bool {
        difference > self.services.config.global.equation_tolerance
    }

    fn accounting_equation(&self, system: &SystemWallet) -> Option<Anomaly> {
        let theoretical = system.theoretical_merchant_balance();
        let difference = (system.solde_marchand - theoretical).abs();
        if !self.exceeds_tolerance(difference) {
            return None;
        }
        Some(
            Anomaly::system(Invariant::AccountingEquationViolation)
                .values(theoretical, system.solde_marchand)
                .severity(classify(difference, theoretical, self.thresholds()))
                .describe(format!(
                    "Merchant balance {} differs from engagements + profit {} by {}",
                    system.solde_marchand, theoretical, difference
                ))
                .meta("engagement_users", system.engagement_users.to_string())
                .meta("plateforme_benefices", system.plateforme_benefices.to_string()),
        )
    }

    fn wallet_reconciliation(
        &self,
        system: &SystemWallet,
        state: &mut RunState,
    ) -> AuditResult<Vec<Anomaly>> {
        let store = self.services.store.as_ref();
        let mut findings = Vec::new();

        let total = store.total_wallet_balance()?;
        let difference = (total - system.engagement_users).abs();
        if self.exceeds_tolerance(difference) {
            findings.push(
                Anomaly::system(Invariant::GlobalWalletReconciliation)
                    .values(system.engagement_users, total)
                    .severity(classify(difference, system.engagement_users, self.thresholds()))
                    .describe(format!(
                        "Wallet balances total {} but engagements are {}",
                        total, system.engagement_users
                    )),
            );
        }

        let per_wallet = &self.services.config.realtime.severity;
        for_each_wallet(store, self.services.config.global.batch_size, |wallet| {
            state.wallets_checked += 1;
            let ledger = store.completed_internal_sum(wallet.id)?;
            let difference = (wallet.balance - ledger).abs();
            if self.exceeds_tolerance(difference) {
                findings.push(
                    Anomaly::wallet(Invariant::WalletLedgerMismatch, wallet.id)
                        .values(ledger, wallet.balance)
                        .severity(classify(difference, wallet.balance.abs(), per_wallet))
                        .describe(format!(
                            "Wallet {} balance {} does not match ledger {}",
                            wallet.id, wallet.balance, ledger
                        )),
                );
            }
            Ok(())
        })?;

        Ok(findings)
    }

    fn inter_system(&self, system: &SystemWallet) -> AuditResult<Vec<Anomaly>> {
        let store = self.services.store.as_ref();
        let mut findings = Vec::new();

        let system_flow = store.system_net_flow(None)?;
        let difference = (system_flow - system.plateforme_benefices).abs();
        if self.exceeds_tolerance(difference) {
            findings.push(
                Anomaly::system(Invariant::InterSystemProfitMismatch)
                    .values(system.plateforme_benefices, system_flow)
                    .severity(classify(difference, system.plateforme_benefices.abs(), self.thresholds()))
                    .describe(format!(
                        "Net system wallet flow {} does not match platform profit {}",
                        system_flow, system.plateforme_benefices
                    )),
            );
        }

        let wallet_flow = store.net_internal_wallet_flow()?;
        let total = store.total_wallet_balance()?;
        let difference = (wallet_flow - total).abs();
        if self.exceeds_tolerance(difference) {
            findings.push(
                Anomaly::system(Invariant::InterSystemWalletMismatch)
                    .values(wallet_flow, total)
                    .severity(classify(difference, total.abs(), self.thresholds()))
                    .describe(format!(
                        "Net wallet flow {} does not match wallet balances {}",
                        wallet_flow, total
                    )),
            );
        }

        Ok(findings)
    }

    fn liquidity(&self, system: &SystemWallet) -> Vec<Anomaly> {
        let config = &self.services.config.global;
        let mut findings = Vec::new();

        let obligations = system.engagement_users.max(Decimal::ONE);
        let ratio = system.solde_marchand / obligations;
        if ratio < config.liquidity_min_ratio {
            let required = obligations * config.liquidity_min_ratio;
            findings.push(
                Anomaly::system(Invariant::InsufficientLiquidity)
                    .values(required, system.solde_marchand)
                    .severity(Severity::Critical)
                    .describe(format!(
                        "Liquidity ratio {} is below {}",
                        ratio.round_dp(4),
                        config.liquidity_min_ratio
                    ))
                    .meta("liquidity_ratio", ratio.round_dp(4).to_string()),
            );
        }

        if system.solde_marchand < Decimal::ZERO {
            findings.push(
                Anomaly::system(Invariant::NegativeMerchantBalance)
                    .values(Decimal::ZERO, system.solde_marchand)
                    .severity(Severity::Critical)
                    .describe(format!("Merchant balance is negative: {}", system.solde_marchand)),
            );
        }

        findings
    }

    fn conservation_of_funds(&self, system: &SystemWallet) -> AuditResult<Option<Anomaly>> {
        let external = self.services.store.system_net_flow(Some(Nature::External))?;
        let difference = (system.solde_marchand - external).abs();
        if !self.exceeds_tolerance(difference) {
            return Ok(None);
        }
        Ok(Some(
            Anomaly::system(Invariant::ConservationOfFundsViolation)
                .values(external, system.solde_marchand)
                .severity(classify(difference, external.abs(), self.thresholds()))
                .describe(format!(
                    "Merchant balance {} differs from external net inflow {}",
                    system.solde_marchand, external
                )),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use ledgerwatch_core::{
        Clock, EntityType, Flow, ManualClock, SystemTransaction, Transaction, TxStatus, UserId,
    };
    use ledgerwatch_store::{AuditLogRepository, Fault, MemoryStore};
    use rust_decimal_macros::dec;

    use crate::notify::{MemoryNotifier, NotificationRouter, StaticDirectory};

    struct Fixture {
        store: Arc<MemoryStore>,
        clock: Arc<ManualClock>,
        notifier: Arc<MemoryNotifier>,
        auditor: GlobalAuditor,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap()));
        let notifier = Arc::new(MemoryNotifier::new());
        let router = NotificationRouter::new(
            Arc::new(StaticDirectory::new([7 as UserId])),
            notifier.clone(),
        );
        let services = AuditServices::new(store.clone(), clock.clone(), Default::default())
            .with_notifications(router);
        Fixture {
            auditor: GlobalAuditor::new(services).with_detectors(Vec::new()),
            store,
            clock,
            notifier,
        }
    }

    impl Fixture {
        fn system(&self, solde: Decimal, engagement: Decimal, profit: Decimal) {
            self.store.set_system_wallet(SystemWallet {
                solde_marchand: solde,
                engagement_users: engagement,
                plateforme_benefices: profit,
                updated_at: self.clock.now(),
            });
        }

        fn system_tx(&self, id: i64, amount: Decimal, flow: Flow, nature: Nature) {
            self.store.insert_system_transaction(SystemTransaction {
                id,
                amount,
                flow,
                nature,
                status: TxStatus::Completed,
                created_at: self.clock.now(),
            });
        }

        fn wallet(&self, id: i64, balance: Decimal, ledger: Decimal) {
            self.store.insert_wallet(Wallet {
                id,
                user_id: id,
                balance,
                updated_at: self.clock.now(),
            });
            self.store.insert_transaction(Transaction {
                id: id * 10,
                wallet_id: id,
                amount: ledger,
                flow: Flow::In,
                nature: Nature::Internal,
                status: TxStatus::Completed,
                created_at: self.clock.now(),
            });
        }

        /// A fully consistent platform: 1000 float, 400 owed, 600 profit
        fn consistent(&self) {
            self.system(dec!(1000), dec!(400), dec!(600));
            self.wallet(1, dec!(150), dec!(150));
            self.wallet(2, dec!(250), dec!(250));
            // profit comes in internally, the float externally
            self.system_tx(1, dec!(600), Flow::In, Nature::Internal);
            self.system_tx(2, dec!(1000), Flow::In, Nature::External);
            self.system_tx(3, dec!(1000), Flow::Out, Nature::Internal);
        }

        fn invariants(&self) -> Vec<String> {
            self.store
                .recent_audit_logs(100)
                .unwrap()
                .into_iter()
                .map(|l| l.invariant_violated)
                .collect()
        }
    }

    #[test]
    fn test_consistent_platform_is_clean() {
        let f = fixture();
        f.consistent();

        let report = f.auditor.run().unwrap();
        assert_eq!(report.anomalies_created, 0, "{:?}", f.invariants());
        assert_eq!(report.checks_performed, 5);
        assert_eq!(report.wallets_checked, 2);
    }

    #[test]
    fn test_accounting_equation_violation_is_high() {
        let f = fixture();
        f.system(dec!(1000), dec!(400), dec!(550));

        f.auditor.run().unwrap();
        let logs = f.store.recent_audit_logs(100).unwrap();
        let log = logs
            .iter()
            .find(|l| l.invariant_violated == "accounting_equation_violation")
            .unwrap();
        assert_eq!(log.difference, dec!(50));
        assert_eq!(log.severity, Severity::High);
        assert_eq!(log.entity_type, EntityType::System);
        assert_eq!(log.entity_id, 0);
    }

    #[test]
    fn test_second_run_deduplicates() {
        let f = fixture();
        f.system(dec!(1000), dec!(400), dec!(550));

        let first = f.auditor.run().unwrap();
        let second = f.auditor.run().unwrap();
        assert!(first.anomalies_created > 0);
        assert_eq!(second.anomalies_created, 0);
        assert_eq!(second.duplicates_suppressed, first.anomalies_created);
        assert_eq!(f.notifier.count(), first.anomalies_created);
    }

    #[test]
    fn test_per_wallet_detail_spans_pages() {
        let f = fixture();
        f.system(dec!(0), dec!(0), dec!(0));
        for id in 1..=5 {
            f.wallet(id, dec!(10), dec!(10));
        }
        f.wallet(6, dec!(10), dec!(4));

        let mut services = f.auditor.services.clone();
        let mut config = (*services.config).clone();
        config.global.batch_size = 2;
        services.config = Arc::new(config);
        let auditor = GlobalAuditor::new(services).with_detectors(Vec::new());

        let report = auditor.run().unwrap();
        assert_eq!(report.wallets_checked, 6);
        let mismatches: Vec<_> = f
            .store
            .entity_audit_logs(EntityType::Wallet, 6)
            .unwrap();
        assert_eq!(mismatches.len(), 1);
        assert_eq!(mismatches[0].invariant_violated, "wallet_ledger_mismatch");
    }

    #[test]
    fn test_paging_includes_non_positive_ids() {
        let f = fixture();
        f.system(dec!(0), dec!(0), dec!(0));
        f.wallet(-3, dec!(10), dec!(7));
        f.wallet(0, dec!(10), dec!(9));
        f.wallet(1, dec!(10), dec!(10));

        let mut services = f.auditor.services.clone();
        let mut config = (*services.config).clone();
        config.global.batch_size = 2;
        services.config = Arc::new(config);
        let auditor = GlobalAuditor::new(services).with_detectors(Vec::new());

        let report = auditor.run().unwrap();
        assert_eq!(report.wallets_checked, 3);
        for id in [-3, 0] {
            let logs = f.store.entity_audit_logs(EntityType::Wallet, id).unwrap();
            assert_eq!(logs.len(), 1, "wallet {} was skipped", id);
        }
    }

    #[test]
    fn test_liquidity_and_negative_merchant_are_critical() {
        let f = fixture();
        f.system(dec!(-10), dec!(400), dec!(-410));

        f.auditor.run().unwrap();
        let logs = f.store.recent_audit_logs(100).unwrap();
        for code in ["insufficient_liquidity", "negative_merchant_balance"] {
            let log = logs.iter().find(|l| l.invariant_violated == code).unwrap();
            assert_eq!(log.severity, Severity::Critical);
        }
    }

    #[test]
    fn test_conservation_of_funds() {
        let f = fixture();
        f.system(dec!(1000), dec!(400), dec!(600));
        f.system_tx(1, dec!(900), Flow::In, Nature::External);

        f.auditor.run().unwrap();
        assert!(f.invariants().contains(&"conservation_of_funds_violation".to_string()));
    }

    #[test]
    fn test_missing_system_wallet_is_an_error() {
        let f = fixture();
        let err = f.auditor.run().unwrap_err();
        assert!(matches!(err, AuditError::MissingSystemWallet));
        assert_eq!(f.store.audit_log_count(), 0);
    }

    #[test]
    fn test_failure_rolls_back_everything() {
        let f = fixture();
        f.system(dec!(1000), dec!(400), dec!(550));
        f.wallet(1, dec!(10), dec!(4));
        f.store.inject_failure(Fault::AuditLogWrite);

        assert!(f.auditor.run().is_err());
        assert_eq!(f.store.audit_log_count(), 0);
        assert_eq!(f.notifier.count(), 0);
    }

    #[test]
    fn test_risk_concentration_detector() {
        let f = fixture();
        f.consistent();
        let auditor = GlobalAuditor::new(f.auditor.services.clone())
            .with_detectors(vec![Arc::new(RiskConcentrationDetector)]);

        let report = auditor.run().unwrap();
        assert_eq!(report.checks_performed, 6);
        let logs = f.store.entity_audit_logs(EntityType::Wallet, 2).unwrap();
        // 250 of 400 is 62.5%
        assert_eq!(logs[0].invariant_violated, "risk_concentration");
        assert_eq!(logs[0].actual_value, dec!(0.625));
    }

    #[test]
    fn test_dormant_funds_detector() {
        let f = fixture();
        f.consistent();
        f.clock.advance(Duration::days(120));
        let auditor = GlobalAuditor::new(f.auditor.services.clone())
            .with_detectors(vec![Arc::new(DormantFundsDetector)]);

        auditor.run().unwrap();
        assert!(f.invariants().contains(&"dormant_funds".to_string()));
    }
}
