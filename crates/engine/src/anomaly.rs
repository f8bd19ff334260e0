//! Detected anomalies and how they become audit logs
//!
//! ```text
//! Anomaly ──► fingerprint ──► cache hit? ──► Duplicate
//!                                │ miss
//!                                ▼
//!                        store has fingerprint? ──► Duplicate
//!                                │ no
//!                                ▼
//!                           insert AuditLog ──► Created
//! ```
//!
//! Deduplication matches any stored log with the same fingerprint,
//! whatever its status. The store lookup is authoritative; the cache only
//! saves a round-trip.

use ledgerwatch_core::{
    AnomalyScope, AuditLog, AuditStatus, EntityType, Invariant, NewAuditLog, Severity,
};
use ledgerwatch_store::AuditLogRepository;
use rust_decimal::Decimal;
use serde_json::{Map, Value};

use crate::context::AuditServices;
use crate::error::AuditResult;
use crate::fingerprint::fingerprint;

/// A violated invariant, before persistence
#[derive(Debug, Clone, PartialEq)]
pub struct Anomaly {
    pub invariant: String,
    pub entity_type: EntityType,
    pub entity_id: i64,
    pub expected_value: Decimal,
    pub actual_value: Decimal,
    pub difference: Decimal,
    pub severity: Severity,
    pub description: String,
    pub metadata: Map<String, Value>,
}

impl Anomaly {
    pub fn new(invariant: impl Into<String>, entity_type: EntityType, entity_id: i64) -> Self {
        Self {
            invariant: invariant.into(),
            entity_type,
            entity_id,
            expected_value: Decimal::ZERO,
            actual_value: Decimal::ZERO,
            difference: Decimal::ZERO,
            severity: Severity::Low,
            description: String::new(),
            metadata: Map::new(),
        }
    }

    pub fn wallet(invariant: Invariant, wallet_id: i64) -> Self {
        Self::new(invariant.as_ref(), EntityType::Wallet, wallet_id)
    }

    /// System-level findings use entity id 0
    pub fn system(invariant: Invariant) -> Self {
        Self::new(invariant.as_ref(), EntityType::System, 0)
    }

    /// Set expected/actual; `difference` becomes `|actual - expected|`
    pub fn values(mut self, expected: Decimal, actual: Decimal) -> Self {
        self.expected_value = expected;
        self.actual_value = actual;
        self.difference = (actual - expected).abs();
        self
    }

    pub fn difference(mut self, difference: Decimal) -> Self {
        self.difference = difference;
        self
    }

    pub fn severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn meta(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    pub fn fingerprint(&self, scope: AnomalyScope) -> String {
        fingerprint(&self.invariant, self.entity_type, self.entity_id, scope)
    }

    pub fn into_new_log(self, scope: AnomalyScope, status: AuditStatus) -> NewAuditLog {
        let fingerprint = self.fingerprint(scope);
        NewAuditLog {
            audit_type: scope.audit_type(),
            entity_type: self.entity_type,
            entity_id: self.entity_id,
            invariant_violated: self.invariant,
            expected_value: self.expected_value,
            actual_value: self.actual_value,
            difference: self.difference,
            severity: self.severity,
            description: self.description,
            status,
            fingerprint,
            metadata: self.metadata,
        }
    }
}

/// Result of trying to persist an anomaly
#[derive(Debug, Clone, PartialEq)]
pub enum Recorded {
    Created(AuditLog),
    Duplicate { fingerprint: String },
}

impl Recorded {
    pub fn created(&self) -> Option<&AuditLog> {
        match self {
            Recorded::Created(log) => Some(log),
            Recorded::Duplicate { .. } => None,
        }
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, Recorded::Duplicate { .. })
    }
}

/// Fingerprints, deduplicates and inserts anomalies
pub struct AnomalyRecorder {
    services: AuditServices,
}

impl AnomalyRecorder {
    pub fn new(services: AuditServices) -> Self {
        Self { services }
    }

    fn cache_key(fingerprint: &str) -> String {
        format!("audit_fingerprint_{}", fingerprint)
    }

    /// Store-authoritative insert, safe inside a transaction
    ///
    /// Does not touch the cache, so a rolled-back insert leaves no trace.
    pub fn record(
        &self,
        anomaly: Anomaly,
        scope: AnomalyScope,
        status: AuditStatus,
    ) -> AuditResult<Recorded> {
        let fingerprint = anomaly.fingerprint(scope);
        if self.services.store.find_by_fingerprint(&fingerprint)?.is_some() {
            return Ok(Recorded::Duplicate { fingerprint });
        }
        let log = self
            .services
            .store
            .insert_audit_log(anomaly.into_new_log(scope, status), self.services.clock.now())?;
        Ok(Recorded::Created(log))
    }

    /// Read-through variant for the hot path
    pub fn record_cached(&self, anomaly: Anomaly, scope: AnomalyScope) -> AuditResult<Recorded> {
        let fingerprint = anomaly.fingerprint(scope);
        let key = Self::cache_key(&fingerprint);
        let ttl = self.services.config.realtime.fingerprint_cache_ttl();

        if self.services.cache.has(&key) {
            return Ok(Recorded::Duplicate { fingerprint });
        }

        let recorded = self.record(anomaly, scope, AuditStatus::Pending)?;
        self.services.cache.put(&key, ttl);
        Ok(recorded)
    }

    /// Fan a created log out to auditors
    pub fn notify(&self, log: &AuditLog) -> usize {
        self.services.notifications.route(log)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ledgerwatch_core::{AuditType, ManualClock};
    use ledgerwatch_store::MemoryStore;
    use rust_decimal_macros::dec;
    use std::sync::Arc;

    fn recorder() -> (AnomalyRecorder, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let services = AuditServices::new(
            store.clone(),
            Arc::new(ManualClock::default()),
            Default::default(),
        );
        (AnomalyRecorder::new(services), store)
    }

    fn mismatch(balance: Decimal) -> Anomaly {
        Anomaly::wallet(Invariant::BalanceLedgerMismatch, 1)
            .values(dec!(95), balance)
            .severity(Severity::Medium)
            .describe("mismatch")
    }

    #[test]
    fn test_values_sets_absolute_difference() {
        let anomaly = Anomaly::system(Invariant::AccountingEquationViolation).values(dec!(950), dec!(900));
        assert_eq!(anomaly.difference, dec!(50));
        assert_eq!(anomaly.entity_id, 0);
        assert_eq!(anomaly.invariant, "accounting_equation_violation");
    }

    #[test]
    fn test_new_log_carries_scope() {
        let log = mismatch(dec!(100)).into_new_log(AnomalyScope::Targeted, AuditStatus::Pending);
        assert_eq!(log.audit_type, AuditType::Batch);
        assert_eq!(log.fingerprint, mismatch(dec!(1)).fingerprint(AnomalyScope::Targeted));
    }

    #[test]
    fn test_record_deduplicates_on_stable_fields() {
        let (recorder, store) = recorder();

        let first = recorder
            .record(mismatch(dec!(100)), AnomalyScope::Realtime, AuditStatus::Pending)
            .unwrap();
        // different amounts, same stable attributes
        let second = recorder
            .record(mismatch(dec!(120)), AnomalyScope::Realtime, AuditStatus::Pending)
            .unwrap();

        assert!(first.created().is_some());
        assert!(second.is_duplicate());
        assert_eq!(store.audit_log_count(), 1);
    }

    #[test]
    fn test_record_cached_skips_store_on_hit() {
        let (recorder, store) = recorder();

        recorder.record_cached(mismatch(dec!(100)), AnomalyScope::Realtime).unwrap();
        store.inject_failure(ledgerwatch_store::Fault::AuditLogWrite);
        // a cache hit never reaches the (failing) store
        let again = recorder.record_cached(mismatch(dec!(100)), AnomalyScope::Realtime).unwrap();

        assert!(again.is_duplicate());
        assert_eq!(store.recent_audit_logs(10).unwrap().len(), 1);
    }

    #[test]
    fn test_scopes_do_not_share_fingerprints() {
        let (recorder, store) = recorder();

        recorder
            .record(mismatch(dec!(100)), AnomalyScope::Realtime, AuditStatus::Pending)
            .unwrap();
        let targeted = recorder
            .record(mismatch(dec!(100)), AnomalyScope::Targeted, AuditStatus::Pending)
            .unwrap();

        assert!(targeted.created().is_some());
        assert_eq!(store.audit_log_count(), 2);
    }
}
