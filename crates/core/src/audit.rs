//! Audit findings
//!
//! An [`AuditLog`] is written once per unique fingerprint and never deleted.
//! Lifecycle: `pending -> investigating | resolved`.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use strum_macros::{AsRefStr, Display, EnumString};

pub type AuditLogId = i64;

/// Which auditor produced a finding
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, EnumString, Display, AsRefStr,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum AuditType {
    Realtime,
    Periodic,
    /// Targeted (queued, per-entity) reconciliation
    Batch,
    Global,
}

/// Kind of entity a finding or job refers to
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, EnumString, Display, AsRefStr,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Wallet,
    Transaction,
    System,
}

/// Deduplication scope used in fingerprints
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, EnumString, Display, AsRefStr,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum AnomalyScope {
    Realtime,
    Targeted,
    Periodic,
    Global,
}

impl AnomalyScope {
    /// The `audit_type` recorded on logs created in this scope
    pub fn audit_type(&self) -> AuditType {
        match self {
            AnomalyScope::Realtime => AuditType::Realtime,
            AnomalyScope::Targeted => AuditType::Batch,
            AnomalyScope::Periodic => AuditType::Periodic,
            AnomalyScope::Global => AuditType::Global,
        }
    }
}

/// Severity levels - ordered from lowest to highest
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, EnumString, Display, AsRefStr,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low = 1,
    Medium = 2,
    High = 3,
    Critical = 4,
}

impl PartialOrd for Severity {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Severity {
    fn cmp(&self, other: &Self) -> Ordering {
        (*self as u8).cmp(&(*other as u8))
    }
}

/// Review status of a finding
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, EnumString, Display, AsRefStr,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum AuditStatus {
    Pending,
    Investigating,
    /// Terminal
    Resolved,
}

/// Invariant codes produced by the built-in auditors
///
/// Stored as plain strings on [`AuditLog`] so manually entered findings may
/// use codes outside this list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumString, Display, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum Invariant {
    // wallet level
    BalanceLedgerMismatch,
    NegativeBalance,
    UnusualTransactionSize,
    HighFrequency,
    DataCorruption,
    // trends
    SharpBalanceDecline,
    HighBalanceVolatility,
    TransactionFrequencySpike,
    // system level
    AccountingEquationViolation,
    GlobalWalletReconciliation,
    WalletLedgerMismatch,
    InterSystemProfitMismatch,
    InterSystemWalletMismatch,
    InsufficientLiquidity,
    NegativeMerchantBalance,
    ConservationOfFundsViolation,
    RiskConcentration,
    DormantFunds,
}

/// A persisted audit finding
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditLog {
    pub id: AuditLogId,
    pub audit_type: AuditType,
    pub entity_type: EntityType,
    pub entity_id: i64,
    pub invariant_violated: String,
    pub expected_value: Decimal,
    pub actual_value: Decimal,
    pub difference: Decimal,
    pub severity: Severity,
    pub description: String,
    pub status: AuditStatus,
    /// Hash of the stable attributes, see the engine's fingerprinter
    pub fingerprint: String,
    pub metadata: Map<String, Value>,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

impl AuditLog {
    pub fn is_resolved(&self) -> bool {
        self.status == AuditStatus::Resolved
    }
}

/// Insert payload for an [`AuditLog`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewAuditLog {
    pub audit_type: AuditType,
    pub entity_type: EntityType,
    pub entity_id: i64,
    pub invariant_violated: String,
    pub expected_value: Decimal,
    pub actual_value: Decimal,
    pub difference: Decimal,
    pub severity: Severity,
    pub description: String,
    pub status: AuditStatus,
    pub fingerprint: String,
    pub metadata: Map<String, Value>,
}

impl NewAuditLog {
    pub fn into_log(self, id: AuditLogId, created_at: DateTime<Utc>) -> AuditLog {
        AuditLog {
            id,
            audit_type: self.audit_type,
            entity_type: self.entity_type,
            entity_id: self.entity_id,
            invariant_violated: self.invariant_violated,
            expected_value: self.expected_value,
            actual_value: self.actual_value,
            difference: self.difference,
            severity: self.severity,
            description: self.description,
            status: self.status,
            fingerprint: self.fingerprint,
            metadata: self.metadata,
            created_at,
            processed_at: None,
        }
    }
}

/// Dashboard aggregate over audit logs and the job queue
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditStats {
    pub total: u64,
    pub by_status: BTreeMap<String, u64>,
    pub by_severity: BTreeMap<String, u64>,
    pub by_type: BTreeMap<String, u64>,
    /// Jobs still eligible to run
    pub queue_depth: u64,
    /// Jobs that exhausted `max_attempts`
    pub failed_jobs: u64,
}
